//! Named, typed, optionally sectioned serialization shared by every
//! reflectable engine structure.
//!
//! A structure describes itself once through [`Reflect::reflect`]; the same
//! description reads or writes depending on the stream's [`Mode`], and works
//! against either the binary backend or the JSON backend.

pub mod binary;
pub mod json;

use std::ops::{BitOr, BitOrAssign};

use anyhow::{anyhow, Result};
use glam::{IVec4, Quat, Vec2, Vec3, Vec4};

pub use self::{
    binary::{BinaryReflectionReader, BinaryReflectionWriter},
    json::{JsonReflectionReader, JsonReflectionWriter},
};
use crate::format::DecodeError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    In,
    Out,
}

/// Archive flags byte.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ReflectionFlags(pub u8);

impl ReflectionFlags {
    pub const NONE: Self = Self(0);
    /// Member and section names are embedded and verified.
    pub const HAS_DEBUG_INFO: Self = Self(0x01);
    pub const EDITOR: Self = Self(0x02);
    /// Strings are u32 indices into a trailing strings table.
    pub const STRINGS_TABLE: Self = Self(0x04);
    pub const PLAIN: Self = Self(0x08);
    /// Section open/close are no-ops.
    pub const NO_SECTIONS: Self = Self(0x10);
    /// The first chunk carries an 8-byte prefix before the payload.
    pub const MULTIPART: Self = Self(0x20);

    pub const DEFAULT_OUT: Self = Self::STRINGS_TABLE;

    #[inline]
    pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    #[inline]
    pub fn bits(self) -> u8 { self.0 }
}

impl BitOr for ReflectionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

impl BitOrAssign for ReflectionFlags {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

/// Versions recorded by an outer structure and consulted by nested ones.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserData {
    pub format_version: u32,
    pub procedural_version: u32,
}

/// Width of an array's element count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArrayPrefix {
    U16,
    U32,
}

macro_rules! raw_primitive {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, v: &mut $ty) -> Result<()> {
            let mut bytes = v.to_le_bytes();
            self.serialize_raw(&mut bytes)?;
            *v = <$ty>::from_le_bytes(bytes);
            Ok(())
        }
    };
}

/// A bidirectional serialization stream. Every `serialize_*` call reads
/// into the value in [`Mode::In`] and emits it in [`Mode::Out`].
///
/// Primitive encodings default to little-endian raw bytes; text backends
/// override them.
pub trait ReflectionStream {
    fn mode(&self) -> Mode;

    fn is_in(&self) -> bool { self.mode() == Mode::In }

    fn is_out(&self) -> bool { self.mode() == Mode::Out }

    fn flags(&self) -> ReflectionFlags;

    /// Whether unread payload remains in the current section.
    fn good(&self) -> bool;

    fn user_data(&self) -> UserData;

    fn set_user_data(&mut self, data: UserData);

    /// Announces the next member. Verified against the stream when it carries debug info.
    fn type_info(&mut self, name: &str, alias: &str) -> Result<()>;

    /// Returns `false` when the section is absent from a text source.
    fn open_section(&mut self, name: &str, name_unknown: bool) -> Result<bool>;

    fn close_section(&mut self) -> Result<()>;

    fn begin_array(&mut self, count: &mut u32, prefix: ArrayPrefix) -> Result<()> {
        match prefix {
            ArrayPrefix::U16 => {
                let mut n = u16::try_from(*count)
                    .map_err(|_| anyhow!("Array of {} elements exceeds u16 count", count))?;
                self.serialize_u16(&mut n)?;
                *count = n as u32;
            }
            ArrayPrefix::U32 => self.serialize_u32(count)?,
        }
        Ok(())
    }

    fn end_array(&mut self) -> Result<()> { Ok(()) }

    fn serialize_raw(&mut self, data: &mut [u8]) -> Result<()>;

    raw_primitive!(serialize_u8, u8);
    raw_primitive!(serialize_i8, i8);
    raw_primitive!(serialize_u16, u16);
    raw_primitive!(serialize_i16, i16);
    raw_primitive!(serialize_u32, u32);
    raw_primitive!(serialize_i32, i32);
    raw_primitive!(serialize_u64, u64);
    raw_primitive!(serialize_i64, i64);
    raw_primitive!(serialize_f32, f32);
    raw_primitive!(serialize_f64, f64);

    fn serialize_bool(&mut self, v: &mut bool) -> Result<()> {
        let mut b = *v as u8;
        self.serialize_u8(&mut b)?;
        *v = b != 0;
        Ok(())
    }

    fn serialize_string(&mut self, v: &mut String) -> Result<()>;

    fn serialize_floats(&mut self, v: &mut [f32]) -> Result<()> {
        for f in v {
            self.serialize_f32(f)?;
        }
        Ok(())
    }

    fn serialize_ints(&mut self, v: &mut [i32]) -> Result<()> {
        for i in v {
            self.serialize_i32(i)?;
        }
        Ok(())
    }

    /// `str_array32`: a u32 count followed by that many strings, all under one member name.
    fn serialize_str_array(&mut self, name: &str, v: &mut Vec<String>) -> Result<()> {
        self.type_info(name, "str_array32")?;
        let mut count = u32::try_from(v.len())?;
        self.type_info(name, u32::ALIAS)?;
        self.serialize_u32(&mut count)?;
        if self.is_in() {
            v.clear();
            for _ in 0..count {
                let mut s = String::new();
                self.type_info(name, String::ALIAS)?;
                self.serialize_string(&mut s)?;
                v.push(s);
            }
        } else {
            for s in v.iter_mut() {
                self.type_info(name, String::ALIAS)?;
                self.serialize_string(s)?;
            }
        }
        Ok(())
    }

    /// Reads or writes whatever bytes remain in the current section verbatim.
    fn flush_section_tail(&mut self, tail: &mut Vec<u8>) -> Result<()>;
}

pub trait Reflect {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()>;
}

/// Engine type name recorded alongside a member in debug info.
pub trait TypeAlias {
    const ALIAS: &'static str;
}

macro_rules! reflect_primitive {
    ($ty:ty, $alias:literal, $method:ident) => {
        impl Reflect for $ty {
            fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> { s.$method(self) }
        }

        impl TypeAlias for $ty {
            const ALIAS: &'static str = $alias;
        }
    };
}

reflect_primitive!(bool, "bool", serialize_bool);
reflect_primitive!(u8, "u8", serialize_u8);
reflect_primitive!(i8, "s8", serialize_i8);
reflect_primitive!(u16, "u16", serialize_u16);
reflect_primitive!(i16, "s16", serialize_i16);
reflect_primitive!(u32, "u32", serialize_u32);
reflect_primitive!(i32, "s32", serialize_i32);
reflect_primitive!(u64, "u64", serialize_u64);
reflect_primitive!(i64, "s64", serialize_i64);
reflect_primitive!(f32, "fp32", serialize_f32);
reflect_primitive!(f64, "fp64", serialize_f64);
reflect_primitive!(String, "stringz", serialize_string);

macro_rules! reflect_float_vector {
    ($ty:ty, $alias:literal) => {
        impl Reflect for $ty {
            fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
                let mut a = self.to_array();
                s.serialize_floats(&mut a)?;
                *self = <$ty>::from_array(a);
                Ok(())
            }
        }

        impl TypeAlias for $ty {
            const ALIAS: &'static str = $alias;
        }
    };
}

reflect_float_vector!(Vec2, "vec2f");
reflect_float_vector!(Vec3, "vec3f");
reflect_float_vector!(Vec4, "vec4f");
// Stored x, y, z, w.
reflect_float_vector!(Quat, "vec4f");

impl Reflect for IVec4 {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        let mut a = self.to_array();
        s.serialize_ints(&mut a)?;
        *self = IVec4::from_array(a);
        Ok(())
    }
}

impl TypeAlias for IVec4 {
    const ALIAS: &'static str = "vec4i";
}

/// Eight packed booleans.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Bool8(pub u8);

impl Bool8 {
    #[inline]
    pub fn bit(self, idx: u8) -> bool { self.0 & (1 << idx) != 0 }
}

impl Reflect for Bool8 {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> { s.serialize_u8(&mut self.0) }
}

impl TypeAlias for Bool8 {
    const ALIAS: &'static str = "bool8";
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags32(pub u32);

impl Reflect for Flags32 {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> { s.serialize_u32(&mut self.0) }
}

impl TypeAlias for Flags32 {
    const ALIAS: &'static str = "flags32";
}

/// Announces and serializes a single named member.
pub fn member<T>(s: &mut dyn ReflectionStream, name: &str, value: &mut T) -> Result<()>
where T: Reflect + TypeAlias {
    s.type_info(name, T::ALIAS)?;
    value.reflect(s)
}

/// Runs `cb` inside a named section. The section is closed whether or not
/// `cb` succeeds; `None` means the source has no such section.
pub fn section<R, CB>(s: &mut dyn ReflectionStream, name: &str, cb: CB) -> Result<Option<R>>
where CB: FnOnce(&mut dyn ReflectionStream) -> Result<R> {
    section_ex(s, name, false, cb)
}

pub fn section_ex<R, CB>(
    s: &mut dyn ReflectionStream,
    name: &str,
    name_unknown: bool,
    cb: CB,
) -> Result<Option<R>>
where
    CB: FnOnce(&mut dyn ReflectionStream) -> Result<R>,
{
    if !s.open_section(name, name_unknown)? {
        return Ok(None);
    }
    let result = cb(&mut *s);
    let closed = s.close_section();
    let value = result?;
    closed?;
    Ok(Some(value))
}

/// A nested structure in its own section.
pub fn serialize_struct<T>(s: &mut dyn ReflectionStream, name: &str, value: &mut T) -> Result<bool>
where T: Reflect {
    Ok(section(s, name, |s| value.reflect(s))?.is_some())
}

/// A counted array of primitives, aliased `<element>_array`.
pub fn array<T>(
    s: &mut dyn ReflectionStream,
    name: &str,
    values: &mut Vec<T>,
    prefix: ArrayPrefix,
) -> Result<()>
where
    T: Reflect + TypeAlias + Default,
{
    s.type_info(name, &format!("{}_array", T::ALIAS))?;
    let mut count = u32::try_from(values.len())?;
    s.begin_array(&mut count, prefix)?;
    if s.is_in() {
        values.clear();
        values.resize_with(count as usize, T::default);
    }
    for value in values.iter_mut() {
        value.reflect(s)?;
    }
    s.end_array()
}

/// An array of structures: a section holding a `count` followed by one
/// section per element (`rec_0000`, `rec_0001`, ... on output).
pub fn struct_array<T>(s: &mut dyn ReflectionStream, name: &str, values: &mut Vec<T>) -> Result<()>
where T: Reflect + Default {
    struct_array_impl(s, name, values, false)
}

/// Like [`struct_array`], but stops early when the enclosing section runs
/// out of data. Meant for partially truncated legacy files.
#[cfg(test)]
pub(crate) fn struct_array_tolerant<T>(
    s: &mut dyn ReflectionStream,
    name: &str,
    values: &mut Vec<T>,
) -> Result<()>
where
    T: Reflect + Default,
{
    struct_array_impl(s, name, values, true)
}

fn struct_array_impl<T>(
    s: &mut dyn ReflectionStream,
    name: &str,
    values: &mut Vec<T>,
    tolerant: bool,
) -> Result<()>
where
    T: Reflect + Default,
{
    s.type_info(name, "array")?;
    section(s, name, |s| {
        let mut count = u32::try_from(values.len())?;
        member(s, "count", &mut count)?;
        if s.is_in() {
            values.clear();
            for idx in 0..count {
                if tolerant && !s.good() {
                    log::warn!("Array '{}' truncated at {} of {} elements", name, idx, count);
                    break;
                }
                let mut value = T::default();
                section_ex(s, "", true, |s| value.reflect(s))?
                    .ok_or_else(|| DecodeError::MissingField(format!("{name}[{idx}]")))?;
                values.push(value);
            }
        } else {
            for (idx, value) in values.iter_mut().enumerate() {
                section_ex(s, &format!("rec_{idx:04}"), true, |s| value.reflect(s))?;
            }
        }
        Ok(())
    })?;
    Ok(())
}

pub fn str_array(s: &mut dyn ReflectionStream, name: &str, values: &mut Vec<String>) -> Result<()> {
    s.serialize_str_array(name, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Item {
        id: u16,
        label: String,
    }

    impl Reflect for Item {
        fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
            member(s, "id", &mut self.id)?;
            member(s, "label", &mut self.label)
        }
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Record {
        flag: bool,
        pos: Vec3,
        items: Vec<Item>,
        tags: Vec<String>,
        mask: Vec<u8>,
        bits: Bool8,
    }

    impl Reflect for Record {
        fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
            member(s, "flag", &mut self.flag)?;
            member(s, "pos", &mut self.pos)?;
            struct_array(s, "items", &mut self.items)?;
            str_array(s, "tags", &mut self.tags)?;
            array(s, "mask", &mut self.mask, ArrayPrefix::U16)?;
            member(s, "bits", &mut self.bits)
        }
    }

    fn sample() -> Record {
        Record {
            flag: true,
            pos: Vec3::new(1.0, -2.5, 3.0),
            items: vec![Item { id: 7, label: "a".into() }, Item { id: 9, label: "bc".into() }],
            tags: vec!["x".into(), "yz".into()],
            mask: vec![1, 2, 3],
            bits: Bool8(0b101),
        }
    }

    fn write(flags: ReflectionFlags, value: &Record) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = BinaryReflectionWriter::new(&mut out, flags);
        let mut value = value.clone();
        serialize_struct(&mut w, "record", &mut value).unwrap();
        out
    }

    fn read(flags: ReflectionFlags, data: &[u8]) -> Result<Record> {
        let mut r = BinaryReflectionReader::new(data, flags);
        let mut value = Record::default();
        ensure_present(serialize_struct(&mut r, "record", &mut value)?)?;
        Ok(value)
    }

    fn ensure_present(found: bool) -> Result<()> {
        anyhow::ensure!(found, "section missing");
        Ok(())
    }

    #[test]
    fn binary_roundtrip_plain_and_debug() {
        for flags in [
            ReflectionFlags::NONE,
            ReflectionFlags::HAS_DEBUG_INFO,
            ReflectionFlags::NO_SECTIONS,
        ] {
            let data = write(flags, &sample());
            assert_eq!(read(flags, &data).unwrap(), sample(), "flags {:?}", flags);
        }
    }

    #[test]
    fn json_roundtrip() {
        let mut w = JsonReflectionWriter::new();
        let mut value = sample();
        serialize_struct(&mut w, "record", &mut value).unwrap();
        let json = w.finish().unwrap();
        assert_eq!(json["record"]["items"]["count"], 2);
        assert_eq!(json["record"]["items"]["rec_0001"]["label"], "bc");
        assert_eq!(json["record"]["mask"], serde_json::json!([1, 2, 3]));

        let mut r = JsonReflectionReader::new(&json).unwrap();
        let mut back = Record::default();
        assert!(serialize_struct(&mut r, "record", &mut back).unwrap());
        assert_eq!(back, sample());
    }

    #[test]
    fn debug_info_detects_wrong_member() {
        let data = write(ReflectionFlags::HAS_DEBUG_INFO, &sample());
        let mut r = BinaryReflectionReader::new(&data, ReflectionFlags::HAS_DEBUG_INFO);
        let err = section(&mut r, "record", |s| {
            let mut wrong = 0u32;
            member(s, "flag", &mut wrong)
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::TypeInfoMismatch { .. })
        ));
    }

    #[test]
    fn truncated_array_strict_vs_tolerant() {
        let mut out = Vec::new();
        {
            let mut w = BinaryReflectionWriter::new(&mut out, ReflectionFlags::NONE);
            let mut count = 3u32;
            section(&mut w, "items", |s| {
                member(s, "count", &mut count)?;
                // Only one element is actually present.
                let mut item = Item { id: 1, label: "only".into() };
                section_ex(s, "rec_0000", true, |s| item.reflect(s))?;
                Ok(())
            })
            .unwrap();
        }

        let mut strict = Vec::<Item>::new();
        let mut r = BinaryReflectionReader::new(&out, ReflectionFlags::NONE);
        assert!(struct_array(&mut r, "items", &mut strict).is_err());

        let mut tolerant = Vec::<Item>::new();
        let mut r = BinaryReflectionReader::new(&out, ReflectionFlags::NONE);
        struct_array_tolerant(&mut r, "items", &mut tolerant).unwrap();
        assert_eq!(tolerant, vec![Item { id: 1, label: "only".into() }]);
    }

    #[test]
    fn section_closes_on_error() {
        let data = write(ReflectionFlags::NONE, &sample());
        let mut r = BinaryReflectionReader::new(&data, ReflectionFlags::NONE);
        let result: Result<Option<()>> =
            section(&mut r, "record", |_| Err(anyhow!("callback failed")));
        assert!(result.is_err());
        assert!(!r.good());
    }
}
