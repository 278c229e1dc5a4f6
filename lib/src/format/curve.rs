//! Keyframed attribute curves and their packed binary encodings.

use std::io::Cursor;

use anyhow::{bail, ensure, Result};
use glam::{Quat, Vec3, Vec4};
use strum::FromRepr;
use zerocopy::ByteOrder;

use crate::{
    format::DecodeError,
    util::read::{read_f32, read_i16, read_u16, read_u32, read_vec3},
};

/// Dequantisation factor for packed quaternion components.
pub const QUAT_NORM_FACTOR: f32 = 0.000_021_580_5;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum CurveType {
    Invalid = 0,
    Uncompressed = 1,
    OneValue = 2,
    Unknown3 = 3,
    CompressedPos = 4,
    CompressedQuat = 5,
    Unknown6 = 6,
    Empty = 7,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CurvePoint {
    pub time: f32,
    /// Quaternions are stored x, y, z, w.
    pub value: Vec4,
}

/// Time-ordered keyframes for one attribute of one attach point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeCurve {
    pub points: Vec<CurvePoint>,
}

impl AttributeCurve {
    pub fn new(points: Vec<CurvePoint>) -> Self { Self { points } }

    pub fn constant(value: Vec4) -> Self { Self { points: vec![CurvePoint { time: 0.0, value }] } }

    pub fn len(&self) -> usize { self.points.len() }

    pub fn is_empty(&self) -> bool { self.points.is_empty() }

    /// Time of the last keyframe.
    pub fn duration(&self) -> f32 { self.points.last().map_or(0.0, |p| p.time) }

    fn resolve<T, C, L>(&self, time: f32, empty: T, convert: C, lerp: L) -> T
    where
        C: Fn(Vec4) -> T,
        L: Fn(T, T, f32) -> T,
    {
        let (first, last) = match self.points.as_slice() {
            [] => return empty,
            [only] => return convert(only.value),
            [first, .., last] => (first, last),
        };
        let Some(idx) = self.points.iter().position(|p| p.time >= time) else {
            return convert(last.value);
        };
        if idx == 0 {
            return convert(first.value);
        }
        let (a, b) = (&self.points[idx - 1], &self.points[idx]);
        if b.time <= time {
            return convert(b.value);
        }
        let span = b.time - a.time;
        let t = if span > 0.0 { (time - a.time) / span } else { 1.0 };
        lerp(convert(a.value), convert(b.value), t)
    }

    /// Spherical interpolation. An empty curve yields the identity.
    pub fn resolve_quat(&self, time: f32) -> Quat {
        self.resolve(time, Quat::IDENTITY, Quat::from_vec4, |a, b, t| a.slerp(b, t))
    }

    /// Linear interpolation. An empty curve yields zero.
    pub fn resolve_vec3(&self, time: f32) -> Vec3 {
        self.resolve(time, Vec3::ZERO, Vec4::truncate, |a, b, t| a.lerp(b, t))
    }

    pub fn resolve_vec4(&self, time: f32) -> Vec4 {
        self.resolve(time, Vec4::ZERO, |v| v, |a, b, t| a.lerp(b, t))
    }
}

/// Rebuilds a quaternion from three packed components. The low bits of
/// `px` and `py` select which component was dropped, the low bit of `pz`
/// its sign (only when `signed_w` is set).
pub fn decode_packed_quat(px: i16, py: i16, pz: i16, signed_w: bool) -> Quat {
    let permutation = (py & 1) | ((px & 1) << 1);
    let negative = signed_w && (pz & 1) != 0;
    let a = px as f32 * QUAT_NORM_FACTOR;
    let b = py as f32 * QUAT_NORM_FACTOR;
    let c = pz as f32 * QUAT_NORM_FACTOR;
    let rest = 1.0 - a * a - b * b - c * c;
    let mut r = if rest > 0.0 { rest.sqrt() } else { 0.0 };
    if negative {
        r = -r;
    }
    // Slot order is w, x, y, z
    let [w, x, y, z] = match permutation {
        0 => [r, a, b, c],
        1 => [a, r, b, c],
        2 => [a, b, r, c],
        _ => [a, b, c, r],
    };
    Quat::from_xyzw(x, y, z, w).normalize()
}

fn read_values<O, R>(reader: &mut R, count: usize) -> Result<Vec4>
where
    O: ByteOrder,
    R: std::io::Read,
{
    let mut value = [0f32; 4];
    for v in value.iter_mut().take(count) {
        *v = read_f32::<O, _>(reader)?;
    }
    Ok(Vec4::from_array(value))
}

/// Decodes a curve starting at the beginning of `data`.
pub fn read_curve<O>(data: &[u8], attrib_size: u32) -> Result<AttributeCurve>
where O: ByteOrder {
    let mut reader = Cursor::new(data);
    let header = read_u32::<O, _>(&mut reader)?;
    let num_points = (header & 0xFFFF) as usize;
    let raw_type = ((header >> 16) & 0xF) as u8;
    let point_size = (header >> 24) & 0xF;
    let kind = CurveType::from_repr(raw_type).ok_or(DecodeError::CurveType(raw_type))?;

    let mut points = Vec::with_capacity(num_points.min(data.len()));
    match kind {
        CurveType::Invalid | CurveType::Unknown3 | CurveType::Unknown6 => {
            bail!(DecodeError::CurveType(raw_type))
        }
        CurveType::Empty => {}
        CurveType::OneValue | CurveType::Uncompressed => {
            ensure!(point_size == attrib_size && point_size <= 4, DecodeError::CurvePointSize {
                expected: attrib_size,
                found: point_size
            });
            if kind == CurveType::OneValue {
                let value = read_values::<O, _>(&mut reader, point_size as usize)?;
                points.push(CurvePoint { time: 0.0, value });
            } else {
                for _ in 0..num_points {
                    let time = read_f32::<O, _>(&mut reader)?;
                    points.push(CurvePoint { time, value: Vec4::ZERO });
                }
                for point in &mut points {
                    point.value = read_values::<O, _>(&mut reader, point_size as usize)?;
                }
            }
        }
        CurveType::CompressedPos => {
            let time_scale = inverse_or_zero(read_f32::<O, _>(&mut reader)?);
            let scale = read_vec3::<O, _>(&mut reader)?;
            let offset = read_vec3::<O, _>(&mut reader)?;
            for _ in 0..num_points {
                let time = read_u16::<O, _>(&mut reader)? as f32 * time_scale;
                points.push(CurvePoint { time, value: Vec4::ZERO });
            }
            for point in &mut points {
                let raw = Vec3::new(
                    read_u16::<O, _>(&mut reader)? as f32,
                    read_u16::<O, _>(&mut reader)? as f32,
                    read_u16::<O, _>(&mut reader)? as f32,
                );
                point.value = (raw * scale + offset).extend(0.0);
            }
        }
        CurveType::CompressedQuat => {
            let time_scale = inverse_or_zero(read_f32::<O, _>(&mut reader)?);
            for _ in 0..num_points {
                let time = read_u16::<O, _>(&mut reader)? as f32 * time_scale;
                points.push(CurvePoint { time, value: Vec4::ZERO });
            }
            for point in &mut points {
                let px = read_i16::<O, _>(&mut reader)?;
                let py = read_i16::<O, _>(&mut reader)?;
                let pz = read_i16::<O, _>(&mut reader)?;
                point.value = Vec4::from(decode_packed_quat(px, py, pz, true));
            }
        }
    }
    Ok(AttributeCurve { points })
}

#[inline]
fn inverse_or_zero(v: f32) -> f32 { if v != 0.0 { 1.0 / v } else { 0.0 } }

fn put_u32<O: ByteOrder>(out: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    O::write_u32(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn put_f32<O: ByteOrder>(out: &mut Vec<u8>, v: f32) {
    let mut buf = [0u8; 4];
    O::write_f32(&mut buf, v);
    out.extend_from_slice(&buf);
}

/// Encodes a curve as Empty, OneValue or Uncompressed depending on its
/// number of keyframes.
pub fn write_curve<O>(out: &mut Vec<u8>, curve: &AttributeCurve, attrib_size: u32) -> Result<()>
where O: ByteOrder {
    ensure!(attrib_size <= 4, "Invalid curve attribute size {}", attrib_size);
    let num_points = curve.points.len();
    ensure!(num_points <= 0xFFFF, "Curve has too many points ({})", num_points);
    let kind = match num_points {
        0 => CurveType::Empty,
        1 => CurveType::OneValue,
        _ => CurveType::Uncompressed,
    };
    put_u32::<O>(out, (attrib_size << 24) | ((kind as u32) << 16) | num_points as u32);
    let components = |out: &mut Vec<u8>, value: Vec4| {
        for v in value.to_array().into_iter().take(attrib_size as usize) {
            put_f32::<O>(out, v);
        }
    };
    match kind {
        CurveType::OneValue => components(out, curve.points[0].value),
        CurveType::Uncompressed => {
            for point in &curve.points {
                put_f32::<O>(out, point.time);
            }
            for point in &curve.points {
                components(out, point.value);
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use zerocopy::{BigEndian, LittleEndian};

    use super::*;

    fn pt(time: f32, x: f32) -> CurvePoint { CurvePoint { time, value: Vec4::new(x, 0.0, 0.0, 0.0) } }

    #[test]
    fn resolve_clamps_and_hits_exactly() {
        let curve = AttributeCurve::new(vec![pt(0.5, 1.0), pt(1.0, 3.0), pt(2.0, 5.0)]);
        assert_eq!(curve.resolve_vec3(0.0).x, 1.0);
        assert_eq!(curve.resolve_vec3(0.5).x, 1.0);
        assert_eq!(curve.resolve_vec3(1.0).x, 3.0);
        assert_eq!(curve.resolve_vec3(2.0).x, 5.0);
        assert_eq!(curve.resolve_vec3(10.0).x, 5.0);
        assert!((curve.resolve_vec3(1.5).x - 4.0).abs() < 1e-6);
        assert!((curve.resolve_vec3(0.75).x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn resolve_degenerate_curves() {
        let empty = AttributeCurve::default();
        assert_eq!(empty.resolve_quat(1.0), Quat::IDENTITY);
        assert_eq!(empty.resolve_vec3(1.0), Vec3::ZERO);
        let single = AttributeCurve::constant(Vec4::new(1.0, 2.0, 3.0, 0.0));
        assert_eq!(single.resolve_vec3(100.0), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn resolve_quat_slerps() {
        let curve = AttributeCurve::new(vec![
            CurvePoint { time: 0.0, value: Vec4::from(Quat::IDENTITY) },
            CurvePoint { time: 1.0, value: Vec4::from(Quat::from_rotation_z(FRAC_PI_2)) },
        ]);
        let mid = curve.resolve_quat(0.5);
        assert!(mid.abs_diff_eq(Quat::from_rotation_z(FRAC_PI_2 / 2.0), 1e-5));
        assert_eq!(curve.resolve_quat(1.0), Quat::from_rotation_z(FRAC_PI_2));
    }

    #[test]
    fn packed_quat_vectors() {
        assert!(decode_packed_quat(0, 0, 0, true).abs_diff_eq(Quat::IDENTITY, 1e-6));
        // Dropped component selected by (px & 1, py & 1)
        assert!(decode_packed_quat(0, 1, 0, true).abs_diff_eq(Quat::from_xyzw(1.0, 0.0, 0.0, 0.0), 1e-4));
        assert!(decode_packed_quat(1, 0, 0, true).abs_diff_eq(Quat::from_xyzw(0.0, 1.0, 0.0, 0.0), 1e-4));
        assert!(decode_packed_quat(1, 1, 0, true).abs_diff_eq(Quat::from_xyzw(0.0, 0.0, 1.0, 0.0), 1e-4));
        // Sign bit only applies to the signed variant
        assert!(decode_packed_quat(0, 0, 1, true).w < 0.0);
        assert!(decode_packed_quat(0, 0, 1, false).w > 0.0);
    }

    #[test]
    fn compressed_pos_dequantises() {
        let mut data = Vec::new();
        data.extend_from_slice(&((3u32 << 24) | (4 << 16) | 2).to_le_bytes());
        data.extend_from_slice(&30.0f32.to_le_bytes());
        for v in [0.5f32, 0.5, 0.5, 1.0, 0.0, 0.0] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0u16, 30, 1, 2, 3, 4, 5, 6] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let curve = read_curve::<LittleEndian>(&data, 3).unwrap();
        assert_eq!(curve.points.len(), 2);
        assert_eq!(curve.points[1].time, 1.0);
        assert_eq!(curve.points[0].value, Vec4::new(1.5, 1.0, 1.5, 0.0));
        assert_eq!(curve.points[1].value, Vec4::new(3.0, 2.5, 3.0, 0.0));
    }

    #[test]
    fn compressed_quat_decodes_identity() {
        let mut data = Vec::new();
        data.extend_from_slice(&((4u32 << 24) | (5 << 16) | 1).to_be_bytes());
        data.extend_from_slice(&30.0f32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 6]);
        let curve = read_curve::<BigEndian>(&data, 4).unwrap();
        assert!(Quat::from_vec4(curve.points[0].value).abs_diff_eq(Quat::IDENTITY, 1e-6));
    }

    #[test]
    fn unknown_curve_types_fail() {
        for raw in [0u32, 3, 6, 9] {
            let data = ((4u32 << 24) | (raw << 16) | 1).to_le_bytes();
            let err = read_curve::<LittleEndian>(&data, 4).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<DecodeError>(), Some(DecodeError::CurveType(t)) if *t as u32 == raw),
                "type {raw}"
            );
        }
    }

    #[test]
    fn written_curves_read_back_in_either_byte_order() {
        let curve = AttributeCurve::new(vec![pt(0.0, 1.0), pt(0.5, 2.0), pt(1.0, -1.0)]);
        for points in [0usize, 1, 3] {
            let curve = AttributeCurve::new(curve.points[..points].to_vec());
            let mut le = Vec::new();
            write_curve::<LittleEndian>(&mut le, &curve, 3).unwrap();
            assert_eq!(read_curve::<LittleEndian>(&le, 3).unwrap(), curve);
            let mut be = Vec::new();
            write_curve::<BigEndian>(&mut be, &curve, 3).unwrap();
            assert_eq!(read_curve::<BigEndian>(&be, 3).unwrap(), curve);
            if points > 0 {
                assert_ne!(le, be);
            }
        }
    }
}
