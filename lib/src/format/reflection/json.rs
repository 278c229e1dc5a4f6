use anyhow::{anyhow, bail, ensure, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{Map, Value};

use super::{ArrayPrefix, Mode, ReflectionFlags, ReflectionStream, UserData};
use crate::format::DecodeError;

const TAIL_BLOB: &str = "_tail_blob_";

struct WriteFrame {
    key: String,
    value: Value,
}

/// Builds a JSON document. Sections become objects keyed by section name,
/// arrays become JSON arrays, members are keyed by their announced name.
pub struct JsonReflectionWriter {
    stack: Vec<WriteFrame>,
    name: String,
    user_data: UserData,
}

impl Default for JsonReflectionWriter {
    fn default() -> Self { Self::new() }
}

impl JsonReflectionWriter {
    pub fn new() -> Self {
        Self {
            stack: vec![WriteFrame { key: String::new(), value: Value::Object(Map::new()) }],
            name: String::new(),
            user_data: UserData::default(),
        }
    }

    /// Returns the root object. Fails if a section or array is still open.
    pub fn finish(mut self) -> Result<Value> {
        ensure!(self.stack.len() == 1, "{} unclosed JSON containers", self.stack.len() - 1);
        Ok(self.stack.pop().map(|f| f.value).unwrap_or_default())
    }

    fn put(&mut self, value: Value) -> Result<()> {
        let top = self.stack.last_mut().ok_or_else(|| anyhow!("JSON writer has no container"))?;
        match &mut top.value {
            Value::Array(items) => items.push(value),
            Value::Object(map) => {
                map.insert(self.name.clone(), value);
            }
            _ => bail!("JSON writer container is not an object or array"),
        }
        Ok(())
    }

    fn push(&mut self, key: &str, value: Value) {
        self.stack.push(WriteFrame { key: key.to_owned(), value });
    }

    fn pop(&mut self, array: bool) -> Result<()> {
        ensure!(self.stack.len() > 1, "No open JSON container to close");
        let frame = self.stack.pop().ok_or_else(|| anyhow!("No open JSON container to close"))?;
        ensure!(frame.value.is_array() == array, "Mismatched JSON container close");
        self.name = frame.key;
        self.put(frame.value)
    }
}

macro_rules! json_put {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, v: &mut $ty) -> Result<()> { self.put(Value::from(*v)) }
    };
}

impl ReflectionStream for JsonReflectionWriter {
    fn mode(&self) -> Mode { Mode::Out }

    fn flags(&self) -> ReflectionFlags { ReflectionFlags::NONE }

    fn good(&self) -> bool { true }

    fn user_data(&self) -> UserData { self.user_data }

    fn set_user_data(&mut self, data: UserData) { self.user_data = data; }

    fn type_info(&mut self, name: &str, _alias: &str) -> Result<()> {
        name.clone_into(&mut self.name);
        Ok(())
    }

    fn open_section(&mut self, name: &str, _name_unknown: bool) -> Result<bool> {
        self.push(name, Value::Object(Map::new()));
        Ok(true)
    }

    fn close_section(&mut self) -> Result<()> { self.pop(false) }

    fn begin_array(&mut self, _count: &mut u32, _prefix: ArrayPrefix) -> Result<()> {
        let key = self.name.clone();
        self.push(&key, Value::Array(Vec::new()));
        Ok(())
    }

    fn end_array(&mut self) -> Result<()> { self.pop(true) }

    fn serialize_raw(&mut self, data: &mut [u8]) -> Result<()> {
        self.put(Value::String(STANDARD.encode(data)))
    }

    json_put!(serialize_u8, u8);
    json_put!(serialize_i8, i8);
    json_put!(serialize_u16, u16);
    json_put!(serialize_i16, i16);
    json_put!(serialize_u32, u32);
    json_put!(serialize_i32, i32);
    json_put!(serialize_u64, u64);
    json_put!(serialize_i64, i64);
    json_put!(serialize_f32, f32);
    json_put!(serialize_f64, f64);
    json_put!(serialize_bool, bool);

    fn serialize_string(&mut self, v: &mut String) -> Result<()> { self.put(Value::String(v.clone())) }

    fn serialize_floats(&mut self, v: &mut [f32]) -> Result<()> {
        self.put(Value::Array(v.iter().map(|&f| Value::from(f)).collect()))
    }

    fn serialize_ints(&mut self, v: &mut [i32]) -> Result<()> {
        self.put(Value::Array(v.iter().map(|&i| Value::from(i)).collect()))
    }

    fn serialize_str_array(&mut self, name: &str, v: &mut Vec<String>) -> Result<()> {
        name.clone_into(&mut self.name);
        self.put(Value::Array(v.iter().cloned().map(Value::String).collect()))
    }

    fn flush_section_tail(&mut self, tail: &mut Vec<u8>) -> Result<()> {
        if tail.is_empty() {
            return Ok(());
        }
        TAIL_BLOB.clone_into(&mut self.name);
        self.put(Value::String(STANDARD.encode(tail)))
    }
}

enum ReadFrame<'a> {
    Object { map: &'a Map<String, Value>, unknown: usize },
    Array { items: &'a [Value], next: usize },
}

/// Reads a JSON document produced by [`JsonReflectionWriter`]. Members are
/// looked up by name, so key order does not matter.
pub struct JsonReflectionReader<'a> {
    stack: Vec<ReadFrame<'a>>,
    name: String,
    user_data: UserData,
}

impl<'a> JsonReflectionReader<'a> {
    pub fn new(root: &'a Value) -> Result<Self> {
        let map = root
            .as_object()
            .ok_or(DecodeError::JsonType { name: "<root>".into(), expected: "an object" })?;
        Ok(Self {
            stack: vec![ReadFrame::Object { map, unknown: 0 }],
            name: String::new(),
            user_data: UserData::default(),
        })
    }

    fn next_value(&mut self) -> Result<&'a Value> {
        match self.stack.last_mut() {
            Some(ReadFrame::Array { items, next }) => {
                let items: &'a [Value] = *items;
                let value = items
                    .get(*next)
                    .ok_or_else(|| DecodeError::MissingField(format!("{}[{}]", self.name, next)))?;
                *next += 1;
                Ok(value)
            }
            Some(ReadFrame::Object { map, .. }) => {
                let map: &'a Map<String, Value> = *map;
                Ok(map.get(&self.name).ok_or_else(|| DecodeError::MissingField(self.name.clone()))?)
            }
            None => bail!("JSON reader has no open container"),
        }
    }

    fn type_error(&self, expected: &'static str) -> anyhow::Error {
        DecodeError::JsonType { name: self.name.clone(), expected }.into()
    }

    fn next_u64(&mut self) -> Result<u64> {
        let value = self.next_value()?;
        value.as_u64().ok_or_else(|| self.type_error("an unsigned integer"))
    }

    fn next_i64(&mut self) -> Result<i64> {
        let value = self.next_value()?;
        value.as_i64().ok_or_else(|| self.type_error("an integer"))
    }

    fn next_f64(&mut self) -> Result<f64> {
        let value = self.next_value()?;
        float_value(value).ok_or_else(|| self.type_error("a number"))
    }

    fn next_str(&mut self) -> Result<&'a str> {
        let value = self.next_value()?;
        value.as_str().ok_or_else(|| self.type_error("a string"))
    }

    fn next_array(&mut self) -> Result<&'a [Value]> {
        let value = self.next_value()?;
        value.as_array().map(Vec::as_slice).ok_or_else(|| self.type_error("an array"))
    }
}

// The writer stores non-finite floats as null.
fn float_value(value: &Value) -> Option<f64> {
    if value.is_null() {
        Some(f64::NAN)
    } else {
        value.as_f64()
    }
}

macro_rules! json_unsigned {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, v: &mut $ty) -> Result<()> {
            *v = <$ty>::try_from(self.next_u64()?)?;
            Ok(())
        }
    };
}

macro_rules! json_signed {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, v: &mut $ty) -> Result<()> {
            *v = <$ty>::try_from(self.next_i64()?)?;
            Ok(())
        }
    };
}

impl<'a> ReflectionStream for JsonReflectionReader<'a> {
    fn mode(&self) -> Mode { Mode::In }

    fn flags(&self) -> ReflectionFlags { ReflectionFlags::NONE }

    fn good(&self) -> bool {
        match self.stack.last() {
            Some(ReadFrame::Array { items, next }) => *next < items.len(),
            Some(ReadFrame::Object { .. }) => true,
            None => false,
        }
    }

    fn user_data(&self) -> UserData { self.user_data }

    fn set_user_data(&mut self, data: UserData) { self.user_data = data; }

    fn type_info(&mut self, name: &str, _alias: &str) -> Result<()> {
        name.clone_into(&mut self.name);
        Ok(())
    }

    fn open_section(&mut self, name: &str, name_unknown: bool) -> Result<bool> {
        let child = match self.stack.last_mut() {
            Some(ReadFrame::Array { items, next }) => {
                let items: &'a [Value] = *items;
                let child = items.get(*next);
                *next += 1;
                child
            }
            Some(ReadFrame::Object { map, unknown }) => {
                let map: &'a Map<String, Value> = *map;
                if name_unknown {
                    let child = map.values().filter(|v| v.is_object()).nth(*unknown);
                    *unknown += 1;
                    child
                } else {
                    map.get(name)
                }
            }
            None => bail!("JSON reader has no open container"),
        };
        let Some(map) = child.and_then(Value::as_object) else {
            return Ok(false);
        };
        self.stack.push(ReadFrame::Object { map, unknown: 0 });
        name.clone_into(&mut self.name);
        Ok(true)
    }

    fn close_section(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(ReadFrame::Object { .. }) if !self.stack.is_empty() => Ok(()),
            _ => bail!("Mismatched JSON section close"),
        }
    }

    fn begin_array(&mut self, count: &mut u32, _prefix: ArrayPrefix) -> Result<()> {
        let items = self.next_array()?;
        *count = u32::try_from(items.len())?;
        self.stack.push(ReadFrame::Array { items, next: 0 });
        Ok(())
    }

    fn end_array(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(ReadFrame::Array { .. }) => Ok(()),
            _ => bail!("Mismatched JSON array close"),
        }
    }

    fn serialize_raw(&mut self, data: &mut [u8]) -> Result<()> {
        let bytes = STANDARD.decode(self.next_str()?)?;
        ensure!(bytes.len() == data.len(), "Blob '{}' has {} bytes, expected {}", self.name, bytes.len(), data.len());
        data.copy_from_slice(&bytes);
        Ok(())
    }

    json_unsigned!(serialize_u8, u8);
    json_signed!(serialize_i8, i8);
    json_unsigned!(serialize_u16, u16);
    json_signed!(serialize_i16, i16);
    json_unsigned!(serialize_u32, u32);
    json_signed!(serialize_i32, i32);
    json_unsigned!(serialize_u64, u64);
    json_signed!(serialize_i64, i64);

    fn serialize_f32(&mut self, v: &mut f32) -> Result<()> {
        *v = self.next_f64()? as f32;
        Ok(())
    }

    fn serialize_f64(&mut self, v: &mut f64) -> Result<()> {
        *v = self.next_f64()?;
        Ok(())
    }

    fn serialize_bool(&mut self, v: &mut bool) -> Result<()> {
        let value = self.next_value()?;
        *v = value.as_bool().ok_or_else(|| self.type_error("a boolean"))?;
        Ok(())
    }

    fn serialize_string(&mut self, v: &mut String) -> Result<()> {
        self.next_str()?.clone_into(v);
        Ok(())
    }

    fn serialize_floats(&mut self, v: &mut [f32]) -> Result<()> {
        let items = self.next_array()?;
        ensure!(items.len() == v.len(), "'{}' has {} components, expected {}", self.name, items.len(), v.len());
        for (dst, item) in v.iter_mut().zip(items) {
            *dst = float_value(item).ok_or_else(|| self.type_error("a number array"))? as f32;
        }
        Ok(())
    }

    fn serialize_ints(&mut self, v: &mut [i32]) -> Result<()> {
        let items = self.next_array()?;
        ensure!(items.len() == v.len(), "'{}' has {} components, expected {}", self.name, items.len(), v.len());
        for (dst, item) in v.iter_mut().zip(items) {
            let value = item.as_i64().ok_or_else(|| self.type_error("an integer array"))?;
            *dst = i32::try_from(value)?;
        }
        Ok(())
    }

    fn serialize_str_array(&mut self, name: &str, v: &mut Vec<String>) -> Result<()> {
        name.clone_into(&mut self.name);
        let items = self.next_array()?;
        v.clear();
        for item in items {
            v.push(item.as_str().ok_or_else(|| self.type_error("a string array"))?.to_owned());
        }
        Ok(())
    }

    fn flush_section_tail(&mut self, tail: &mut Vec<u8>) -> Result<()> {
        tail.clear();
        if let Some(ReadFrame::Object { map, .. }) = self.stack.last() {
            if let Some(blob) = map.get(TAIL_BLOB) {
                let blob = blob.as_str().ok_or_else(|| anyhow!("'{}' is not a string", TAIL_BLOB))?;
                *tail = STANDARD.decode(blob)?;
            }
        }
        Ok(())
    }
}
