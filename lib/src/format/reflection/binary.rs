use anyhow::{anyhow, ensure, Result};

use super::{ArrayPrefix, Mode, ReflectionFlags, ReflectionStream, UserData};
use crate::{
    format::{bin_archive::StringsTable, DecodeError},
    util::crc32::crc32,
};

#[derive(Copy, Clone, Debug)]
struct SectionFrame {
    end: usize,
    framed: bool,
}

/// Reads reflected data from a byte slice.
///
/// Sections are framed as `[u32 crc32(name)][u32 size]`. With debug info
/// the payload starts with the section name, and every member is preceded
/// by its name and type alias.
pub struct BinaryReflectionReader<'a> {
    data: &'a [u8],
    pos: usize,
    sections: Vec<SectionFrame>,
    flags: ReflectionFlags,
    strings: Option<&'a StringsTable>,
    user_data: UserData,
}

impl<'a> BinaryReflectionReader<'a> {
    pub fn new(data: &'a [u8], flags: ReflectionFlags) -> Self {
        Self { data, pos: 0, sections: Vec::new(), flags, strings: None, user_data: UserData::default() }
    }

    pub fn with_strings(mut self, strings: Option<&'a StringsTable>) -> Self {
        self.strings = strings;
        self
    }

    #[inline]
    pub fn position(&self) -> usize { self.pos }

    #[inline]
    fn end(&self) -> usize { self.sections.last().map_or(self.data.len(), |s| s.end) }

    #[inline]
    pub fn remaining(&self) -> usize { self.end() - self.pos }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(n <= self.remaining(), DecodeError::UnexpectedEof {
            offset: self.pos,
            needed: n,
            available: self.remaining()
        });
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_stringz(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..self.end()];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..len]).into_owned();
        // The terminator may be missing at the very end of a section.
        self.pos += (len + 1).min(rest.len());
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String> {
        match self.strings {
            Some(table) if self.flags.contains(ReflectionFlags::STRINGS_TABLE) => {
                let idx = self.read_u32()?;
                Ok(table.get(idx)?.to_owned())
            }
            _ => self.read_stringz(),
        }
    }
}

impl ReflectionStream for BinaryReflectionReader<'_> {
    fn mode(&self) -> Mode { Mode::In }

    fn flags(&self) -> ReflectionFlags { self.flags }

    fn good(&self) -> bool { self.pos < self.end() }

    fn user_data(&self) -> UserData { self.user_data }

    fn set_user_data(&mut self, data: UserData) { self.user_data = data; }

    fn type_info(&mut self, name: &str, alias: &str) -> Result<()> {
        if !self.flags.contains(ReflectionFlags::HAS_DEBUG_INFO) {
            return Ok(());
        }
        let found_name = self.read_string()?;
        let found_type = self.read_string()?;
        ensure!(found_name == name && found_type == alias, DecodeError::TypeInfoMismatch {
            expected_name: name.to_owned(),
            expected_type: alias.to_owned(),
            found_name,
            found_type,
        });
        Ok(())
    }

    fn open_section(&mut self, name: &str, name_unknown: bool) -> Result<bool> {
        if self.flags.contains(ReflectionFlags::NO_SECTIONS) {
            let end = self.end();
            self.sections.push(SectionFrame { end, framed: false });
            return Ok(true);
        }
        let crc = self.read_u32()?;
        let size = self.read_u32()? as usize;
        ensure!(size <= self.remaining(), DecodeError::UnexpectedEof {
            offset: self.pos,
            needed: size,
            available: self.remaining()
        });
        ensure!(name_unknown || crc == crc32(name.as_bytes()), DecodeError::SectionMismatch {
            expected: name.to_owned(),
            found: crc
        });
        self.sections.push(SectionFrame { end: self.pos + size, framed: true });
        if self.flags.contains(ReflectionFlags::HAS_DEBUG_INFO) {
            let found = self.read_string()?;
            ensure!(name_unknown || found == name, DecodeError::SectionMismatch {
                expected: name.to_owned(),
                found: crc
            });
        }
        Ok(true)
    }

    fn close_section(&mut self) -> Result<()> {
        let frame = self.sections.pop().ok_or_else(|| anyhow!("No open section to close"))?;
        if frame.framed {
            self.pos = frame.end;
        }
        Ok(())
    }

    fn begin_array(&mut self, count: &mut u32, prefix: ArrayPrefix) -> Result<()> {
        *count = match prefix {
            ArrayPrefix::U16 => {
                let mut n = 0u16;
                self.serialize_u16(&mut n)?;
                n as u32
            }
            ArrayPrefix::U32 => self.read_u32()?,
        };
        // Every element occupies at least one byte.
        ensure!((*count as usize) <= self.remaining(), DecodeError::UnexpectedEof {
            offset: self.pos,
            needed: *count as usize,
            available: self.remaining()
        });
        Ok(())
    }

    fn serialize_raw(&mut self, data: &mut [u8]) -> Result<()> {
        data.copy_from_slice(self.take(data.len())?);
        Ok(())
    }

    fn serialize_string(&mut self, v: &mut String) -> Result<()> {
        *v = self.read_string()?;
        Ok(())
    }

    fn flush_section_tail(&mut self, tail: &mut Vec<u8>) -> Result<()> {
        let n = self.remaining();
        *tail = self.take(n)?.to_vec();
        Ok(())
    }
}

/// Appends reflected data to a byte buffer, backpatching section sizes on close.
pub struct BinaryReflectionWriter<'a> {
    out: &'a mut Vec<u8>,
    sections: Vec<Option<usize>>,
    flags: ReflectionFlags,
    strings: Option<&'a mut StringsTable>,
    user_data: UserData,
}

impl<'a> BinaryReflectionWriter<'a> {
    pub fn new(out: &'a mut Vec<u8>, flags: ReflectionFlags) -> Self {
        Self { out, sections: Vec::new(), flags, strings: None, user_data: UserData::default() }
    }

    pub fn with_strings(mut self, strings: Option<&'a mut StringsTable>) -> Self {
        self.strings = strings;
        self
    }

    fn write_string(&mut self, value: &str) {
        if self.flags.contains(ReflectionFlags::STRINGS_TABLE) {
            if let Some(table) = self.strings.as_deref_mut() {
                let idx = table.add(value);
                self.out.extend_from_slice(&idx.to_le_bytes());
                return;
            }
        }
        self.out.extend_from_slice(value.as_bytes());
        self.out.push(0);
    }
}

impl ReflectionStream for BinaryReflectionWriter<'_> {
    fn mode(&self) -> Mode { Mode::Out }

    fn flags(&self) -> ReflectionFlags { self.flags }

    fn good(&self) -> bool { true }

    fn user_data(&self) -> UserData { self.user_data }

    fn set_user_data(&mut self, data: UserData) { self.user_data = data; }

    fn type_info(&mut self, name: &str, alias: &str) -> Result<()> {
        if self.flags.contains(ReflectionFlags::HAS_DEBUG_INFO) {
            self.write_string(name);
            self.write_string(alias);
        }
        Ok(())
    }

    fn open_section(&mut self, name: &str, _name_unknown: bool) -> Result<bool> {
        if self.flags.contains(ReflectionFlags::NO_SECTIONS) {
            self.sections.push(None);
            return Ok(true);
        }
        self.out.extend_from_slice(&crc32(name.as_bytes()).to_le_bytes());
        self.sections.push(Some(self.out.len()));
        self.out.extend_from_slice(&[0u8; 4]);
        if self.flags.contains(ReflectionFlags::HAS_DEBUG_INFO) {
            self.write_string(name);
        }
        Ok(true)
    }

    fn close_section(&mut self) -> Result<()> {
        let frame = self.sections.pop().ok_or_else(|| anyhow!("No open section to close"))?;
        if let Some(size_pos) = frame {
            let size = u32::try_from(self.out.len() - size_pos - 4)?;
            self.out[size_pos..size_pos + 4].copy_from_slice(&size.to_le_bytes());
        }
        Ok(())
    }

    fn serialize_raw(&mut self, data: &mut [u8]) -> Result<()> {
        self.out.extend_from_slice(data);
        Ok(())
    }

    fn serialize_string(&mut self, v: &mut String) -> Result<()> {
        self.write_string(v);
        Ok(())
    }

    fn flush_section_tail(&mut self, tail: &mut Vec<u8>) -> Result<()> {
        self.out.extend_from_slice(tail);
        Ok(())
    }
}
