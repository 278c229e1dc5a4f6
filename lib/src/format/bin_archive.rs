//! Reflected-data container: an optional fixed header, a flags byte, and
//! then either raw reflected data or a chunked body with a strings table.

use std::{collections::HashMap, io::Cursor};

use anyhow::{anyhow, bail, ensure, Result};
use zerocopy::LittleEndian;

use crate::{
    format::{
        chunk::ChunkReader,
        reflection::{BinaryReflectionReader, BinaryReflectionWriter, ReflectionFlags},
        DecodeError,
    },
    util::read::{read_stringz, read_u32},
};

const CHUNK_DATA: u32 = 1;
const CHUNK_STRINGS: u32 = 2;
const MAX_AUTO_HEADER: usize = 0x10;

/// Interned strings referenced by index from reflected data.
///
/// Indices are assigned in first-use order, so the same write sequence
/// always produces the same table.
#[derive(Clone, Debug, Default)]
pub struct StringsTable {
    strings: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl StringsTable {
    /// Parses `[u32 count]` followed by `count` NUL-terminated strings.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let count = read_u32::<LittleEndian, _>(&mut reader)?;
        ensure!((count as usize) <= data.len(), "Strings table count {} exceeds data", count);
        let mut table = Self::default();
        for _ in 0..count {
            let s = read_stringz(&mut reader)?;
            let idx = table.strings.len() as u32;
            table.lookup.entry(s.clone()).or_insert(idx);
            table.strings.push(s);
        }
        Ok(table)
    }

    pub fn get(&self, idx: u32) -> Result<&str> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| DecodeError::StringIndex { index: idx, count: self.strings.len() }.into())
    }

    /// Returns the index of `value`, appending it if not yet present.
    pub fn add(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.lookup.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_owned());
        self.lookup.insert(value.to_owned(), idx);
        idx
    }

    pub fn len(&self) -> usize { self.strings.len() }

    pub fn is_empty(&self) -> bool { self.strings.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &str> { self.strings.iter().map(String::as_str) }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.strings.iter().map(|s| s.len() + 1).sum::<usize>());
        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        out
    }
}

/// How many bytes precede the flags byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderSize {
    Fixed(usize),
    /// Probes the first bytes for the data chunk id. Only for files whose
    /// header size is not known up front.
    AutoDetect,
}

impl Default for HeaderSize {
    fn default() -> Self { HeaderSize::Fixed(0) }
}

/// A parsed archive. Payload slices borrow from the input buffer.
pub struct BinArchive<'a> {
    data: &'a [u8],
    header_size: usize,
    flags: ReflectionFlags,
    chunks: ChunkReader<'a>,
    strings: Option<StringsTable>,
}

impl<'a> BinArchive<'a> {
    pub fn new(data: &'a [u8], header: HeaderSize) -> Result<Self> {
        let mut header_size = match header {
            HeaderSize::Fixed(size) => size,
            HeaderSize::AutoDetect => detect_header_size(data)?,
        };
        // Early level.bin files carry a 4 byte size field after the header.
        if let Some(word) = data.get(header_size..header_size + 4) {
            let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as usize;
            if data.len() >= 8 && word == data.len() - 8 {
                header_size += 4;
            }
        }
        let flags = ReflectionFlags(
            *data.get(header_size).ok_or_else(|| anyhow!("Archive too short for header of {} bytes", header_size))?,
        );

        let mut chunks = ChunkReader::default();
        let mut strings = None;
        if flags.contains(ReflectionFlags::STRINGS_TABLE) {
            chunks = ChunkReader::new(&data[header_size + 1..])?;
            if chunks.len() == 2 {
                let table_data = chunks.get_by_idx(1).unwrap_or_default();
                strings = Some(StringsTable::parse(table_data)?);
            }
        }
        log::debug!(
            "Archive: header {} bytes, flags {:#04X}, {} chunks, {} strings",
            header_size,
            flags.bits(),
            chunks.len(),
            strings.as_ref().map_or(0, StringsTable::len)
        );
        Ok(Self { data, header_size, flags, chunks, strings })
    }

    pub fn header_size(&self) -> usize { self.header_size }

    pub fn flags(&self) -> ReflectionFlags { self.flags }

    pub fn chunks(&self) -> &ChunkReader<'a> { &self.chunks }

    pub fn strings_table(&self) -> Option<&StringsTable> { self.strings.as_ref() }

    /// The reflected payload: the first chunk when the body is chunked,
    /// otherwise everything after the flags byte.
    pub fn payload(&self) -> Result<&'a [u8]> {
        match self.chunks.get_by_idx(0) {
            Some(chunk) if self.flags.contains(ReflectionFlags::MULTIPART) => {
                ensure!(chunk.len() >= 8, "Multipart chunk too small ({} bytes)", chunk.len());
                Ok(&chunk[8..])
            }
            Some(chunk) => Ok(chunk),
            None => Ok(&self.data[self.header_size + 1..]),
        }
    }

    pub fn reflection_reader(&self) -> Result<BinaryReflectionReader<'_>> {
        Ok(BinaryReflectionReader::new(self.payload()?, self.flags).with_strings(self.strings.as_ref()))
    }
}

fn detect_header_size(data: &[u8]) -> Result<usize> {
    for pos in 1..=MAX_AUTO_HEADER {
        let Some(word) = data.get(pos..pos + 4) else { break };
        if u32::from_le_bytes([word[0], word[1], word[2], word[3]]) == CHUNK_DATA {
            log::warn!("Auto-detected archive header size {}", pos - 1);
            return Ok(pos - 1);
        }
    }
    bail!("Unable to detect archive header size")
}

/// Builds an archive. The flags byte and (for strings-table archives) the
/// data chunk header are written on construction; [`BinArchiveWriter::finalize`]
/// backpatches the size and appends the strings table.
pub struct BinArchiveWriter {
    out: Vec<u8>,
    flags: ReflectionFlags,
    strings: StringsTable,
    size_pos: Option<usize>,
}

impl BinArchiveWriter {
    pub fn new(flags: ReflectionFlags) -> Self {
        let mut out = vec![flags.bits()];
        let mut size_pos = None;
        if flags.contains(ReflectionFlags::STRINGS_TABLE) {
            out.extend_from_slice(&CHUNK_DATA.to_le_bytes());
            size_pos = Some(out.len());
            out.extend_from_slice(&[0u8; 4]);
        }
        Self { out, flags, strings: StringsTable::default(), size_pos }
    }

    pub fn flags(&self) -> ReflectionFlags { self.flags }

    pub fn reflection_writer(&mut self) -> BinaryReflectionWriter<'_> {
        let strings = self.size_pos.map(|_| &mut self.strings);
        BinaryReflectionWriter::new(&mut self.out, self.flags).with_strings(strings)
    }

    /// Completes the archive. Consumes the writer, so it can only happen once.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        if let Some(size_pos) = self.size_pos {
            let size = u32::try_from(self.out.len() - size_pos - 4)?;
            self.out[size_pos..size_pos + 4].copy_from_slice(&size.to_le_bytes());
            let table = self.strings.to_bytes();
            self.out.extend_from_slice(&CHUNK_STRINGS.to_le_bytes());
            self.out.extend_from_slice(&u32::try_from(table.len())?.to_le_bytes());
            self.out.extend_from_slice(&table);
        }
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::reflection::{member, section};

    fn write_names(names: &[&str]) -> Vec<u8> {
        let mut archive = BinArchiveWriter::new(ReflectionFlags::DEFAULT_OUT);
        {
            let mut w = archive.reflection_writer();
            section(&mut w, "names", |s| {
                for name in names {
                    let mut name = (*name).to_owned();
                    member(s, "name", &mut name)?;
                }
                Ok(())
            })
            .unwrap();
        }
        archive.finalize().unwrap()
    }

    #[test]
    fn strings_table_layout() {
        let data = write_names(&["root", "child", "root"]);
        assert_eq!(data[0], 0x04);
        let archive = BinArchive::new(&data, HeaderSize::Fixed(0)).unwrap();
        assert_eq!(archive.chunks().len(), 2);
        assert_eq!(archive.chunks().id_by_idx(1), Some(2));
        let table = archive.strings_table().unwrap();
        assert_eq!(table.iter().collect::<Vec<_>>(), ["root", "child"]);
        assert_eq!(archive.chunks().get(2).unwrap(), b"\x02\0\0\0root\0child\0");
    }

    #[test]
    fn strings_table_is_deterministic() {
        assert_eq!(write_names(&["a", "b", "a", "c"]), write_names(&["a", "b", "a", "c"]));
    }

    #[test]
    fn names_read_back() {
        let data = write_names(&["root", "child", "root"]);
        let archive = BinArchive::new(&data, HeaderSize::Fixed(0)).unwrap();
        let mut r = archive.reflection_reader().unwrap();
        let mut names = Vec::new();
        section(&mut r, "names", |s| {
            while s.good() {
                let mut name = String::new();
                member(s, "name", &mut name)?;
                names.push(name);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(names, ["root", "child", "root"]);
    }

    #[test]
    fn fixed_header_and_detection() {
        let body = write_names(&["x"]);
        let mut data = vec![0xEEu8; 3];
        data.extend_from_slice(&body);
        let fixed = BinArchive::new(&data, HeaderSize::Fixed(3)).unwrap();
        assert_eq!(fixed.flags(), ReflectionFlags::STRINGS_TABLE);
        let detected = BinArchive::new(&data, HeaderSize::AutoDetect).unwrap();
        assert_eq!(detected.header_size(), 3);
        assert!(BinArchive::new(&[0u8; 8], HeaderSize::AutoDetect).is_err());
    }

    #[test]
    fn plain_archive_payload_follows_flags() {
        let archive_data = [0x00u8, 0xAA, 0xBB];
        let archive = BinArchive::new(&archive_data, HeaderSize::Fixed(0)).unwrap();
        assert!(archive.chunks().is_empty());
        assert_eq!(archive.payload().unwrap(), [0xAA, 0xBB]);
    }

    #[test]
    fn multipart_skips_prefix() {
        let mut data = vec![(ReflectionFlags::STRINGS_TABLE | ReflectionFlags::MULTIPART).bits()];
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&[0x11, 0x22]);
        let archive = BinArchive::new(&data, HeaderSize::Fixed(0)).unwrap();
        assert!(archive.strings_table().is_none());
        assert_eq!(archive.payload().unwrap(), [0x11, 0x22]);
    }

    #[test]
    fn bad_string_index() {
        let table = StringsTable::parse(b"\x01\0\0\0only\0").unwrap();
        assert_eq!(table.get(0).unwrap(), "only");
        let err = table.get(5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::StringIndex { index: 5, count: 1 })
        ));
    }
}
