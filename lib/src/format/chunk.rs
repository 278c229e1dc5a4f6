use std::{
    io::{Seek, SeekFrom, Write},
    mem::size_of,
};

use anyhow::{ensure, Result};
use zerocopy::{AsBytes, ByteOrder, FromBytes, FromZeroes, LittleEndian, U32};

use crate::format::DecodeError;

/// `[u32 id][u32 size]` followed by `size` payload bytes.
#[derive(Clone, Debug, Default, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, packed)]
pub struct ChunkDescriptor<O: ByteOrder> {
    pub id: U32<O>,
    pub size: U32<O>,
}

impl<O: ByteOrder> ChunkDescriptor<O> {
    pub fn new(id: u32) -> Self { Self { id: U32::new(id), size: U32::new(0) } }

    pub fn slice(data: &[u8]) -> Result<(&Self, &[u8], &[u8])> {
        let header = Self::ref_from_prefix(data)
            .ok_or(DecodeError::ChunkHeader { remaining: data.len() })?;
        let start = size_of::<Self>();
        let size = header.size.get();
        let available = data.len() - start;
        ensure!((size as usize) <= available, DecodeError::ChunkBounds {
            id: header.id.get(),
            size,
            available
        });
        let end = start + size as usize;
        Ok((header, &data[start..end], &data[end..]))
    }

    pub fn write<W, CB>(&self, w: &mut W, mut cb: CB) -> Result<()>
    where
        W: Write + Seek,
        CB: FnMut(&mut W) -> Result<()>,
    {
        // Skip over the header
        let chunk_pos = w.stream_position()?;
        let data_pos = chunk_pos + size_of::<Self>() as u64;
        w.seek(SeekFrom::Start(data_pos))?;

        // Write the data and determine the size
        cb(w)?;
        let end_pos = w.stream_position()?;

        // Return to the start of the chunk and write the header
        w.seek(SeekFrom::Start(chunk_pos))?;
        let mut out = self.clone();
        out.size.set(u32::try_from(end_pos - data_pos)?);
        w.write_all(out.as_bytes())?;

        // Seek to the end
        w.seek(SeekFrom::Start(end_pos))?;
        Ok(())
    }
}

/// Writes a little-endian chunk whose payload is produced by `cb`.
pub fn write_chunk<W, CB>(w: &mut W, id: u32, cb: CB) -> Result<()>
where
    W: Write + Seek,
    CB: FnMut(&mut W) -> Result<()>,
{
    ChunkDescriptor::<LittleEndian>::new(id).write(w, cb)
}

/// Writes a chunk with a ready-made payload.
pub fn write_chunk_data<W>(w: &mut W, id: u32, data: &[u8]) -> Result<()>
where W: Write + Seek {
    write_chunk(w, id, |w| Ok(w.write_all(data)?))
}

/// Index of the top-level chunks in a buffer. Payloads borrow from the source.
#[derive(Clone, Debug, Default)]
pub struct ChunkReader<'a> {
    chunks: Vec<(u32, &'a [u8])>,
}

impl<'a> ChunkReader<'a> {
    /// Splits `data` into chunks. Any truncated chunk fails the whole parse.
    pub fn new(mut data: &'a [u8]) -> Result<Self> {
        let mut chunks = Vec::new();
        while !data.is_empty() {
            let (header, payload, remain) = ChunkDescriptor::<LittleEndian>::slice(data)?;
            chunks.push((header.id.get(), payload));
            data = remain;
        }
        Ok(Self { chunks })
    }

    /// Payload of the first chunk with `id`. A present zero-length chunk yields `Some(&[])`.
    pub fn get(&self, id: u32) -> Option<&'a [u8]> {
        self.chunks.iter().find(|(chunk_id, _)| *chunk_id == id).map(|(_, data)| *data)
    }

    pub fn require(&self, id: u32) -> Result<&'a [u8]> {
        Ok(self.get(id).ok_or(DecodeError::MissingChunk(id))?)
    }

    pub fn contains(&self, id: u32) -> bool { self.get(id).is_some() }

    pub fn get_by_idx(&self, idx: usize) -> Option<&'a [u8]> { self.chunks.get(idx).map(|(_, d)| *d) }

    pub fn id_by_idx(&self, idx: usize) -> Option<u32> { self.chunks.get(idx).map(|(id, _)| *id) }

    pub fn len(&self) -> usize { self.chunks.len() }

    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &'a [u8])> + '_ { self.chunks.iter().copied() }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn build() -> Vec<u8> {
        let mut w = Cursor::new(Vec::new());
        write_chunk_data(&mut w, 1, &[0xAA, 0xBB, 0xCC]).unwrap();
        write_chunk_data(&mut w, 7, &[]).unwrap();
        write_chunk(&mut w, 2, |w| {
            write_chunk_data(w, 0, b"nested")?;
            Ok(())
        })
        .unwrap();
        w.into_inner()
    }

    #[test]
    fn layout_is_id_size_payload() {
        let data = build();
        assert_eq!(&data[..11], &[1, 0, 0, 0, 3, 0, 0, 0, 0xAA, 0xBB, 0xCC]);
        assert_eq!(&data[11..19], &[7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(data.len(), 11 + 8 + 8 + 8 + 6);
    }

    #[test]
    fn lookup_by_id_and_index() {
        let data = build();
        let chunks = ChunkReader::new(&data).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.get(1), Some([0xAA, 0xBB, 0xCC].as_slice()));
        assert_eq!(chunks.id_by_idx(2), Some(2));
        let nested = ChunkReader::new(chunks.get(2).unwrap()).unwrap();
        assert_eq!(nested.get(0), Some(b"nested".as_slice()));
    }

    #[test]
    fn empty_chunk_is_not_absent() {
        let data = build();
        let chunks = ChunkReader::new(&data).unwrap();
        assert_eq!(chunks.get(7), Some([].as_slice()));
        assert_eq!(chunks.get(8), None);
        let err = chunks.require(8).unwrap_err();
        assert!(matches!(err.downcast_ref::<DecodeError>(), Some(DecodeError::MissingChunk(8))));
    }

    #[test]
    fn truncated_chunk_fails() {
        let mut data = build();
        data.truncate(data.len() - 1);
        let err = ChunkReader::new(&data).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::ChunkBounds { id: 2, size: 14, available: 13 })
        ));
        let err = ChunkReader::new(&[1, 0, 0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::ChunkHeader { remaining: 3 })
        ));
    }
}
