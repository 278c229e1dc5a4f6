use std::{
    io,
    io::{BufRead, Read, Write},
};

use glam::Vec3;
use zerocopy::ByteOrder;

#[inline(always)]
pub fn read_u8<R>(reader: &mut R) -> io::Result<u8>
where R: Read + ?Sized {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

#[inline(always)]
pub fn read_u16<O, R>(reader: &mut R) -> io::Result<u16>
where
    O: ByteOrder,
    R: Read + ?Sized,
{
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(O::read_u16(&buf))
}

#[inline(always)]
pub fn read_i16<O, R>(reader: &mut R) -> io::Result<i16>
where
    O: ByteOrder,
    R: Read + ?Sized,
{
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(O::read_i16(&buf))
}

#[inline(always)]
pub fn read_u32<O, R>(reader: &mut R) -> io::Result<u32>
where
    O: ByteOrder,
    R: Read + ?Sized,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(O::read_u32(&buf))
}

#[inline(always)]
pub fn read_u64<O, R>(reader: &mut R) -> io::Result<u64>
where
    O: ByteOrder,
    R: Read + ?Sized,
{
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(O::read_u64(&buf))
}

#[inline(always)]
pub fn read_f32<O, R>(reader: &mut R) -> io::Result<f32>
where
    O: ByteOrder,
    R: Read + ?Sized,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(O::read_f32(&buf))
}

#[inline(always)]
pub fn read_vec3<O, R>(reader: &mut R) -> io::Result<Vec3>
where
    O: ByteOrder,
    R: Read + ?Sized,
{
    let mut buf = [0u8; 12];
    reader.read_exact(&mut buf)?;
    Ok(Vec3::new(O::read_f32(&buf[0..4]), O::read_f32(&buf[4..8]), O::read_f32(&buf[8..12])))
}

/// Reads a NUL-terminated string. A missing terminator at end of stream is tolerated.
pub fn read_stringz<R>(reader: &mut R) -> io::Result<String>
where R: BufRead + ?Sized {
    let mut buf = Vec::new();
    reader.read_until(0, &mut buf)?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn write_stringz<W>(writer: &mut W, value: &str) -> io::Result<()>
where W: Write + ?Sized {
    writer.write_all(value.as_bytes())?;
    writer.write_all(&[0])
}
