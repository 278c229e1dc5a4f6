//! Skeletal animation clips (`.m2`).
//!
//! A motion is a chunked file: header (0), info (1) and a data chunk (9)
//! holding a data header, a table of curve offsets and the curves
//! themselves. Files older than Arktika.1 were cooked for a big-endian
//! target, but only part of their offsets table (and the curves those
//! entries point at) was actually byte-swapped; see
//! [`num_offsets_to_bswap`].

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use anyhow::{ensure, Context, Result};
use binrw::{binrw, BinReaderExt, BinWriterExt};
use glam::{Mat4, Quat, Vec3, Vec4};
use zerocopy::{AsBytes, BigEndian, ByteOrder, LittleEndian, U16, U32, U64};

use crate::{
    format::{
        chunk::{write_chunk, write_chunk_data, ChunkReader},
        curve::{decode_packed_quat, read_curve, write_curve, AttributeCurve, CurvePoint},
        skeleton::Skeleton,
        DecodeError, GameVersion,
    },
    util::read::{read_i16, read_u16, read_u32, read_u64, read_u8, read_vec3},
};

/// Also used by Last Light.
pub const MOTION_VERSION_REDUX: u32 = 14;
/// First little-endian version; bone masks grow to 256 bits.
pub const MOTION_VERSION_ARKTIKA1: u32 = 17;
pub const MOTION_FRAME_RATE: u32 = 30;

const CHUNK_HEADER: u32 = 0;
const CHUNK_INFO: u32 = 1;
const CHUNK_DATA: u32 = 9;
const CHUNK_2033_BONES_MOTION: u32 = 2;

// Metro 2033 per-bone flags
const LEGACY_OFFSETS_PRESENT: u8 = 0x01;
const LEGACY_ROTATIONS_PRESENT: u8 = 0x02;
const LEGACY_QUAT_COMPRESSION_EX: u8 = 0x20;

/// Number of leading offsets-table entries stored big-endian in files older
/// than [`MOTION_VERSION_ARKTIKA1`]. The curves those entries reference are
/// big-endian too; everything after them is little-endian.
pub fn num_offsets_to_bswap(num_animated_bones: usize, num_locators: usize, num_xforms: usize) -> usize {
    num_animated_bones * 2 + num_locators * 3 + if num_xforms != 0 { 2 } else { 0 }
}

/// Entries per attach point in the offsets table (rotation, position and,
/// except for Last Light, scale).
pub fn offsets_stride(game: GameVersion) -> usize {
    if game == GameVersion::OgLastLight {
        2
    } else {
        3
    }
}

fn mask_dwords(version: u32) -> usize {
    if version >= MOTION_VERSION_ARKTIKA1 {
        8
    } else {
        4
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BoneMask(pub [u32; 8]);

impl BoneMask {
    /// The first `dwords` words set.
    pub fn filled(dwords: usize) -> Self {
        let mut mask = Self::default();
        for dword in mask.0.iter_mut().take(dwords) {
            *dword = u32::MAX;
        }
        mask
    }

    pub fn is_present(&self, idx: usize) -> bool {
        self.0.get(idx >> 5).is_some_and(|dword| dword & (1 << (idx & 31)) != 0)
    }

    pub fn set(&mut self, idx: usize) {
        if let Some(dword) = self.0.get_mut(idx >> 5) {
            *dword |= 1 << (idx & 31);
        }
    }

    pub fn count_ones(&self) -> usize { self.0.iter().map(|d| d.count_ones() as usize).sum() }

    fn read<O, R>(reader: &mut R, dwords: usize) -> std::io::Result<Self>
    where
        O: ByteOrder,
        R: Read + ?Sized,
    {
        let mut mask = Self::default();
        for dword in mask.0.iter_mut().take(dwords) {
            *dword = read_u32::<O, _>(reader)?;
        }
        Ok(mask)
    }

    fn write<O: ByteOrder>(&self, out: &mut Vec<u8>, dwords: usize) {
        for dword in self.0.iter().take(dwords) {
            out.extend_from_slice(U32::<O>::new(*dword).as_bytes());
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionFlags(pub u16);

impl MotionFlags {
    pub const LOOPED: Self = Self(0x2);
    pub const EXP_IK_XZ_ROT: Self = Self(0x8);
    pub const ROOTMOVER: Self = Self(0x10);
    pub const ABSOLUTE_XFORM: Self = Self(0x20);
    pub const DELTA: Self = Self(0x40);
    pub const EXP_TWIST: Self = Self(0x80);
    pub const XFORM_MOTION: Self = Self(0x100);
    pub const EXP_ROOT_XZ_ROT: Self = Self(0x200);
    pub const DISABLE_IK: Self = Self(0x400);
    pub const SOUND: Self = Self(0x800);
    pub const FORCE_HQ: Self = Self(0x1000);
    pub const STREAMER_DISABLE: Self = Self(0x4000);
    pub const STREAMER_HQ: Self = Self(0x8000);

    const NAMES: [(Self, &'static str); 13] = [
        (Self::LOOPED, "looped"),
        (Self::EXP_IK_XZ_ROT, "exp_ik_xz_rot"),
        (Self::ROOTMOVER, "rootmover"),
        (Self::ABSOLUTE_XFORM, "absolute_xform"),
        (Self::DELTA, "delta"),
        (Self::EXP_TWIST, "exp_twist"),
        (Self::XFORM_MOTION, "xform_motion"),
        (Self::EXP_ROOT_XZ_ROT, "exp_root_xz_rot"),
        (Self::DISABLE_IK, "disable_ik"),
        (Self::SOUND, "sound"),
        (Self::FORCE_HQ, "force_hq"),
        (Self::STREAMER_DISABLE, "streamer_disable"),
        (Self::STREAMER_HQ, "streamer_hq"),
    ];

    pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES.into_iter().filter(move |(flag, _)| self.contains(*flag)).map(|(_, name)| name)
    }
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug)]
struct MotionHeader {
    version: u32,
    bones_crc: u32,
    num_bones: u16,
    num_locators: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MotionInfo {
    pub flags: MotionFlags,
    pub speed: f32,
    pub accrue: f32,
    pub falloff: f32,
    pub num_frames: u32,
    pub jump_frame: u16,
    pub land_frame: u16,
    pub affected_bones: BoneMask,
    pub data_size: u32,
    pub offsets_size: u32,
    pub hq_bones: BoneMask,
}

impl Default for MotionInfo {
    fn default() -> Self {
        Self {
            flags: MotionFlags::default(),
            speed: 1.0,
            accrue: 1.0,
            falloff: 1.0,
            num_frames: 0,
            jump_frame: 0,
            land_frame: 0,
            affected_bones: BoneMask::default(),
            data_size: 0,
            offsets_size: 0,
            hq_bones: BoneMask::default(),
        }
    }
}

impl MotionInfo {
    fn read<R: Read + Seek>(reader: &mut R, version: u32) -> Result<Self> {
        let dwords = mask_dwords(version);
        Ok(Self {
            flags: MotionFlags(reader.read_le()?),
            speed: reader.read_le()?,
            accrue: reader.read_le()?,
            falloff: reader.read_le()?,
            num_frames: reader.read_le()?,
            jump_frame: reader.read_le()?,
            land_frame: reader.read_le()?,
            affected_bones: BoneMask::read::<LittleEndian, _>(reader, dwords)?,
            data_size: reader.read_le()?,
            offsets_size: reader.read_le()?,
            hq_bones: BoneMask::read::<LittleEndian, _>(reader, dwords)?,
        })
    }

    fn write<W: Write + Seek>(&self, writer: &mut W, version: u32) -> Result<()> {
        let dwords = mask_dwords(version);
        writer.write_le(&self.flags.0)?;
        writer.write_le(&self.speed)?;
        writer.write_le(&self.accrue)?;
        writer.write_le(&self.falloff)?;
        writer.write_le(&self.num_frames)?;
        writer.write_le(&self.jump_frame)?;
        writer.write_le(&self.land_frame)?;
        for dword in self.affected_bones.0.iter().take(dwords) {
            writer.write_le(dword)?;
        }
        writer.write_le(&self.data_size)?;
        writer.write_le(&self.offsets_size)?;
        for dword in self.hq_bones.0.iter().take(dwords) {
            writer.write_le(dword)?;
        }
        Ok(())
    }
}

/// Leads the data chunk. Big-endian before [`MOTION_VERSION_ARKTIKA1`],
/// except for `unknown`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MotionDataHeader {
    /// Bones the payload encodes curves for
    pub bones_mask: BoneMask,
    pub num_locators: u16,
    pub num_xforms: u16,
    pub total_size: u32,
    pub unknown: u64,
}

impl MotionDataHeader {
    /// `unknown` is opaque and always kept in file order.
    fn read<O, R>(reader: &mut R, dwords: usize) -> std::io::Result<Self>
    where
        O: ByteOrder,
        R: Read + ?Sized,
    {
        Ok(Self {
            bones_mask: BoneMask::read::<O, _>(reader, dwords)?,
            num_locators: read_u16::<O, _>(reader)?,
            num_xforms: read_u16::<O, _>(reader)?,
            total_size: read_u32::<O, _>(reader)?,
            unknown: read_u64::<LittleEndian, _>(reader)?,
        })
    }

    fn write<O: ByteOrder>(&self, out: &mut Vec<u8>, dwords: usize) {
        self.bones_mask.write::<O>(out, dwords);
        out.extend_from_slice(U16::<O>::new(self.num_locators).as_bytes());
        out.extend_from_slice(U16::<O>::new(self.num_xforms).as_bytes());
        out.extend_from_slice(U32::<O>::new(self.total_size).as_bytes());
        out.extend_from_slice(U64::<LittleEndian>::new(self.unknown).as_bytes());
    }

    pub fn num_offsets_to_bswap(&self) -> usize {
        num_offsets_to_bswap(
            self.bones_mask.count_ones(),
            self.num_locators as usize,
            self.num_xforms as usize,
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Motion {
    pub version: u32,
    /// Must match the bones CRC of the skeleton the motion is played on
    pub bones_crc: u32,
    pub num_bones: u16,
    pub num_locators: u16,
    pub info: MotionInfo,
    pub data_header: MotionDataHeader,
    pub bone_rotations: Vec<AttributeCurve>,
    pub bone_positions: Vec<AttributeCurve>,
    /// Empty for Last Light motions
    pub bone_scales: Vec<AttributeCurve>,
    pub locator_rotations: Vec<AttributeCurve>,
    pub locator_positions: Vec<AttributeCurve>,
    pub locator_scales: Vec<AttributeCurve>,
}

#[inline]
fn frame_time(frame: u32) -> f32 { frame as f32 / MOTION_FRAME_RATE as f32 }

fn track(curves: &[AttributeCurve], idx: usize) -> &AttributeCurve {
    static EMPTY: AttributeCurve = AttributeCurve { points: Vec::new() };
    curves.get(idx).unwrap_or(&EMPTY)
}

impl Motion {
    /// Loads a full motion. Metro 2033 files use a separate layout.
    pub fn load(data: &[u8], game: GameVersion) -> Result<Self> {
        if game == GameVersion::Og2033 {
            return Self::load_2033(data);
        }
        let chunks = ChunkReader::new(data)?;
        let mut motion = Self::default();
        motion.read_header_chunks(&chunks)?;
        let payload = chunks.require(CHUNK_DATA)?;
        ensure!(
            payload.len() == motion.info.data_size as usize,
            "Motion data chunk is {} bytes, info declares {}",
            payload.len(),
            motion.info.data_size
        );
        motion.read_data(payload, game).context("Failed to read motion data")?;
        log::debug!(
            "Motion v{}: {} bones, {} locators, {} frames",
            motion.version,
            motion.num_bones,
            motion.num_locators,
            motion.info.num_frames
        );
        Ok(motion)
    }

    /// Reads only the header and info chunks.
    pub fn load_header(data: &[u8], game: GameVersion) -> Result<Self> {
        if game == GameVersion::Og2033 {
            return Self::load_header_2033(data);
        }
        let mut motion = Self::default();
        motion.read_header_chunks(&ChunkReader::new(data)?)?;
        Ok(motion)
    }

    fn read_header_chunks(&mut self, chunks: &ChunkReader) -> Result<()> {
        let header: MotionHeader = Cursor::new(chunks.require(CHUNK_HEADER)?)
            .read_le()
            .context("Failed to read motion header")?;
        self.version = header.version;
        self.bones_crc = header.bones_crc;
        self.num_bones = header.num_bones;
        self.num_locators = header.num_locators;
        self.info = MotionInfo::read(&mut Cursor::new(chunks.require(CHUNK_INFO)?), self.version)
            .context("Failed to read motion info")?;
        Ok(())
    }

    fn read_data(&mut self, data: &[u8], game: GameVersion) -> Result<()> {
        ensure!(
            data.len() > self.info.offsets_size as usize,
            "Motion data ({} bytes) smaller than its offsets table ({} bytes)",
            data.len(),
            self.info.offsets_size
        );
        let swapped = self.version < MOTION_VERSION_ARKTIKA1;
        let dwords = mask_dwords(self.version);
        let mut reader = Cursor::new(data);
        self.data_header = if swapped {
            MotionDataHeader::read::<BigEndian, _>(&mut reader, dwords)?
        } else {
            MotionDataHeader::read::<LittleEndian, _>(&mut reader, dwords)?
        };
        let table_start = reader.position() as usize;
        let num_swapped = if swapped { self.data_header.num_offsets_to_bswap() } else { 0 };
        let stride = offsets_stride(game);

        let curve_at = |idx: usize, attrib_size: u32| -> Result<AttributeCurve> {
            let pos = table_start + idx * 4;
            let entry = data.get(pos..pos + 4).ok_or(DecodeError::UnexpectedEof {
                offset: pos,
                needed: 4,
                available: data.len(),
            })?;
            let big_endian = idx < num_swapped;
            let offset = (if big_endian { BigEndian::read_u32(entry) } else { LittleEndian::read_u32(entry) })
                as usize;
            let curve_data = data.get(offset..).ok_or(DecodeError::UnexpectedEof {
                offset,
                needed: 4,
                available: data.len(),
            })?;
            let curve = if big_endian {
                read_curve::<BigEndian>(curve_data, attrib_size)
            } else {
                read_curve::<LittleEndian>(curve_data, attrib_size)
            };
            curve.with_context(|| format!("Failed to read curve {idx} at offset {offset:#X}"))
        };

        let num_bones = self.num_bones as usize;
        let num_locators = self.num_locators as usize;
        self.bone_rotations = vec![AttributeCurve::default(); num_bones];
        self.bone_positions = vec![AttributeCurve::default(); num_bones];
        self.bone_scales = if stride == 3 { vec![AttributeCurve::default(); num_bones] } else { Vec::new() };

        let mut flat_idx = 0;
        for bone in 0..num_bones {
            if !self.is_bone_animated(bone) {
                continue;
            }
            let base = flat_idx * stride;
            self.bone_rotations[bone] = curve_at(base, 4)?;
            self.bone_positions[bone] = curve_at(base + 1, 3)?;
            if stride == 3 {
                self.bone_scales[bone] = curve_at(base + 2, 3)?;
            }
            flat_idx += 1;
        }

        self.locator_rotations = Vec::with_capacity(num_locators);
        self.locator_positions = Vec::with_capacity(num_locators);
        self.locator_scales = Vec::new();
        for _ in 0..num_locators {
            let base = flat_idx * stride;
            self.locator_rotations.push(curve_at(base, 4)?);
            self.locator_positions.push(curve_at(base + 1, 3)?);
            if stride == 3 {
                self.locator_scales.push(curve_at(base + 2, 3)?);
            }
            flat_idx += 1;
        }
        Ok(())
    }

    /// Loads a Metro 2033 motion.
    pub fn load_2033(data: &[u8]) -> Result<Self> {
        let chunks = ChunkReader::new(data)?;
        let mut motion = Self::default();
        motion.read_header_chunks_2033(&chunks)?;

        let num_bones = motion.num_bones as usize;
        motion.bone_rotations = vec![AttributeCurve::default(); num_bones];
        motion.bone_positions = vec![AttributeCurve::default(); num_bones];
        let mut reader = Cursor::new(chunks.require(CHUNK_2033_BONES_MOTION)?);
        for bone in 0..num_bones {
            if !motion.is_bone_animated(bone) {
                continue;
            }
            let (rotations, positions) = motion
                .read_bone_curve_2033(&mut reader)
                .with_context(|| format!("Failed to read curves of bone {bone}"))?;
            motion.bone_rotations[bone] = rotations;
            motion.bone_positions[bone] = positions;
        }
        Ok(motion)
    }

    pub fn load_header_2033(data: &[u8]) -> Result<Self> {
        let mut motion = Self::default();
        motion.read_header_chunks_2033(&ChunkReader::new(data)?)?;
        Ok(motion)
    }

    fn read_header_chunks_2033(&mut self, chunks: &ChunkReader) -> Result<()> {
        let mut reader = Cursor::new(chunks.require(CHUNK_HEADER)?);
        self.version = read_u32::<LittleEndian, _>(&mut reader)?;
        self.bones_crc = read_u32::<LittleEndian, _>(&mut reader)?;
        self.num_bones = read_u16::<LittleEndian, _>(&mut reader)?;
        // Frames mask doubles as the payload bones mask
        self.data_header.bones_mask = if self.version > 6 {
            BoneMask::read::<LittleEndian, _>(&mut reader, 4)?
        } else {
            BoneMask::filled(4)
        };

        let version = self.version;
        let info = &mut self.info;
        let mut reader = Cursor::new(chunks.require(CHUNK_INFO)?);
        info.flags = MotionFlags(read_u16::<LittleEndian, _>(&mut reader)?);
        if version > 6 {
            info.speed = reader.read_le()?;
            info.accrue = reader.read_le()?;
            info.falloff = reader.read_le()?;
        } else if version < 3 {
            reader.seek(SeekFrom::Current(2))?;
        }
        info.num_frames = read_u32::<LittleEndian, _>(&mut reader)?;
        if version > 3 {
            info.jump_frame = read_u16::<LittleEndian, _>(&mut reader)?;
            info.land_frame = read_u16::<LittleEndian, _>(&mut reader)?;
            if version > 5 {
                info.affected_bones = BoneMask::read::<LittleEndian, _>(&mut reader, 4)?;
                info.hq_bones = BoneMask::read::<LittleEndian, _>(&mut reader, 4)?;
            } else {
                info.affected_bones = BoneMask::filled(8);
                info.hq_bones = BoneMask::filled(8);
            }
        }
        Ok(())
    }

    fn read_bone_curve_2033<R>(&self, reader: &mut R) -> Result<(AttributeCurve, AttributeCurve)>
    where R: Read + Seek {
        let flags = read_u8(reader)?;
        // Curve CRC and an unknown word
        reader.seek(SeekFrom::Current(8))?;
        let num_frames = self.info.num_frames as usize;

        let num_rotations = if flags & LEGACY_ROTATIONS_PRESENT != 0 { num_frames } else { 1 };
        let mut rotations = AttributeCurve::default();
        for frame in 0..num_rotations {
            let x = read_i16::<LittleEndian, _>(reader)?;
            let y = read_i16::<LittleEndian, _>(reader)?;
            let z = read_i16::<LittleEndian, _>(reader)?;
            let q = if flags & LEGACY_QUAT_COMPRESSION_EX != 0 {
                decode_packed_quat(x, y, z, false)
            } else {
                let v = Vec3::new(x as f32, y as f32, z as f32) / 32767.0;
                let w = (1.0 - v.length_squared()).max(0.0).sqrt();
                Quat::from_xyzw(v.x, v.y, v.z, w).normalize()
            };
            rotations.points.push(CurvePoint { time: frame_time(frame as u32), value: Vec4::from(q) });
        }

        let mut positions = AttributeCurve::default();
        if flags & LEGACY_OFFSETS_PRESENT != 0 {
            reader.seek(SeekFrom::Current(8))?;
            let mut raw = Vec::new();
            for _ in 0..num_frames {
                raw.push(Vec3::new(
                    read_i16::<LittleEndian, _>(reader)? as f32,
                    read_i16::<LittleEndian, _>(reader)? as f32,
                    read_i16::<LittleEndian, _>(reader)? as f32,
                ));
            }
            let scale = read_vec3::<LittleEndian, _>(reader)?;
            let offset = read_vec3::<LittleEndian, _>(reader)?;
            positions.points = raw
                .into_iter()
                .enumerate()
                .map(|(frame, v)| CurvePoint {
                    time: frame_time(frame as u32),
                    value: (v * scale + offset).extend(0.0),
                })
                .collect();
        } else {
            let value = read_vec3::<LittleEndian, _>(reader)?.extend(0.0);
            positions.points.push(CurvePoint { time: 0.0, value });
        }
        Ok((rotations, positions))
    }

    /// Writes the modern chunked layout. Curves are stored as Empty,
    /// OneValue or Uncompressed; the data and offsets sizes in the info
    /// chunk are recomputed. `game` selects the offsets table stride.
    pub fn save(&self, game: GameVersion) -> Result<Vec<u8>> {
        ensure!(game != GameVersion::Og2033, "Metro 2033 motions cannot be saved");
        let mut info = self.info.clone();
        let data = self.write_data(&mut info, offsets_stride(game))?;
        let header = MotionHeader {
            version: self.version,
            bones_crc: self.bones_crc,
            num_bones: self.num_bones,
            num_locators: self.num_locators,
        };
        let mut w = Cursor::new(Vec::new());
        write_chunk(&mut w, CHUNK_HEADER, |w| Ok(w.write_le(&header)?))?;
        write_chunk(&mut w, CHUNK_INFO, |w| info.write(w, self.version))?;
        write_chunk_data(&mut w, CHUNK_DATA, &data)?;
        Ok(w.into_inner())
    }

    fn write_data(&self, info: &mut MotionInfo, stride: usize) -> Result<Vec<u8>> {
        let swapped = self.version < MOTION_VERSION_ARKTIKA1;
        let dwords = mask_dwords(self.version);
        // Transform tracks are not written back
        let header = MotionDataHeader {
            num_locators: self.num_locators,
            num_xforms: 0,
            total_size: 0,
            ..self.data_header.clone()
        };
        let num_swapped = if swapped { header.num_offsets_to_bswap() } else { 0 };

        let mut tracks = Vec::new();
        for bone in (0..self.num_bones as usize).filter(|&b| self.is_bone_animated(b)) {
            tracks.push((track(&self.bone_rotations, bone), 4));
            tracks.push((track(&self.bone_positions, bone), 3));
            if stride == 3 {
                tracks.push((track(&self.bone_scales, bone), 3));
            }
        }
        for locator in 0..self.num_locators as usize {
            tracks.push((track(&self.locator_rotations, locator), 4));
            tracks.push((track(&self.locator_positions, locator), 3));
            if stride == 3 {
                tracks.push((track(&self.locator_scales, locator), 3));
            }
        }

        let mut curves = Vec::new();
        let mut offsets = Vec::with_capacity(tracks.len());
        for (idx, (curve, attrib_size)) in tracks.into_iter().enumerate() {
            offsets.push(curves.len());
            if idx < num_swapped {
                write_curve::<BigEndian>(&mut curves, curve, attrib_size)?;
            } else {
                write_curve::<LittleEndian>(&mut curves, curve, attrib_size)?;
            }
        }

        let mut out = Vec::new();
        if swapped {
            header.write::<BigEndian>(&mut out, dwords);
        } else {
            header.write::<LittleEndian>(&mut out, dwords);
        }
        let total_size_pos = dwords * 4 + 4;
        let table_size = offsets.len() * 4;
        let base = out.len() + table_size;
        for (idx, offset) in offsets.into_iter().enumerate() {
            let offset = u32::try_from(base + offset)?;
            if idx < num_swapped {
                out.extend_from_slice(U32::<BigEndian>::new(offset).as_bytes());
            } else {
                out.extend_from_slice(U32::<LittleEndian>::new(offset).as_bytes());
            }
        }
        out.extend_from_slice(&curves);

        let total_size = u32::try_from(out.len())?;
        let total_size_bytes = &mut out[total_size_pos..total_size_pos + 4];
        if swapped {
            BigEndian::write_u32(total_size_bytes, total_size);
        } else {
            LittleEndian::write_u32(total_size_bytes, total_size);
        }
        info.data_size = total_size;
        info.offsets_size = u32::try_from(table_size)?;
        Ok(out)
    }

    /// Animated bones are those both flagged as affected and encoded in
    /// the payload.
    pub fn is_bone_animated(&self, bone: usize) -> bool {
        self.info.affected_bones.is_present(bone) && self.data_header.bones_mask.is_present(bone)
    }

    pub fn num_animated_bones(&self) -> usize {
        (0..self.num_bones as usize).filter(|&b| self.is_bone_animated(b)).count()
    }

    pub fn num_frames(&self) -> u32 { self.info.num_frames }

    /// Length in seconds.
    pub fn duration(&self) -> f32 { frame_time(self.info.num_frames) }

    pub fn bone_rotation(&self, bone: usize, frame: u32) -> Quat {
        track(&self.bone_rotations, bone).resolve_quat(frame_time(frame))
    }

    pub fn bone_position(&self, bone: usize, frame: u32) -> Vec3 {
        track(&self.bone_positions, bone).resolve_vec3(frame_time(frame))
    }

    /// Zero when the motion carries no scale track.
    pub fn bone_scale(&self, bone: usize, frame: u32) -> Vec3 {
        track(&self.bone_scales, bone).resolve_vec3(frame_time(frame))
    }

    pub fn locator_rotation(&self, locator: usize, frame: u32) -> Quat {
        track(&self.locator_rotations, locator).resolve_quat(frame_time(frame))
    }

    pub fn locator_position(&self, locator: usize, frame: u32) -> Vec3 {
        track(&self.locator_positions, locator).resolve_vec3(frame_time(frame))
    }

    pub fn locator_scale(&self, locator: usize, frame: u32) -> Vec3 {
        track(&self.locator_scales, locator).resolve_vec3(frame_time(frame))
    }

    pub fn bind<'a>(&'a self, skeleton: &'a Skeleton) -> Result<MotionBinding<'a>> {
        MotionBinding::new(self, skeleton)
    }
}

/// A motion paired with the skeleton it was authored for.
pub struct MotionBinding<'a> {
    motion: &'a Motion,
    skeleton: &'a Skeleton,
}

impl<'a> MotionBinding<'a> {
    /// Fails with [`DecodeError::BonesCrcMismatch`] unless the motion was
    /// made for this skeleton.
    pub fn new(motion: &'a Motion, skeleton: &'a Skeleton) -> Result<Self> {
        ensure!(motion.bones_crc == skeleton.bones_crc(), DecodeError::BonesCrcMismatch {
            expected: skeleton.bones_crc(),
            found: motion.bones_crc
        });
        Ok(Self { motion, skeleton })
    }

    pub fn motion(&self) -> &'a Motion { self.motion }

    pub fn skeleton(&self) -> &'a Skeleton { self.skeleton }

    pub fn is_bone_animated(&self, bone: usize) -> bool {
        bone < self.skeleton.num_bones() && self.motion.is_bone_animated(bone)
    }

    /// Local transform of an attach point at `frame`. Anything the motion
    /// does not animate keeps its bind transform.
    pub fn local_transform(&self, idx: usize, frame: u32) -> Option<Mat4> {
        if self.is_bone_animated(idx) {
            return Some(Mat4::from_rotation_translation(
                self.motion.bone_rotation(idx, frame),
                self.motion.bone_position(idx, frame),
            ));
        }
        if let Some(locator) = self.skeleton.attach_point_to_locator(idx) {
            if !track(&self.motion.locator_rotations, locator).is_empty() {
                return Some(Mat4::from_rotation_translation(
                    self.motion.locator_rotation(locator, frame),
                    self.motion.locator_position(locator, frame),
                ));
            }
        }
        self.skeleton.bone_transform(idx)
    }

    /// Model-space transforms of every attach point at `frame`.
    pub fn pose(&self, frame: u32) -> Vec<Mat4> {
        let count = self.skeleton.num_attach_points();
        let locals = (0..count)
            .map(|idx| self.local_transform(idx, frame).unwrap_or(Mat4::IDENTITY))
            .collect::<Vec<_>>();
        (0..count)
            .map(|idx| {
                let mut result = locals[idx];
                let mut parent = self.skeleton.bone_parent_idx(idx);
                let mut depth = 0;
                while let Some(p) = parent {
                    if depth >= count {
                        log::warn!("Parent cycle at attach point {}", idx);
                        break;
                    }
                    result = locals[p] * result;
                    parent = self.skeleton.bone_parent_idx(p);
                    depth += 1;
                }
                result
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::skeleton::Bone;

    fn constant(v: Vec4) -> AttributeCurve { AttributeCurve::constant(v) }

    fn ramp(from: Vec3, to: Vec3) -> AttributeCurve {
        AttributeCurve::new(vec![
            CurvePoint { time: 0.0, value: from.extend(0.0) },
            CurvePoint { time: 1.0, value: to.extend(0.0) },
        ])
    }

    fn sample_motion(version: u32) -> Motion {
        let mut motion = Motion {
            version,
            bones_crc: 0xCAFEBABE,
            num_bones: 3,
            num_locators: 1,
            ..Default::default()
        };
        motion.info.num_frames = 31;
        motion.info.flags = MotionFlags(MotionFlags::LOOPED.0 | MotionFlags::ROOTMOVER.0);
        for bone in [0, 1, 2] {
            motion.data_header.bones_mask.set(bone);
        }
        motion.info.affected_bones.set(0);
        motion.info.affected_bones.set(2);
        motion.bone_rotations = vec![AttributeCurve::default(); 3];
        motion.bone_positions = vec![AttributeCurve::default(); 3];
        motion.bone_scales = vec![AttributeCurve::default(); 3];
        motion.bone_rotations[0] = constant(Vec4::from(Quat::from_rotation_y(0.5)));
        motion.bone_positions[0] = ramp(Vec3::ZERO, Vec3::new(0.0, 3.0, 0.0));
        motion.bone_scales[0] = constant(Vec4::new(1.0, 1.0, 1.0, 0.0));
        motion.bone_positions[2] = constant(Vec4::new(1.0, 2.0, 3.0, 0.0));
        motion.locator_rotations = vec![constant(Vec4::from(Quat::IDENTITY))];
        motion.locator_positions = vec![ramp(Vec3::X, Vec3::Y)];
        motion.locator_scales = vec![AttributeCurve::default()];
        motion
    }

    fn assert_curves_match(loaded: &Motion, original: &Motion) {
        assert_eq!(loaded.bone_rotations[0], original.bone_rotations[0]);
        assert_eq!(loaded.bone_positions[0], original.bone_positions[0]);
        assert_eq!(loaded.bone_scales[0], original.bone_scales[0]);
        assert!(loaded.bone_positions[1].is_empty());
        assert_eq!(loaded.bone_positions[2], original.bone_positions[2]);
        assert_eq!(loaded.locator_positions, original.locator_positions);
        assert_eq!(loaded.locator_rotations, original.locator_rotations);
    }

    #[test]
    fn swap_count_formula() {
        let cases = [
            ((0, 0, 0), 0),
            ((1, 0, 0), 2),
            ((0, 1, 0), 3),
            ((0, 0, 1), 2),
            ((0, 0, 7), 2),
            ((3, 2, 1), 14),
            ((5, 1, 0), 13),
            ((256, 0, 0), 512),
        ];
        for ((bones, locators, xforms), expected) in cases {
            assert_eq!(num_offsets_to_bswap(bones, locators, xforms), expected, "{bones} {locators} {xforms}");
        }
        for bones in 0..=256 {
            for locators in 0..8 {
                for xforms in 0..3 {
                    let expected = bones * 2 + locators * 3 + if xforms > 0 { 2 } else { 0 };
                    assert_eq!(num_offsets_to_bswap(bones, locators, xforms), expected);
                }
            }
        }
    }

    #[test]
    fn swap_count_uses_payload_mask() {
        let mut header = MotionDataHeader { num_locators: 1, num_xforms: 4, ..Default::default() };
        for bone in [0, 31, 32, 100, 127] {
            header.bones_mask.set(bone);
        }
        assert_eq!(header.num_offsets_to_bswap(), 5 * 2 + 3 + 2);
    }

    #[test]
    fn bone_mask_bits() {
        let mut mask = BoneMask::default();
        mask.set(0);
        mask.set(33);
        mask.set(255);
        mask.set(256);
        assert!(mask.is_present(33) && mask.is_present(255));
        assert!(!mask.is_present(1) && !mask.is_present(256));
        assert_eq!(mask.count_ones(), 3);
        assert_eq!(BoneMask::filled(4).count_ones(), 128);
    }

    #[test]
    fn flag_names() {
        let flags = MotionFlags(0x12);
        assert_eq!(flags.names().collect::<Vec<_>>(), ["looped", "rootmover"]);
    }

    #[test]
    fn arktika_round_trip() {
        let motion = sample_motion(MOTION_VERSION_ARKTIKA1);
        let data = motion.save(GameVersion::Exodus).unwrap();
        let loaded = Motion::load(&data, GameVersion::Exodus).unwrap();
        assert_eq!(loaded.version, MOTION_VERSION_ARKTIKA1);
        assert_eq!(loaded.bones_crc, 0xCAFEBABE);
        assert_eq!(loaded.info.flags, motion.info.flags);
        assert!(loaded.is_bone_animated(0) && !loaded.is_bone_animated(1) && loaded.is_bone_animated(2));
        assert_eq!(loaded.num_animated_bones(), 2);
        assert_curves_match(&loaded, &motion);
        assert_eq!(loaded.data_header.total_size, loaded.info.data_size);
        // 2 animated bones + 1 locator, 3 tracks each
        assert_eq!(loaded.info.offsets_size, 9 * 4);
        assert!((loaded.duration() - 31.0 / 30.0).abs() < 1e-6);
        assert!((loaded.bone_position(0, 15).y - 1.5).abs() < 1e-5);
        assert_eq!(loaded.bone_position(0, 300).y, 3.0);
    }

    #[test]
    fn redux_round_trip_keeps_partial_swap() {
        let mut motion = sample_motion(MOTION_VERSION_REDUX);
        // One payload bone, no locators: two big-endian entries
        motion.num_bones = 1;
        motion.num_locators = 0;
        motion.data_header.bones_mask = BoneMask::default();
        motion.data_header.bones_mask.set(0);
        let file = motion.save(GameVersion::Redux).unwrap();

        let chunks = ChunkReader::new(&file).unwrap();
        let data = chunks.get(CHUNK_DATA).unwrap();
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 1);
        let table = 16 + 2 + 2 + 4 + 8;
        let entry = |idx: usize| data[table + idx * 4..table + idx * 4 + 4].try_into().unwrap();
        let first_curve = table + 12;
        assert_eq!(u32::from_be_bytes(entry(0)) as usize, first_curve);
        // OneValue quat: 4 + 16 bytes, then a 2 point vec3: 4 + 8 + 24 bytes
        assert_eq!(u32::from_be_bytes(entry(1)) as usize, first_curve + 20);
        assert_eq!(u32::from_le_bytes(entry(2)) as usize, first_curve + 56);
        assert_eq!(
            u32::from_be_bytes(data[first_curve..first_curve + 4].try_into().unwrap()),
            (4 << 24) | (2 << 16) | 1
        );
        let scale_curve = first_curve + 56;
        assert_eq!(
            u32::from_le_bytes(data[scale_curve..scale_curve + 4].try_into().unwrap()),
            (3 << 24) | (2 << 16) | 1
        );

        let loaded = Motion::load(&file, GameVersion::Redux).unwrap();
        assert_eq!(loaded.bone_rotations[0], motion.bone_rotations[0]);
        assert_eq!(loaded.bone_positions[0], motion.bone_positions[0]);
        assert_eq!(loaded.bone_scales[0], motion.bone_scales[0]);
    }

    #[test]
    fn redux_round_trip_with_locators() {
        let motion = sample_motion(MOTION_VERSION_REDUX);
        let loaded = Motion::load(&motion.save(GameVersion::Redux).unwrap(), GameVersion::Redux).unwrap();
        assert_curves_match(&loaded, &motion);
    }

    #[test]
    fn header_only_load() {
        let motion = sample_motion(MOTION_VERSION_ARKTIKA1);
        let header = Motion::load_header(&motion.save(GameVersion::Arktika1).unwrap(), GameVersion::Arktika1).unwrap();
        assert_eq!(header.info.num_frames, 31);
        assert_eq!(header.num_locators, 1);
        assert!(header.bone_rotations.is_empty());
    }

    #[test]
    fn data_size_must_match_info() {
        let file = sample_motion(MOTION_VERSION_ARKTIKA1).save(GameVersion::Exodus).unwrap();
        let chunks = ChunkReader::new(&file).unwrap();
        let mut data = chunks.get(CHUNK_DATA).unwrap().to_vec();
        data.push(0);
        let mut w = Cursor::new(Vec::new());
        write_chunk_data(&mut w, CHUNK_HEADER, chunks.get(CHUNK_HEADER).unwrap()).unwrap();
        write_chunk_data(&mut w, CHUNK_INFO, chunks.get(CHUNK_INFO).unwrap()).unwrap();
        write_chunk_data(&mut w, CHUNK_DATA, &data).unwrap();
        assert!(Motion::load(&w.into_inner(), GameVersion::Exodus).is_err());
    }

    #[test]
    fn last_light_uses_two_offsets_per_track() {
        assert_eq!(offsets_stride(GameVersion::OgLastLight), 2);
        assert_eq!(offsets_stride(GameVersion::Redux), 3);
        assert_eq!(offsets_stride(GameVersion::Exodus), 3);
    }

    #[test]
    fn last_light_round_trip() {
        let mut motion = sample_motion(MOTION_VERSION_REDUX);
        motion.bone_scales.clear();
        motion.locator_scales.clear();
        motion.bone_rotations[2] = constant(Vec4::from(Quat::from_rotation_x(0.25)));
        let file = motion.save(GameVersion::OgLastLight).unwrap();

        let loaded = Motion::load(&file, GameVersion::OgLastLight).unwrap();
        // 2 animated bones + 1 locator, 2 tracks each
        assert_eq!(loaded.info.offsets_size, 6 * 4);
        assert!(loaded.bone_scales.is_empty());
        assert!(loaded.locator_scales.is_empty());
        assert_eq!(loaded.bone_rotations[0], motion.bone_rotations[0]);
        assert_eq!(loaded.bone_positions[0], motion.bone_positions[0]);
        assert_eq!(loaded.bone_rotations[2], motion.bone_rotations[2]);
        assert_eq!(loaded.bone_positions[2], motion.bone_positions[2]);
        assert_eq!(loaded.locator_rotations, motion.locator_rotations);
        assert_eq!(loaded.locator_positions, motion.locator_positions);

        assert_eq!(loaded.save(GameVersion::OgLastLight).unwrap(), file);
        assert!(motion.save(GameVersion::Og2033).is_err());
    }

    #[test]
    fn data_header_unknown_keeps_file_order() {
        let mut motion = sample_motion(MOTION_VERSION_REDUX);
        motion.data_header.unknown = 0x0102_0304_0506_0708;
        let file = motion.save(GameVersion::Redux).unwrap();
        let chunks = ChunkReader::new(&file).unwrap();
        let data = chunks.get(CHUNK_DATA).unwrap();
        // Locator count is big-endian, the unknown word is not
        assert_eq!(u16::from_be_bytes(data[16..18].try_into().unwrap()), 1);
        let pos = 16 + 2 + 2 + 4;
        assert_eq!(data[pos..pos + 8], 0x0102_0304_0506_0708u64.to_le_bytes());
        let loaded = Motion::load(&file, GameVersion::Redux).unwrap();
        assert_eq!(loaded.data_header.unknown, 0x0102_0304_0506_0708);
    }

    fn two_bone_skeleton(crc: u32) -> Skeleton {
        let mut skeleton = Skeleton::default();
        skeleton.crc = crc;
        skeleton.bones.push(Bone { name: "root".into(), q: Quat::IDENTITY, ..Default::default() });
        skeleton.bones.push(Bone {
            name: "child".into(),
            parent: "root".into(),
            q: Quat::IDENTITY,
            t: Vec3::Y,
            ..Default::default()
        });
        skeleton.rebuild_cache();
        skeleton
    }

    #[test]
    fn binding_requires_matching_crc() {
        let motion = Motion { bones_crc: 0x1234, ..Default::default() };
        let err = motion.bind(&two_bone_skeleton(0x5678)).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::BonesCrcMismatch { expected: 0x5678, found: 0x1234 })
        ));
        assert!(motion.bind(&two_bone_skeleton(0x1234)).is_ok());
    }

    #[test]
    fn binding_poses_animated_bones() {
        let skeleton = two_bone_skeleton(7);
        let mut motion = Motion { bones_crc: 7, num_bones: 2, ..Default::default() };
        motion.info.affected_bones.set(1);
        motion.data_header.bones_mask.set(1);
        motion.bone_rotations = vec![AttributeCurve::default(); 2];
        motion.bone_positions = vec![AttributeCurve::default(), constant(Vec4::new(0.0, 2.0, 0.0, 0.0))];
        let binding = motion.bind(&skeleton).unwrap();
        assert!(!binding.is_bone_animated(0));
        assert!(binding.is_bone_animated(1));
        let pose = binding.pose(0);
        assert_eq!(pose.len(), 2);
        assert!(pose[1].w_axis.truncate().abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-6));
        assert!(pose[0].abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    fn legacy_file() -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&7u32.to_le_bytes());
        header.extend_from_slice(&0xABCDu32.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&[0x03, 0, 0, 0]);
        header.extend_from_slice(&[0u8; 12]);

        let mut info = Vec::new();
        info.extend_from_slice(&0x2u16.to_le_bytes());
        for v in [1.0f32, 0.5, 0.25] {
            info.extend_from_slice(&v.to_le_bytes());
        }
        info.extend_from_slice(&2u32.to_le_bytes());
        info.extend_from_slice(&[0u8; 4]);
        info.extend_from_slice(&[0x03, 0, 0, 0]);
        info.extend_from_slice(&[0u8; 12]);
        info.extend_from_slice(&[0u8; 16]);

        let mut bones = Vec::new();
        // Bone 0: per-frame rotations and offsets
        bones.push(LEGACY_ROTATIONS_PRESENT | LEGACY_OFFSETS_PRESENT);
        bones.extend_from_slice(&[0u8; 8]);
        for v in [0i16, 0, 0, 32767, 0, 0] {
            bones.extend_from_slice(&v.to_le_bytes());
        }
        bones.extend_from_slice(&[0u8; 8]);
        for v in [1i16, 2, 3, 4, 5, 6] {
            bones.extend_from_slice(&v.to_le_bytes());
        }
        for v in [1.0f32, 1.0, 1.0, 0.0, 0.0, 10.0] {
            bones.extend_from_slice(&v.to_le_bytes());
        }
        // Bone 1: one packed rotation, constant position
        bones.push(LEGACY_QUAT_COMPRESSION_EX);
        bones.extend_from_slice(&[0u8; 8]);
        for v in [0i16, 0, 1] {
            bones.extend_from_slice(&v.to_le_bytes());
        }
        for v in [7.0f32, 8.0, 9.0] {
            bones.extend_from_slice(&v.to_le_bytes());
        }

        let mut w = Cursor::new(Vec::new());
        write_chunk_data(&mut w, CHUNK_HEADER, &header).unwrap();
        write_chunk_data(&mut w, CHUNK_INFO, &info).unwrap();
        write_chunk_data(&mut w, CHUNK_2033_BONES_MOTION, &bones).unwrap();
        w.into_inner()
    }

    #[test]
    fn load_2033_layout() {
        let motion = Motion::load(&legacy_file(), GameVersion::Og2033).unwrap();
        assert_eq!(motion.version, 7);
        assert_eq!(motion.bones_crc, 0xABCD);
        assert_eq!(motion.info.accrue, 0.5);
        assert!(motion.is_bone_animated(0) && motion.is_bone_animated(1));

        let rotations = &motion.bone_rotations[0].points;
        assert_eq!(rotations.len(), 2);
        assert!((rotations[1].time - 1.0 / 30.0).abs() < 1e-6);
        assert!(Quat::from_vec4(rotations[0].value).abs_diff_eq(Quat::IDENTITY, 1e-6));
        assert!(Quat::from_vec4(rotations[1].value).abs_diff_eq(Quat::from_xyzw(1.0, 0.0, 0.0, 0.0), 1e-6));
        assert_eq!(motion.bone_positions[0].points[1].value, Vec4::new(4.0, 5.0, 16.0, 0.0));

        assert_eq!(motion.bone_rotations[1].len(), 1);
        assert!(motion.bone_rotation(1, 0).w > 0.99);
        assert_eq!(motion.bone_position(1, 5), Vec3::new(7.0, 8.0, 9.0));
        assert!((motion.duration() - 2.0 / 30.0).abs() < 1e-6);

        let header = Motion::load_header(&legacy_file(), GameVersion::Og2033).unwrap();
        assert_eq!(header.num_bones, 2);
        assert!(header.bone_rotations.is_empty());
    }
}
