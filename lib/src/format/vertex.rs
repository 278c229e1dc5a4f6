use std::io::Cursor;

use anyhow::{ensure, Context, Result};
use binrw::{binrw, BinReaderExt};
use glam::{Vec2, Vec3, Vec4};
use strum::FromRepr;

use crate::{format::DecodeError, util::math::swizzle_vec3};

pub const VERTEX_STRIDE: usize = 32;

const SKINNED_POS_SCALE: f32 = 1.0 / 32767.0;
const SKINNED_UV_SCALE: f32 = 1.0 / 2048.0;
const LEVEL_UV0_SCALE: f32 = 1.0 / 1024.0;
const LEVEL_UV1_SCALE: f32 = 1.0 / 32767.0;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum VertexType {
    #[default]
    Invalid = 0,
    Skin = 1,
    Static = 2,
    Level = 3,
    LevelLegacy = 4,
    Particle = 16,
    Soft = 17,
    Impostor = 19,
    SkinNb = 25,
}

impl VertexType {
    pub fn parse(value: u32) -> Result<Self> {
        Ok(Self::from_repr(value).ok_or(DecodeError::VertexType(value))?)
    }

    /// Bytes per vertex for the layouts that can be decoded.
    pub fn stride(self) -> Option<usize> {
        match self {
            VertexType::Skin | VertexType::Static | VertexType::Level | VertexType::LevelLegacy => {
                Some(VERTEX_STRIDE)
            }
            _ => None,
        }
    }
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default)]
pub struct VertexStatic {
    pub pos: [f32; 3],
    pub normal: u32,
    pub aux0: u32,
    pub aux1: u32,
    pub uv: [f32; 2],
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default)]
pub struct VertexSkinned {
    pub pos: [i16; 4],
    pub normal: u32,
    pub aux0: u32,
    pub aux1: u32,
    pub bones: [u8; 4],
    pub weights: [u8; 4],
    pub uv: [i16; 2],
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default)]
pub struct VertexLevel {
    pub pos: [f32; 3],
    pub normal: u32,
    pub aux0: u32,
    pub aux1: u32,
    pub uv0: [i16; 2],
    pub uv1: [i16; 2],
}

/// A vertex in engine-independent form: axes unswizzled, positions scaled,
/// bone indices resolved to skeleton bones.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MeshVertex {
    pub pos: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub bitangent: Vec3,
    pub uv0: Vec2,
    pub uv1: Vec2,
    pub bones: [u8; 4],
    pub weights: [u8; 4],
}

/// Unpacks a normal stored as `[w:8][x:8][y:8][z:8]`.
pub fn decode_normal(n: u32) -> Vec4 {
    Vec4::new(
        ((n >> 16) & 0xFF) as f32 / 255.0 * 2.0 - 1.0,
        ((n >> 8) & 0xFF) as f32 / 255.0 * 2.0 - 1.0,
        (n & 0xFF) as f32 / 255.0 * 2.0 - 1.0,
        (n >> 24) as f32 / 255.0,
    )
}

pub fn encode_normal(v: Vec4) -> u32 {
    let unorm = |f: f32| ((f * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u32;
    let w = (v.w.clamp(0.0, 1.0) * 255.0).round() as u32;
    (w << 24) | (unorm(v.x) << 16) | (unorm(v.y) << 8) | unorm(v.z)
}

pub fn decode_tangent(n: u32) -> Vec4 {
    Vec4::new(
        ((n >> 16) & 0xFF) as f32 / 127.5 - 1.0,
        ((n >> 8) & 0xFF) as f32 / 127.5 - 1.0,
        (n & 0xFF) as f32 / 127.5 - 1.0,
        (n >> 24) as f32 / 127.5 - 1.0,
    )
}

fn decode_dir(n: u32) -> Vec3 { swizzle_vec3(decode_normal(n).truncate()) }

fn decode_tan(n: u32) -> Vec3 { swizzle_vec3(decode_tangent(n).truncate()) }

fn remap_bones(bones: [u8; 4], remap: &[u8]) -> Result<[u8; 4]> {
    let mut out = [bones[2], bones[1], bones[0], bones[3]];
    if remap.is_empty() {
        return Ok(out);
    }
    for bone in &mut out {
        *bone = *remap
            .get(*bone as usize / 3)
            .with_context(|| format!("Bone index {} outside remap table of {}", bone, remap.len()))?;
    }
    Ok(out)
}

/// Decodes `count` vertices of `vertex_type` from `data`.
///
/// `vscale` applies to skinned positions only. `remap` maps the mesh-local
/// bone indices of skinned vertices to skeleton bones; pass an empty slice
/// to keep them as stored.
pub fn decode_vertices(
    data: &[u8],
    vertex_type: VertexType,
    count: usize,
    vscale: f32,
    remap: &[u8],
) -> Result<Vec<MeshVertex>> {
    let stride = vertex_type.stride().ok_or(DecodeError::VertexType(vertex_type as u32))?;
    ensure!(
        data.len() >= count * stride,
        "Vertex data too small: {} bytes for {} vertices",
        data.len(),
        count
    );
    let mut reader = Cursor::new(data);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let vertex = match vertex_type {
            VertexType::Static => {
                let v: VertexStatic = reader.read_le()?;
                MeshVertex {
                    pos: swizzle_vec3(Vec3::from_array(v.pos)),
                    normal: decode_dir(v.normal),
                    tangent: decode_tan(v.aux0),
                    bitangent: decode_tan(v.aux1),
                    uv0: Vec2::from_array(v.uv),
                    ..Default::default()
                }
            }
            VertexType::Skin => {
                let v: VertexSkinned = reader.read_le()?;
                let pos = Vec3::new(v.pos[0] as f32, v.pos[1] as f32, v.pos[2] as f32);
                MeshVertex {
                    pos: swizzle_vec3(pos * SKINNED_POS_SCALE) * vscale,
                    normal: decode_dir(v.normal),
                    tangent: decode_tan(v.aux0),
                    bitangent: decode_tan(v.aux1),
                    uv0: Vec2::new(v.uv[0] as f32, v.uv[1] as f32) * SKINNED_UV_SCALE,
                    uv1: Vec2::ZERO,
                    bones: remap_bones(v.bones, remap)?,
                    weights: [v.weights[2], v.weights[1], v.weights[0], v.weights[3]],
                }
            }
            VertexType::Level | VertexType::LevelLegacy => {
                let v: VertexLevel = reader.read_le()?;
                MeshVertex {
                    pos: swizzle_vec3(Vec3::from_array(v.pos)),
                    normal: decode_dir(v.normal),
                    tangent: decode_tan(v.aux0),
                    bitangent: decode_tan(v.aux1),
                    uv0: Vec2::new(v.uv0[0] as f32, v.uv0[1] as f32) * LEVEL_UV0_SCALE,
                    uv1: Vec2::new(v.uv1[0] as f32, v.uv1[1] as f32) * LEVEL_UV1_SCALE,
                    ..Default::default()
                }
            }
            other => return Err(DecodeError::VertexType(other as u32).into()),
        };
        out.push(vertex);
    }
    Ok(out)
}

/// Decodes `count` little-endian `u16` triangles.
pub fn decode_faces(data: &[u8], count: usize) -> Result<Vec<[u16; 3]>> {
    ensure!(data.len() >= count * 6, "Face data too small: {} bytes for {} faces", data.len(), count);
    Ok(data[..count * 6]
        .chunks_exact(6)
        .map(|f| {
            [
                u16::from_le_bytes([f[0], f[1]]),
                u16::from_le_bytes([f[2], f[3]]),
                u16::from_le_bytes([f[4], f[5]]),
            ]
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use binrw::BinWriterExt;

    use super::*;

    fn to_bytes<T>(values: &[T]) -> Vec<u8>
    where T: for<'a> binrw::BinWrite<Args<'a> = ()> {
        let mut out = Cursor::new(Vec::new());
        for v in values {
            out.write_le(v).unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn layouts_are_32_bytes() {
        assert_eq!(to_bytes(&[VertexStatic::default()]).len(), VERTEX_STRIDE);
        assert_eq!(to_bytes(&[VertexSkinned::default()]).len(), VERTEX_STRIDE);
        assert_eq!(to_bytes(&[VertexLevel::default()]).len(), VERTEX_STRIDE);
    }

    #[test]
    fn normal_decode() {
        let n = decode_normal(0xFF_FF_80_00);
        assert_eq!(n.x, 1.0);
        assert!((n.y - 0.003_921_6).abs() < 1e-5);
        assert_eq!(n.z, -1.0);
        assert_eq!(n.w, 1.0);
    }

    #[test]
    fn normal_encode_inverts_decode() {
        for n in [0u32, 0x12_34_56_78, 0xFF_FF_FF_FF, 0x80_00_FF_7F] {
            assert_eq!(encode_normal(decode_normal(n)), n);
        }
        assert_eq!(encode_normal(Vec4::new(5.0, -5.0, 0.0, 2.0)), 0xFF_FF_00_80);
    }

    #[test]
    fn tangent_decode() {
        let t = decode_tangent(0x00_FF_00_FF);
        assert_eq!(t, Vec4::new(1.0, -1.0, 1.0, -1.0));
    }

    #[test]
    fn static_vertex() {
        let data = to_bytes(&[VertexStatic {
            pos: [1.0, 2.0, 3.0],
            normal: 0x00_FF_80_00,
            uv: [0.25, 0.75],
            ..Default::default()
        }]);
        let v = decode_vertices(&data, VertexType::Static, 1, 100.0, &[]).unwrap();
        assert_eq!(v[0].pos, Vec3::new(3.0, 2.0, 1.0));
        assert_eq!(v[0].normal.x, -1.0);
        assert_eq!(v[0].normal.z, 1.0);
        assert_eq!(v[0].uv0, Vec2::new(0.25, 0.75));
    }

    #[test]
    fn skinned_vertex() {
        let data = to_bytes(&[VertexSkinned {
            pos: [32767, 0, -32767, 0],
            bones: [3, 6, 9, 0],
            weights: [10, 20, 30, 40],
            uv: [2048, -1024],
            ..Default::default()
        }]);
        let remap = [7u8, 8, 9, 10];
        let v = decode_vertices(&data, VertexType::Skin, 1, 2.0, &remap).unwrap();
        assert!(v[0].pos.abs_diff_eq(Vec3::new(-2.0, 0.0, 2.0), 1e-6));
        assert_eq!(v[0].uv0, Vec2::new(1.0, -0.5));
        assert_eq!(v[0].bones, [10, 9, 8, 7]);
        assert_eq!(v[0].weights, [30, 20, 10, 40]);

        let v = decode_vertices(&data, VertexType::Skin, 1, 1.0, &[]).unwrap();
        assert_eq!(v[0].bones, [9, 6, 3, 0]);
        assert!(decode_vertices(&data, VertexType::Skin, 1, 1.0, &[1]).is_err());
    }

    #[test]
    fn level_vertex() {
        let data = to_bytes(&[VertexLevel {
            pos: [0.0, 1.0, 0.0],
            uv0: [1024, 512],
            uv1: [32767, 0],
            ..Default::default()
        }]);
        let v = decode_vertices(&data, VertexType::Level, 1, 1.0, &[]).unwrap();
        assert_eq!(v[0].pos, Vec3::Y);
        assert_eq!(v[0].uv0, Vec2::new(1.0, 0.5));
        assert!(v[0].uv1.abs_diff_eq(Vec2::new(1.0, 0.0), 1e-6));
    }

    #[test]
    fn unsupported_and_short() {
        let err = decode_vertices(&[0u8; 64], VertexType::Soft, 1, 1.0, &[]).unwrap_err();
        assert!(matches!(err.downcast_ref::<DecodeError>(), Some(DecodeError::VertexType(17))));
        assert!(decode_vertices(&[0u8; 16], VertexType::Static, 1, 1.0, &[]).is_err());
        assert!(VertexType::parse(99).is_err());
        assert_eq!(VertexType::parse(25).unwrap(), VertexType::SkinNb);
    }

    #[test]
    fn faces() {
        let data = [0u8, 0, 1, 0, 2, 0, 2, 0, 1, 0, 3, 0];
        assert_eq!(decode_faces(&data, 2).unwrap(), vec![[0, 1, 2], [2, 1, 3]]);
        assert!(decode_faces(&data, 3).is_err());
    }
}
