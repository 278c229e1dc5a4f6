//! Models (`.model`, `.mesh`).
//!
//! Every model is a chunk list starting with a 64 byte header whose type
//! tag selects one of four shapes:
//! - [`StdModel`]: a static mesh with inline vertex and face buffers, or a
//!   reference into level geometry.
//! - [`SkinModel`]: a skinned mesh with a bone remap table and per-bone OBBs.
//! - [`HierarchyModel`]: child models (nested inline, or by index) plus up to
//!   two LOD hierarchies.
//! - [`SkeletonModel`]: a skeleton and up to three groups of skinned LOD
//!   meshes, each group checked against the skeleton's bones CRC.
//!
//! Linked files (external meshes and skeletons) are fetched through a
//! [`ModelResolver`].

use std::{
    io::{Cursor, Read, Seek, Write},
    ops::BitOr,
};

use anyhow::{ensure, Context, Result};
use binrw::{binrw, BinReaderExt, BinWriterExt};
use indexmap::IndexMap;
use strum::FromRepr;
use zerocopy::LittleEndian;

use crate::{
    format::{
        chunk::{write_chunk, write_chunk_data, ChunkReader},
        skeleton::Skeleton,
        vertex::{decode_faces, decode_vertices, MeshVertex, VertexType},
        DecodeError, GameVersion,
    },
    util::{
        math::{swizzle_vec3, AABBox, BSphere},
        read::{read_f32, read_stringz, read_u16, read_u32, read_u8, write_stringz},
    },
};

pub const MODEL_VERSION_LAST_LIGHT: u8 = 17;
pub const MODEL_VERSION_LAST_LIGHT_RELEASE: u8 = 20;
pub const MODEL_VERSION_REDUX: u8 = 22;
pub const MODEL_VERSION_EARLY_ARKTIKA1: u8 = 30;
pub const MODEL_VERSION_ARKTIKA1: u8 = 31;
pub const MODEL_VERSION_EXODUS: u8 = 42;

const CHUNK_HEADER: u32 = 1;
const CHUNK_MATERIALS: u32 = 2;
const CHUNK_VERTICES: u32 = 3;
const CHUNK_FACES: u32 = 4;
const CHUNK_SKINNED_VERTICES: u32 = 5;
const CHUNK_CHILDREN: u32 = 9;
const CHUNK_CHILDREN_REFS: u32 = 10;
const CHUNK_LOD_1: u32 = 11;
const CHUNK_LOD_2: u32 = 12;
const CHUNK_MESHES_INLINE: u32 = 15;
const CHUNK_MESHES_LINKS: u32 = 16;
const CHUNK_SKELETON_LINK: u32 = 20;
const CHUNK_MESH_REF: u32 = 21;
const CHUNK_SKELETON_INLINE: u32 = 24;
const CHUNK_TEXTURE_REPLACEMENTS: u32 = 29;
const CHUNK_TEXTURE_PRESETS: u32 = 32;
const CHUNK_COMMENT: u32 = 36;

pub const MAX_LODS: usize = 3;
const COMMENT_PREFIX_SIZE: usize = 15;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum ModelType {
    #[default]
    Std = 0,
    Hierarchy = 1,
    Skeleton = 2,
    Skeleton2 = 3,
    Hierarchy2 = 4,
    Skin = 5,
    Soft = 8,
    ParticlesEffect = 11,
    ParticlesSystem = 12,
    Skeleton3 = 13,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadFlags(pub u32);

impl LoadFlags {
    /// Keep vertex and face buffers; without it only counts are read.
    pub const GEOMETRY: Self = Self(1 << 0);
    /// Keep children flagged as collision meshes.
    pub const COLLISION: Self = Self(1 << 1);
    /// Load the skeleton of skeleton models.
    pub const SKELETON: Self = Self(1 << 2);
    pub const ALL: Self = Self(0x7);

    pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
}

impl Default for LoadFlags {
    fn default() -> Self { LoadFlags::ALL }
}

impl BitOr for LoadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ModelLoadParams {
    /// Replaced by each model's own header version while loading.
    pub format_version: u8,
    pub load_flags: LoadFlags,
    pub game: GameVersion,
}

impl ModelLoadParams {
    pub fn new(load_flags: LoadFlags, game: GameVersion) -> Self { Self { format_version: 0, load_flags, game } }
}

/// Source of files that a model references by name.
pub trait ModelResolver {
    /// Contents of the `.mesh` file for a mesh link, or `None` if not found.
    fn open_mesh(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Contents of a linked skeleton, or `None` if not found.
    fn open_skeleton(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Resolves nothing; linked meshes and skeletons are skipped.
pub struct NoLinks;

impl ModelResolver for NoLinks {
    fn open_mesh(&self, _name: &str) -> Result<Option<Vec<u8>>> { Ok(None) }

    fn open_skeleton(&self, _name: &str) -> Result<Option<Vec<u8>>> { Ok(None) }
}

/// On-disk header. Bounds are stored with X and Z exchanged.
#[binrw]
#[brw(little)]
#[derive(Clone, Debug, Default)]
pub struct ModelHeader {
    pub version: u8,
    pub model_type: u8,
    pub shader_id: u16,
    pub bbox: AABBox,
    pub bsphere: BSphere,
    pub checksum: u32,
    pub inv_lod: f32,
    pub flags: u32,
    pub vscale: f32,
    pub texel_density: f32,
}

/// Fields shared by every model shape.
#[derive(Clone, Debug)]
pub struct ModelBase {
    pub version: u8,
    pub model_type: ModelType,
    pub shader_id: u16,
    pub flags: u32,
    /// For skinned meshes, the bones CRC of the skeleton they were built for.
    pub checksum: u32,
    pub inv_lod: f32,
    /// Vertex scale as stored in the header; see [`ModelBase::vertices_scale`].
    pub header_vscale: f32,
    pub texel_density: f32,
    pub ssa_bias: Option<f32>,
    pub bbox: AABBox,
    pub bsphere: BSphere,
    /// Texture, shader, game material and (from Last Light) source material.
    pub materials: [String; 4],
    pub material_flags: [u16; 2],
    pub is_collision: bool,
}

impl Default for ModelBase {
    fn default() -> Self {
        Self {
            version: MODEL_VERSION_EXODUS,
            model_type: ModelType::Std,
            shader_id: 0,
            flags: 0,
            checksum: 0,
            inv_lod: 0.0,
            header_vscale: 1.0,
            texel_density: 0.0,
            ssa_bias: None,
            bbox: AABBox::EMPTY,
            bsphere: BSphere::default(),
            materials: Default::default(),
            material_flags: [2, 4],
            is_collision: false,
        }
    }
}

impl ModelBase {
    fn read(chunks: &ChunkReader) -> Result<Self> {
        let data = chunks.require(CHUNK_HEADER)?;
        let mut reader = Cursor::new(data);
        let header: ModelHeader = reader.read_le().context("Failed to read model header")?;
        let model_type = ModelType::from_repr(header.model_type)
            .ok_or(DecodeError::ModelType(header.model_type as u16))?;
        let ssa_bias = if data.len() - reader.position() as usize >= 4 {
            Some(read_f32::<LittleEndian, _>(&mut reader)?)
        } else {
            None
        };
        let mut base = ModelBase {
            version: header.version,
            model_type,
            shader_id: header.shader_id,
            flags: header.flags,
            checksum: header.checksum,
            inv_lod: header.inv_lod,
            header_vscale: header.vscale,
            texel_density: header.texel_density,
            ssa_bias,
            bbox: AABBox::new(swizzle_vec3(header.bbox.min), swizzle_vec3(header.bbox.max)),
            bsphere: BSphere::new(swizzle_vec3(header.bsphere.center), header.bsphere.radius),
            ..Default::default()
        };

        if let Some(data) = chunks.get(CHUNK_MATERIALS) {
            let mut reader = Cursor::new(data);
            for slot in base.materials.iter_mut().take(3) {
                *slot = read_stringz(&mut reader)?;
            }
            if base.version >= MODEL_VERSION_LAST_LIGHT {
                base.materials[3] = read_stringz(&mut reader)?;
                base.material_flags = [
                    read_u16::<LittleEndian, _>(&mut reader)?,
                    read_u16::<LittleEndian, _>(&mut reader)?,
                ];
                base.is_collision = base.materials[3].contains("collision");
            }
        }
        Ok(base)
    }

    fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + Seek {
        let header = ModelHeader {
            version: self.version,
            model_type: self.model_type as u8,
            shader_id: self.shader_id,
            bbox: AABBox::new(swizzle_vec3(self.bbox.min), swizzle_vec3(self.bbox.max)),
            bsphere: BSphere::new(swizzle_vec3(self.bsphere.center), self.bsphere.radius),
            checksum: self.checksum,
            inv_lod: self.inv_lod,
            flags: self.flags,
            vscale: self.header_vscale,
            texel_density: self.texel_density,
        };
        write_chunk(w, CHUNK_HEADER, |w| {
            w.write_le(&header)?;
            if let Some(ssa_bias) = self.ssa_bias {
                w.write_le(&ssa_bias)?;
            }
            Ok(())
        })?;
        write_chunk(w, CHUNK_MATERIALS, |w| {
            for material in &self.materials[..3] {
                write_stringz(w, material)?;
            }
            if self.version >= MODEL_VERSION_LAST_LIGHT {
                write_stringz(w, &self.materials[3])?;
                w.write_le(&self.material_flags)?;
            }
            Ok(())
        })
    }

    /// Scale applied to quantized skinned positions.
    pub fn vertices_scale(&self) -> f32 {
        if self.version > MODEL_VERSION_EARLY_ARKTIKA1 {
            self.header_vscale
        } else if self.version >= 29 {
            (self.bbox.max - self.bbox.min).abs().max_element()
        } else {
            12.0
        }
    }

    pub fn texture(&self) -> &str { &self.materials[0] }
}

/// Location of a mesh inside the level geometry buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelMeshRef {
    pub vertices_offset: u32,
    pub indices_offset: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ModelMesh {
    pub vertex_type: VertexType,
    pub vertices_count: u32,
    pub shadow_vertices_count: u16,
    pub faces_count: u32,
    pub shadow_faces_count: u16,
    pub vertices_scale: f32,
    /// Raw vertex buffer; empty unless loaded with [`LoadFlags::GEOMETRY`].
    pub vertices: Vec<u8>,
    pub faces: Vec<u8>,
    pub level_ref: Option<LevelMeshRef>,
}

fn check_geometry(mesh: &ModelMesh) -> Result<()> {
    if let Some(stride) = mesh.vertex_type.stride() {
        if !mesh.vertices.is_empty() {
            ensure!(
                mesh.vertices.len() >= mesh.vertices_count as usize * stride,
                "Vertex buffer holds {} bytes, {} vertices need {}",
                mesh.vertices.len(),
                mesh.vertices_count,
                mesh.vertices_count as usize * stride
            );
        }
    }
    if !mesh.faces.is_empty() {
        ensure!(
            mesh.faces.len() >= mesh.faces_count as usize * 6,
            "Face buffer holds {} bytes for {} faces",
            mesh.faces.len(),
            mesh.faces_count
        );
    }
    Ok(())
}

fn remaining<'a>(reader: &Cursor<&'a [u8]>) -> &'a [u8] {
    let data: &'a [u8] = *reader.get_ref();
    &data[(reader.position() as usize).min(data.len())..]
}

#[derive(Clone, Debug, Default)]
pub struct StdModel {
    pub base: ModelBase,
    pub mesh: ModelMesh,
}

impl StdModel {
    fn read(chunks: &ChunkReader, base: ModelBase, params: &ModelLoadParams) -> Result<Self> {
        let version = params.format_version;
        let mut mesh = ModelMesh { vertices_scale: base.vertices_scale(), ..Default::default() };
        if let Some(data) = chunks.get(CHUNK_MESH_REF) {
            let mut reader = Cursor::new(data);
            let mut vertex_type = VertexType::parse(read_u32::<LittleEndian, _>(&mut reader)?)?;
            if vertex_type == VertexType::LevelLegacy {
                log::warn!("Level mesh uses the deprecated vertex format");
                vertex_type = VertexType::Level;
            }
            let vertices_offset = read_u32::<LittleEndian, _>(&mut reader)?;
            mesh.vertices_count = read_u32::<LittleEndian, _>(&mut reader)?;
            let indices_offset = read_u32::<LittleEndian, _>(&mut reader)?;
            mesh.faces_count = read_u32::<LittleEndian, _>(&mut reader)? / 3;
            mesh.vertex_type = vertex_type;
            mesh.level_ref = Some(LevelMeshRef { vertices_offset, indices_offset });
        } else {
            let data = chunks.require(CHUNK_VERTICES)?;
            let mut reader = Cursor::new(data);
            mesh.vertex_type = VertexType::parse(read_u32::<LittleEndian, _>(&mut reader)?)?;
            mesh.vertices_count = read_u32::<LittleEndian, _>(&mut reader)?;
            if version >= MODEL_VERSION_EARLY_ARKTIKA1 {
                mesh.shadow_vertices_count = read_u16::<LittleEndian, _>(&mut reader)?;
            }
            if params.load_flags.contains(LoadFlags::GEOMETRY) {
                mesh.vertices = remaining(&reader).to_vec();
            }

            let data = chunks.require(CHUNK_FACES)?;
            let mut reader = Cursor::new(data);
            if version < MODEL_VERSION_EARLY_ARKTIKA1 {
                mesh.faces_count = read_u32::<LittleEndian, _>(&mut reader)? / 3;
            } else {
                mesh.faces_count = read_u32::<LittleEndian, _>(&mut reader)?;
                mesh.shadow_faces_count = read_u16::<LittleEndian, _>(&mut reader)?;
            }
            if params.load_flags.contains(LoadFlags::GEOMETRY) {
                mesh.faces = remaining(&reader).to_vec();
            }
            check_geometry(&mesh)?;
        }
        Ok(Self { base, mesh })
    }

    fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + Seek {
        let version = self.base.version;
        let mesh = &self.mesh;
        self.base.write(w)?;
        if let Some(level_ref) = &mesh.level_ref {
            return write_chunk(w, CHUNK_MESH_REF, |w| {
                w.write_le(&(mesh.vertex_type as u32))?;
                w.write_le(&level_ref.vertices_offset)?;
                w.write_le(&mesh.vertices_count)?;
                w.write_le(&level_ref.indices_offset)?;
                w.write_le(&(mesh.faces_count * 3))?;
                Ok(())
            });
        }
        write_chunk(w, CHUNK_VERTICES, |w| {
            w.write_le(&(mesh.vertex_type as u32))?;
            w.write_le(&mesh.vertices_count)?;
            if version >= MODEL_VERSION_EARLY_ARKTIKA1 {
                w.write_le(&mesh.shadow_vertices_count)?;
            }
            Ok(w.write_all(&mesh.vertices)?)
        })?;
        write_chunk(w, CHUNK_FACES, |w| {
            if version < MODEL_VERSION_EARLY_ARKTIKA1 {
                w.write_le(&(mesh.faces_count * 3))?;
            } else {
                w.write_le(&mesh.faces_count)?;
                w.write_le(&mesh.shadow_faces_count)?;
            }
            Ok(w.write_all(&mesh.faces)?)
        })
    }
}

/// Oriented bounding box of the vertices influenced by one bone.
#[binrw]
#[brw(little)]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BoneObb {
    pub rotation: [f32; 9],
    pub offset: [f32; 3],
    pub half_size: [f32; 3],
}

#[derive(Clone, Debug, Default)]
pub struct SkinModel {
    pub base: ModelBase,
    pub mesh: ModelMesh,
    /// Maps `vertex bone index / 3` to a skeleton bone.
    pub bone_remap: Vec<u8>,
    pub bone_obbs: Vec<BoneObb>,
    /// Bones CRC of the skeleton model this skin was attached to.
    pub parent_bones_crc: Option<u32>,
}

impl SkinModel {
    fn read(chunks: &ChunkReader, base: ModelBase, params: &ModelLoadParams) -> Result<Self> {
        let version = params.format_version;
        let data = chunks.require(CHUNK_SKINNED_VERTICES)?;
        let mut reader = Cursor::new(data);
        let num_bones = read_u8(&mut reader)? as usize;
        let mut bone_remap = vec![0u8; num_bones];
        reader.read_exact(&mut bone_remap)?;
        let mut bone_obbs = Vec::with_capacity(num_bones);
        for _ in 0..num_bones {
            bone_obbs.push(reader.read_le::<BoneObb>()?);
        }

        let mut mesh = ModelMesh {
            vertex_type: VertexType::Skin,
            vertices_scale: base.vertices_scale(),
            ..Default::default()
        };
        mesh.vertices_count = read_u32::<LittleEndian, _>(&mut reader)?;
        if version >= MODEL_VERSION_EARLY_ARKTIKA1 {
            mesh.shadow_vertices_count = read_u16::<LittleEndian, _>(&mut reader)?;
        }
        if params.load_flags.contains(LoadFlags::GEOMETRY) {
            mesh.vertices = remaining(&reader).to_vec();
        }

        let data = chunks.require(CHUNK_FACES)?;
        let mut reader = Cursor::new(data);
        if version < MODEL_VERSION_LAST_LIGHT {
            mesh.faces_count = read_u32::<LittleEndian, _>(&mut reader)? / 3;
        } else {
            mesh.faces_count = read_u16::<LittleEndian, _>(&mut reader)? as u32;
            mesh.shadow_faces_count = read_u16::<LittleEndian, _>(&mut reader)?;
        }
        if params.load_flags.contains(LoadFlags::GEOMETRY) {
            mesh.faces = remaining(&reader).to_vec();
        }
        check_geometry(&mesh)?;
        Ok(Self { base, mesh, bone_remap, bone_obbs, parent_bones_crc: None })
    }

    fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + Seek {
        let version = self.base.version;
        let mesh = &self.mesh;
        ensure!(
            self.bone_remap.len() <= u8::MAX as usize && self.bone_obbs.len() == self.bone_remap.len(),
            "Skin has {} remapped bones and {} OBBs",
            self.bone_remap.len(),
            self.bone_obbs.len()
        );
        self.base.write(w)?;
        write_chunk(w, CHUNK_SKINNED_VERTICES, |w| {
            w.write_le(&(self.bone_remap.len() as u8))?;
            w.write_all(&self.bone_remap)?;
            for obb in &self.bone_obbs {
                w.write_le(obb)?;
            }
            w.write_le(&mesh.vertices_count)?;
            if version >= MODEL_VERSION_EARLY_ARKTIKA1 {
                w.write_le(&mesh.shadow_vertices_count)?;
            }
            Ok(w.write_all(&mesh.vertices)?)
        })?;
        write_chunk(w, CHUNK_FACES, |w| {
            if version < MODEL_VERSION_LAST_LIGHT {
                w.write_le(&(mesh.faces_count * 3))?;
            } else {
                w.write_le(&u16::try_from(mesh.faces_count)?)?;
                w.write_le(&mesh.shadow_faces_count)?;
            }
            Ok(w.write_all(&mesh.faces)?)
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TexturePresetItem {
    pub mtl_name: String,
    pub t_dst: String,
    pub s_dst: String,
}

/// A named set of texture/shader substitutions keyed by source material.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TexturePreset {
    pub name: String,
    pub hit_preset: String,
    pub voice: String,
    pub flags: u32,
    pub items: Vec<TexturePresetItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelComment {
    pub prefix: Vec<u8>,
    pub title: String,
    pub body: String,
}

impl ModelComment {
    pub fn text(&self) -> String {
        if self.title.is_empty() {
            self.body.clone()
        } else {
            format!("{}\n\n{}", self.title, self.body)
        }
    }
}

/// Model-level data carried by hierarchy and skeleton models.
#[derive(Clone, Debug, Default)]
pub struct ModelExtras {
    pub texture_replacements: IndexMap<String, String>,
    pub texture_presets: Vec<TexturePreset>,
    pub comment: Option<ModelComment>,
}

impl ModelExtras {
    fn read(chunks: &ChunkReader, version: u8) -> Result<Self> {
        let mut extras = Self::default();
        if let Some(data) = chunks.get(CHUNK_TEXTURE_REPLACEMENTS) {
            let list = read_stringz(&mut Cursor::new(data))?;
            extras.texture_replacements = parse_replacements(&list);
        }
        if let Some(data) = chunks.get(CHUNK_TEXTURE_PRESETS) {
            extras.texture_presets = read_presets(data, version).context("Failed to read texture presets")?;
        }
        if let Some(data) = chunks.get(CHUNK_COMMENT) {
            if data.len() > COMMENT_PREFIX_SIZE {
                let mut reader = Cursor::new(&data[COMMENT_PREFIX_SIZE..]);
                let title = read_stringz(&mut reader)?;
                let body = read_stringz(&mut reader)?;
                extras.comment =
                    Some(ModelComment { prefix: data[..COMMENT_PREFIX_SIZE].to_vec(), title, body });
            }
        }
        Ok(extras)
    }

    fn write<W>(&self, w: &mut W, version: u8) -> Result<()>
    where W: Write + Seek {
        if !self.texture_replacements.is_empty() {
            let list = self
                .texture_replacements
                .iter()
                .map(|(from, to)| format!("{from}={to}"))
                .collect::<Vec<_>>()
                .join(",");
            write_chunk(w, CHUNK_TEXTURE_REPLACEMENTS, |w| Ok(write_stringz(w, &list)?))?;
        }
        if !self.texture_presets.is_empty() {
            write_chunk(w, CHUNK_TEXTURE_PRESETS, |w| write_presets(w, &self.texture_presets, version))?;
        }
        if let Some(comment) = &self.comment {
            let mut prefix = comment.prefix.clone();
            prefix.resize(COMMENT_PREFIX_SIZE, 0);
            write_chunk(w, CHUNK_COMMENT, |w| {
                w.write_all(&prefix)?;
                write_stringz(w, &comment.title)?;
                write_stringz(w, &comment.body)?;
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Parses `from=to,from=to`. Entries without `=` are ignored.
pub fn parse_replacements(list: &str) -> IndexMap<String, String> {
    list.split(',')
        .filter_map(|entry| entry.split_once('='))
        .map(|(from, to)| (from.to_owned(), to.to_owned()))
        .collect()
}

fn read_presets(data: &[u8], version: u8) -> Result<Vec<TexturePreset>> {
    let mut reader = Cursor::new(data);
    let count = read_u16::<LittleEndian, _>(&mut reader)?;
    let mut presets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut preset = TexturePreset {
            name: read_stringz(&mut reader)?,
            hit_preset: read_stringz(&mut reader)?,
            ..Default::default()
        };
        if version >= MODEL_VERSION_LAST_LIGHT_RELEASE {
            preset.voice = read_stringz(&mut reader)?;
        }
        if version >= MODEL_VERSION_REDUX {
            preset.flags = read_u32::<LittleEndian, _>(&mut reader)?;
        }
        let num_items = read_u16::<LittleEndian, _>(&mut reader)?;
        for _ in 0..num_items {
            preset.items.push(TexturePresetItem {
                mtl_name: read_stringz(&mut reader)?,
                t_dst: read_stringz(&mut reader)?,
                s_dst: read_stringz(&mut reader)?,
            });
        }
        presets.push(preset);
    }
    Ok(presets)
}

fn write_presets<W>(w: &mut W, presets: &[TexturePreset], version: u8) -> Result<()>
where W: Write + Seek {
    w.write_le(&u16::try_from(presets.len())?)?;
    for preset in presets {
        write_stringz(w, &preset.name)?;
        write_stringz(w, &preset.hit_preset)?;
        if version >= MODEL_VERSION_LAST_LIGHT_RELEASE {
            write_stringz(w, &preset.voice)?;
        }
        if version >= MODEL_VERSION_REDUX {
            w.write_le(&preset.flags)?;
        }
        w.write_le(&u16::try_from(preset.items.len())?)?;
        for item in &preset.items {
            write_stringz(w, &item.mtl_name)?;
            write_stringz(w, &item.t_dst)?;
            write_stringz(w, &item.s_dst)?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct HierarchyModel {
    pub base: ModelBase,
    pub children: Vec<Model>,
    /// Children stored as indices into level geometry instead of inline.
    pub child_refs: Vec<u32>,
    pub lods: Vec<Model>,
    pub extras: ModelExtras,
}

impl HierarchyModel {
    fn read(
        chunks: &ChunkReader,
        base: ModelBase,
        params: &ModelLoadParams,
        resolver: &dyn ModelResolver,
    ) -> Result<Self> {
        let mut model = Self { base, ..Default::default() };
        if let Some(data) = chunks.get(CHUNK_CHILDREN_REFS) {
            let mut reader = Cursor::new(data);
            let count = read_u32::<LittleEndian, _>(&mut reader)?;
            ensure!(count as usize <= data.len() / 4, "Children refs count {} exceeds chunk", count);
            for _ in 0..count {
                model.child_refs.push(read_u32::<LittleEndian, _>(&mut reader)?);
            }
        } else if let Some(data) = chunks.get(CHUNK_CHILDREN) {
            for (idx, (id, child_data)) in ChunkReader::new(data)?.iter().enumerate() {
                if id as usize != idx {
                    log::warn!("Skipping child chunk {} at index {}", id, idx);
                    continue;
                }
                let child = Model::load(child_data, *params, resolver)
                    .with_context(|| format!("Failed to load child {}", idx))?;
                if child.base().is_collision && !params.load_flags.contains(LoadFlags::COLLISION) {
                    continue;
                }
                model.add_child(child);
            }
        }
        for id in [CHUNK_LOD_1, CHUNK_LOD_2] {
            if let Some(data) = chunks.get(id) {
                let lod = Model::load(data, *params, resolver)
                    .with_context(|| format!("Failed to load LOD chunk {}", id))?;
                model.lods.push(lod);
            }
        }
        model.extras = ModelExtras::read(chunks, model.base.version)?;
        Ok(model)
    }

    /// Appends a child, growing this model's bounds to include it.
    pub fn add_child(&mut self, child: Model) {
        self.base.bbox.absorb(&child.base().bbox);
        self.base.bsphere.absorb(&child.base().bsphere);
        self.children.push(child);
    }

    fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + Seek {
        self.base.write(w)?;
        if !self.child_refs.is_empty() {
            write_chunk(w, CHUNK_CHILDREN_REFS, |w| {
                w.write_le(&u32::try_from(self.child_refs.len())?)?;
                for child_ref in &self.child_refs {
                    w.write_le(child_ref)?;
                }
                Ok(())
            })?;
        } else {
            write_chunk(w, CHUNK_CHILDREN, |w| {
                for (idx, child) in self.children.iter().enumerate() {
                    write_chunk(w, idx as u32, |w| child.write(w))?;
                }
                Ok(())
            })?;
        }
        for (lod, id) in self.lods.iter().zip([CHUNK_LOD_1, CHUNK_LOD_2]) {
            write_chunk(w, id, |w| lod.write(w))?;
        }
        self.extras.write(w, self.base.version)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SkeletonModel {
    pub base: ModelBase,
    /// Skinned meshes per LOD. Each entry is a whole mesh model whose
    /// children are [`SkinModel`]s.
    pub lod_meshes: [Vec<Model>; MAX_LODS],
    /// Mesh names per LOD when the meshes were linked rather than inline.
    pub mesh_links: [Vec<String>; MAX_LODS],
    pub skeleton: Option<Skeleton>,
    pub skeleton_ref: String,
    /// Save the skeleton as a link to `skeleton_ref` instead of inline.
    pub link_skeleton: bool,
    pub extras: ModelExtras,
}

impl SkeletonModel {
    fn read(
        chunks: &ChunkReader,
        base: ModelBase,
        params: &ModelLoadParams,
        resolver: &dyn ModelResolver,
    ) -> Result<Self> {
        let mut model = Self { base, ..Default::default() };

        if let Some(data) = chunks.get(CHUNK_SKELETON_LINK) {
            model.skeleton_ref = read_stringz(&mut Cursor::new(data))?;
            model.link_skeleton = true;
            if params.load_flags.contains(LoadFlags::SKELETON) {
                match resolver.open_skeleton(&model.skeleton_ref)? {
                    Some(data) => model.skeleton = parse_skeleton(&data, params.game),
                    None => log::warn!("Skeleton '{}' not found", model.skeleton_ref),
                }
            }
        } else if let Some(data) = chunks.get(CHUNK_SKELETON_INLINE) {
            if params.load_flags.contains(LoadFlags::SKELETON) {
                model.skeleton = parse_skeleton(data, params.game);
            }
        }

        let mut lods: [Vec<Model>; MAX_LODS] = Default::default();
        if let Some(data) = chunks.get(CHUNK_MESHES_LINKS) {
            let mut reader = Cursor::new(data);
            let _count = read_u32::<LittleEndian, _>(&mut reader)?;
            for (lod, links) in model.mesh_links.iter_mut().enumerate() {
                if remaining(&reader).is_empty() {
                    break;
                }
                *links = read_stringz(&mut reader)?
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect();
                for name in links.iter() {
                    let Some(mesh_data) = resolver.open_mesh(name)? else {
                        log::warn!("LOD {} mesh '{}' not found", lod, name);
                        continue;
                    };
                    let mesh = Model::load(&mesh_data, *params, resolver)
                        .with_context(|| format!("Failed to load mesh '{}'", name))?;
                    lods[lod].push(mesh);
                }
            }
        } else if let Some(data) = chunks.get(CHUNK_MESHES_INLINE) {
            for (lod, (id, lod_data)) in ChunkReader::new(data)?.iter().enumerate().take(MAX_LODS) {
                if id as usize != lod {
                    log::warn!("Skipping LOD chunk {} at index {}", id, lod);
                    continue;
                }
                for (idx, (mesh_id, mesh_data)) in ChunkReader::new(lod_data)?.iter().enumerate() {
                    if mesh_id as usize != idx {
                        log::warn!("Skipping LOD {} mesh chunk {} at index {}", lod, mesh_id, idx);
                        continue;
                    }
                    let mesh = Model::load(mesh_data, *params, resolver)
                        .with_context(|| format!("Failed to load LOD {} mesh {}", lod, idx))?;
                    lods[lod].push(mesh);
                }
            }
        }
        for (lod, meshes) in lods.into_iter().enumerate() {
            model.accept_lod(lod, meshes);
        }

        model.extras = ModelExtras::read(chunks, model.base.version)?;
        Ok(model)
    }

    /// Installs the meshes of one LOD. If a skeleton is loaded, every mesh
    /// must carry its bones CRC; otherwise the whole LOD is dropped.
    fn accept_lod(&mut self, lod: usize, mut meshes: Vec<Model>) {
        if let Some(skeleton) = &self.skeleton {
            let expected = skeleton.bones_crc();
            for mesh in &meshes {
                let found = mesh.base().checksum;
                if found != expected {
                    log::error!("Rejecting LOD {}: {}", lod, DecodeError::BonesCrcMismatch { expected, found });
                    return;
                }
            }
            for mesh in &mut meshes {
                mesh.for_each_skin_mut(&mut |skin| skin.parent_bones_crc = Some(expected));
            }
        }
        self.lod_meshes[lod] = meshes;
    }

    /// Number of LODs beyond the base one that have meshes.
    pub fn lod_count(&self) -> usize { self.lod_meshes[1..].iter().filter(|m| !m.is_empty()).count() }

    fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + Seek {
        self.base.write(w)?;
        let num_lods = self.lod_meshes.iter().rposition(|m| !m.is_empty()).map_or(0, |i| i + 1);
        if num_lods > 0 {
            write_chunk(w, CHUNK_MESHES_INLINE, |w| {
                for (lod, meshes) in self.lod_meshes[..num_lods].iter().enumerate() {
                    write_chunk(w, lod as u32, |w| {
                        for (idx, mesh) in meshes.iter().enumerate() {
                            write_chunk(w, idx as u32, |w| mesh.write(w))?;
                        }
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
        }
        if self.link_skeleton && !self.skeleton_ref.is_empty() {
            write_chunk(w, CHUNK_SKELETON_LINK, |w| Ok(write_stringz(w, &self.skeleton_ref)?))?;
        } else if let Some(skeleton) = &self.skeleton {
            write_chunk_data(w, CHUNK_SKELETON_INLINE, &skeleton.save()?)?;
        }
        self.extras.write(w, self.base.version)
    }
}

fn parse_skeleton(data: &[u8], game: GameVersion) -> Option<Skeleton> {
    let result = if game == GameVersion::Og2033 { Skeleton::load_2033(data) } else { Skeleton::load(data) };
    match result {
        Ok(skeleton) => Some(skeleton),
        Err(e) => {
            log::warn!("Failed to load skeleton: {e:?}");
            None
        }
    }
}

#[derive(Clone, Debug)]
pub enum Model {
    Std(StdModel),
    Skin(SkinModel),
    Hierarchy(HierarchyModel),
    Skeleton(SkeletonModel),
}

/// One drawable mesh, borrowed from the model that owns it.
#[derive(Copy, Clone, Debug)]
pub struct GeomData<'a> {
    pub bbox: AABBox,
    pub bsphere: BSphere,
    pub texture: &'a str,
    pub mesh: &'a ModelMesh,
    pub model: &'a Model,
}

impl GeomData<'_> {
    pub fn vertices(&self) -> Result<Vec<MeshVertex>> {
        let remap = match self.model {
            Model::Skin(skin) => skin.bone_remap.as_slice(),
            _ => &[],
        };
        decode_vertices(
            &self.mesh.vertices,
            self.mesh.vertex_type,
            self.mesh.vertices_count as usize,
            self.mesh.vertices_scale,
            remap,
        )
    }

    pub fn faces(&self) -> Result<Vec<[u16; 3]>> {
        decode_faces(&self.mesh.faces, self.mesh.faces_count as usize)
    }
}

impl Model {
    pub fn load(data: &[u8], params: ModelLoadParams, resolver: &dyn ModelResolver) -> Result<Self> {
        let chunks = ChunkReader::new(data)?;
        let base = ModelBase::read(&chunks)?;
        let params = ModelLoadParams { format_version: base.version, ..params };
        let mut model = match base.model_type {
            ModelType::Std => Model::Std(StdModel::read(&chunks, base, &params)?),
            ModelType::Skin => Model::Skin(SkinModel::read(&chunks, base, &params)?),
            ModelType::Hierarchy | ModelType::Hierarchy2 => {
                Model::Hierarchy(HierarchyModel::read(&chunks, base, &params, resolver)?)
            }
            ModelType::Skeleton | ModelType::Skeleton2 | ModelType::Skeleton3 => {
                Model::Skeleton(SkeletonModel::read(&chunks, base, &params, resolver)?)
            }
            other => return Err(DecodeError::ModelType(other as u16).into()),
        };
        if params.format_version < MODEL_VERSION_LAST_LIGHT {
            model.replace_textures();
        }
        log::debug!(
            "Model v{} {:?}: {} meshes",
            model.base().version,
            model.base().model_type,
            model.collect_geom_data(0).len()
        );
        Ok(model)
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let mut w = Cursor::new(Vec::new());
        self.write(&mut w)?;
        Ok(w.into_inner())
    }

    fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + Seek {
        match self {
            Model::Std(model) => model.write(w),
            Model::Skin(model) => model.write(w),
            Model::Hierarchy(model) => model.write(w),
            Model::Skeleton(model) => model.write(w),
        }
    }

    pub fn base(&self) -> &ModelBase {
        match self {
            Model::Std(model) => &model.base,
            Model::Skin(model) => &model.base,
            Model::Hierarchy(model) => &model.base,
            Model::Skeleton(model) => &model.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut ModelBase {
        match self {
            Model::Std(model) => &mut model.base,
            Model::Skin(model) => &mut model.base,
            Model::Hierarchy(model) => &mut model.base,
            Model::Skeleton(model) => &mut model.base,
        }
    }

    pub fn mesh(&self) -> Option<&ModelMesh> {
        match self {
            Model::Std(model) => Some(&model.mesh),
            Model::Skin(model) => Some(&model.mesh),
            _ => None,
        }
    }

    pub fn extras(&self) -> Option<&ModelExtras> {
        match self {
            Model::Hierarchy(model) => Some(&model.extras),
            Model::Skeleton(model) => Some(&model.extras),
            _ => None,
        }
    }

    pub fn skeleton(&self) -> Option<&Skeleton> {
        match self {
            Model::Skeleton(model) => model.skeleton.as_ref(),
            _ => None,
        }
    }

    pub fn lod_count(&self) -> usize {
        match self {
            Model::Hierarchy(model) => model.lods.len(),
            Model::Skeleton(model) => model.lod_count(),
            _ => 0,
        }
    }

    /// Meshes to draw for `lod` (0 is the full detail model).
    pub fn collect_geom_data(&self, lod: usize) -> Vec<GeomData<'_>> {
        let mut out = Vec::new();
        self.collect_geom_data_into(lod, &mut out);
        out
    }

    fn collect_geom_data_into<'a>(&'a self, lod: usize, out: &mut Vec<GeomData<'a>>) {
        match self {
            Model::Std(StdModel { base, mesh }) | Model::Skin(SkinModel { base, mesh, .. }) => {
                if lod == 0 {
                    out.push(GeomData {
                        bbox: base.bbox,
                        bsphere: base.bsphere,
                        texture: base.texture(),
                        mesh,
                        model: self,
                    });
                }
            }
            Model::Hierarchy(model) => {
                if lod == 0 {
                    for child in &model.children {
                        child.collect_geom_data_into(0, out);
                    }
                } else if let Some(lod_model) = model.lods.get(lod - 1) {
                    lod_model.collect_geom_data_into(0, out);
                }
            }
            Model::Skeleton(model) => {
                for mesh in model.lod_meshes.get(lod).into_iter().flatten() {
                    mesh.collect_geom_data_into(0, out);
                }
            }
        }
    }

    /// Visits the base of every mesh-bearing model in the tree.
    pub fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut ModelBase)) {
        match self {
            Model::Std(model) => f(&mut model.base),
            Model::Skin(model) => f(&mut model.base),
            Model::Hierarchy(model) => {
                for child in model.children.iter_mut().chain(model.lods.iter_mut()) {
                    child.for_each_leaf_mut(f);
                }
            }
            Model::Skeleton(model) => {
                for mesh in model.lod_meshes.iter_mut().flatten() {
                    mesh.for_each_leaf_mut(f);
                }
            }
        }
    }

    fn for_each_skin_mut(&mut self, f: &mut dyn FnMut(&mut SkinModel)) {
        match self {
            Model::Std(_) => {}
            Model::Skin(model) => f(model),
            Model::Hierarchy(model) => {
                for child in model.children.iter_mut().chain(model.lods.iter_mut()) {
                    child.for_each_skin_mut(f);
                }
            }
            Model::Skeleton(model) => {
                for mesh in model.lod_meshes.iter_mut().flatten() {
                    mesh.for_each_skin_mut(f);
                }
            }
        }
    }

    /// Substitutes texture names through the texture-replacement table.
    fn replace_textures(&mut self) {
        let Some(replacements) = self.extras().map(|e| e.texture_replacements.clone()) else {
            return;
        };
        if replacements.is_empty() {
            return;
        }
        self.for_each_leaf_mut(&mut |base| {
            if let Some(texture) = replacements.get(&base.materials[0]) {
                base.materials[0] = texture.clone();
            }
        });
    }

    /// Applies the texture preset `name` to every mesh whose source material
    /// has an entry in it. Returns false if there is no such preset.
    pub fn apply_texture_preset(&mut self, name: &str) -> bool {
        let Some(preset) =
            self.extras().and_then(|e| e.texture_presets.iter().find(|p| p.name == name)).cloned()
        else {
            return false;
        };
        self.for_each_leaf_mut(&mut |base| {
            if base.materials[3].is_empty() {
                return;
            }
            let Some(item) = preset.items.iter().find(|item| item.mtl_name == base.materials[3]) else {
                return;
            };
            if !item.t_dst.is_empty() {
                base.materials[0] = item.t_dst.clone();
            }
            if !item.s_dst.is_empty() {
                base.materials[1] = item.s_dst.clone();
            }
        });
        true
    }
}
