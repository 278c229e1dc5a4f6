use std::io::Cursor;

use anyhow::{ensure, Context, Result};
use binrw::{binrw, BinReaderExt, NullString};
use glam::{Mat4, Quat, Vec3};
use zerocopy::LittleEndian;

use crate::{
    format::{
        bin_archive::{BinArchive, BinArchiveWriter, HeaderSize},
        chunk::ChunkReader,
        reflection::{
            array, member, serialize_struct, struct_array, ArrayPrefix, Bool8,
            JsonReflectionReader, JsonReflectionWriter, Reflect, ReflectionFlags,
            ReflectionStream, UserData,
        },
    },
    util::{
        crc32::Crc32,
        math::{quat_from_euler, swizzle_quat, swizzle_vec3, AABBox},
        read::{read_stringz, read_u16, read_u32},
    },
};

const SECTION: &str = "skeleton";

// Metro 2033 chunk ids
const CHUNK_2033_VERSION: u32 = 1;
const CHUNK_2033_BONES: u32 = 13;
const CHUNK_2033_LOCATORS: u32 = 14;
const CHUNK_2033_MOTIONS: u32 = 19;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bone {
    pub name: String,
    pub parent: String,
    pub q: Quat,
    pub t: Vec3,
    /// Body part
    pub bp: u8,
    pub bpf: u8,
}

impl Reflect for Bone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "parent", &mut self.parent)?;
        member(s, "q", &mut self.q)?;
        member(s, "t", &mut self.t)?;
        if s.user_data().format_version > 18 {
            member(s, "bp", &mut self.bp)?;
            member(s, "bpf", &mut self.bpf)?;
        } else {
            let mut bp = u16::from(self.bp);
            member(s, "bp", &mut bp)?;
            self.bp = (bp & 0xFF) as u8;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Locator {
    pub name: String,
    pub parent: String,
    pub q: Quat,
    pub t: Vec3,
    pub fl: Bool8,
}

impl Reflect for Locator {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "parent", &mut self.parent)?;
        member(s, "q", &mut self.q)?;
        member(s, "t", &mut self.t)?;
        member(s, "fl", &mut self.fl)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuxBone {
    pub name: String,
    pub parent: String,
    pub q: Quat,
    pub t: Vec3,
}

impl Reflect for AuxBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "parent", &mut self.parent)?;
        member(s, "q", &mut self.q)?;
        member(s, "t", &mut self.t)
    }
}

/// Maps a bone of this skeleton onto a bone of the parent skeleton.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParentMapped {
    pub parent_bone: String,
    pub self_bone: String,
    pub q: Quat,
    pub t: Vec3,
    pub s: Vec3,
}

impl Reflect for ParentMapped {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "parent_bone", &mut self.parent_bone)?;
        member(s, "self_bone", &mut self.self_bone)?;
        member(s, "q", &mut self.q)?;
        member(s, "t", &mut self.t)?;
        member(s, "s", &mut self.s)
    }
}

/// Procedural bone entry. `kind` and `index` address one of the typed
/// procedural arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProceduralBone {
    pub name: String,
    pub parent: String,
    pub kind: u16,
    pub index: u16,
}

impl Reflect for ProceduralBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "parent", &mut self.parent)?;
        member(s, "type", &mut self.kind)?;
        member(s, "index", &mut self.index)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrivenBone {
    pub bone: String,
    pub driver: String,
    pub driver_parent: String,
    pub component: u8,
    pub twister: String,
    pub value_min: f32,
    pub value_max: f32,
}

impl Reflect for DrivenBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "bone", &mut self.bone)?;
        member(s, "driver", &mut self.driver)?;
        member(s, "driver_parent", &mut self.driver_parent)?;
        member(s, "component", &mut self.component)?;
        member(s, "twister", &mut self.twister)?;
        member(s, "value_min", &mut self.value_min)?;
        member(s, "value_max", &mut self.value_max)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicBone {
    pub bone: String,
    pub inertia: f32,
    pub damping: f32,
    pub constraints: Vec3,
}

impl Reflect for DynamicBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "bone", &mut self.bone)?;
        member(s, "inertia", &mut self.inertia)?;
        member(s, "damping", &mut self.damping)?;
        member(s, "constraints", &mut self.constraints)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstrainedBone {
    pub bone: String,
    pub target: String,
    pub weight: f32,
    pub axes: Bool8,
}

impl Reflect for ConstrainedBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "bone", &mut self.bone)?;
        member(s, "target", &mut self.target)?;
        member(s, "weight", &mut self.weight)?;
        member(s, "axes", &mut self.axes)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamBone {
    pub bone: String,
    pub param: String,
    pub value_min: f32,
    pub value_max: f32,
}

impl Reflect for ParamBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "bone", &mut self.bone)?;
        member(s, "param", &mut self.param)?;
        member(s, "value_min", &mut self.value_min)?;
        member(s, "value_max", &mut self.value_max)
    }
}

/// Contents of the nested `procedural` section, versioned on its own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProceduralBones {
    pub ver: u32,
    pub procedural_bones: Vec<ProceduralBone>,
    pub driven_bones: Vec<DrivenBone>,
    pub dynamic_bones: Vec<DynamicBone>,
    pub constrained_bones: Vec<ConstrainedBone>,
    pub param_bones: Vec<ParamBone>,
}

impl Reflect for ProceduralBones {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "ver", &mut self.ver)?;
        s.set_user_data(UserData { procedural_version: self.ver, ..s.user_data() });
        let ver = s.user_data().procedural_version;
        struct_array(s, "procedural_bones", &mut self.procedural_bones)?;
        struct_array(s, "driven_bones", &mut self.driven_bones)?;
        if ver >= 1 {
            struct_array(s, "dynamic_bones", &mut self.dynamic_bones)?;
        }
        if ver >= 2 {
            struct_array(s, "constrained_bones", &mut self.constrained_bones)?;
        }
        if ver >= 3 {
            struct_array(s, "param_bones", &mut self.param_bones)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Partition {
    pub name: String,
    /// Per-bone influence
    pub infl: Vec<u8>,
}

impl Reflect for Partition {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        array(s, "infl", &mut self.infl, ArrayPrefix::U32)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IkChain {
    pub name: String,
    pub b0: u16,
    pub b1: u16,
    pub b2: u16,
    pub knee_dir: Vec3,
    pub knee_lim: f32,
}

impl Reflect for IkChain {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "b0", &mut self.b0)?;
        member(s, "b1", &mut self.b1)?;
        member(s, "b2", &mut self.b2)?;
        member(s, "knee_dir", &mut self.knee_dir)?;
        member(s, "knee_lim", &mut self.knee_lim)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FixedBone {
    pub id: String,
}

impl Reflect for FixedBone {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> { member(s, "id", &mut self.id) }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkelParam {
    pub name: String,
    pub b: f32,
    pub e: f32,
    pub looped: bool,
}

impl Reflect for SkelParam {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "b", &mut self.b)?;
        member(s, "e", &mut self.e)?;
        member(s, "loop", &mut self.looped)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightedMotion {
    pub m: String,
    pub w: f32,
}

impl Reflect for WeightedMotion {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "m", &mut self.m)?;
        member(s, "w", &mut self.w)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MotionsCollection {
    pub name: String,
    pub path: String,
    pub mots: Vec<WeightedMotion>,
}

impl Reflect for MotionsCollection {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "name", &mut self.name)?;
        member(s, "path", &mut self.path)?;
        struct_array(s, "mots", &mut self.mots)
    }
}

/// A bone, locator or aux bone addressed through the unified index space.
#[derive(Copy, Clone, Debug)]
pub enum AttachPoint<'a> {
    Bone(&'a Bone),
    Locator(&'a Locator),
    AuxBone(&'a AuxBone),
}

impl<'a> AttachPoint<'a> {
    pub fn name(self) -> &'a str {
        match self {
            AttachPoint::Bone(b) => &b.name,
            AttachPoint::Locator(l) => &l.name,
            AttachPoint::AuxBone(a) => &a.name,
        }
    }

    pub fn parent(self) -> &'a str {
        match self {
            AttachPoint::Bone(b) => &b.parent,
            AttachPoint::Locator(l) => &l.parent,
            AttachPoint::AuxBone(a) => &a.parent,
        }
    }

    pub fn rotation(self) -> Quat {
        match self {
            AttachPoint::Bone(b) => b.q,
            AttachPoint::Locator(l) => l.q,
            AttachPoint::AuxBone(a) => a.q,
        }
    }

    pub fn position(self) -> Vec3 {
        match self {
            AttachPoint::Bone(b) => b.t,
            AttachPoint::Locator(l) => l.t,
            AttachPoint::AuxBone(a) => a.t,
        }
    }
}

/// Skeleton in engine convention: rotations are the mathematical local
/// rotations (the stored quaternions are their conjugates).
///
/// Index-based accessors address bones `[0, B)`, then locators
/// `[B, B + L)`, then aux bones.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Skeleton {
    pub ver: u32,
    pub crc: u32,
    pub facefx: String,
    pub pfnn: String,
    pub has_as: bool,
    /// Comma-separated motion folders
    pub motions: String,
    pub source_info: String,
    pub parent_skeleton: String,
    pub parent_bone_maps: Vec<ParentMapped>,
    pub bones: Vec<Bone>,
    pub locators: Vec<Locator>,
    pub aux_bones: Vec<AuxBone>,
    pub procedural: ProceduralBones,
    pub partitions: Vec<Partition>,
    pub ik_chains: Vec<IkChain>,
    pub fixed_bones: Vec<FixedBone>,
    pub params: Vec<SkelParam>,
    pub mcolls: Vec<MotionsCollection>,

    parent_indices: Vec<Option<usize>>,
    bind_pose: Vec<Mat4>,
    inv_bind_pose: Vec<Mat4>,
}

/// The stored layout, without any rotation convention applied.
impl Reflect for Skeleton {
    fn reflect(&mut self, s: &mut dyn ReflectionStream) -> Result<()> {
        member(s, "ver", &mut self.ver)?;
        member(s, "crc", &mut self.crc)?;
        s.set_user_data(UserData { format_version: self.ver, procedural_version: 0 });
        let ver = self.ver;

        if ver <= 14 {
            member(s, "facefx", &mut self.facefx)?;
        } else {
            member(s, "pfnn", &mut self.pfnn)?;
        }
        if ver > 20 {
            member(s, "has_as", &mut self.has_as)?;
        }
        member(s, "motions", &mut self.motions)?;
        if ver > 12 {
            member(s, "source_info", &mut self.source_info)?;
        }
        if ver > 13 {
            member(s, "parent_skeleton", &mut self.parent_skeleton)?;
            struct_array(s, "parent_bone_maps", &mut self.parent_bone_maps)?;
        }
        struct_array(s, "bones", &mut self.bones)?;
        struct_array(s, "locators", &mut self.locators)?;
        if ver >= 6 {
            struct_array(s, "aux_bones", &mut self.aux_bones)?;
        }
        if ver >= 11 {
            serialize_struct(s, "procedural", &mut self.procedural)?;
            struct_array(s, "partitions", &mut self.partitions)?;
            struct_array(s, "ik_chains", &mut self.ik_chains)?;
            struct_array(s, "fixed_bones", &mut self.fixed_bones)?;
            struct_array(s, "params", &mut self.params)?;
            struct_array(s, "mcolls", &mut self.mcolls)?;
        }
        Ok(())
    }
}

#[binrw]
#[brw(little)]
struct LegacyBone {
    name: NullString,
    parent: NullString,
    euler: [f32; 3],
    t: [f32; 3],
    bp: u16,
}

#[binrw]
#[brw(little)]
struct LegacyLocator {
    name: NullString,
    parent: NullString,
    euler: [f32; 3],
    t: [f32; 3],
}

fn lossy(s: &NullString) -> String { String::from_utf8_lossy(&s.0).into_owned() }

fn legacy_rotation(euler: [f32; 3]) -> Quat {
    let [x, y, z] = euler;
    quat_from_euler(-z, -y, -x)
}

impl Skeleton {
    /// Loads a modern skeleton from a reflected archive.
    pub fn load(data: &[u8]) -> Result<Self> {
        let archive = BinArchive::new(data, HeaderSize::Fixed(0))?;
        let mut reader = archive.reflection_reader()?;
        Self::read(&mut reader)
    }

    pub fn read(s: &mut dyn ReflectionStream) -> Result<Self> {
        let mut skeleton = Skeleton::default();
        let found = serialize_struct(s, SECTION, &mut skeleton)?;
        ensure!(found, "No '{}' section", SECTION);
        skeleton.swap_frame();
        skeleton.rebuild_cache();
        log::debug!(
            "Skeleton v{}: {} bones, {} locators, {} aux bones",
            skeleton.ver,
            skeleton.bones.len(),
            skeleton.locators.len(),
            skeleton.aux_bones.len()
        );
        Ok(skeleton)
    }

    pub fn write(&self, s: &mut dyn ReflectionStream) -> Result<()> {
        let mut stored = self.clone();
        stored.swap_frame();
        serialize_struct(s, SECTION, &mut stored)?;
        Ok(())
    }

    /// Serializes into a strings-table archive.
    pub fn save(&self) -> Result<Vec<u8>> {
        let mut archive = BinArchiveWriter::new(ReflectionFlags::DEFAULT_OUT);
        self.write(&mut archive.reflection_writer())?;
        archive.finalize()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut writer = JsonReflectionWriter::new();
        self.write(&mut writer)?;
        writer.finish()
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let mut reader = JsonReflectionReader::new(value)?;
        Self::read(&mut reader)
    }

    /// Loads the flat chunked layout used by Metro 2033.
    pub fn load_2033(data: &[u8]) -> Result<Self> {
        let chunks = ChunkReader::new(data)?;
        let mut skeleton = Skeleton::default();
        if let Some(version) = chunks.get(CHUNK_2033_VERSION) {
            skeleton.ver = read_u32::<LittleEndian, _>(&mut Cursor::new(version))?;
        }

        let mut reader = Cursor::new(chunks.require(CHUNK_2033_BONES)?);
        skeleton.crc = read_u32::<LittleEndian, _>(&mut reader)?;
        let count = read_u16::<LittleEndian, _>(&mut reader)?;
        for idx in 0..count {
            let bone: LegacyBone =
                reader.read_le().with_context(|| format!("Failed to read bone {idx}"))?;
            skeleton.bones.push(Bone {
                name: lossy(&bone.name),
                parent: lossy(&bone.parent),
                q: legacy_rotation(bone.euler),
                t: swizzle_vec3(Vec3::from_array(bone.t)),
                bp: (bone.bp & 0xFF) as u8,
                bpf: 0,
            });
        }

        if let Some(data) = chunks.get(CHUNK_2033_LOCATORS) {
            let mut reader = Cursor::new(data);
            let count = read_u16::<LittleEndian, _>(&mut reader)?;
            for idx in 0..count {
                let locator: LegacyLocator =
                    reader.read_le().with_context(|| format!("Failed to read locator {idx}"))?;
                skeleton.locators.push(Locator {
                    name: lossy(&locator.name),
                    parent: lossy(&locator.parent),
                    q: legacy_rotation(locator.euler),
                    t: swizzle_vec3(Vec3::from_array(locator.t)),
                    fl: Bool8::default(),
                });
            }
        }

        if let Some(data) = chunks.get(CHUNK_2033_MOTIONS) {
            skeleton.motions = read_stringz(&mut Cursor::new(data))?;
        }

        skeleton.rebuild_cache();
        Ok(skeleton)
    }

    /// Stored transforms have X and Z exchanged and conjugated rotations.
    /// The mapping is its own inverse, so it serves both directions.
    fn swap_frame(&mut self) {
        fn swap(q: &mut Quat, t: &mut Vec3) {
            *q = swizzle_quat(*q).conjugate();
            *t = swizzle_vec3(*t);
        }
        for bone in &mut self.bones {
            swap(&mut bone.q, &mut bone.t);
        }
        for locator in &mut self.locators {
            swap(&mut locator.q, &mut locator.t);
        }
        for aux in &mut self.aux_bones {
            swap(&mut aux.q, &mut aux.t);
        }
    }

    /// Resolves parent names to indices and recomputes the inverse bind
    /// pose. Call after editing bones, locators or aux bones.
    pub fn rebuild_cache(&mut self) {
        let count = self.num_attach_points();
        let parent_indices = (0..count)
            .map(|idx| {
                let point = self.attach_point(idx)?;
                if point.parent().is_empty() {
                    return None;
                }
                let parent = self.find_bone(point.parent()).filter(|&p| p != idx);
                if parent.is_none() {
                    log::warn!("'{}' has unresolved parent '{}'", point.name(), point.parent());
                }
                parent
            })
            .collect();
        self.parent_indices = parent_indices;
        self.bind_pose = (0..count).map(|idx| self.compute_full_transform(idx)).collect();
        self.inv_bind_pose = self.bind_pose.iter().map(Mat4::inverse).collect();
    }

    fn compute_full_transform(&self, idx: usize) -> Mat4 {
        let mut xform = self.bone_transform(idx).unwrap_or(Mat4::IDENTITY);
        let mut current = idx;
        for _ in 0..self.parent_indices.len() {
            let Some(parent) = self.parent_indices.get(current).copied().flatten() else {
                return xform;
            };
            xform = self.bone_transform(parent).unwrap_or(Mat4::IDENTITY) * xform;
            current = parent;
        }
        log::warn!("Parent cycle at '{}'", self.bone_name(idx).unwrap_or_default());
        xform
    }

    pub fn num_bones(&self) -> usize { self.bones.len() }

    pub fn num_locators(&self) -> usize { self.locators.len() }

    pub fn num_aux_bones(&self) -> usize { self.aux_bones.len() }

    pub fn num_attach_points(&self) -> usize {
        self.bones.len() + self.locators.len() + self.aux_bones.len()
    }

    pub fn is_attach_point_a_bone(&self, idx: usize) -> bool { idx < self.bones.len() }

    pub fn is_attach_point_a_locator(&self, idx: usize) -> bool {
        idx >= self.bones.len() && idx < self.bones.len() + self.locators.len()
    }

    pub fn is_attach_point_an_aux_bone(&self, idx: usize) -> bool {
        idx >= self.bones.len() + self.locators.len() && idx < self.num_attach_points()
    }

    pub fn locator_to_attach_point(&self, idx: usize) -> usize { self.bones.len() + idx }

    pub fn aux_bone_to_attach_point(&self, idx: usize) -> usize {
        self.bones.len() + self.locators.len() + idx
    }

    pub fn attach_point_to_locator(&self, idx: usize) -> Option<usize> {
        self.is_attach_point_a_locator(idx).then(|| idx - self.bones.len())
    }

    pub fn attach_point_to_aux_bone(&self, idx: usize) -> Option<usize> {
        self.is_attach_point_an_aux_bone(idx).then(|| idx - self.bones.len() - self.locators.len())
    }

    pub fn attach_point(&self, idx: usize) -> Option<AttachPoint<'_>> {
        let (nb, nl) = (self.bones.len(), self.locators.len());
        if idx < nb {
            Some(AttachPoint::Bone(&self.bones[idx]))
        } else if idx < nb + nl {
            Some(AttachPoint::Locator(&self.locators[idx - nb]))
        } else {
            self.aux_bones.get(idx - nb - nl).map(AttachPoint::AuxBone)
        }
    }

    /// Bones first, then locators, then aux bones.
    pub fn find_bone(&self, name: &str) -> Option<usize> {
        let bones = self.bones.iter().map(|b| b.name.as_str());
        let locators = self.locators.iter().map(|l| l.name.as_str());
        let aux_bones = self.aux_bones.iter().map(|a| a.name.as_str());
        bones.chain(locators).chain(aux_bones).position(|n| n == name)
    }

    pub fn bone_name(&self, idx: usize) -> Option<&str> { self.attach_point(idx).map(AttachPoint::name) }

    pub fn bone_parent_name(&self, idx: usize) -> Option<&str> {
        self.attach_point(idx).map(AttachPoint::parent)
    }

    pub fn bone_parent_idx(&self, idx: usize) -> Option<usize> {
        self.parent_indices.get(idx).copied().flatten()
    }

    pub fn bone_rotation(&self, idx: usize) -> Option<Quat> {
        self.attach_point(idx).map(AttachPoint::rotation)
    }

    pub fn bone_position(&self, idx: usize) -> Option<Vec3> {
        self.attach_point(idx).map(AttachPoint::position)
    }

    /// Local bind transform.
    pub fn bone_transform(&self, idx: usize) -> Option<Mat4> {
        self.attach_point(idx).map(|p| Mat4::from_rotation_translation(p.rotation(), p.position()))
    }

    /// Model-space bind transform.
    pub fn bone_full_transform(&self, idx: usize) -> Option<Mat4> { self.bind_pose.get(idx).copied() }

    pub fn bone_full_transform_inv(&self, idx: usize) -> Option<&Mat4> { self.inv_bind_pose.get(idx) }

    /// The stored identity checksum matched against motions and skinned meshes.
    pub fn bones_crc(&self) -> u32 { self.crc }

    /// CRC32 over the concatenated bone names.
    pub fn calc_bones_crc(&self) -> u32 {
        let mut crc = Crc32::new();
        for bone in &self.bones {
            crc.update(bone.name.as_bytes());
        }
        crc.finish()
    }

    /// Bounds of the bind-pose bone positions.
    pub fn bind_pose_bbox(&self) -> AABBox {
        let mut bbox = AABBox::EMPTY;
        for idx in 0..self.bones.len() {
            if let Some(xform) = self.bone_full_transform(idx) {
                bbox.absorb_point(xform.w_axis.truncate());
            }
        }
        bbox
    }

    pub fn motion_folders(&self) -> impl Iterator<Item = &str> {
        self.motions.split(',').map(str::trim).filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;

    use super::*;
    use crate::format::{
        chunk::write_chunk_data,
        reflection::{BinaryReflectionReader, BinaryReflectionWriter},
    };

    fn bone(name: &str, parent: &str, q: Quat, t: Vec3) -> Bone {
        Bone { name: name.into(), parent: parent.into(), q, t, bp: 3, bpf: 1 }
    }

    fn sample(ver: u32) -> Skeleton {
        let mut skeleton = Skeleton {
            ver,
            motions: "content/motions/a, content/motions/b".into(),
            bones: vec![
                bone("root", "", Quat::IDENTITY, Vec3::ZERO),
                bone("child", "root", Quat::from_rotation_y(FRAC_PI_2), Vec3::new(0.0, 1.0, 0.0)),
            ],
            locators: vec![
                Locator { name: "loc0".into(), parent: "child".into(), t: Vec3::X, ..Default::default() },
                Locator { name: "loc1".into(), parent: "root".into(), fl: Bool8(1), ..Default::default() },
            ],
            aux_bones: vec![AuxBone { name: "aux".into(), parent: "loc0".into(), ..Default::default() }],
            ..Default::default()
        };
        skeleton.crc = skeleton.calc_bones_crc();
        skeleton.rebuild_cache();
        skeleton
    }

    #[test]
    fn archive_end_to_end() {
        let data = sample(21).save().unwrap();
        assert_eq!(data[0], 0x04);
        let archive = BinArchive::new(&data, HeaderSize::Fixed(0)).unwrap();
        assert_eq!(archive.chunks().len(), 2);
        assert!(archive.strings_table().unwrap().iter().any(|s| s == "root"));

        let skeleton = Skeleton::read(&mut archive.reflection_reader().unwrap()).unwrap();
        assert_eq!(skeleton.num_bones(), 2);
        assert_eq!(skeleton.bone_parent_idx(1), Some(0));
        assert_eq!(skeleton.bone_parent_idx(0), None);
        assert_eq!(skeleton.find_bone("root"), Some(0));
        assert_eq!(skeleton, sample(21));
    }

    #[test]
    fn rotations_are_stored_conjugated() {
        let data = sample(21).save().unwrap();
        let archive = BinArchive::new(&data, HeaderSize::Fixed(0)).unwrap();
        let mut raw = Skeleton::default();
        assert!(serialize_struct(&mut archive.reflection_reader().unwrap(), SECTION, &mut raw).unwrap());
        let expected = Quat::from_rotation_y(FRAC_PI_2);
        assert!(raw.bones[1].q.abs_diff_eq(expected.conjugate(), 1e-6));

        let loaded = Skeleton::load(&data).unwrap();
        assert!(loaded.bones[1].q.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn stored_transforms_swap_x_and_z() {
        let mut raw = sample(21);
        raw.bones[1].t = Vec3::new(1.0, 2.0, 3.0);
        raw.bones[1].q = Quat::from_xyzw(0.1, 0.2, 0.3, 0.9).normalize();
        raw.locators[0].t = Vec3::new(4.0, 5.0, 6.0);
        let mut writer = BinArchiveWriter::new(ReflectionFlags::DEFAULT_OUT);
        serialize_struct(&mut writer.reflection_writer(), SECTION, &mut raw).unwrap();
        let archive = writer.finalize().unwrap();

        let loaded = Skeleton::load(&archive).unwrap();
        assert_eq!(loaded.bones[1].t, Vec3::new(3.0, 2.0, 1.0));
        assert_eq!(loaded.locators[0].t, Vec3::new(6.0, 5.0, 4.0));
        let q = raw.bones[1].q;
        assert!(loaded.bones[1].q.abs_diff_eq(Quat::from_xyzw(-q.z, -q.y, -q.x, q.w), 1e-6));

        let resaved = Skeleton::load(&loaded.save().unwrap()).unwrap();
        assert_eq!(resaved.bones[1].t, loaded.bones[1].t);
    }

    #[test]
    fn attach_point_index_space() {
        let skeleton = sample(21);
        assert_eq!(skeleton.num_attach_points(), 5);
        assert_eq!(skeleton.find_bone("loc1"), Some(3));
        assert!(skeleton.is_attach_point_a_locator(3));
        assert!(!skeleton.is_attach_point_a_bone(3));
        assert_eq!(skeleton.attach_point_to_locator(3), Some(1));
        assert_eq!(skeleton.locator_to_attach_point(1), 3);
        assert_eq!(skeleton.find_bone("aux"), Some(4));
        assert!(skeleton.is_attach_point_an_aux_bone(4));
        assert_eq!(skeleton.attach_point_to_aux_bone(4), Some(0));
        assert_eq!(skeleton.bone_name(2), Some("loc0"));
        assert_eq!(skeleton.bone_parent_idx(4), Some(2));
        assert_eq!(skeleton.bone_name(5), None);
        assert_eq!(skeleton.find_bone("missing"), None);
    }

    #[test]
    fn bind_pose_chains_parents() {
        let skeleton = sample(21);
        // loc0 sits one unit along the child's rotated X axis.
        let full = skeleton.bone_full_transform(2).unwrap();
        let expected = Vec3::new(0.0, 1.0, -1.0);
        assert!(full.w_axis.truncate().abs_diff_eq(expected, 1e-5));
        let inv = skeleton.bone_full_transform_inv(2).unwrap();
        assert!((*inv * full).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        let bbox = skeleton.bind_pose_bbox();
        assert!((bbox.max.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn version_gates_fields() {
        let old = sample(10).to_json().unwrap();
        let old = &old[SECTION];
        assert!(old.get("facefx").is_some());
        assert!(old.get("pfnn").is_none());
        assert!(old.get("procedural").is_none());
        assert!(old["bones"]["rec_0000"].get("bpf").is_none());

        let new = sample(21).to_json().unwrap();
        let new = &new[SECTION];
        assert!(new.get("pfnn").is_some());
        assert!(new.get("has_as").is_some());
        assert!(new["procedural"].get("dynamic_bones").is_none());
        assert_eq!(new["bones"]["rec_0001"]["parent"], "root");
    }

    #[test]
    fn legacy_body_part_keeps_low_byte() {
        let mut json = sample(16).to_json().unwrap();
        json[SECTION]["bones"]["rec_0000"]["bp"] = serde_json::json!(0x1FF);
        let skeleton = Skeleton::from_json(&json).unwrap();
        assert_eq!(skeleton.bones[0].bp, 0xFF);
    }

    #[test]
    fn procedural_version_gates_arrays() {
        let mut skeleton = sample(21);
        skeleton.procedural = ProceduralBones {
            ver: 3,
            driven_bones: vec![DrivenBone { bone: "child".into(), driver: "root".into(), ..Default::default() }],
            param_bones: vec![ParamBone { bone: "child".into(), param: "lean".into(), ..Default::default() }],
            ..Default::default()
        };
        let flags = ReflectionFlags::HAS_DEBUG_INFO;
        let mut out = Vec::new();
        skeleton.write(&mut BinaryReflectionWriter::new(&mut out, flags)).unwrap();
        let back = Skeleton::read(&mut BinaryReflectionReader::new(&out, flags)).unwrap();
        assert_eq!(back.procedural, skeleton.procedural);
    }

    #[test]
    fn bones_crc_covers_names_only() {
        let mut a = sample(21);
        let b = sample(21);
        a.bones[1].t = Vec3::splat(5.0);
        assert_eq!(a.calc_bones_crc(), b.calc_bones_crc());
        a.bones[1].name = "other".into();
        assert_ne!(a.calc_bones_crc(), b.calc_bones_crc());
        assert_eq!(b.calc_bones_crc(), crate::util::crc32::crc32(b"rootchild"));
    }

    fn legacy_bone(out: &mut Vec<u8>, name: &str, parent: &str, euler: [f32; 3], t: [f32; 3]) {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(parent.as_bytes());
        out.push(0);
        for v in euler.into_iter().chain(t) {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    #[test]
    fn load_2033_layout() {
        let mut bones = 0xDEADBEEFu32.to_le_bytes().to_vec();
        bones.extend_from_slice(&2u16.to_le_bytes());
        legacy_bone(&mut bones, "root", "", [0.0; 3], [1.0, 2.0, 3.0]);
        bones.extend_from_slice(&0x0105u16.to_le_bytes());
        legacy_bone(&mut bones, "child", "root", [0.0, 0.0, FRAC_PI_2], [0.0; 3]);
        bones.extend_from_slice(&0u16.to_le_bytes());
        let mut locators = 1u16.to_le_bytes().to_vec();
        legacy_bone(&mut locators, "hand", "child", [0.0; 3], [0.0; 3]);

        let mut w = Cursor::new(Vec::new());
        write_chunk_data(&mut w, CHUNK_2033_VERSION, &3u32.to_le_bytes()).unwrap();
        write_chunk_data(&mut w, CHUNK_2033_BONES, &bones).unwrap();
        write_chunk_data(&mut w, CHUNK_2033_LOCATORS, &locators).unwrap();
        write_chunk_data(&mut w, CHUNK_2033_MOTIONS, b"motions\\human\0").unwrap();

        let skeleton = Skeleton::load_2033(&w.into_inner()).unwrap();
        assert_eq!(skeleton.ver, 3);
        assert_eq!(skeleton.bones_crc(), 0xDEADBEEF);
        assert_eq!(skeleton.num_bones(), 2);
        assert_eq!(skeleton.bones[0].t, Vec3::new(3.0, 2.0, 1.0));
        assert_eq!(skeleton.bones[0].bp, 0x05);
        assert!(skeleton.bones[0].q.abs_diff_eq(Quat::IDENTITY, 1e-6));
        assert!(skeleton.bones[1].q.abs_diff_eq(Quat::from_rotation_x(-FRAC_PI_2), 1e-6));
        assert_eq!(skeleton.bone_parent_idx(1), Some(0));
        assert_eq!(skeleton.find_bone("hand"), Some(2));
        assert_eq!(skeleton.motions, "motions\\human");
    }
}
