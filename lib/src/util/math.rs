use binrw::binrw;
use glam::{Quat, Vec3};

/// Axis-aligned bounding box.
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AABBox {
    #[br(map = Vec3::from_array)]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub min: Vec3,
    #[br(map = Vec3::from_array)]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub max: Vec3,
}

impl Default for AABBox {
    fn default() -> Self { Self::EMPTY }
}

impl AABBox {
    /// An inverted box; absorbing any point yields a box around that point.
    pub const EMPTY: Self = Self { min: Vec3::splat(f32::MAX), max: Vec3::splat(f32::MIN) };

    pub fn new(min: Vec3, max: Vec3) -> Self { Self { min, max } }

    pub fn is_empty(&self) -> bool { self.min.cmpgt(self.max).any() }

    pub fn absorb_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn absorb(&mut self, other: &AABBox) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn center(&self) -> Vec3 { (self.min + self.max) * 0.5 }

    pub fn extent(&self) -> Vec3 { (self.max - self.min) * 0.5 }

    /// Largest absolute coordinate over both corners.
    pub fn max_abs_component(&self) -> f32 {
        self.min.abs().max(self.max.abs()).max_element()
    }
}

/// Bounding sphere.
#[binrw]
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BSphere {
    #[br(map = Vec3::from_array)]
    #[bw(map = |v: &Vec3| v.to_array())]
    pub center: Vec3,
    pub radius: f32,
}

impl BSphere {
    pub fn new(center: Vec3, radius: f32) -> Self { Self { center, radius } }

    pub fn absorb(&mut self, other: &BSphere) {
        if other.radius <= 0.0 {
            return;
        }
        if self.radius <= 0.0 {
            *self = *other;
            return;
        }
        let delta = other.center - self.center;
        let dist = delta.length();
        if dist + other.radius <= self.radius {
            return;
        }
        if dist + self.radius <= other.radius {
            *self = *other;
            return;
        }
        let radius = (dist + self.radius + other.radius) * 0.5;
        self.center += delta * ((radius - self.radius) / dist);
        self.radius = radius;
    }
}

/// Engine vectors are stored with X and Z exchanged.
#[inline]
pub fn swizzle_vec3(v: Vec3) -> Vec3 { Vec3::new(v.z, v.y, v.x) }

#[inline]
pub fn swizzle_quat(q: Quat) -> Quat { Quat::from_xyzw(q.z, q.y, q.x, q.w) }

/// Builds a quaternion from Euler angles (radians) applied X, then Y, then Z.
pub fn quat_from_euler(pitch: f32, yaw: f32, roll: f32) -> Quat {
    let (sx, cx) = (pitch * 0.5).sin_cos();
    let (sy, cy) = (yaw * 0.5).sin_cos();
    let (sz, cz) = (roll * 0.5).sin_cos();
    Quat::from_xyzw(
        sx * cy * cz - cx * sy * sz,
        cx * sy * cz + sx * cy * sz,
        cx * cy * sz - sx * sy * cz,
        cx * cy * cz + sx * sy * sz,
    )
}
