//! 3D vectors, listener frame and per-source spatial state

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Neg, Sub};

/// 3D vector in meters (or m/s for velocities)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// Left/right, positive = right
    pub x: f32,
    /// Down/up, positive = up
    pub y: f32,
    /// Back/front, positive = forward
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const RIGHT: Self = Self::new(1.0, 0.0, 0.0);
    pub const UP: Self = Self::new(0.0, 1.0, 0.0);
    pub const FORWARD: Self = Self::new(0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    #[inline]
    pub fn magnitude(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector, or `fallback` for a (near) zero vector
    pub fn normalize_or(self, fallback: Self) -> Self {
        let mag = self.magnitude();
        if mag < 1e-10 { fallback } else { self * (1.0 / mag) }
    }

    pub fn distance_to(self, other: Self) -> f32 {
        (other - self).magnitude()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn to_spherical(self) -> Spherical {
        Spherical::from_cartesian(self)
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Spherical coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Spherical {
    /// Degrees, -180..=180, 0 = front, positive = right
    pub azimuth: f32,
    /// Degrees, -90..=90, positive = up
    pub elevation: f32,
    /// Meters
    pub distance: f32,
}

impl Spherical {
    pub fn new(azimuth: f32, elevation: f32, distance: f32) -> Self {
        Self {
            azimuth,
            elevation,
            distance,
        }
    }

    /// Azimuth is `atan2(x, z)`, elevation `asin(y / r)`.
    /// The origin maps to front at distance 0.
    pub fn from_cartesian(v: Vec3) -> Self {
        let (x, y, z) = (v.x as f64, v.y as f64, v.z as f64);
        let distance = (x * x + y * y + z * z).sqrt();
        if distance < 1e-10 {
            return Self::default();
        }

        let azimuth = x.atan2(z).to_degrees();
        let elevation = (y / distance).clamp(-1.0, 1.0).asin().to_degrees();

        Self {
            azimuth: azimuth as f32,
            elevation: elevation as f32,
            distance: distance as f32,
        }
    }

    pub fn to_cartesian(self) -> Vec3 {
        let az = (self.azimuth as f64).to_radians();
        let el = (self.elevation as f64).to_radians();
        let d = self.distance as f64;
        let cos_el = el.cos();

        Vec3::new(
            (d * cos_el * az.sin()) as f32,
            (d * el.sin()) as f32,
            (d * cos_el * az.cos()) as f32,
        )
    }

    pub fn azimuth_rad(&self) -> f32 {
        self.azimuth.to_radians()
    }

    pub fn elevation_rad(&self) -> f32 {
        self.elevation.to_radians()
    }
}

/// Listener pose
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub position: Vec3,
    pub velocity: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            forward: Vec3::FORWARD,
            up: Vec3::UP,
        }
    }
}

impl Listener {
    /// Orthonormal (right, up, forward) basis of the listener's head
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let forward = self.forward.normalize_or(Vec3::FORWARD);
        let right = self.up.cross(forward).normalize_or(Vec3::RIGHT);
        let up = forward.cross(right);
        (right, up, forward)
    }

    /// World point expressed in the listener's head frame
    pub fn to_local(&self, point: Vec3) -> Vec3 {
        let (right, up, forward) = self.basis();
        let rel = point - self.position;
        Vec3::new(rel.dot(right), rel.dot(up), rel.dot(forward))
    }

    /// Direction and distance of `point` as heard by the listener
    pub fn relative(&self, point: Vec3) -> Spherical {
        Spherical::from_cartesian(self.to_local(point))
    }
}

/// Spatial state of one track
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialSource {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Facing direction
    pub orientation: Vec3,
    /// Source width, 0.0 = point, 1.0 = fully diffuse
    pub spread: f32,
    /// Directivity, 0.0 = omni response, 1.0 = narrow cardioid
    pub focus: f32,
    /// Ignore orientation and focus
    pub omnidirectional: bool,
    /// Render through HRTF when in binaural mode
    pub hrtf_required: bool,
}

impl Default for SpatialSource {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orientation: -Vec3::FORWARD,
            spread: 0.0,
            focus: 0.0,
            omnidirectional: true,
            hrtf_required: true,
        }
    }
}

impl SpatialSource {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Directivity gain toward the listener at `listener_pos`.
    ///
    /// Blends omni and cardioid by `focus`; the rear of a fully focused
    /// source is floored at -24 dB.
    pub fn directivity_gain(&self, listener_pos: Vec3) -> f32 {
        if self.omnidirectional || self.focus <= 0.0 {
            return 1.0;
        }
        let facing = self.orientation.normalize_or(-Vec3::FORWARD);
        let to_listener = (listener_pos - self.position).normalize_or(facing);
        let cardioid = 0.5 * (1.0 + facing.dot(to_listener));
        let focus = self.focus.clamp(0.0, 1.0);
        ((1.0 - focus) + focus * cardioid).max(0.063)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_vec_close(a: Vec3, b: Vec3) {
        let scale = b.magnitude().max(1.0);
        assert!(
            (a - b).magnitude() <= 1e-5 * scale,
            "{:?} != {:?}",
            a,
            b
        );
    }

    #[test]
    fn test_axes() {
        let right = Spherical::from_cartesian(Vec3::RIGHT);
        assert!((right.azimuth - 90.0).abs() < 1e-4);
        assert!(right.elevation.abs() < 1e-4);

        let front = Spherical::from_cartesian(Vec3::FORWARD);
        assert!(front.azimuth.abs() < 1e-4);

        let up = Spherical::from_cartesian(Vec3::UP);
        assert!((up.elevation - 90.0).abs() < 1e-4);

        let behind = Spherical::from_cartesian(-Vec3::FORWARD);
        assert!((behind.azimuth.abs() - 180.0).abs() < 1e-4);
    }

    #[test]
    fn test_spherical_roundtrip() {
        let magnitudes = [0.01f32, 0.1, 1.0, 7.5, 42.0, 100.0];
        let directions = [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-0.3, 0.2, 0.9),
            Vec3::new(0.5, -0.7, -0.5),
            Vec3::new(-0.1, 0.95, 0.05),
            Vec3::new(0.0, 0.0, -1.0),
        ];
        for &mag in &magnitudes {
            for &dir in &directions {
                let v = dir.normalize_or(Vec3::FORWARD) * mag;
                let back = Spherical::from_cartesian(v).to_cartesian();
                assert_vec_close(back, v);
            }
        }
    }

    #[test]
    fn test_origin_is_front() {
        let s = Spherical::from_cartesian(Vec3::ZERO);
        assert_eq!(s, Spherical::default());
    }

    #[test]
    fn test_listener_rotation() {
        // Listener facing right: a source on the world's right is in front
        let listener = Listener {
            forward: Vec3::RIGHT,
            ..Default::default()
        };
        let rel = listener.relative(Vec3::new(2.0, 0.0, 0.0));
        assert!(rel.azimuth.abs() < 1e-3);
        assert!((rel.distance - 2.0).abs() < 1e-5);

        // ...and a source straight ahead in world space is on the left
        let rel = listener.relative(Vec3::FORWARD);
        assert!((rel.azimuth + 90.0).abs() < 1e-3);
    }

    #[test]
    fn test_listener_translation() {
        let listener = Listener {
            position: Vec3::new(0.0, 0.0, -3.0),
            ..Default::default()
        };
        let rel = listener.relative(Vec3::ZERO);
        assert!((rel.distance - 3.0).abs() < 1e-5);
        assert!(rel.azimuth.abs() < 1e-3);
    }

    #[test]
    fn test_directivity() {
        let mut source = SpatialSource::at(Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(source.directivity_gain(Vec3::ZERO), 1.0);

        source.omnidirectional = false;
        source.focus = 1.0;
        // Default orientation faces the origin
        assert!((source.directivity_gain(Vec3::ZERO) - 1.0).abs() < 1e-5);

        source.orientation = Vec3::FORWARD;
        assert!(source.directivity_gain(Vec3::ZERO) < 0.1);
    }
}
