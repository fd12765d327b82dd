use std::collections::BTreeSet;

use nalgebra::{Quaternion, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::ObservationKey;

/// One of the three world axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn unit(&self) -> Vector3<f64> {
        match self {
            Axis::X => Vector3::x(),
            Axis::Y => Vector3::y(),
            Axis::Z => Vector3::z(),
        }
    }

    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

/// A user-drawn image segment asserted to be the image of a world line
/// parallel to `axis`. Only used by vanishing-point calibration.
#[derive(Debug, Clone, Copy)]
pub struct VanishingLine {
    pub axis: Axis,
    pub a: Vector2<f64>,
    pub b: Vector2<f64>,
}

/// A camera: image geometry, pose, intrinsics and its observations.
///
/// The stored rotation may be unnormalised (documents round-trip whatever the
/// host wrote); the solver normalises before use and keeps it near unit
/// length with a soft constraint.
#[derive(Debug, Clone)]
pub struct Viewpoint {
    pub name: String,
    pub image_width: u32,
    pub image_height: u32,
    pub position: Vector3<f64>,
    pub rotation: Quaternion<f64>,
    pub focal_length: f64,
    pub aspect_ratio: f64,
    pub principal_point: Vector2<f64>,
    pub skew: f64,
    /// Radial distortion `k1, k2, k3`.
    pub radial: [f64; 3],
    /// Tangential distortion `p1, p2`.
    pub tangential: [f64; 2],
    /// Selects the mirrored camera frame (z negated after rotation).
    pub is_z_reflected: bool,
    pub vanishing_lines: Vec<VanishingLine>,
    pub(crate) observations: BTreeSet<ObservationKey>,
}

impl Viewpoint {
    pub(crate) fn new(name: String, image_width: u32, image_height: u32) -> Self {
        Self {
            name,
            image_width,
            image_height,
            position: Vector3::zeros(),
            rotation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            focal_length: f64::from(image_width.max(image_height)),
            aspect_ratio: 1.0,
            principal_point: Vector2::new(
                f64::from(image_width) * 0.5,
                f64::from(image_height) * 0.5,
            ),
            skew: 0.0,
            radial: [0.0; 3],
            tangential: [0.0; 2],
            is_z_reflected: false,
            vanishing_lines: Vec::new(),
            observations: BTreeSet::new(),
        }
    }

    /// Normalised rotation for geometric use.
    pub fn unit_rotation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(self.rotation)
    }

    pub fn observations(&self) -> impl Iterator<Item = ObservationKey> + '_ {
        self.observations.iter().copied()
    }

    /// Axes for which this viewpoint carries at least `min_lines` vanishing
    /// lines.
    pub fn vanishing_axes(&self, min_lines: usize) -> Vec<Axis> {
        Axis::ALL
            .iter()
            .copied()
            .filter(|axis| {
                self.vanishing_lines
                    .iter()
                    .filter(|l| l.axis == *axis)
                    .count()
                    >= min_lines
            })
            .collect()
    }

    /// A viewpoint qualifies for vanishing-point calibration when at least
    /// two axes carry two or more lines each.
    pub fn is_vp_calibratable(&self) -> bool {
        self.vanishing_axes(2).len() >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp_calibratable_needs_two_axes() {
        let mut vp = Viewpoint::new("cam".into(), 640, 480);
        let seg = |axis| VanishingLine {
            axis,
            a: Vector2::new(0.0, 0.0),
            b: Vector2::new(1.0, 1.0),
        };
        vp.vanishing_lines = vec![seg(Axis::X), seg(Axis::X), seg(Axis::Y)];
        assert!(!vp.is_vp_calibratable());
        vp.vanishing_lines.push(seg(Axis::Y));
        assert!(vp.is_vp_calibratable());
    }
}
