use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ConstraintKey, PointKey};

/// Axis-direction tag a line may assert about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisDirection {
    X,
    Y,
    Z,
    Xy,
    Xz,
    Yz,
    Free,
}

impl AxisDirection {
    /// The single axis this tag pins the line to, if it pins exactly one.
    pub fn single_axis(&self) -> Option<crate::Axis> {
        match self {
            AxisDirection::X => Some(crate::Axis::X),
            AxisDirection::Y => Some(crate::Axis::Y),
            AxisDirection::Z => Some(crate::Axis::Z),
            _ => None,
        }
    }

    /// World components that must vanish in the line direction for the tag to
    /// hold. An `x` line has zero y and z components; an `xy` line (in the
    /// xy plane) has zero z.
    pub fn zero_components(&self) -> &'static [usize] {
        match self {
            AxisDirection::X => &[1, 2],
            AxisDirection::Y => &[0, 2],
            AxisDirection::Z => &[0, 1],
            AxisDirection::Xy => &[2],
            AxisDirection::Xz => &[1],
            AxisDirection::Yz => &[0],
            AxisDirection::Free => &[],
        }
    }

}

/// A segment between two world points, optionally axis-tagged and of known
/// length, with a set of additional points asserted to lie on it.
#[derive(Debug, Clone)]
pub struct Line {
    pub name: String,
    pub point_a: PointKey,
    pub point_b: PointKey,
    pub direction: AxisDirection,
    pub target_length: Option<f64>,
    pub coincident: BTreeSet<PointKey>,
    pub(crate) constraints: BTreeSet<ConstraintKey>,
}

impl Line {
    pub(crate) fn new(name: String, point_a: PointKey, point_b: PointKey) -> Self {
        Self {
            name,
            point_a,
            point_b,
            direction: AxisDirection::Free,
            target_length: None,
            coincident: BTreeSet::new(),
            constraints: BTreeSet::new(),
        }
    }

    pub fn endpoints(&self) -> [PointKey; 2] {
        [self.point_a, self.point_b]
    }

    pub fn constraints(&self) -> impl Iterator<Item = ConstraintKey> + '_ {
        self.constraints.iter().copied()
    }
}
