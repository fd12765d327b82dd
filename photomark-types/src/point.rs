use std::collections::BTreeSet;

use nalgebra::Vector3;

use crate::{ConstraintKey, ObservationKey};

/// State of one coordinate axis of a [`WorldPoint`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisState {
    /// Fixed by the user; never touched by the solver.
    Locked(f64),
    /// Derived from other data; the solver may overwrite it.
    Inferred(f64),
    Free,
}

impl AxisState {
    pub fn is_locked(&self) -> bool {
        matches!(self, AxisState::Locked(_))
    }

    pub fn locked_value(&self) -> Option<f64> {
        match self {
            AxisState::Locked(v) => Some(*v),
            _ => None,
        }
    }

    pub fn known_value(&self) -> Option<f64> {
        match self {
            AxisState::Locked(v) | AxisState::Inferred(v) => Some(*v),
            AxisState::Free => None,
        }
    }
}

/// A named 3D feature marked by the user.
#[derive(Debug, Clone)]
pub struct WorldPoint {
    pub name: String,
    pub axes: [AxisState; 3],
    /// Most recent solver output. May be arbitrary stale garbage for a point
    /// that is not fully constrained; check [`WorldPoint::is_fully_constrained`]
    /// before trusting it in heuristics.
    pub optimized_xyz: Option<Vector3<f64>>,
    /// Display color, `#rrggbb`.
    pub color: String,
    pub(crate) constraints: BTreeSet<ConstraintKey>,
    pub(crate) observations: BTreeSet<ObservationKey>,
}

impl WorldPoint {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            axes: [AxisState::Free; 3],
            optimized_xyz: None,
            color: "#ffcc00".to_string(),
            constraints: BTreeSet::new(),
            observations: BTreeSet::new(),
        }
    }

    /// Locked value where present, otherwise the optimized value, otherwise
    /// the inferred value; `None` when any axis has no value at all.
    pub fn effective_xyz(&self) -> Option<Vector3<f64>> {
        let mut out = [0.0; 3];
        for (i, axis) in self.axes.iter().enumerate() {
            out[i] = match axis {
                AxisState::Locked(v) => *v,
                AxisState::Inferred(v) => match self.optimized_xyz {
                    Some(opt) => opt[i],
                    None => *v,
                },
                AxisState::Free => self.optimized_xyz?[i],
            };
        }
        Some(Vector3::new(out[0], out[1], out[2]))
    }

    /// True when every axis is locked or inferred.
    pub fn is_fully_constrained(&self) -> bool {
        self.axes.iter().all(|a| !matches!(a, AxisState::Free))
    }

    /// Constraints that name this point.
    pub fn constraints(&self) -> impl Iterator<Item = ConstraintKey> + '_ {
        self.constraints.iter().copied()
    }

    /// Image observations of this point.
    pub fn observations(&self) -> impl Iterator<Item = ObservationKey> + '_ {
        self.observations.iter().copied()
    }
}
