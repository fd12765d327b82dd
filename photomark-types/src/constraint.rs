use nalgebra::{Vector2, Vector3};

use crate::{LineKey, PointKey, ViewpointKey};

/// Data shared by every constraint variant.
#[derive(Debug, Clone)]
pub struct ConstraintCommon {
    pub name: String,
    /// Residual magnitude below which the constraint reports satisfied.
    pub tolerance: f64,
    pub enabled: bool,
    /// Snapshot of the residuals from the most recent evaluation.
    pub last_residuals: Vec<f64>,
}

impl ConstraintCommon {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tolerance: 1e-4,
            enabled: true,
            last_residuals: Vec::new(),
        }
    }
}

/// The ten geometric constraint variants.
#[derive(Debug, Clone)]
pub enum ConstraintKind {
    /// ‖B−A‖ − d
    DistancePointPoint {
        a: PointKey,
        b: PointKey,
        distance: f64,
    },
    /// ∠(A−V, C−V) − θ. The target is stored in degrees.
    AnglePointPointPoint {
        a: PointKey,
        vertex: PointKey,
        c: PointKey,
        degrees: f64,
    },
    /// Componentwise P − T.
    FixedPoint { point: PointKey, target: Vector3<f64> },
    /// cross(P₁−P₀, Pᵢ−P₀) = 0 for every i ≥ 2.
    CollinearPoints { points: Vec<PointKey> },
    /// Normalised signed distance of every extra point from the plane of the
    /// first three.
    CoplanarPoints { points: Vec<PointKey> },
    ParallelLines { a: LineKey, b: LineKey },
    PerpendicularLines { a: LineKey, b: LineKey },
    /// ‖pairᵢ‖ − ‖pair₀‖ for i ≥ 1.
    EqualDistances { pairs: Vec<(PointKey, PointKey)> },
    /// angleᵢ − angle₀ for i ≥ 1, triplets as (a, vertex, c).
    EqualAngles {
        triplets: Vec<(PointKey, PointKey, PointKey)>,
    },
    /// Projected pixel − observed pixel.
    Projection {
        point: PointKey,
        viewpoint: ViewpointKey,
        observed: Vector2<f64>,
    },
}

impl ConstraintKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ConstraintKind::DistancePointPoint { .. } => "distance_point_point",
            ConstraintKind::AnglePointPointPoint { .. } => "angle_point_point_point",
            ConstraintKind::FixedPoint { .. } => "fixed_point",
            ConstraintKind::CollinearPoints { .. } => "collinear_points",
            ConstraintKind::CoplanarPoints { .. } => "coplanar_points",
            ConstraintKind::ParallelLines { .. } => "parallel_lines",
            ConstraintKind::PerpendicularLines { .. } => "perpendicular_lines",
            ConstraintKind::EqualDistances { .. } => "equal_distances",
            ConstraintKind::EqualAngles { .. } => "equal_angles",
            ConstraintKind::Projection { .. } => "projection",
        }
    }

    /// Minimum number of primary operands this variant requires.
    pub fn min_operands(&self) -> usize {
        match self {
            ConstraintKind::CollinearPoints { .. } => 3,
            ConstraintKind::CoplanarPoints { .. } => 4,
            ConstraintKind::EqualDistances { .. } | ConstraintKind::EqualAngles { .. } => 2,
            ConstraintKind::DistancePointPoint { .. } => 2,
            ConstraintKind::AnglePointPointPoint { .. } => 3,
            ConstraintKind::FixedPoint { .. } | ConstraintKind::Projection { .. } => 1,
            ConstraintKind::ParallelLines { .. } | ConstraintKind::PerpendicularLines { .. } => 2,
        }
    }

    /// Current operand count against the minimum-operand rule.
    pub fn operand_count(&self) -> usize {
        match self {
            ConstraintKind::CollinearPoints { points }
            | ConstraintKind::CoplanarPoints { points } => points.len(),
            ConstraintKind::EqualDistances { pairs } => pairs.len(),
            ConstraintKind::EqualAngles { triplets } => triplets.len(),
            other => other.min_operands(),
        }
    }

    /// Every world point this constraint names, in evaluation order.
    pub fn points(&self) -> Vec<PointKey> {
        match self {
            ConstraintKind::DistancePointPoint { a, b, .. } => vec![*a, *b],
            ConstraintKind::AnglePointPointPoint { a, vertex, c, .. } => vec![*a, *vertex, *c],
            ConstraintKind::FixedPoint { point, .. } => vec![*point],
            ConstraintKind::CollinearPoints { points }
            | ConstraintKind::CoplanarPoints { points } => points.clone(),
            ConstraintKind::ParallelLines { .. } | ConstraintKind::PerpendicularLines { .. } => {
                Vec::new()
            }
            ConstraintKind::EqualDistances { pairs } => {
                pairs.iter().flat_map(|(a, b)| [*a, *b]).collect()
            }
            ConstraintKind::EqualAngles { triplets } => triplets
                .iter()
                .flat_map(|(a, v, c)| [*a, *v, *c])
                .collect(),
            ConstraintKind::Projection { point, .. } => vec![*point],
        }
    }

    pub fn lines(&self) -> Vec<LineKey> {
        match self {
            ConstraintKind::ParallelLines { a, b }
            | ConstraintKind::PerpendicularLines { a, b } => vec![*a, *b],
            _ => Vec::new(),
        }
    }

    pub fn viewpoints(&self) -> Vec<ViewpointKey> {
        match self {
            ConstraintKind::Projection { viewpoint, .. } => vec![*viewpoint],
            _ => Vec::new(),
        }
    }

    /// Drop a deleted point from a shrinkable variant. Returns `false` when
    /// the constraint cannot survive the removal and must be deleted instead.
    pub(crate) fn remove_point(&mut self, key: PointKey) -> bool {
        match self {
            ConstraintKind::CollinearPoints { points } => {
                points.retain(|p| *p != key);
                points.len() >= 3
            }
            ConstraintKind::CoplanarPoints { points } => {
                points.retain(|p| *p != key);
                points.len() >= 4
            }
            ConstraintKind::EqualDistances { pairs } => {
                pairs.retain(|(a, b)| *a != key && *b != key);
                pairs.len() >= 2
            }
            ConstraintKind::EqualAngles { triplets } => {
                triplets.retain(|(a, v, c)| *a != key && *v != key && *c != key);
                triplets.len() >= 2
            }
            other => !other.points().contains(&key),
        }
    }
}

/// A user-asserted geometric relationship.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub common: ConstraintCommon,
    pub kind: ConstraintKind,
}

impl Constraint {
    pub fn new(name: impl Into<String>, kind: ConstraintKind) -> Self {
        Self {
            common: ConstraintCommon::new(name),
            kind,
        }
    }

    /// Satisfied iff every snapshot residual is within tolerance.
    pub fn is_satisfied(&self) -> Option<bool> {
        if self.common.last_residuals.is_empty() {
            return None;
        }
        Some(
            self.common
                .last_residuals
                .iter()
                .all(|r| r.abs() <= self.common.tolerance),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn keys(n: usize) -> Vec<PointKey> {
        let mut map: SlotMap<PointKey, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn shrinkable_variants_survive_point_removal() {
        let k = keys(4);
        let mut kind = ConstraintKind::CoplanarPoints { points: k.clone() };
        assert!(!kind.remove_point(k[0])); // 4 -> 3 is below the minimum
        let k = keys(5);
        let mut kind = ConstraintKind::CoplanarPoints { points: k.clone() };
        assert!(kind.remove_point(k[4]));
        assert_eq!(kind.operand_count(), 4);
    }

    #[test]
    fn rigid_variants_die_with_their_operand() {
        let k = keys(2);
        let mut kind = ConstraintKind::DistancePointPoint {
            a: k[0],
            b: k[1],
            distance: 1.0,
        };
        assert!(!kind.remove_point(k[0]));
        assert!(kind.remove_point(keys(1)[0])); // unrelated point: unaffected
    }

    #[test]
    fn satisfied_uses_tolerance() {
        let k = keys(2);
        let mut c = Constraint::new(
            "d",
            ConstraintKind::DistancePointPoint {
                a: k[0],
                b: k[1],
                distance: 1.0,
            },
        );
        assert_eq!(c.is_satisfied(), None);
        c.common.last_residuals = vec![5e-5];
        assert_eq!(c.is_satisfied(), Some(true));
        c.common.last_residuals = vec![5e-3];
        assert_eq!(c.is_satisfied(), Some(false));
    }
}
