//! Enumeration of the residual groups of a project.
//!
//! A group is one evaluation unit: a constraint, an implicit line residual
//! (length, axis tag, coincident point), one image observation, or a
//! quaternion-norm regulariser. Both back ends iterate the same group list in
//! the same order, so residual vectors line up across back ends.

use photomark_autodiff::Real;
use photomark_types::{
    ConstraintKey, ConstraintKind, LineKey, ObservationKey, PointKey, Project, ViewpointKey,
};

use crate::layout::VariableLayout;
use crate::residuals::{
    coincident_residuals, constraint_residuals, line_axis_residuals, line_length_residuals,
    quat_norm_residual, reprojection_residuals, OperandSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Constraint(ConstraintKey),
    LineLength(LineKey),
    LineAxis(LineKey),
    Coincident(LineKey, PointKey),
    Observation(ObservationKey),
    QuatNorm(ViewpointKey),
}

#[derive(Debug, Clone, Copy)]
pub struct ResidualGroup {
    pub kind: GroupKind,
    pub weight: f64,
}

/// Scaling knobs applied during group enumeration.
#[derive(Debug, Clone, Copy)]
pub struct SystemWeights {
    /// Scale for reprojection residuals (observations and projection
    /// constraints). The orchestrator sets this below 1 when geometric
    /// constraints are present so pixel counts cannot override metric
    /// assertions.
    pub reprojection: f64,
    /// Scale for the quaternion-norm regulariser.
    pub regularization: f64,
}

impl Default for SystemWeights {
    fn default() -> Self {
        Self {
            reprojection: 1.0,
            regularization: 1.0,
        }
    }
}

/// True when the project carries any enabled non-projection constraint or any
/// implicit line residual; this is the §reprojection-weighting trigger.
pub fn has_geometric_residuals(project: &Project) -> bool {
    let constrained = project.constraints().any(|(_, c)| {
        c.common.enabled && !matches!(c.kind, ConstraintKind::Projection { .. })
    });
    constrained
        || project.lines().any(|(_, l)| {
            l.target_length.is_some()
                || !l.direction.zero_components().is_empty()
                || !l.coincident.is_empty()
        })
}

/// Enumerate every residual group of the project in deterministic order.
pub fn residual_groups(
    project: &Project,
    layout: &VariableLayout,
    weights: &SystemWeights,
) -> Vec<ResidualGroup> {
    let mut groups = Vec::new();

    for (key, constraint) in project.constraints() {
        if !constraint.common.enabled {
            continue;
        }
        let weight = if matches!(constraint.kind, ConstraintKind::Projection { .. }) {
            weights.reprojection
        } else {
            1.0
        };
        groups.push(ResidualGroup {
            kind: GroupKind::Constraint(key),
            weight,
        });
    }

    for (key, line) in project.lines() {
        if line.target_length.is_some() {
            groups.push(ResidualGroup {
                kind: GroupKind::LineLength(key),
                weight: 1.0,
            });
        }
        if !line.direction.zero_components().is_empty() {
            groups.push(ResidualGroup {
                kind: GroupKind::LineAxis(key),
                weight: 1.0,
            });
        }
        for p in line.coincident.iter() {
            groups.push(ResidualGroup {
                kind: GroupKind::Coincident(key, *p),
                weight: 1.0,
            });
        }
    }

    for (key, _) in project.observations() {
        groups.push(ResidualGroup {
            kind: GroupKind::Observation(key),
            weight: weights.reprojection,
        });
    }

    for (key, _) in project.viewpoints() {
        let optimized = layout
            .camera_slots(key)
            .map(|s| s.optimized)
            .unwrap_or(false);
        if optimized {
            groups.push(ResidualGroup {
                kind: GroupKind::QuatNorm(key),
                weight: weights.regularization,
            });
        }
    }

    groups
}

/// Evaluate one group's residuals (unweighted) through any operand source.
pub fn group_residuals<S: Real, M: OperandSource<S>>(
    project: &Project,
    group: &ResidualGroup,
    source: &M,
) -> Vec<S> {
    match group.kind {
        GroupKind::Constraint(key) => match project.constraint(key) {
            Some(constraint) => constraint_residuals(project, &constraint.kind, source),
            None => Vec::new(),
        },
        GroupKind::LineLength(key) => match project.line(key) {
            Some(line) => line_length_residuals(project, key, line, source),
            None => Vec::new(),
        },
        GroupKind::LineAxis(key) => match project.line(key) {
            Some(line) => line_axis_residuals(project, key, line, source),
            None => Vec::new(),
        },
        GroupKind::Coincident(line_key, point) => {
            coincident_residuals(project, line_key, point, source)
        }
        GroupKind::Observation(key) => match project.observation(key) {
            Some(obs) => {
                let (Some(p), Some(cam)) =
                    (source.point(obs.world_point), source.camera(obs.viewpoint))
                else {
                    tracing::warn!("observation operand missing from value map; skipping");
                    return Vec::new();
                };
                reprojection_residuals(&cam, p, obs.u, obs.v)
            }
            None => Vec::new(),
        },
        GroupKind::QuatNorm(key) => match source.camera(key) {
            Some(cam) => vec![quat_norm_residual(&cam)],
            None => Vec::new(),
        },
    }
}

/// World points a group reads, in a deterministic order.
pub fn group_points(project: &Project, group: &ResidualGroup) -> Vec<PointKey> {
    match group.kind {
        GroupKind::Constraint(key) => match project.constraint(key) {
            Some(c) => {
                let mut pts = c.kind.points();
                for line in c.kind.lines() {
                    if let Some(line) = project.line(line) {
                        pts.extend(line.endpoints());
                    }
                }
                dedup_in_order(pts)
            }
            None => Vec::new(),
        },
        GroupKind::LineLength(key) | GroupKind::LineAxis(key) => match project.line(key) {
            Some(line) => line.endpoints().to_vec(),
            None => Vec::new(),
        },
        GroupKind::Coincident(line_key, point) => match project.line(line_key) {
            Some(line) => {
                let mut pts = line.endpoints().to_vec();
                pts.push(point);
                pts
            }
            None => Vec::new(),
        },
        GroupKind::Observation(key) => match project.observation(key) {
            Some(obs) => vec![obs.world_point],
            None => Vec::new(),
        },
        GroupKind::QuatNorm(_) => Vec::new(),
    }
}

/// Viewpoints a group reads.
pub fn group_viewpoints(project: &Project, group: &ResidualGroup) -> Vec<ViewpointKey> {
    match group.kind {
        GroupKind::Constraint(key) => project
            .constraint(key)
            .map(|c| c.kind.viewpoints())
            .unwrap_or_default(),
        GroupKind::Observation(key) => project
            .observation(key)
            .map(|obs| vec![obs.viewpoint])
            .unwrap_or_default(),
        GroupKind::QuatNorm(key) => vec![key],
        _ => Vec::new(),
    }
}

fn dedup_in_order(keys: Vec<PointKey>) -> Vec<PointKey> {
    let mut out = Vec::with_capacity(keys.len());
    for k in keys {
        if !out.contains(&k) {
            out.push(k);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutOptions;
    use nalgebra::Vector2;
    use photomark_types::{AxisDirection, Constraint};

    #[test]
    fn groups_cover_constraints_lines_observations_and_cameras() {
        let mut project = Project::new();
        let a = project.add_point("a");
        let b = project.add_point("b");
        let c = project.add_point("c");
        let vp = project.add_viewpoint("cam", 640, 480);
        project.add_observation(a, vp, 10.0, 20.0).unwrap();
        let line = project.add_line("ab", a, b).unwrap();
        {
            let l = project.line_mut(line).unwrap();
            l.direction = AxisDirection::X;
            l.target_length = Some(2.0);
            l.coincident.insert(c);
        }
        project
            .add_constraint(Constraint::new(
                "d",
                ConstraintKind::DistancePointPoint {
                    a,
                    b,
                    distance: 2.0,
                },
            ))
            .unwrap();
        project
            .add_constraint(Constraint::new(
                "proj",
                ConstraintKind::Projection {
                    point: a,
                    viewpoint: vp,
                    observed: Vector2::new(10.0, 20.0),
                },
            ))
            .unwrap();

        let layout = VariableLayout::build(&project, &LayoutOptions::default());
        let weights = SystemWeights {
            reprojection: 1e-4,
            regularization: 1.0,
        };
        let groups = residual_groups(&project, &layout, &weights);

        // distance + projection constraints, length + axis + coincident,
        // observation, quat-norm
        assert_eq!(groups.len(), 7);
        let projection_weights: Vec<f64> = groups
            .iter()
            .filter(|g| {
                matches!(g.kind, GroupKind::Observation(_))
                    || matches!(
                        g.kind,
                        GroupKind::Constraint(k)
                            if matches!(
                                project.constraint(k).unwrap().kind,
                                ConstraintKind::Projection { .. }
                            )
                    )
            })
            .map(|g| g.weight)
            .collect();
        assert_eq!(projection_weights, vec![1e-4, 1e-4]);
        assert!(has_geometric_residuals(&project));
    }

    #[test]
    fn projection_only_projects_are_not_geometric() {
        let mut project = Project::new();
        let a = project.add_point("a");
        let vp = project.add_viewpoint("cam", 640, 480);
        project.add_observation(a, vp, 1.0, 2.0).unwrap();
        assert!(!has_geometric_residuals(&project));
    }
}
