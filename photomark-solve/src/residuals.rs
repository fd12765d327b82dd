//! Residual formulas for every constraint variant, generic over the scalar.
//!
//! Both back ends evaluate residuals through this module: the autodiff system
//! instantiates it with tape [`Value`](photomark_autodiff::Value)s, the
//! explicit system with `f64`. A constraint with a missing operand yields an
//! empty residual vector and a warning; it is never fatal.

use photomark_autodiff::{Real, Var3};
use photomark_types::{ConstraintKind, Line, LineKey, PointKey, Project, ViewpointKey};

use crate::camera::{project_point, CameraParams, BEHIND_CAMERA_RESIDUAL};

/// Normalisation guard added under the square root of the coplanarity
/// denominator; keeps gradients scale-stable near degenerate base triangles.
pub const COPLANAR_EPSILON: f64 = 1e-10;

/// Provides operand values for one evaluation.
pub trait OperandSource<S: Real> {
    fn point(&self, key: PointKey) -> Option<Var3<S>>;
    fn camera(&self, key: ViewpointKey) -> Option<CameraParams<S>>;
    /// Any scalar of the evaluation context, used to lift constants.
    fn context(&self) -> S;
}

fn line_endpoints<S: Real, M: OperandSource<S>>(
    project: &Project,
    key: LineKey,
    source: &M,
) -> Option<(Var3<S>, Var3<S>)> {
    let line = project.line(key)?;
    Some((source.point(line.point_a)?, source.point(line.point_b)?))
}

fn angle_at_vertex<S: Real>(a: Var3<S>, vertex: Var3<S>, c: Var3<S>) -> S {
    (a - vertex).angle_between(c - vertex)
}

/// Evaluate one constraint. Missing operands yield an empty vector.
pub fn constraint_residuals<S: Real, M: OperandSource<S>>(
    project: &Project,
    kind: &ConstraintKind,
    source: &M,
) -> Vec<S> {
    let ctx = source.context();
    match kind {
        ConstraintKind::DistancePointPoint { a, b, distance } => {
            let (Some(a), Some(b)) = (source.point(*a), source.point(*b)) else {
                return missing(kind);
            };
            vec![(b - a).norm() - ctx.lift(*distance)]
        }
        ConstraintKind::AnglePointPointPoint {
            a,
            vertex,
            c,
            degrees,
        } => {
            let (Some(a), Some(v), Some(c)) = (
                source.point(*a),
                source.point(*vertex),
                source.point(*c),
            ) else {
                return missing(kind);
            };
            vec![angle_at_vertex(a, v, c) - ctx.lift(degrees.to_radians())]
        }
        ConstraintKind::FixedPoint { point, target } => {
            let Some(p) = source.point(*point) else {
                return missing(kind);
            };
            vec![
                p.x - ctx.lift(target.x),
                p.y - ctx.lift(target.y),
                p.z - ctx.lift(target.z),
            ]
        }
        ConstraintKind::CollinearPoints { points } => {
            let resolved: Option<Vec<Var3<S>>> =
                points.iter().map(|p| source.point(*p)).collect();
            let Some(pts) = resolved else {
                return missing(kind);
            };
            let mut out = Vec::with_capacity(3 * pts.len().saturating_sub(2));
            let base = pts[1] - pts[0];
            for extra in &pts[2..] {
                let cross = base.cross(*extra - pts[0]);
                out.extend([cross.x, cross.y, cross.z]);
            }
            out
        }
        ConstraintKind::CoplanarPoints { points } => {
            let resolved: Option<Vec<Var3<S>>> =
                points.iter().map(|p| source.point(*p)).collect();
            let Some(pts) = resolved else {
                return missing(kind);
            };
            // base plane through the first three points
            let normal = (pts[1] - pts[0]).cross(pts[2] - pts[0]);
            let denom = (normal.norm_squared() + ctx.lift(COPLANAR_EPSILON)).sqrt();
            pts[3..]
                .iter()
                .map(|p| (*p - pts[0]).dot(normal) / denom)
                .collect()
        }
        ConstraintKind::ParallelLines { a, b } => {
            let (Some((a0, a1)), Some((b0, b1))) = (
                line_endpoints(project, *a, source),
                line_endpoints(project, *b, source),
            ) else {
                return missing(kind);
            };
            let cross = (a1 - a0).normalized().cross((b1 - b0).normalized());
            vec![cross.x, cross.y, cross.z]
        }
        ConstraintKind::PerpendicularLines { a, b } => {
            let (Some((a0, a1)), Some((b0, b1))) = (
                line_endpoints(project, *a, source),
                line_endpoints(project, *b, source),
            ) else {
                return missing(kind);
            };
            vec![(a1 - a0).normalized().dot((b1 - b0).normalized())]
        }
        ConstraintKind::EqualDistances { pairs } => {
            let resolved: Option<Vec<(Var3<S>, Var3<S>)>> = pairs
                .iter()
                .map(|(a, b)| Some((source.point(*a)?, source.point(*b)?)))
                .collect();
            let Some(pairs) = resolved else {
                return missing(kind);
            };
            let first = (pairs[0].1 - pairs[0].0).norm();
            pairs[1..]
                .iter()
                .map(|(a, b)| (*b - *a).norm() - first)
                .collect()
        }
        ConstraintKind::EqualAngles { triplets } => {
            let resolved: Option<Vec<(Var3<S>, Var3<S>, Var3<S>)>> = triplets
                .iter()
                .map(|(a, v, c)| {
                    Some((source.point(*a)?, source.point(*v)?, source.point(*c)?))
                })
                .collect();
            let Some(triplets) = resolved else {
                return missing(kind);
            };
            let first = angle_at_vertex(triplets[0].0, triplets[0].1, triplets[0].2);
            triplets[1..]
                .iter()
                .map(|(a, v, c)| angle_at_vertex(*a, *v, *c) - first)
                .collect()
        }
        ConstraintKind::Projection {
            point,
            viewpoint,
            observed,
        } => {
            let (Some(p), Some(cam)) = (source.point(*point), source.camera(*viewpoint)) else {
                return missing(kind);
            };
            reprojection_residuals(&cam, p, observed.x, observed.y)
        }
    }
}

/// Reprojection residual pair; a behind-camera projection is penalised with a
/// large constant instead of producing NaN.
pub fn reprojection_residuals<S: Real>(
    cam: &CameraParams<S>,
    point: Var3<S>,
    observed_u: f64,
    observed_v: f64,
) -> Vec<S> {
    match project_point(cam, point) {
        Some((u, v)) => vec![u - u.lift(observed_u), v - v.lift(observed_v)],
        None => {
            let big = point.x.lift(BEHIND_CAMERA_RESIDUAL);
            vec![big, big]
        }
    }
}

/// ‖B−A‖ − targetLength for a line of known scale.
pub fn line_length_residuals<S: Real, M: OperandSource<S>>(
    project: &Project,
    key: LineKey,
    line: &Line,
    source: &M,
) -> Vec<S> {
    let Some(target) = line.target_length else {
        return Vec::new();
    };
    let Some((a, b)) = line_endpoints(project, key, source) else {
        warn_missing("line length");
        return Vec::new();
    };
    vec![(b - a).norm() - source.context().lift(target)]
}

/// Components of the normalised direction that the axis tag forces to zero.
pub fn line_axis_residuals<S: Real, M: OperandSource<S>>(
    project: &Project,
    key: LineKey,
    line: &Line,
    source: &M,
) -> Vec<S> {
    let zero = line.direction.zero_components();
    if zero.is_empty() {
        return Vec::new();
    }
    let Some((a, b)) = line_endpoints(project, key, source) else {
        warn_missing("line axis");
        return Vec::new();
    };
    let dir = (b - a).normalized().to_array();
    zero.iter().map(|k| dir[*k]).collect()
}

/// cross(P−A, B−A)/‖B−A‖ for each coincident point of a line.
pub fn coincident_residuals<S: Real, M: OperandSource<S>>(
    project: &Project,
    key: LineKey,
    coincident: PointKey,
    source: &M,
) -> Vec<S> {
    let (Some((a, b)), Some(p)) = (
        line_endpoints(project, key, source),
        source.point(coincident),
    ) else {
        warn_missing("coincident point");
        return Vec::new();
    };
    let dir = b - a;
    let cross = (p - a).cross(dir);
    let inv = dir.x.lift(1.0) / dir.norm();
    vec![cross.x * inv, cross.y * inv, cross.z * inv]
}

/// Soft unit-length residual `w² + x² + y² + z² − 1` for an optimised camera.
pub fn quat_norm_residual<S: Real>(cam: &CameraParams<S>) -> S {
    let one = cam.focal.lift(1.0);
    cam.rotation.norm_squared() - one
}

fn missing<S>(kind: &ConstraintKind) -> Vec<S> {
    tracing::warn!(
        constraint = kind.tag(),
        "constraint operand missing from value map; skipping"
    );
    Vec::new()
}

fn warn_missing(what: &str) {
    tracing::warn!("{what} operand missing from value map; skipping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};
    use photomark_types::{PointKey, Project};
    use std::collections::HashMap;

    /// f64 source backed by a plain map, for formula tests.
    pub(crate) struct MapSource {
        pub points: HashMap<PointKey, Vector3<f64>>,
    }

    impl OperandSource<f64> for MapSource {
        fn point(&self, key: PointKey) -> Option<Var3<f64>> {
            self.points
                .get(&key)
                .map(|v| Var3::new(v.x, v.y, v.z))
        }
        fn camera(&self, _key: ViewpointKey) -> Option<CameraParams<f64>> {
            None
        }
        fn context(&self) -> f64 {
            0.0
        }
    }

    fn project_with_points(coords: &[[f64; 3]]) -> (Project, Vec<PointKey>, MapSource) {
        let mut project = Project::new();
        let mut keys = Vec::new();
        let mut map = HashMap::new();
        for (i, c) in coords.iter().enumerate() {
            let k = project.add_point(format!("p{i}"));
            map.insert(k, Vector3::new(c[0], c[1], c[2]));
            keys.push(k);
        }
        (project, keys, MapSource { points: map })
    }

    #[test]
    fn distance_residual_zero_at_target() {
        let (project, keys, source) = project_with_points(&[[0.0; 3], [3.0, 4.0, 0.0]]);
        let kind = ConstraintKind::DistancePointPoint {
            a: keys[0],
            b: keys[1],
            distance: 5.0,
        };
        let r = constraint_residuals(&project, &kind, &source);
        assert_eq!(r.len(), 1);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn angle_residual_zero_at_target() {
        let (project, keys, source) =
            project_with_points(&[[1.0, 0.0, 0.0], [0.0; 3], [0.0, 2.0, 0.0]]);
        let kind = ConstraintKind::AnglePointPointPoint {
            a: keys[0],
            vertex: keys[1],
            c: keys[2],
            degrees: 90.0,
        };
        let r = constraint_residuals(&project, &kind, &source);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn collinear_zero_on_a_line_nonzero_off_it() {
        let (project, keys, mut source) =
            project_with_points(&[[0.0; 3], [1.0, 1.0, 1.0], [3.0, 3.0, 3.0]]);
        let kind = ConstraintKind::CollinearPoints {
            points: keys.clone(),
        };
        let r = constraint_residuals(&project, &kind, &source);
        assert_eq!(r.len(), 3);
        for v in &r {
            assert_relative_eq!(*v, 0.0, epsilon = 1e-10);
        }
        source
            .points
            .insert(keys[2], Vector3::new(3.0, 3.0, 3.5));
        let r = constraint_residuals(&project, &kind, &source);
        assert!(r.iter().any(|v| v.abs() > 1e-3));
    }

    #[test]
    fn coplanar_is_normalised_signed_distance() {
        let (project, keys, source) = project_with_points(&[
            [0.0; 3],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [5.0, 5.0, 2.5],
        ]);
        let kind = ConstraintKind::CoplanarPoints {
            points: keys.clone(),
        };
        let r = constraint_residuals(&project, &kind, &source);
        assert_eq!(r.len(), 1);
        // plane normal is (0, 0, 100); signed distance is the plain z offset
        assert_relative_eq!(r[0], 2.5, epsilon = 1e-8);
    }

    #[test]
    fn equal_distances_compare_against_first_pair() {
        let (project, keys, source) = project_with_points(&[
            [0.0; 3],
            [2.0, 0.0, 0.0],
            [0.0; 3],
            [0.0, 3.0, 0.0],
        ]);
        let kind = ConstraintKind::EqualDistances {
            pairs: vec![(keys[0], keys[1]), (keys[2], keys[3])],
        };
        let r = constraint_residuals(&project, &kind, &source);
        assert_eq!(r.len(), 1);
        assert_relative_eq!(r[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn perpendicular_lines_use_normalised_directions() {
        let mut project = Project::new();
        let coords = [
            [0.0, 0.0, 0.0],
            [5.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [1.0, 9.0, 0.0],
        ];
        let mut map = HashMap::new();
        let keys: Vec<PointKey> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let k = project.add_point(format!("p{i}"));
                map.insert(k, Vector3::new(c[0], c[1], c[2]));
                k
            })
            .collect();
        let la = project.add_line("a", keys[0], keys[1]).unwrap();
        let lb = project.add_line("b", keys[2], keys[3]).unwrap();
        let source = MapSource { points: map };

        let r = constraint_residuals(
            &project,
            &ConstraintKind::PerpendicularLines { a: la, b: lb },
            &source,
        );
        assert_eq!(r.len(), 1);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-12);

        let r = constraint_residuals(
            &project,
            &ConstraintKind::ParallelLines { a: la, b: lb },
            &source,
        );
        assert_eq!(r.len(), 3);
        assert_relative_eq!(r[2].abs(), 1.0, epsilon = 1e-12); // fully perpendicular
    }

    #[test]
    fn missing_operand_yields_empty_not_panic() {
        let (project, keys, _) = project_with_points(&[[0.0; 3], [1.0, 0.0, 0.0]]);
        let empty = MapSource {
            points: HashMap::new(),
        };
        let kind = ConstraintKind::DistancePointPoint {
            a: keys[0],
            b: keys[1],
            distance: 1.0,
        };
        assert!(constraint_residuals(&project, &kind, &empty).is_empty());
    }

    #[test]
    fn behind_camera_projection_is_penalised() {
        let mut project = Project::new();
        let pt = project.add_point("p");
        let vp = project.add_viewpoint("cam", 640, 480);
        // camera at origin looking down +z; world point behind it
        project.viewpoint_mut(vp).unwrap().position = Vector3::new(0.0, 0.0, 5.0);

        struct Source<'a> {
            project: &'a Project,
            coords: Vector3<f64>,
        }
        impl OperandSource<f64> for Source<'_> {
            fn point(&self, _key: PointKey) -> Option<Var3<f64>> {
                Some(Var3::new(self.coords.x, self.coords.y, self.coords.z))
            }
            fn camera(&self, key: ViewpointKey) -> Option<CameraParams<f64>> {
                self.project
                    .viewpoint(key)
                    .map(CameraParams::from_viewpoint)
            }
            fn context(&self) -> f64 {
                0.0
            }
        }

        let source = Source {
            project: &project,
            coords: Vector3::new(0.0, 0.0, 1.0),
        };
        let kind = ConstraintKind::Projection {
            point: pt,
            viewpoint: vp,
            observed: Vector2::new(320.0, 240.0),
        };
        let r = constraint_residuals(&project, &kind, &source);
        assert_eq!(r, vec![BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL]);
    }
}
