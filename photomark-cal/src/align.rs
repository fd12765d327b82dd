//! Rigid/similarity alignment of a provisional reconstruction onto the
//! user's metric anchors: locked points when available, axis-tagged lines
//! otherwise. The ± sign of an axis alignment is disambiguated by a second
//! agreeing axis tag or by trial solves; a tie within 1% is reported as
//! ambiguous rather than silently picked.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use photomark_solve::explicit_backend::{ExplicitLmSystem, ExplicitSystem};
use photomark_solve::{
    minimize, residual_groups, LayoutOptions, LinearSolver, LmOptions, SystemWeights,
    VariableLayout,
};
use photomark_types::{AxisState, PointKey, Project};

use crate::{InitError, Result};

/// Outcome of the scene-alignment pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// False when no anchor (locked points or axis tag) was available.
    pub applied: bool,
    /// True when the two trial orientations scored within 1% of each other.
    pub ambiguous: bool,
    /// The axis sign the applied alignment used (+1/−1); 0 for the
    /// locked-point path.
    pub sign_used: i8,
}

impl Alignment {
    pub fn skipped() -> Self {
        Self {
            applied: false,
            ambiguous: false,
            sign_used: 0,
        }
    }
}

/// Rigid Kabsch alignment `y ≈ R·x + t` (no scale).
pub fn rigid_align(x: &[Vector3<f64>], y: &[Vector3<f64>]) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    if x.len() != y.len() || x.is_empty() {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 1,
            got: x.len().min(y.len()),
        });
    }
    let n = x.len() as f64;
    let mu_x = x.iter().sum::<Vector3<f64>>() / n;
    let mu_y = y.iter().sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    for (a, b) in x.iter().zip(y.iter()) {
        h += (b - mu_y) * (a - mu_x).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u.ok_or(InitError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(InitError::SvdFailed)?;
    let mut s = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }
    let r = u * s * v_t;
    let t = mu_y - r * mu_x;
    Ok((r, t))
}

/// Kabsch-Umeyama similarity `y ≈ c·R·x + t`.
pub fn similarity_align(
    x: &[Vector3<f64>],
    y: &[Vector3<f64>],
) -> Result<(f64, Matrix3<f64>, Vector3<f64>)> {
    if x.len() != y.len() || x.len() < 2 {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 2,
            got: x.len().min(y.len()),
        });
    }
    let n = x.len() as f64;
    let mu_x = x.iter().sum::<Vector3<f64>>() / n;
    let mu_y = y.iter().sum::<Vector3<f64>>() / n;

    let mut cov = Matrix3::zeros();
    let mut var_x = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        let xc = a - mu_x;
        let yc = b - mu_y;
        cov += yc * xc.transpose() / n;
        var_x += xc.norm_squared() / n;
    }
    if var_x < 1e-18 {
        return Err(InitError::SvdFailed);
    }

    let svd = cov.svd(true, true);
    let u = svd.u.ok_or(InitError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(InitError::SvdFailed)?;
    let d = svd.singular_values;

    let mut s = Matrix3::identity();
    if u.determinant() * v_t.determinant() < 0.0 {
        s[(2, 2)] = -1.0;
    }
    let r = u * s * v_t;
    let c = (Matrix3::from_diagonal(&d) * s).trace() / var_x;
    let t = mu_y - r * mu_x * c;
    Ok((c, r, t))
}

/// Apply `X ↦ c·R·X + t` to every optimised point and every camera pose.
/// Projections are invariant under the transform (camera rotations compose
/// with `Rᵀ`; the scale folds into depth).
pub fn apply_similarity(project: &mut Project, c: f64, r: &Matrix3<f64>, t: &Vector3<f64>) {
    let r_quat =
        UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(*r));
    let point_keys: Vec<PointKey> = project.points().map(|(k, _)| k).collect();
    for key in point_keys {
        if let Some(xyz) = project.point(key).and_then(|p| p.optimized_xyz) {
            let _ = project.set_optimized_xyz(key, c * (r * xyz) + t);
        }
    }
    let vp_keys: Vec<_> = project.viewpoints().map(|(k, _)| k).collect();
    for key in vp_keys {
        let vp = project.viewpoint(key).expect("enumerated above");
        let position = c * (r * vp.position) + t;
        let rotation = (vp.unit_rotation() * r_quat.inverse()).into_inner();
        let _ = project.set_viewpoint_pose(key, position, rotation);
    }
}

/// Fully locked points that already carry a solver position.
fn locked_anchors(project: &Project) -> Vec<(PointKey, Vector3<f64>, Vector3<f64>)> {
    project
        .points()
        .filter_map(|(key, p)| {
            let locked = Vector3::new(
                p.axes[0].locked_value()?,
                p.axes[1].locked_value()?,
                p.axes[2].locked_value()?,
            );
            let current = p.optimized_xyz?;
            Some((key, current, locked))
        })
        .collect()
}

/// Cost of a short trial solve on a clone of the project; used to pick the
/// axis-alignment sign.
fn trial_cost(project: &Project, iterations: usize) -> Result<f64> {
    let mut trial = project.clone();
    let mut layout = VariableLayout::build(&trial, &LayoutOptions::default());
    let weights = SystemWeights {
        reprojection: if photomark_solve::has_geometric_residuals(&trial) {
            1e-4
        } else {
            1.0
        },
        regularization: 1.0,
    };
    let groups = residual_groups(&trial, &layout, &weights);
    let system = ExplicitSystem::from_groups(&trial, &mut layout, &groups);
    let mut lm_system = ExplicitLmSystem {
        layout: &layout,
        system,
    };
    let mut vars = layout.initial_values();
    let opts = LmOptions {
        max_iterations: iterations.clamp(30, 500),
        tolerance: 1e-10,
        linear_solver: LinearSolver::Dense,
        ..LmOptions::default()
    };
    let report = minimize(&mut lm_system, &mut vars, &opts)?;
    layout.apply(&mut trial, &vars);
    Ok(report.final_cost)
}

/// Rotation taking unit vector `from` onto unit vector `to`.
fn rotation_between(from: &Vector3<f64>, to: &Vector3<f64>) -> Matrix3<f64> {
    match UnitQuaternion::rotation_between(from, to) {
        Some(q) => *q.to_rotation_matrix().matrix(),
        // antiparallel: rotate π about any perpendicular
        None => {
            let perp = if from.x.abs() < 0.9 {
                from.cross(&Vector3::x()).normalize()
            } else {
                from.cross(&Vector3::y()).normalize()
            };
            *UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(perp), std::f64::consts::PI)
                .to_rotation_matrix()
                .matrix()
        }
    }
}

fn line_direction(project: &Project, line: &photomark_types::Line) -> Option<Vector3<f64>> {
    let a = project.point(line.point_a)?.optimized_xyz?;
    let b = project.point(line.point_b)?.optimized_xyz?;
    let d = b - a;
    (d.norm() > 1e-12).then(|| d.normalize())
}

/// Error of every axis-tagged line against its axis under a candidate
/// rotation. The dot product is signed: the A→B orientation of a tagged
/// line is taken to point toward the positive axis, which is what lets a
/// second tag break the ± ambiguity of the first.
fn axis_tag_error(project: &Project, r: &Matrix3<f64>) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0;
    for (_, line) in project.lines() {
        let Some(axis) = line.direction.single_axis() else {
            continue;
        };
        let Some(dir) = line_direction(project, line) else {
            continue;
        };
        total += 1.0 - (r * dir).dot(&axis.unit());
        count += 1;
    }
    (count > 0).then_some(total)
}

/// Align the scene onto its metric anchors.
///
/// With ≥2 fully locked points, a similarity transform maps the current
/// reconstruction onto the locked targets and the locked points snap exactly
/// afterward. Otherwise the first axis-tagged line orients the scene, with
/// the sign picked by a second agreeing tag or by trial solves (ambiguity
/// within 1% is reported, not hidden).
pub fn align_scene(project: &mut Project, trial_iterations: usize) -> Result<Alignment> {
    align_scene_with_sign(project, trial_iterations, None)
}

/// [`align_scene`] with the axis sign forced by the caller; the way out of an
/// ambiguous alignment.
pub fn align_scene_with_sign(
    project: &mut Project,
    trial_iterations: usize,
    forced_sign: Option<i8>,
) -> Result<Alignment> {
    let anchors = locked_anchors(project);
    if anchors.len() >= 2 {
        let current: Vec<Vector3<f64>> = anchors.iter().map(|(_, cur, _)| *cur).collect();
        let target: Vec<Vector3<f64>> = anchors.iter().map(|(_, _, tgt)| *tgt).collect();
        let (c, r, t) = similarity_align(&current, &target)?;
        apply_similarity(project, c, &r, &t);
        // collinear anchors leave the roll about their axis undetermined;
        // fix it the same way the axis path does
        if let Some(axis) = collinear_axis(&target) {
            resolve_roll(project, &axis, &target[0]);
        }
        // snap locked points exactly onto their targets
        for (key, _, target) in anchors {
            let _ = project.set_optimized_xyz(key, target);
        }
        return Ok(Alignment {
            applied: true,
            ambiguous: false,
            sign_used: 0,
        });
    }

    // axis-tagged-line path
    let tagged: Vec<(Vector3<f64>, Vector3<f64>)> = project
        .lines()
        .filter_map(|(_, line)| {
            let axis = line.direction.single_axis()?;
            let dir = line_direction(project, line)?;
            Some((dir, axis.unit()))
        })
        .collect();
    let Some((dir, axis)) = tagged.first().copied() else {
        return Ok(Alignment::skipped());
    };

    let r_plus = rotation_between(&dir, &axis);
    let r_minus = rotation_between(&dir, &(-axis));

    let mut ambiguous = false;
    let sign = if let Some(forced) = forced_sign {
        if forced >= 0 {
            1
        } else {
            -1
        }
    } else if tagged.len() >= 2 {
        // a second tag votes
        let e_plus = axis_tag_error(project, &r_plus).unwrap_or(f64::INFINITY);
        let e_minus = axis_tag_error(project, &r_minus).unwrap_or(f64::INFINITY);
        if e_plus <= e_minus {
            1i8
        } else {
            -1
        }
    } else {
        // trial solves in both orientations
        let mut plus = project.clone();
        apply_similarity(&mut plus, 1.0, &r_plus, &Vector3::zeros());
        let mut minus = project.clone();
        apply_similarity(&mut minus, 1.0, &r_minus, &Vector3::zeros());
        let cost_plus = trial_cost(&plus, trial_iterations)?;
        let cost_minus = trial_cost(&minus, trial_iterations)?;
        let scale = cost_plus.max(cost_minus).max(1e-300);
        if (cost_plus - cost_minus).abs() / scale < 0.01 {
            ambiguous = true;
        }
        if cost_plus <= cost_minus {
            1
        } else {
            -1
        }
    };

    let r = if sign > 0 { r_plus } else { r_minus };
    apply_similarity(project, 1.0, &r, &Vector3::zeros());
    resolve_roll(project, &axis, &Vector3::zeros());

    Ok(Alignment {
        applied: true,
        ambiguous,
        sign_used: sign,
    })
}

/// The common axis of a collinear anchor set, `None` when the anchors span a
/// plane (three well-spread anchors pin the rotation completely).
fn collinear_axis(targets: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    if (targets[1] - targets[0]).norm() < 1e-12 {
        return None;
    }
    let axis = (targets[1] - targets[0]).normalize();
    let spread = targets[2..]
        .iter()
        .map(|t| (t - targets[0]).cross(&axis).norm())
        .fold(0.0f64, f64::max);
    (spread < 1e-9).then_some(axis)
}

/// Resolve the free rotation about `axis` (through `pivot`) by bringing the
/// camera baseline onto a canonical perpendicular direction.
fn resolve_roll(project: &mut Project, axis: &Vector3<f64>, pivot: &Vector3<f64>) {
    let cams: Vec<Vector3<f64>> = project.viewpoints().map(|(_, v)| v.position).collect();
    if cams.len() < 2 {
        return;
    }
    let baseline = cams[1] - cams[0];
    let in_plane = baseline - axis * baseline.dot(axis);
    if in_plane.norm() <= 1e-9 {
        return;
    }
    let canonical = {
        let c = canonical_perpendicular(axis);
        (c - axis * c.dot(axis)).normalize()
    };
    let from = in_plane.normalize();
    let angle = from.cross(&canonical).dot(axis).atan2(from.dot(&canonical));
    let roll = *UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(*axis), angle)
        .to_rotation_matrix()
        .matrix();
    let shift = pivot - roll * pivot;
    apply_similarity(project, 1.0, &roll, &shift);
}

fn canonical_perpendicular(axis: &Vector3<f64>) -> Vector3<f64> {
    if axis.x.abs() > 0.9 {
        Vector3::y()
    } else {
        Vector3::x()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;
    use photomark_types::AxisDirection;

    #[test]
    fn similarity_recovers_a_known_transform() {
        let x: Vec<Vector3<f64>> = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.3, 0.4, 1.2),
        ];
        let c_true = 2.5;
        let r_true = *Rotation3::from_euler_angles(0.3, -0.2, 0.8).matrix();
        let t_true = Vector3::new(-1.0, 2.0, 0.5);
        let y: Vec<Vector3<f64>> = x.iter().map(|p| c_true * (r_true * p) + t_true).collect();

        let (c, r, t) = similarity_align(&x, &y).unwrap();
        assert_relative_eq!(c, c_true, epsilon = 1e-10);
        assert_relative_eq!(r, r_true, epsilon = 1e-10);
        assert_relative_eq!(t, t_true, epsilon = 1e-10);
    }

    #[test]
    fn rigid_align_recovers_rotation_translation() {
        let x: Vec<Vector3<f64>> = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 2.0, 0.5),
        ];
        let r_true = *Rotation3::from_euler_angles(-0.4, 0.1, 0.25).matrix();
        let t_true = Vector3::new(0.7, -0.3, 1.1);
        let y: Vec<Vector3<f64>> = x.iter().map(|p| r_true * p + t_true).collect();

        let (r, t) = rigid_align(&x, &y).unwrap();
        assert_relative_eq!(r, r_true, epsilon = 1e-10);
        assert_relative_eq!(t, t_true, epsilon = 1e-10);
    }

    #[test]
    fn locked_points_snap_exactly() {
        let mut project = Project::new();
        let a = project.add_point("a");
        let b = project.add_point("b");
        let c = project.add_point("c");
        let d = project.add_point("d");
        for (key, lock) in [
            (a, Vector3::new(0.0, 0.0, 0.0)),
            (b, Vector3::new(2.0, 0.0, 0.0)),
            (c, Vector3::new(0.0, 2.0, 0.0)),
        ] {
            project.point_mut(key).unwrap().axes = [
                AxisState::Locked(lock.x),
                AxisState::Locked(lock.y),
                AxisState::Locked(lock.z),
            ];
        }
        // provisional reconstruction: scaled by 2, rotated 90° about z,
        // shifted
        let r = *Rotation3::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2).matrix();
        let place = |w: Vector3<f64>| 2.0 * (r * w) + Vector3::new(1.0, 1.0, 1.0);
        project.set_optimized_xyz(a, place(Vector3::zeros())).unwrap();
        project
            .set_optimized_xyz(b, place(Vector3::new(2.0, 0.0, 0.0)))
            .unwrap();
        project
            .set_optimized_xyz(c, place(Vector3::new(0.0, 2.0, 0.0)))
            .unwrap();
        project
            .set_optimized_xyz(d, place(Vector3::new(1.0, 1.0, 0.0)))
            .unwrap();

        let alignment = align_scene(&mut project, 50).unwrap();
        assert!(alignment.applied);
        assert!(!alignment.ambiguous);

        let a_xyz = project.point(a).unwrap().optimized_xyz.unwrap();
        assert_relative_eq!(a_xyz, Vector3::zeros(), epsilon = 1e-12);
        let b_xyz = project.point(b).unwrap().optimized_xyz.unwrap();
        assert_relative_eq!(b_xyz, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
        // the free point follows the similarity
        let d_xyz = project.point(d).unwrap().optimized_xyz.unwrap();
        assert_relative_eq!(d_xyz, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn second_axis_tag_fixes_the_sign() {
        let mut project = Project::new();
        let a = project.add_point("a");
        let b = project.add_point("b");
        let c = project.add_point("c");
        let d = project.add_point("d");
        // reconstruction where the x-tagged line currently points along −y
        project.set_optimized_xyz(a, Vector3::zeros()).unwrap();
        project
            .set_optimized_xyz(b, Vector3::new(0.0, -3.0, 0.0))
            .unwrap();
        project.set_optimized_xyz(c, Vector3::zeros()).unwrap();
        project
            .set_optimized_xyz(d, Vector3::new(2.0, 0.0, 0.0))
            .unwrap();
        let ab = project.add_line("ab", a, b).unwrap();
        project.line_mut(ab).unwrap().direction = AxisDirection::X;
        let cd = project.add_line("cd", c, d).unwrap();
        project.line_mut(cd).unwrap().direction = AxisDirection::Y;

        let alignment = align_scene(&mut project, 50).unwrap();
        assert!(alignment.applied);
        assert!(!alignment.ambiguous);

        let b_xyz = project.point(b).unwrap().optimized_xyz.unwrap();
        let dir = (b_xyz - project.point(a).unwrap().optimized_xyz.unwrap()).normalize();
        // line ab now runs along +x, the sign that keeps cd pointing to +y
        assert!(dir.x > 0.999, "ab direction {dir}");
        let d_dir = (project.point(d).unwrap().optimized_xyz.unwrap()
            - project.point(c).unwrap().optimized_xyz.unwrap())
        .normalize();
        assert!(d_dir.y > 0.999, "cd direction {d_dir}");
    }

    #[test]
    fn forced_sign_overrides_disambiguation() {
        let mut project = Project::new();
        let a = project.add_point("a");
        let b = project.add_point("b");
        project.set_optimized_xyz(a, Vector3::zeros()).unwrap();
        project
            .set_optimized_xyz(b, Vector3::new(0.0, -3.0, 0.0))
            .unwrap();
        let ab = project.add_line("ab", a, b).unwrap();
        project.line_mut(ab).unwrap().direction = AxisDirection::X;

        let alignment = align_scene_with_sign(&mut project, 50, Some(-1)).unwrap();
        assert_eq!(alignment.sign_used, -1);
        assert!(!alignment.ambiguous);

        let dir = (project.point(b).unwrap().optimized_xyz.unwrap()
            - project.point(a).unwrap().optimized_xyz.unwrap())
        .normalize();
        assert!(dir.x < -0.999, "ab direction {dir}");
    }

    #[test]
    fn no_anchor_is_reported_as_skipped() {
        let mut project = Project::new();
        let a = project.add_point("a");
        project.set_optimized_xyz(a, Vector3::zeros()).unwrap();
        let alignment = align_scene(&mut project, 50).unwrap();
        assert_eq!(alignment, Alignment::skipped());
    }
}
