//! Camera pose from 3D↔2D correspondences: closed-form P3P for 3-4 points,
//! DLT for larger sets, and a geometric-centroid fallback. Every candidate
//! is polished by a short pose-only LM with the world points held fixed; the
//! winner is the candidate with the lowest reprojection error that keeps at
//! least half the points in front of the camera.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector2, Vector3};

use photomark_solve::explicit_backend::{ExplicitLmSystem, ExplicitSystem};
use photomark_solve::{
    minimize, project_to_pixel, residual_groups, LayoutOptions, LmOptions, SystemWeights,
    VariableLayout,
};
use photomark_types::{AxisState, Project, Viewpoint};

use crate::align::rigid_align;
use crate::rq::rq_decomposition;
use crate::{InitError, Result};

/// A refined, scored pose candidate.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub rotation: UnitQuaternion<f64>,
    pub position: Vector3<f64>,
    pub mean_reprojection_error: f64,
    pub fraction_in_front: f64,
}

// ---- P3P -------------------------------------------------------------------

/// Ascending-coefficient polynomial product.
fn polymul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Real roots of a polynomial (ascending coefficients) via the companion
/// matrix.
fn real_roots(mut coeffs: Vec<f64>) -> Vec<f64> {
    while coeffs.last().is_some_and(|c| c.abs() < 1e-14) {
        coeffs.pop();
    }
    let n = coeffs.len();
    if n < 2 {
        return Vec::new();
    }
    let degree = n - 1;
    let lead = coeffs[degree];
    let mut companion = DMatrix::zeros(degree, degree);
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }
    for i in 0..degree {
        companion[(i, degree - 1)] = -coeffs[i] / lead;
    }
    companion
        .complex_eigenvalues()
        .iter()
        .filter(|e| e.im.abs() < 1e-8)
        .map(|e| e.re)
        .collect()
}

/// Closed-form P3P: camera poses consistent with three bearing vectors and
/// their world points. Reduces the depth-ratio system to a quartic.
pub fn p3p_candidates(
    bearings: &[Vector3<f64>; 3],
    world: &[Vector3<f64>; 3],
) -> Vec<(UnitQuaternion<f64>, Vector3<f64>)> {
    let f1 = bearings[0].normalize();
    let f2 = bearings[1].normalize();
    let f3 = bearings[2].normalize();

    let dist_a = (world[1] - world[2]).norm(); // opposite vertex 1
    let dist_b = (world[0] - world[2]).norm(); // opposite vertex 2
    let dist_c = (world[0] - world[1]).norm(); // opposite vertex 3
    if dist_a < 1e-12 || dist_b < 1e-12 || dist_c < 1e-12 {
        return Vec::new();
    }

    let cos_alpha = f2.dot(&f3);
    let cos_beta = f1.dot(&f3);
    let cos_gamma = f1.dot(&f2);

    let big_a = dist_a * dist_a;
    let big_b = dist_b * dist_b;
    let big_c = dist_c * dist_c;
    let k = big_c / big_b;
    let m = big_a / big_b;

    // With u = s2/s1, v = s3/s1 the depth system reduces to
    //   N(v)² − 2·cosγ·N(v)·d(v) + d(v)²·e(v) = 0
    // where u = N(v)/d(v).
    let n_poly = [
        1.0 + (m - k),
        -2.0 * cos_beta * (m - k),
        -1.0 + (m - k),
    ];
    let d_poly = [2.0 * cos_gamma, -2.0 * cos_alpha];
    let e_poly = [1.0 - k, 2.0 * k * cos_beta, -k];

    let mut quartic = polymul(&n_poly, &n_poly);
    for (i, v) in polymul(&n_poly, &d_poly).iter().enumerate() {
        quartic[i] -= 2.0 * cos_gamma * v;
    }
    for (i, v) in polymul(&polymul(&d_poly, &d_poly), &e_poly)
        .iter()
        .enumerate()
    {
        quartic[i] += v;
    }

    let mut out = Vec::new();
    for v in real_roots(quartic) {
        if v <= 0.0 {
            continue;
        }
        let d_val = d_poly[0] + d_poly[1] * v;
        if d_val.abs() < 1e-9 {
            continue;
        }
        let u = (n_poly[0] + n_poly[1] * v + n_poly[2] * v * v) / d_val;
        if u <= 0.0 {
            continue;
        }
        let denom = 1.0 + v * v - 2.0 * v * cos_beta;
        if denom <= 1e-12 {
            continue;
        }
        let s1 = (big_b / denom).sqrt();
        let s2 = u * s1;
        let s3 = v * s1;

        let cam_pts = [f1 * s1, f2 * s2, f3 * s3];
        let Ok((r, t)) = rigid_align(world, &cam_pts) else {
            continue;
        };
        let rotation =
            UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(r));
        let position = -(r.transpose() * t);
        out.push((rotation, position));
    }
    out
}

// ---- DLT -------------------------------------------------------------------

/// Camera centre as the right null vector of the projection matrix
/// (`P·C̃ = 0`), the same null-space solve the triangulation and
/// essential-matrix steps use.
fn pmat_camera_center(
    p: &nalgebra::OMatrix<f64, nalgebra::U3, nalgebra::U4>,
) -> Result<Vector3<f64>> {
    let mut a = DMatrix::zeros(3, 4);
    for row in 0..3 {
        for col in 0..4 {
            a[(row, col)] = p[(row, col)];
        }
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(InitError::SvdFailed)?;
    let h = v_t.row(v_t.nrows() - 1);
    if h[3].abs() < 1e-12 {
        // centre at infinity: the projection matrix is degenerate
        return Err(InitError::PnpFailed);
    }
    Ok(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// Pose from a DLT projection matrix (≥6 correspondences). The intrinsics
/// factor of the RQ split is discarded; the viewpoint keeps its own.
pub fn dlt_pose(
    corrs: &[(Vector3<f64>, Vector2<f64>)],
) -> Result<(UnitQuaternion<f64>, Vector3<f64>)> {
    if corrs.len() < 6 {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 6,
            got: corrs.len(),
        });
    }
    let points: Vec<dlt::CorrespondingPoint<f64>> = corrs
        .iter()
        .map(|(w, px)| dlt::CorrespondingPoint {
            object_point: [w.x, w.y, w.z],
            image_point: [px.x, px.y],
        })
        .collect();
    let pmat = dlt::dlt_corresponding(&points, 1e-10).map_err(|_| InitError::PnpFailed)?;

    let m: Matrix3<f64> = pmat.fixed_view::<3, 3>(0, 0).into_owned();
    let (rotation, _intrinsics) = rq_decomposition(m)?;
    let position = pmat_camera_center(&pmat)?;
    Ok((rotation, position))
}

// ---- candidate scoring and refinement --------------------------------------

fn viewpoint_with_pose(
    template: &Viewpoint,
    rotation: &UnitQuaternion<f64>,
    position: &Vector3<f64>,
) -> Viewpoint {
    let mut vp = template.clone();
    vp.position = *position;
    vp.rotation = *rotation.quaternion();
    vp
}

fn score_pose(vp: &Viewpoint, corrs: &[(Vector3<f64>, Vector2<f64>)]) -> (f64, f64) {
    let mut in_front = 0usize;
    let mut err_sum = 0.0;
    for (world, observed) in corrs {
        match project_to_pixel(vp, world) {
            Some(projected) => {
                in_front += 1;
                err_sum += (projected - observed).norm();
            }
            None => {}
        }
    }
    if in_front == 0 {
        return (f64::INFINITY, 0.0);
    }
    (
        err_sum / in_front as f64,
        in_front as f64 / corrs.len() as f64,
    )
}

/// Polish one pose candidate by a short LM on the camera variables only,
/// with every world point locked in place.
fn refine_pose(
    template: &Viewpoint,
    rotation: &UnitQuaternion<f64>,
    position: &Vector3<f64>,
    corrs: &[(Vector3<f64>, Vector2<f64>)],
    max_iterations: usize,
) -> Result<(UnitQuaternion<f64>, Vector3<f64>)> {
    let mut project = Project::new();
    let vp_key = project.add_viewpoint(
        template.name.clone(),
        template.image_width,
        template.image_height,
    );
    {
        let vp = project.viewpoint_mut(vp_key).expect("just created");
        vp.position = *position;
        vp.rotation = *rotation.quaternion();
        vp.focal_length = template.focal_length;
        vp.aspect_ratio = template.aspect_ratio;
        vp.principal_point = template.principal_point;
        vp.skew = template.skew;
        vp.radial = template.radial;
        vp.tangential = template.tangential;
        vp.is_z_reflected = template.is_z_reflected;
    }
    for (i, (world, pixel)) in corrs.iter().enumerate() {
        let p = project.add_point(format!("anchor{i}"));
        project.point_mut(p).expect("just created").axes = [
            AxisState::Locked(world.x),
            AxisState::Locked(world.y),
            AxisState::Locked(world.z),
        ];
        project
            .add_observation(p, vp_key, pixel.x, pixel.y)
            .map_err(|_| InitError::PnpFailed)?;
    }

    let mut layout = VariableLayout::build(&project, &LayoutOptions::default());
    let groups = residual_groups(&project, &layout, &SystemWeights::default());
    let system = ExplicitSystem::from_groups(&project, &mut layout, &groups);
    let mut lm_system = ExplicitLmSystem {
        layout: &layout,
        system,
    };
    let mut vars = layout.initial_values();
    let opts = LmOptions {
        max_iterations,
        tolerance: 1e-12,
        ..LmOptions::default()
    };
    minimize(&mut lm_system, &mut vars, &opts)?;
    layout.apply(&mut project, &vars);

    let vp = project.viewpoint(vp_key).expect("still there");
    let rotation = UnitQuaternion::from_quaternion(vp.rotation);
    Ok((rotation, vp.position))
}

fn centroid_and_extent(points: impl Iterator<Item = Vector3<f64>>) -> (Vector3<f64>, f64) {
    let pts: Vec<Vector3<f64>> = points.collect();
    if pts.is_empty() {
        return (Vector3::zeros(), 1.0);
    }
    let centroid = pts.iter().sum::<Vector3<f64>>() / pts.len() as f64;
    let extent = pts
        .iter()
        .map(|p| (p - centroid).norm())
        .fold(0.0f64, f64::max)
        .max(1.0);
    (centroid, extent)
}

/// Pose of one extra viewpoint from its 3D↔2D correspondences.
///
/// Candidates come from DLT (≥6 points) and P3P (first three points); a
/// geometric-centroid stand-off always participates as the fallback. Each
/// candidate is LM-refined before scoring.
pub fn estimate_pose(
    template: &Viewpoint,
    corrs: &[(Vector3<f64>, Vector2<f64>)],
    refine_iterations: usize,
) -> Result<PoseEstimate> {
    if corrs.len() < 3 {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 3,
            got: corrs.len(),
        });
    }

    let mut candidates: Vec<(UnitQuaternion<f64>, Vector3<f64>)> = Vec::new();

    if corrs.len() >= 6 {
        match dlt_pose(corrs) {
            Ok(pose) => candidates.push(pose),
            Err(err) => tracing::debug!(%err, "DLT pose failed; falling through"),
        }
    }

    {
        let bearing = |px: &Vector2<f64>| {
            let xn = (px.x - template.principal_point.x) / template.focal_length;
            let yn = (px.y - template.principal_point.y)
                / (template.focal_length * template.aspect_ratio);
            Vector3::new(xn, yn, 1.0)
        };
        let bearings = [
            bearing(&corrs[0].1),
            bearing(&corrs[1].1),
            bearing(&corrs[2].1),
        ];
        let world = [corrs[0].0, corrs[1].0, corrs[2].0];
        candidates.extend(p3p_candidates(&bearings, &world));
    }

    // geometric-centroid stand-off
    let (centroid, extent) = centroid_and_extent(corrs.iter().map(|(w, _)| *w));
    candidates.push((
        UnitQuaternion::identity(),
        centroid - Vector3::z() * 2.5 * extent,
    ));

    let mut best: Option<PoseEstimate> = None;
    for (rotation, position) in candidates {
        let (rotation, position) =
            match refine_pose(template, &rotation, &position, corrs, refine_iterations) {
                Ok(refined) => refined,
                Err(err) => {
                    tracing::debug!(%err, "pose refinement failed; scoring raw candidate");
                    (rotation, position)
                }
            };
        let vp = viewpoint_with_pose(template, &rotation, &position);
        let (mean_err, fraction) = score_pose(&vp, corrs);
        let candidate = PoseEstimate {
            rotation,
            position,
            mean_reprojection_error: mean_err,
            fraction_in_front: fraction,
        };
        let better = match &best {
            None => true,
            Some(current) => {
                let cand_ok = candidate.fraction_in_front >= 0.5;
                let curr_ok = current.fraction_in_front >= 0.5;
                match (cand_ok, curr_ok) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => candidate.mean_reprojection_error < current.mean_reprojection_error,
                }
            }
        };
        if better {
            best = Some(candidate);
        }
    }

    best.filter(|b| b.fraction_in_front > 0.0)
        .ok_or(InitError::PnpFailed)
}
