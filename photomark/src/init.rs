//! The structure-from-motion initialization pipeline.
//!
//! Three regimes, chosen by counting vanishing-point-calibratable
//! viewpoints: VP calibration per camera (preferred), essential-matrix
//! two-view reconstruction (exactly two cameras, ≥8 shared observations),
//! or default placement. Extra viewpoints are then registered one at a time
//! by PnP, the scene is rigidly aligned to its metric anchors, and the
//! caller runs the full solve.

use std::collections::{HashMap, HashSet};

use nalgebra::{Matrix3x4, Vector2, Vector3};

use photomark_cal::{
    align_scene, calibrate_from_vanishing_points, estimate_pose, reconstruct_two_view, Alignment,
};
use photomark_cal::triangulate::{pose_matrix, triangulate};
use photomark_cal::vanishing::position_from_known_points;
use photomark_types::{PointKey, Project, ViewpointKey};

use crate::{Result, SolveOptions};

/// Intrinsics-normalised image coordinates of one observation (skew is
/// ignored here; it is refined away by the bundle solve).
fn normalized_coords(project: &Project, vp_key: ViewpointKey, u: f64, v: f64) -> Vector2<f64> {
    let vp = project.viewpoint(vp_key).expect("observation owner exists");
    Vector2::new(
        (u - vp.principal_point.x) / vp.focal_length,
        (v - vp.principal_point.y) / (vp.focal_length * vp.aspect_ratio),
    )
}

fn camera_pose_matrix(project: &Project, vp_key: ViewpointKey) -> Matrix3x4<f64> {
    let vp = project.viewpoint(vp_key).expect("posed viewpoint exists");
    pose_matrix(
        vp.unit_rotation().to_rotation_matrix().matrix(),
        &vp.position,
    )
}

/// Points whose coordinates can seed PnP or triangulation right now.
fn initially_known_points(project: &Project) -> HashSet<PointKey> {
    project
        .points()
        .filter(|(_, p)| p.is_fully_constrained())
        .map(|(k, _)| k)
        .collect()
}

fn known_position(
    project: &Project,
    known: &HashSet<PointKey>,
    key: PointKey,
) -> Option<Vector3<f64>> {
    if !known.contains(&key) {
        return None;
    }
    project.point(key).and_then(|p| p.effective_xyz())
}

fn centroid_and_extent(project: &Project, known: &HashSet<PointKey>) -> (Vector3<f64>, f64) {
    let pts: Vec<Vector3<f64>> = known
        .iter()
        .filter_map(|k| project.point(*k).and_then(|p| p.effective_xyz()))
        .collect();
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

/// 3D↔2D correspondences of a viewpoint against the currently known points.
fn correspondences(
    project: &Project,
    known: &HashSet<PointKey>,
    vp_key: ViewpointKey,
) -> Vec<(Vector3<f64>, Vector2<f64>)> {
    let Some(vp) = project.viewpoint(vp_key) else {
        return Vec::new();
    };
    vp.observations()
        .filter_map(|obs_key| {
            let obs = project.observation(obs_key)?;
            let world = known_position(project, known, obs.world_point)?;
            Some((world, Vector2::new(obs.u, obs.v)))
        })
        .collect()
}

/// Triangulate every point that is observed by at least two posed cameras
/// and does not have a usable position yet.
fn triangulate_points(
    project: &mut Project,
    posed: &HashSet<ViewpointKey>,
    known: &mut HashSet<PointKey>,
) {
    // fully-constrained points are triangulated too: their optimized cache
    // must carry the current reconstruction position so the alignment pass
    // can map it onto the locked target
    let work: Vec<(PointKey, Vec<(Matrix3x4<f64>, Vector2<f64>)>)> = project
        .points()
        .map(|(key, point)| {
            let views: Vec<(Matrix3x4<f64>, Vector2<f64>)> = point
                .observations()
                .filter_map(|obs_key| {
                    let obs = project.observation(obs_key)?;
                    if !posed.contains(&obs.viewpoint) {
                        return None;
                    }
                    let norm = normalized_coords(project, obs.viewpoint, obs.u, obs.v);
                    Some((camera_pose_matrix(project, obs.viewpoint), norm))
                })
                .collect();
            (key, views)
        })
        .collect();

    for (key, views) in work {
        if views.len() < 2 {
            continue;
        }
        if let Some(xyz) = triangulate(&views) {
            let _ = project.set_optimized_xyz(key, xyz);
            known.insert(key);
        }
    }
}

/// Matches shared by two viewpoints, as (point, normalised-1, normalised-2).
fn shared_observations(
    project: &Project,
    vp1: ViewpointKey,
    vp2: ViewpointKey,
) -> Vec<(PointKey, Vector2<f64>, Vector2<f64>)> {
    let mut first: HashMap<PointKey, Vector2<f64>> = HashMap::new();
    if let Some(vp) = project.viewpoint(vp1) {
        for obs_key in vp.observations() {
            if let Some(obs) = project.observation(obs_key) {
                first.insert(
                    obs.world_point,
                    normalized_coords(project, vp1, obs.u, obs.v),
                );
            }
        }
    }
    let mut out = Vec::new();
    if let Some(vp) = project.viewpoint(vp2) {
        for obs_key in vp.observations() {
            if let Some(obs) = project.observation(obs_key) {
                if let Some(n1) = first.get(&obs.world_point) {
                    out.push((
                        obs.world_point,
                        *n1,
                        normalized_coords(project, vp2, obs.u, obs.v),
                    ));
                }
            }
        }
    }
    out
}

/// Vanishing-point regime: calibrate each qualifying viewpoint in place.
fn run_vp_path(project: &mut Project, known: &HashSet<PointKey>) -> HashSet<ViewpointKey> {
    let candidates: Vec<ViewpointKey> = project
        .viewpoints()
        .filter(|(_, vp)| vp.is_vp_calibratable())
        .map(|(k, _)| k)
        .collect();

    let mut posed = HashSet::new();
    for key in candidates {
        let vp = project.viewpoint(key).expect("enumerated above");
        let cal = match calibrate_from_vanishing_points(vp) {
            Ok(cal) => cal,
            Err(err) => {
                tracing::warn!(viewpoint = %vp.name, %err, "vanishing-point calibration failed");
                continue;
            }
        };
        let cal = photomark_cal::vanishing::refine_calibration(vp, &cal, 30).unwrap_or(cal);

        let corrs = correspondences(project, known, key);
        let vp = project.viewpoint(key).expect("still there");
        let position = match position_from_known_points(
            &cal.rotation,
            cal.focal_length,
            vp.principal_point,
            vp.aspect_ratio,
            &corrs,
        ) {
            Ok(pos) => pos,
            Err(_) => {
                // default stand-off behind the known geometry
                let (centroid, extent) = centroid_and_extent(project, known);
                let back = cal.rotation.inverse() * Vector3::z();
                centroid - back * 2.5 * extent
            }
        };

        {
            let vp = project.viewpoint_mut(key).expect("still there");
            vp.focal_length = cal.focal_length;
            vp.rotation = *cal.rotation.quaternion();
            vp.position = position;
        }
        posed.insert(key);
    }
    posed
}

/// Essential-matrix regime for exactly two viewpoints with ≥8 shared
/// observations. Places camera 1 at the origin and triangulates the shared
/// points.
fn run_essential_path(
    project: &mut Project,
    known: &mut HashSet<PointKey>,
) -> Result<HashSet<ViewpointKey>> {
    let keys: Vec<ViewpointKey> = project.viewpoints().map(|(k, _)| k).collect();
    let (vp1, vp2) = (keys[0], keys[1]);
    let shared = shared_observations(project, vp1, vp2);
    let matches: Vec<(Vector2<f64>, Vector2<f64>)> =
        shared.iter().map(|(_, a, b)| (*a, *b)).collect();

    let recon = reconstruct_two_view(&matches)?;
    tracing::debug!(
        in_front = recon.in_front,
        matches = matches.len(),
        "two-view reconstruction"
    );

    let r = recon.rotation.to_rotation_matrix();
    let c2 = -(r.matrix().transpose() * recon.translation);
    project.set_viewpoint_pose(
        vp1,
        Vector3::zeros(),
        nalgebra::Quaternion::new(1.0, 0.0, 0.0, 0.0),
    )
    .expect("viewpoint exists");
    project
        .set_viewpoint_pose(vp2, c2, *recon.rotation.quaternion())
        .expect("viewpoint exists");

    for ((point, _, _), xyz) in shared.iter().zip(recon.points.iter()) {
        if let Some(xyz) = xyz {
            let _ = project.set_optimized_xyz(*point, *xyz);
            known.insert(*point);
        }
    }
    Ok(HashSet::from([vp1, vp2]))
}

/// Default regime: cameras on the −z side of the centroid, free points at
/// the centroid.
fn run_default_path(project: &mut Project, known: &HashSet<PointKey>) -> HashSet<ViewpointKey> {
    let (centroid, extent) = centroid_and_extent(project, known);
    let position = centroid - Vector3::z() * 2.5 * extent;
    let keys: Vec<ViewpointKey> = project.viewpoints().map(|(k, _)| k).collect();
    for key in &keys {
        let _ = project.set_viewpoint_pose(
            *key,
            position,
            nalgebra::Quaternion::new(1.0, 0.0, 0.0, 0.0),
        );
    }
    keys.into_iter().collect()
}

/// Register every still-unposed viewpoint by PnP against the known points.
fn register_extra_viewpoints(
    project: &mut Project,
    posed: &mut HashSet<ViewpointKey>,
    known: &mut HashSet<PointKey>,
    refine_iterations: usize,
) {
    loop {
        let next: Option<ViewpointKey> = project
            .viewpoints()
            .map(|(k, _)| k)
            .find(|k| !posed.contains(k));
        let Some(key) = next else { break };

        let corrs = correspondences(project, known, key);
        let template = project.viewpoint(key).expect("enumerated above").clone();
        match estimate_pose(&template, &corrs, refine_iterations) {
            Ok(estimate) => {
                tracing::debug!(
                    viewpoint = %template.name,
                    error = estimate.mean_reprojection_error,
                    in_front = estimate.fraction_in_front,
                    "registered extra viewpoint"
                );
                let _ = project.set_viewpoint_pose(
                    key,
                    estimate.position,
                    *estimate.rotation.quaternion(),
                );
            }
            Err(err) => {
                tracing::warn!(viewpoint = %template.name, %err, "PnP registration failed; using stand-off pose");
                let (centroid, extent) = centroid_and_extent(project, known);
                let _ = project.set_viewpoint_pose(
                    key,
                    centroid - Vector3::z() * 2.5 * extent,
                    nalgebra::Quaternion::new(1.0, 0.0, 0.0, 0.0),
                );
            }
        }
        posed.insert(key);
        // freshly posed camera may unlock more triangulations for the next one
        triangulate_points(project, posed, known);
    }
}

/// Give every point with no position yet a neutral starting value.
fn seed_remaining_points(project: &mut Project, known: &HashSet<PointKey>) {
    let (centroid, _) = centroid_and_extent(project, known);
    let keys: Vec<PointKey> = project
        .points()
        .filter(|(key, p)| !known.contains(key) && p.optimized_xyz.is_none())
        .map(|(k, _)| k)
        .collect();
    for key in keys {
        let _ = project.set_optimized_xyz(key, centroid);
    }
}

/// Structural initialization: pick a regime, pose the cameras, triangulate,
/// register stragglers, align to the metric anchors.
pub(crate) fn initialize(project: &mut Project, options: &SolveOptions) -> Result<Alignment> {
    let mut known = initially_known_points(project);

    let vp_calibratable = project
        .viewpoints()
        .filter(|(_, vp)| vp.is_vp_calibratable())
        .count();

    let mut posed: HashSet<ViewpointKey> = if vp_calibratable >= 1 {
        tracing::debug!(count = vp_calibratable, "vanishing-point initialization");
        run_vp_path(project, &known)
    } else if project.num_viewpoints() == 2 {
        let keys: Vec<ViewpointKey> = project.viewpoints().map(|(k, _)| k).collect();
        let shared = shared_observations(project, keys[0], keys[1]);
        if shared.len() >= 8 {
            tracing::debug!(shared = shared.len(), "essential-matrix initialization");
            match run_essential_path(project, &mut known) {
                Ok(posed) => posed,
                Err(err) => {
                    tracing::warn!(%err, "essential-matrix path failed; default placement");
                    run_default_path(project, &known)
                }
            }
        } else {
            run_default_path(project, &known)
        }
    } else {
        tracing::debug!("default placement initialization");
        run_default_path(project, &known)
    };

    triangulate_points(project, &posed, &mut known);
    register_extra_viewpoints(
        project,
        &mut posed,
        &mut known,
        options.max_iterations.min(50),
    );
    seed_remaining_points(project, &known);

    let alignment = align_scene(project, options.max_iterations.clamp(30, 500))?;
    if alignment.ambiguous {
        tracing::warn!("axis alignment ambiguous; both orientations scored within 1%");
    }
    Ok(alignment)
}
