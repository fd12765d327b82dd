//! Two-view reconstruction: eight-point essential matrix, four-way pose
//! decomposition, cheirality vote, triangulation of the shared points.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector2, Vector3};

use crate::triangulate::{pose_matrix, triangulate};
use crate::{InitError, Result};

/// Relative pose of the second camera and the triangulated points, all in
/// the first camera's frame (`x₂ = R·x₁ + t`, ‖t‖ = 1).
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    /// One entry per input match; `None` where triangulation failed.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Matches that passed the cheirality test for the winning pose.
    pub in_front: usize,
}

/// Similarity transform conditioning a point set (Hartley normalisation).
fn conditioning(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(
        scale, 0.0, -scale * centroid.x, //
        0.0, scale, -scale * centroid.y, //
        0.0, 0.0, 1.0,
    )
}

fn transform(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let h = t * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(h.x / h.z, h.y / h.z)
}

/// Eight-point estimate of the essential matrix from normalised-coordinate
/// matches `(x₁, x₂)` with `x₂ᵀ E x₁ = 0`.
pub fn essential_matrix(matches: &[(Vector2<f64>, Vector2<f64>)]) -> Result<Matrix3<f64>> {
    if matches.len() < 8 {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 8,
            got: matches.len(),
        });
    }

    let first: Vec<Vector2<f64>> = matches.iter().map(|m| m.0).collect();
    let second: Vec<Vector2<f64>> = matches.iter().map(|m| m.1).collect();
    let t1 = conditioning(&first);
    let t2 = conditioning(&second);

    let mut a = DMatrix::zeros(matches.len(), 9);
    for (i, (x1, x2)) in matches.iter().enumerate() {
        let p = transform(&t1, x1);
        let q = transform(&t2, x2);
        let row = [
            q.x * p.x,
            q.x * p.y,
            q.x,
            q.y * p.x,
            q.y * p.y,
            q.y,
            p.x,
            p.y,
            1.0,
        ];
        for (col, v) in row.into_iter().enumerate() {
            a[(i, col)] = v;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(InitError::SvdFailed)?;
    let e = v_t.row(v_t.nrows() - 1);
    let e_cond = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);

    // enforce the essential-matrix singular values (1, 1, 0)
    let svd_e = e_cond.svd(true, true);
    let u = svd_e.u.ok_or(InitError::SvdFailed)?;
    let v_t = svd_e.v_t.ok_or(InitError::SvdFailed)?;
    let fixed = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t;

    // undo the conditioning
    Ok(t2.transpose() * fixed * t1)
}

fn pose_candidates(e: &Matrix3<f64>) -> Result<Vec<(Matrix3<f64>, Vector3<f64>)>> {
    let svd = e.svd(true, true);
    let mut u = svd.u.ok_or(InitError::SvdFailed)?;
    let mut v_t = svd.v_t.ok_or(InitError::SvdFailed)?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();
    Ok(vec![(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Depth of a camera-frame point for camera `[r | −r·c]`-free convention
/// `x_cam = R·x_world + t`.
fn depth(r: &Matrix3<f64>, t: &Vector3<f64>, x: &Vector3<f64>) -> f64 {
    (r * x + t).z
}

/// Full two-view reconstruction from ≥8 normalised matches: estimate E,
/// decompose into the four pose candidates, pick the one with the best
/// cheirality vote and triangulate every match with it.
pub fn reconstruct_two_view(
    matches: &[(Vector2<f64>, Vector2<f64>)],
) -> Result<TwoViewReconstruction> {
    let e = essential_matrix(matches)?;
    let candidates = pose_candidates(&e)?;

    let p1 = pose_matrix(&Matrix3::identity(), &Vector3::zeros());
    let mut best: Option<(usize, Matrix3<f64>, Vector3<f64>, Vec<Option<Vector3<f64>>>)> = None;

    for (r, t) in candidates {
        // camera 2 centre in the world (= camera 1) frame: −Rᵀt
        let c2 = -(r.transpose() * t);
        let p2 = pose_matrix(&r, &c2);
        let mut in_front = 0usize;
        let points: Vec<Option<Vector3<f64>>> = matches
            .iter()
            .map(|(x1, x2)| {
                let x = triangulate(&[(p1, *x1), (p2, *x2)])?;
                let d1 = x.z;
                let d2 = depth(&r, &t, &x);
                if d1 > 0.0 && d2 > 0.0 {
                    in_front += 1;
                    Some(x)
                } else {
                    None
                }
            })
            .collect();
        let better = match &best {
            Some((best_count, ..)) => in_front > *best_count,
            None => true,
        };
        if better {
            best = Some((in_front, r, t, points));
        }
    }

    let (in_front, r, t, points) = best.ok_or(InitError::EssentialDecompositionFailed)?;
    if in_front == 0 {
        return Err(InitError::EssentialDecompositionFailed);
    }

    let rotation = UnitQuaternion::from_rotation_matrix(
        &nalgebra::Rotation3::from_matrix_unchecked(r),
    );
    Ok(TwoViewReconstruction {
        rotation,
        translation: t,
        points,
        in_front,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn synthetic_matches(
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        points: &[Vector3<f64>],
    ) -> Vec<(Vector2<f64>, Vector2<f64>)> {
        points
            .iter()
            .map(|x| {
                let x1 = Vector2::new(x.x / x.z, x.y / x.z);
                let xc2 = r * x + t;
                let x2 = Vector2::new(xc2.x / xc2.z, xc2.y / xc2.z);
                (x1, x2)
            })
            .collect()
    }

    fn cube_points() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for x in [-1.0, 1.0] {
            for y in [-1.0, 1.0] {
                for z in [4.0, 6.0] {
                    pts.push(Vector3::new(x, y, z));
                }
            }
        }
        pts.push(Vector3::new(0.3, -0.2, 5.0));
        pts
    }

    #[test]
    fn epipolar_constraint_holds_for_estimated_matrix() {
        let r = *Rotation3::from_euler_angles(0.03, -0.2, 0.05).matrix();
        let t = Vector3::new(1.0, 0.1, 0.2);
        let matches = synthetic_matches(&r, &t, &cube_points());
        let e = essential_matrix(&matches).unwrap();
        for (x1, x2) in &matches {
            let h1 = Vector3::new(x1.x, x1.y, 1.0);
            let h2 = Vector3::new(x2.x, x2.y, 1.0);
            let res = h2.dot(&(e * h1));
            assert_relative_eq!(res, 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn reconstruction_recovers_pose_and_points_up_to_scale() {
        let r = *Rotation3::from_euler_angles(0.03, -0.2, 0.05).matrix();
        let t_true = Vector3::new(1.0, 0.1, 0.2);
        let points = cube_points();
        let matches = synthetic_matches(&r, &t_true, &points);

        let recon = reconstruct_two_view(&matches).unwrap();
        assert_eq!(recon.in_front, points.len());

        // translation recovered up to scale
        let t_hat = recon.translation;
        let scale = t_true.norm() / t_hat.norm();
        assert_relative_eq!(t_hat * scale, t_true, epsilon = 1e-6);

        let r_hat = recon.rotation.to_rotation_matrix();
        assert_relative_eq!(*r_hat.matrix(), r, epsilon = 1e-6);

        for (got, want) in recon.points.iter().zip(points.iter()) {
            let got = got.unwrap() * scale;
            assert_relative_eq!(got, *want, epsilon = 1e-6);
        }
    }

    #[test]
    fn too_few_matches_is_an_error() {
        let matches = vec![(Vector2::zeros(), Vector2::zeros()); 7];
        assert!(matches!(
            essential_matrix(&matches),
            Err(InitError::NotEnoughCorrespondences { needed: 8, .. })
        ));
    }
}
