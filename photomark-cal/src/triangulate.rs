//! Linear triangulation from two or more views.

use nalgebra::{DMatrix, Matrix3x4, Vector2, Vector3};

/// Intersect observation rays by the direct linear method.
///
/// Each view contributes a 3×4 projection matrix in *normalised* camera
/// coordinates (intrinsics already removed) and the normalised observation
/// `(x, y)`. Returns `None` when the stacked system is degenerate or the
/// homogeneous solution is at infinity.
pub fn triangulate(views: &[(Matrix3x4<f64>, Vector2<f64>)]) -> Option<Vector3<f64>> {
    if views.len() < 2 {
        return None;
    }
    let mut a = DMatrix::zeros(2 * views.len(), 4);
    for (i, (p, obs)) in views.iter().enumerate() {
        for col in 0..4 {
            a[(2 * i, col)] = obs.x * p[(2, col)] - p[(0, col)];
            a[(2 * i + 1, col)] = obs.y * p[(2, col)] - p[(1, col)];
        }
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let x = v_t.row(v_t.nrows() - 1);
    let w = x[3];
    if w.abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(x[0] / w, x[1] / w, x[2] / w))
}

/// Projection matrix `[R | −R·C]` for a camera at `c` with world-to-camera
/// rotation `r`.
pub fn pose_matrix(r: &nalgebra::Matrix3<f64>, c: &Vector3<f64>) -> Matrix3x4<f64> {
    let t = -(r * c);
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    p.set_column(3, &t);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    #[test]
    fn two_views_recover_a_point() {
        let x = Vector3::new(0.4, -0.2, 5.0);

        let r1 = Matrix3::identity();
        let c1 = Vector3::zeros();
        let r2 = *nalgebra::Rotation3::from_euler_angles(0.0, -0.1, 0.02).matrix();
        let c2 = Vector3::new(1.0, 0.1, 0.0);

        let project = |r: &Matrix3<f64>, c: &Vector3<f64>| {
            let pc = r * (x - c);
            Vector2::new(pc.x / pc.z, pc.y / pc.z)
        };

        let views = [
            (pose_matrix(&r1, &c1), project(&r1, &c1)),
            (pose_matrix(&r2, &c2), project(&r2, &c2)),
        ];
        let got = triangulate(&views).unwrap();
        assert_relative_eq!(got, x, epsilon = 1e-8);
    }

    #[test]
    fn single_view_is_rejected() {
        let views = [(pose_matrix(&Matrix3::identity(), &Vector3::zeros()), Vector2::new(0.0, 0.0))];
        assert!(triangulate(&views).is_none());
    }
}
