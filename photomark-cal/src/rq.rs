//! RQ decomposition of a 3×3 matrix into an upper-triangular intrinsics
//! factor and a right-handed rotation.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::{InitError, Result};

/// Rotation in the plane of columns `p` and `q`.
fn plane_rotation(p: usize, q: usize, c: f64, s: f64) -> Matrix3<f64> {
    let mut g = Matrix3::identity();
    g[(p, p)] = c;
    g[(q, q)] = c;
    g[(p, q)] = s;
    g[(q, p)] = -s;
    g
}

/// Factor `a = r·q` with `r` upper triangular and `q` orthogonal by zeroing
/// the subdiagonal from the right with plane rotations: (2,0) against column
/// 2, then (2,1) against column 2, then (1,0) against column 1. Each later
/// rotation leaves the earlier zeros untouched.
fn rq_by_plane_rotations(a: Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let mut r = a;
    let mut q = Matrix3::identity();
    for (row, zero_col, partner_col) in [(2usize, 0usize, 2usize), (2, 1, 2), (1, 0, 1)] {
        let x = r[(row, zero_col)];
        let y = r[(row, partner_col)];
        let h = x.hypot(y);
        let (c, s) = if h > 1e-300 { (y / h, x / h) } else { (1.0, 0.0) };
        let g = plane_rotation(zero_col, partner_col, c, s);
        r *= g;
        r[(row, zero_col)] = 0.0; // exact zero instead of roundoff residue
        q = g.transpose() * q;
    }
    (r, q)
}

/// Split a 3×3 camera sub-matrix into intrinsics and a right-handed rotation
/// quaternion. Negative diagonal entries of the intrinsics factor are folded
/// into the rotation; a left-handed remainder means the input carried an
/// overall projective sign flip, which moves into the intrinsics.
pub fn rq_decomposition(orig: Matrix3<f64>) -> Result<(UnitQuaternion<f64>, Matrix3<f64>)> {
    if !orig.iter().all(|v| v.is_finite()) {
        return Err(InitError::InvalidRotationMatrix);
    }
    let (mut intrin, mut q) = rq_by_plane_rotations(orig);

    let flip = |v: f64| if v < 0.0 { -1.0 } else { 1.0 };
    let signs = Matrix3::from_diagonal(&Vector3::new(
        flip(intrin[(0, 0)]),
        flip(intrin[(1, 1)]),
        flip(intrin[(2, 2)]),
    ));
    // signs² = I, so a = (r·signs)·(signs·q) still reproduces the input
    intrin *= signs;
    q = signs * q;

    if q.determinant() < 0.0 {
        intrin = -intrin;
        q = -q;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(q));
    Ok((rotation, intrin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn plane_rotations_reconstruct_and_factor() {
        let a = Matrix3::new(1.2, 3.4, 5.6, 7.8, 9.8, 7.6, 5.4, 3.2, 1.0);
        let (r, q) = rq_by_plane_rotations(a);

        assert_abs_diff_eq!(a, r * q, epsilon = 1e-10);
        assert_abs_diff_eq!(q * q.transpose(), Matrix3::identity(), epsilon = 1e-10);
        assert_abs_diff_eq!(r[(1, 0)], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(r[(2, 0)], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(r[(2, 1)], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn decomposition_recovers_k_times_r() {
        let k = Matrix3::new(1400.0, 2.0, 960.0, 0.0, 1410.0, 540.0, 0.0, 0.0, 1.0);
        let r = Rotation3::from_euler_angles(0.2, -0.4, 0.7);
        let m = k * r.matrix();

        let (rquat, k2) = rq_decomposition(m).unwrap();
        let k2 = k2 / k2[(2, 2)];
        assert_abs_diff_eq!(k, k2, epsilon = 1e-6);
        assert_abs_diff_eq!(
            *rquat.to_rotation_matrix().matrix(),
            *r.matrix(),
            epsilon = 1e-8
        );
    }

    #[test]
    fn negated_input_yields_the_same_rotation() {
        let k = Matrix3::new(1200.0, 0.0, 640.0, 0.0, 1200.0, 360.0, 0.0, 0.0, 1.0);
        let r = Rotation3::from_euler_angles(-0.1, 0.3, 0.05);
        let m = -(k * r.matrix());

        let (rquat, _) = rq_decomposition(m).unwrap();
        assert_abs_diff_eq!(
            *rquat.to_rotation_matrix().matrix(),
            *r.matrix(),
            epsilon = 1e-8
        );
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let mut m = Matrix3::identity();
        m[(0, 2)] = f64::NAN;
        assert!(matches!(
            rq_decomposition(m),
            Err(InitError::InvalidRotationMatrix)
        ));
    }
}
