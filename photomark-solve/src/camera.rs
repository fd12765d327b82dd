//! Pinhole projection with Brown-Conrady distortion and quaternion rotation.
//!
//! There is exactly one projection implementation, generic over the [`Real`]
//! scalar; the plain-f64 path (initialization, diagnostics) and the autodiff
//! path are instantiations of the same function, so they agree to machine
//! precision. The explicit-Jacobian back end additionally uses the analytic
//! stage derivatives at the bottom of this module.

#![allow(clippy::too_many_arguments)]

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Matrix3x4, Quaternion, Vector2, Vector3};
use photomark_autodiff::{Real, Var3, VarQuat};
use photomark_types::Viewpoint;

/// Residual magnitude reported for a projection behind the camera.
pub const BEHIND_CAMERA_RESIDUAL: f64 = 1000.0;

/// Camera parameters over any scalar.
#[derive(Clone, Copy, Debug)]
pub struct CameraParams<S> {
    pub position: Var3<S>,
    pub rotation: VarQuat<S>,
    pub focal: S,
    pub aspect: S,
    pub cx: S,
    pub cy: S,
    pub skew: S,
    pub k1: S,
    pub k2: S,
    pub k3: S,
    pub p1: S,
    pub p2: S,
    pub z_reflected: bool,
}

impl CameraParams<f64> {
    pub fn from_viewpoint(vp: &Viewpoint) -> Self {
        Self {
            position: Var3::new(vp.position.x, vp.position.y, vp.position.z),
            rotation: VarQuat::new(vp.rotation.w, vp.rotation.i, vp.rotation.j, vp.rotation.k),
            focal: vp.focal_length,
            aspect: vp.aspect_ratio,
            cx: vp.principal_point.x,
            cy: vp.principal_point.y,
            skew: vp.skew,
            k1: vp.radial[0],
            k2: vp.radial[1],
            k3: vp.radial[2],
            p1: vp.tangential[0],
            p2: vp.tangential[1],
            z_reflected: vp.is_z_reflected,
        }
    }
}

/// Brown-Conrady radial + tangential distortion of a normalised image point.
fn distort<S: Real>(cam: &CameraParams<S>, x: S, y: S) -> (S, S) {
    let one = x.lift(1.0);
    let two = x.lift(2.0);
    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    let radial = one + cam.k1 * r2 + cam.k2 * r4 + cam.k3 * r6;
    let xd = x * radial + two * cam.p1 * x * y + cam.p2 * (r2 + two * x * x);
    let yd = y * radial + cam.p1 * (r2 + two * y * y) + two * cam.p2 * x * y;
    (xd, yd)
}

/// World point to pixel. `None` when the point projects behind the camera
/// (camera-frame depth ≤ 0).
pub fn project_point<S: Real>(cam: &CameraParams<S>, world: Var3<S>) -> Option<(S, S)> {
    let mut p = cam.rotation.rotate(world - cam.position);
    if cam.z_reflected {
        p.z = -p.z;
    }
    if p.z.scalar() <= 0.0 {
        return None;
    }
    let xn = p.x / p.z;
    let yn = p.y / p.z;
    let (xd, yd) = distort(cam, xn, yn);
    let u = cam.focal * xd + cam.skew * yd + cam.cx;
    let v = cam.focal * cam.aspect * yd + cam.cy;
    Some((u, v))
}

/// Plain-number projection for hosts and diagnostics.
pub fn project_to_pixel(vp: &Viewpoint, world: &Vector3<f64>) -> Option<Vector2<f64>> {
    let cam = CameraParams::from_viewpoint(vp);
    project_point(&cam, Var3::new(world.x, world.y, world.z)).map(|(u, v)| Vector2::new(u, v))
}

// ---- analytic stage Jacobians (explicit back end) --------------------------

/// Rotation of `t` by a possibly-unnormalised quaternion, with derivatives.
///
/// `p = M(q)·t / ‖q‖²` where `M(q)t = t(w²−u·u) + 2u(u·t) + 2w(u×t)`.
/// Returns the rotated vector, the rotation matrix `M/s` (the derivative with
/// respect to `t`), and `∂p/∂(w,x,y,z)` as a 3×4 matrix.
pub fn rotate_with_jacobians(
    q: &Quaternion<f64>,
    t: &Vector3<f64>,
) -> (Vector3<f64>, Matrix3<f64>, Matrix3x4<f64>) {
    let w = q.w;
    let u = Vector3::new(q.i, q.j, q.k);
    let s = w * w + u.norm_squared();
    let inv_s = 1.0 / s;

    let ut = u.dot(t);
    let uxt = u.cross(t);
    let m = t * (w * w - u.norm_squared()) + u * (2.0 * ut) + uxt * (2.0 * w);
    let p = m * inv_s;

    // ∂m/∂w and ∂m/∂u
    let dm_dw = t * (2.0 * w) + uxt * 2.0;
    // ∂m/∂u = −2·t·uᵀ + 2(u·t)I + 2·u·tᵀ − 2w·[t]ₓ
    let dm_du = -2.0 * t * u.transpose() + Matrix3::identity() * (2.0 * ut)
        + 2.0 * u * t.transpose()
        - 2.0 * w * skew(t);

    // rotation matrix as ∂p/∂t: M(q)/s expressed through the same identity
    let rot = (Matrix3::identity() * (w * w - u.norm_squared()) + 2.0 * u * u.transpose()
        + 2.0 * w * skew(&u))
        * inv_s;

    // quotient rule over s = ‖q‖²
    let mut dp_dq = Matrix3x4::zeros();
    let ds_dq = [2.0 * w, 2.0 * u.x, 2.0 * u.y, 2.0 * u.z];
    let dm_cols = [
        dm_dw,
        dm_du.column(0).into_owned(),
        dm_du.column(1).into_owned(),
        dm_du.column(2).into_owned(),
    ];
    for (col, (dm_col, ds_col)) in dm_cols.iter().zip(ds_dq.iter()).enumerate() {
        let dp_col = dm_col * inv_s - m * (ds_col * inv_s * inv_s);
        dp_dq.set_column(col, &dp_col);
    }

    (p, rot, dp_dq)
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Jacobian of the distortion stage with respect to the normalised point.
pub fn distort_jacobian(cam: &CameraParams<f64>, x: f64, y: f64) -> Matrix2<f64> {
    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let radial = 1.0 + cam.k1 * r2 + cam.k2 * r4 + cam.k3 * r4 * r2;
    // ∂radial/∂r² = k1 + 2k2 r² + 3k3 r⁴
    let dr = cam.k1 + 2.0 * cam.k2 * r2 + 3.0 * cam.k3 * r4;
    Matrix2::new(
        radial + 2.0 * x * x * dr + 2.0 * cam.p1 * y + 6.0 * cam.p2 * x,
        2.0 * x * y * dr + 2.0 * cam.p1 * x + 2.0 * cam.p2 * y,
        2.0 * x * y * dr + 2.0 * cam.p1 * x + 2.0 * cam.p2 * y,
        radial + 2.0 * y * y * dr + 6.0 * cam.p1 * y + 2.0 * cam.p2 * x,
    )
}

/// Full projection Jacobians at one world point.
pub struct ProjectionJacobians {
    pub pixel: Vector2<f64>,
    /// ∂(u,v)/∂world
    pub d_point: Matrix2x3<f64>,
    /// ∂(u,v)/∂camera position
    pub d_position: Matrix2x3<f64>,
    /// ∂(u,v)/∂quaternion (w, x, y, z)
    pub d_quat: nalgebra::Matrix2x4<f64>,
    /// ∂(u,v)/∂focal length
    pub d_focal: Vector2<f64>,
}

/// Project and differentiate in one pass. `None` behind the camera.
pub fn project_with_jacobians(
    cam: &CameraParams<f64>,
    world: &Vector3<f64>,
) -> Option<ProjectionJacobians> {
    let q = Quaternion::new(
        cam.rotation.w,
        cam.rotation.x,
        cam.rotation.y,
        cam.rotation.z,
    );
    let pos = Vector3::new(cam.position.x, cam.position.y, cam.position.z);
    let t = world - pos;
    let (mut p, mut rot, mut dp_dq) = rotate_with_jacobians(&q, &t);
    if cam.z_reflected {
        p.z = -p.z;
        for col in 0..3 {
            rot[(2, col)] = -rot[(2, col)];
        }
        for col in 0..4 {
            dp_dq[(2, col)] = -dp_dq[(2, col)];
        }
    }
    if p.z <= 0.0 {
        return None;
    }

    let inv_z = 1.0 / p.z;
    let xn = p.x * inv_z;
    let yn = p.y * inv_z;
    #[rustfmt::skip]
    let j_norm = Matrix2x3::new(
        inv_z, 0.0, -p.x * inv_z * inv_z,
        0.0, inv_z, -p.y * inv_z * inv_z,
    );

    let (xd, yd) = distort(cam, xn, yn);
    let j_dist = distort_jacobian(cam, xn, yn);

    let u = cam.focal * xd + cam.skew * yd + cam.cx;
    let v = cam.focal * cam.aspect * yd + cam.cy;
    #[rustfmt::skip]
    let j_k = Matrix2::new(
        cam.focal, cam.skew,
        0.0, cam.focal * cam.aspect,
    );

    let j_pix = j_k * j_dist * j_norm; // 2×3, pixel wrt camera-frame point
    Some(ProjectionJacobians {
        pixel: Vector2::new(u, v),
        d_point: j_pix * rot,
        d_position: -(j_pix * rot),
        d_quat: j_pix * dp_dq,
        d_focal: Vector2::new(xd, cam.aspect * yd),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use photomark_autodiff::Tape;

    fn test_cam(z_reflected: bool) -> CameraParams<f64> {
        CameraParams {
            position: Var3::new(0.4, -0.3, -6.0),
            rotation: VarQuat::new(0.98, 0.05, -0.08, 0.12), // unnormalised on purpose
            focal: 1400.0,
            aspect: 1.02,
            cx: 960.0,
            cy: 540.0,
            skew: 0.3,
            k1: 0.02,
            k2: -0.004,
            k3: 0.0007,
            p1: 0.0012,
            p2: -0.0008,
            z_reflected,
        }
    }

    fn lift_cam<'t>(tape: &'t Tape, cam: &CameraParams<f64>) -> CameraParams<photomark_autodiff::Value<'t>> {
        CameraParams {
            position: Var3::new(
                tape.var(cam.position.x),
                tape.var(cam.position.y),
                tape.var(cam.position.z),
            ),
            rotation: VarQuat::new(
                tape.var(cam.rotation.w),
                tape.var(cam.rotation.x),
                tape.var(cam.rotation.y),
                tape.var(cam.rotation.z),
            ),
            focal: tape.var(cam.focal),
            aspect: tape.constant(cam.aspect),
            cx: tape.constant(cam.cx),
            cy: tape.constant(cam.cy),
            skew: tape.constant(cam.skew),
            k1: tape.constant(cam.k1),
            k2: tape.constant(cam.k2),
            k3: tape.constant(cam.k3),
            p1: tape.constant(cam.p1),
            p2: tape.constant(cam.p2),
            z_reflected: cam.z_reflected,
        }
    }

    #[test]
    fn f64_and_autodiff_paths_agree() {
        for z_reflected in [false, true] {
            let mut cam = test_cam(z_reflected);
            if z_reflected {
                // keep the point in front of the mirrored frame
                cam.position.z = 6.0;
            }
            let world = Var3::new(0.7, -0.4, 1.3);
            let (u, v) = project_point(&cam, world).expect("in front");

            let tape = Tape::new();
            let ad_cam = lift_cam(&tape, &cam);
            let ad_world = Var3::new(tape.var(0.7), tape.var(-0.4), tape.var(1.3));
            let (au, av) = project_point(&ad_cam, ad_world).expect("in front");

            assert_relative_eq!(u, au.value(), epsilon = 1e-10);
            assert_relative_eq!(v, av.value(), epsilon = 1e-10);
        }
    }

    #[test]
    fn behind_camera_returns_none() {
        let mut cam = test_cam(false);
        cam.position = Var3::new(0.0, 0.0, 10.0); // camera in front, looking +z
        assert!(project_point(&cam, Var3::new(0.0, 0.0, 1.0)).is_none());
    }

    #[test]
    fn rotation_jacobian_matches_autodiff() {
        let q = Quaternion::new(0.9, 0.2, -0.3, 0.15);
        let t = Vector3::new(0.8, -1.1, 2.2);
        let (p, rot, dp_dq) = rotate_with_jacobians(&q, &t);

        let tape = Tape::new();
        let qv = VarQuat::new(tape.var(q.w), tape.var(q.i), tape.var(q.j), tape.var(q.k));
        let tv = Var3::new(tape.var(t.x), tape.var(t.y), tape.var(t.z));
        let rotated = qv.rotate(tv);

        for (row, comp) in [rotated.x, rotated.y, rotated.z].into_iter().enumerate() {
            assert_relative_eq!(comp.value(), p[row], epsilon = 1e-12);
            let g = comp.grad();
            for (col, qc) in [qv.w, qv.x, qv.y, qv.z].into_iter().enumerate() {
                assert_relative_eq!(g.wrt(qc), dp_dq[(row, col)], epsilon = 1e-9);
            }
            for (col, tc) in [tv.x, tv.y, tv.z].into_iter().enumerate() {
                assert_relative_eq!(g.wrt(tc), rot[(row, col)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn projection_jacobians_match_autodiff() {
        for z_reflected in [false, true] {
            let mut cam = test_cam(z_reflected);
            if z_reflected {
                cam.position.z = 6.0;
            }
            let world = Vector3::new(0.7, -0.4, 1.3);
            let jac = project_with_jacobians(&cam, &world).expect("in front");

            let tape = Tape::new();
            let ad_cam = lift_cam(&tape, &cam);
            let ad_world = Var3::new(tape.var(world.x), tape.var(world.y), tape.var(world.z));
            let (au, av) = project_point(&ad_cam, ad_world).expect("in front");

            for (row, pixel) in [au, av].into_iter().enumerate() {
                assert_relative_eq!(pixel.value(), jac.pixel[row], epsilon = 1e-10);
                let g = pixel.grad();
                for (col, w) in [ad_world.x, ad_world.y, ad_world.z].into_iter().enumerate() {
                    assert_relative_eq!(g.wrt(w), jac.d_point[(row, col)], epsilon = 1e-8);
                }
                for (col, c) in [
                    ad_cam.position.x,
                    ad_cam.position.y,
                    ad_cam.position.z,
                ]
                .into_iter()
                .enumerate()
                {
                    assert_relative_eq!(g.wrt(c), jac.d_position[(row, col)], epsilon = 1e-8);
                }
                for (col, qc) in [
                    ad_cam.rotation.w,
                    ad_cam.rotation.x,
                    ad_cam.rotation.y,
                    ad_cam.rotation.z,
                ]
                .into_iter()
                .enumerate()
                {
                    assert_relative_eq!(g.wrt(qc), jac.d_quat[(row, col)], epsilon = 1e-8);
                }
                assert_relative_eq!(g.wrt(ad_cam.focal), jac.d_focal[row], epsilon = 1e-8);
            }
        }
    }
}
