//! Vanishing-point camera calibration.
//!
//! Each axis's user-drawn image segments are intersected in pixel space; two
//! orthogonal vanishing points then fix the focal length and the principal
//! rotation algebraically.

use nalgebra::{DMatrix, Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};

use photomark_types::{Axis, VanishingLine, Viewpoint};

use crate::{InitError, Result};

/// Pixel-space intersection of a set of image segments, by least squares on
/// the homogeneous line coefficients. Needs at least two segments.
pub fn vanishing_point(lines: &[(Vector2<f64>, Vector2<f64>)]) -> Result<Vector2<f64>> {
    if lines.len() < 2 {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 2,
            got: lines.len(),
        });
    }
    let mut a = DMatrix::zeros(lines.len(), 3);
    for (i, (p, q)) in lines.iter().enumerate() {
        let hp = Vector3::new(p.x, p.y, 1.0);
        let hq = Vector3::new(q.x, q.y, 1.0);
        let mut l = hp.cross(&hq);
        let scale = l.xy().norm();
        if scale < 1e-12 {
            continue; // zero-length segment contributes nothing
        }
        l /= scale;
        a[(i, 0)] = l.x;
        a[(i, 1)] = l.y;
        a[(i, 2)] = l.z;
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(InitError::SvdFailed)?;
    let v = v_t.row(v_t.nrows() - 1);
    if v[2].abs() < 1e-9 {
        // parallel image lines: vanishing point at infinity
        return Err(InitError::DegenerateVanishingGeometry);
    }
    Ok(Vector2::new(v[0] / v[2], v[1] / v[2]))
}

fn axis_segments(vp: &Viewpoint, axis: Axis) -> Vec<(Vector2<f64>, Vector2<f64>)> {
    vp.vanishing_lines
        .iter()
        .filter(|l| l.axis == axis)
        .map(|l: &VanishingLine| (l.a, l.b))
        .collect()
}

/// Focal length and world-to-camera rotation recovered from two orthogonal
/// vanishing points.
#[derive(Debug, Clone)]
pub struct VpCalibration {
    pub focal_length: f64,
    /// World-to-camera rotation.
    pub rotation: UnitQuaternion<f64>,
    /// The two axes the calibration came from.
    pub axes: [Axis; 2],
}

/// Calibrate a viewpoint from its vanishing lines. Requires two axes with at
/// least two segments each.
pub fn calibrate_from_vanishing_points(vp: &Viewpoint) -> Result<VpCalibration> {
    let axes = vp.vanishing_axes(2);
    if axes.len() < 2 {
        return Err(InitError::DegenerateVanishingGeometry);
    }
    let (axis1, axis2) = (axes[0], axes[1]);
    let v1 = vanishing_point(&axis_segments(vp, axis1))?;
    let v2 = vanishing_point(&axis_segments(vp, axis2))?;

    let c = vp.principal_point;
    let d1 = v1 - c;
    let d2 = v2 - c;
    // orthocentric focal relation: f² = −(v1−c)·(v2−c)
    let f_sq = -d1.dot(&d2);
    if !(f_sq.is_finite() && f_sq > 1.0) {
        return Err(InitError::DegenerateVanishingGeometry);
    }
    let focal_length = f_sq.sqrt();

    // back-projected axis directions in the camera frame
    let r1 = Vector3::new(d1.x, d1.y, focal_length).normalize();
    let mut r2 = Vector3::new(d2.x, d2.y, focal_length).normalize();
    // re-orthogonalise the second direction against the first
    r2 = (r2 - r1 * r1.dot(&r2)).normalize();
    let r3 = r1.cross(&r2);

    // columns of the world-to-camera rotation at the axis positions
    let mut m = Matrix3::identity();
    m.set_column(axis_index(axis1), &r1);
    m.set_column(axis_index(axis2), &r2);
    let third = remaining_axis(axis1, axis2);
    // keep the basis right-handed: e_a × e_b = ±e_c in world coordinates
    let sign = axis_cross_sign(axis1, axis2);
    m.set_column(axis_index(third), &(r3 * sign));

    if m.determinant() < 0.0 {
        return Err(InitError::InvalidRotationMatrix);
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m));

    Ok(VpCalibration {
        focal_length,
        rotation,
        axes: [axis1, axis2],
    })
}

/// Polish the algebraic calibration by a short LM on rotation and focal
/// length against the measured vanishing points.
pub fn refine_calibration(
    vp: &Viewpoint,
    cal: &VpCalibration,
    iterations: usize,
) -> Result<VpCalibration> {
    use photomark_solve::explicit_backend::{
        ExplicitLmSystem, ExplicitSystem, QuatNormProvider, ResidualProvider,
        VanishingPointProvider,
    };
    use photomark_solve::{minimize, LayoutOptions, LmOptions, VariableLayout};
    use photomark_types::Project;

    let mut project = Project::new();
    let key = project.add_viewpoint(vp.name.clone(), vp.image_width, vp.image_height);
    {
        let cam = project.viewpoint_mut(key).expect("just created");
        cam.rotation = *cal.rotation.quaternion();
        cam.focal_length = cal.focal_length;
        cam.aspect_ratio = vp.aspect_ratio;
        cam.principal_point = vp.principal_point;
        cam.skew = vp.skew;
        cam.is_z_reflected = vp.is_z_reflected;
    }

    let mut layout = VariableLayout::build(
        &project,
        &LayoutOptions {
            optimize_pose: true,
            optimize_intrinsics: true,
        },
    );
    let camera_slots = layout.camera_slots(key).expect("camera in layout").clone();

    let mut providers: Vec<Box<dyn ResidualProvider>> = Vec::new();
    for axis in cal.axes {
        let measured = vanishing_point(&axis_segments(vp, axis))?;
        providers.push(Box::new(VanishingPointProvider::new(
            layout.next_provider_id(),
            1.0,
            axis.unit(),
            (measured.x, measured.y),
            camera_slots.clone(),
        )));
    }
    providers.push(Box::new(QuatNormProvider::new(
        layout.next_provider_id(),
        1.0,
        camera_slots.rotation,
    )));

    let system = ExplicitSystem::from_providers(providers, layout.num_variables());
    let mut lm_system = ExplicitLmSystem {
        layout: &layout,
        system,
    };
    let mut vars = layout.initial_values();
    let opts = LmOptions {
        max_iterations: iterations,
        tolerance: 1e-12,
        ..LmOptions::default()
    };
    minimize(&mut lm_system, &mut vars, &opts)?;
    layout.apply(&mut project, &vars);

    let cam = project.viewpoint(key).expect("still there");
    Ok(VpCalibration {
        focal_length: cam.focal_length,
        rotation: cam.unit_rotation(),
        axes: cal.axes,
    })
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

fn remaining_axis(a: Axis, b: Axis) -> Axis {
    Axis::ALL
        .into_iter()
        .find(|x| *x != a && *x != b)
        .expect("two distinct axes leave one")
}

/// +1 when `a × b` equals the remaining axis, −1 when it equals its negation.
fn axis_cross_sign(a: Axis, b: Axis) -> f64 {
    let c = a.unit().cross(&b.unit());
    let rem = remaining_axis(a, b).unit();
    if c.dot(&rem) > 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// Camera position from world points of known coordinates observed in the
/// image, with rotation and focal length already fixed: each observation
/// pins the camera centre to the ray `X − C ∥ d`, giving the linear system
/// `[d]ₓ·C = [d]ₓ·X`.
pub fn position_from_known_points(
    rotation: &UnitQuaternion<f64>,
    focal_length: f64,
    principal_point: Vector2<f64>,
    aspect_ratio: f64,
    correspondences: &[(Vector3<f64>, Vector2<f64>)],
) -> Result<Vector3<f64>> {
    if correspondences.len() < 2 {
        return Err(InitError::NotEnoughCorrespondences {
            needed: 2,
            got: correspondences.len(),
        });
    }
    let r_inv = rotation.inverse();
    let mut a = DMatrix::zeros(3 * correspondences.len(), 3);
    let mut b = nalgebra::DVector::zeros(3 * correspondences.len());
    for (i, (world, pixel)) in correspondences.iter().enumerate() {
        let xn = (pixel.x - principal_point.x) / focal_length;
        let yn = (pixel.y - principal_point.y) / (focal_length * aspect_ratio);
        let dir = r_inv * Vector3::new(xn, yn, 1.0);
        let sk = Matrix3::new(
            0.0, -dir.z, dir.y, //
            dir.z, 0.0, -dir.x, //
            -dir.y, dir.x, 0.0,
        );
        let rhs = sk * world;
        for row in 0..3 {
            for col in 0..3 {
                a[(3 * i + row, col)] = sk[(row, col)];
            }
            b[3 * i + row] = rhs[row];
        }
    }
    let svd = a.svd(true, true);
    svd.solve(&b, 1e-12)
        .map(|x| Vector3::new(x[0], x[1], x[2]))
        .map_err(|_| InitError::SvdFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use photomark_types::Project;

    /// Build a viewpoint whose vanishing lines come from projecting real
    /// axis-parallel world segments through a known camera.
    fn synthetic_viewpoint(focal: f64, rotation: UnitQuaternion<f64>) -> Viewpoint {
        let mut project = Project::new();
        let key = project.add_viewpoint("cam", 1920, 1080);
        let position = Vector3::new(0.5, -0.4, -10.0);
        {
            let vp = project.viewpoint_mut(key).unwrap();
            vp.focal_length = focal;
            vp.position = position;
            vp.rotation = *rotation.quaternion();
        }

        let project_pixel = |world: Vector3<f64>| {
            let vp = project.viewpoint(key).unwrap();
            photomark_solve::project_to_pixel(vp, &world).unwrap()
        };

        let segments = [
            (Axis::X, Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)),
            (Axis::X, Vector3::new(0.0, 1.0, 1.0), Vector3::new(1.0, 1.0, 1.0)),
            (Axis::X, Vector3::new(0.0, -1.0, 2.0), Vector3::new(1.0, -1.0, 2.0)),
            (Axis::Y, Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)),
            (Axis::Y, Vector3::new(1.0, 0.0, 1.0), Vector3::new(1.0, 1.0, 1.0)),
            (Axis::Y, Vector3::new(-1.0, 0.0, 2.0), Vector3::new(-1.0, 1.0, 2.0)),
        ];

        let mut out = project.viewpoint(key).unwrap().clone();
        out.vanishing_lines = segments
            .iter()
            .map(|(axis, a, b)| VanishingLine {
                axis: *axis,
                a: project_pixel(*a),
                b: project_pixel(*b),
            })
            .collect();
        out
    }

    #[test]
    fn recovers_focal_and_rotation_from_vanishing_lines() {
        let focal = 1500.0;
        let rotation = UnitQuaternion::from_euler_angles(0.15, -0.2, 0.1);
        let vp = synthetic_viewpoint(focal, rotation);

        let cal = calibrate_from_vanishing_points(&vp).unwrap();
        assert_relative_eq!(cal.focal_length, focal, max_relative = 1e-3);

        // recovered rotation maps world x and y axes to the same camera
        // directions (up to the inherent ± sign of a vanishing direction)
        let expect = rotation.to_rotation_matrix();
        let got = cal.rotation.to_rotation_matrix();
        for axis in [0usize, 1] {
            let e = expect.matrix().column(axis);
            let g = got.matrix().column(axis);
            let align = e.dot(&g).abs();
            assert!(align > 0.9999, "axis {axis}: alignment {align}");
        }
    }

    #[test]
    fn refinement_preserves_an_exact_calibration() {
        let focal = 1500.0;
        let rotation = UnitQuaternion::from_euler_angles(0.15, -0.2, 0.1);
        let vp = synthetic_viewpoint(focal, rotation);
        let cal = calibrate_from_vanishing_points(&vp).unwrap();
        let refined = refine_calibration(&vp, &cal, 30).unwrap();
        assert_relative_eq!(refined.focal_length, cal.focal_length, max_relative = 1e-3);
        assert!(refined.rotation.angle_to(&cal.rotation) < 1e-3);
    }

    #[test]
    fn parallel_lines_are_degenerate() {
        let lines = [
            (Vector2::new(0.0, 0.0), Vector2::new(1.0, 0.0)),
            (Vector2::new(0.0, 1.0), Vector2::new(1.0, 1.0)),
        ];
        assert!(matches!(
            vanishing_point(&lines),
            Err(InitError::DegenerateVanishingGeometry)
        ));
    }

    #[test]
    fn position_recovered_from_two_known_points() {
        let rotation = UnitQuaternion::from_euler_angles(0.05, -0.1, 0.02);
        let focal = 1400.0;
        let pp = Vector2::new(960.0, 540.0);
        let c_true = Vector3::new(1.0, 2.0, -8.0);

        let world = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 1.0),
            Vector3::new(0.0, 2.0, 2.0),
        ];
        let correspondences: Vec<(Vector3<f64>, Vector2<f64>)> = world
            .iter()
            .map(|w| {
                let cam = rotation * (w - c_true);
                let px = Vector2::new(
                    focal * cam.x / cam.z + pp.x,
                    focal * cam.y / cam.z + pp.y,
                );
                (*w, px)
            })
            .collect();

        let c = position_from_known_points(&rotation, focal, pp, 1.0, &correspondences).unwrap();
        assert_relative_eq!(c, c_true, epsilon = 1e-6);
    }
}
