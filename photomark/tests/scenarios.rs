//! End-to-end solver scenarios: literal inputs, expected outputs.

use approx::assert_relative_eq;
use nalgebra::Vector3;
use photomark::{optimize_project, solve, SolveOptions, SolverBackend};
use photomark_types::{AxisState, Constraint, ConstraintKind, PointKey, Project};

/// Per-iteration solver logging, gated on `VERBOSE_TESTS`.
fn verbose_logging() {
    if std::env::var("VERBOSE_TESTS").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();
    }
}

fn free_point(project: &mut Project, name: &str, xyz: [f64; 3]) -> PointKey {
    let key = project.add_point(name);
    project
        .set_optimized_xyz(key, Vector3::new(xyz[0], xyz[1], xyz[2]))
        .unwrap();
    key
}

fn locked_point(project: &mut Project, name: &str, xyz: [f64; 3]) -> PointKey {
    let key = project.add_point(name);
    project.point_mut(key).unwrap().axes = [
        AxisState::Locked(xyz[0]),
        AxisState::Locked(xyz[1]),
        AxisState::Locked(xyz[2]),
    ];
    key
}

fn effective(project: &Project, key: PointKey) -> Vector3<f64> {
    project.point(key).unwrap().effective_xyz().unwrap()
}

#[test]
fn distance_only_pair_reaches_target_length() {
    verbose_logging();
    for backend in [
        SolverBackend::Autodiff,
        SolverBackend::ExplicitDense,
        SolverBackend::ExplicitSparse,
    ] {
        let mut project = Project::new();
        let a = free_point(&mut project, "a", [0.0, 0.0, 0.0]);
        let b = free_point(&mut project, "b", [50.0, 0.0, 0.0]);
        let mut constraint = Constraint::new(
            "span",
            ConstraintKind::DistancePointPoint {
                a,
                b,
                distance: 100.0,
            },
        );
        constraint.common.tolerance = 1e-4;
        let key = project.add_constraint(constraint).unwrap();

        let options = SolveOptions {
            solver_backend: backend,
            ..SolveOptions::default()
        };
        let summary = solve(&mut project, &options).unwrap();
        assert!(summary.converged, "{backend:?} did not converge");

        let len = (effective(&project, b) - effective(&project, a)).norm();
        assert_relative_eq!(len, 100.0, epsilon = 1e-4);
        assert_eq!(project.constraint(key).unwrap().is_satisfied(), Some(true));
    }
}

#[test]
fn angle_at_vertex_reaches_sixty_degrees() {
    let mut project = Project::new();
    let a = locked_point(&mut project, "a", [10.0, 0.0, 0.0]);
    let v = locked_point(&mut project, "v", [0.0, 0.0, 0.0]);
    let c = free_point(&mut project, "c", [0.0, 5.0, 0.0]);
    let mut constraint = Constraint::new(
        "angle",
        ConstraintKind::AnglePointPointPoint {
            a,
            vertex: v,
            c,
            degrees: 60.0,
        },
    );
    constraint.common.tolerance = 1e-4;
    project.add_constraint(constraint).unwrap();

    let summary = solve(&mut project, &SolveOptions::default()).unwrap();
    assert!(summary.converged);

    let u = effective(&project, a) - effective(&project, v);
    let w = effective(&project, c) - effective(&project, v);
    let angle = u.cross(&w).norm().atan2(u.dot(&w)).to_degrees();
    assert_relative_eq!(angle, 60.0, epsilon = 0.01);
}

#[test]
fn collinear_point_is_pulled_onto_the_line() {
    let mut project = Project::new();
    let p1 = locked_point(&mut project, "p1", [0.0, 0.0, 0.0]);
    let p2 = locked_point(&mut project, "p2", [10.0, 0.0, 0.0]);
    let p3 = free_point(&mut project, "p3", [5.0, 5.0, 0.0]);
    project
        .add_constraint(Constraint::new(
            "line",
            ConstraintKind::CollinearPoints {
                points: vec![p1, p2, p3],
            },
        ))
        .unwrap();

    let summary = solve(&mut project, &SolveOptions::default()).unwrap();
    assert!(summary.converged);

    let p3_xyz = effective(&project, p3);
    assert_relative_eq!(p3_xyz.y, 0.0, epsilon = 1e-4);
    assert_relative_eq!(p3_xyz.z, 0.0, epsilon = 1e-4);
}

#[test]
fn coplanar_point_is_pulled_into_the_plane() {
    let mut project = Project::new();
    let p1 = locked_point(&mut project, "p1", [0.0, 0.0, 0.0]);
    let p2 = locked_point(&mut project, "p2", [10.0, 0.0, 0.0]);
    let p3 = locked_point(&mut project, "p3", [0.0, 10.0, 0.0]);
    let p4 = free_point(&mut project, "p4", [5.0, 5.0, 10.0]);
    project
        .add_constraint(Constraint::new(
            "plane",
            ConstraintKind::CoplanarPoints {
                points: vec![p1, p2, p3, p4],
            },
        ))
        .unwrap();

    let summary = solve(&mut project, &SolveOptions::default()).unwrap();
    assert!(summary.converged);
    assert_relative_eq!(effective(&project, p4).z, 0.0, epsilon = 1e-4);
}

#[test]
fn equal_distances_and_angles_make_an_equilateral_triangle() {
    let mut project = Project::new();
    let p1 = free_point(&mut project, "p1", [0.0, 0.0, 0.0]);
    let p2 = free_point(&mut project, "p2", [10.0, 0.0, 0.0]);
    let p3 = free_point(&mut project, "p3", [5.0, 8.0, 0.0]);
    project
        .add_constraint(Constraint::new(
            "sides",
            ConstraintKind::EqualDistances {
                pairs: vec![(p1, p2), (p2, p3), (p3, p1)],
            },
        ))
        .unwrap();
    project
        .add_constraint(Constraint::new(
            "corners",
            ConstraintKind::EqualAngles {
                triplets: vec![(p2, p1, p3), (p1, p2, p3), (p1, p3, p2)],
            },
        ))
        .unwrap();

    let options = SolveOptions {
        max_iterations: 300,
        ..SolveOptions::default()
    };
    let summary = solve(&mut project, &options).unwrap();
    assert!(summary.converged);

    let a = effective(&project, p1);
    let b = effective(&project, p2);
    let c = effective(&project, p3);
    let ab = (b - a).norm();
    let bc = (c - b).norm();
    let ca = (a - c).norm();
    assert_relative_eq!(ab, bc, epsilon = 1e-3);
    assert_relative_eq!(bc, ca, epsilon = 1e-3);
    assert!(ab > 1.0, "triangle collapsed to {ab}");
}

/// Full pipeline: two calibrated views of a cube, eight shared observations,
/// two locked corners.
#[test]
fn two_view_cube_reconstruction() {
    verbose_logging();
    let corners = [
        [0.0, 0.0, 0.0],
        [2.0, 0.0, 0.0],
        [0.0, 2.0, 0.0],
        [2.0, 2.0, 0.0],
        [0.0, 0.0, 2.0],
        [2.0, 0.0, 2.0],
        [0.0, 2.0, 2.0],
        [2.0, 2.0, 2.0],
    ];

    // ground-truth cameras; the baseline's component perpendicular to the
    // locked edge points along +y, which the alignment reproduces
    let truth_pose = [
        (
            Vector3::new(0.4, 1.0, -8.0),
            nalgebra::UnitQuaternion::from_euler_angles(0.01, -0.02, 0.0),
        ),
        (
            Vector3::new(1.6, 3.0, -8.0),
            nalgebra::UnitQuaternion::from_euler_angles(-0.02, 0.03, 0.01),
        ),
    ];

    let mut project = Project::new();
    let mut point_keys = Vec::new();
    for (i, c) in corners.iter().enumerate() {
        let key = if i < 2 {
            locked_point(&mut project, &format!("corner{i}"), *c)
        } else {
            project.add_point(format!("corner{i}"))
        };
        point_keys.push(key);
    }

    let mut vp_keys = Vec::new();
    for (i, (position, rotation)) in truth_pose.iter().enumerate() {
        let key = project.add_viewpoint(format!("cam{i}"), 1920, 1080);
        {
            let vp = project.viewpoint_mut(key).unwrap();
            vp.focal_length = 1400.0;
            vp.position = *position;
            vp.rotation = *rotation.quaternion();
        }
        vp_keys.push(key);
    }

    // synthesise the observations through the true cameras
    for (point_key, corner) in point_keys.iter().zip(corners.iter()) {
        for vp_key in &vp_keys {
            let vp = project.viewpoint(*vp_key).unwrap();
            let pixel = photomark_solve::project_to_pixel(
                vp,
                &Vector3::new(corner[0], corner[1], corner[2]),
            )
            .expect("corner visible");
            project
                .add_observation(*point_key, *vp_key, pixel.x, pixel.y)
                .unwrap();
        }
    }

    // forget the poses; initialization has to recover them
    for vp_key in &vp_keys {
        project
            .set_viewpoint_pose(
                *vp_key,
                Vector3::zeros(),
                nalgebra::Quaternion::new(1.0, 0.0, 0.0, 0.0),
            )
            .unwrap();
    }

    let options = SolveOptions {
        max_iterations: 200,
        ..SolveOptions::default()
    };
    let summary = optimize_project(&mut project, &options).unwrap();
    assert!(summary.solve.converged);

    let median = summary
        .solve
        .median_reprojection_error
        .expect("observations exist");
    assert!(median < 1.0, "median reprojection error {median} px");

    // locked corners sit exactly on their targets
    for i in 0..2 {
        let xyz = effective(&project, point_keys[i]);
        assert_relative_eq!(
            xyz,
            Vector3::new(corners[i][0], corners[i][1], corners[i][2]),
            epsilon = 1e-12
        );
    }
    // remaining corners land within 5% of the cube's edge length
    for i in 2..8 {
        let xyz = effective(&project, point_keys[i]);
        let want = Vector3::new(corners[i][0], corners[i][1], corners[i][2]);
        let err = (xyz - want).norm();
        assert!(err < 0.1, "corner{i}: {xyz:?} vs {want:?} (err {err})");
    }

    // optimised camera quaternions stay near unit length
    for vp_key in &vp_keys {
        let q = project.viewpoint(*vp_key).unwrap().rotation;
        let norm = (q.w * q.w + q.i * q.i + q.j * q.j + q.k * q.k).sqrt();
        assert!(
            (norm - 1.0).abs() <= 1e-3,
            "quaternion norm {norm} out of bounds"
        );
    }
}

#[test]
fn failed_solve_still_reports_instead_of_erroring() {
    // a constraint pair with no consistent answer within one iteration
    let mut project = Project::new();
    let a = locked_point(&mut project, "a", [0.0, 0.0, 0.0]);
    let b = free_point(&mut project, "b", [1.0, 0.0, 0.0]);
    project
        .add_constraint(Constraint::new(
            "far",
            ConstraintKind::DistancePointPoint {
                a,
                b,
                distance: 1e6,
            },
        ))
        .unwrap();
    let options = SolveOptions {
        max_iterations: 1,
        tolerance: 1e-16,
        ..SolveOptions::default()
    };
    let summary = solve(&mut project, &options).unwrap();
    // not converged, but the caller still gets the last accepted state
    assert!(!summary.converged);
    assert!(project.point(b).unwrap().optimized_xyz.is_some());
}
