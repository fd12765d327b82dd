use nalgebra::{Quaternion, Vector2, Vector3};
use photomark_types::{
    load_project, save_project, save_project_string, AxisDirection, AxisState, Constraint,
    ConstraintKind, DocumentError, Project,
};

fn build_test_project() -> Project {
    let mut p = Project::new();

    let vp0 = p.add_viewpoint("front", 1920, 1080);
    {
        let vp = p.viewpoint_mut(vp0).unwrap();
        vp.position = Vector3::new(0.1, -0.2, -5.0);
        vp.rotation = Quaternion::new(0.99, 0.01, -0.02, 0.03); // deliberately unnormalised
        vp.focal_length = 1450.0;
        vp.aspect_ratio = 1.0;
        vp.radial = [0.01, -0.002, 0.0];
        vp.tangential = [0.0001, -0.0002];
    }
    let vp1 = p.add_viewpoint("side", 1920, 1080);

    let a = p.add_point("a");
    let b = p.add_point("b");
    let c = p.add_point("c");
    let d = p.add_point("d");
    p.point_mut(a).unwrap().axes = [
        AxisState::Locked(0.0),
        AxisState::Locked(0.0),
        AxisState::Locked(0.0),
    ];
    p.point_mut(b).unwrap().axes[0] = AxisState::Inferred(2.0);
    p.set_optimized_xyz(c, Vector3::new(1.0, 2.0, 3.0)).unwrap();

    let ab = p.add_line("ab", a, b).unwrap();
    {
        let line = p.line_mut(ab).unwrap();
        line.direction = AxisDirection::X;
        line.target_length = Some(2.0);
        line.coincident.insert(c);
    }

    p.add_observation(a, vp0, 100.0, 200.0).unwrap();
    p.add_observation(a, vp1, 110.0, 210.0).unwrap();
    p.add_observation(b, vp0, 300.0, 400.0).unwrap();

    p.add_constraint(Constraint::new(
        "dist ab",
        ConstraintKind::DistancePointPoint {
            a,
            b,
            distance: 2.0,
        },
    ))
    .unwrap();
    p.add_constraint(Constraint::new(
        "angle",
        ConstraintKind::AnglePointPointPoint {
            a,
            vertex: b,
            c,
            degrees: 90.0,
        },
    ))
    .unwrap();
    p.add_constraint(Constraint::new(
        "coplanar",
        ConstraintKind::CoplanarPoints {
            points: vec![a, b, c, d],
        },
    ))
    .unwrap();
    p.add_constraint(Constraint::new(
        "equal",
        ConstraintKind::EqualDistances {
            pairs: vec![(a, b), (c, d)],
        },
    ))
    .unwrap();
    p.add_constraint(Constraint::new(
        "proj",
        ConstraintKind::Projection {
            point: a,
            viewpoint: vp0,
            observed: Vector2::new(100.0, 200.0),
        },
    ))
    .unwrap();

    p
}

#[test]
fn load_save_is_byte_stable() {
    let project = build_test_project();
    let first = save_project_string(&project).unwrap();
    let reloaded = load_project(&save_project(&project).unwrap()).unwrap();
    let second = save_project_string(&reloaded).unwrap();
    assert_eq!(first, second);
}

#[test]
fn round_trip_preserves_entity_counts_and_fields() {
    let project = build_test_project();
    let doc = save_project(&project).unwrap();
    let reloaded = load_project(&doc).unwrap();

    assert_eq!(reloaded.num_viewpoints(), 2);
    assert_eq!(reloaded.num_points(), 4);
    assert_eq!(reloaded.lines().count(), 1);
    assert_eq!(reloaded.observations().count(), 3);
    assert_eq!(reloaded.constraints().count(), 5);

    let (_, vp) = reloaded
        .viewpoints()
        .find(|(_, v)| v.name == "front")
        .unwrap();
    assert_eq!(vp.focal_length, 1450.0);
    assert_eq!(vp.rotation.w, 0.99); // stored quaternion stays unnormalised

    let (_, a) = reloaded.points().find(|(_, p)| p.name == "a").unwrap();
    assert!(a.is_fully_constrained());
    let (_, b) = reloaded.points().find(|(_, p)| p.name == "b").unwrap();
    assert_eq!(b.axes[0], AxisState::Inferred(2.0));

    let (_, line) = reloaded.lines().next().unwrap();
    assert_eq!(line.direction, AxisDirection::X);
    assert_eq!(line.target_length, Some(2.0));
    assert_eq!(line.coincident.len(), 1);
}

#[test]
fn every_reference_resolves_after_load() {
    let project = build_test_project();
    let reloaded = load_project(&save_project(&project).unwrap()).unwrap();
    assert!(reloaded.validate().is_empty());
}

#[test]
fn saving_an_invalid_project_fails_with_issue_list() {
    let mut project = build_test_project();
    let (key, _) = project.points().next().unwrap();
    project.point_mut(key).unwrap().axes[2] = AxisState::Locked(f64::NAN);
    match save_project(&project) {
        Err(DocumentError::Invalid(issues)) => assert!(!issues.is_empty()),
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn unknown_constraint_tag_is_rejected() {
    let project = build_test_project();
    let mut json: serde_json::Value =
        serde_json::from_str(&save_project_string(&project).unwrap()).unwrap();
    json["constraints"][0]["type"] = serde_json::Value::String("warp_points".into());
    let parsed: Result<photomark_types::document::ProjectDoc, _> =
        serde_json::from_value(json);
    assert!(parsed.is_err());
}

#[test]
fn forward_reference_is_rejected() {
    let project = build_test_project();
    let mut doc = save_project(&project).unwrap();
    // point a line at an id that is never defined
    doc.lines[0].point_a_id = "WorldPoint_99".to_string();
    match load_project(&doc) {
        Err(DocumentError::UnresolvedReference(id)) => assert_eq!(id, "WorldPoint_99"),
        other => panic!("expected unresolved reference, got {other:?}"),
    }
}
