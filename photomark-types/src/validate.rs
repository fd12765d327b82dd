//! Project-level integrity checks, run pre-save and post-load.

use crate::{ConstraintKind, Project};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    MissingRequiredField,
    OrphanedConstraint,
    DanglingReference,
    CircularDependency,
    DuplicateId,
    InsufficientPoints,
    DuplicatePoints,
    InvalidTargetDistance,
    InvalidAngleValue,
    InvalidTargetXyz,
    InvalidObservedPixel,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub severity: Severity,
    /// Name of the offending entity.
    pub entity: String,
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} [{:?}] {}.{}: {}",
            self.severity, self.code, self.entity, self.field, self.message
        )
    }
}

fn issue(
    code: ValidationCode,
    severity: Severity,
    entity: &str,
    field: &'static str,
    message: impl Into<String>,
) -> ValidationIssue {
    ValidationIssue {
        code,
        severity,
        entity: entity.to_string(),
        field,
        message: message.into(),
    }
}

impl Project {
    /// Run every integrity check. Errors make the project unsaveable;
    /// warnings are advisory.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.validate_points(&mut issues);
        self.validate_viewpoints(&mut issues);
        self.validate_lines(&mut issues);
        self.validate_observations(&mut issues);
        self.validate_constraints(&mut issues);
        issues
    }

    /// True when [`Project::validate`] reports no error-severity issue.
    pub fn is_valid(&self) -> bool {
        !self
            .validate()
            .iter()
            .any(|i| i.severity == Severity::Error)
    }

    fn validate_points(&self, issues: &mut Vec<ValidationIssue>) {
        for (key, point) in self.points.iter() {
            for (i, axis) in point.axes.iter().enumerate() {
                if let Some(v) = axis.locked_value() {
                    if !v.is_finite() {
                        issues.push(issue(
                            ValidationCode::InvalidTargetXyz,
                            Severity::Error,
                            &point.name,
                            ["lockedX", "lockedY", "lockedZ"][i],
                            format!("locked value is {v}"),
                        ));
                    }
                }
            }
            for c in point.constraints.iter() {
                let back = self
                    .constraints
                    .get(*c)
                    .map(|c| c.kind.points().contains(&key));
                if back != Some(true) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        &point.name,
                        "constraints",
                        "back-link names a constraint that does not name the point",
                    ));
                }
            }
            for o in point.observations.iter() {
                let back = self
                    .observations
                    .get(*o)
                    .map(|obs| obs.world_point == key);
                if back != Some(true) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        &point.name,
                        "observations",
                        "back-link names an observation of a different point",
                    ));
                }
            }
        }
    }

    fn validate_viewpoints(&self, issues: &mut Vec<ValidationIssue>) {
        for (_, vp) in self.viewpoints.iter() {
            if vp.image_width == 0 || vp.image_height == 0 {
                issues.push(issue(
                    ValidationCode::MissingRequiredField,
                    Severity::Error,
                    &vp.name,
                    "imageSize",
                    format!("image is {}×{}", vp.image_width, vp.image_height),
                ));
            }
            if !(vp.focal_length.is_finite() && vp.focal_length > 0.0) {
                issues.push(issue(
                    ValidationCode::MissingRequiredField,
                    Severity::Error,
                    &vp.name,
                    "focalLength",
                    format!("focal length is {}", vp.focal_length),
                ));
            }
        }
    }

    fn validate_lines(&self, issues: &mut Vec<ValidationIssue>) {
        for (_, line) in self.lines.iter() {
            for endpoint in line.endpoints() {
                if !self.points.contains_key(endpoint) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        &line.name,
                        "points",
                        "line endpoint does not exist",
                    ));
                }
            }
            if line.point_a == line.point_b {
                issues.push(issue(
                    ValidationCode::DuplicatePoints,
                    Severity::Error,
                    &line.name,
                    "points",
                    "line endpoints are the same point",
                ));
            }
            if let Some(len) = line.target_length {
                if !(len.is_finite() && len > 0.0) {
                    issues.push(issue(
                        ValidationCode::InvalidTargetDistance,
                        Severity::Error,
                        &line.name,
                        "targetLength",
                        format!("target length is {len}"),
                    ));
                }
            }
            for c in line.coincident.iter() {
                if !self.points.contains_key(*c) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        &line.name,
                        "coincidentPoints",
                        "coincident point does not exist",
                    ));
                } else if *c == line.point_a || *c == line.point_b {
                    issues.push(issue(
                        ValidationCode::CircularDependency,
                        Severity::Error,
                        &line.name,
                        "coincidentPoints",
                        "a line endpoint cannot also be coincident with the line",
                    ));
                }
            }
        }
    }

    fn validate_observations(&self, issues: &mut Vec<ValidationIssue>) {
        for (key, obs) in self.observations.iter() {
            let name = self
                .viewpoints
                .get(obs.viewpoint)
                .map(|v| v.name.clone())
                .unwrap_or_else(|| "?".to_string());
            if !obs.u.is_finite() || !obs.v.is_finite() {
                issues.push(issue(
                    ValidationCode::InvalidObservedPixel,
                    Severity::Error,
                    &name,
                    "imagePoint",
                    format!("observed pixel is ({}, {})", obs.u, obs.v),
                ));
            }
            let point_ok = self
                .points
                .get(obs.world_point)
                .map(|p| p.observations.contains(&key))
                == Some(true);
            let vp_ok = self
                .viewpoints
                .get(obs.viewpoint)
                .map(|v| v.observations.contains(&key))
                == Some(true);
            if !point_ok || !vp_ok {
                issues.push(issue(
                    ValidationCode::DanglingReference,
                    Severity::Error,
                    &name,
                    "imagePoint",
                    "observation not registered with both of its owners",
                ));
            }
        }
    }

    fn validate_constraints(&self, issues: &mut Vec<ValidationIssue>) {
        for (key, constraint) in self.constraints.iter() {
            let name = &constraint.common.name;
            let count = constraint.kind.operand_count();
            let needed = constraint.kind.min_operands();
            if count < needed {
                issues.push(issue(
                    ValidationCode::InsufficientPoints,
                    Severity::Error,
                    name,
                    "operands",
                    format!("needs {needed} operands, has {count}"),
                ));
            }

            let points = constraint.kind.points();
            for p in &points {
                if !self.points.contains_key(*p) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        name,
                        "operands",
                        "constraint names a missing point",
                    ));
                } else if !self.points[*p].constraints.contains(&key) {
                    issues.push(issue(
                        ValidationCode::OrphanedConstraint,
                        Severity::Error,
                        name,
                        "operands",
                        "operand is missing the constraint back-link",
                    ));
                }
            }
            for l in constraint.kind.lines() {
                if !self.lines.contains_key(l) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        name,
                        "operands",
                        "constraint names a missing line",
                    ));
                }
            }
            for v in constraint.kind.viewpoints() {
                if !self.viewpoints.contains_key(v) {
                    issues.push(issue(
                        ValidationCode::DanglingReference,
                        Severity::Error,
                        name,
                        "operands",
                        "constraint names a missing viewpoint",
                    ));
                }
            }

            match &constraint.kind {
                ConstraintKind::CollinearPoints { points }
                | ConstraintKind::CoplanarPoints { points } => {
                    let mut seen = points.clone();
                    seen.sort();
                    seen.dedup();
                    if seen.len() != points.len() {
                        issues.push(issue(
                            ValidationCode::DuplicatePoints,
                            Severity::Error,
                            name,
                            "points",
                            "repeated operand point",
                        ));
                    }
                }
                ConstraintKind::DistancePointPoint { a, b, distance } => {
                    if a == b {
                        issues.push(issue(
                            ValidationCode::DuplicatePoints,
                            Severity::Error,
                            name,
                            "points",
                            "distance between a point and itself",
                        ));
                    }
                    if !(distance.is_finite() && *distance > 0.0) {
                        issues.push(issue(
                            ValidationCode::InvalidTargetDistance,
                            Severity::Error,
                            name,
                            "distance",
                            format!("target distance is {distance}"),
                        ));
                    }
                }
                ConstraintKind::AnglePointPointPoint { degrees, .. } => {
                    if !degrees.is_finite() {
                        issues.push(issue(
                            ValidationCode::InvalidAngleValue,
                            Severity::Error,
                            name,
                            "degrees",
                            format!("target angle is {degrees}"),
                        ));
                    } else if !(0.0..=360.0).contains(degrees) {
                        issues.push(issue(
                            ValidationCode::InvalidAngleValue,
                            Severity::Warning,
                            name,
                            "degrees",
                            format!("unusual target angle {degrees}°"),
                        ));
                    }
                }
                ConstraintKind::FixedPoint { target, .. } => {
                    if !target.iter().all(|v| v.is_finite()) {
                        issues.push(issue(
                            ValidationCode::InvalidTargetXyz,
                            Severity::Error,
                            name,
                            "target",
                            "non-finite target coordinate",
                        ));
                    }
                }
                ConstraintKind::Projection { observed, .. } => {
                    if !observed.iter().all(|v| v.is_finite()) {
                        issues.push(issue(
                            ValidationCode::InvalidObservedPixel,
                            Severity::Error,
                            name,
                            "observed",
                            "non-finite observed pixel",
                        ));
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AxisState, Constraint, ConstraintKind, Project};
    use nalgebra::Vector3;

    #[test]
    fn clean_project_validates() {
        let mut p = Project::new();
        let a = p.add_point("a");
        let b = p.add_point("b");
        p.add_constraint(Constraint::new(
            "d",
            ConstraintKind::DistancePointPoint {
                a,
                b,
                distance: 2.0,
            },
        ))
        .unwrap();
        assert!(p.validate().is_empty());
        assert!(p.is_valid());
    }

    #[test]
    fn non_finite_locked_axis_is_an_error() {
        let mut p = Project::new();
        let a = p.add_point("a");
        p.point_mut(a).unwrap().axes[1] = AxisState::Locked(f64::NAN);
        let issues = p.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, ValidationCode::InvalidTargetXyz);
        assert_eq!(issues[0].field, "lockedY");
    }

    #[test]
    fn unusual_angle_is_a_warning_only() {
        let mut p = Project::new();
        let a = p.add_point("a");
        let v = p.add_point("v");
        let c = p.add_point("c");
        p.add_constraint(Constraint::new(
            "ang",
            ConstraintKind::AnglePointPointPoint {
                a,
                vertex: v,
                c,
                degrees: 400.0,
            },
        ))
        .unwrap();
        let issues = p.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, ValidationCode::InvalidAngleValue);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(p.is_valid());
    }

    #[test]
    fn zero_target_distance_is_an_error() {
        let mut p = Project::new();
        let a = p.add_point("a");
        let b = p.add_point("b");
        p.add_constraint(Constraint::new(
            "d",
            ConstraintKind::DistancePointPoint {
                a,
                b,
                distance: 0.0,
            },
        ))
        .unwrap();
        let issues = p.validate();
        assert_eq!(issues[0].code, ValidationCode::InvalidTargetDistance);
        assert!(!p.is_valid());
    }

    #[test]
    fn invalid_fixed_target_reported() {
        let mut p = Project::new();
        let a = p.add_point("a");
        p.add_constraint(Constraint::new(
            "fix",
            ConstraintKind::FixedPoint {
                point: a,
                target: Vector3::new(0.0, f64::INFINITY, 0.0),
            },
        ))
        .unwrap();
        assert_eq!(p.validate()[0].code, ValidationCode::InvalidTargetXyz);
    }
}
