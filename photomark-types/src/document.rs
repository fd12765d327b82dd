//! Portable project document: JSON with stable string ids.
//!
//! Entity blocks are written in dependency order (viewpoints, world points,
//! lines, image points, constraints); references are by id and forward
//! references are illegal. Load-then-save is byte-stable up to whitespace.

use std::collections::HashMap;

use nalgebra::{Quaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    AxisDirection, AxisState, Axis, Constraint, ConstraintKind, LineKey, PointKey, Project,
    Severity, ValidationIssue, VanishingLine, ViewpointKey,
};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate id `{0}`")]
    DuplicateId(String),
    #[error("unresolved reference `{0}`")]
    UnresolvedReference(String),
    #[error("project failed validation with {} issue(s)", .0.len())]
    Invalid(Vec<ValidationIssue>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDoc {
    pub version: u32,
    pub viewpoints: Vec<ViewpointDoc>,
    pub world_points: Vec<WorldPointDoc>,
    pub lines: Vec<LineDoc>,
    pub image_points: Vec<ImagePointDoc>,
    pub constraints: Vec<ConstraintDoc>,
}

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewpointDoc {
    pub id: String,
    pub name: String,
    pub image_width: u32,
    pub image_height: u32,
    pub position: [f64; 3],
    /// `(w, x, y, z)`, possibly unnormalised.
    pub rotation: [f64; 4],
    pub focal_length: f64,
    pub aspect_ratio: f64,
    pub principal_point: [f64; 2],
    pub skew: f64,
    pub radial: [f64; 3],
    pub tangential: [f64; 2],
    pub is_z_reflected: bool,
    pub vanishing_lines: Vec<VanishingLineDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VanishingLineDoc {
    pub axis: Axis,
    pub a: [f64; 2],
    pub b: [f64; 2],
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldPointDoc {
    pub id: String,
    pub name: String,
    pub locked_xyz: [Option<f64>; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_xyz: Option<[Option<f64>; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_xyz: Option<[f64; 3]>,
    pub color: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDoc {
    pub id: String,
    pub name: String,
    pub point_a_id: String,
    pub point_b_id: String,
    pub direction: AxisDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_length: Option<f64>,
    pub coincident_point_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePointDoc {
    pub id: String,
    pub world_point_id: String,
    pub viewpoint_id: String,
    pub u: f64,
    pub v: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDoc {
    pub id: String,
    pub name: String,
    pub tolerance: f64,
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ConstraintKindDoc,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintKindDoc {
    #[serde(rename_all = "camelCase")]
    DistancePointPoint {
        point_a_id: String,
        point_b_id: String,
        distance: f64,
    },
    #[serde(rename_all = "camelCase")]
    AnglePointPointPoint {
        point_a_id: String,
        vertex_id: String,
        point_c_id: String,
        degrees: f64,
    },
    #[serde(rename_all = "camelCase")]
    FixedPoint { point_id: String, target: [f64; 3] },
    #[serde(rename_all = "camelCase")]
    CollinearPoints { point_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    CoplanarPoints { point_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    ParallelLines { line_a_id: String, line_b_id: String },
    #[serde(rename_all = "camelCase")]
    PerpendicularLines { line_a_id: String, line_b_id: String },
    #[serde(rename_all = "camelCase")]
    EqualDistances { pairs: Vec<[String; 2]> },
    #[serde(rename_all = "camelCase")]
    EqualAngles { triplets: Vec<[String; 3]> },
    #[serde(rename_all = "camelCase")]
    Projection {
        point_id: String,
        viewpoint_id: String,
        observed: [f64; 2],
    },
}

/// Monotonic id generator scoped to one serialization pass.
struct IdGen {
    next: HashMap<&'static str, u64>,
}

impl IdGen {
    fn new() -> Self {
        Self {
            next: HashMap::new(),
        }
    }

    fn next(&mut self, kind: &'static str) -> String {
        let n = self.next.entry(kind).or_insert(0);
        let id = format!("{kind}_{n}");
        *n += 1;
        id
    }
}

/// Serialize a project into a document. Fails with the full validation issue
/// list when the project carries any error-severity problem.
pub fn save_project(project: &Project) -> Result<ProjectDoc, DocumentError> {
    let issues = project.validate();
    if issues.iter().any(|i| i.severity == Severity::Error) {
        return Err(DocumentError::Invalid(issues));
    }

    let mut ids = IdGen::new();
    let mut vp_ids: HashMap<ViewpointKey, String> = HashMap::new();
    let mut point_ids: HashMap<PointKey, String> = HashMap::new();
    let mut line_ids: HashMap<LineKey, String> = HashMap::new();

    let viewpoints = project
        .viewpoints
        .iter()
        .map(|(key, vp)| {
            let id = ids.next("Viewpoint");
            vp_ids.insert(key, id.clone());
            ViewpointDoc {
                id,
                name: vp.name.clone(),
                image_width: vp.image_width,
                image_height: vp.image_height,
                position: [vp.position.x, vp.position.y, vp.position.z],
                rotation: [vp.rotation.w, vp.rotation.i, vp.rotation.j, vp.rotation.k],
                focal_length: vp.focal_length,
                aspect_ratio: vp.aspect_ratio,
                principal_point: [vp.principal_point.x, vp.principal_point.y],
                skew: vp.skew,
                radial: vp.radial,
                tangential: vp.tangential,
                is_z_reflected: vp.is_z_reflected,
                vanishing_lines: vp
                    .vanishing_lines
                    .iter()
                    .map(|l| VanishingLineDoc {
                        axis: l.axis,
                        a: [l.a.x, l.a.y],
                        b: [l.b.x, l.b.y],
                    })
                    .collect(),
            }
        })
        .collect();

    let world_points = project
        .points
        .iter()
        .map(|(key, p)| {
            let id = ids.next("WorldPoint");
            point_ids.insert(key, id.clone());
            let locked = p.axes.map(|a| a.locked_value());
            let inferred = p.axes.map(|a| match a {
                AxisState::Inferred(v) => Some(v),
                _ => None,
            });
            WorldPointDoc {
                id,
                name: p.name.clone(),
                locked_xyz: locked,
                inferred_xyz: if inferred.iter().any(|v| v.is_some()) {
                    Some(inferred)
                } else {
                    None
                },
                optimized_xyz: p.optimized_xyz.map(|v| [v.x, v.y, v.z]),
                color: p.color.clone(),
            }
        })
        .collect();

    let lines = project
        .lines
        .iter()
        .map(|(key, l)| {
            let id = ids.next("Line");
            line_ids.insert(key, id.clone());
            LineDoc {
                id,
                name: l.name.clone(),
                point_a_id: point_ids[&l.point_a].clone(),
                point_b_id: point_ids[&l.point_b].clone(),
                direction: l.direction,
                target_length: l.target_length,
                coincident_point_ids: l
                    .coincident
                    .iter()
                    .map(|p| point_ids[p].clone())
                    .collect(),
            }
        })
        .collect();

    let image_points = project
        .observations
        .iter()
        .map(|(_, obs)| ImagePointDoc {
            id: ids.next("ImagePoint"),
            world_point_id: point_ids[&obs.world_point].clone(),
            viewpoint_id: vp_ids[&obs.viewpoint].clone(),
            u: obs.u,
            v: obs.v,
        })
        .collect();

    let constraints = project
        .constraints
        .iter()
        .map(|(_, c)| {
            let kind = match &c.kind {
                ConstraintKind::DistancePointPoint { a, b, distance } => {
                    ConstraintKindDoc::DistancePointPoint {
                        point_a_id: point_ids[a].clone(),
                        point_b_id: point_ids[b].clone(),
                        distance: *distance,
                    }
                }
                ConstraintKind::AnglePointPointPoint {
                    a,
                    vertex,
                    c,
                    degrees,
                } => ConstraintKindDoc::AnglePointPointPoint {
                    point_a_id: point_ids[a].clone(),
                    vertex_id: point_ids[vertex].clone(),
                    point_c_id: point_ids[c].clone(),
                    degrees: *degrees,
                },
                ConstraintKind::FixedPoint { point, target } => ConstraintKindDoc::FixedPoint {
                    point_id: point_ids[point].clone(),
                    target: [target.x, target.y, target.z],
                },
                ConstraintKind::CollinearPoints { points } => ConstraintKindDoc::CollinearPoints {
                    point_ids: points.iter().map(|p| point_ids[p].clone()).collect(),
                },
                ConstraintKind::CoplanarPoints { points } => ConstraintKindDoc::CoplanarPoints {
                    point_ids: points.iter().map(|p| point_ids[p].clone()).collect(),
                },
                ConstraintKind::ParallelLines { a, b } => ConstraintKindDoc::ParallelLines {
                    line_a_id: line_ids[a].clone(),
                    line_b_id: line_ids[b].clone(),
                },
                ConstraintKind::PerpendicularLines { a, b } => {
                    ConstraintKindDoc::PerpendicularLines {
                        line_a_id: line_ids[a].clone(),
                        line_b_id: line_ids[b].clone(),
                    }
                }
                ConstraintKind::EqualDistances { pairs } => ConstraintKindDoc::EqualDistances {
                    pairs: pairs
                        .iter()
                        .map(|(a, b)| [point_ids[a].clone(), point_ids[b].clone()])
                        .collect(),
                },
                ConstraintKind::EqualAngles { triplets } => ConstraintKindDoc::EqualAngles {
                    triplets: triplets
                        .iter()
                        .map(|(a, v, c)| {
                            [
                                point_ids[a].clone(),
                                point_ids[v].clone(),
                                point_ids[c].clone(),
                            ]
                        })
                        .collect(),
                },
                ConstraintKind::Projection {
                    point,
                    viewpoint,
                    observed,
                } => ConstraintKindDoc::Projection {
                    point_id: point_ids[point].clone(),
                    viewpoint_id: vp_ids[viewpoint].clone(),
                    observed: [observed.x, observed.y],
                },
            };
            ConstraintDoc {
                id: ids.next("Constraint"),
                name: c.common.name.clone(),
                tolerance: c.common.tolerance,
                enabled: c.common.enabled,
                kind,
            }
        })
        .collect();

    Ok(ProjectDoc {
        version: DOCUMENT_VERSION,
        viewpoints,
        world_points,
        lines,
        image_points,
        constraints,
    })
}

/// [`save_project`] straight to pretty-printed JSON.
pub fn save_project_string(project: &Project) -> Result<String, DocumentError> {
    let doc = save_project(project)?;
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Rebuild a project from a document. Fatal on duplicate ids, unresolved
/// references, or a validation failure of the reconstructed project.
pub fn load_project(doc: &ProjectDoc) -> Result<Project, DocumentError> {
    let mut project = Project::new();
    let mut vp_keys: HashMap<&str, ViewpointKey> = HashMap::new();
    let mut point_keys: HashMap<&str, PointKey> = HashMap::new();
    let mut line_keys: HashMap<&str, LineKey> = HashMap::new();

    for vp_doc in &doc.viewpoints {
        if vp_keys.contains_key(vp_doc.id.as_str()) {
            return Err(DocumentError::DuplicateId(vp_doc.id.clone()));
        }
        let key = project.add_viewpoint(
            vp_doc.name.clone(),
            vp_doc.image_width,
            vp_doc.image_height,
        );
        let vp = project.viewpoint_mut(key).expect("just created");
        vp.position = Vector3::new(vp_doc.position[0], vp_doc.position[1], vp_doc.position[2]);
        vp.rotation = Quaternion::new(
            vp_doc.rotation[0],
            vp_doc.rotation[1],
            vp_doc.rotation[2],
            vp_doc.rotation[3],
        );
        vp.focal_length = vp_doc.focal_length;
        vp.aspect_ratio = vp_doc.aspect_ratio;
        vp.principal_point = Vector2::new(vp_doc.principal_point[0], vp_doc.principal_point[1]);
        vp.skew = vp_doc.skew;
        vp.radial = vp_doc.radial;
        vp.tangential = vp_doc.tangential;
        vp.is_z_reflected = vp_doc.is_z_reflected;
        vp.vanishing_lines = vp_doc
            .vanishing_lines
            .iter()
            .map(|l| VanishingLine {
                axis: l.axis,
                a: Vector2::new(l.a[0], l.a[1]),
                b: Vector2::new(l.b[0], l.b[1]),
            })
            .collect();
        vp_keys.insert(&vp_doc.id, key);
    }

    for p_doc in &doc.world_points {
        if point_keys.contains_key(p_doc.id.as_str()) {
            return Err(DocumentError::DuplicateId(p_doc.id.clone()));
        }
        let key = project.add_point(p_doc.name.clone());
        let point = project.point_mut(key).expect("just created");
        for i in 0..3 {
            point.axes[i] = match (p_doc.locked_xyz[i], p_doc.inferred_xyz.and_then(|v| v[i])) {
                (Some(locked), _) => AxisState::Locked(locked),
                (None, Some(inferred)) => AxisState::Inferred(inferred),
                (None, None) => AxisState::Free,
            };
        }
        point.optimized_xyz = p_doc
            .optimized_xyz
            .map(|v| Vector3::new(v[0], v[1], v[2]));
        point.color = p_doc.color.clone();
        point_keys.insert(&p_doc.id, key);
    }

    let resolve_point = |keys: &HashMap<&str, PointKey>, id: &str| {
        keys.get(id)
            .copied()
            .ok_or_else(|| DocumentError::UnresolvedReference(id.to_string()))
    };

    for l_doc in &doc.lines {
        if line_keys.contains_key(l_doc.id.as_str()) {
            return Err(DocumentError::DuplicateId(l_doc.id.clone()));
        }
        let a = resolve_point(&point_keys, &l_doc.point_a_id)?;
        let b = resolve_point(&point_keys, &l_doc.point_b_id)?;
        let key = project
            .add_line(l_doc.name.clone(), a, b)
            .map_err(|_| DocumentError::UnresolvedReference(l_doc.point_a_id.clone()))?;
        let line = project.line_mut(key).expect("just created");
        line.direction = l_doc.direction;
        line.target_length = l_doc.target_length;
        for cid in &l_doc.coincident_point_ids {
            let p = resolve_point(&point_keys, cid)?;
            line.coincident.insert(p);
        }
        line_keys.insert(&l_doc.id, key);
    }

    let mut seen_image_ids = std::collections::HashSet::new();
    for i_doc in &doc.image_points {
        if !seen_image_ids.insert(i_doc.id.as_str()) {
            return Err(DocumentError::DuplicateId(i_doc.id.clone()));
        }
        let point = resolve_point(&point_keys, &i_doc.world_point_id)?;
        let vp = vp_keys
            .get(i_doc.viewpoint_id.as_str())
            .copied()
            .ok_or_else(|| DocumentError::UnresolvedReference(i_doc.viewpoint_id.clone()))?;
        project
            .add_observation(point, vp, i_doc.u, i_doc.v)
            .map_err(|_| DocumentError::DuplicateId(i_doc.id.clone()))?;
    }

    let mut seen_constraint_ids = std::collections::HashSet::new();
    for c_doc in &doc.constraints {
        if !seen_constraint_ids.insert(c_doc.id.as_str()) {
            return Err(DocumentError::DuplicateId(c_doc.id.clone()));
        }
        let resolve_line = |id: &str| {
            line_keys
                .get(id)
                .copied()
                .ok_or_else(|| DocumentError::UnresolvedReference(id.to_string()))
        };
        let kind = match &c_doc.kind {
            ConstraintKindDoc::DistancePointPoint {
                point_a_id,
                point_b_id,
                distance,
            } => ConstraintKind::DistancePointPoint {
                a: resolve_point(&point_keys, point_a_id)?,
                b: resolve_point(&point_keys, point_b_id)?,
                distance: *distance,
            },
            ConstraintKindDoc::AnglePointPointPoint {
                point_a_id,
                vertex_id,
                point_c_id,
                degrees,
            } => ConstraintKind::AnglePointPointPoint {
                a: resolve_point(&point_keys, point_a_id)?,
                vertex: resolve_point(&point_keys, vertex_id)?,
                c: resolve_point(&point_keys, point_c_id)?,
                degrees: *degrees,
            },
            ConstraintKindDoc::FixedPoint { point_id, target } => ConstraintKind::FixedPoint {
                point: resolve_point(&point_keys, point_id)?,
                target: Vector3::new(target[0], target[1], target[2]),
            },
            ConstraintKindDoc::CollinearPoints { point_ids } => ConstraintKind::CollinearPoints {
                points: point_ids
                    .iter()
                    .map(|id| resolve_point(&point_keys, id))
                    .collect::<Result<_, _>>()?,
            },
            ConstraintKindDoc::CoplanarPoints { point_ids } => ConstraintKind::CoplanarPoints {
                points: point_ids
                    .iter()
                    .map(|id| resolve_point(&point_keys, id))
                    .collect::<Result<_, _>>()?,
            },
            ConstraintKindDoc::ParallelLines { line_a_id, line_b_id } => {
                ConstraintKind::ParallelLines {
                    a: resolve_line(line_a_id)?,
                    b: resolve_line(line_b_id)?,
                }
            }
            ConstraintKindDoc::PerpendicularLines { line_a_id, line_b_id } => {
                ConstraintKind::PerpendicularLines {
                    a: resolve_line(line_a_id)?,
                    b: resolve_line(line_b_id)?,
                }
            }
            ConstraintKindDoc::EqualDistances { pairs } => ConstraintKind::EqualDistances {
                pairs: pairs
                    .iter()
                    .map(|[a, b]| {
                        Ok((
                            resolve_point(&point_keys, a)?,
                            resolve_point(&point_keys, b)?,
                        ))
                    })
                    .collect::<Result<_, DocumentError>>()?,
            },
            ConstraintKindDoc::EqualAngles { triplets } => ConstraintKind::EqualAngles {
                triplets: triplets
                    .iter()
                    .map(|[a, v, c]| {
                        Ok((
                            resolve_point(&point_keys, a)?,
                            resolve_point(&point_keys, v)?,
                            resolve_point(&point_keys, c)?,
                        ))
                    })
                    .collect::<Result<_, DocumentError>>()?,
            },
            ConstraintKindDoc::Projection {
                point_id,
                viewpoint_id,
                observed,
            } => ConstraintKind::Projection {
                point: resolve_point(&point_keys, point_id)?,
                viewpoint: vp_keys
                    .get(viewpoint_id.as_str())
                    .copied()
                    .ok_or_else(|| DocumentError::UnresolvedReference(viewpoint_id.clone()))?,
                observed: Vector2::new(observed[0], observed[1]),
            },
        };
        let mut constraint = Constraint::new(c_doc.name.clone(), kind);
        constraint.common.tolerance = c_doc.tolerance;
        constraint.common.enabled = c_doc.enabled;
        project
            .add_constraint(constraint)
            .map_err(|_| DocumentError::UnresolvedReference(c_doc.id.clone()))?;
    }

    let issues = project.validate();
    if issues.iter().any(|i| i.severity == Severity::Error) {
        return Err(DocumentError::Invalid(issues));
    }
    project.take_deltas(); // loading is not a host-visible edit
    Ok(project)
}
