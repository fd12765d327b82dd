//! Entity and constraint data model for the photomark reconstruction core.
//!
//! A [`Project`] owns every entity in slotmap arenas; cross-references are
//! keys, never pointers. All reference wiring (constraint back-links, image
//! observations) goes through `Project` methods so the invariants in
//! [`validate`] hold by construction.

pub mod constraint;
pub mod document;
pub mod line;
pub mod point;
pub mod project;
pub mod validate;
pub mod viewpoint;

pub use constraint::{Constraint, ConstraintCommon, ConstraintKind};
pub use document::{load_project, save_project, save_project_string, DocumentError};
pub use line::{AxisDirection, Line};
pub use point::{AxisState, WorldPoint};
pub use project::{Delta, EntityRef, ImagePoint, Project};
pub use validate::{Severity, ValidationCode, ValidationIssue};
pub use viewpoint::{Axis, VanishingLine, Viewpoint};

slotmap::new_key_type! {
    pub struct PointKey;
    pub struct LineKey;
    pub struct ViewpointKey;
    pub struct ObservationKey;
    pub struct ConstraintKey;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown world point")]
    UnknownPoint,
    #[error("unknown line")]
    UnknownLine,
    #[error("unknown viewpoint")]
    UnknownViewpoint,
    #[error("unknown observation")]
    UnknownObservation,
    #[error("unknown constraint")]
    UnknownConstraint,
    #[error("constraint needs at least {needed} operands, got {got}")]
    TooFewOperands { needed: usize, got: usize },
    #[error("image point already exists for this world point in this viewpoint")]
    DuplicateObservation,
}

pub type Result<T> = std::result::Result<T, ModelError>;
