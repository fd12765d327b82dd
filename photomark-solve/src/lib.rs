//! Nonlinear least-squares machinery: camera projection, residual systems,
//! variable layout and the Levenberg-Marquardt core.
//!
//! Two interchangeable back ends assemble the same residual family into a
//! [`lm::LeastSquaresSystem`]: one drives scalar reverse-mode autodiff row by
//! row, the other uses hand-derived analytic Jacobians with dense or sparse
//! normal equations.

pub mod autodiff_backend;
pub mod camera;
pub mod explicit_backend;
pub mod layout;
pub mod lm;
pub mod residuals;
pub mod system;

pub use camera::{project_to_pixel, CameraParams};
pub use layout::{LayoutOptions, SlotRef, VariableLayout, Vars};
pub use lm::{minimize, LeastSquaresSystem, LinearSolver, LmOptions, LmReport};
pub use system::{has_geometric_residuals, residual_groups, GroupKind, ResidualGroup, SystemWeights};

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("normal equations could not be factored at any damping level")]
    SingularNormalEquations,
    #[error("non-finite residual encountered")]
    NonFiniteResidual,
}

/// Which residual/Jacobian machinery a solve uses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SolverBackend {
    /// Reverse-mode autodiff, dense normal equations.
    Autodiff,
    /// Analytic Jacobians, dense normal equations.
    #[default]
    ExplicitDense,
    /// Analytic Jacobians, sparse normal equations.
    ExplicitSparse,
}

impl SolverBackend {
    /// Parse the `SOLVER_BACKEND` environment variable, defaulting to the
    /// given backend for unknown or unset values.
    pub fn from_env(default: SolverBackend) -> SolverBackend {
        match std::env::var("SOLVER_BACKEND").as_deref() {
            Ok("autodiff") => SolverBackend::Autodiff,
            Ok("explicitDense") => SolverBackend::ExplicitDense,
            Ok("explicitSparse") => SolverBackend::ExplicitSparse,
            Ok(other) => {
                tracing::warn!(value = other, "unknown SOLVER_BACKEND; using default");
                default
            }
            Err(_) => default,
        }
    }

    pub fn linear_solver(&self) -> LinearSolver {
        match self {
            SolverBackend::ExplicitSparse => LinearSolver::Sparse,
            _ => LinearSolver::Dense,
        }
    }
}
