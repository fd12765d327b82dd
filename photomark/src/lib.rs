//! Project-level solver orchestration.
//!
//! [`solve`] assembles the residual system for a project, runs the LM core
//! through the selected back end and writes optimised coordinates and camera
//! parameters back. [`optimize_project`] prepends the structure-from-motion
//! initialization pipeline (vanishing points, essential matrix, PnP
//! registration, scene alignment).

mod init;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub use photomark_cal::Alignment;
pub use photomark_solve::SolverBackend;
pub use photomark_types::{Project, ValidationIssue};

use photomark_solve::autodiff_backend::{AutodiffSystem, SlotSource};
use photomark_solve::explicit_backend::{ExplicitLmSystem, ExplicitSystem};
use photomark_solve::residuals::constraint_residuals;
use photomark_solve::{
    has_geometric_residuals, minimize, project_to_pixel, residual_groups, LayoutOptions,
    LmOptions, LmReport, SystemWeights, VariableLayout, Vars,
};

#[derive(Debug, thiserror::Error)]
pub enum PhotomarkError {
    #[error(transparent)]
    Solve(#[from] photomark_solve::SolveError),
    #[error(transparent)]
    Init(#[from] photomark_cal::InitError),
    #[error(transparent)]
    Document(#[from] photomark_types::DocumentError),
    #[error("unknown viewpoint")]
    UnknownViewpoint,
}

pub type Result<T> = std::result::Result<T, PhotomarkError>;

/// Everything a caller can tune about a solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolveOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Initial LM damping λ₀.
    pub damping: f64,
    pub verbose: bool,
    /// Default back end; the `SOLVER_BACKEND` environment variable overrides.
    pub solver_backend: SolverBackend,
    pub optimize_pose: bool,
    pub optimize_intrinsics: bool,
    /// Scale on reprojection residuals whenever at least one geometric
    /// constraint is present, so thousands of pixel observations cannot
    /// override a handful of metric assertions.
    pub reprojection_weight: f64,
    /// Scale on the quaternion-norm regulariser.
    pub regularization_weight: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
            damping: 1e-3,
            verbose: false,
            solver_backend: SolverBackend::default(),
            optimize_pose: true,
            optimize_intrinsics: false,
            reprojection_weight: 1e-4,
            regularization_weight: 1.0,
        }
    }
}

/// Result of one [`solve`] call.
#[derive(Debug, Clone)]
pub struct SolveSummary {
    pub converged: bool,
    pub iterations: usize,
    /// Final cost ½‖r‖².
    pub residual: f64,
    /// Median pixel distance over all image observations, when any exist.
    pub median_reprojection_error: Option<f64>,
}

/// Result of [`optimize_project`].
#[derive(Debug, Clone)]
pub struct OptimizeSummary {
    pub solve: SolveSummary,
    pub alignment: Alignment,
}

fn weights_for(project: &Project, options: &SolveOptions) -> SystemWeights {
    SystemWeights {
        reprojection: if has_geometric_residuals(project) {
            options.reprojection_weight
        } else {
            1.0
        },
        regularization: options.regularization_weight,
    }
}

/// Jointly refine world points and camera parameters so reprojections match
/// observations and all enabled constraints hold. A non-converged run still
/// writes the last accepted variable vector back; the caller decides whether
/// to keep it.
pub fn solve(project: &mut Project, options: &SolveOptions) -> Result<SolveSummary> {
    let backend = SolverBackend::from_env(options.solver_backend);
    let layout_opts = LayoutOptions {
        optimize_pose: options.optimize_pose,
        optimize_intrinsics: options.optimize_intrinsics,
    };
    let mut layout = VariableLayout::build(project, &layout_opts);
    let weights = weights_for(project, options);
    let groups = residual_groups(project, &layout, &weights);

    let lm_opts = LmOptions {
        max_iterations: options.max_iterations,
        tolerance: options.tolerance,
        damping: options.damping,
        verbose: options.verbose,
        linear_solver: backend.linear_solver(),
    };

    let mut vars = layout.initial_values();
    let report: LmReport = match backend {
        SolverBackend::Autodiff => {
            let mut system = AutodiffSystem::new(project, &layout, groups);
            minimize(&mut system, &mut vars, &lm_opts)?
        }
        SolverBackend::ExplicitDense | SolverBackend::ExplicitSparse => {
            let system = ExplicitSystem::from_groups(project, &mut layout, &groups);
            let mut lm_system = ExplicitLmSystem {
                layout: &layout,
                system,
            };
            minimize(&mut lm_system, &mut vars, &lm_opts)?
        }
    };

    tracing::debug!(
        converged = report.converged,
        iterations = report.iterations,
        initial_cost = report.initial_cost,
        final_cost = report.final_cost,
        "solve finished"
    );

    snapshot_constraint_residuals(project, &layout, &vars);
    layout.apply(project, &vars);

    Ok(SolveSummary {
        converged: report.converged,
        iterations: report.iterations,
        residual: report.final_cost,
        median_reprojection_error: median_reprojection_error(project),
    })
}

/// Run the full initialization pipeline, then a full solve.
pub fn optimize_project(
    project: &mut Project,
    options: &SolveOptions,
) -> Result<OptimizeSummary> {
    let alignment = init::initialize(project, options)?;
    let solve = solve(project, options)?;
    Ok(OptimizeSummary { solve, alignment })
}

/// Store each enabled constraint's unweighted residuals for the
/// satisfied-or-not query surface.
fn snapshot_constraint_residuals(
    project: &mut Project,
    layout: &VariableLayout,
    vars: &nalgebra::DVector<f64>,
) {
    let snapshots: Vec<(photomark_types::ConstraintKey, Vec<f64>)> = {
        let source = SlotSource {
            vars: Vars {
                layout,
                values: vars,
            },
        };
        project
            .constraints()
            .filter(|(_, c)| c.common.enabled)
            .map(|(key, c)| (key, constraint_residuals(project, &c.kind, &source)))
            .collect()
    };
    for (key, residuals) in snapshots {
        if let Some(c) = project.constraint_mut(key) {
            c.common.last_residuals = residuals;
        }
    }
}

/// Median pixel distance between observations and current reprojections.
pub fn median_reprojection_error(project: &Project) -> Option<f64> {
    let mut errors: Vec<f64> = project
        .observations()
        .filter_map(|(_, obs)| {
            let point = project.point(obs.world_point)?;
            let xyz = point.effective_xyz()?;
            let vp = project.viewpoint(obs.viewpoint)?;
            let projected = project_to_pixel(vp, &xyz)?;
            Some((projected - Vector2::new(obs.u, obs.v)).norm())
        })
        .collect();
    if errors.is_empty() {
        return None;
    }
    errors.sort_by(|a, b| a.total_cmp(b));
    let n = errors.len();
    Some(if n % 2 == 0 {
        0.5 * (errors[n / 2 - 1] + errors[n / 2])
    } else {
        errors[n / 2]
    })
}

/// Pixel-space vanishing point of an axis's vanishing lines on a viewpoint;
/// part of the host query surface.
pub fn vanishing_point_for_axis(
    project: &Project,
    viewpoint: photomark_types::ViewpointKey,
    axis: photomark_types::Axis,
) -> Result<Vector2<f64>> {
    let vp = project
        .viewpoint(viewpoint)
        .ok_or(PhotomarkError::UnknownViewpoint)?;
    let segments: Vec<(Vector2<f64>, Vector2<f64>)> = vp
        .vanishing_lines
        .iter()
        .filter(|l| l.axis == axis)
        .map(|l| (l.a, l.b))
        .collect();
    Ok(photomark_cal::vanishing_point(&segments)?)
}
