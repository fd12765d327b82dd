//! Structure-from-motion initialization: vanishing-point calibration,
//! two-view reconstruction from the essential matrix, triangulation, extra
//! view registration by P3P/DLT, and rigid scene alignment.
//!
//! Every sub-step is best-effort: a failing alternative falls through to the
//! next one, and only total failure surfaces an [`InitError`].

pub mod align;
pub mod essential;
pub mod pnp;
pub mod rq;
pub mod triangulate;
pub mod vanishing;

pub use align::{align_scene, align_scene_with_sign, similarity_align, Alignment};
pub use essential::{reconstruct_two_view, TwoViewReconstruction};
pub use pnp::{estimate_pose, PoseEstimate};
pub use triangulate::triangulate;
pub use vanishing::{calibrate_from_vanishing_points, vanishing_point, VpCalibration};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("degenerate vanishing-point geometry")]
    DegenerateVanishingGeometry,
    #[error("not enough correspondences: need {needed}, got {got}")]
    NotEnoughCorrespondences { needed: usize, got: usize },
    #[error("essential matrix decomposition failed")]
    EssentialDecompositionFailed,
    #[error("pose estimation failed")]
    PnpFailed,
    #[error("SVD failed to converge")]
    SvdFailed,
    #[error("invalid rotation matrix")]
    InvalidRotationMatrix,
    #[error("solver error: {0}")]
    Solve(#[from] photomark_solve::SolveError),
}

pub type Result<T> = std::result::Result<T, InitError>;
