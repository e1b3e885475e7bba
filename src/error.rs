use thiserror::Error;

/// Errors surfaced by the merging core.
///
/// Per-crystal problems (a snapshot that cannot be scaled or refined) are
/// not errors at this level; they are recorded on the crystal's status flag
/// and reported in the iteration counters.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("unknown point group '{0}'")]
    UnknownPointGroup(String),

    #[error("degenerate unit cell: {0}")]
    DegenerateCell(String),

    #[error("solver failed: {0}")]
    SolverFailed(String),

    #[error("scaling failed: {0}")]
    ScalingFailed(String),

    #[error("invalid input: {0}")]
    Input(String),
}
