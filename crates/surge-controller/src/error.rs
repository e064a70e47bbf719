//! Controller error types.

use thiserror::Error;

/// Errors that can occur while reconciling a scaling target.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store error: {0}")]
    State(#[from] surge_state::StateError),

    #[error("orchestration error: {0}")]
    Orchestration(#[from] anyhow::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
