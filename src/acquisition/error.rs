use thiserror::Error;

use super::models::RequestState;

/// Caller-visible errors of the acquisition scheduler.
///
/// Provider-classified download outcomes never appear here; the scheduler
/// absorbs them into request state. Only identifier validity and
/// state-precondition violations propagate to callers.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("product {0} is unknown to the remote provider")]
    InvalidIdentifier(String),

    #[error("there is no acquisition request with id {0}")]
    RequestNotFound(String),

    #[error("request {id} is in state {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: RequestState,
        actual: RequestState,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
