pub mod dispatcher;
pub mod protocol;

use repr_similarity_backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Unknown task `{0}`. Valid values: fetch_repr, calc_similarities")]
    UnknownTask(String),
    #[error("Unsupported protocol version {0}, only version 1 is supported")]
    UnsupportedVersion(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}
