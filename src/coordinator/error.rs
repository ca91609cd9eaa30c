use log::warn;
use thiserror::Error;

use crate::services::ServiceError;

pub const SIGN_IN_AGAIN: &str = "Please sign in again.";

/// What a user action can fail with. Every variant carries the message shown to the user.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    /// The action collides with an existing ride
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    /// Not allowed in the current state
    #[error("{0}")]
    Refused(String),

    #[error("{0}")]
    Invalid(String),

    /// A collaborator failed; retrying may work
    #[error("{0}")]
    Transient(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

impl From<ServiceError> for CoordinatorError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Unauthorized(reason) => {
                warn!("Collaborator refused the session: {}", reason);
                CoordinatorError::Unauthorized(SIGN_IN_AGAIN.to_string())
            }
            ServiceError::NotFound(what) => CoordinatorError::Invalid(format!("Not found: {}", what)),
            ServiceError::Unavailable(reason) => {
                warn!("Collaborator unavailable: {}", reason);
                CoordinatorError::Transient("Something went wrong, please try again.".to_string())
            }
        }
    }
}
