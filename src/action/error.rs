//! Action Error Types
//!
//! Two failure channels exist for every action operation: user errors, which
//! travel inside the result envelope, and internal errors, which surface as a
//! transport failure the orchestrator retries.

use super::types::UserError;

/// Error returned by action operations
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// User-facing error, reported through the result envelope
    #[error("{0}")]
    User(UserError),

    /// Internal error, reported as a transport failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ActionError {
    pub fn errored(title: impl Into<String>) -> Self {
        ActionError::User(UserError::errored(title))
    }

    pub fn failed(title: impl Into<String>) -> Self {
        ActionError::User(UserError::failed(title))
    }

    /// User error with the underlying cause as detail
    pub fn failed_with(title: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        ActionError::User(UserError::failed(title).with_detail(cause.to_string()))
    }

    pub fn errored_with(title: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        ActionError::User(UserError::errored(title).with_detail(cause.to_string()))
    }
}

impl From<UserError> for ActionError {
    fn from(err: UserError) -> Self {
        ActionError::User(err)
    }
}

pub type ActionResult<T> = std::result::Result<T, ActionError>;
