//! State store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    /// The cloning strategy could not copy the live value.
    #[error("State clone failed: {0}")]
    Clone(String),

    /// A snapshot could not be rendered as JSON.
    #[error("State serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
