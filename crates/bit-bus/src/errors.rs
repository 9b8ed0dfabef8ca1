//! Bus error types.

use thiserror::Error;

/// Error type handlers may return; anything implementing `std::error::Error`
/// converts into it with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Payload could not be converted into the requested type.
    #[error("Payload of {message_type} could not be decoded: {source}")]
    Decode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be turned into a payload.
    #[error("Payload could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),

    /// Subscription id is not (or no longer) registered.
    #[error("Unknown subscription {0}")]
    UnknownSubscription(u64),

    /// `publish_async` was called outside a tokio runtime.
    #[error("No async runtime available for background delivery")]
    NoRuntime,
}
