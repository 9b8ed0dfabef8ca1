//! # Messages
//!
//! [`MessageType`] keys and the immutable [`Envelope`] handed to handlers.

use crate::errors::BusError;
use crate::HOST_SOURCE;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable key identifying a class of published messages.
///
/// Equality is structural: two bits that each declare
/// `MessageType::new("orders", "OrderCreated")` address the same messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageType {
    category: String,
    name: String,
}

impl MessageType {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// Metadata attached to every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// When the message was published.
    pub timestamp: DateTime<Utc>,
    /// Unique id of this message.
    pub message_id: Uuid,
    /// Links related messages (e.g. a request and the events it caused).
    pub correlation_id: Option<Uuid>,
    /// Module or bit that published the message.
    pub source: String,
}

impl Metadata {
    /// Fresh metadata stamped now with a new message id.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
            correlation_id: None,
            source: source.into(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new(HOST_SOURCE)
    }
}

/// A published message. Created once per publish and shared read-only
/// with every handler, so no handler can observe a partially written payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    message_type: MessageType,
    payload: serde_json::Value,
    metadata: Metadata,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: serde_json::Value, metadata: Metadata) -> Self {
        Self {
            message_type,
            payload,
            metadata,
        }
    }

    #[must_use]
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    /// Raw payload. The bus never inspects it.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        T::deserialize(&self.payload).map_err(|source| BusError::Decode {
            message_type: self.message_type.to_string(),
            source,
        })
    }
}
