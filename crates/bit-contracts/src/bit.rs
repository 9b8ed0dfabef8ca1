//! # Bit Trait
//!
//! The contract every hosted component implements.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bit_contracts::{async_trait, Bit, BitError, BitRequest, BitResponse};
//!
//! pub struct Hello;
//!
//! #[async_trait]
//! impl Bit for Hello {
//!     fn route(&self) -> &str { "/hello" }
//!     fn name(&self) -> &str { "Hello" }
//!     async fn handle(&self, _req: BitRequest) -> Result<BitResponse, BitError> {
//!         Ok(BitResponse::text("hello"))
//!     }
//!     fn as_any(&self) -> &dyn std::any::Any { self }
//! }
//! ```

use crate::config::Configurable;
use crate::errors::BitError;
use crate::http::{BitRequest, BitResponse};
use async_trait::async_trait;
use bit_state::StateSource;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

/// A hosted component, addressed by its route.
#[async_trait]
pub trait Bit: Send + Sync + 'static {
    /// Route prefix, starting with `/`. Matched case-insensitively.
    fn route(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether the bit ships a web UI under `R/ui`.
    fn has_ui(&self) -> bool {
        false
    }

    /// Key of the bit's state store, if it has one.
    fn state_key(&self) -> Option<&str> {
        None
    }

    /// Primary handler for requests to the route that are not one of the
    /// host-provided sub-paths.
    async fn handle(&self, request: BitRequest) -> Result<BitResponse, BitError>;

    /// The bit's state store, if any.
    fn state(&self) -> Option<Arc<dyn StateSource>> {
        None
    }

    /// The bit's configuration capability, if any.
    fn configuration(&self) -> Option<&dyn Configurable> {
        None
    }

    /// Called once after every module is loaded.
    async fn start(&self) -> Result<(), BitError> {
        Ok(())
    }

    /// Called once during host shutdown.
    async fn stop(&self) -> Result<(), BitError> {
        Ok(())
    }

    /// Concrete type access for capability lookups.
    fn as_any(&self) -> &dyn Any;
}

/// Metadata describing a registered bit.
#[derive(Debug, Clone, Serialize)]
pub struct BitInfo {
    pub route: String,
    pub name: String,
    pub description: String,
    pub has_ui: bool,
    pub state_key: Option<String>,
    pub configurable: bool,
}

impl BitInfo {
    pub fn of(bit: &dyn Bit) -> Self {
        Self {
            route: bit.route().to_string(),
            name: bit.name().to_string(),
            description: bit.description().to_string(),
            has_ui: bit.has_ui(),
            state_key: bit.state_key().map(str::to_string),
            configurable: bit.configuration().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Bit for Echo {
        fn route(&self) -> &str {
            "/echo"
        }

        fn name(&self) -> &str {
            "Echo"
        }

        async fn handle(&self, request: BitRequest) -> Result<BitResponse, BitError> {
            Ok(BitResponse::text(request.path))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn test_defaults_and_info() {
        let bit: Arc<dyn Bit> = Arc::new(Echo);
        let info = BitInfo::of(bit.as_ref());

        assert_eq!(info.route, "/echo");
        assert!(!info.has_ui);
        assert!(info.state_key.is_none());
        assert!(!info.configurable);
        assert!(bit.state().is_none());
        assert!(bit.start().await.is_ok());
        assert!(bit.as_any().downcast_ref::<Echo>().is_some());

        let resp = bit.handle(BitRequest::get()).await.unwrap();
        assert_eq!(resp.body, "/");
    }
}
