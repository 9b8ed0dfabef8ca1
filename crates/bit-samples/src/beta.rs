//! # Beta - Order Inbox
//!
//! Listens for `orders/OrderCreated` and keeps a bounded inbox of the
//! orders it has seen. Beta never references alpha's types; it matches the
//! message by `(category, name)` and decodes the payload into its own
//! struct.
//!
//! Settings (`history`, `greeting`) are editable under `/beta/config`.

use axum::http::Method;
use bit_bus::{Envelope, MessageBus, MessageType, SubscriptionId};
use bit_contracts::{
    async_trait, Bit, BitContext, BitError, BitRequest, BitResponse, Configurable, LinkedUnit,
};
use bit_state::{StateSource, StateStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const ROUTE: &str = "/beta";
pub const STATE_KEY: &str = "beta.inbox";
const MAX_HISTORY: usize = 1000;

/// The order announcement as beta reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNotice {
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxEntry {
    pub notice: OrderNotice,
    pub source: String,
    pub received_at: DateTime<Utc>,
}

/// State of the beta bit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboxState {
    /// Notices received since start, including ones trimmed from `recent`.
    pub received: u64,
    pub units_ordered: u64,
    pub recent: Vec<InboxEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BetaSettings {
    /// How many notices `recent` keeps.
    pub history: usize,
    pub greeting: String,
}

impl Default for BetaSettings {
    fn default() -> Self {
        Self {
            history: 20,
            greeting: "Beta inbox".to_string(),
        }
    }
}

impl BetaSettings {
    fn validate(&self) -> Result<(), BitError> {
        if self.history == 0 || self.history > MAX_HISTORY {
            return Err(BitError::bad_request(format!(
                "history must be between 1 and {MAX_HISTORY}"
            )));
        }
        Ok(())
    }
}

fn order_created() -> MessageType {
    MessageType::new("orders", "OrderCreated")
}

/// Inbox bit.
pub struct BetaBit {
    bus: MessageBus,
    module_id: String,
    state: StateStore<InboxState>,
    settings: Arc<RwLock<BetaSettings>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl BetaBit {
    pub fn new(ctx: &BitContext) -> Self {
        Self {
            bus: ctx.bus().clone(),
            module_id: ctx.module_id().to_string(),
            state: StateStore::new(STATE_KEY, InboxState::default()),
            settings: Arc::new(RwLock::new(BetaSettings::default())),
            subscription: Mutex::new(None),
        }
    }

    pub fn inbox(&self) -> &StateStore<InboxState> {
        &self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }
}

fn receive(
    state: &StateStore<InboxState>,
    settings: &RwLock<BetaSettings>,
    envelope: &Envelope,
) -> Result<(), bit_bus::BoxError> {
    let notice: OrderNotice = envelope.decode()?;
    let history = settings.read().history;
    let entry = InboxEntry {
        notice,
        source: envelope.metadata().source.clone(),
        received_at: Utc::now(),
    };

    debug!(order_id = %entry.notice.order_id, source = %entry.source, "Order notice received");
    state.update(move |inbox| {
        inbox.received += 1;
        inbox.units_ordered += u64::from(entry.notice.quantity);
        inbox.recent.push(entry);
        let excess = inbox.recent.len().saturating_sub(history);
        inbox.recent.drain(..excess);
    });
    Ok(())
}

#[async_trait]
impl Bit for BetaBit {
    fn route(&self) -> &str {
        ROUTE
    }

    fn name(&self) -> &str {
        "beta"
    }

    fn description(&self) -> &str {
        "Order inbox; subscribes to orders/OrderCreated"
    }

    fn has_ui(&self) -> bool {
        true
    }

    fn state_key(&self) -> Option<&str> {
        Some(STATE_KEY)
    }

    async fn handle(&self, request: BitRequest) -> Result<BitResponse, BitError> {
        match (&request.method, request.path.as_str()) {
            (&Method::GET, "/") => {
                let greeting = self.settings.read().greeting.clone();
                let received = self.state.get_snapshot().with(|s| s.received);
                BitResponse::json(&json!({ "greeting": greeting, "received": received }))
            }
            (_, path) => Err(BitError::NotFound(format!("{ROUTE}{path}"))),
        }
    }

    fn state(&self) -> Option<Arc<dyn StateSource>> {
        Some(Arc::new(self.state.clone()))
    }

    fn configuration(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    async fn start(&self) -> Result<(), BitError> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }

        let state = self.state.clone();
        let settings = Arc::clone(&self.settings);
        let id = self.bus.subscribe_as(
            order_created(),
            format!("{}:beta", self.module_id),
            move |envelope| receive(&state, &settings, envelope),
        );
        info!(module = %self.module_id, subscription_id = %id, "Beta subscribed to order notices");
        *subscription = Some(id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BitError> {
        let id = self.subscription.lock().take();
        if let Some(id) = id {
            self.bus.unsubscribe(id).map_err(BitError::internal)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Configurable for BetaBit {
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "history": { "type": "integer", "minimum": 1, "maximum": MAX_HISTORY },
                "greeting": { "type": "string" }
            },
            "required": ["history", "greeting"]
        })
    }

    fn get_config(&self) -> Value {
        serde_json::to_value(&*self.settings.read()).unwrap_or(Value::Null)
    }

    fn set_config(&self, value: Value) -> Result<(), BitError> {
        let settings: BetaSettings = serde_json::from_value(value)?;
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }
}

/// Registration manifest for the beta unit.
pub fn unit() -> LinkedUnit {
    LinkedUnit::new("beta", env!("CARGO_PKG_VERSION"))
        .component(|ctx| Ok(Arc::new(BetaBit::new(ctx))))
}
