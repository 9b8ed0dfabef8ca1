//! # Alpha - Order Intake
//!
//! Takes orders over HTTP, keeps them in its state store and announces each
//! one on the bus as `orders/OrderCreated`.
//!
//! | Request | Effect |
//! |---------|--------|
//! | `GET /alpha?sku=..&quantity=..` | create an order from query parameters |
//! | `POST /alpha` `{ "sku": .., "quantity": .. }` | create an order from JSON |
//! | `GET /alpha/orders` | list orders |
//!
//! The unit also ships an entrypoint that contributes a [`SkuCatalog`]
//! service and mounts `GET /api/alpha/skus`.

use axum::http::{Method, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use bit_bus::{MessageBus, MessageType, Metadata, PublishReport};
use bit_contracts::{
    async_trait, Bit, BitContext, BitError, BitRequest, BitResponse, Entrypoint, LinkedUnit,
    ServiceCollection,
};
use bit_state::{StateSource, StateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const ROUTE: &str = "/alpha";
pub const STATE_KEY: &str = "alpha.orders";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SKU: &str = "demo-widget";

/// `orders/OrderCreated`.
pub fn order_created() -> MessageType {
    MessageType::new("orders", "OrderCreated")
}

/// Payload of `orders/OrderCreated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub sku: String,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
}

/// State of the alpha bit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrdersState {
    pub orders: Vec<Order>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct NewOrder {
    sku: String,
    #[serde(default = "one")]
    quantity: u32,
}

fn one() -> u32 {
    1
}

/// Order intake bit.
pub struct AlphaBit {
    bus: MessageBus,
    module_id: String,
    state: StateStore<OrdersState>,
}

impl AlphaBit {
    pub fn new(ctx: &BitContext) -> Self {
        let state = StateStore::new(STATE_KEY, OrdersState::default());

        let heartbeat = state.clone();
        let scheduled = ctx.schedule("heartbeat", HEARTBEAT_INTERVAL, move || {
            let heartbeat = heartbeat.clone();
            async move {
                heartbeat.update(|s| s.last_heartbeat = Some(Utc::now()));
            }
        });
        if let Err(e) = scheduled {
            warn!(module = %ctx.module_id(), error = %e, "Heartbeat not scheduled");
        }

        Self {
            bus: ctx.bus().clone(),
            module_id: ctx.module_id().to_string(),
            state,
        }
    }

    pub fn orders(&self) -> &StateStore<OrdersState> {
        &self.state
    }

    /// Record an order and announce it.
    pub fn create_order(&self, sku: String, quantity: u32) -> Result<(Order, PublishReport), BitError> {
        if sku.trim().is_empty() {
            return Err(BitError::bad_request("sku must not be empty"));
        }
        if quantity == 0 {
            return Err(BitError::bad_request("quantity must be at least 1"));
        }

        let order = Order {
            id: Uuid::new_v4(),
            sku,
            quantity,
            created_at: Utc::now(),
        };
        let recorded = order.clone();
        self.state.update(move |s| s.orders.push(recorded));

        let event = OrderCreated {
            order_id: order.id,
            sku: order.sku.clone(),
            quantity: order.quantity,
        };
        let report = self
            .bus
            .publish_value(order_created(), &event, Some(Metadata::new(self.module_id.clone())))
            .map_err(BitError::internal)?;

        info!(order_id = %order.id, sku = %order.sku, delivered = report.delivered, "Order created");
        Ok((order, report))
    }

    fn created_response(order: Order, report: PublishReport) -> Result<BitResponse, BitError> {
        Ok(BitResponse::json(&serde_json::json!({
            "order": order,
            "delivered": report.delivered,
            "failed": report.failed,
        }))?
        .with_status(StatusCode::CREATED))
    }
}

#[async_trait]
impl Bit for AlphaBit {
    fn route(&self) -> &str {
        ROUTE
    }

    fn name(&self) -> &str {
        "alpha"
    }

    fn description(&self) -> &str {
        "Order intake; publishes orders/OrderCreated"
    }

    fn state_key(&self) -> Option<&str> {
        Some(STATE_KEY)
    }

    async fn handle(&self, request: BitRequest) -> Result<BitResponse, BitError> {
        match (request.method.clone(), request.path.as_str()) {
            (Method::GET, "/") => {
                let sku = request.query_param("sku").unwrap_or(DEFAULT_SKU).to_string();
                let quantity = match request.query_param("quantity") {
                    Some(raw) => raw
                        .parse()
                        .map_err(|_| BitError::bad_request(format!("invalid quantity {raw:?}")))?,
                    None => 1,
                };
                let (order, report) = self.create_order(sku, quantity)?;
                Self::created_response(order, report)
            }
            (Method::POST, "/") => {
                let new_order: NewOrder = request.json()?;
                let (order, report) = self.create_order(new_order.sku, new_order.quantity)?;
                Self::created_response(order, report)
            }
            (Method::GET, "/orders") => {
                let orders = self.state.get_snapshot().with(|s| s.orders.clone());
                BitResponse::json(&orders)
            }
            (_, path) => Err(BitError::NotFound(format!("{ROUTE}{path}"))),
        }
    }

    fn state(&self) -> Option<Arc<dyn StateSource>> {
        Some(Arc::new(self.state.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// SKUs alpha accepts, shared with other modules through the service
/// collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkuCatalog {
    pub skus: Vec<String>,
}

impl Default for SkuCatalog {
    fn default() -> Self {
        Self {
            skus: vec![DEFAULT_SKU.to_string(), "gadget".to_string(), "gizmo".to_string()],
        }
    }
}

pub struct AlphaEntrypoint {
    module_id: String,
    catalog: Arc<SkuCatalog>,
}

impl Entrypoint for AlphaEntrypoint {
    fn name(&self) -> &str {
        "alpha-catalog"
    }

    fn register_services(&self, services: &mut ServiceCollection) {
        services.insert(&self.module_id, Arc::clone(&self.catalog));
    }

    fn mount_routes(&self, router: Router) -> Router {
        let catalog = Arc::clone(&self.catalog);
        router.route(
            "/api/alpha/skus",
            get(move || {
                let catalog = Arc::clone(&catalog);
                async move { Json(catalog.as_ref().clone()) }
            }),
        )
    }
}

/// Registration manifest for the alpha unit.
pub fn unit() -> LinkedUnit {
    LinkedUnit::new("alpha", env!("CARGO_PKG_VERSION"))
        .component(|ctx| Ok(Arc::new(AlphaBit::new(ctx))))
        .entrypoint(|ctx| {
            Ok(Arc::new(AlphaEntrypoint {
                module_id: ctx.module_id().to_string(),
                catalog: Arc::new(SkuCatalog::default()),
            }))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bit_contracts::{SchedulerError, SchedulerHandle, TaskFn};

    struct NoScheduler;

    impl SchedulerHandle for NoScheduler {
        fn register(&self, name: &str, _interval: Duration, _task: TaskFn) -> Result<(), SchedulerError> {
            Err(SchedulerError::NoRuntime(name.to_string()))
        }
    }

    fn alpha(bus: &MessageBus) -> AlphaBit {
        AlphaBit::new(&BitContext::new(bus.clone(), "alpha", "/tmp/alpha", Arc::new(NoScheduler)))
    }

    #[tokio::test]
    async fn test_get_creates_and_publishes() {
        let bus = MessageBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(order_created(), move |envelope| {
            sink.lock().push(envelope.decode::<OrderCreated>()?);
            Ok(())
        });

        let bit = alpha(&bus);
        let response = bit
            .handle(BitRequest::get().with_query("sku", "gizmo").with_query("quantity", "3"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sku, "gizmo");
        assert_eq!(seen[0].quantity, 3);
        assert_eq!(bit.orders().version(), 1);
    }

    #[tokio::test]
    async fn test_post_validates_input() {
        let bit = alpha(&MessageBus::new());

        let bad = BitRequest::new(Method::POST, "/").with_body(r#"{"sku":"","quantity":1}"#);
        assert!(matches!(bit.handle(bad).await, Err(BitError::BadRequest(_))));

        let zero = BitRequest::get().with_query("quantity", "0");
        assert!(matches!(bit.handle(zero).await, Err(BitError::BadRequest(_))));

        let ok = BitRequest::new(Method::POST, "/").with_body(r#"{"sku":"gadget"}"#);
        bit.handle(ok).await.unwrap();

        let list = bit.handle(BitRequest::new(Method::GET, "/orders")).await.unwrap();
        let orders: serde_json::Value = serde_json::from_slice(&list.body).unwrap();
        assert_eq!(orders[0]["sku"], "gadget");
        assert_eq!(orders[0]["quantity"], 1);
    }

    #[test]
    fn test_entrypoint_registers_catalog() {
        let entrypoint = AlphaEntrypoint {
            module_id: "alpha".to_string(),
            catalog: Arc::new(SkuCatalog::default()),
        };
        let mut services = ServiceCollection::new();
        entrypoint.register_services(&mut services);

        let catalog = services.get::<SkuCatalog>().unwrap();
        assert!(catalog.skus.contains(&"gizmo".to_string()));
        assert_eq!(services.describe()[0].1, "alpha");
    }
}
