use crate::{
    entities::order::OrderStatus,
    errors::ServiceError,
    services::order_ledger::{short_ref, OrderDetails},
    AppState,
};
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    pub order_id: Uuid,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderLineView {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

/// Order as shown on the payment landing pages.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderView {
    pub id: Uuid,
    pub reference: String,
    pub status: OrderStatus,
    pub total: Decimal,
    pub lines: Vec<OrderLineView>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<OrderDetails> for OrderView {
    fn from(details: OrderDetails) -> Self {
        let total = details.total();
        let order = details.order;
        Self {
            id: order.id,
            reference: short_ref(order.id),
            status: order.status,
            total,
            lines: details
                .lines
                .iter()
                .map(|line| OrderLineView {
                    product_id: line.product_id,
                    name: line.product_name.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price(),
                    subtotal: line.subtotal(),
                })
                .collect(),
            created_at: order.created_at,
            resolved_at: order.resolved_at,
        }
    }
}

/// GET /payment/success
///
/// Pulls the processor's view first when pull resolution is enabled, so a user
/// landing here resolves the order even if the callback never arrives.
pub async fn payment_success(
    State(state): State<AppState>,
    Query(query): Query<RedirectQuery>,
) -> Result<Json<OrderView>, ServiceError> {
    if state.gateway.resolution_mode().accepts_poll() {
        match state.gateway.sync_order(query.order_id).await {
            Ok(resolution) => {
                debug!(order_id = %query.order_id, applied = resolution.applied, "Order synced on success redirect")
            }
            Err(ServiceError::NotFound(message)) => return Err(ServiceError::NotFound(message)),
            Err(e) => warn!(order_id = %query.order_id, "Order sync on redirect failed: {}", e),
        }
    }
    let details = state.ledger.get_order(query.order_id).await?;
    Ok(Json(OrderView::from(details)))
}

/// GET /payment/cancel
///
/// The user backed out of the payment page. The order stays PENDING until the
/// processor reports the session expired, so a user can still come back to pay.
pub async fn payment_cancel(
    State(state): State<AppState>,
    Query(query): Query<RedirectQuery>,
) -> Result<Json<OrderView>, ServiceError> {
    let details = state.ledger.get_order(query.order_id).await?;
    Ok(Json(OrderView::from(details)))
}
