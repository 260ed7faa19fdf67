use crate::{errors::ServiceError, services::payment_gateway::CallbackAck, AppState};
use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use tracing::info;

/// POST /payment/webhook
///
/// The raw body is needed for signature verification, so it is taken as bytes
/// and parsed by the gateway.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackAck>, ServiceError> {
    let ack = state.gateway.handle_callback(&headers, &body).await?;
    if ack.applied {
        info!(order_id = ?ack.order_id, status = ?ack.status, "Payment callback applied");
    }
    Ok(Json(ack))
}
