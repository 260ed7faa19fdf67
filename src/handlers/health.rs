use crate::{db, AppState};
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::time::Instant;

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let start = Instant::now();
    let database = db::check_connection(&state.db).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let (status, code, database) = match database {
        Ok(()) => ("up", StatusCode::OK, json!({"status": "up", "latency_ms": latency_ms})),
        Err(e) => (
            "down",
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "down", "message": e.response_message()}),
        ),
    };

    (
        code,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "checkout_sessions": state.engine.active_sessions().await,
            "details": { "database": database },
        })),
    )
}
