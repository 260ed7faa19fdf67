use crate::{
    config::{AppConfig, ResolutionMode},
    entities::order::OrderStatus,
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_ledger::{OrderDetails, OrderLedger, PaymentOutcome, Resolution},
        payment_processor::{CheckoutLineItem, CheckoutRequest, PaymentProcessor, SessionStatus},
    },
    webhooks::signature,
};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What the user is sent to in order to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub order_id: Uuid,
    pub session_id: String,
    pub pay_url: String,
}

/// Internal form of a processor callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCallback {
    pub event_id: Option<String>,
    pub order_id: Uuid,
    pub outcome: PaymentOutcome,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackAck {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
}

impl CallbackAck {
    fn ignored() -> Self {
        Self {
            applied: false,
            order_id: None,
            status: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    data: CallbackData,
}

#[derive(Debug, Deserialize)]
struct CallbackData {
    object: CallbackSession,
}

#[derive(Debug, Deserialize)]
struct CallbackSession {
    id: String,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// Parses a processor event. `Ok(None)` means a well-formed event of a type
/// that does not resolve anything.
pub fn parse_callback(body: &[u8]) -> Result<Option<ParsedCallback>, ServiceError> {
    let envelope: CallbackEnvelope = serde_json::from_slice(body)
        .map_err(|e| ServiceError::CallbackRejected(format!("invalid payload: {}", e)))?;

    let session = envelope.data.object;
    let outcome = match envelope.event_type.as_str() {
        "checkout.session.completed" => match session.payment_status.as_deref() {
            Some("paid") | Some("no_payment_required") => Some(PaymentOutcome::Success),
            // Delayed payment methods complete unpaid and settle later.
            _ => None,
        },
        "checkout.session.async_payment_succeeded" => Some(PaymentOutcome::Success),
        "checkout.session.async_payment_failed" => Some(PaymentOutcome::Failure),
        "checkout.session.expired" => Some(PaymentOutcome::Cancelled),
        _ => None,
    };
    let Some(outcome) = outcome else {
        return Ok(None);
    };

    let order_ref = session
        .metadata
        .get("order_id")
        .or(session.client_reference_id.as_ref())
        .ok_or_else(|| ServiceError::CallbackRejected("missing order reference".to_string()))?;
    let order_id = Uuid::parse_str(order_ref)
        .map_err(|_| ServiceError::CallbackRejected(format!("bad order reference {}", order_ref)))?;

    Ok(Some(ParsedCallback {
        event_id: envelope.id,
        order_id,
        outcome,
        session_id: session.id,
    }))
}

/// Maps a retrieved session to a definitive outcome, if it has one yet.
pub fn outcome_from_status(status: &SessionStatus) -> Option<PaymentOutcome> {
    match (status.payment_status.as_str(), status.status.as_str()) {
        ("paid", _) | ("no_payment_required", "complete") => Some(PaymentOutcome::Success),
        (_, "expired") => Some(PaymentOutcome::Cancelled),
        _ => None,
    }
}

/// Payment Gateway Adapter.
#[derive(Clone)]
pub struct PaymentGateway {
    ledger: OrderLedger,
    processor: Arc<dyn PaymentProcessor>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
}

impl PaymentGateway {
    pub fn new(
        ledger: OrderLedger,
        processor: Arc<dyn PaymentProcessor>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            ledger,
            processor,
            config,
            event_sender,
        }
    }

    pub fn resolution_mode(&self) -> ResolutionMode {
        self.config.resolution_mode()
    }

    /// Opens an external payment session for a PENDING order and binds it.
    ///
    /// On processor failure the order stays PENDING without a session id and a
    /// retryable `GatewayError` is returned.
    #[instrument(skip(self, details), fields(order_id = %details.order.id))]
    pub async fn create_session(&self, details: &OrderDetails) -> Result<SessionHandle, ServiceError> {
        let order = &details.order;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is {}",
                order.id, order.status
            )));
        }
        if order.payment_session_id.is_some() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} already has a payment session",
                order.id
            )));
        }
        if details.lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let request = CheckoutRequest {
            order_id: order.id,
            currency: self.config.payment_currency.clone(),
            line_items: details
                .lines
                .iter()
                .map(|line| CheckoutLineItem {
                    name: line.product_name.clone(),
                    unit_amount_minor: line.unit_price_minor,
                    quantity: line.quantity,
                })
                .collect(),
            success_url: self.config.payment_success_url(order.id),
            cancel_url: self.config.payment_cancel_url(order.id),
        };

        let session = match self.processor.create_checkout(&request).await {
            Ok(session) => session,
            Err(e) => {
                error!(order_id = %order.id, "Payment session creation failed: {}", e);
                return Err(if e.is_retryable() {
                    e
                } else {
                    ServiceError::GatewayError(e.to_string())
                });
            }
        };

        if !self
            .ledger
            .attach_payment_session(order.id, &session.session_id)
            .await?
        {
            return Err(ServiceError::Conflict(format!(
                "Order {} changed while its payment session was created",
                order.id
            )));
        }

        self.event_sender
            .send_or_log(Event::PaymentSessionCreated {
                order_id: order.id,
                session_id: session.session_id.clone(),
            })
            .await;
        info!(order_id = %order.id, session_id = %session.session_id, "Payment session created");

        Ok(SessionHandle {
            order_id: order.id,
            session_id: session.session_id,
            pay_url: session.pay_url,
        })
    }

    /// Authenticates, parses and applies a pushed processor callback.
    ///
    /// Rejections never touch order state.
    #[instrument(skip(self, headers, body))]
    pub async fn handle_callback(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<CallbackAck, ServiceError> {
        if let Err(e) = self.authenticate(headers, body) {
            self.reject(&e).await;
            return Err(e);
        }

        let parsed = match parse_callback(body) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                debug!("Callback event type carries no payment outcome; acknowledged");
                return Ok(CallbackAck::ignored());
            }
            Err(e) => {
                self.reject(&e).await;
                return Err(e);
            }
        };

        if !self.resolution_mode().accepts_push() {
            info!(order_id = %parsed.order_id, "Push resolution disabled; callback acknowledged without effect");
            return Ok(CallbackAck::ignored());
        }

        let resolution = self
            .ledger
            .resolve_payment(parsed.order_id, parsed.outcome, Some(&parsed.session_id))
            .await?;

        Ok(CallbackAck {
            applied: resolution.applied,
            order_id: Some(resolution.order_id),
            status: Some(resolution.status),
        })
    }

    /// Pulls the processor's view of one order's session and applies a
    /// definitive outcome. Orders without a session are left alone.
    #[instrument(skip(self))]
    pub async fn sync_order(&self, order_id: Uuid) -> Result<Resolution, ServiceError> {
        let details = self.ledger.get_order(order_id).await?;
        let order = details.order;
        let unchanged = Resolution {
            order_id,
            applied: false,
            status: order.status,
        };

        if order.status.is_terminal() {
            return Ok(unchanged);
        }
        let Some(session_id) = order.payment_session_id else {
            return Ok(unchanged);
        };

        let status = self.processor.retrieve_session(&session_id).await?;
        if let Some(reported) = status.order_id {
            if reported != order_id {
                return Err(ServiceError::Conflict(format!(
                    "Session {} belongs to order {}",
                    session_id, reported
                )));
            }
        }

        match outcome_from_status(&status) {
            Some(outcome) => {
                self.ledger
                    .resolve_payment(order_id, outcome, Some(&session_id))
                    .await
            }
            None => Ok(unchanged),
        }
    }

    /// One reconciliation pass over stale PENDING orders. Returns how many were
    /// resolved. Per-order failures are logged and left for the next pass.
    #[instrument(skip(self))]
    pub async fn reconcile_pending(&self) -> Result<usize, ServiceError> {
        let cutoff = chrono::Utc::now() - self.config.payment_poll_min_age();
        let pending = self.ledger.pending_with_session(cutoff).await?;
        let mut resolved = 0;

        for order in pending {
            match self.sync_order(order.id).await {
                Ok(resolution) if resolution.applied => resolved += 1,
                Ok(_) => {}
                Err(e) => warn!(order_id = %order.id, "Reconciliation failed: {}", e),
            }
        }

        if resolved > 0 {
            info!(resolved, "Reconciliation pass resolved orders");
        }
        Ok(resolved)
    }

    /// Runs `reconcile_pending` forever at the given interval.
    pub async fn run_reconciliation(self, interval: Duration) {
        info!(?interval, "Starting payment reconciliation poller");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_pending().await {
                error!("Reconciliation pass failed: {}", e);
            }
        }
    }

    fn authenticate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
        match &self.config.payment_webhook_secret {
            Some(secret) => signature::verify(
                headers,
                body,
                secret,
                self.config.payment_webhook_tolerance_secs,
                chrono::Utc::now().timestamp(),
            )
            .map_err(|e| ServiceError::Unauthorized(format!("invalid webhook signature: {}", e))),
            None if self.config.payment_allow_unsigned_callbacks => {
                warn!("Accepting unsigned payment callback");
                Ok(())
            }
            None => Err(ServiceError::Unauthorized(
                "no webhook secret configured".to_string(),
            )),
        }
    }

    async fn reject(&self, error: &ServiceError) {
        warn!("Payment callback rejected: {}", error);
        self.event_sender
            .send_or_log(Event::PaymentCallbackRejected {
                reason: error.to_string(),
                timestamp: chrono::Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn event(event_type: &str, payment_status: &str, order_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "data": {"object": {
                "id": "cs_test_1",
                "payment_status": payment_status,
                "status": "complete",
                "metadata": {"order_id": order_id}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn completed_and_paid_is_success() {
        let id = Uuid::new_v4();
        let parsed = parse_callback(&event("checkout.session.completed", "paid", &id.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.order_id, id);
        assert_eq!(parsed.outcome, PaymentOutcome::Success);
        assert_eq!(parsed.session_id, "cs_test_1");
        assert_eq!(parsed.event_id.as_deref(), Some("evt_1"));
    }

    #[test]
    fn completed_but_unpaid_is_ignored() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(
            parse_callback(&event("checkout.session.completed", "unpaid", &id)).unwrap(),
            None
        );
    }

    #[test]
    fn failure_and_expiry_map_to_outcomes() {
        let id = Uuid::new_v4().to_string();
        let failed = parse_callback(&event("checkout.session.async_payment_failed", "unpaid", &id))
            .unwrap()
            .unwrap();
        assert_eq!(failed.outcome, PaymentOutcome::Failure);
        let expired = parse_callback(&event("checkout.session.expired", "unpaid", &id))
            .unwrap()
            .unwrap();
        assert_eq!(expired.outcome, PaymentOutcome::Cancelled);
    }

    #[test]
    fn unrelated_event_types_are_ignored() {
        assert_eq!(
            parse_callback(&event("customer.created", "paid", "x")).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert_matches!(
            parse_callback(b"not json"),
            Err(ServiceError::CallbackRejected(_))
        );
        assert_matches!(
            parse_callback(&event("checkout.session.completed", "paid", "not-a-uuid")),
            Err(ServiceError::CallbackRejected(_))
        );
    }

    #[test]
    fn client_reference_id_is_a_fallback_order_reference() {
        let id = Uuid::new_v4();
        let body = serde_json::to_vec(&json!({
            "type": "checkout.session.async_payment_succeeded",
            "data": {"object": {"id": "cs_2", "client_reference_id": id.to_string()}}
        }))
        .unwrap();
        let parsed = parse_callback(&body).unwrap().unwrap();
        assert_eq!(parsed.order_id, id);
        assert_eq!(parsed.event_id, None);
    }

    #[test]
    fn retrieved_status_mapping() {
        let status = |payment: &str, state: &str| SessionStatus {
            session_id: "cs".into(),
            order_id: None,
            payment_status: payment.into(),
            status: state.into(),
        };
        assert_eq!(
            outcome_from_status(&status("paid", "complete")),
            Some(PaymentOutcome::Success)
        );
        assert_eq!(
            outcome_from_status(&status("unpaid", "expired")),
            Some(PaymentOutcome::Cancelled)
        );
        assert_eq!(outcome_from_status(&status("unpaid", "open")), None);
    }
}
