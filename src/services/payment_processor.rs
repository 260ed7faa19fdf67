use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// One priced line handed to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutLineItem {
    pub name: String,
    pub unit_amount_minor: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    pub order_id: Uuid,
    pub currency: String,
    pub line_items: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
}

/// Result of a successful `create_checkout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub pay_url: String,
}

/// Processor-side view of a session, used by the pull path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub order_id: Option<Uuid>,
    /// `paid`, `unpaid` or `no_payment_required`
    pub payment_status: String,
    /// `open`, `complete` or `expired`
    pub status: String,
}

/// External payment processor collaborator.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError>;

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionStatus, ServiceError>;
}

/// Stripe-compatible Checkout Sessions client.
#[derive(Clone)]
pub struct StripeCheckoutProcessor {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl StripeCheckoutProcessor {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    fn form_fields(request: &CheckoutRequest) -> Vec<(String, String)> {
        let mut fields = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            (
                "client_reference_id".to_string(),
                request.order_id.to_string(),
            ),
            ("metadata[order_id]".to_string(), request.order_id.to_string()),
        ];
        for (i, line) in request.line_items.iter().enumerate() {
            let prefix = format!("line_items[{}]", i);
            fields.push((
                format!("{}[price_data][currency]", prefix),
                request.currency.clone(),
            ));
            fields.push((
                format!("{}[price_data][product_data][name]", prefix),
                line.name.clone(),
            ));
            fields.push((
                format!("{}[price_data][unit_amount]", prefix),
                line.unit_amount_minor.to_string(),
            ));
            fields.push((format!("{}[quantity]", prefix), line.quantity.to_string()));
        }
        fields
    }

    async fn read_session(response: reqwest::Response) -> Result<StripeSession, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<StripeErrorEnvelope>()
                .await
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or_else(|| status.to_string());
            warn!(%status, "Payment processor rejected request: {}", message);
            return Err(ServiceError::GatewayError(format!(
                "processor returned {}: {}",
                status, message
            )));
        }
        response
            .json::<StripeSession>()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("unreadable processor response: {}", e)))
    }
}

#[async_trait]
impl PaymentProcessor for StripeCheckoutProcessor {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", format!("checkout-{}", request.order_id))
            .form(&Self::form_fields(request))
            .send()
            .await
            .map_err(|e| {
                error!("Payment processor unreachable: {}", e);
                ServiceError::GatewayError(e.to_string())
            })?;

        let session = Self::read_session(response).await?;
        let pay_url = session.url.ok_or_else(|| {
            ServiceError::GatewayError("processor session has no payment url".to_string())
        })?;

        Ok(CheckoutSession {
            session_id: session.id,
            pay_url,
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<SessionStatus, ServiceError> {
        let response = self
            .client
            .get(format!("{}/v1/checkout/sessions/{}", self.base_url, session_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayError(e.to_string()))?;

        let session = Self::read_session(response).await?;
        let order_id = session
            .metadata
            .get("order_id")
            .or(session.client_reference_id.as_ref())
            .and_then(|s| Uuid::parse_str(s).ok());

        Ok(SessionStatus {
            session_id: session.id,
            order_id,
            payment_status: session.payment_status.unwrap_or_else(|| "unpaid".to_string()),
            status: session.status.unwrap_or_else(|| "open".to_string()),
        })
    }
}
