#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use chat_checkout::{
    build_router,
    checkout::CheckoutInput,
    config::AppConfig,
    db,
    entities::product,
    errors::ServiceError,
    events,
    handlers::chat::ChatRouter,
    money,
    services::{
        catalog::DbCatalog,
        payment_processor::{CheckoutRequest, CheckoutSession, PaymentProcessor, SessionStatus},
    },
    transport::{ChatTransport, OutboundMessage, TransportError},
    webhooks::signature,
    AppState, Services,
};
use chrono::Utc;
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const MERCHANT_CHAT: i64 = -100_200;

/// Payment processor double. Sessions are kept in memory; failures can be
/// scheduled for the next `create_checkout` calls.
#[derive(Default)]
pub struct FakeProcessor {
    failures_left: AtomicUsize,
    counter: AtomicUsize,
    sessions: Mutex<HashMap<String, SessionStatus>>,
    requests: Mutex<Vec<CheckoutRequest>>,
}

impl FakeProcessor {
    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn set_status(&self, session_id: &str, payment_status: &str, status: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id).expect("unknown session");
        session.payment_status = payment_status.to_string();
        session.status = status.to_string();
    }

    pub fn requests(&self) -> Vec<CheckoutRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ServiceError::GatewayError("processor unavailable".into()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("cs_test_{}", n);
        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            SessionStatus {
                session_id: session_id.clone(),
                order_id: Some(request.order_id),
                payment_status: "unpaid".into(),
                status: "open".into(),
            },
        );
        self.requests.lock().unwrap().push(request.clone());
        Ok(CheckoutSession {
            pay_url: format!("https://pay.example/{}", session_id),
            session_id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<SessionStatus, ServiceError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ServiceError::GatewayError(format!("no such session {}", session_id)))
    }
}

/// Chat transport that records every delivered message.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(i64, OutboundMessage)>>,
}

impl RecordingTransport {
    pub fn messages_for(&self, chat_id: i64) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn count_containing(&self, chat_id: i64, needle: &str) -> usize {
        self.messages_for(chat_id)
            .iter()
            .filter(|m| m.text.contains(needle))
            .count()
    }

    /// Waits until a message containing `needle` reached `chat_id`.
    pub async fn wait_for(&self, chat_id: i64, needle: &str) -> OutboundMessage {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(m) = self
                    .messages_for(chat_id)
                    .into_iter()
                    .find(|m| m.text.contains(needle))
                {
                    return m;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match found {
            Ok(message) => message,
            Err(_) => panic!(
                "no message containing {:?} for chat {}; got {:?}",
                needle,
                chat_id,
                self.messages_for(chat_id)
            ),
        }
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((chat_id, message.clone()));
        Ok(())
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        _message_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((chat_id, message.clone()));
        Ok(())
    }
}

/// Fully wired service over an in-memory SQLite database.
pub struct TestApp {
    pub state: AppState,
    pub chat: ChatRouter,
    pub catalog: DbCatalog,
    pub processor: Arc<FakeProcessor>,
    pub transport: Arc<RecordingTransport>,
    router: Router,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "https://shop.example".to_string(),
        "test".to_string(),
    );
    cfg.merchant_chat_id = Some(MERCHANT_CHAT);
    cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
    cfg.notification_backoff_ms = 1;
    cfg
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let processor = Arc::new(FakeProcessor::default());
        let transport = Arc::new(RecordingTransport::default());

        let services = Services::build(
            Arc::clone(&db),
            Arc::new(cfg),
            processor.clone(),
            transport.clone(),
        );
        tokio::spawn(events::process_events(services.event_receiver));
        tokio::spawn(services.notification_worker.run());

        Self {
            router: build_router(services.state.clone()),
            state: services.state,
            chat: services.chat,
            catalog: DbCatalog::new(db),
            processor,
            transport,
        }
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        self.catalog
            .insert(product::Model {
                id: Uuid::new_v4(),
                name: name.to_string(),
                category: Some("general".to_string()),
                price_minor: money::to_minor(price).expect("whole cents"),
                stock,
                active: true,
                image_url: None,
                created_at: Utc::now(),
            })
            .await
            .expect("failed to seed product")
    }

    pub async fn set_product_active(&self, product: &product::Model, active: bool) {
        let mut model: product::ActiveModel = product.clone().into();
        model.active = Set(active);
        model
            .update(&*self.state.db)
            .await
            .expect("failed to update product");
    }

    pub async fn set_product_stock(&self, product: &product::Model, stock: i32) {
        let mut model: product::ActiveModel = product.clone().into();
        model.stock = Set(stock);
        model
            .update(&*self.state.db)
            .await
            .expect("failed to update product");
    }

    /// Feeds one input to the engine and returns the texts it produced.
    pub async fn say(&self, user_id: i64, input: CheckoutInput) -> Vec<OutboundMessage> {
        self.state
            .engine
            .handle(user_id, input)
            .await
            .expect("engine error")
            .expect("no active checkout session")
    }

    pub async fn text(&self, user_id: i64, text: &str) -> Vec<OutboundMessage> {
        self.say(user_id, CheckoutInput::Text(text.to_string())).await
    }

    /// Starts checkout and answers every question up to the summary.
    pub async fn fill_details(&self, user_id: i64, email: Option<&str>) -> Vec<OutboundMessage> {
        self.state.engine.start(user_id).await.expect("start failed");
        self.text(user_id, "Ada Lovelace").await;
        self.text(user_id, "+1234567").await;
        self.text(user_id, "12 Analytical Row").await;
        match email {
            Some(email) => self.text(user_id, email).await,
            None => self.say(user_id, CheckoutInput::SkipEmail).await,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error")
    }

    pub async fn post_callback(&self, body: &Value, signed: bool) -> Response {
        let raw = serde_json::to_vec(body).unwrap();
        let mut builder = Request::post("/payment/webhook").header("content-type", "application/json");
        if signed {
            let header =
                signature::stripe_signature_header(WEBHOOK_SECRET, Utc::now().timestamp(), &raw);
            builder = builder.header(signature::STRIPE_SIGNATURE_HEADER, header);
        }
        self.request(builder.body(Body::from(raw)).unwrap()).await
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }
}

pub fn callback_event(event_type: &str, session_id: &str, order_id: Uuid, payment_status: &str) -> Value {
    serde_json::json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": {"object": {
            "id": session_id,
            "payment_status": payment_status,
            "status": "complete",
            "metadata": {"order_id": order_id.to_string()}
        }}
    })
}

pub async fn response_json(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("response body")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}
