//! Chat Checkout
//!
//! Chat-driven cart, checkout dialogue, order ledger and payment
//! reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod checkout;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod money;
pub mod notifications;
pub mod services;
pub mod transport;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    checkout::CheckoutEngine,
    config::AppConfig,
    events::{Event, EventSender},
    handlers::chat::ChatRouter,
    notifications::{NotificationWorker, Notifier, RetryPolicy},
    services::{
        cart_service::CartService,
        catalog::{Catalog, DbCatalog},
        keyed_lock::KeyedLocks,
        order_ledger::OrderLedger,
        payment_gateway::PaymentGateway,
        payment_processor::PaymentProcessor,
    },
    transport::ChatTransport,
};

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub carts: CartService,
    pub ledger: OrderLedger,
    pub gateway: PaymentGateway,
    pub engine: CheckoutEngine,
    pub notifier: Notifier,
}

/// Everything wired together, with the background halves not yet started.
pub struct Services {
    pub state: AppState,
    pub catalog: Arc<dyn Catalog>,
    pub chat: ChatRouter,
    pub notification_worker: NotificationWorker,
    pub event_receiver: mpsc::Receiver<Event>,
}

impl Services {
    /// Wires the components around one database, payment processor and chat
    /// transport. The cart service and the engine share one per-user lock
    /// registry.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        processor: Arc<dyn PaymentProcessor>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let (event_tx, event_receiver) = mpsc::channel(config.event_channel_capacity.max(1));
        let event_sender = Arc::new(EventSender::new(event_tx));

        let (notifier, notification_worker) = Notifier::new(
            Arc::clone(&transport),
            config.merchant_chat_id,
            RetryPolicy {
                max_attempts: config.notification_max_attempts,
                base_backoff: config.notification_backoff(),
            },
            config.notification_queue_capacity,
        );

        let catalog: Arc<dyn Catalog> = Arc::new(DbCatalog::new(Arc::clone(&db)));
        let user_locks = KeyedLocks::new();

        let carts = CartService::new(
            Arc::clone(&db),
            Arc::clone(&catalog),
            user_locks.clone(),
            Arc::clone(&event_sender),
        );
        let ledger = OrderLedger::new(
            Arc::clone(&db),
            Arc::clone(&catalog),
            notifier.clone(),
            Arc::clone(&event_sender),
        );
        let gateway = PaymentGateway::new(
            ledger.clone(),
            processor,
            Arc::clone(&config),
            Arc::clone(&event_sender),
        );
        let engine = CheckoutEngine::new(
            user_locks,
            carts.clone(),
            ledger.clone(),
            gateway.clone(),
            notifier.clone(),
            event_sender,
            config.checkout_idle_timeout(),
        );
        let chat = ChatRouter::new(carts.clone(), Arc::clone(&catalog), engine.clone(), transport);

        Self {
            state: AppState {
                db,
                config,
                carts,
                ledger,
                gateway,
                engine,
                notifier,
            },
            catalog,
            chat,
            notification_worker,
            event_receiver,
        }
    }
}

/// HTTP routes: payment callbacks, payment redirects and health.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/payment/webhook",
            post(handlers::payment_webhooks::payment_webhook),
        )
        .route(
            "/payment/success",
            get(handlers::payment_redirects::payment_success),
        )
        .route(
            "/payment/cancel",
            get(handlers::payment_redirects::payment_cancel),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
