use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event without ever failing the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping domain event: {}", e);
        }
    }
}

/// Observational domain events. Nothing depends on them for correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartItemAdded {
        user_id: i64,
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        user_id: i64,
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartDeactivated(Uuid),
    /// A cart given back to its user after its unpaid order was abandoned.
    CartRestored {
        user_id: i64,
        cart_id: Uuid,
    },

    // Checkout dialogue events
    CheckoutStarted {
        user_id: i64,
        session_id: Uuid,
    },
    CheckoutCancelled {
        user_id: i64,
        session_id: Uuid,
        reason: String,
    },

    // Order events
    OrderCreated {
        order_id: Uuid,
        user_id: i64,
        total: Decimal,
    },
    PaymentSessionCreated {
        order_id: Uuid,
        session_id: String,
    },
    OrderPaid(Uuid),
    OrderCancelled(Uuid),
    PaymentCallbackRejected {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Consumes domain events and records them in the log.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPaid(order_id) => info!(%order_id, "event: order paid"),
            Event::OrderCancelled(order_id) => info!(%order_id, "event: order cancelled"),
            Event::PaymentCallbackRejected { reason, .. } => {
                warn!(%reason, "event: payment callback rejected")
            }
            other => debug!(event = ?other, "event"),
        }
    }

    info!("Event processing loop stopped");
}
