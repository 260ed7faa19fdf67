use super::state::{
    question, CancelReason, CheckoutInput, CheckoutState, Dialogue, Effect, Termination,
};
use crate::{
    entities::order::OrderStatus,
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::Notifier,
    services::{
        cart_service::{CartService, CartSnapshot},
        keyed_lock::KeyedLocks,
        order_ledger::{short_ref, OrderDetails, OrderLedger},
        payment_gateway::PaymentGateway,
    },
    transport::{Button, OutboundMessage},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const ACTION_CONFIRM: &str = "confirm";
pub const ACTION_CANCEL: &str = "cancel";

/// In-memory checkout dialogue for one user.
#[derive(Debug)]
struct CheckoutSession {
    id: Uuid,
    /// Cart the dialogue was opened against. Informational; confirmation
    /// always orders from the user's current active cart.
    cart_id: Uuid,
    dialogue: Dialogue,
    /// Bumped on every accepted input; a timer only fires for the value it was armed with.
    seq: u64,
    /// PENDING order awaiting a payment session after a gateway failure.
    pending_order: Option<Uuid>,
    timer: Option<AbortHandle>,
    started_at: DateTime<Utc>,
}

/// Observable view of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub cart_id: Uuid,
    pub state: CheckoutState,
    pub seq: u64,
    pub pending_order: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

struct EngineInner {
    sessions: AsyncMutex<HashMap<i64, CheckoutSession>>,
    user_locks: KeyedLocks<i64>,
    carts: CartService,
    ledger: OrderLedger,
    gateway: PaymentGateway,
    notifier: Notifier,
    event_sender: Arc<EventSender>,
    idle_timeout: Duration,
}

/// Conversation Engine.
///
/// Events for one user are processed one at a time under that user's entry in
/// the shared [`KeyedLocks`]; the lock is released between events. Events for
/// different users run in parallel.
#[derive(Clone)]
pub struct CheckoutEngine {
    inner: Arc<EngineInner>,
}

impl CheckoutEngine {
    pub fn new(
        user_locks: KeyedLocks<i64>,
        carts: CartService,
        ledger: OrderLedger,
        gateway: PaymentGateway,
        notifier: Notifier,
        event_sender: Arc<EventSender>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                sessions: AsyncMutex::new(HashMap::new()),
                user_locks,
                carts,
                ledger,
                gateway,
                notifier,
                event_sender,
                idle_timeout,
            }),
        }
    }

    /// Checkout entry point. Replaces any session the user already has.
    #[instrument(skip(self))]
    pub async fn start(&self, user_id: i64) -> Result<Vec<OutboundMessage>, ServiceError> {
        let _guard = self.inner.user_locks.lock(user_id).await;

        let previous = self.inner.sessions.lock().await.remove(&user_id);
        if let Some(previous) = previous {
            info!(user_id, session_id = %previous.id, "Checkout re-entered; replacing session");
            self.discard(user_id, previous, "superseded").await;
        }

        let snapshot = self.inner.carts.get_active_cart(user_id).await?;
        let empty = snapshot.as_ref().map_or(true, CartSnapshot::is_empty);
        let (dialogue, effect) = Dialogue::enter(empty);

        let snapshot = match snapshot {
            Some(snapshot) if !dialogue.state.is_terminated() => snapshot,
            _ => {
                debug!(user_id, "Checkout entry with empty cart");
                return Ok(render(effect));
            }
        };

        let mut session = CheckoutSession {
            id: Uuid::new_v4(),
            cart_id: snapshot.cart.id,
            dialogue,
            seq: 0,
            pending_order: None,
            timer: None,
            started_at: Utc::now(),
        };
        self.arm_timer(user_id, &mut session);

        self.inner
            .event_sender
            .send_or_log(Event::CheckoutStarted {
                user_id,
                session_id: session.id,
            })
            .await;
        info!(user_id, session_id = %session.id, "Checkout started");

        self.inner.sessions.lock().await.insert(user_id, session);
        Ok(render(effect))
    }

    /// Feeds one input to the user's dialogue. Returns `None` when the user
    /// has no live checkout session.
    #[instrument(skip(self))]
    pub async fn handle(
        &self,
        user_id: i64,
        input: CheckoutInput,
    ) -> Result<Option<Vec<OutboundMessage>>, ServiceError> {
        let _guard = self.inner.user_locks.lock(user_id).await;
        Ok(self.process(user_id, input, None).await)
    }

    pub async fn session(&self, user_id: i64) -> Option<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&user_id)
            .map(|s| SessionInfo {
                session_id: s.id,
                cart_id: s.cart_id,
                state: s.dialogue.state,
                seq: s.seq,
                pending_order: s.pending_order,
                started_at: s.started_at,
            })
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Runs one input against the session. `armed` is set by the idle timer
    /// and names the session and sequence number it was armed for.
    async fn process(
        &self,
        user_id: i64,
        input: CheckoutInput,
        armed: Option<(Uuid, u64)>,
    ) -> Option<Vec<OutboundMessage>> {
        let mut session = self.inner.sessions.lock().await.remove(&user_id)?;

        if let Some((session_id, seq)) = armed {
            if session.id != session_id || session.seq != seq {
                debug!(user_id, "Stale idle timer ignored");
                self.inner.sessions.lock().await.insert(user_id, session);
                return None;
            }
            // This is the timer's own task; dropping the handle must not abort it.
            session.timer = None;
        } else if let Some(timer) = session.timer.take() {
            timer.abort();
        }

        let (dialogue, effect) = session.dialogue.clone().apply(input);
        session.dialogue = dialogue;
        session.seq += 1;

        let messages = match effect {
            Effect::CreateOrder => self.confirm(user_id, &mut session).await,
            Effect::Cancelled(reason) => {
                self.cancel_pending_order(&session).await;
                self.inner
                    .event_sender
                    .send_or_log(Event::CheckoutCancelled {
                        user_id,
                        session_id: session.id,
                        reason: reason.as_str().to_string(),
                    })
                    .await;
                info!(user_id, session_id = %session.id, reason = reason.as_str(), "Checkout cancelled");
                render(effect)
            }
            Effect::RenderSummary => {
                let total = self
                    .inner
                    .carts
                    .get_active_cart(user_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|c| c.total().to_string());
                vec![summary_message(&session.dialogue, total.as_deref())]
            }
            other => render(other),
        };

        if session.dialogue.state.is_terminated() {
            debug!(user_id, session_id = %session.id, state = ?session.dialogue.state, "Session closed");
        } else {
            self.arm_timer(user_id, &mut session);
            self.inner.sessions.lock().await.insert(user_id, session);
        }

        Some(messages)
    }

    /// Confirmation: create the order (once) and open a payment session for it.
    async fn confirm(&self, user_id: i64, session: &mut CheckoutSession) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();

        let order_id = match session.pending_order {
            Some(order_id) => order_id,
            None => match self.create_order(user_id, session, &mut messages).await {
                Some(order_id) => order_id,
                None => return messages,
            },
        };

        let details = match self.inner.ledger.get_order(order_id).await {
            Ok(details) => details,
            Err(e) => {
                error!(%order_id, "Pending order could not be loaded: {}", e);
                messages.push(retry_message(
                    "Something went wrong while preparing your payment.",
                ));
                return messages;
            }
        };

        if details.order.status != OrderStatus::Pending {
            // Resolved elsewhere while the user was retrying.
            messages.push(OutboundMessage::text(format!(
                "Order #{} is already {}.",
                short_ref(order_id),
                details.order.status
            )));
            session.pending_order = None;
            session.dialogue = session.dialogue.clone().confirmed();
            return messages;
        }

        match self.inner.gateway.create_session(&details).await {
            Ok(handle) => {
                session.pending_order = None;
                session.dialogue = session.dialogue.clone().confirmed();
                info!(user_id, %order_id, "Checkout confirmed");
                messages.push(pay_message(&details, &handle.pay_url));
            }
            Err(e) => {
                warn!(user_id, %order_id, "Payment session could not be created: {}", e);
                session.pending_order = Some(order_id);
                messages.push(retry_message(&format!(
                    "Order #{} is saved, but the payment could not be started. Your details are kept.",
                    short_ref(order_id)
                )));
            }
        }

        messages
    }

    /// Creates the order from the current active cart. Returns its id, or
    /// `None` after pushing the message explaining why not.
    async fn create_order(
        &self,
        user_id: i64,
        session: &mut CheckoutSession,
        messages: &mut Vec<OutboundMessage>,
    ) -> Option<Uuid> {
        let Some(fields) = session.dialogue.fields.to_customer_fields() else {
            error!(user_id, "Confirmation reached with incomplete fields");
            messages.push(OutboundMessage::text(
                "Some details are missing. Please start checkout again with /checkout.",
            ));
            session.dialogue.state = CheckoutState::Terminated(Termination::Cancelled(
                CancelReason::Aborted,
            ));
            return None;
        };

        let snapshot = match self.inner.carts.get_active_cart(user_id).await {
            Ok(Some(snapshot)) if !snapshot.is_empty() => snapshot,
            Ok(_) => {
                messages.push(OutboundMessage::text(
                    "Your cart is empty, so no order was created.",
                ));
                session.dialogue.state = CheckoutState::Terminated(Termination::EmptyCart);
                return None;
            }
            Err(e) => {
                error!(user_id, "Cart could not be loaded: {}", e);
                messages.push(retry_message("Something went wrong while reading your cart."));
                return None;
            }
        };
        if snapshot.cart.id != session.cart_id {
            debug!(user_id, "Cart replaced during checkout; ordering from the current cart");
        }

        match self.inner.ledger.create_order(user_id, &fields, &snapshot).await {
            Ok(created) => {
                session.pending_order = Some(created.details.order.id);
                if !created.dropped_products.is_empty() {
                    messages.push(OutboundMessage::text(format!(
                        "Some items are no longer available and were removed: {}. New total: {}",
                        created.dropped_products.join(", "),
                        created.details.total()
                    )));
                }
                Some(created.details.order.id)
            }
            Err(ServiceError::EmptyCart) => {
                messages.push(OutboundMessage::text(
                    "None of the items in your cart are available any more, so no order was created.",
                ));
                session.dialogue.state = CheckoutState::Terminated(Termination::EmptyCart);
                None
            }
            Err(ServiceError::InsufficientStock {
                product_id,
                requested,
                available,
            }) => {
                let name = snapshot
                    .item(product_id)
                    .map(|i| i.product_name.clone())
                    .unwrap_or_else(|| "an item".to_string());
                messages.push(
                    OutboundMessage::text(format!(
                        "Only {} of {} in stock, but your cart has {}. Adjust your cart, then confirm again.",
                        available, name, requested
                    ))
                    .with_row(confirm_row("Confirm")),
                );
                None
            }
            Err(ServiceError::Conflict(_)) => {
                messages.push(OutboundMessage::text(
                    "This cart has already been checked out.",
                ));
                session.dialogue.state = CheckoutState::Terminated(Termination::EmptyCart);
                None
            }
            Err(e) => {
                error!(user_id, "Order creation failed: {}", e);
                messages.push(retry_message("Your order could not be created."));
                None
            }
        }
    }

    /// Cancels the unpaid order of a session that ends without a payment
    /// session, putting its lines back into the user's active cart.
    async fn cancel_pending_order(&self, session: &CheckoutSession) {
        let Some(order_id) = session.pending_order else {
            return;
        };
        if let Err(e) = self.inner.ledger.abandon_order(order_id).await {
            warn!(%order_id, "Pending order could not be cancelled: {}", e);
        }
    }

    async fn discard(&self, user_id: i64, mut session: CheckoutSession, reason: &str) {
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        self.cancel_pending_order(&session).await;
        self.inner
            .event_sender
            .send_or_log(Event::CheckoutCancelled {
                user_id,
                session_id: session.id,
                reason: reason.to_string(),
            })
            .await;
    }

    fn arm_timer(&self, user_id: i64, session: &mut CheckoutSession) {
        let engine = self.clone();
        let armed = (session.id, session.seq);
        let idle = self.inner.idle_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            engine.fire_timeout(user_id, armed).await;
        });
        session.timer = Some(handle.abort_handle());
    }

    async fn fire_timeout(&self, user_id: i64, armed: (Uuid, u64)) {
        let messages = {
            let _guard = self.inner.user_locks.lock(user_id).await;
            self.process(user_id, CheckoutInput::Timeout, Some(armed)).await
        };
        if let Some(messages) = messages {
            info!(user_id, session_id = %armed.0, "Checkout timed out");
            for message in messages {
                self.inner.notifier.notify(user_id, message);
            }
        }
    }
}

fn confirm_row(label: &str) -> Vec<Button> {
    vec![
        Button::new(label, ACTION_CONFIRM),
        Button::new("Cancel", ACTION_CANCEL),
    ]
}

fn retry_message(reason: &str) -> OutboundMessage {
    OutboundMessage::text(format!("{} Press Retry to try again.", reason))
        .with_row(confirm_row("Retry"))
}

fn render(effect: Effect) -> Vec<OutboundMessage> {
    match effect {
        Effect::Prompt(field) => vec![OutboundMessage::text(question(field))],
        Effect::Reprompt(error) => vec![OutboundMessage::text(error.prompt)],
        Effect::Cancelled(CancelReason::IdleTimeout) => vec![OutboundMessage::text(
            "Checkout was cancelled after a period of inactivity. Your cart is still saved.",
        )],
        Effect::Cancelled(_) => vec![OutboundMessage::text(
            "Checkout cancelled. Your cart is still saved.",
        )],
        Effect::EmptyCart => vec![OutboundMessage::text(
            "Your cart is empty. Add products first.",
        )],
        Effect::RenderSummary | Effect::CreateOrder | Effect::Ignored => Vec::new(),
    }
}

fn summary_message(dialogue: &Dialogue, total: Option<&str>) -> OutboundMessage {
    let fields = &dialogue.fields;
    let mut text = format!(
        "Review your information\n\nName: {}\nPhone: {}\nAddress: {}\nEmail: {}\n",
        fields.name.as_deref().unwrap_or("-"),
        fields.phone.as_deref().unwrap_or("-"),
        fields.address.as_deref().unwrap_or("-"),
        fields.email.as_deref().unwrap_or("-"),
    );
    if let Some(total) = total {
        text.push_str(&format!("Cart total: {}\n", total));
    }
    text.push_str("\nIs this information correct?");
    OutboundMessage::text(text).with_row(confirm_row("Yes, proceed"))
}

fn pay_message(details: &OrderDetails, pay_url: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "Order #{} created. Total: {}. Use the link below to pay.",
        short_ref(details.order.id),
        details.total()
    ))
    .with_row(vec![Button::new("Pay now", pay_url)])
}
