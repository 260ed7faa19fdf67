//! Notifier: queued, retrying delivery of chat messages.
//!
//! `notify` and `notify_merchant` only enqueue and never fail or wait, so an
//! outage of the chat transport can't hold up the order transition that
//! triggered the message. A background [`NotificationWorker`] drains the queue
//! and retries transient failures with exponential backoff. Messages to one
//! chat are delivered in the order they were queued.

use crate::transport::{ChatTransport, OutboundMessage};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    User(i64),
    Merchant(i64),
}

impl Recipient {
    fn chat_id(self) -> i64 {
        match self {
            Recipient::User(id) | Recipient::Merchant(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: Recipient,
    pub message: OutboundMessage,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): base, 2×base, 4×base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    merchant_chat_id: Option<i64>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        merchant_chat_id: Option<i64>,
        policy: RetryPolicy,
        capacity: usize,
    ) -> (Self, NotificationWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                merchant_chat_id,
            },
            NotificationWorker {
                rx,
                transport,
                policy,
            },
        )
    }

    /// Queues a message for a user.
    pub fn notify(&self, user_id: i64, message: OutboundMessage) {
        self.enqueue(Recipient::User(user_id), message);
    }

    /// Queues a message for the merchant channel, if one is configured.
    pub fn notify_merchant(&self, message: OutboundMessage) {
        match self.merchant_chat_id {
            Some(chat_id) => self.enqueue(Recipient::Merchant(chat_id), message),
            None => debug!("No merchant channel configured; dropping merchant notification"),
        }
    }

    fn enqueue(&self, recipient: Recipient, message: OutboundMessage) {
        let notification = Notification {
            id: Uuid::new_v4(),
            recipient,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.tx.try_send(notification) {
            error!(?recipient, "Notification queue rejected message: {}", e);
        }
    }
}

/// Consumer side; run it on its own task.
pub struct NotificationWorker {
    rx: mpsc::Receiver<Notification>,
    transport: Arc<dyn ChatTransport>,
    policy: RetryPolicy,
}

impl NotificationWorker {
    /// Drains the queue until every `Notifier` is dropped and the backlog is
    /// delivered. Each chat has at most one delivery in flight; later messages
    /// for it wait in its lane, so a slow recipient only delays itself.
    pub async fn run(mut self) {
        info!("Starting notification worker");
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut lanes: HashMap<i64, VecDeque<Notification>> = HashMap::new();
        let mut open = true;

        loop {
            if !open && lanes.is_empty() {
                break;
            }
            tokio::select! {
                received = self.rx.recv(), if open => match received {
                    Some(notification) => {
                        let chat_id = notification.recipient.chat_id();
                        match lanes.get_mut(&chat_id) {
                            Some(waiting) => waiting.push_back(notification),
                            None => {
                                lanes.insert(chat_id, VecDeque::new());
                                self.spawn_delivery(notification, &done_tx);
                            }
                        }
                    }
                    None => open = false,
                },
                Some(chat_id) = done_rx.recv() => {
                    let next = lanes.get_mut(&chat_id).and_then(VecDeque::pop_front);
                    match next {
                        Some(notification) => self.spawn_delivery(notification, &done_tx),
                        None => {
                            lanes.remove(&chat_id);
                        }
                    }
                }
            }
        }
        info!("Notification worker stopped");
    }

    fn spawn_delivery(&self, notification: Notification, done: &mpsc::UnboundedSender<i64>) {
        let transport = Arc::clone(&self.transport);
        let policy = self.policy;
        let lane = LaneRelease {
            chat_id: notification.recipient.chat_id(),
            done: done.clone(),
        };
        tokio::spawn(async move {
            let _lane = lane;
            deliver(transport.as_ref(), &notification, policy).await;
        });
    }
}

/// Frees the chat's lane when its delivery task ends, even by panic or abort.
struct LaneRelease {
    chat_id: i64,
    done: mpsc::UnboundedSender<i64>,
}

impl Drop for LaneRelease {
    fn drop(&mut self) {
        // The worker only goes away once every lane has been released.
        let _ = self.done.send(self.chat_id);
    }
}

/// Delivers one notification with bounded retry. Returns whether it got through.
#[instrument(skip(transport, notification), fields(notification_id = %notification.id, recipient = ?notification.recipient))]
pub async fn deliver(
    transport: &dyn ChatTransport,
    notification: &Notification,
    policy: RetryPolicy,
) -> bool {
    let chat_id = notification.recipient.chat_id();
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match transport.send_text(chat_id, &notification.message).await {
            Ok(()) => {
                debug!(attempt, "Notification delivered");
                return true;
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    "Notification delivery failed: {} (attempt {}/{})",
                    e, attempt, max_attempts
                );
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(e) => {
                error!(
                    "Notification delivery abandoned after {} attempt(s): {}",
                    attempt, e
                );
                return false;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` sends with the given error kind.
    struct FlakyTransport {
        failures: u32,
        permanent: bool,
        attempts: AtomicU32,
        delivered: Mutex<Vec<(i64, String)>>,
    }

    impl FlakyTransport {
        fn new(failures: u32, permanent: bool) -> Self {
            Self {
                failures,
                permanent,
                attempts: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for FlakyTransport {
        async fn send_text(
            &self,
            chat_id: i64,
            message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(if self.permanent {
                    TransportError::Permanent("blocked".into())
                } else {
                    TransportError::Transient("timeout".into())
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((chat_id, message.text.clone()));
            Ok(())
        }

        async fn edit_message(
            &self,
            _chat_id: i64,
            _message_id: i64,
            _message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn notification(text: &str) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            recipient: Recipient::User(7),
            message: OutboundMessage::text(text),
            created_at: Utc::now(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = FlakyTransport::new(2, false);
        assert!(deliver(&transport, &notification("hi"), fast_policy(3)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let transport = FlakyTransport::new(10, false);
        assert!(!deliver(&transport, &notification("hi"), fast_policy(3)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let transport = FlakyTransport::new(1, true);
        assert!(!deliver(&transport, &notification("hi"), fast_policy(3)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notify_is_non_blocking_and_worker_delivers() {
        let transport = Arc::new(FlakyTransport::new(0, false));
        let (notifier, worker) = Notifier::new(transport.clone(), Some(99), fast_policy(3), 8);
        tokio::spawn(worker.run());

        notifier.notify(7, OutboundMessage::text("paid"));
        notifier.notify_merchant(OutboundMessage::text("new order"));

        for _ in 0..100 {
            if transport.delivered.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut delivered = transport.delivered.lock().unwrap().clone();
        delivered.sort();
        assert_eq!(
            delivered,
            vec![(7, "paid".to_string()), (99, "new order".to_string())]
        );
    }

    #[tokio::test]
    async fn full_queue_drops_without_failing_caller() {
        let transport = Arc::new(FlakyTransport::new(0, false));
        let (notifier, _worker) = Notifier::new(transport, None, fast_policy(1), 1);
        notifier.notify(1, OutboundMessage::text("a"));
        notifier.notify(1, OutboundMessage::text("b"));
        notifier.notify_merchant(OutboundMessage::text("ignored"));
    }

    /// Fails the first send to `flaky_chat` transiently; records deliveries.
    struct SequencedTransport {
        flaky_chat: i64,
        failed_once: AtomicBool,
        delivered: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatTransport for SequencedTransport {
        async fn send_text(
            &self,
            chat_id: i64,
            message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            if chat_id == self.flaky_chat && !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(TransportError::Transient("timeout".into()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((chat_id, message.text.clone()));
            Ok(())
        }

        async fn edit_message(
            &self,
            _chat_id: i64,
            _message_id: i64,
            _message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn retried_message_keeps_its_place_in_the_chat() {
        let transport = Arc::new(SequencedTransport {
            flaky_chat: 7,
            failed_once: AtomicBool::new(false),
            delivered: Mutex::new(Vec::new()),
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
        };
        let (notifier, worker) = Notifier::new(transport.clone(), None, policy, 8);
        let worker = tokio::spawn(worker.run());

        notifier.notify(7, OutboundMessage::text("first"));
        notifier.notify(7, OutboundMessage::text("second"));
        notifier.notify(8, OutboundMessage::text("other"));
        notifier.notify(7, OutboundMessage::text("third"));
        drop(notifier);

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker drains its backlog and stops")
            .unwrap();

        let delivered = transport.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 4);
        // Chat 8 is not held up by chat 7's retry.
        assert_eq!(delivered[0], (8, "other".to_string()));
        let chat_seven: Vec<_> = delivered
            .iter()
            .filter(|(chat_id, _)| *chat_id == 7)
            .map(|(_, text)| text.as_str())
            .collect();
        assert_eq!(chat_seven, vec!["first", "second", "third"]);
    }
}
