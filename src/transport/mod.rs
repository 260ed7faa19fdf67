//! Chat transport boundary.
//!
//! The core only depends on [`InboundEvent`] coming in and [`ChatTransport`]
//! going out.

pub mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Command,
    Text,
    ButtonPress,
}

/// One event from a user. In private chats the user id doubles as the chat id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub user_id: i64,
    pub kind: InboundKind,
    /// Command name without the slash, message text, or button action.
    pub payload: String,
    /// Message that carried the pressed button, for in-place edits.
    pub message_id: Option<i64>,
}

impl InboundEvent {
    pub fn command(user_id: i64, name: &str) -> Self {
        Self {
            user_id,
            kind: InboundKind::Command,
            payload: name.trim_start_matches('/').to_string(),
            message_id: None,
        }
    }

    pub fn text(user_id: i64, text: &str) -> Self {
        Self {
            user_id,
            kind: InboundKind::Text,
            payload: text.to_string(),
            message_id: None,
        }
    }

    pub fn button(user_id: i64, action: &str, message_id: Option<i64>) -> Self {
        Self {
            user_id,
            kind: InboundKind::ButtonPress,
            payload: action.to_string(),
            message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub action: String,
}

impl Button {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

/// Text plus optional rows of buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub buttons: Vec<Vec<Button>>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<Button>) -> Self {
        self.buttons.push(row);
        self
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Worth retrying: network trouble, rate limiting, server errors.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Retrying cannot help: blocked bot, unknown chat, bad request.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: i64, message: &OutboundMessage)
        -> Result<(), TransportError>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError>;
}

/// Consumer of inbound chat events, implemented by the chat router.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_event(&self, event: InboundEvent);
}

/// Stand-in transport for deployments without a bot token: messages are
/// logged instead of sent.
#[derive(Debug, Clone, Default)]
pub struct LoggingTransport;

#[async_trait]
impl ChatTransport for LoggingTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        info!(chat_id, text = %message.text, "Chat transport disabled; message logged");
        Ok(())
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        info!(chat_id, message_id, text = %message.text, "Chat transport disabled; edit logged");
        Ok(())
    }
}
