//! Telegram Bot API transport.

use super::{ChatTransport, InboundEvent, InboundHandler, OutboundMessage, TransportError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Seconds the server holds a `getUpdates` request open.
const LONG_POLL_SECS: u64 = 25;

/// Telegram client implementing [`ChatTransport`] plus the update long-poll.
#[derive(Clone)]
pub struct TelegramTransport {
    client: reqwest::Client,
    /// `{api_base}/bot{token}`
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> Result<Self, TransportError> {
        Self::with_api_base(DEFAULT_API_BASE, bot_token)
    }

    pub fn with_api_base(api_base: &str, bot_token: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .build()
            .map_err(|e| TransportError::Permanent(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        })
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, method))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        let api: ApiResponse = match response.json().await {
            Ok(api) => api,
            Err(e) => return Err(classify(status.as_u16(), &e.to_string())),
        };

        if api.ok {
            return Ok(api.result.unwrap_or(Value::Null));
        }
        let code = api.error_code.unwrap_or(status.as_u16());
        let description = api.description.unwrap_or_default();
        Err(classify(code, &description))
    }

    /// Long-polls for updates after `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        let result = self
            .call(
                "getUpdates",
                &json!({
                    "offset": offset,
                    "timeout": LONG_POLL_SECS,
                    "allowed_updates": ["message", "callback_query"],
                }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| TransportError::Permanent(format!("unreadable updates: {}", e)))
    }

    pub async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        self.call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }))
            .await
            .map(|_| ())
    }

    /// Receives updates until the process exits, dispatching each event on its
    /// own task. Errors back off and the loop resumes.
    pub async fn run_polling(self, handler: Arc<dyn InboundHandler>) {
        info!("Starting Telegram long-poll loop");
        let mut offset = 0_i64;
        let mut backoff = Duration::from_secs(1);

        loop {
            let updates = match self.get_updates(offset).await {
                Ok(updates) => {
                    backoff = Duration::from_secs(1);
                    updates
                }
                Err(e) => {
                    warn!("getUpdates failed, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);

                if let Some(callback) = &update.callback_query {
                    if let Err(e) = self.answer_callback(&callback.id).await {
                        debug!("answerCallbackQuery failed: {}", e);
                    }
                }

                let Some(event) = to_inbound(&update) else {
                    debug!(update_id = update.update_id, "Skipping update without usable content");
                    continue;
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler.handle_event(event).await;
                });
            }
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    #[instrument(skip(self, message))]
    async fn send_text(
        &self,
        chat_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut body = json!({ "chat_id": chat_id, "text": message.text });
        if let Some(markup) = reply_markup(message) {
            body["reply_markup"] = markup;
        }
        self.call("sendMessage", &body).await.map(|_| ())
    }

    #[instrument(skip(self, message))]
    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": message.text,
        });
        if let Some(markup) = reply_markup(message) {
            body["reply_markup"] = markup;
        }
        match self.call("editMessageText", &body).await {
            Err(TransportError::Permanent(description))
                if description.contains("message is not modified") =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

/// Inline keyboard for the message's buttons. Actions that are links become
/// url buttons; everything else is sent back as callback data.
pub fn reply_markup(message: &OutboundMessage) -> Option<Value> {
    if message.buttons.is_empty() {
        return None;
    }
    let rows: Vec<Vec<Value>> = message
        .buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| {
                    if button.action.starts_with("http://") || button.action.starts_with("https://")
                    {
                        json!({ "text": button.label, "url": button.action })
                    } else {
                        json!({ "text": button.label, "callback_data": button.action })
                    }
                })
                .collect()
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

/// 429 and 5xx are worth retrying; other API errors are not.
fn classify(code: u16, description: &str) -> TransportError {
    if code == 429 || code >= 500 {
        TransportError::Transient(format!("{}: {}", code, description))
    } else {
        error!(code, "Telegram rejected request: {}", description);
        TransportError::Permanent(format!("{}: {}", code, description))
    }
}

/// Converts an update into an [`InboundEvent`]. The sender's id is the user id.
pub fn to_inbound(update: &Update) -> Option<InboundEvent> {
    if let Some(callback) = &update.callback_query {
        let data = callback.data.as_deref()?;
        return Some(InboundEvent::button(
            callback.from.id,
            data,
            callback.message.as_ref().map(|m| m.message_id),
        ));
    }

    let message = update.message.as_ref()?;
    let user_id = message.from.as_ref().map_or(message.chat.id, |u| u.id);
    let text = message.text.as_deref()?.trim();

    if let Some(command) = text.strip_prefix('/') {
        // "/shop@my_bot drinks" → "shop drinks"
        let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
        let name = name.split('@').next().unwrap_or(name);
        let payload = if rest.trim().is_empty() {
            name.to_string()
        } else {
            format!("{} {}", name, rest.trim())
        };
        return Some(InboundEvent::command(user_id, &payload));
    }
    Some(InboundEvent::text(user_id, text))
}
