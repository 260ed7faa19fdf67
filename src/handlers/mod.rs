pub mod chat;
pub mod health;
pub mod payment_redirects;
pub mod payment_webhooks;

pub use crate::AppState;
