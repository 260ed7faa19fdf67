use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://chat_checkout.db?mode=rwc";
const DEFAULT_PAYMENT_API_BASE: &str = "https://api.stripe.com";

/// Which path is allowed to resolve a pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    /// Authenticated processor callbacks only.
    Push,
    /// Reconciliation poller and redirect-triggered pulls only.
    Poll,
    /// Either path; resolution idempotency arbitrates.
    Both,
}

impl ResolutionMode {
    pub fn accepts_push(self) -> bool {
        matches!(self, Self::Push | Self::Both)
    }

    pub fn accepts_poll(self) -> bool {
        matches!(self, Self::Poll | Self::Both)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port for payment callbacks and redirects
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Public base URL used to build payment success/cancel targets
    pub public_base_url: String,

    /// Chat bot token; the chat transport is disabled when absent
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Chat id of the merchant channel receiving paid-order summaries
    #[serde(default)]
    pub merchant_chat_id: Option<i64>,

    /// Idle window after which an unfinished checkout dialogue is cancelled
    #[serde(default = "default_checkout_idle_timeout_secs")]
    #[validate(range(min = 1))]
    pub checkout_idle_timeout_secs: u64,

    /// Payment processor API base URL
    #[serde(default = "default_payment_api_base")]
    pub payment_api_base: String,

    /// Payment processor secret API key
    #[serde(default)]
    pub payment_secret_key: Option<String>,

    /// Webhook secret for verifying payment processor callbacks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Accept callbacks without a signature when no webhook secret is configured
    #[serde(default)]
    pub payment_allow_unsigned_callbacks: bool,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Currency code sent to the payment processor
    #[serde(default = "default_currency")]
    pub payment_currency: String,

    /// Which resolution path is authoritative: "push", "poll" or "both"
    #[serde(default = "default_resolution_mode")]
    #[validate(custom = "validate_resolution_mode")]
    pub payment_resolution_mode: String,

    /// Reconciliation poller interval (seconds)
    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(min = 1))]
    pub payment_poll_interval_secs: u64,

    /// Minimum age of a pending order before the poller looks at it (seconds)
    #[serde(default = "default_poll_min_age_secs")]
    pub payment_poll_min_age_secs: u64,

    /// Notification delivery attempts before giving up
    #[serde(default = "default_notification_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub notification_max_attempts: u32,

    /// Base backoff between notification attempts (milliseconds)
    #[serde(default = "default_notification_backoff_ms")]
    pub notification_backoff_ms: u64,

    /// Capacity of the notification queue
    #[serde(default = "default_queue_capacity")]
    #[validate(custom = "validate_channel_capacity")]
    pub notification_queue_capacity: usize,

    /// Event channel capacity for async event processing
    #[serde(default = "default_queue_capacity")]
    #[validate(custom = "validate_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, public_base_url: String, environment: String) -> Self {
        Self {
            database_url,
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: default_true_bool(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            public_base_url,
            bot_token: None,
            merchant_chat_id: None,
            checkout_idle_timeout_secs: default_checkout_idle_timeout_secs(),
            payment_api_base: default_payment_api_base(),
            payment_secret_key: None,
            payment_webhook_secret: None,
            payment_allow_unsigned_callbacks: false,
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            payment_currency: default_currency(),
            payment_resolution_mode: default_resolution_mode(),
            payment_poll_interval_secs: default_poll_interval_secs(),
            payment_poll_min_age_secs: default_poll_min_age_secs(),
            notification_max_attempts: default_notification_max_attempts(),
            notification_backoff_ms: default_notification_backoff_ms(),
            notification_queue_capacity: default_queue_capacity(),
            event_channel_capacity: default_queue_capacity(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn resolution_mode(&self) -> ResolutionMode {
        match self.payment_resolution_mode.to_ascii_lowercase().as_str() {
            "push" => ResolutionMode::Push,
            "poll" => ResolutionMode::Poll,
            _ => ResolutionMode::Both,
        }
    }

    pub fn checkout_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_idle_timeout_secs)
    }

    pub fn payment_poll_interval(&self) -> Duration {
        Duration::from_secs(self.payment_poll_interval_secs)
    }

    pub fn payment_poll_min_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.payment_poll_min_age_secs as i64)
    }

    pub fn notification_backoff(&self) -> Duration {
        Duration::from_millis(self.notification_backoff_ms)
    }

    /// Success target handed to the payment processor. The processor substitutes
    /// its own session id for the `{CHECKOUT_SESSION_ID}` placeholder.
    pub fn payment_success_url(&self, order_id: uuid::Uuid) -> String {
        format!(
            "{}/payment/success?session_id={{CHECKOUT_SESSION_ID}}&order_id={}",
            self.public_base_url.trim_end_matches('/'),
            order_id
        )
    }

    pub fn payment_cancel_url(&self, order_id: uuid::Uuid) -> String {
        format!(
            "{}/payment/cancel?order_id={}",
            self.public_base_url.trim_end_matches('/'),
            order_id
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        match url::Url::parse(&self.public_base_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => {
                let mut err = ValidationError::new("invalid_public_base_url");
                err.message = Some("public_base_url must be an absolute http(s) URL".into());
                errors.add("public_base_url", err);
            }
        }

        if self.is_production() && self.payment_allow_unsigned_callbacks {
            let mut err = ValidationError::new("unsigned_callbacks_in_production");
            err.message =
                Some("Unsigned payment callbacks must not be accepted in production".into());
            errors.add("payment_allow_unsigned_callbacks", err);
        }

        if self.resolution_mode().accepts_push()
            && self.payment_webhook_secret.is_none()
            && !self.payment_allow_unsigned_callbacks
            && self.is_production()
        {
            let mut err = ValidationError::new("webhook_secret_required");
            err.message = Some(
                "Set APP__PAYMENT_WEBHOOK_SECRET or switch APP__PAYMENT_RESOLUTION_MODE to poll"
                    .into(),
            );
            errors.add("payment_webhook_secret", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true_bool() -> bool {
    true
}

fn default_db_max_connections() -> u32 {
    8
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_checkout_idle_timeout_secs() -> u64 {
    600
}

fn default_payment_api_base() -> String {
    DEFAULT_PAYMENT_API_BASE.to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_resolution_mode() -> String {
    "both".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_poll_min_age_secs() -> u64 {
    30
}

fn default_notification_max_attempts() -> u32 {
    3
}

fn default_notification_backoff_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    1024
}

fn validate_resolution_mode(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "push" | "poll" | "both" => Ok(()),
        _ => {
            let mut err = ValidationError::new("payment_resolution_mode");
            err.message = Some("Must be one of: push, poll, both".into());
            Err(err)
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("channel_capacity");
        err.message = Some("channel capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("chat_checkout={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("public_base_url", "http://localhost:8080")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
