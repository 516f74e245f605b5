use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Engine tunables. Every key has a production default so a bare environment
/// boots; deployments override via `config/<env>.toml` or `APP__RESERVATIONS__*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReservationConfig {
    /// How long a pending hold lives before it is reaped.
    #[serde(default = "default_ttl_minutes")]
    #[validate(range(min = 1))]
    pub ttl_minutes: i64,

    /// Cap on concurrently pending reservations per user.
    #[serde(default = "default_max_active_per_user")]
    #[validate(range(min = 1))]
    pub max_active_per_user: u64,

    /// Reaper cadence.
    #[serde(default = "default_reap_interval_seconds")]
    #[validate(range(min = 1))]
    pub reap_interval_seconds: u64,

    /// Rows per reap sweep.
    #[serde(default = "default_reap_batch_size")]
    #[validate(range(min = 1))]
    pub reap_batch_size: u64,

    /// Wall-clock budget for one reap sweep before it yields to the next tick.
    #[serde(default = "default_reap_time_budget_ms")]
    pub reap_time_budget_ms: u64,

    /// Outbox rows claimed per publisher pass.
    #[serde(default = "default_publish_batch_size")]
    #[validate(range(min = 1))]
    pub publish_batch_size: u64,

    /// Publisher retry backoff: min(cap, base * 2^attempts) plus jitter.
    #[serde(default = "default_publish_backoff_base_ms")]
    pub publish_backoff_base_ms: u64,

    #[serde(default = "default_publish_backoff_cap_ms")]
    pub publish_backoff_cap_ms: u64,

    /// How long a claimed outbox row stays invisible before a crashed
    /// publisher's claim lapses.
    #[serde(default = "default_publish_visibility_timeout_secs")]
    pub publish_visibility_timeout_secs: u64,

    /// Publisher poll interval between drain passes.
    #[serde(default = "default_publish_poll_interval_ms")]
    pub publish_poll_interval_ms: u64,

    /// Optimistic retry ceiling for ledger primitives.
    #[serde(default = "default_ledger_retry_max")]
    pub ledger_retry_max: u32,

    /// Locking discipline: "optimistic" or "pessimistic". One discipline per
    /// deployment; the two are never combined on the same path.
    #[serde(default = "default_ledger_strategy")]
    pub ledger_strategy: String,

    /// TTL of the advisory in-process stock cache.
    #[serde(default = "default_stock_cache_ttl_secs")]
    pub stock_cache_ttl_secs: u64,
}

fn default_ttl_minutes() -> i64 {
    15
}
fn default_max_active_per_user() -> u64 {
    5
}
fn default_reap_interval_seconds() -> u64 {
    60
}
fn default_reap_batch_size() -> u64 {
    500
}
fn default_reap_time_budget_ms() -> u64 {
    30_000
}
fn default_publish_batch_size() -> u64 {
    200
}
fn default_publish_backoff_base_ms() -> u64 {
    100
}
fn default_publish_backoff_cap_ms() -> u64 {
    60_000
}
fn default_publish_visibility_timeout_secs() -> u64 {
    30
}
fn default_publish_poll_interval_ms() -> u64 {
    500
}
fn default_ledger_retry_max() -> u32 {
    5
}
fn default_ledger_strategy() -> String {
    "optimistic".to_string()
}
fn default_stock_cache_ttl_secs() -> u64 {
    5
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            max_active_per_user: default_max_active_per_user(),
            reap_interval_seconds: default_reap_interval_seconds(),
            reap_batch_size: default_reap_batch_size(),
            reap_time_budget_ms: default_reap_time_budget_ms(),
            publish_batch_size: default_publish_batch_size(),
            publish_backoff_base_ms: default_publish_backoff_base_ms(),
            publish_backoff_cap_ms: default_publish_backoff_cap_ms(),
            publish_visibility_timeout_secs: default_publish_visibility_timeout_secs(),
            publish_poll_interval_ms: default_publish_poll_interval_ms(),
            ledger_retry_max: default_ledger_retry_max(),
            ledger_strategy: default_ledger_strategy(),
            stock_cache_ttl_secs: default_stock_cache_ttl_secs(),
        }
    }
}

impl ReservationConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds)
    }

    pub fn reap_time_budget(&self) -> Duration {
        Duration::from_millis(self.reap_time_budget_ms)
    }

    pub fn publish_poll_interval(&self) -> Duration {
        Duration::from_millis(self.publish_poll_interval_ms)
    }

    pub fn publish_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_visibility_timeout_secs)
    }

    pub fn stock_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stock_cache_ttl_secs)
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Engine tunables
    #[serde(default)]
    #[validate]
    pub reservations: ReservationConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_acquire_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Creates a configuration directly, bypassing file/env sources. Used by
    /// tests and embedded setups.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            reservations: ReservationConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Loads configuration from `config/{default,<env>}.toml` plus `APP__`
/// prefixed environment variables, then validates the result.
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

    let builder = Config::builder()
        .set_default("database_url", "sqlite://reserve.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    let config: AppConfig = builder.build()?.try_deserialize()?;

    config
        .validate()
        .map_err(|e| AppConfigError::Validation(e.to_string()))?;

    Ok(config)
}

/// Initializes the tracing subscriber. `RUST_LOG` wins over the configured
/// level when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("reserve_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::try_new(filter_directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
