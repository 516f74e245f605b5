use crate::config::AppConfig;
use crate::errors::ServiceError;
use migrations::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Alias kept so call sites read as "pool" even though sea-orm hides the
/// underlying sqlx pool behind `DatabaseConnection`.
pub type DbPool = DatabaseConnection;

/// Connection settings decoupled from the full application config.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            url: config.database_url.clone(),
            max_connections: config.db_max_connections,
            min_connections: config.db_min_connections,
            connect_timeout: Duration::from_secs(config.db_connect_timeout_secs),
            acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool with the given URL and default settings.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };
    establish_connection_with_config(&config).await
}

/// Establishes a connection pool, retrying transient connect failures with
/// exponential backoff before giving up.
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(false);

    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(200);
    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                info!(
                    max_connections = config.max_connections,
                    "Database connection established"
                );
                return Ok(conn);
            }
            Err(err) if attempt < 3 && is_retryable_connect_error(&err) => {
                attempt += 1;
                warn!(
                    error = %err,
                    attempt,
                    "Database connection failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(ServiceError::DatabaseError(err)),
        }
    }
}

fn is_retryable_connect_error(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => true,
        DbErr::Query(runtime_err) => {
            let msg = runtime_err.to_string().to_lowercase();
            msg.contains("connection") || msg.contains("timeout") || msg.contains("broken pipe")
        }
        _ => false,
    }
}

/// Applies all pending migrations.
pub async fn run_migrations(db: &DatabaseConnection) -> Result<(), ServiceError> {
    info!("Running database migrations");
    Migrator::up(db, None)
        .await
        .map_err(ServiceError::DatabaseError)?;
    info!("Migrations complete");
    Ok(())
}
