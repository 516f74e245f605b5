//! Shared harness booting the engine on an in-memory SQLite database with
//! migrations applied and an in-memory bus capturing published events.

use chrono::{DateTime, Utc};
use migrations::{Migrator, MigratorTrait};
use reserve_api::cache::StockCache;
use reserve_api::config::ReservationConfig;
use reserve_api::entities::{product, reservation, stock_level};
use reserve_api::events::outbox::{OutboxPublisher, PublisherConfig};
use reserve_api::message_queue::InMemoryMessageQueue;
use reserve_api::services::{LockStrategy, ReservationService, StockLedger};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, Set,
};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, QueryFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub struct TestEngine {
    pub db: Arc<DatabaseConnection>,
    pub service: ReservationService,
    pub queue: Arc<InMemoryMessageQueue>,
    pub cache: Arc<StockCache>,
    publisher_config: PublisherConfig,
    // Kept alive so publisher shutdown receivers stay valid.
    _shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(ReservationConfig::default()).await
    }

    pub async fn with_config(config: ReservationConfig) -> Self {
        // One pooled connection: every extra connection to sqlite::memory:
        // would be a fresh, unmigrated database.
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(600))
            .sqlx_logging(false);
        let db = Database::connect(options).await.expect("db connect");
        Migrator::up(&db, None).await.expect("migrations");
        let db = Arc::new(db);

        let queue = Arc::new(InMemoryMessageQueue::new());
        let cache = Arc::new(StockCache::new(Duration::from_secs(5)));
        let ledger = StockLedger::new(
            LockStrategy::Optimistic {
                max_retries: config.ledger_retry_max,
            },
            cache.clone(),
        );
        let service = ReservationService::new(db.clone(), ledger, config.clone());

        let publisher_config = PublisherConfig {
            batch_size: config.publish_batch_size,
            backoff_base_ms: config.publish_backoff_base_ms,
            backoff_cap_ms: config.publish_backoff_cap_ms,
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            db,
            service,
            queue,
            cache,
            publisher_config,
            _shutdown_tx: shutdown_tx,
            shutdown_rx,
        }
    }

    /// A publisher over this engine's database and queue. Construct as many
    /// as the test needs; each models one publisher process.
    pub fn publisher(&self) -> OutboxPublisher {
        OutboxPublisher::new(
            self.db.clone(),
            self.queue.clone(),
            self.publisher_config.clone(),
            self.shutdown_rx.clone(),
        )
    }

    pub async fn seed_product(&self, id: i64, price: Decimal, is_active: bool) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(id),
            name: Set(format!("Product {id}")),
            sku: Set(format!("SKU-{id:04}")),
            price: Set(price),
            is_active: Set(is_active),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_stock(&self, product_id: i64, on_hand: i32) {
        self.service
            .set_on_hand(product_id, on_hand)
            .await
            .expect("seed stock");
    }

    pub async fn stock(&self, product_id: i64) -> stock_level::Model {
        stock_level::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("stock query")
            .expect("stock row")
    }

    pub async fn reservation(&self, id: Uuid) -> reservation::Model {
        reservation::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("reservation query")
            .expect("reservation row")
    }

    /// Rewrites a reservation's deadline, simulating the passage of time.
    pub async fn force_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) {
        reservation::Entity::update_many()
            .filter(reservation::Column::Id.eq(id))
            .col_expr(reservation::Column::ExpiresAt, Expr::value(expires_at))
            .exec(&*self.db)
            .await
            .expect("force expiry");
    }

    /// Makes every pending outbox row immediately claimable, collapsing
    /// whatever backoff or visibility delay it carries.
    pub async fn make_outbox_due(&self) {
        use reserve_api::entities::outbox_event;
        outbox_event::Entity::update_many()
            .filter(outbox_event::Column::PublishedAt.is_null())
            .col_expr(
                outbox_event::Column::AvailableAt,
                Expr::value(Utc::now() - chrono::Duration::seconds(1)),
            )
            .exec(&*self.db)
            .await
            .expect("make outbox due");
    }

    pub async fn unpublished_outbox_rows(&self) -> Vec<reserve_api::entities::outbox_event::Model> {
        use reserve_api::entities::outbox_event;
        outbox_event::Entity::find()
            .filter(outbox_event::Column::PublishedAt.is_null())
            .all(&*self.db)
            .await
            .expect("outbox query")
    }
}
