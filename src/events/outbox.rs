use crate::entities::outbox_event::{self, Entity as OutboxEntity};
use crate::errors::ServiceError;
use crate::events::{ReservationEvent, RESERVATION_TOPIC};
use crate::message_queue::MessageQueue;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    FromQueryResult, NotSet, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

lazy_static! {
    static ref OUTBOX_PUBLISHED: IntCounter = IntCounter::new(
        "outbox_events_published_total",
        "Total number of outbox events delivered to the bus"
    )
    .expect("metric can be created");
    static ref OUTBOX_RETRIES: IntCounter = IntCounter::new(
        "outbox_publish_retries_total",
        "Total number of outbox publish attempts that failed and were rescheduled"
    )
    .expect("metric can be created");
}

/// Appends a domain event to the outbox. Must be called on the same
/// transaction as the state change the event describes; if the transaction
/// aborts, the event is never visible.
pub async fn enqueue(
    conn: &impl ConnectionTrait,
    event: &ReservationEvent,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let envelope = event.envelope(now)?;
    let payload =
        serde_json::to_value(&envelope).map_err(|e| ServiceError::EventError(e.to_string()))?;

    let row = outbox_event::ActiveModel {
        id: NotSet,
        aggregate_key: Set(event.aggregate_key()),
        topic: Set(RESERVATION_TOPIC.to_string()),
        event_type: Set(envelope.event_type.clone()),
        payload: Set(payload),
        attempts: Set(0),
        created_at: Set(now),
        available_at: Set(now),
        published_at: Set(None),
    };
    row.insert(conn).await.map_err(ServiceError::db_error)?;

    debug!(
        event_type = %envelope.event_type,
        aggregate_key = %event.aggregate_key(),
        "outbox event enqueued"
    );
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&crate::config::ReservationConfig> for PublisherConfig {
    fn from(cfg: &crate::config::ReservationConfig) -> Self {
        Self {
            batch_size: cfg.publish_batch_size,
            backoff_base_ms: cfg.publish_backoff_base_ms,
            backoff_cap_ms: cfg.publish_backoff_cap_ms,
            visibility_timeout: cfg.publish_visibility_timeout(),
            poll_interval: cfg.publish_poll_interval(),
        }
    }
}

/// Background worker that drains committed outbox rows to the bus.
///
/// Delivery is at-least-once: a row is only marked published after the bus
/// accepted it, and a claim lapses (via `available_at`) if the publisher dies
/// mid-flight. Rows sharing an `aggregate_key` are delivered in id order;
/// when one fails, the rest of its key's batch is held back until the failed
/// row clears its backoff.
pub struct OutboxPublisher {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    config: PublisherConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxPublisher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn MessageQueue>,
        config: PublisherConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            queue,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("outbox publisher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.drain_once().await {
                        Ok(published) if published > 0 => {
                            debug!(published, "outbox drain pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "outbox drain pass failed"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("outbox publisher stopped");
    }

    /// One claim-and-publish pass. Returns the number of rows delivered.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let rows = self.claim_batch(now).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        // Group claimed rows by aggregate key, preserving id order within and
        // across groups.
        let mut groups: Vec<(String, Vec<outbox_event::Model>)> = Vec::new();
        for row in rows {
            match groups.iter_mut().find(|(key, _)| *key == row.aggregate_key) {
                Some((_, members)) => members.push(row),
                None => groups.push((row.aggregate_key.clone(), vec![row])),
            }
        }

        let mut published = 0usize;
        for (key, members) in groups {
            published += self.publish_group(&key, members, now).await?;
        }
        Ok(published)
    }

    async fn publish_group(
        &self,
        key: &str,
        members: Vec<outbox_event::Model>,
        now: DateTime<Utc>,
    ) -> Result<usize, ServiceError> {
        let first_id = members[0].id;

        // An older undelivered sibling (failed and backing off, or claimed by
        // another publisher) must go out first. Put the whole group back.
        let older_pending = OutboxEntity::find()
            .filter(outbox_event::Column::AggregateKey.eq(key))
            .filter(outbox_event::Column::PublishedAt.is_null())
            .filter(outbox_event::Column::Id.lt(first_id))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if older_pending > 0 {
            self.release_rows(members.iter().map(|m| m.id).collect(), now)
                .await?;
            return Ok(0);
        }

        let mut published = 0usize;
        let mut members = members.into_iter();
        while let Some(row) = members.next() {
            match self
                .queue
                .publish(&row.topic, &row.aggregate_key, &row.payload)
                .await
            {
                Ok(()) => {
                    self.mark_published(row.id).await?;
                    OUTBOX_PUBLISHED.inc();
                    published += 1;
                }
                Err(e) => {
                    let attempts = row.attempts + 1;
                    let delay_ms = self.backoff_ms(attempts);
                    warn!(
                        outbox_id = row.id,
                        aggregate_key = %row.aggregate_key,
                        attempts,
                        delay_ms,
                        error = %e,
                        "outbox publish failed, rescheduling"
                    );
                    OUTBOX_RETRIES.inc();
                    self.reschedule_row(row.id, attempts, delay_ms).await?;
                    // Hold back the rest of this key's batch behind the
                    // failed row.
                    let remaining: Vec<i64> = members.map(|m| m.id).collect();
                    if !remaining.is_empty() {
                        self.release_rows(remaining, Utc::now()).await?;
                    }
                    break;
                }
            }
        }
        Ok(published)
    }

    /// Claims up to `batch_size` due rows in id order and makes them invisible
    /// for the visibility timeout.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<outbox_event::Model>, ServiceError> {
        let visible_until = now
            + chrono::Duration::milliseconds(self.config.visibility_timeout.as_millis() as i64);

        if self.db.get_database_backend() == DbBackend::Postgres {
            // Single statement so concurrent publishers never claim the same
            // row, and a younger row is never claimed past an older
            // undelivered sibling of the same key.
            let sql = r#"
                WITH cte AS (
                    SELECT o.id FROM outbox_events o
                    WHERE o.published_at IS NULL
                      AND o.available_at <= $2
                      AND NOT EXISTS (
                          SELECT 1 FROM outbox_events p
                          WHERE p.aggregate_key = o.aggregate_key
                            AND p.id < o.id
                            AND p.published_at IS NULL
                            AND p.available_at > $2
                      )
                    ORDER BY o.id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox_events e
                SET available_at = $3
                FROM cte
                WHERE e.id = cte.id
                RETURNING e.id, e.aggregate_key, e.topic, e.event_type, e.payload,
                          e.attempts, e.created_at, e.available_at, e.published_at
            "#;
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                sql,
                vec![
                    (self.config.batch_size as i64).into(),
                    now.into(),
                    visible_until.into(),
                ],
            );
            let rows = self
                .db
                .query_all(stmt)
                .await
                .map_err(ServiceError::db_error)?;
            let mut models = Vec::with_capacity(rows.len());
            for row in rows {
                models.push(
                    outbox_event::Model::from_query_result(&row, "")
                        .map_err(ServiceError::db_error)?,
                );
            }
            models.sort_by_key(|m| m.id);
            return Ok(models);
        }

        // Portable path for the other backends: a plain scan plus a claim
        // update. Single publisher per database assumed there.
        let rows = OutboxEntity::find()
            .filter(outbox_event::Column::PublishedAt.is_null())
            .filter(outbox_event::Column::AvailableAt.lte(now))
            .order_by_asc(outbox_event::Column::Id)
            .limit(self.config.batch_size)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        if rows.is_empty() {
            return Ok(rows);
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        OutboxEntity::update_many()
            .filter(outbox_event::Column::Id.is_in(ids))
            .col_expr(
                outbox_event::Column::AvailableAt,
                Expr::value(visible_until),
            )
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(rows)
    }

    async fn mark_published(&self, id: i64) -> Result<(), ServiceError> {
        OutboxEntity::update_many()
            .filter(outbox_event::Column::Id.eq(id))
            .col_expr(outbox_event::Column::PublishedAt, Expr::value(Utc::now()))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn reschedule_row(
        &self,
        id: i64,
        attempts: i32,
        delay_ms: u64,
    ) -> Result<(), ServiceError> {
        let next = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        OutboxEntity::update_many()
            .filter(outbox_event::Column::Id.eq(id))
            .col_expr(outbox_event::Column::Attempts, Expr::value(attempts))
            .col_expr(outbox_event::Column::AvailableAt, Expr::value(next))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Returns claimed rows to the queue without charging an attempt.
    async fn release_rows(
        &self,
        ids: Vec<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        OutboxEntity::update_many()
            .filter(outbox_event::Column::Id.is_in(ids))
            .col_expr(outbox_event::Column::AvailableAt, Expr::value(now))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// min(cap, base * 2^attempts) plus a little jitter so a herd of retries
    /// spreads out.
    fn backoff_ms(&self, attempts: i32) -> u64 {
        let jitter = rand::thread_rng().gen_range(0..=self.config.backoff_base_ms.min(250));
        exponential_backoff_ms(
            self.config.backoff_base_ms,
            self.config.backoff_cap_ms,
            attempts,
        ) + jitter
    }
}

fn exponential_backoff_ms(base_ms: u64, cap_ms: u64, attempts: i32) -> u64 {
    base_ms
        .saturating_mul(1u64 << attempts.clamp(0, 20) as u32)
        .min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        assert_eq!(exponential_backoff_ms(100, 1_000, 1), 200);
        assert_eq!(exponential_backoff_ms(100, 1_000, 2), 400);
        assert_eq!(exponential_backoff_ms(100, 1_000, 3), 800);
        assert_eq!(exponential_backoff_ms(100, 1_000, 4), 1_000);
        assert_eq!(exponential_backoff_ms(100, 1_000, 10), 1_000);
    }

    #[test]
    fn backoff_tolerates_huge_attempt_counts() {
        assert_eq!(exponential_backoff_ms(100, 60_000, 1_000), 60_000);
        assert_eq!(exponential_backoff_ms(0, 60_000, 3), 0);
    }
}
