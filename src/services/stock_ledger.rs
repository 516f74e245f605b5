//! Stock ledger: the only writer of `stock_levels` rows.
//!
//! Each primitive is linearizable with respect to the other primitives on the
//! same product row; across products there is no coordination. The ledger
//! never partially mutates: a primitive either commits its one-row update or
//! leaves the row untouched.

use crate::cache::{StockCache, StockSnapshot};
use crate::entities::stock_level::{self, Entity as StockEntity};
use crate::errors::ServiceError;
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use std::sync::Arc;
use tracing::{instrument, warn};

lazy_static! {
    static ref LEDGER_CONFLICTS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_ledger_conflicts_total",
            "Optimistic version conflicts observed by ledger primitives"
        ),
        &["operation"]
    )
    .expect("metric can be created");
    static ref LEDGER_INSUFFICIENT: IntCounter = IntCounter::new(
        "stock_ledger_insufficient_total",
        "Reserve attempts rejected for insufficient stock"
    )
    .expect("metric can be created");
}

/// Locking discipline for ledger primitives. One discipline per deployment;
/// the two are never combined on the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Conditional write on the row version, retried up to `max_retries`.
    Optimistic { max_retries: u32 },
    /// Exclusive row lock for the duration of the primitive (Postgres).
    Pessimistic,
}

impl Default for LockStrategy {
    fn default() -> Self {
        LockStrategy::Optimistic { max_retries: 5 }
    }
}

impl LockStrategy {
    /// Parses the configured name, falling back to the optimistic default.
    pub fn from_config(name: &str, max_retries: u32) -> Self {
        match name {
            "pessimistic" => LockStrategy::Pessimistic,
            _ => LockStrategy::Optimistic { max_retries },
        }
    }
}

#[derive(Clone)]
pub struct StockLedger {
    strategy: LockStrategy,
    cache: Arc<StockCache>,
}

impl StockLedger {
    pub fn new(strategy: LockStrategy, cache: Arc<StockCache>) -> Self {
        Self { strategy, cache }
    }

    /// Places a hold: requires `available >= quantity`, then moves `quantity`
    /// units into `reserved`.
    #[instrument(skip(self, conn))]
    pub async fn reserve(
        &self,
        conn: &impl ConnectionTrait,
        product_id: i64,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }
        self.mutate(conn, product_id, "reserve", |row| {
            if !row.can_reserve(quantity) {
                LEDGER_INSUFFICIENT.inc();
                return Err(ServiceError::InsufficientStock {
                    available: row.available(),
                    requested: quantity,
                });
            }
            Ok((row.on_hand, row.reserved + quantity))
        })
        .await
    }

    /// Releases a hold. Clamped at the current reserve so a double release
    /// under retry is harmless; never fails on quantity underflow.
    #[instrument(skip(self, conn))]
    pub async fn release(
        &self,
        conn: &impl ConnectionTrait,
        product_id: i64,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        self.mutate(conn, product_id, "release", |row| {
            let freed = quantity.max(0).min(row.reserved);
            Ok((row.on_hand, row.reserved - freed))
        })
        .await
    }

    /// Converts a hold into a sale: debits both `on_hand` and `reserved`.
    /// Failing the precondition means a caller bug, not a business condition.
    #[instrument(skip(self, conn))]
    pub async fn commit(
        &self,
        conn: &impl ConnectionTrait,
        product_id: i64,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        self.mutate(conn, product_id, "commit", |row| {
            if row.reserved < quantity || row.on_hand < quantity {
                return Err(ServiceError::LedgerInvariantViolation(format!(
                    "commit of {} exceeds state (on_hand={}, reserved={}) for product {}",
                    quantity, row.on_hand, row.reserved, product_id
                )));
            }
            Ok((row.on_hand - quantity, row.reserved - quantity))
        })
        .await
    }

    /// Administrative restock/correction. Creates the stock row if the
    /// product has never had one.
    #[instrument(skip(self, conn))]
    pub async fn set_on_hand(
        &self,
        conn: &impl ConnectionTrait,
        product_id: i64,
        new_on_hand: i32,
    ) -> Result<(), ServiceError> {
        if new_on_hand < 0 {
            return Err(ServiceError::ValidationError(
                "on_hand cannot be negative".to_string(),
            ));
        }

        let existing = StockEntity::find_by_id(product_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_none() {
            let row = stock_level::ActiveModel {
                product_id: Set(product_id),
                on_hand: Set(new_on_hand),
                reserved: Set(0),
                version: Set(1),
                updated_at: Set(Utc::now()),
            };
            row.insert(conn).await.map_err(ServiceError::db_error)?;
            self.cache.invalidate(product_id);
            return Ok(());
        }

        self.mutate(conn, product_id, "set_on_hand", |row| {
            if new_on_hand < row.reserved {
                return Err(ServiceError::ValidationError(format!(
                    "on_hand {} would fall below reserved {}",
                    new_on_hand, row.reserved
                )));
            }
            Ok((new_on_hand, row.reserved))
        })
        .await
    }

    /// Current row, bypassing the cache. `None` when no stock row exists.
    pub async fn get(
        &self,
        conn: &impl ConnectionTrait,
        product_id: i64,
    ) -> Result<Option<stock_level::Model>, ServiceError> {
        StockEntity::find_by_id(product_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Read-through snapshot for availability displays. Advisory only.
    pub async fn snapshot(
        &self,
        conn: &impl ConnectionTrait,
        product_id: i64,
    ) -> Result<Option<StockSnapshot>, ServiceError> {
        if let Some(hit) = self.cache.get(product_id) {
            return Ok(Some(hit));
        }
        let row = self.get(conn, product_id).await?;
        Ok(row.map(|row| {
            let snapshot = StockSnapshot::from(&row);
            self.cache.put(product_id, snapshot);
            snapshot
        }))
    }

    /// Shared core: load the row, compute `(on_hand, reserved)`, write it back
    /// under the configured discipline. The closure sees committed state and
    /// must not have side effects besides its own error.
    async fn mutate<C, F>(
        &self,
        conn: &C,
        product_id: i64,
        operation: &'static str,
        compute: F,
    ) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
        F: Fn(&stock_level::Model) -> Result<(i32, i32), ServiceError>,
    {
        match self.strategy {
            LockStrategy::Pessimistic => {
                let row = StockEntity::find_by_id(product_id)
                    .lock_exclusive()
                    .one(conn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("no stock row for product {product_id}"))
                    })?;
                let (on_hand, reserved) = compute(&row)?;
                let mut active: stock_level::ActiveModel = row.clone().into();
                active.on_hand = Set(on_hand);
                active.reserved = Set(reserved);
                active.version = Set(row.version + 1);
                active.updated_at = Set(Utc::now());
                active.update(conn).await.map_err(ServiceError::db_error)?;
                self.cache.invalidate(product_id);
                Ok(())
            }
            LockStrategy::Optimistic { max_retries } => {
                let mut attempt = 0u32;
                loop {
                    let row = StockEntity::find_by_id(product_id)
                        .one(conn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "no stock row for product {product_id}"
                            ))
                        })?;
                    let (on_hand, reserved) = compute(&row)?;

                    let result = StockEntity::update_many()
                        .filter(stock_level::Column::ProductId.eq(product_id))
                        .filter(stock_level::Column::Version.eq(row.version))
                        .col_expr(stock_level::Column::OnHand, Expr::value(on_hand))
                        .col_expr(stock_level::Column::Reserved, Expr::value(reserved))
                        .col_expr(stock_level::Column::Version, Expr::value(row.version + 1))
                        .col_expr(stock_level::Column::UpdatedAt, Expr::value(Utc::now()))
                        .exec(conn)
                        .await
                        .map_err(ServiceError::db_error)?;

                    if result.rows_affected > 0 {
                        self.cache.invalidate(product_id);
                        return Ok(());
                    }

                    LEDGER_CONFLICTS.with_label_values(&[operation]).inc();
                    attempt += 1;
                    if attempt > max_retries {
                        warn!(
                            product_id,
                            operation, attempt, "ledger retry budget exhausted"
                        );
                        return Err(ServiceError::Conflict { retries: attempt });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_is_optimistic() {
        assert_eq!(
            LockStrategy::default(),
            LockStrategy::Optimistic { max_retries: 5 }
        );
    }

    #[test]
    fn strategy_parses_from_config() {
        assert_eq!(
            LockStrategy::from_config("pessimistic", 5),
            LockStrategy::Pessimistic
        );
        assert_eq!(
            LockStrategy::from_config("optimistic", 3),
            LockStrategy::Optimistic { max_retries: 3 }
        );
        assert_eq!(
            LockStrategy::from_config("anything-else", 2),
            LockStrategy::Optimistic { max_retries: 2 }
        );
    }
}
