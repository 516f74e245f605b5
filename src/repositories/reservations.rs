//! Reservation store: durable rows and indexed lookups. Every function takes
//! the connection it runs on, so callers compose them into one transaction.

use crate::entities::reservation::{self, Entity as ReservationEntity, ReservationStatus};
use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inserts a new reservation; a duplicate id is rejected by the primary key.
pub async fn insert(
    conn: &impl ConnectionTrait,
    model: reservation::ActiveModel,
) -> Result<reservation::Model, ServiceError> {
    model.insert(conn).await.map_err(ServiceError::db_error)
}

pub async fn find(
    conn: &impl ConnectionTrait,
    id: Uuid,
) -> Result<Option<reservation::Model>, ServiceError> {
    ReservationEntity::find_by_id(id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Compare-and-set status transition. Returns the updated row, or `None` when
/// the row was not in `from` anymore (a stale transition): the caller decides
/// whether that is `NotPending`, `NotCancellable`, or a benign race.
///
/// The matching terminal timestamp is stamped here so "`confirmed_at` set iff
/// CONFIRMED" cannot drift from the transition itself.
pub async fn transition(
    conn: &impl ConnectionTrait,
    id: Uuid,
    from: ReservationStatus,
    to: ReservationStatus,
    now: DateTime<Utc>,
) -> Result<Option<reservation::Model>, ServiceError> {
    debug_assert!(!from.is_terminal(), "transitions only leave PENDING");

    let mut update = ReservationEntity::update_many()
        .filter(reservation::Column::Id.eq(id))
        .filter(reservation::Column::Status.eq(from.as_str()))
        .col_expr(reservation::Column::Status, Expr::value(to.as_str()))
        .col_expr(reservation::Column::UpdatedAt, Expr::value(now));

    update = match to {
        ReservationStatus::Confirmed => {
            update.col_expr(reservation::Column::ConfirmedAt, Expr::value(now))
        }
        ReservationStatus::Cancelled | ReservationStatus::Expired => {
            update.col_expr(reservation::Column::CancelledAt, Expr::value(now))
        }
        ReservationStatus::Pending => update,
    };

    let result = update.exec(conn).await.map_err(ServiceError::db_error)?;
    if result.rows_affected == 0 {
        return Ok(None);
    }
    find(conn, id).await
}

/// Number of PENDING reservations held by a user.
pub async fn count_active(
    conn: &impl ConnectionTrait,
    user_id: Uuid,
) -> Result<u64, ServiceError> {
    ReservationEntity::find()
        .filter(reservation::Column::UserId.eq(user_id))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
        .count(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Newest-first page of a user's reservations, optionally narrowed by status.
pub async fn list_by_user(
    conn: &impl ConnectionTrait,
    user_id: Uuid,
    status: Option<ReservationStatus>,
    page: u64,
    per_page: u64,
) -> Result<(Vec<reservation::Model>, u64), ServiceError> {
    if page == 0 {
        return Err(ServiceError::ValidationError(
            "page number must be greater than 0".to_string(),
        ));
    }
    if per_page == 0 || per_page > 1000 {
        return Err(ServiceError::ValidationError(
            "per_page must be between 1 and 1000".to_string(),
        ));
    }

    let mut query = ReservationEntity::find()
        .filter(reservation::Column::UserId.eq(user_id));
    if let Some(status) = status {
        query = query.filter(reservation::Column::Status.eq(status.as_str()));
    }
    query = query.order_by_desc(reservation::Column::CreatedAt);

    let paginator = query.paginate(conn, per_page);
    let total = paginator
        .num_items()
        .await
        .map_err(ServiceError::db_error)?;
    let models = paginator
        .fetch_page(page - 1)
        .await
        .map_err(ServiceError::db_error)?;
    Ok((models, total))
}

/// PENDING reservations whose deadline has passed, oldest deadline first.
/// Index-backed by `(status, expires_at)`.
pub async fn scan_expired(
    conn: &impl ConnectionTrait,
    now: DateTime<Utc>,
    batch_size: u64,
) -> Result<Vec<reservation::Model>, ServiceError> {
    ReservationEntity::find()
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
        .filter(reservation::Column::ExpiresAt.lte(now))
        .order_by_asc(reservation::Column::ExpiresAt)
        .limit(batch_size)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Aggregate view over the reservation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationStats {
    pub pending: u64,
    pub confirmed: u64,
    pub cancelled: u64,
    pub expired: u64,
    /// PENDING rows past their deadline that the reaper has not visited yet.
    pub expired_unreaped: u64,
    pub confirmed_revenue: Decimal,
    pub stats_at: DateTime<Utc>,
}

pub async fn stats(
    conn: &impl ConnectionTrait,
    now: DateTime<Utc>,
) -> Result<ReservationStats, ServiceError> {
    let count_status = |status: ReservationStatus| {
        ReservationEntity::find()
            .filter(reservation::Column::Status.eq(status.as_str()))
            .count(conn)
    };

    let pending = count_status(ReservationStatus::Pending)
        .await
        .map_err(ServiceError::db_error)?;
    let confirmed = count_status(ReservationStatus::Confirmed)
        .await
        .map_err(ServiceError::db_error)?;
    let cancelled = count_status(ReservationStatus::Cancelled)
        .await
        .map_err(ServiceError::db_error)?;
    let expired = count_status(ReservationStatus::Expired)
        .await
        .map_err(ServiceError::db_error)?;

    let expired_unreaped = ReservationEntity::find()
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending.as_str()))
        .filter(reservation::Column::ExpiresAt.lte(now))
        .count(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let confirmed_revenue: Option<Decimal> = ReservationEntity::find()
        .select_only()
        .column_as(reservation::Column::TotalPrice.sum(), "revenue")
        .filter(reservation::Column::Status.eq(ReservationStatus::Confirmed.as_str()))
        .into_tuple()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .flatten();

    Ok(ReservationStats {
        pending,
        confirmed,
        cancelled,
        expired,
        expired_unreaped,
        confirmed_revenue: confirmed_revenue.unwrap_or_default(),
        stats_at: now,
    })
}
