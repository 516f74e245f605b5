//! Idempotency key store backing repeat-safe reservation creation.

use crate::entities::idempotency_key::{self, Entity as IdempotencyEntity};
use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

/// Keys stay resolvable for this long after first use.
pub fn key_retention() -> chrono::Duration {
    chrono::Duration::hours(24)
}

pub async fn find(
    conn: &impl ConnectionTrait,
    key: &str,
) -> Result<Option<idempotency_key::Model>, ServiceError> {
    IdempotencyEntity::find_by_id(key.to_string())
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

pub async fn insert(
    conn: &impl ConnectionTrait,
    key: &str,
    user_id: Uuid,
    reservation_id: Uuid,
    request_fingerprint: String,
    now: DateTime<Utc>,
) -> Result<idempotency_key::Model, ServiceError> {
    let model = idempotency_key::ActiveModel {
        key: Set(key.to_string()),
        user_id: Set(user_id),
        reservation_id: Set(reservation_id),
        request_fingerprint: Set(request_fingerprint),
        created_at: Set(now),
        expires_at: Set(now + key_retention()),
    };
    model.insert(conn).await.map_err(ServiceError::db_error)
}

pub async fn delete(conn: &impl ConnectionTrait, key: &str) -> Result<(), ServiceError> {
    IdempotencyEntity::delete_by_id(key.to_string())
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

/// Removes keys past their retention window. Returns how many were dropped.
pub async fn purge_expired(
    conn: &impl ConnectionTrait,
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let result = IdempotencyEntity::delete_many()
        .filter(idempotency_key::Column::ExpiresAt.lte(now))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(result.rows_affected)
}
