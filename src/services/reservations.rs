//! Reservation orchestrator. Every external operation runs in exactly one
//! database transaction covering the stock mutation, the reservation write,
//! and the outbox append; if any step fails the transaction aborts and no
//! event is ever visible. This service is the sole event emitter.

use crate::config::ReservationConfig;
use crate::entities::product::Entity as ProductEntity;
use crate::entities::reservation::{self, ReservationStatus};
use crate::errors::ServiceError;
use crate::events::{outbox, ReservationEvent};
use crate::repositories::{idempotency, reservations};
use crate::services::stock_ledger::StockLedger;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts};
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, EntityTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

lazy_static! {
    static ref RESERVATIONS_CREATED: IntCounter = IntCounter::new(
        "reservations_created_total",
        "Total number of reservations created"
    )
    .expect("metric can be created");
    static ref RESERVATION_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "reservation_transitions_total",
            "Terminal transitions applied to reservations"
        ),
        &["to_status"]
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    pub user_id: Uuid,
    pub product_id: i64,
    pub quantity: i32,
    /// Opaque bag forwarded to fulfillment; never interpreted by the engine.
    pub customer_info: Option<serde_json::Value>,
    /// Repeat-safe create: the same key returns the same reservation.
    pub idempotency_key: Option<String>,
}

impl CreateReservationRequest {
    fn validate(&self) -> Result<(), ServiceError> {
        if self.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > 128 {
                return Err(ServiceError::ValidationError(
                    "idempotency key must be 1..=128 characters".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Stable digest of everything that makes two creates "the same request".
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update(self.product_id.to_be_bytes());
        hasher.update(self.quantity.to_be_bytes());
        let info = self.customer_info.clone().unwrap_or(json!({}));
        hasher.update(info.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Clone)]
pub struct ReservationService {
    db: Arc<DatabaseConnection>,
    ledger: StockLedger,
    config: ReservationConfig,
}

impl ReservationService {
    pub fn new(db: Arc<DatabaseConnection>, ledger: StockLedger, config: ReservationConfig) -> Self {
        Self { db, ledger, config }
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    /// Creates a PENDING hold on `quantity` units, bounded by the configured
    /// TTL. Preconditions run inside the transaction, in order: product
    /// active, per-user limit, then stock.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, product_id = %request.product_id))]
    pub async fn create_reservation(
        &self,
        request: CreateReservationRequest,
    ) -> Result<reservation::Model, ServiceError> {
        request.validate()?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let now = Utc::now();

        if let Some(key) = &request.idempotency_key {
            if let Some(stored) = idempotency::find(&txn, key).await? {
                if stored.expires_at > now {
                    if stored.request_fingerprint != request.fingerprint() {
                        return Err(ServiceError::IdempotencyConflict);
                    }
                    let existing = reservations::find(&txn, stored.reservation_id)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::InternalError(format!(
                                "idempotency key {key} points at a missing reservation"
                            ))
                        })?;
                    txn.commit().await.map_err(ServiceError::db_error)?;
                    info!(reservation_id = %existing.id, "idempotent replay returned existing reservation");
                    return Ok(existing);
                }
                // Retention lapsed: the key is free to be reused.
                idempotency::delete(&txn, key).await?;
            }
        }

        let product = ProductEntity::find_by_id(request.product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let product = match product {
            Some(p) if p.is_active => p,
            _ => return Err(ServiceError::ProductUnavailable),
        };

        let active = reservations::count_active(&txn, request.user_id).await?;
        if active >= self.config.max_active_per_user {
            return Err(ServiceError::UserReservationLimit {
                limit: self.config.max_active_per_user,
            });
        }

        self.ledger
            .reserve(&txn, request.product_id, request.quantity)
            .await?;

        let total_price = product.price * Decimal::from(request.quantity);
        let model = reservation::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(request.user_id),
            product_id: Set(request.product_id),
            quantity: Set(request.quantity),
            status: Set(ReservationStatus::Pending.as_str().to_string()),
            unit_price: Set(product.price),
            total_price: Set(total_price),
            customer_info: Set(request.customer_info.clone().unwrap_or(json!({}))),
            expires_at: Set(now + self.config.ttl()),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            confirmed_at: Set(None),
            cancelled_at: Set(None),
        };
        let created = reservations::insert(&txn, model).await?;

        if let Some(key) = &request.idempotency_key {
            idempotency::insert(
                &txn,
                key,
                request.user_id,
                created.id,
                request.fingerprint(),
                now,
            )
            .await?;
        }

        outbox::enqueue(&txn, &ReservationEvent::created(&created)).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        RESERVATIONS_CREATED.inc();
        info!(
            reservation_id = %created.id,
            quantity = created.quantity,
            expires_at = %created.expires_at,
            "reservation created"
        );
        Ok(created)
    }

    /// Confirms a PENDING hold, converting it into a sale. A hold past its
    /// deadline is expired on the spot instead and the caller is told so.
    #[instrument(skip(self), fields(reservation_id = %id, user_id = %user_id))]
    pub async fn confirm_reservation(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<reservation::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let now = Utc::now();

        let current = reservations::find(&txn, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("reservation {id} not found")))?;
        if current.user_id != user_id {
            return Err(ServiceError::NotOwner);
        }
        match current.status() {
            Some(ReservationStatus::Pending) => {}
            _ => return Err(ServiceError::NotPending),
        }

        if current.is_expired(now) {
            // The hold is gone; perform the expiry here rather than leaving
            // the row to the reaper, then surface it explicitly.
            let expired = reservations::transition(
                &txn,
                id,
                ReservationStatus::Pending,
                ReservationStatus::Expired,
                now,
            )
            .await?
            .ok_or(ServiceError::NotPending)?;
            self.ledger
                .release(&txn, expired.product_id, expired.quantity)
                .await?;
            outbox::enqueue(&txn, &ReservationEvent::expired(&expired, now)).await?;
            txn.commit().await.map_err(ServiceError::db_error)?;

            RESERVATION_TRANSITIONS
                .with_label_values(&["expired"])
                .inc();
            warn!(reservation_id = %id, "confirm attempted on expired reservation");
            return Err(ServiceError::ReservationExpired);
        }

        let confirmed = reservations::transition(
            &txn,
            id,
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            now,
        )
        .await?
        .ok_or(ServiceError::NotPending)?;
        self.ledger
            .commit(&txn, confirmed.product_id, confirmed.quantity)
            .await?;
        outbox::enqueue(&txn, &ReservationEvent::confirmed(&confirmed, now)).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        RESERVATION_TRANSITIONS
            .with_label_values(&["confirmed"])
            .inc();
        info!(reservation_id = %id, total_price = %confirmed.total_price, "reservation confirmed");
        Ok(confirmed)
    }

    /// User-initiated cancellation of a PENDING hold.
    #[instrument(skip(self), fields(reservation_id = %id, user_id = %user_id))]
    pub async fn cancel_reservation(
        &self,
        id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<reservation::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let now = Utc::now();

        let current = reservations::find(&txn, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("reservation {id} not found")))?;
        if current.user_id != user_id {
            return Err(ServiceError::NotOwner);
        }
        match current.status() {
            Some(ReservationStatus::Pending) => {}
            _ => return Err(ServiceError::NotCancellable),
        }

        let cancelled = reservations::transition(
            &txn,
            id,
            ReservationStatus::Pending,
            ReservationStatus::Cancelled,
            now,
        )
        .await?
        .ok_or(ServiceError::NotCancellable)?;
        self.ledger
            .release(&txn, cancelled.product_id, cancelled.quantity)
            .await?;
        outbox::enqueue(&txn, &ReservationEvent::cancelled(&cancelled, now, reason)).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        RESERVATION_TRANSITIONS
            .with_label_values(&["cancelled"])
            .inc();
        info!(reservation_id = %id, "reservation cancelled");
        Ok(cancelled)
    }

    /// Owner-scoped read.
    pub async fn get_reservation(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<reservation::Model, ServiceError> {
        let found = reservations::find(&*self.db, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("reservation {id} not found")))?;
        if found.user_id != user_id {
            return Err(ServiceError::NotOwner);
        }
        Ok(found)
    }

    /// Newest-first page of the caller's reservations.
    pub async fn list_user_reservations(
        &self,
        user_id: Uuid,
        status: Option<ReservationStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<reservation::Model>, u64), ServiceError> {
        reservations::list_by_user(&*self.db, user_id, status, page, per_page).await
    }

    pub async fn stats(&self) -> Result<reservations::ReservationStats, ServiceError> {
        reservations::stats(&*self.db, Utc::now()).await
    }

    /// Advisory availability read for product displays.
    pub async fn available_stock(&self, product_id: i64) -> Result<i32, ServiceError> {
        let snapshot = self
            .ledger
            .snapshot(&*self.db, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("no stock row for product {product_id}"))
            })?;
        Ok(snapshot.available())
    }

    /// Administrative restock, in its own transaction.
    pub async fn set_on_hand(&self, product_id: i64, on_hand: i32) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        self.ledger.set_on_hand(&txn, product_id, on_hand).await?;
        txn.commit().await.map_err(ServiceError::db_error)
    }

    /// One reaper pass: expire every PENDING hold whose deadline has passed,
    /// item by item. Each item runs in its own transaction and failures skip
    /// to the next candidate, so a poisoned row cannot wedge the sweep.
    /// Safe under concurrent reapers: the status CAS lets exactly one win.
    #[instrument(skip(self))]
    pub async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        batch_size: u64,
    ) -> Result<u64, ServiceError> {
        let candidates = reservations::scan_expired(&*self.db, now, batch_size).await?;
        let mut reaped = 0u64;
        for candidate in candidates {
            match self.expire_one(candidate.id, now).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        reservation_id = %candidate.id,
                        error = %e,
                        "failed to expire reservation, skipping"
                    );
                }
            }
        }
        if reaped > 0 {
            info!(reaped, "expired reservations reaped");
        }
        Ok(reaped)
    }

    /// Expires a single reservation if it is still PENDING and due. Returns
    /// whether this call performed the transition.
    async fn expire_one(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let Some(current) = reservations::find(&txn, id).await? else {
            return Ok(false);
        };
        if current.status() != Some(ReservationStatus::Pending) || !current.is_expired(now) {
            return Ok(false);
        }

        let Some(expired) = reservations::transition(
            &txn,
            id,
            ReservationStatus::Pending,
            ReservationStatus::Expired,
            now,
        )
        .await?
        else {
            // Lost the race to a confirm, cancel, or another reaper.
            return Ok(false);
        };

        self.ledger
            .release(&txn, expired.product_id, expired.quantity)
            .await?;
        outbox::enqueue(&txn, &ReservationEvent::expired(&expired, now)).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        RESERVATION_TRANSITIONS
            .with_label_values(&["expired"])
            .inc();
        Ok(true)
    }

    /// Drops idempotency keys past their retention window.
    pub async fn purge_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        idempotency::purge_expired(&*self.db, now).await
    }
}
