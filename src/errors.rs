use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Error type shared by every service in the engine.
///
/// Business failures carry enough structure for the caller to act on them;
/// `wire_code` exposes the stable machine codes of the external contract.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i32, requested: i32 },

    #[error("product is not available for reservation")]
    ProductUnavailable,

    #[error("active reservation limit reached ({limit})")]
    UserReservationLimit { limit: u64 },

    #[error("reservation belongs to another user")]
    NotOwner,

    #[error("reservation is not pending")]
    NotPending,

    #[error("reservation has expired")]
    ReservationExpired,

    #[error("reservation can no longer be cancelled")]
    NotCancellable,

    #[error("idempotency key was already used with a different request")]
    IdempotencyConflict,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    /// A ledger precondition that only a programming bug can break.
    #[error("stock ledger invariant violated: {0}")]
    LedgerInvariantViolation(String),

    /// Optimistic version conflict that survived the ledger's retry budget.
    #[error("version conflict persisted after {retries} retries")]
    Conflict { retries: u32 },

    #[error("database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("event error: {0}")]
    EventError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    /// Convenience used at `map_err` seams.
    pub fn db_error(err: DbErr) -> Self {
        ServiceError::DatabaseError(err)
    }

    /// Stable machine code carried next to the human message on the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            ServiceError::InsufficientStock { .. } => "insufficient_stock",
            ServiceError::ProductUnavailable => "product_unavailable",
            ServiceError::UserReservationLimit { .. } => "user_limit",
            ServiceError::NotOwner => "not_owner",
            ServiceError::NotPending => "not_pending",
            ServiceError::ReservationExpired => "reservation_expired",
            ServiceError::NotCancellable => "not_cancellable",
            ServiceError::IdempotencyConflict => "idempotency_conflict",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::ValidationError(_) => "validation_error",
            ServiceError::LedgerInvariantViolation(_) => "internal",
            ServiceError::Conflict { .. } => "retry",
            ServiceError::DatabaseError(_)
            | ServiceError::EventError(_) => "transient",
            ServiceError::InternalError(_) => "internal",
        }
    }

    /// Transient failures are safe to retry; business failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Conflict { .. }
                | ServiceError::DatabaseError(_)
                | ServiceError::EventError(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InsufficientStock { .. }
            | ServiceError::ProductUnavailable
            | ServiceError::UserReservationLimit { .. }
            | ServiceError::NotPending
            | ServiceError::ReservationExpired
            | ServiceError::NotCancellable
            | ServiceError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ServiceError::IdempotencyConflict => StatusCode::CONFLICT,
            ServiceError::NotOwner => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict { .. }
            | ServiceError::DatabaseError(_)
            | ServiceError::EventError(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::LedgerInvariantViolation(_) | ServiceError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        // Invariant violations are defects, not business conditions. Log them
        // in full and hand the caller an opaque internal error.
        let message = match &self {
            ServiceError::LedgerInvariantViolation(detail) => {
                error!(detail = %detail, "ledger invariant violation");
                "internal error".to_string()
            }
            ServiceError::DatabaseError(err) => {
                error!(error = %err, "database error on request path");
                "temporarily unavailable, please retry".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: message,
            code: self.wire_code(),
            retry_after_ms: self.is_transient().then_some(250),
        };

        (self.status_code(), Json(body)).into_response()
    }
}
