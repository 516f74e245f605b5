pub mod idempotency;
pub mod reservations;
