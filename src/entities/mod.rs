pub mod idempotency_key;
pub mod outbox_event;
pub mod product;
pub mod reservation;
pub mod stock_level;

pub use reservation::ReservationStatus;
