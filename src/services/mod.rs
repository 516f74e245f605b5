pub mod reservation_reaper;
pub mod reservations;
pub mod stock_ledger;

pub use reservation_reaper::{ExpiryReaper, ReaperConfig};
pub use reservations::{CreateReservationRequest, ReservationService};
pub use stock_ledger::{LockStrategy, StockLedger};
