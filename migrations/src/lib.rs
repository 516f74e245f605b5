pub use sea_orm_migration::prelude::*;

mod m20250610_000001_create_products_table;
mod m20250610_000002_create_stock_levels_table;
mod m20250610_000003_create_reservations_table;
mod m20250610_000004_create_outbox_events_table;
mod m20250610_000005_create_idempotency_keys_table;
mod m20250610_000006_add_reservation_indexes;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250610_000001_create_products_table::Migration),
            Box::new(m20250610_000002_create_stock_levels_table::Migration),
            Box::new(m20250610_000003_create_reservations_table::Migration),
            Box::new(m20250610_000004_create_outbox_events_table::Migration),
            Box::new(m20250610_000005_create_idempotency_keys_table::Migration),
            Box::new(m20250610_000006_add_reservation_indexes::Migration),
        ]
    }
}
