use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One stock row per product. Only the ledger primitives write to this table;
/// `version` increases strictly on every mutation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_levels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub product_id: i64,
    pub on_hand: i32,
    pub reserved: i32,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Units that can still be reserved.
    pub fn available(&self) -> i32 {
        (self.on_hand - self.reserved).max(0)
    }

    pub fn can_reserve(&self, quantity: i32) -> bool {
        self.available() >= quantity
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(on_hand: i32, reserved: i32) -> Model {
        Model {
            product_id: 1,
            on_hand,
            reserved,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn available_is_on_hand_minus_reserved() {
        assert_eq!(row(10, 3).available(), 7);
        assert_eq!(row(5, 5).available(), 0);
    }

    #[test]
    fn can_reserve_respects_available() {
        assert!(row(10, 3).can_reserve(7));
        assert!(!row(10, 3).can_reserve(8));
    }
}
