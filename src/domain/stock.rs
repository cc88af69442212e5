use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderItem;

// ============================================================================
// Stock Ledger
// ============================================================================
//
// Deduction: "stock -= q, sold += q WHERE stock >= q" (zero rows = shortage).
// Restoration: "stock += q, sold = max(sold - q, 0)", never fails.
//
// Both backends run these as single conditional statements inside the
// enclosing commit; there is no application-level lock on a SKU row.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sku {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub stock: i64,
    pub sold_count: i64,
    pub on_sale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockDirection {
    Deduct,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockMovement {
    pub sku_id: Uuid,
    pub quantity: i64,
    pub direction: StockDirection,
}

impl StockMovement {
    pub fn deduct(sku_id: Uuid, quantity: i64) -> Self {
        Self { sku_id, quantity, direction: StockDirection::Deduct }
    }

    pub fn restore(sku_id: Uuid, quantity: i64) -> Self {
        Self { sku_id, quantity, direction: StockDirection::Restore }
    }
}

/// Returned when a conditional deduction matches no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockShortage {
    pub sku_id: Uuid,
    pub requested: i64,
    pub available: i64,
}

impl Sku {
    pub fn apply(&mut self, movement: &StockMovement) -> Result<(), StockShortage> {
        match movement.direction {
            StockDirection::Deduct => {
                if self.stock < movement.quantity {
                    return Err(StockShortage {
                        sku_id: self.id,
                        requested: movement.quantity,
                        available: self.stock,
                    });
                }
                self.stock -= movement.quantity;
                self.sold_count += movement.quantity;
            }
            StockDirection::Restore => {
                self.stock += movement.quantity;
                self.sold_count = (self.sold_count - movement.quantity).max(0);
            }
        }
        Ok(())
    }
}

/// Compensation for a cancelled or closed order: every line returns its full
/// deducted quantity.
pub fn restorations_for(items: &[OrderItem]) -> Vec<StockMovement> {
    items
        .iter()
        .map(|item| StockMovement::restore(item.sku_id, i64::from(item.quantity)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sku(stock: i64) -> Sku {
        Sku {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            name: "Tea Kettle".to_string(),
            price: Decimal::from(25),
            stock,
            sold_count: 0,
            on_sale: true,
        }
    }

    #[test]
    fn test_deduct_moves_stock_into_sold_counter() {
        let mut sku = sku(5);
        sku.apply(&StockMovement::deduct(sku.id, 3)).unwrap();
        assert_eq!(sku.stock, 2);
        assert_eq!(sku.sold_count, 3);
    }

    #[test]
    fn test_deduct_beyond_stock_is_a_shortage() {
        let mut sku = sku(2);
        let err = sku.apply(&StockMovement::deduct(sku.id, 3)).unwrap_err();
        assert_eq!(err.requested, 3);
        assert_eq!(err.available, 2);
        assert_eq!(sku.stock, 2);
        assert_eq!(sku.sold_count, 0);
    }

    #[test]
    fn test_restore_floors_sold_counter_at_zero() {
        let mut sku = sku(0);
        sku.sold_count = 1;
        sku.apply(&StockMovement::restore(sku.id, 4)).unwrap();
        assert_eq!(sku.stock, 4);
        assert_eq!(sku.sold_count, 0);
    }
}
