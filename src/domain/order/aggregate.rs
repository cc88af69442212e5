use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::OrderError;
use super::value_objects::{Operator, OrderStatus, ShippingAddress};

// ============================================================================
// Order Aggregate
// ============================================================================
//
// The order row is the unit of concurrency control: every persisted mutation
// of the order or of its children (payments, after-sales, shipment) bumps
// `version` by exactly one.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub sku_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub refunded_quantity: i32,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }

    pub fn refundable_quantity(&self) -> i32 {
        self.quantity - self.refunded_quantity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub order_no: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub version: i64,

    // Amounts
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub shipping_fee: Decimal,
    pub payable_amount: Decimal,
    pub paid_amount: Decimal,
    pub refund_amount: Decimal,

    pub shipping: ShippingAddress,
    pub remark: Option<String>,
    pub cancel_reason: Option<String>,

    // Lifecycle timestamps
    pub ordered_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,

    // Deadlines
    pub pay_expire_at: DateTime<Utc>,
    pub receive_expire_at: Option<DateTime<Utc>>,
    pub review_expire_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Amount the buyer still owes.
    pub fn outstanding(&self) -> Decimal {
        (self.payable_amount - self.paid_amount).max(Decimal::ZERO)
    }

    /// Captured money that has not been returned yet.
    pub fn refundable(&self) -> Decimal {
        (self.paid_amount - self.refund_amount).max(Decimal::ZERO)
    }

    pub fn is_fully_paid(&self) -> bool {
        self.paid_amount >= self.payable_amount
    }

    pub fn is_fully_refunded(&self) -> bool {
        self.refund_amount >= self.paid_amount
    }

    /// `cancelled` is terminal only once nothing captured is left to refund.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            OrderStatus::Completed | OrderStatus::Refunded | OrderStatus::Closed => true,
            OrderStatus::Cancelled => self.refundable().is_zero(),
            _ => false,
        }
    }

    pub fn item(&self, item_id: Uuid) -> Option<&OrderItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Option<&mut OrderItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn check_invariants(&self) -> Result<(), OrderError> {
        let amounts_ok = self.paid_amount >= Decimal::ZERO
            && self.paid_amount <= self.payable_amount
            && self.refund_amount >= Decimal::ZERO
            && self.refund_amount <= self.paid_amount;

        if !amounts_ok {
            return Err(OrderError::AmountInvariant {
                payable: self.payable_amount,
                paid: self.paid_amount,
                refunded: self.refund_amount,
            });
        }

        if let Some(item) = self
            .items
            .iter()
            .find(|item| item.refunded_quantity < 0 || item.refunded_quantity > item.quantity)
        {
            return Err(OrderError::ItemQuantityInvariant {
                item_id: item.id,
                refunded: item.refunded_quantity,
                quantity: item.quantity,
            });
        }

        Ok(())
    }
}

/// Append-only audit record of one status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusLog {
    pub id: Uuid,
    pub order_id: Uuid,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub operator: Operator,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderStatusLog {
    pub fn new(
        order_id: Uuid,
        from_status: Option<OrderStatus>,
        to_status: OrderStatus,
        operator: Operator,
        reason: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            from_status,
            to_status,
            operator,
            reason,
            created_at,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_order;

    #[test]
    fn test_outstanding_and_refundable() {
        let mut order = sample_order(Decimal::from(100));
        assert_eq!(order.outstanding(), Decimal::from(100));
        assert_eq!(order.refundable(), Decimal::ZERO);

        order.paid_amount = Decimal::from(60);
        order.refund_amount = Decimal::from(15);
        assert_eq!(order.outstanding(), Decimal::from(40));
        assert_eq!(order.refundable(), Decimal::from(45));
        assert!(!order.is_fully_paid());
    }

    #[test]
    fn test_invariants_reject_overpayment() {
        let mut order = sample_order(Decimal::from(100));
        order.paid_amount = Decimal::from(101);
        assert!(matches!(order.check_invariants(), Err(OrderError::AmountInvariant { .. })));
    }

    #[test]
    fn test_invariants_reject_refund_beyond_paid() {
        let mut order = sample_order(Decimal::from(100));
        order.paid_amount = Decimal::from(50);
        order.refund_amount = Decimal::from(51);
        assert!(order.check_invariants().is_err());

        order.refund_amount = Decimal::from(50);
        assert!(order.check_invariants().is_ok());
    }

    #[test]
    fn test_invariants_bound_item_refunds() {
        let mut order = sample_order(Decimal::from(100));
        order.items[0].refunded_quantity = order.items[0].quantity + 1;
        assert!(matches!(
            order.check_invariants(),
            Err(OrderError::ItemQuantityInvariant { .. })
        ));
    }

    #[test]
    fn test_cancelled_is_terminal_only_without_captured_money() {
        let mut order = sample_order(Decimal::from(100));
        order.status = OrderStatus::Cancelled;
        assert!(order.is_terminal());

        order.paid_amount = Decimal::from(100);
        assert!(!order.is_terminal());
    }
}
