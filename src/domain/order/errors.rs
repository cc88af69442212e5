use rust_decimal::Decimal;

use super::value_objects::OrderStatus;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderError {
    #[error("Illegal order transition: {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("Transition {from} -> {to} rejected: {guard}")]
    TransitionConditionFailed {
        from: OrderStatus,
        to: OrderStatus,
        guard: &'static str,
    },

    #[error("Order amounts out of bounds: payable {payable}, paid {paid}, refunded {refunded}")]
    AmountInvariant {
        payable: Decimal,
        paid: Decimal,
        refunded: Decimal,
    },

    #[error("Item {item_id} refunded quantity {refunded} exceeds ordered quantity {quantity}")]
    ItemQuantityInvariant {
        item_id: uuid::Uuid,
        refunded: i32,
        quantity: i32,
    },

    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    #[error("Unknown operator type: {0}")]
    UnknownOperator(String),
}
