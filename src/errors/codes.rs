//! Stable error codes surfaced at the service boundary.
//!
//! Codes are grouped by category:
//! - 1xxx: Validation
//! - 4xxx: Order
//! - 5xxx: Payment
//! - 6xxx: Product / stock
//! - 7xxx: After-sale
//! - 8xxx: Shipment
//! - 9xxx: System

use actix_web::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 1xxx: Validation ====================
    ValidationFailed = 1001,
    EmptyCart = 1002,

    // ==================== 4xxx: Order ====================
    OrderNotFound = 4001,
    /// Transition not in the legal graph
    OrderStatusError = 4002,
    /// Transition legal but its guard does not hold
    OrderConditionFailed = 4003,
    OrderAccessDenied = 4004,
    ConcurrentModification = 4005,
    ResourceBusy = 4006,

    // ==================== 5xxx: Payment ====================
    PaymentFailed = 5001,
    PaymentNotFound = 5002,
    PaymentInProgress = 5003,
    PaymentAmountMismatch = 5004,
    PaymentStatusError = 5005,
    InsufficientBalance = 5006,
    RefundExceedsRefundable = 5007,
    GatewayUnavailable = 5008,

    // ==================== 6xxx: Product ====================
    ProductUnavailable = 6001,
    InsufficientStock = 6002,

    // ==================== 7xxx: After-sale ====================
    AfterSaleNotFound = 7001,
    AfterSaleStatusError = 7002,
    AfterSaleAlreadyOpen = 7003,
    AfterSaleNotEligible = 7004,

    // ==================== 8xxx: Shipment ====================
    ShipmentNotFound = 8001,
    ShipmentExists = 8002,

    // ==================== 9xxx: System ====================
    InternalError = 9001,
    DatabaseError = 9002,
    LockBackendError = 9003,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 27] = [
        ErrorCode::ValidationFailed,
        ErrorCode::EmptyCart,
        ErrorCode::OrderNotFound,
        ErrorCode::OrderStatusError,
        ErrorCode::OrderConditionFailed,
        ErrorCode::OrderAccessDenied,
        ErrorCode::ConcurrentModification,
        ErrorCode::ResourceBusy,
        ErrorCode::PaymentFailed,
        ErrorCode::PaymentNotFound,
        ErrorCode::PaymentInProgress,
        ErrorCode::PaymentAmountMismatch,
        ErrorCode::PaymentStatusError,
        ErrorCode::InsufficientBalance,
        ErrorCode::RefundExceedsRefundable,
        ErrorCode::GatewayUnavailable,
        ErrorCode::ProductUnavailable,
        ErrorCode::InsufficientStock,
        ErrorCode::AfterSaleNotFound,
        ErrorCode::AfterSaleStatusError,
        ErrorCode::AfterSaleAlreadyOpen,
        ErrorCode::AfterSaleNotEligible,
        ErrorCode::ShipmentNotFound,
        ErrorCode::ShipmentExists,
        ErrorCode::InternalError,
        ErrorCode::DatabaseError,
        ErrorCode::LockBackendError,
    ];

    pub const fn code(&self) -> u16 {
        *self as u16
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::EmptyCart => "EMPTY_CART",
            ErrorCode::OrderNotFound => "ORDER_NOT_FOUND",
            ErrorCode::OrderStatusError => "ORDER_STATUS_ERROR",
            ErrorCode::OrderConditionFailed => "ORDER_CONDITION_FAILED",
            ErrorCode::OrderAccessDenied => "ORDER_ACCESS_DENIED",
            ErrorCode::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ErrorCode::ResourceBusy => "RESOURCE_BUSY",
            ErrorCode::PaymentFailed => "PAYMENT_FAILED",
            ErrorCode::PaymentNotFound => "PAYMENT_NOT_FOUND",
            ErrorCode::PaymentInProgress => "PAYMENT_IN_PROGRESS",
            ErrorCode::PaymentAmountMismatch => "PAYMENT_AMOUNT_MISMATCH",
            ErrorCode::PaymentStatusError => "PAYMENT_STATUS_ERROR",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::RefundExceedsRefundable => "REFUND_EXCEEDS_REFUNDABLE",
            ErrorCode::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ErrorCode::ProductUnavailable => "PRODUCT_UNAVAILABLE",
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::AfterSaleNotFound => "AFTER_SALE_NOT_FOUND",
            ErrorCode::AfterSaleStatusError => "AFTER_SALE_STATUS_ERROR",
            ErrorCode::AfterSaleAlreadyOpen => "AFTER_SALE_ALREADY_OPEN",
            ErrorCode::AfterSaleNotEligible => "AFTER_SALE_NOT_ELIGIBLE",
            ErrorCode::ShipmentNotFound => "SHIPMENT_NOT_FOUND",
            ErrorCode::ShipmentExists => "SHIPMENT_EXISTS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::LockBackendError => "LOCK_BACKEND_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::EmptyCart => StatusCode::BAD_REQUEST,

            Self::OrderNotFound
            | Self::PaymentNotFound
            | Self::AfterSaleNotFound
            | Self::ShipmentNotFound => StatusCode::NOT_FOUND,

            Self::OrderAccessDenied => StatusCode::FORBIDDEN,

            Self::ConcurrentModification
            | Self::PaymentInProgress
            | Self::AfterSaleAlreadyOpen
            | Self::ShipmentExists => StatusCode::CONFLICT,

            Self::ResourceBusy => StatusCode::LOCKED,

            Self::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,

            Self::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            Self::InternalError | Self::DatabaseError | Self::LockBackendError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            // Business-rule violations
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid error code: {0}")]
pub struct InvalidErrorCode(pub u16);

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.code() == value)
            .ok_or(InvalidErrorCode(value))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<u16> = ErrorCode::ALL.iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), ErrorCode::ALL.len());
    }

    #[test]
    fn test_codes_sit_in_their_category() {
        assert_eq!(ErrorCode::ValidationFailed.code() / 1000, 1);
        assert_eq!(ErrorCode::OrderStatusError.code() / 1000, 4);
        assert_eq!(ErrorCode::PaymentFailed.code() / 1000, 5);
        assert_eq!(ErrorCode::InsufficientStock.code() / 1000, 6);
        assert_eq!(ErrorCode::AfterSaleNotFound.code() / 1000, 7);
        assert_eq!(ErrorCode::ShipmentExists.code() / 1000, 8);
        assert_eq!(ErrorCode::DatabaseError.code() / 1000, 9);
    }

    #[test]
    fn test_serializes_as_number() {
        assert_eq!(serde_json::to_string(&ErrorCode::OrderNotFound).unwrap(), "4001");
        let code: ErrorCode = serde_json::from_str("6002").unwrap();
        assert_eq!(code, ErrorCode::InsufficientStock);
        assert!(serde_json::from_str::<ErrorCode>("4999").is_err());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::OrderNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ConcurrentModification.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::InsufficientStock.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorCode::GatewayUnavailable.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
