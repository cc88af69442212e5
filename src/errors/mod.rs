// ============================================================================
// Boundary Error
// ============================================================================
//
// Every service operation returns `AppError`. Domain, storage, lock and
// gateway errors fold into it; each variant maps to one stable `ErrorCode`.
//
// Validation    -> rejected before any lock or transaction
// Conflict      -> retried internally, then surfaced as retryable
// Business rule -> never retried, surfaced with the specific reason
// Dependency    -> caller should poll status rather than assume failure
//
// ============================================================================

pub mod codes;

pub use codes::ErrorCode;

use actix_web::http::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::concurrency::LockError;
use crate::domain::after_sale::AfterSaleError;
use crate::domain::order::OrderError;
use crate::gateway::GatewayError;
use crate::storage::StoreError;
use crate::utils::IsTransient;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Validation
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cart is empty")]
    EmptyCart,

    // Order
    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Order {0} does not belong to the caller")]
    OrderAccessDenied(Uuid),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("Order {0} is locked by another operation")]
    ResourceBusy(Uuid),

    #[error("Order {0} kept changing underneath the update; retry later")]
    ConcurrentModification(Uuid),

    /// One failed conditional write; retried by the optimistic guard.
    #[error("Order {order_id} version {expected} is stale")]
    VersionConflict { order_id: Uuid, expected: i64 },

    // Payment
    #[error("Payment {0} not found")]
    PaymentNotFound(String),

    #[error("Order {0} already has a pending payment")]
    PaymentInProgress(Uuid),

    #[error("Payment {payment_no} amount mismatch: expected {expected}, got {declared}")]
    PaymentAmountMismatch {
        payment_no: String,
        expected: Decimal,
        declared: Decimal,
    },

    #[error("Payment {payment_no} is {status}")]
    PaymentStatus { payment_no: String, status: String },

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Refund of {requested} exceeds refundable {refundable}")]
    RefundExceedsRefundable { requested: Decimal, refundable: Decimal },

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    // Product
    #[error("Product SKU {0} is unavailable")]
    ProductUnavailable(Uuid),

    #[error("Insufficient stock for SKU {sku_id}: requested {requested}, available {available}")]
    InsufficientStock {
        sku_id: Uuid,
        requested: i64,
        available: i64,
    },

    // After-sale
    #[error("After-sale request {0} not found")]
    AfterSaleNotFound(Uuid),

    #[error(transparent)]
    AfterSale(#[from] AfterSaleError),

    #[error("Order {0} already has an open after-sale request")]
    AfterSaleAlreadyOpen(Uuid),

    #[error("After-sale not allowed: {0}")]
    AfterSaleNotEligible(String),

    // Shipment
    #[error("Shipment {0} not found")]
    ShipmentNotFound(String),

    #[error("Order {0} already has a shipment")]
    ShipmentExists(Uuid),

    // System
    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Lock backend error: {0}")]
    LockBackend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub name: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation(_) => ErrorCode::ValidationFailed,
            AppError::EmptyCart => ErrorCode::EmptyCart,
            AppError::OrderNotFound(_) => ErrorCode::OrderNotFound,
            AppError::OrderAccessDenied(_) => ErrorCode::OrderAccessDenied,
            AppError::Order(err) => match err {
                OrderError::IllegalTransition { .. } => ErrorCode::OrderStatusError,
                OrderError::TransitionConditionFailed { .. } => ErrorCode::OrderConditionFailed,
                OrderError::AmountInvariant { .. } | OrderError::ItemQuantityInvariant { .. } => {
                    ErrorCode::InternalError
                }
                OrderError::UnknownStatus(_) | OrderError::UnknownOperator(_) => ErrorCode::ValidationFailed,
            },
            AppError::ResourceBusy(_) => ErrorCode::ResourceBusy,
            AppError::ConcurrentModification(_) | AppError::VersionConflict { .. } => {
                ErrorCode::ConcurrentModification
            }
            AppError::PaymentNotFound(_) => ErrorCode::PaymentNotFound,
            AppError::PaymentInProgress(_) => ErrorCode::PaymentInProgress,
            AppError::PaymentAmountMismatch { .. } => ErrorCode::PaymentAmountMismatch,
            AppError::PaymentStatus { .. } => ErrorCode::PaymentStatusError,
            AppError::PaymentFailed(_) => ErrorCode::PaymentFailed,
            AppError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            AppError::RefundExceedsRefundable { .. } => ErrorCode::RefundExceedsRefundable,
            AppError::GatewayUnavailable(_) => ErrorCode::GatewayUnavailable,
            AppError::ProductUnavailable(_) => ErrorCode::ProductUnavailable,
            AppError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            AppError::AfterSaleNotFound(_) => ErrorCode::AfterSaleNotFound,
            AppError::AfterSale(_) => ErrorCode::AfterSaleStatusError,
            AppError::AfterSaleAlreadyOpen(_) => ErrorCode::AfterSaleAlreadyOpen,
            AppError::AfterSaleNotEligible(_) => ErrorCode::AfterSaleNotEligible,
            AppError::ShipmentNotFound(_) => ErrorCode::ShipmentNotFound,
            AppError::ShipmentExists(_) => ErrorCode::ShipmentExists,
            AppError::Store(_) => ErrorCode::DatabaseError,
            AppError::LockBackend(_) => ErrorCode::LockBackendError,
            AppError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        self.code().http_status()
    }

    /// Whether the caller (client or gateway) should try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ResourceBusy(_)
                | AppError::ConcurrentModification(_)
                | AppError::VersionConflict { .. }
                | AppError::GatewayUnavailable(_)
                | AppError::Store(StoreError::Database(_))
                | AppError::LockBackend(_)
        )
    }

    pub fn to_body(&self) -> ErrorBody {
        let code = self.code();
        ErrorBody {
            code: code.code(),
            name: code.as_str(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

impl IsTransient for AppError {
    fn is_transient(&self) -> bool {
        matches!(self, AppError::VersionConflict { .. })
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { order_id, expected } => AppError::VersionConflict { order_id, expected },
            StoreError::InsufficientStock {
                sku_id,
                requested,
                available,
            } => AppError::InsufficientStock {
                sku_id,
                requested,
                available,
            },
            StoreError::UnknownSku(sku_id) => AppError::ProductUnavailable(sku_id),
            StoreError::InsufficientBalance { required, available, .. } => {
                AppError::InsufficientBalance { required, available }
            }
            other => AppError::Store(other),
        }
    }
}

impl From<LockError> for AppError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { key } => {
                let order_id = key
                    .rsplit(':')
                    .next()
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .unwrap_or_default();
                AppError::ResourceBusy(order_id)
            }
            LockError::Backend(message) => AppError::LockBackend(message),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Declined(reason) => AppError::PaymentFailed(reason),
            other => AppError::GatewayUnavailable(other.to_string()),
        }
    }
}
