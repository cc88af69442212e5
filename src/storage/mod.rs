// ============================================================================
// Storage - Authoritative order state
// ============================================================================
//
// Reads are plain lookups. Every write goes through `commit`, which applies
// one `ChangeSet` atomically:
//
//   1. conditional write of the order row (version = expected), or insert
//   2. order item counters
//   3. status log entries (append only)
//   4. conditional stock movements
//   5. payment / after-sale / shipment rows
//   6. conditional balance movements
//
// Any failure in any step leaves storage exactly as it was.
//
// ============================================================================

pub mod memory;
pub mod postgres;

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::after_sale::OrderAfterSale;
use crate::domain::order::{Order, OrderStatus, OrderStatusLog};
use crate::domain::payment::OrderPayment;
use crate::domain::shipment::{OrderShipment, TrackingEvent};
use crate::domain::stock::{Sku, StockMovement};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order {order_id} was modified concurrently (expected version {expected})")]
    VersionConflict { order_id: Uuid, expected: i64 },

    #[error("Insufficient stock for SKU {sku_id}: requested {requested}, available {available}")]
    InsufficientStock { sku_id: Uuid, requested: i64, available: i64 },

    #[error("Unknown SKU {0}")]
    UnknownSku(Uuid),

    #[error("Insufficient balance for user {user_id}: required {required}, available {available}")]
    InsufficientBalance { user_id: Uuid, required: Decimal, available: Decimal },

    #[error("Duplicate {0}")]
    Duplicate(String),

    #[error("Missing {0}")]
    Missing(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub enum PaymentWrite {
    Insert(OrderPayment),
    Update(OrderPayment),
}

#[derive(Debug, Clone)]
pub enum AfterSaleWrite {
    Insert(OrderAfterSale),
    Update(OrderAfterSale),
}

#[derive(Debug, Clone)]
pub enum ShipmentWrite {
    Insert(OrderShipment),
    /// New events to append plus the refreshed headline status
    Append { shipment: OrderShipment, events: Vec<TrackingEvent> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceDirection {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceMovement {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub direction: BalanceDirection,
}

/// Everything one mutation writes, committed in a single transaction.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub order: Order,
    /// Version the write is conditional on; 0 inserts a new order.
    pub expected_version: i64,
    pub status_logs: Vec<OrderStatusLog>,
    pub stock: Vec<StockMovement>,
    pub payments: Vec<PaymentWrite>,
    pub after_sales: Vec<AfterSaleWrite>,
    pub shipment: Option<ShipmentWrite>,
    pub balance: Vec<BalanceMovement>,
}

impl ChangeSet {
    pub fn insert(mut order: Order) -> Self {
        order.version = 1;
        Self::with_order(order, 0)
    }

    /// Conditional update of an order loaded at `order.version`.
    pub fn update(mut order: Order) -> Self {
        let expected = order.version;
        order.version = expected + 1;
        Self::with_order(order, expected)
    }

    fn with_order(order: Order, expected_version: i64) -> Self {
        Self {
            order,
            expected_version,
            status_logs: Vec::new(),
            stock: Vec::new(),
            payments: Vec::new(),
            after_sales: Vec::new(),
            shipment: None,
            balance: Vec::new(),
        }
    }

    pub fn is_insert(&self) -> bool {
        self.expected_version == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderQuery {
    pub user_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    /// 1-based
    pub page: u32,
    pub page_size: u32,
}

impl OrderQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderStats {
    pub total_orders: u64,
    pub by_status: BTreeMap<String, u64>,
    pub paid_amount: Decimal,
    pub refund_amount: Decimal,
}

/// Deadline sweeps run by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueKind {
    /// pending, pay_expire_at elapsed
    PaymentExpired,
    /// delivered, receive_expire_at elapsed
    ReceiveOverdue,
    /// received, review_expire_at elapsed
    ReviewOverdue,
}

impl DueKind {
    pub fn status(&self) -> OrderStatus {
        match self {
            DueKind::PaymentExpired => OrderStatus::Pending,
            DueKind::ReceiveOverdue => OrderStatus::Delivered,
            DueKind::ReviewOverdue => OrderStatus::Received,
        }
    }

    pub fn deadline(&self, order: &Order) -> Option<DateTime<Utc>> {
        match self {
            DueKind::PaymentExpired => Some(order.pay_expire_at),
            DueKind::ReceiveOverdue => order.receive_expire_at,
            DueKind::ReviewOverdue => order.review_expire_at,
        }
    }

    pub fn is_due(&self, order: &Order, now: DateTime<Utc>) -> bool {
        order.status == self.status() && self.deadline(order).is_some_and(|at| at <= now)
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn list_orders(&self, query: &OrderQuery) -> Result<OrderPage, StoreError>;

    async fn order_stats(&self, user_id: Option<Uuid>) -> Result<OrderStats, StoreError>;

    /// Status log in insertion order.
    async fn status_history(&self, order_id: Uuid) -> Result<Vec<OrderStatusLog>, StoreError>;

    async fn skus(&self, sku_ids: &[Uuid]) -> Result<Vec<Sku>, StoreError>;

    /// Payments for an order in creation order.
    async fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<OrderPayment>, StoreError>;

    async fn payment_by_no(&self, payment_no: &str) -> Result<Option<OrderPayment>, StoreError>;

    /// After-sale requests for an order in creation order.
    async fn after_sales_for_order(&self, order_id: Uuid) -> Result<Vec<OrderAfterSale>, StoreError>;

    async fn after_sale(&self, after_sale_id: Uuid) -> Result<Option<OrderAfterSale>, StoreError>;

    async fn shipment_for_order(&self, order_id: Uuid) -> Result<Option<OrderShipment>, StoreError>;

    async fn shipment_by_tracking(
        &self,
        carrier_code: &str,
        tracking_no: &str,
    ) -> Result<Option<OrderShipment>, StoreError>;

    async fn balance(&self, user_id: Uuid) -> Result<Decimal, StoreError>;

    /// Ids of orders whose `kind` deadline has passed, oldest deadline first.
    /// Review-overdue orders with an open after-sale request are left out.
    async fn due_orders(&self, kind: DueKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>, StoreError>;

    /// Apply the change set atomically; returns the order's new version.
    async fn commit(&self, changes: ChangeSet) -> Result<i64, StoreError>;
}
