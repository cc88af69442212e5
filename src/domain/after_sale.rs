use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::{Order, OrderStatus};

// ============================================================================
// After-Sale Workflow
// ============================================================================
//
//   pending  -> approved | rejected
//   approved -> completed              (refund)
//   approved -> returning -> completed (return, exchange)
//
// `completed` additionally requires the approved refund to be fully issued.
// `rejected` and `completed` are terminal; a new request may be filed.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterSaleKind {
    Refund,
    Return,
    Exchange,
}

impl AfterSaleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AfterSaleKind::Refund => "refund",
            AfterSaleKind::Return => "return",
            AfterSaleKind::Exchange => "exchange",
        }
    }

    pub fn needs_physical_return(&self) -> bool {
        !matches!(self, AfterSaleKind::Refund)
    }

    /// Order states a request of this kind may be filed against.
    pub fn eligible_order_states(&self) -> &'static [OrderStatus] {
        match self {
            AfterSaleKind::Refund => &[
                OrderStatus::Paid,
                OrderStatus::Shipped,
                OrderStatus::Delivered,
                OrderStatus::Received,
            ],
            AfterSaleKind::Return | AfterSaleKind::Exchange => {
                &[OrderStatus::Delivered, OrderStatus::Received]
            }
        }
    }
}

impl fmt::Display for AfterSaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AfterSaleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refund" => Ok(AfterSaleKind::Refund),
            "return" => Ok(AfterSaleKind::Return),
            "exchange" => Ok(AfterSaleKind::Exchange),
            other => Err(format!("unknown after-sale kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterSaleStatus {
    Pending,
    Approved,
    Rejected,
    Returning,
    Completed,
}

impl AfterSaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AfterSaleStatus::Pending => "pending",
            AfterSaleStatus::Approved => "approved",
            AfterSaleStatus::Rejected => "rejected",
            AfterSaleStatus::Returning => "returning",
            AfterSaleStatus::Completed => "completed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            AfterSaleStatus::Pending | AfterSaleStatus::Approved | AfterSaleStatus::Returning
        )
    }
}

impl fmt::Display for AfterSaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AfterSaleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AfterSaleStatus::Pending),
            "approved" => Ok(AfterSaleStatus::Approved),
            "rejected" => Ok(AfterSaleStatus::Rejected),
            "returning" => Ok(AfterSaleStatus::Returning),
            "completed" => Ok(AfterSaleStatus::Completed),
            other => Err(format!("unknown after-sale status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AfterSaleError {
    #[error("Illegal after-sale transition: {from} -> {to}")]
    IllegalTransition { from: AfterSaleStatus, to: AfterSaleStatus },

    #[error("A {kind} request cannot move to {to}")]
    KindMismatch { kind: AfterSaleKind, to: AfterSaleStatus },

    #[error("Refund incomplete: {refunded} of {amount} issued")]
    RefundIncomplete { amount: Decimal, refunded: Decimal },
}

struct AfterSaleRule {
    from: AfterSaleStatus,
    to: AfterSaleStatus,
    kinds: &'static [AfterSaleKind],
}

const ANY_KIND: &[AfterSaleKind] = &[AfterSaleKind::Refund, AfterSaleKind::Return, AfterSaleKind::Exchange];
const PHYSICAL: &[AfterSaleKind] = &[AfterSaleKind::Return, AfterSaleKind::Exchange];

static AFTER_SALE_TRANSITIONS: &[AfterSaleRule] = &[
    AfterSaleRule { from: AfterSaleStatus::Pending, to: AfterSaleStatus::Approved, kinds: ANY_KIND },
    AfterSaleRule { from: AfterSaleStatus::Pending, to: AfterSaleStatus::Rejected, kinds: ANY_KIND },
    AfterSaleRule { from: AfterSaleStatus::Approved, to: AfterSaleStatus::Completed, kinds: &[AfterSaleKind::Refund] },
    AfterSaleRule { from: AfterSaleStatus::Approved, to: AfterSaleStatus::Returning, kinds: PHYSICAL },
    AfterSaleRule { from: AfterSaleStatus::Returning, to: AfterSaleStatus::Completed, kinds: PHYSICAL },
];

/// Units of one order line covered by an order-level return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnLine {
    pub order_item_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAfterSale {
    pub id: Uuid,
    pub after_sale_no: String,
    pub order_id: Uuid,
    pub order_item_id: Option<Uuid>,
    pub user_id: Uuid,
    pub kind: AfterSaleKind,
    pub status: AfterSaleStatus,
    pub reason: String,
    pub amount: Decimal,
    pub refunded_amount: Decimal,
    pub quantity: i32,
    /// Filled at approval of an order-level return; empty otherwise
    pub lines: Vec<ReturnLine>,
    pub evidence: Vec<String>,
    pub return_carrier: Option<String>,
    pub return_tracking_no: Option<String>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OrderAfterSale {
    pub fn outstanding_refund(&self) -> Decimal {
        (self.amount - self.refunded_amount).max(Decimal::ZERO)
    }

    /// Whether an open request on the same order blocks a new one scoped to `item`.
    pub fn conflicts_with(&self, item: Option<Uuid>) -> bool {
        if !self.status.is_open() {
            return false;
        }
        match (self.order_item_id, item) {
            (None, _) | (_, None) => true,
            (Some(existing), Some(requested)) => existing == requested,
        }
    }

    pub fn transition(&mut self, to: AfterSaleStatus, now: DateTime<Utc>) -> Result<(), AfterSaleError> {
        let from = self.status;
        let rule = AFTER_SALE_TRANSITIONS
            .iter()
            .find(|r| r.from == from && r.to == to)
            .ok_or(AfterSaleError::IllegalTransition { from, to })?;

        if !rule.kinds.contains(&self.kind) {
            return Err(AfterSaleError::KindMismatch { kind: self.kind, to });
        }

        if to == AfterSaleStatus::Completed && !self.outstanding_refund().is_zero() {
            return Err(AfterSaleError::RefundIncomplete {
                amount: self.amount,
                refunded: self.refunded_amount,
            });
        }

        match to {
            AfterSaleStatus::Approved => self.approved_at = Some(now),
            AfterSaleStatus::Completed => self.completed_at = Some(now),
            AfterSaleStatus::Returning => self.returned_at = Some(now),
            AfterSaleStatus::Pending | AfterSaleStatus::Rejected => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Every unit of `order` not yet refunded or returned, one line per item.
pub fn returnable_lines(order: &Order) -> Vec<ReturnLine> {
    order
        .items
        .iter()
        .filter(|item| item.refundable_quantity() > 0)
        .map(|item| ReturnLine {
            order_item_id: item.id,
            quantity: item.refundable_quantity(),
        })
        .collect()
}

/// Largest amount a new request against `order` may ask for.
pub fn refund_ceiling(order: &Order) -> Decimal {
    order.refundable()
}
