use chrono::{DateTime, Duration, Utc};

use crate::domain::stock::{restorations_for, StockMovement};
use super::aggregate::{Order, OrderStatusLog};
use super::errors::OrderError;
use super::value_objects::{Operator, OrderStatus};

// ============================================================================
// Order State Machine
// ============================================================================
//
// The legal-transition graph is a static table of (from, to) -> {guard,
// effect}. A pair missing from the table is an IllegalTransition; a pair whose
// guard does not hold is a TransitionConditionFailed. In both cases the order
// is left untouched.
//
//   pending   -> paid*, cancelled, closed-
//   paid      -> shipped*, cancelled, refunding+
//   shipped   -> delivered, received, refunding+
//   delivered -> received, refunding+
//   received  -> completed, refunding+
//   cancelled -> refunding+
//   refunding -> refunded#
//
//   * fully paid   - nothing captured   + refund outstanding   # fully refunded
//
// ============================================================================

/// Pure predicate over the current order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    FullyPaid,
    NothingPaid,
    RefundOutstanding,
    FullyRefunded,
}

impl Guard {
    pub fn holds(&self, order: &Order) -> bool {
        match self {
            Guard::Always => true,
            Guard::FullyPaid => order.is_fully_paid(),
            Guard::NothingPaid => order.paid_amount.is_zero(),
            Guard::RefundOutstanding => !order.refundable().is_zero(),
            Guard::FullyRefunded => order.is_fully_refunded(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Guard::Always => "always",
            Guard::FullyPaid => "paid amount must cover the payable amount",
            Guard::NothingPaid => "order already holds a captured payment",
            Guard::RefundOutstanding => "order has no captured amount left to refund",
            Guard::FullyRefunded => "refunded amount must cover the paid amount",
        }
    }
}

/// Side effect applied to the order when a transition is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    MarkPaid,
    MarkShipped,
    MarkDelivered,
    MarkReceived,
    MarkCompleted,
    Cancel,
    Close,
    BeginRefund,
    MarkRefunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub guard: Guard,
    pub effect: Effect,
}

const fn rule(from: OrderStatus, to: OrderStatus, guard: Guard, effect: Effect) -> TransitionRule {
    TransitionRule { from, to, guard, effect }
}

use OrderStatus::*;

pub static TRANSITIONS: &[TransitionRule] = &[
    rule(Pending, Paid, Guard::FullyPaid, Effect::MarkPaid),
    rule(Pending, Cancelled, Guard::Always, Effect::Cancel),
    rule(Pending, Closed, Guard::NothingPaid, Effect::Close),
    rule(Paid, Shipped, Guard::FullyPaid, Effect::MarkShipped),
    rule(Paid, Cancelled, Guard::Always, Effect::Cancel),
    rule(Paid, Refunding, Guard::RefundOutstanding, Effect::BeginRefund),
    rule(Shipped, Delivered, Guard::Always, Effect::MarkDelivered),
    rule(Shipped, Received, Guard::Always, Effect::MarkReceived),
    rule(Shipped, Refunding, Guard::RefundOutstanding, Effect::BeginRefund),
    rule(Delivered, Received, Guard::Always, Effect::MarkReceived),
    rule(Delivered, Refunding, Guard::RefundOutstanding, Effect::BeginRefund),
    rule(Received, Completed, Guard::Always, Effect::MarkCompleted),
    rule(Received, Refunding, Guard::RefundOutstanding, Effect::BeginRefund),
    rule(Cancelled, Refunding, Guard::RefundOutstanding, Effect::BeginRefund),
    rule(Refunding, Refunded, Guard::FullyRefunded, Effect::MarkRefunded),
];

pub fn find_rule(from: OrderStatus, to: OrderStatus) -> Option<&'static TransitionRule> {
    TRANSITIONS.iter().find(|r| r.from == from && r.to == to)
}

pub fn allowed_targets(from: OrderStatus) -> Vec<OrderStatus> {
    TRANSITIONS.iter().filter(|r| r.from == from).map(|r| r.to).collect()
}

/// Deadline windows stamped by transition effects.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPolicy {
    pub receive_window: Duration,
    pub review_window: Duration,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            receive_window: Duration::days(7),
            review_window: Duration::days(15),
        }
    }
}

/// What a successful transition asks the commit to persist besides the order.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub log: OrderStatusLog,
    pub stock: Vec<StockMovement>,
}

pub struct OrderStateMachine;

impl OrderStateMachine {
    pub fn can_transition(order: &Order, to: OrderStatus) -> bool {
        find_rule(order.status, to).is_some_and(|r| r.guard.holds(order))
    }

    /// Validate and apply one transition on an in-memory order.
    ///
    /// Nothing is persisted here; the caller commits the mutated order together
    /// with the returned log entry and stock movements.
    pub fn transition(
        order: &mut Order,
        to: OrderStatus,
        policy: &TransitionPolicy,
        operator: Operator,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, OrderError> {
        let from = order.status;
        let rule = find_rule(from, to).ok_or(OrderError::IllegalTransition { from, to })?;

        if !rule.guard.holds(order) {
            return Err(OrderError::TransitionConditionFailed {
                from,
                to,
                guard: rule.guard.describe(),
            });
        }

        let stock = Self::apply_effect(order, rule.effect, policy, now);
        order.status = to;
        order.updated_at = now;

        Ok(TransitionOutcome {
            log: OrderStatusLog::new(order.id, Some(from), to, operator, reason, now),
            stock,
        })
    }

    fn apply_effect(
        order: &mut Order,
        effect: Effect,
        policy: &TransitionPolicy,
        now: DateTime<Utc>,
    ) -> Vec<StockMovement> {
        match effect {
            Effect::MarkPaid => {
                order.paid_at = Some(now);
                Vec::new()
            }
            Effect::MarkShipped => {
                order.shipped_at = Some(now);
                order.receive_expire_at = Some(now + policy.receive_window);
                Vec::new()
            }
            Effect::MarkDelivered => {
                order.delivered_at = Some(now);
                order.review_expire_at = Some(now + policy.review_window);
                Vec::new()
            }
            Effect::MarkReceived => {
                order.received_at = Some(now);
                if order.review_expire_at.is_none() {
                    order.review_expire_at = Some(now + policy.review_window);
                }
                Vec::new()
            }
            Effect::MarkCompleted => {
                order.finished_at = Some(now);
                Vec::new()
            }
            Effect::Cancel => {
                order.cancelled_at = Some(now);
                restorations_for(&order.items)
            }
            Effect::Close => {
                order.cancelled_at = Some(now);
                order.finished_at = Some(now);
                restorations_for(&order.items)
            }
            Effect::BeginRefund => Vec::new(),
            Effect::MarkRefunded => {
                order.refunded_at = Some(now);
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
