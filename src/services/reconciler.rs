use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::lifecycle::{OrderMutation, Planned};
use super::orders::{cancel_into, settle_after_cancel};
use super::AppContext;
use crate::domain::order::{Operator, Order, OrderStatus};
use crate::errors::AppError;
use crate::storage::{ChangeSet, DueKind};

// ============================================================================
// Expiry Reconciler
// ============================================================================
//
// One sweep = three passes over orders whose deadline has elapsed:
//
//   pending   past pay_expire_at      -> cancelled (stock restored)
//   delivered past receive_expire_at  -> received
//   received  past review_expire_at   -> completed (unless an after-sale is open)
//
// Each order goes through the normal mutation pipeline, so an order a user is
// acting on right now is skipped (lock busy) or re-checked after reload. A
// failed order is counted and the sweep moves on.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cancelled: u64,
    pub auto_received: u64,
    pub auto_completed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SweepReport {
    pub fn touched(&self) -> u64 {
        self.cancelled + self.auto_received + self.auto_completed
    }

    fn record(&mut self, kind: DueKind) {
        match kind {
            DueKind::PaymentExpired => self.cancelled += 1,
            DueKind::ReceiveOverdue => self.auto_received += 1,
            DueKind::ReviewOverdue => self.auto_completed += 1,
        }
    }
}

fn action_label(kind: DueKind) -> &'static str {
    match kind {
        DueKind::PaymentExpired => "cancelled",
        DueKind::ReceiveOverdue => "auto_received",
        DueKind::ReviewOverdue => "auto_completed",
    }
}

#[derive(Clone)]
pub struct ExpiryReconciler {
    ctx: Arc<AppContext>,
    running: Arc<Mutex<()>>,
}

impl ExpiryReconciler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub async fn sweep(&self) -> Option<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`. Returns `None` when a previous sweep in this
    /// process is still running.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Previous sweep still running, skipping tick");
            return None;
        };

        let mut report = SweepReport::default();
        for kind in [DueKind::PaymentExpired, DueKind::ReceiveOverdue, DueKind::ReviewOverdue] {
            self.sweep_kind(kind, now, &mut report).await;
        }

        for (action, count) in [
            ("cancelled", report.cancelled),
            ("auto_received", report.auto_received),
            ("auto_completed", report.auto_completed),
            ("skipped", report.skipped),
            ("failed", report.failed),
        ] {
            if count > 0 {
                self.ctx.metrics.record_reconciler_action(action, count);
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                cancelled = report.cancelled,
                auto_received = report.auto_received,
                auto_completed = report.auto_completed,
                skipped = report.skipped,
                failed = report.failed,
                "Expiry sweep finished"
            );
        }
        Some(report)
    }

    async fn sweep_kind(&self, kind: DueKind, now: DateTime<Utc>, report: &mut SweepReport) {
        let batch_size = self.ctx.config.reconciler.batch_size;
        let due = match self.ctx.store.due_orders(kind, now, batch_size).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(action = action_label(kind), error = %e, "Could not query due orders");
                report.failed += 1;
                return;
            }
        };

        for order_id in due {
            let expire = ExpireOrder { kind, as_of: now };
            match self.ctx.execute(order_id, &expire).await {
                Ok(executed) if executed.output => {
                    report.record(kind);
                    if kind == DueKind::PaymentExpired {
                        self.refund_cancelled(executed.order).await;
                    }
                }
                Ok(_) => report.skipped += 1,
                Err(AppError::ResourceBusy(_) | AppError::ConcurrentModification(_)) => {
                    tracing::debug!(order_id = %order_id, action = action_label(kind), "Order busy, left for next sweep");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(order_id = %order_id, action = action_label(kind), error = %e, "Expiry action failed");
                    report.failed += 1;
                }
            }
        }
    }

    /// An expired order can still hold a partial capture from a split payment.
    async fn refund_cancelled(&self, order: Order) {
        let order_id = order.id;
        match settle_after_cancel(&self.ctx, order, Operator::system(), Some("payment timeout".into())).await {
            Ok(outcome) if outcome.refund_pending => {
                tracing::warn!(order_id = %order_id, "Expired order refund left outstanding");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(order_id = %order_id, error = %e, "Expired order refund failed"),
        }
    }
}

/// Apply the deadline action if, after reloading under the lock, the order is
/// still due. Outputs whether anything was done.
struct ExpireOrder {
    kind: DueKind,
    as_of: DateTime<Utc>,
}

#[async_trait]
impl OrderMutation for ExpireOrder {
    type Output = bool;

    fn operation(&self) -> &'static str {
        match self.kind {
            DueKind::PaymentExpired => "expire_payment",
            DueKind::ReceiveOverdue => "auto_receive",
            DueKind::ReviewOverdue => "auto_complete",
        }
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<bool>, AppError> {
        if !self.kind.is_due(&order, self.as_of) {
            return Ok(Planned::Unchanged { order, output: false });
        }

        match self.kind {
            DueKind::PaymentExpired => {
                let payments = ctx.store.payments_for_order(order.id).await?;
                let mut changes = ChangeSet::update(order);
                cancel_into(
                    ctx,
                    &mut changes,
                    payments,
                    Operator::system(),
                    Some("payment timeout".into()),
                    now,
                )?;
                Ok(Planned::Commit { changes, output: true })
            }
            DueKind::ReceiveOverdue => {
                let mut changes = ChangeSet::update(order);
                ctx.advance(
                    &mut changes,
                    OrderStatus::Received,
                    Operator::system(),
                    Some("receive window elapsed".into()),
                    now,
                )?;
                Ok(Planned::Commit { changes, output: true })
            }
            DueKind::ReviewOverdue => {
                let after_sales = ctx.store.after_sales_for_order(order.id).await?;
                if after_sales.iter().any(|r| r.status.is_open()) {
                    return Ok(Planned::Unchanged { order, output: false });
                }
                let mut changes = ChangeSet::update(order);
                ctx.advance(
                    &mut changes,
                    OrderStatus::Completed,
                    Operator::system(),
                    Some("review window elapsed".into()),
                    now,
                )?;
                Ok(Planned::Commit { changes, output: true })
            }
        }
    }
}
