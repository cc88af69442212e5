use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::lifecycle::{OrderMutation, Planned};
use super::AppContext;
use crate::domain::order::{Operator, Order, OrderError, OrderStatus};
use crate::domain::payment::{allocate_refund, OrderPayment, PaymentMethod, RefundSlice};
use crate::errors::AppError;
use crate::gateway::RefundRequest;
use crate::storage::{BalanceDirection, BalanceMovement, ChangeSet, PaymentWrite};
use crate::utils::ids;

// ============================================================================
// Refund Issuance
// ============================================================================
//
// A refund of `amount` is split across captured payments oldest first. The
// external slices are sent to their gateways before anything is booked; if any
// of them fails nothing is booked and the whole refund can be retried. Refund
// numbers are derived from (payment, source, sequence), so a retry presents the
// same numbers and the gateway deduplicates. Balance slices are credits in the
// same commit.
//
// A refund that returns everything still refundable drives the order through
// refunding -> refunded; a smaller one leaves the status alone.
//
// ============================================================================

impl AppContext {
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_refund(
        &self,
        changes: &mut ChangeSet,
        payments: &[OrderPayment],
        amount: Decimal,
        source: Uuid,
        operator: Operator,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefundSlice>, AppError> {
        let refundable = changes.order.refundable();
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(format!("refund amount must be positive, got {amount}")));
        }
        if amount > refundable {
            return Err(AppError::RefundExceedsRefundable {
                requested: amount,
                refundable,
            });
        }

        let slices = allocate_refund(payments, amount).ok_or(AppError::RefundExceedsRefundable {
            requested: amount,
            refundable,
        })?;

        for slice in slices.iter().filter(|s| s.method != PaymentMethod::Balance) {
            let payment = find_payment(payments, slice.payment_id)?;
            let request = RefundRequest {
                refund_no: ids::refund_no(&slice.payment_no, source, slice.sequence),
                payment_no: slice.payment_no.clone(),
                third_party_ref: payment.third_party_ref.clone(),
                amount: slice.amount,
            };
            self.gateways.refund(slice.method, &request).await?;
            tracing::info!(
                order_id = %changes.order.id,
                refund_no = %request.refund_no,
                amount = %slice.amount,
                "Gateway refund accepted"
            );
        }

        let settles_order = amount == refundable;
        if settles_order && changes.order.status != OrderStatus::Refunding {
            self.advance(changes, OrderStatus::Refunding, operator, reason.clone(), now)?;
        }

        changes.order.refund_amount += amount;
        for slice in &slices {
            let mut payment = find_payment(payments, slice.payment_id)?.clone();
            payment.record_refund(slice.amount, now);
            if slice.method == PaymentMethod::Balance {
                changes.balance.push(BalanceMovement {
                    user_id: payment.user_id,
                    amount: slice.amount,
                    direction: BalanceDirection::Credit,
                });
            }
            changes.payments.push(PaymentWrite::Update(payment));
        }

        if settles_order {
            self.advance(changes, OrderStatus::Refunded, operator, reason, now)?;
        }

        Ok(slices)
    }

    /// Return a capture that arrived for a payment the order no longer wants.
    /// The money never counts towards the order.
    pub async fn refund_orphan(&self, payment: &mut OrderPayment, now: DateTime<Utc>) -> Result<(), AppError> {
        let amount = payment.refundable();
        if amount.is_zero() {
            return Ok(());
        }
        if payment.method != PaymentMethod::Balance {
            let request = RefundRequest {
                refund_no: ids::refund_no(&payment.payment_no, payment.id, payment.refund_count.max(0) as u32),
                payment_no: payment.payment_no.clone(),
                third_party_ref: payment.third_party_ref.clone(),
                amount,
            };
            self.gateways.refund(payment.method, &request).await?;
        }
        payment.record_refund(amount, now);
        Ok(())
    }
}

fn find_payment(payments: &[OrderPayment], payment_id: Uuid) -> Result<&OrderPayment, AppError> {
    payments
        .iter()
        .find(|p| p.id == payment_id)
        .ok_or_else(|| AppError::Internal(format!("refund slice references unknown payment {payment_id}")))
}

/// Return whatever is still refundable on a cancelled order.
pub(crate) struct SettleRefund {
    pub operator: Operator,
    pub reason: Option<String>,
}

#[async_trait]
impl OrderMutation for SettleRefund {
    type Output = Decimal;

    fn operation(&self) -> &'static str {
        "settle_refund"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<Decimal>, AppError> {
        let refundable = order.refundable();
        if refundable.is_zero() {
            return Ok(Planned::Unchanged {
                order,
                output: Decimal::ZERO,
            });
        }
        if !matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunding) {
            return Err(OrderError::IllegalTransition {
                from: order.status,
                to: OrderStatus::Refunding,
            }
            .into());
        }

        let order_id = order.id;
        let payments = ctx.store.payments_for_order(order_id).await?;
        let mut changes = ChangeSet::update(order);
        ctx.apply_refund(
            &mut changes,
            &payments,
            refundable,
            order_id,
            self.operator,
            self.reason.clone(),
            now,
        )
        .await?;

        Ok(Planned::Commit {
            changes,
            output: refundable,
        })
    }
}
