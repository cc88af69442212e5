use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::lifecycle::{authorize, OrderMutation, Planned};
use super::AppContext;
use crate::domain::order::{Operator, Order, OrderError, OrderStatus};
use crate::domain::payment::{CallbackStatus, OrderPayment, PaymentCallback, PaymentMethod, PaymentStatus};
use crate::errors::{AppError, ErrorBody};
use crate::gateway::{PaymentInitiation, PaymentInitiationRequest};
use crate::storage::{BalanceDirection, BalanceMovement, ChangeSet, PaymentWrite};
use crate::utils::ids;

// ============================================================================
// Payment Service
// ============================================================================
//
// create_payment:  [lock] validate + insert pending record (balance: debit and
//                  settle in the same commit) [unlock] -> gateway initiation
// handle_callback: [lock] match by payment_no, check amount, apply once [unlock]
//
// Callbacks are delivered at least once. A success for a payment that is
// already captured is acknowledged without writing anything.
//
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub method: PaymentMethod,
    /// Defaults to everything still owed; smaller amounts split the payment
    pub amount: Option<Decimal>,
    pub return_url: Option<String>,
    pub notify_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCreated {
    pub payment_no: String,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub initiation: PaymentInitiation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAck {
    /// First delivery, state changed
    Processed,
    /// Redelivery of something already applied
    AlreadyProcessed,
    /// The gateway reported a failed payment and it was recorded
    Failed,
}

impl CallbackAck {
    fn as_str(&self) -> &'static str {
        match self {
            CallbackAck::Processed => "processed",
            CallbackAck::AlreadyProcessed => "already_processed",
            CallbackAck::Failed => "failed",
        }
    }
}

/// What the callback endpoint answers. `redeliver` tells the gateway whether
/// sending the same notification again could help.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackResponse {
    pub acknowledged: bool,
    pub redeliver: bool,
    pub ack: Option<CallbackAck>,
    pub error: Option<ErrorBody>,
}

impl CallbackResponse {
    pub fn from_result(result: &Result<CallbackAck, AppError>) -> Self {
        match result {
            Ok(ack) => Self {
                acknowledged: true,
                redeliver: false,
                ack: Some(*ack),
                error: None,
            },
            Err(err) => Self {
                acknowledged: false,
                redeliver: err.is_retryable(),
                ack: None,
                error: Some(err.to_body()),
            },
        }
    }
}

#[derive(Clone)]
pub struct PaymentService {
    ctx: Arc<AppContext>,
}

impl PaymentService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn create_payment(&self, request: CreatePaymentRequest) -> Result<PaymentCreated, AppError> {
        if request.amount.is_some_and(|a| a <= Decimal::ZERO) {
            return Err(AppError::Validation("payment amount must be positive".into()));
        }

        let open = OpenPayment {
            request: request.clone(),
            payment_no: ids::payment_no(Utc::now()),
        };
        let executed = self.ctx.execute(request.order_id, &open).await?;
        let payment = executed.output;

        if payment.method == PaymentMethod::Balance {
            return Ok(PaymentCreated {
                payment_no: payment.payment_no,
                order_id: payment.order_id,
                amount: payment.amount,
                status: payment.status,
                initiation: PaymentInitiation::Completed,
            });
        }

        let initiation_request = PaymentInitiationRequest {
            payment_no: payment.payment_no.clone(),
            order_no: executed.order.order_no.clone(),
            amount: payment.amount,
            method: payment.method,
            return_url: request.return_url,
            notify_url: request.notify_url,
        };

        match self.ctx.gateways.initiate(&initiation_request).await {
            Ok(initiation) => Ok(PaymentCreated {
                payment_no: payment.payment_no,
                order_id: payment.order_id,
                amount: payment.amount,
                status: payment.status,
                initiation,
            }),
            Err(err) if err.is_decline() => {
                let reason = err.to_string();
                let fail = FailPayment {
                    payment_no: payment.payment_no.clone(),
                    reason: reason.clone(),
                };
                if let Err(record_err) = self.ctx.execute(payment.order_id, &fail).await {
                    tracing::warn!(
                        payment_no = %payment.payment_no,
                        error = %record_err,
                        "Could not record declined payment"
                    );
                }
                Err(AppError::PaymentFailed(reason))
            }
            Err(err) => {
                tracing::warn!(
                    payment_no = %payment.payment_no,
                    error = %err,
                    "Payment initiation outcome unknown, record left pending"
                );
                Err(err.into())
            }
        }
    }

    /// Release a `pending` record so a new payment can be started.
    pub async fn cancel_payment(&self, payment_no: &str, operator: Operator) -> Result<OrderPayment, AppError> {
        let payment = self.payment_status(payment_no).await?;
        let cancel = CancelPayment {
            payment_no: payment_no.to_string(),
            operator,
        };
        Ok(self.ctx.execute(payment.order_id, &cancel).await?.output)
    }

    pub async fn handle_callback(&self, callback: PaymentCallback) -> Result<CallbackAck, AppError> {
        let result = self.apply_callback(callback).await;
        let outcome = match &result {
            Ok(ack) => ack.as_str(),
            Err(AppError::PaymentAmountMismatch { .. }) => "amount_mismatch",
            Err(AppError::PaymentNotFound(_)) => "unknown_payment",
            Err(_) => "error",
        };
        self.ctx.metrics.record_callback(outcome);
        result
    }

    async fn apply_callback(&self, callback: PaymentCallback) -> Result<CallbackAck, AppError> {
        let payment = self.payment_status(&callback.payment_no).await?;
        let order_id = payment.order_id;
        let apply = ApplyCallback { callback };
        Ok(self.ctx.execute(order_id, &apply).await?.output)
    }

    pub async fn payment_status(&self, payment_no: &str) -> Result<OrderPayment, AppError> {
        self.ctx
            .store
            .payment_by_no(payment_no)
            .await?
            .ok_or_else(|| AppError::PaymentNotFound(payment_no.to_string()))
    }

    pub async fn payments_for_order(&self, order_id: Uuid, viewer: Operator) -> Result<Vec<OrderPayment>, AppError> {
        let order = self
            .ctx
            .store
            .load_order(order_id)
            .await?
            .ok_or(AppError::OrderNotFound(order_id))?;
        authorize(&order, &viewer)?;
        Ok(self.ctx.store.payments_for_order(order_id).await?)
    }
}

fn find_by_no(payments: Vec<OrderPayment>, payment_no: &str) -> Result<OrderPayment, AppError> {
    payments
        .into_iter()
        .find(|p| p.payment_no == payment_no)
        .ok_or_else(|| AppError::PaymentNotFound(payment_no.to_string()))
}

struct OpenPayment {
    request: CreatePaymentRequest,
    payment_no: String,
}

#[async_trait]
impl OrderMutation for OpenPayment {
    type Output = OrderPayment;

    fn operation(&self) -> &'static str {
        "create_payment"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<OrderPayment>, AppError> {
        let buyer = Operator::buyer(self.request.user_id);
        authorize(&order, &buyer)?;
        if order.status != OrderStatus::Pending {
            return Err(OrderError::IllegalTransition {
                from: order.status,
                to: OrderStatus::Paid,
            }
            .into());
        }

        let outstanding = order.outstanding();
        let amount = self.request.amount.unwrap_or(outstanding);
        if amount <= Decimal::ZERO || amount > outstanding {
            return Err(AppError::Validation(format!(
                "payment amount {amount} must be within (0, {outstanding}]"
            )));
        }

        let existing = ctx.store.payments_for_order(order.id).await?;
        if existing.iter().any(|p| p.status == PaymentStatus::Pending) {
            return Err(AppError::PaymentInProgress(order.id));
        }

        let mut payment = OrderPayment::new_pending(
            self.payment_no.clone(),
            order.id,
            order.user_id,
            self.request.method,
            amount,
            now,
        );
        let mut changes = ChangeSet::update(order);

        if payment.method == PaymentMethod::Balance {
            payment.mark_paid(format!("balance:{}", payment.payment_no), None, now);
            changes.balance.push(BalanceMovement {
                user_id: payment.user_id,
                amount,
                direction: BalanceDirection::Debit,
            });
            changes.order.paid_amount += amount;
            if changes.order.is_fully_paid() {
                ctx.advance(&mut changes, OrderStatus::Paid, buyer, None, now)?;
            }
        }

        changes.payments.push(PaymentWrite::Insert(payment.clone()));
        Ok(Planned::Commit {
            changes,
            output: payment,
        })
    }
}

struct FailPayment {
    payment_no: String,
    reason: String,
}

#[async_trait]
impl OrderMutation for FailPayment {
    type Output = ();

    fn operation(&self) -> &'static str {
        "fail_payment"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<()>, AppError> {
        let mut payment = find_by_no(ctx.store.payments_for_order(order.id).await?, &self.payment_no)?;
        if payment.status != PaymentStatus::Pending {
            return Ok(Planned::Unchanged { order, output: () });
        }
        payment.mark_failed(self.reason.clone(), None, now);
        let mut changes = ChangeSet::update(order);
        changes.payments.push(PaymentWrite::Update(payment));
        Ok(Planned::Commit { changes, output: () })
    }
}

struct CancelPayment {
    payment_no: String,
    operator: Operator,
}

#[async_trait]
impl OrderMutation for CancelPayment {
    type Output = OrderPayment;

    fn operation(&self) -> &'static str {
        "cancel_payment"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<OrderPayment>, AppError> {
        authorize(&order, &self.operator)?;
        let mut payment = find_by_no(ctx.store.payments_for_order(order.id).await?, &self.payment_no)?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::PaymentStatus {
                payment_no: payment.payment_no,
                status: payment.status.to_string(),
            });
        }
        payment.mark_cancelled(now);
        let mut changes = ChangeSet::update(order);
        changes.payments.push(PaymentWrite::Update(payment.clone()));
        Ok(Planned::Commit {
            changes,
            output: payment,
        })
    }
}

struct ApplyCallback {
    callback: PaymentCallback,
}

#[async_trait]
impl OrderMutation for ApplyCallback {
    type Output = CallbackAck;

    fn operation(&self) -> &'static str {
        "payment_callback"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<CallbackAck>, AppError> {
        let callback = &self.callback;
        let mut payment = find_by_no(ctx.store.payments_for_order(order.id).await?, &callback.payment_no)?;

        if callback.amount != payment.amount {
            tracing::warn!(
                payment_no = %payment.payment_no,
                expected = %payment.amount,
                declared = %callback.amount,
                "Rejecting callback with mismatched amount"
            );
            return Err(AppError::PaymentAmountMismatch {
                payment_no: payment.payment_no,
                expected: payment.amount,
                declared: callback.amount,
            });
        }

        match (callback.status, payment.status) {
            (CallbackStatus::Success, PaymentStatus::Paid | PaymentStatus::Refunded) => {
                if payment.third_party_ref.as_deref() != Some(callback.transaction_id.as_str()) {
                    tracing::warn!(
                        payment_no = %payment.payment_no,
                        transaction_id = %callback.transaction_id,
                        "Success callback carries a different transaction id than the one recorded"
                    );
                }
                Ok(Planned::Unchanged {
                    order,
                    output: CallbackAck::AlreadyProcessed,
                })
            }
            (CallbackStatus::Failed, PaymentStatus::Pending) => {
                payment.mark_failed("reported failed by gateway", callback.raw_payload.clone(), now);
                let mut changes = ChangeSet::update(order);
                changes.payments.push(PaymentWrite::Update(payment));
                Ok(Planned::Commit {
                    changes,
                    output: CallbackAck::Failed,
                })
            }
            (CallbackStatus::Failed, _) => Ok(Planned::Unchanged {
                order,
                output: CallbackAck::AlreadyProcessed,
            }),
            (CallbackStatus::Success, PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::Cancelled) => {
                let payable_here = payment.status != PaymentStatus::Cancelled
                    && order.status == OrderStatus::Pending
                    && order.paid_amount + payment.amount <= order.payable_amount;

                payment.mark_paid(callback.transaction_id.clone(), callback.raw_payload.clone(), callback.paid_at);
                let mut changes = ChangeSet::update(order);

                if payable_here {
                    changes.order.paid_amount += payment.amount;
                    if changes.order.is_fully_paid() {
                        ctx.advance(&mut changes, OrderStatus::Paid, Operator::gateway(), None, now)?;
                    }
                } else {
                    tracing::warn!(
                        order_id = %changes.order.id,
                        order_status = %changes.order.status,
                        payment_no = %payment.payment_no,
                        "Late payment for an order that no longer accepts it, refunding"
                    );
                    ctx.refund_orphan(&mut payment, now).await?;
                }

                changes.payments.push(PaymentWrite::Update(payment));
                Ok(Planned::Commit {
                    changes,
                    output: CallbackAck::Processed,
                })
            }
        }
    }
}
