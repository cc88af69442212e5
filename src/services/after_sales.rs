use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::lifecycle::{authorize, OrderMutation, Planned};
use super::AppContext;
use crate::domain::after_sale::{
    refund_ceiling, returnable_lines, AfterSaleError, AfterSaleKind, AfterSaleStatus, OrderAfterSale, ReturnLine,
};
use crate::domain::order::{Operator, Order, OrderStatus};
use crate::domain::stock::StockMovement;
use crate::errors::AppError;
use crate::storage::{AfterSaleWrite, ChangeSet};
use crate::utils::ids;

// ============================================================================
// After-Sale Service
// ============================================================================
//
// Every step loads the request, then runs as an order mutation so the request
// and the order it refunds move together under one version bump.
//
//   submit          pending (refund on a received order: approved at once)
//   approve         refund issued now; item quantities marked refunded
//                   (an order-level return claims every unit still held)
//   ship_return     approved -> returning (buyer)
//   confirm_return  restock, exchange re-deducts, returning -> completed
//   retry_refund    re-send an approved refund that did not go through
//
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAfterSale {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub order_item_id: Option<Uuid>,
    pub kind: AfterSaleKind,
    pub reason: String,
    pub amount: Decimal,
    pub quantity: i32,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AfterSaleOutcome {
    pub request: OrderAfterSale,
    pub order_status: OrderStatus,
    /// The approved refund could not be issued yet; see `retry_refund`
    pub refund_pending: bool,
}

#[derive(Clone)]
pub struct AfterSaleService {
    ctx: Arc<AppContext>,
}

impl AfterSaleService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn submit(&self, request: SubmitAfterSale) -> Result<AfterSaleOutcome, AppError> {
        validate_submission(&request)?;
        let submit = Submit {
            after_sale_no: ids::after_sale_no(Utc::now()),
            request: request.clone(),
        };
        let executed = self.ctx.execute(request.order_id, &submit).await?;
        let (after_sale, refund_pending) = executed.output;
        tracing::info!(
            order_id = %request.order_id,
            after_sale_no = %after_sale.after_sale_no,
            kind = %after_sale.kind,
            status = %after_sale.status,
            "After-sale request filed"
        );
        Ok(AfterSaleOutcome {
            request: after_sale,
            order_status: executed.order.status,
            refund_pending,
        })
    }

    pub async fn approve(&self, after_sale_id: Uuid, operator: Operator) -> Result<AfterSaleOutcome, AppError> {
        self.step(after_sale_id, operator, Action::Approve).await
    }

    pub async fn reject(&self, after_sale_id: Uuid, operator: Operator, reason: String) -> Result<AfterSaleOutcome, AppError> {
        self.step(after_sale_id, operator, Action::Reject(reason)).await
    }

    /// Buyer hands the goods to a carrier.
    pub async fn ship_return(
        &self,
        after_sale_id: Uuid,
        buyer_id: Uuid,
        carrier: String,
        tracking_no: String,
    ) -> Result<AfterSaleOutcome, AppError> {
        if carrier.trim().is_empty() || tracking_no.trim().is_empty() {
            return Err(AppError::Validation("return carrier and tracking number are required".into()));
        }
        self.step(after_sale_id, Operator::buyer(buyer_id), Action::ShipReturn { carrier, tracking_no })
            .await
    }

    pub async fn confirm_return(&self, after_sale_id: Uuid, operator: Operator) -> Result<AfterSaleOutcome, AppError> {
        self.step(after_sale_id, operator, Action::ConfirmReturn).await
    }

    pub async fn retry_refund(&self, after_sale_id: Uuid, operator: Operator) -> Result<AfterSaleOutcome, AppError> {
        self.step(after_sale_id, operator, Action::RetryRefund).await
    }

    pub async fn list_for_order(&self, order_id: Uuid, viewer: Operator) -> Result<Vec<OrderAfterSale>, AppError> {
        let order = self
            .ctx
            .store
            .load_order(order_id)
            .await?
            .ok_or(AppError::OrderNotFound(order_id))?;
        authorize(&order, &viewer)?;
        Ok(self.ctx.store.after_sales_for_order(order_id).await?)
    }

    async fn step(&self, after_sale_id: Uuid, operator: Operator, action: Action) -> Result<AfterSaleOutcome, AppError> {
        let existing = self
            .ctx
            .store
            .after_sale(after_sale_id)
            .await?
            .ok_or(AppError::AfterSaleNotFound(after_sale_id))?;

        let step = Step {
            after_sale_id,
            operator,
            action,
        };
        let executed = self.ctx.execute(existing.order_id, &step).await?;
        let (request, refund_pending) = executed.output;
        tracing::info!(
            order_id = %request.order_id,
            after_sale_no = %request.after_sale_no,
            operation = step.operation(),
            status = %request.status,
            refund_pending,
            "After-sale request updated"
        );
        Ok(AfterSaleOutcome {
            request,
            order_status: executed.order.status,
            refund_pending,
        })
    }
}

fn validate_submission(request: &SubmitAfterSale) -> Result<(), AppError> {
    if request.reason.trim().is_empty() {
        return Err(AppError::Validation("after-sale reason is required".into()));
    }
    match request.kind {
        AfterSaleKind::Exchange => {
            if request.order_item_id.is_none() {
                return Err(AppError::Validation("an exchange must name the item".into()));
            }
            if !request.amount.is_zero() {
                return Err(AppError::Validation("an exchange carries no refund amount".into()));
            }
        }
        AfterSaleKind::Refund | AfterSaleKind::Return => {
            if request.amount <= Decimal::ZERO {
                return Err(AppError::Validation(format!(
                    "refund amount must be positive, got {}",
                    request.amount
                )));
            }
        }
    }
    if request.order_item_id.is_some() && request.quantity <= 0 {
        return Err(AppError::Validation(format!(
            "quantity must be positive, got {}",
            request.quantity
        )));
    }
    Ok(())
}

/// Approve `request` and issue its refund against the order in `changes`.
///
/// Returns whether the refund is still outstanding because the gateway did
/// not accept it; the approval itself stands either way.
async fn approve_into(
    ctx: &AppContext,
    changes: &mut ChangeSet,
    request: &mut OrderAfterSale,
    operator: Operator,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    request.transition(AfterSaleStatus::Approved, now)?;

    match (request.kind, request.order_item_id) {
        (AfterSaleKind::Exchange, _) => {}
        (_, Some(item_id)) => {
            let item = changes
                .order
                .item_mut(item_id)
                .ok_or_else(|| AppError::Validation(format!("order has no item {item_id}")))?;
            item.refunded_quantity += request.quantity;
        }
        (AfterSaleKind::Return, None) => {
            let lines = claim_returnable(&changes.order)?;
            for line in &lines {
                if let Some(item) = changes.order.item_mut(line.order_item_id) {
                    item.refunded_quantity += line.quantity;
                }
            }
            request.quantity = lines.iter().map(|l| l.quantity).sum();
            request.lines = lines;
        }
        (AfterSaleKind::Refund, None) => {}
    }

    let refund_pending = match issue_refund(ctx, changes, request, operator, now).await {
        Ok(()) => false,
        Err(err @ (AppError::GatewayUnavailable(_) | AppError::PaymentFailed(_))) => {
            tracing::warn!(
                order_id = %changes.order.id,
                after_sale_no = %request.after_sale_no,
                error = %err,
                "After-sale refund left outstanding"
            );
            true
        }
        Err(err) => return Err(err),
    };

    if request.kind == AfterSaleKind::Refund && !refund_pending {
        request.transition(AfterSaleStatus::Completed, now)?;
    }
    Ok(refund_pending)
}

async fn issue_refund(
    ctx: &AppContext,
    changes: &mut ChangeSet,
    request: &mut OrderAfterSale,
    operator: Operator,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let amount = request.outstanding_refund();
    if amount.is_zero() {
        return Ok(());
    }
    let payments = ctx.store.payments_for_order(changes.order.id).await?;
    ctx.apply_refund(
        changes,
        &payments,
        amount,
        request.id,
        operator,
        Some(format!("after-sale {}", request.after_sale_no)),
        now,
    )
    .await?;
    request.refunded_amount += amount;
    request.updated_at = now;
    Ok(())
}

/// Units an order-level return can still take back. Fails once every unit
/// has been refunded or returned.
fn claim_returnable(order: &Order) -> Result<Vec<ReturnLine>, AppError> {
    let lines = returnable_lines(order);
    if lines.is_empty() {
        return Err(AppError::AfterSaleNotEligible(format!(
            "order {} has nothing left to return",
            order.order_no
        )));
    }
    Ok(lines)
}

/// Stock coming back from a physical return, plus the replacement for an
/// exchange. An order-level return restocks only the units claimed at approval.
fn return_movements(order: &Order, request: &OrderAfterSale) -> Result<Vec<StockMovement>, AppError> {
    let Some(item_id) = request.order_item_id else {
        return request
            .lines
            .iter()
            .map(|line| -> Result<StockMovement, AppError> {
                let item = order
                    .item(line.order_item_id)
                    .ok_or_else(|| AppError::Validation(format!("order has no item {}", line.order_item_id)))?;
                Ok(StockMovement::restore(item.sku_id, i64::from(line.quantity)))
            })
            .collect();
    };
    let item = order
        .item(item_id)
        .ok_or_else(|| AppError::Validation(format!("order has no item {item_id}")))?;
    let quantity = i64::from(request.quantity);

    let mut movements = vec![StockMovement::restore(item.sku_id, quantity)];
    if request.kind == AfterSaleKind::Exchange {
        movements.push(StockMovement::deduct(item.sku_id, quantity));
    }
    Ok(movements)
}

struct Submit {
    after_sale_no: String,
    request: SubmitAfterSale,
}

#[async_trait]
impl OrderMutation for Submit {
    type Output = (OrderAfterSale, bool);

    fn operation(&self) -> &'static str {
        "submit_after_sale"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<Self::Output>, AppError> {
        let submission = &self.request;
        let buyer = Operator::buyer(submission.user_id);
        authorize(&order, &buyer)?;

        if !submission.kind.eligible_order_states().contains(&order.status) {
            return Err(AppError::AfterSaleNotEligible(format!(
                "{} requests are not accepted for {} orders",
                submission.kind, order.status
            )));
        }

        let quantity = match submission.order_item_id {
            Some(item_id) => {
                let item = order
                    .item(item_id)
                    .ok_or_else(|| AppError::Validation(format!("order has no item {item_id}")))?;
                if submission.quantity > item.refundable_quantity() {
                    return Err(AppError::AfterSaleNotEligible(format!(
                        "only {} of item {item_id} can still be returned",
                        item.refundable_quantity()
                    )));
                }
                submission.quantity
            }
            None if submission.kind == AfterSaleKind::Return => {
                claim_returnable(&order)?.iter().map(|l| l.quantity).sum()
            }
            None => 0,
        };

        let existing = ctx.store.after_sales_for_order(order.id).await?;
        if existing.iter().any(|r| r.conflicts_with(submission.order_item_id)) {
            return Err(AppError::AfterSaleAlreadyOpen(order.id));
        }

        // Money already promised to approved requests is not available twice.
        let committed: Decimal = existing
            .iter()
            .filter(|r| r.status.is_open())
            .map(OrderAfterSale::outstanding_refund)
            .sum();
        let ceiling = (refund_ceiling(&order) - committed).max(Decimal::ZERO);
        if submission.amount > ceiling {
            return Err(AppError::RefundExceedsRefundable {
                requested: submission.amount,
                refundable: ceiling,
            });
        }

        let mut request = OrderAfterSale {
            id: Uuid::new_v4(),
            after_sale_no: self.after_sale_no.clone(),
            order_id: order.id,
            order_item_id: submission.order_item_id,
            user_id: submission.user_id,
            kind: submission.kind,
            status: AfterSaleStatus::Pending,
            reason: submission.reason.clone(),
            amount: submission.amount,
            refunded_amount: Decimal::ZERO,
            quantity,
            lines: Vec::new(),
            evidence: submission.evidence.clone(),
            return_carrier: None,
            return_tracking_no: None,
            reject_reason: None,
            created_at: now,
            approved_at: None,
            returned_at: None,
            completed_at: None,
            updated_at: now,
        };

        let auto_approve = request.kind == AfterSaleKind::Refund && order.status == OrderStatus::Received;
        let mut changes = ChangeSet::update(order);
        let mut refund_pending = false;
        if auto_approve {
            refund_pending = approve_into(ctx, &mut changes, &mut request, Operator::system(), now).await?;
        }

        changes.after_sales.push(AfterSaleWrite::Insert(request.clone()));
        Ok(Planned::Commit {
            changes,
            output: (request, refund_pending),
        })
    }
}

enum Action {
    Approve,
    Reject(String),
    ShipReturn { carrier: String, tracking_no: String },
    ConfirmReturn,
    RetryRefund,
}

struct Step {
    after_sale_id: Uuid,
    operator: Operator,
    action: Action,
}

#[async_trait]
impl OrderMutation for Step {
    type Output = (OrderAfterSale, bool);

    fn operation(&self) -> &'static str {
        match self.action {
            Action::Approve => "approve_after_sale",
            Action::Reject(_) => "reject_after_sale",
            Action::ShipReturn { .. } => "ship_return",
            Action::ConfirmReturn => "confirm_return",
            Action::RetryRefund => "retry_after_sale_refund",
        }
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<Self::Output>, AppError> {
        let mut request = ctx
            .store
            .after_sale(self.after_sale_id)
            .await?
            .filter(|r| r.order_id == order.id)
            .ok_or(AppError::AfterSaleNotFound(self.after_sale_id))?;

        let buyer_step = matches!(self.action, Action::ShipReturn { .. });
        if buyer_step {
            authorize(&order, &self.operator)?;
        } else if self.operator.is_buyer() {
            return Err(AppError::OrderAccessDenied(order.id));
        }

        if matches!(self.action, Action::RetryRefund)
            && (!matches!(request.status, AfterSaleStatus::Approved | AfterSaleStatus::Returning)
                || request.outstanding_refund().is_zero())
        {
            return Ok(Planned::Unchanged {
                order,
                output: (request, false),
            });
        }

        let mut changes = ChangeSet::update(order);
        let mut refund_pending = false;

        match &self.action {
            Action::Approve => {
                refund_pending = approve_into(ctx, &mut changes, &mut request, self.operator, now).await?;
            }
            Action::Reject(reason) => {
                request.transition(AfterSaleStatus::Rejected, now)?;
                request.reject_reason = Some(reason.clone());
            }
            Action::ShipReturn { carrier, tracking_no } => {
                request.transition(AfterSaleStatus::Returning, now)?;
                request.return_carrier = Some(carrier.clone());
                request.return_tracking_no = Some(tracking_no.clone());
            }
            Action::ConfirmReturn => {
                if request.status != AfterSaleStatus::Returning {
                    return Err(AfterSaleError::IllegalTransition {
                        from: request.status,
                        to: AfterSaleStatus::Completed,
                    }
                    .into());
                }
                issue_refund(ctx, &mut changes, &mut request, self.operator, now).await?;
                let movements = return_movements(&changes.order, &request)?;
                changes.stock.extend(movements);
                request.transition(AfterSaleStatus::Completed, now)?;
            }
            Action::RetryRefund => {
                issue_refund(ctx, &mut changes, &mut request, self.operator, now).await?;
                if request.kind == AfterSaleKind::Refund {
                    request.transition(AfterSaleStatus::Completed, now)?;
                }
            }
        }

        changes.after_sales.push(AfterSaleWrite::Update(request.clone()));
        Ok(Planned::Commit {
            changes,
            output: (request, refund_pending),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OrderStore;
    use crate::domain::payment::{PaymentMethod, PaymentStatus};
    use crate::domain::shipment::{TrackingEvent, TrackingStatus};
    use crate::gateway::GatewayError;
    use crate::services::CreateShipment;
    use crate::testing::{paid_order, Harness};

    /// Paid order taken through shipping and receipt.
    async fn received_order(harness: &Harness, payments: &[(PaymentMethod, i64)]) -> Order {
        let (order, _) = paid_order(harness, payments).await;
        harness
            .services
            .shipments
            .create_shipment(
                CreateShipment {
                    order_id: order.id,
                    carrier_code: "SF".into(),
                    tracking_no: format!("T{}", order.order_no),
                    events: vec![TrackingEvent {
                        occurred_at: Utc::now(),
                        status: TrackingStatus::Collected,
                        location: None,
                        description: "picked up".into(),
                    }],
                },
                Operator::admin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        harness.services.orders.confirm_receipt(order.id, order.user_id).await.unwrap()
    }

    fn submission(order: &Order, kind: AfterSaleKind, amount: i64) -> SubmitAfterSale {
        SubmitAfterSale {
            order_id: order.id,
            user_id: order.user_id,
            order_item_id: Some(order.items[0].id),
            kind,
            reason: "arrived damaged".into(),
            amount: Decimal::from(amount),
            quantity: 1,
            evidence: vec!["photo-1".into()],
        }
    }

    #[tokio::test]
    async fn test_refund_on_received_order_is_auto_approved_and_settled() {
        let harness = Harness::new();
        let order = received_order(&harness, &[(PaymentMethod::Card, 100)]).await;

        let outcome = harness
            .services
            .after_sales
            .submit(submission(&order, AfterSaleKind::Refund, 100))
            .await
            .unwrap();

        assert_eq!(outcome.request.status, AfterSaleStatus::Completed);
        assert!(!outcome.refund_pending);
        assert_eq!(outcome.order_status, OrderStatus::Refunded);

        let stored = harness.order(order.id).await;
        assert_eq!(stored.refund_amount, Decimal::from(100));
        assert_eq!(stored.items[0].refunded_quantity, 1);
        assert_eq!(harness.card.refunds().await.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_refund_needs_review_on_paid_order() {
        let harness = Harness::new();
        let (order, _) = paid_order(&harness, &[(PaymentMethod::Card, 100)]).await;

        let mut request = submission(&order, AfterSaleKind::Refund, 30);
        request.order_item_id = None;
        let filed = harness.services.after_sales.submit(request).await.unwrap();
        assert_eq!(filed.request.status, AfterSaleStatus::Pending);
        assert!(harness.card.refunds().await.is_empty());

        let approved = harness
            .services
            .after_sales
            .approve(filed.request.id, Operator::admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(approved.request.status, AfterSaleStatus::Completed);
        assert_eq!(approved.order_status, OrderStatus::Paid);
        assert_eq!(harness.order(order.id).await.refund_amount, Decimal::from(30));
    }

    #[tokio::test]
    async fn test_ineligible_and_duplicate_requests() {
        let harness = Harness::new();
        let (order, _) = paid_order(&harness, &[(PaymentMethod::Card, 100)]).await;
        let after_sales = &harness.services.after_sales;

        // Nothing delivered yet
        let err = after_sales.submit(submission(&order, AfterSaleKind::Return, 10)).await.unwrap_err();
        assert!(matches!(err, AppError::AfterSaleNotEligible(_)));

        let err = after_sales.submit(submission(&order, AfterSaleKind::Refund, 101)).await.unwrap_err();
        assert!(matches!(err, AppError::RefundExceedsRefundable { .. }));

        after_sales.submit(submission(&order, AfterSaleKind::Refund, 10)).await.unwrap();
        let err = after_sales.submit(submission(&order, AfterSaleKind::Refund, 10)).await.unwrap_err();
        assert!(matches!(err, AppError::AfterSaleAlreadyOpen(_)));
    }

    #[tokio::test]
    async fn test_rejected_request_frees_the_order_for_a_new_one() {
        let harness = Harness::new();
        let (order, _) = paid_order(&harness, &[(PaymentMethod::Card, 100)]).await;
        let after_sales = &harness.services.after_sales;

        let filed = after_sales.submit(submission(&order, AfterSaleKind::Refund, 10)).await.unwrap();
        let rejected = after_sales
            .reject(filed.request.id, Operator::admin(Uuid::new_v4()), "no evidence".into())
            .await
            .unwrap();
        assert_eq!(rejected.request.status, AfterSaleStatus::Rejected);
        assert_eq!(rejected.request.reject_reason.as_deref(), Some("no evidence"));

        let err = after_sales
            .approve(filed.request.id, Operator::admin(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AfterSale(_)));

        assert!(after_sales.submit(submission(&order, AfterSaleKind::Refund, 10)).await.is_ok());
        assert_eq!(
            after_sales.list_for_order(order.id, Operator::buyer(order.user_id)).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_buyer_cannot_approve() {
        let harness = Harness::new();
        let (order, _) = paid_order(&harness, &[(PaymentMethod::Card, 100)]).await;
        let filed = harness
            .services
            .after_sales
            .submit(submission(&order, AfterSaleKind::Refund, 10))
            .await
            .unwrap();

        let err = harness
            .services
            .after_sales
            .approve(filed.request.id, Operator::buyer(order.user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OrderAccessDenied(_)));
    }

    #[tokio::test]
    async fn test_return_flow_refunds_on_approval_and_restocks_on_confirmation() {
        let harness = Harness::new();
        let order = received_order(&harness, &[(PaymentMethod::Wallet, 100)]).await;
        let sku_id = order.items[0].sku_id;
        let stock_before = harness.stock(sku_id).await;
        let admin = Operator::admin(Uuid::new_v4());
        let after_sales = &harness.services.after_sales;

        let filed = after_sales.submit(submission(&order, AfterSaleKind::Return, 100)).await.unwrap();
        assert_eq!(filed.request.status, AfterSaleStatus::Pending);

        let approved = after_sales.approve(filed.request.id, admin).await.unwrap();
        assert_eq!(approved.request.status, AfterSaleStatus::Approved);
        assert_eq!(approved.order_status, OrderStatus::Refunded);
        assert_eq!(harness.wallet.refunds().await.len(), 1);

        let err = after_sales.confirm_return(filed.request.id, admin).await.unwrap_err();
        assert!(matches!(err, AppError::AfterSale(_)));

        let shipped = after_sales
            .ship_return(filed.request.id, order.user_id, "SF".into(), "R-1".into())
            .await
            .unwrap();
        assert_eq!(shipped.request.status, AfterSaleStatus::Returning);

        let done = after_sales.confirm_return(filed.request.id, admin).await.unwrap();
        assert_eq!(done.request.status, AfterSaleStatus::Completed);
        assert_eq!(harness.stock(sku_id).await, stock_before + 1);
    }

    #[tokio::test]
    async fn test_exchange_restocks_and_deducts_replacement() {
        let harness = Harness::new();
        let order = received_order(&harness, &[(PaymentMethod::Card, 100)]).await;
        let sku_id = order.items[0].sku_id;
        let admin = Operator::admin(Uuid::new_v4());
        let after_sales = &harness.services.after_sales;

        let filed = after_sales.submit(submission(&order, AfterSaleKind::Exchange, 0)).await.unwrap();
        after_sales.approve(filed.request.id, admin).await.unwrap();
        after_sales
            .ship_return(filed.request.id, order.user_id, "SF".into(), "R-2".into())
            .await
            .unwrap();

        let stock_before = harness.stock(sku_id).await;
        let done = after_sales.confirm_return(filed.request.id, admin).await.unwrap();
        assert_eq!(done.request.status, AfterSaleStatus::Completed);
        assert_eq!(done.order_status, OrderStatus::Received);
        assert_eq!(harness.stock(sku_id).await, stock_before);
        assert_eq!(harness.order(order.id).await.items[0].refunded_quantity, 0);
        assert!(harness.card.refunds().await.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_without_amount_rules() {
        let harness = Harness::new();
        let order = received_order(&harness, &[(PaymentMethod::Card, 100)]).await;

        let mut with_amount = submission(&order, AfterSaleKind::Exchange, 5);
        let err = harness.services.after_sales.submit(with_amount.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        with_amount.amount = Decimal::ZERO;
        with_amount.quantity = 2;
        let err = harness.services.after_sales.submit(with_amount).await.unwrap_err();
        assert!(matches!(err, AppError::AfterSaleNotEligible(_)));
    }

    #[tokio::test]
    async fn test_gateway_outage_keeps_approval_and_retry_settles() {
        let harness = Harness::new();
        let (order, _) = paid_order(&harness, &[(PaymentMethod::Card, 100)]).await;
        let admin = Operator::admin(Uuid::new_v4());
        let after_sales = &harness.services.after_sales;

        let filed = after_sales.submit(submission(&order, AfterSaleKind::Refund, 40)).await.unwrap();
        harness.card.fail_next_refund(GatewayError::Timeout).await;

        let approved = after_sales.approve(filed.request.id, admin).await.unwrap();
        assert!(approved.refund_pending);
        assert_eq!(approved.request.status, AfterSaleStatus::Approved);
        assert_eq!(harness.order(order.id).await.refund_amount, Decimal::ZERO);

        let retried = after_sales.retry_refund(filed.request.id, admin).await.unwrap();
        assert!(!retried.refund_pending);
        assert_eq!(retried.request.status, AfterSaleStatus::Completed);
        assert_eq!(retried.request.refunded_amount, Decimal::from(40));

        let stored = harness.order(order.id).await;
        assert_eq!(stored.refund_amount, Decimal::from(40));
        let payment = &harness.store.payments_for_order(order.id).await.unwrap()[0];
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.refunded_amount, Decimal::from(40));
    }

    /// Two units of one SKU (seeded with 10) bought with balance, shipped
    /// and received.
    async fn two_unit_order(harness: &Harness) -> Order {
        let sku = harness.seed_sku(10, 50).await;
        let buyer = Uuid::new_v4();
        harness.store.set_balance(buyer, Decimal::from(100)).await;
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 2)).await.unwrap();
        harness
            .services
            .payments
            .create_payment(crate::services::CreatePaymentRequest {
                order_id: created.order_id,
                user_id: buyer,
                method: PaymentMethod::Balance,
                amount: None,
                return_url: None,
                notify_url: None,
            })
            .await
            .unwrap();
        harness
            .services
            .shipments
            .create_shipment(
                CreateShipment {
                    order_id: created.order_id,
                    carrier_code: "SF".into(),
                    tracking_no: format!("T{}", created.order_no),
                    events: vec![],
                },
                Operator::admin(Uuid::new_v4()),
            )
            .await
            .unwrap();
        harness.services.orders.confirm_receipt(created.order_id, buyer).await.unwrap()
    }

    async fn run_return(harness: &Harness, request: SubmitAfterSale) -> AfterSaleOutcome {
        let admin = Operator::admin(Uuid::new_v4());
        let after_sales = &harness.services.after_sales;
        let filed = after_sales.submit(request.clone()).await.unwrap();
        after_sales.approve(filed.request.id, admin).await.unwrap();
        after_sales
            .ship_return(filed.request.id, request.user_id, "SF".into(), format!("R-{}", filed.request.after_sale_no))
            .await
            .unwrap();
        after_sales.confirm_return(filed.request.id, admin).await.unwrap()
    }

    #[tokio::test]
    async fn test_order_level_return_restocks_only_units_still_held() {
        let harness = Harness::new();
        let order = two_unit_order(&harness).await;
        let item = order.items[0].clone();
        assert_eq!(harness.stock(item.sku_id).await, 8);

        let mut one_unit = submission(&order, AfterSaleKind::Return, 50);
        one_unit.quantity = 1;
        run_return(&harness, one_unit).await;
        assert_eq!(harness.stock(item.sku_id).await, 9);

        let mut whole_order = submission(&order, AfterSaleKind::Return, 50);
        whole_order.order_item_id = None;
        whole_order.quantity = 0;
        let done = run_return(&harness, whole_order).await;

        assert_eq!(done.request.quantity, 1);
        assert_eq!(
            done.request.lines,
            vec![ReturnLine {
                order_item_id: item.id,
                quantity: 1,
            }]
        );
        assert_eq!(harness.stock(item.sku_id).await, 10);
        let stored = harness.order(order.id).await;
        assert_eq!(stored.items[0].refunded_quantity, 2);
        assert_eq!(stored.status, OrderStatus::Refunded);
        assert_eq!(harness.store.balance(order.user_id).await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_order_level_return_rejected_when_nothing_left_to_return() {
        let harness = Harness::new();
        let order = two_unit_order(&harness).await;
        let sku_id = order.items[0].sku_id;

        let mut both_units = submission(&order, AfterSaleKind::Return, 10);
        both_units.quantity = 2;
        run_return(&harness, both_units).await;
        assert_eq!(harness.stock(sku_id).await, 10);
        assert_eq!(harness.order(order.id).await.status, OrderStatus::Received);

        let mut whole_order = submission(&order, AfterSaleKind::Return, 10);
        whole_order.order_item_id = None;
        whole_order.quantity = 0;
        let err = harness.services.after_sales.submit(whole_order).await.unwrap_err();
        assert!(matches!(err, AppError::AfterSaleNotEligible(_)));
        assert_eq!(harness.stock(sku_id).await, 10);
    }
}

