use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::lifecycle::{authorize, OrderMutation, Planned};
use super::refunds::SettleRefund;
use super::AppContext;
use crate::cache::OrderCache;
use crate::domain::order::{Operator, Order, OrderItem, OrderStatus, OrderStatusLog, ShippingAddress};
use crate::domain::payment::{OrderPayment, PaymentStatus};
use crate::domain::stock::StockMovement;
use crate::errors::AppError;
use crate::storage::{ChangeSet, OrderPage, OrderQuery, OrderStats, PaymentWrite};
use crate::utils::ids;

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub sku_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub lines: Vec<CartLine>,
    pub shipping: ShippingAddress,
    pub coupon_code: Option<String>,
    pub points: Option<i64>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub order_no: String,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub shipping_fee: Decimal,
    pub payable_amount: Decimal,
    pub pay_expire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHistory {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub logs: Vec<OrderStatusLog>,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order: Order,
    pub refunded: Decimal,
    /// Captured money that could not be returned yet; retry with `settle_refund`
    pub refund_pending: bool,
}

// ----------------------------------------------------------------------------
// Discounts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscountRequest {
    pub user_id: Uuid,
    pub coupon_code: Option<String>,
    pub points: Option<i64>,
    pub total: Decimal,
}

/// Quotes the discount for a cart. Coupon and points bookkeeping live behind
/// this seam.
#[async_trait]
pub trait DiscountPolicy: Send + Sync {
    async fn quote(&self, request: &DiscountRequest) -> Result<Decimal, AppError>;
}

/// Accepts no coupon and no points.
pub struct NoDiscounts;

#[async_trait]
impl DiscountPolicy for NoDiscounts {
    async fn quote(&self, request: &DiscountRequest) -> Result<Decimal, AppError> {
        if let Some(code) = &request.coupon_code {
            return Err(AppError::Validation(format!("unknown coupon {code}")));
        }
        if request.points.is_some_and(|p| p > 0) {
            return Err(AppError::Validation("points redemption is not available".into()));
        }
        Ok(Decimal::ZERO)
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct OrderService {
    ctx: Arc<AppContext>,
}

fn merge_lines(lines: &[CartLine]) -> Result<Vec<(Uuid, i32)>, AppError> {
    if lines.is_empty() {
        return Err(AppError::EmptyCart);
    }
    let mut merged: Vec<(Uuid, i32)> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.quantity <= 0 {
            return Err(AppError::Validation(format!(
                "quantity for SKU {} must be positive, got {}",
                line.sku_id, line.quantity
            )));
        }
        match merged.iter_mut().find(|(sku, _)| *sku == line.sku_id) {
            Some((_, quantity)) => {
                *quantity = quantity.checked_add(line.quantity).ok_or_else(|| {
                    AppError::Validation(format!("quantity for SKU {} is too large", line.sku_id))
                })?;
            }
            None => merged.push((line.sku_id, line.quantity)),
        }
    }
    Ok(merged)
}

impl OrderService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<OrderCreated, AppError> {
        let lines = merge_lines(&request.lines)?;
        if let Some(field) = request.shipping.missing_field() {
            return Err(AppError::Validation(format!("shipping {field} is required")));
        }

        let sku_ids: Vec<Uuid> = lines.iter().map(|(id, _)| *id).collect();
        let skus: HashMap<Uuid, _> = self
            .ctx
            .store
            .skus(&sku_ids)
            .await?
            .into_iter()
            .map(|sku| (sku.id, sku))
            .collect();

        let now = Utc::now();
        let order_id = Uuid::now_v7();
        let mut items = Vec::with_capacity(lines.len());
        for (sku_id, quantity) in &lines {
            let sku = skus
                .get(sku_id)
                .filter(|sku| sku.on_sale)
                .ok_or(AppError::ProductUnavailable(*sku_id))?;
            items.push(OrderItem {
                id: Uuid::new_v4(),
                order_id,
                sku_id: sku.id,
                product_id: sku.product_id,
                product_name: sku.name.clone(),
                unit_price: sku.price,
                quantity: *quantity,
                refunded_quantity: 0,
            });
        }

        let total: Decimal = items.iter().map(OrderItem::line_total).sum();
        let discount = self
            .ctx
            .discounts
            .quote(&DiscountRequest {
                user_id: request.user_id,
                coupon_code: request.coupon_code.clone(),
                points: request.points,
                total,
            })
            .await?
            .clamp(Decimal::ZERO, total);

        let policy = &self.ctx.config.orders;
        let shipping_fee = match policy.free_shipping_threshold {
            Some(threshold) if total >= threshold => Decimal::ZERO,
            _ => policy.shipping_fee,
        };
        let payable = total - discount + shipping_fee;
        if payable <= Decimal::ZERO {
            return Err(AppError::Validation(format!("payable amount must be positive, got {payable}")));
        }

        let order = Order {
            id: order_id,
            order_no: ids::order_no(now),
            user_id: request.user_id,
            status: OrderStatus::Pending,
            version: 0,
            total_amount: total,
            discount_amount: discount,
            shipping_fee,
            payable_amount: payable,
            paid_amount: Decimal::ZERO,
            refund_amount: Decimal::ZERO,
            shipping: request.shipping,
            remark: request.remark,
            cancel_reason: None,
            ordered_at: now,
            paid_at: None,
            shipped_at: None,
            delivered_at: None,
            received_at: None,
            finished_at: None,
            cancelled_at: None,
            refunded_at: None,
            pay_expire_at: now + policy.pay_timeout,
            receive_expire_at: None,
            review_expire_at: None,
            updated_at: now,
            items,
        };

        let mut changes = ChangeSet::insert(order);
        changes.stock = changes
            .order
            .items
            .iter()
            .map(|item| StockMovement::deduct(item.sku_id, i64::from(item.quantity)))
            .collect();
        changes.status_logs.push(OrderStatusLog::new(
            order_id,
            None,
            OrderStatus::Pending,
            Operator::buyer(request.user_id),
            None,
            now,
        ));
        changes.order.check_invariants()?;

        let created = OrderCreated {
            order_id,
            order_no: changes.order.order_no.clone(),
            total_amount: total,
            discount_amount: discount,
            shipping_fee,
            payable_amount: payable,
            pay_expire_at: changes.order.pay_expire_at,
        };

        if let Err(err) = self.ctx.store.commit(changes).await {
            let err = AppError::from(err);
            if let AppError::InsufficientStock { sku_id, requested, available } = &err {
                self.ctx.metrics.stock_rejections.inc();
                tracing::info!(sku_id = %sku_id, requested, available, "Order rejected for stock");
            }
            return Err(err);
        }

        self.ctx.metrics.orders_created.inc();
        self.ctx.metrics.record_transition("none", OrderStatus::Pending.as_str());
        self.ctx.cache.invalidate_order(order_id, request.user_id).await;
        tracing::info!(
            order_id = %order_id,
            order_no = %created.order_no,
            user_id = %request.user_id,
            payable = %payable,
            "Order created"
        );

        Ok(created)
    }

    pub async fn get_order(&self, order_id: Uuid, viewer: Operator) -> Result<Order, AppError> {
        let ctx = &self.ctx;
        let order: Order = ctx
            .cache
            .read_through("order", OrderCache::order_key(order_id), ctx.cache.order_ttl(), || async move {
                ctx.store.load_order(order_id).await?.ok_or(AppError::OrderNotFound(order_id))
            })
            .await?;
        authorize(&order, &viewer)?;
        Ok(order)
    }

    pub async fn list_orders(&self, query: OrderQuery) -> Result<OrderPage, AppError> {
        if query.page == 0 || query.page_size == 0 || query.page_size > MAX_PAGE_SIZE {
            return Err(AppError::Validation(format!(
                "page must be >= 1 and page_size within 1..={MAX_PAGE_SIZE}"
            )));
        }
        let ctx = &self.ctx;
        let key = OrderCache::list_key(&query);
        ctx.cache
            .read_through("list", key, ctx.cache.list_ttl(), || async move {
                Ok::<_, AppError>(ctx.store.list_orders(&query).await?)
            })
            .await
    }

    pub async fn stats(&self, user_id: Option<Uuid>) -> Result<OrderStats, AppError> {
        let ctx = &self.ctx;
        ctx.cache
            .read_through("stats", OrderCache::stats_key(user_id), ctx.cache.stats_ttl(), || async move {
                Ok::<_, AppError>(ctx.store.order_stats(user_id).await?)
            })
            .await
    }

    pub async fn history(&self, order_id: Uuid, viewer: Operator) -> Result<OrderHistory, AppError> {
        let order = self
            .ctx
            .store
            .load_order(order_id)
            .await?
            .ok_or(AppError::OrderNotFound(order_id))?;
        authorize(&order, &viewer)?;
        let logs = self.ctx.store.status_history(order_id).await?;
        Ok(OrderHistory {
            order_id,
            status: order.status,
            logs,
        })
    }

    /// Cancel a pending or paid order, restoring stock, then return whatever
    /// had already been captured.
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        operator: Operator,
        reason: Option<String>,
    ) -> Result<CancelOutcome, AppError> {
        let cancel = CancelOrder {
            operator,
            reason: reason.clone(),
        };
        let executed = self.ctx.execute(order_id, &cancel).await?;
        settle_after_cancel(&self.ctx, executed.order, operator, reason).await
    }

    /// Administrative close of an order that was never paid.
    pub async fn close_order(&self, order_id: Uuid, admin_id: Uuid, reason: Option<String>) -> Result<Order, AppError> {
        let close = Close {
            operator: Operator::admin(admin_id),
            reason,
        };
        Ok(self.ctx.execute(order_id, &close).await?.order)
    }

    pub async fn confirm_receipt(&self, order_id: Uuid, buyer_id: Uuid) -> Result<Order, AppError> {
        let step = Advance {
            operation: "confirm_receipt",
            to: OrderStatus::Received,
            operator: Operator::buyer(buyer_id),
            reason: None,
        };
        Ok(self.ctx.execute(order_id, &step).await?.order)
    }

    pub async fn complete_order(&self, order_id: Uuid, operator: Operator) -> Result<Order, AppError> {
        let step = Advance {
            operation: "complete_order",
            to: OrderStatus::Completed,
            operator,
            reason: None,
        };
        Ok(self.ctx.execute(order_id, &step).await?.order)
    }

    /// Retry returning captured money on a cancelled order.
    pub async fn settle_refund(&self, order_id: Uuid, operator: Operator) -> Result<Decimal, AppError> {
        let settle = SettleRefund {
            operator,
            reason: Some("refund on cancellation".into()),
        };
        Ok(self.ctx.execute(order_id, &settle).await?.output)
    }
}

/// Run the refund leg of a cancellation; a gateway failure leaves the order
/// `cancelled` with the refund outstanding.
pub(super) async fn settle_after_cancel(
    ctx: &AppContext,
    order: Order,
    operator: Operator,
    reason: Option<String>,
) -> Result<CancelOutcome, AppError> {
    if order.refundable().is_zero() {
        return Ok(CancelOutcome {
            order,
            refunded: Decimal::ZERO,
            refund_pending: false,
        });
    }

    let order_id = order.id;
    let settle = SettleRefund {
        operator,
        reason: reason.or_else(|| Some("refund on cancellation".into())),
    };
    match ctx.execute(order_id, &settle).await {
        Ok(executed) => Ok(CancelOutcome {
            order: executed.order,
            refunded: executed.output,
            refund_pending: false,
        }),
        Err(err) if err.is_retryable() || matches!(err, AppError::PaymentFailed(_)) => {
            tracing::warn!(order_id = %order_id, error = %err, "Cancelled order refund left outstanding");
            Ok(CancelOutcome {
                order,
                refunded: Decimal::ZERO,
                refund_pending: true,
            })
        }
        Err(err) => Err(err),
    }
}

/// Cancel pending payments and move the order to `cancelled`.
pub(super) fn cancel_into(
    ctx: &AppContext,
    changes: &mut ChangeSet,
    payments: Vec<OrderPayment>,
    operator: Operator,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    for mut payment in payments.into_iter().filter(|p| p.status == PaymentStatus::Pending) {
        payment.mark_cancelled(now);
        changes.payments.push(PaymentWrite::Update(payment));
    }
    changes.order.cancel_reason = reason.clone();
    ctx.advance(changes, OrderStatus::Cancelled, operator, reason, now)
}

struct CancelOrder {
    operator: Operator,
    reason: Option<String>,
}

#[async_trait]
impl OrderMutation for CancelOrder {
    type Output = ();

    fn operation(&self) -> &'static str {
        "cancel_order"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<()>, AppError> {
        authorize(&order, &self.operator)?;
        let payments = ctx.store.payments_for_order(order.id).await?;
        let mut changes = ChangeSet::update(order);
        cancel_into(ctx, &mut changes, payments, self.operator, self.reason.clone(), now)?;
        Ok(Planned::Commit { changes, output: () })
    }
}

struct Close {
    operator: Operator,
    reason: Option<String>,
}

#[async_trait]
impl OrderMutation for Close {
    type Output = ();

    fn operation(&self) -> &'static str {
        "close_order"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<()>, AppError> {
        let payments = ctx.store.payments_for_order(order.id).await?;
        let mut changes = ChangeSet::update(order);
        for mut payment in payments.into_iter().filter(|p| p.status == PaymentStatus::Pending) {
            payment.mark_cancelled(now);
            changes.payments.push(PaymentWrite::Update(payment));
        }
        changes.order.cancel_reason = self.reason.clone();
        ctx.advance(&mut changes, OrderStatus::Closed, self.operator, self.reason.clone(), now)?;
        Ok(Planned::Commit { changes, output: () })
    }
}

struct Advance {
    operation: &'static str,
    to: OrderStatus,
    operator: Operator,
    reason: Option<String>,
}

#[async_trait]
impl OrderMutation for Advance {
    type Output = ();

    fn operation(&self) -> &'static str {
        self.operation
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<()>, AppError> {
        authorize(&order, &self.operator)?;
        let mut changes = ChangeSet::update(order);
        ctx.advance(&mut changes, self.to, self.operator, self.reason.clone(), now)?;
        Ok(Planned::Commit { changes, output: () })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OrderStore;
    use crate::domain::order::OrderError;
    use crate::domain::payment::PaymentMethod;
    use crate::services::CreatePaymentRequest;
    use crate::testing::Harness;
    use futures_util::future::join_all;

    #[test]
    fn test_duplicate_lines_are_merged() {
        let sku = Uuid::new_v4();
        let merged = merge_lines(&[
            CartLine { sku_id: sku, quantity: 1 },
            CartLine { sku_id: sku, quantity: 2 },
        ])
        .unwrap();
        assert_eq!(merged, vec![(sku, 3)]);
    }

    #[test]
    fn test_non_positive_quantity_is_rejected() {
        let result = merge_lines(&[CartLine {
            sku_id: Uuid::new_v4(),
            quantity: 0,
        }]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_merged_quantity_overflow_is_rejected() {
        let sku = Uuid::new_v4();
        let result = merge_lines(&[
            CartLine { sku_id: sku, quantity: i32::MAX },
            CartLine { sku_id: sku, quantity: 1 },
        ]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_scenarios_a_b_c_stock_deduction_and_restore() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let buyer = Uuid::new_v4();

        // A: 3 of 5
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 3)).await.unwrap();
        assert_eq!(created.total_amount, Decimal::from(30));
        assert_eq!(created.payable_amount, Decimal::from(30));
        assert_eq!(harness.stock(sku.id).await, 2);

        // B: 3 more do not fit
        let err = harness
            .services
            .orders
            .create_order(harness.cart(buyer, sku.id, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { sku_id, requested: 3, available: 2 } if sku_id == sku.id));
        assert_eq!(harness.stock(sku.id).await, 2);

        // C: cancel before payment
        let outcome = harness
            .services
            .orders
            .cancel_order(created.order_id, Operator::buyer(buyer), Some("changed mind".into()))
            .await
            .unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Cancelled);
        assert!(!outcome.refund_pending);
        assert_eq!(harness.stock(sku.id).await, 5);
        assert_eq!(harness.store.sku(sku.id).await.unwrap().sold_count, 0);
    }

    #[tokio::test]
    async fn test_empty_cart_and_unknown_sku() {
        let harness = Harness::new();
        let buyer = Uuid::new_v4();

        let mut request = harness.cart(buyer, Uuid::new_v4(), 1);
        let missing = request.lines[0].sku_id;
        let err = harness.services.orders.create_order(request.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::ProductUnavailable(id) if id == missing));

        request.lines.clear();
        let err = harness.services.orders.create_order(request).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyCart));
    }

    #[tokio::test]
    async fn test_free_shipping_threshold() {
        let mut config = crate::config::AppConfig::default();
        config.orders.shipping_fee = Decimal::from(8);
        config.orders.free_shipping_threshold = Some(Decimal::from(50));
        let harness = Harness::with_config(config);
        let sku = harness.seed_sku(100, 10).await;
        let buyer = Uuid::new_v4();

        let small = harness.services.orders.create_order(harness.cart(buyer, sku.id, 2)).await.unwrap();
        assert_eq!(small.shipping_fee, Decimal::from(8));
        assert_eq!(small.payable_amount, Decimal::from(28));

        let large = harness.services.orders.create_order(harness.cart(buyer, sku.id, 5)).await.unwrap();
        assert_eq!(large.shipping_fee, Decimal::ZERO);
        assert_eq!(large.payable_amount, Decimal::from(50));
    }

    #[tokio::test]
    async fn test_coupon_rejected_without_discount_policy() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let mut request = harness.cart(Uuid::new_v4(), sku.id, 1);
        request.coupon_code = Some("WELCOME".into());

        let err = harness.services.orders.create_order(request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(harness.stock(sku.id).await, 5);
    }

    #[tokio::test]
    async fn test_concurrent_orders_never_oversell() {
        let harness = Harness::new();
        let sku = harness.seed_sku(10, 1).await;

        let attempts = (0..25).map(|_| {
            let services = harness.services.clone();
            let request = harness.cart(Uuid::new_v4(), sku.id, 1);
            tokio::spawn(async move { services.orders.create_order(request).await })
        });
        let results = join_all(attempts).await;

        let succeeded = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(AppError::InsufficientStock { .. }))))
            .count();
        assert_eq!(succeeded, 10);
        assert_eq!(rejected, 15);

        let stored = harness.store.sku(sku.id).await.unwrap();
        assert_eq!(stored.stock, 0);
        assert_eq!(stored.sold_count, 10);
    }

    #[tokio::test]
    async fn test_paid_cancel_restores_stock_sold_count_and_balance() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let buyer = Uuid::new_v4();
        harness.store.set_balance(buyer, Decimal::from(100)).await;

        let before = harness.store.sku(sku.id).await.unwrap();
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 2)).await.unwrap();
        harness
            .services
            .payments
            .create_payment(CreatePaymentRequest {
                order_id: created.order_id,
                user_id: buyer,
                method: PaymentMethod::Balance,
                amount: None,
                return_url: None,
                notify_url: None,
            })
            .await
            .unwrap();
        assert_eq!(harness.store.balance(buyer).await.unwrap(), Decimal::from(80));

        let outcome = harness
            .services
            .orders
            .cancel_order(created.order_id, Operator::buyer(buyer), None)
            .await
            .unwrap();

        assert_eq!(outcome.order.status, OrderStatus::Refunded);
        assert_eq!(outcome.refunded, Decimal::from(20));
        assert_eq!(outcome.order.refund_amount, outcome.order.paid_amount);

        let after = harness.store.sku(sku.id).await.unwrap();
        assert_eq!(after.stock, before.stock);
        assert_eq!(after.sold_count, before.sold_count);
        assert_eq!(harness.store.balance(buyer).await.unwrap(), Decimal::from(100));

        let history = harness
            .services
            .orders
            .history(created.order_id, Operator::buyer(buyer))
            .await
            .unwrap();
        let path: Vec<OrderStatus> = history.logs.iter().map(|l| l.to_status).collect();
        assert_eq!(
            path,
            vec![
                OrderStatus::Pending,
                OrderStatus::Paid,
                OrderStatus::Cancelled,
                OrderStatus::Refunding,
                OrderStatus::Refunded
            ]
        );
    }

    #[tokio::test]
    async fn test_buyer_cannot_touch_another_buyers_order() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let owner = Uuid::new_v4();
        let created = harness.services.orders.create_order(harness.cart(owner, sku.id, 1)).await.unwrap();

        let stranger = Operator::buyer(Uuid::new_v4());
        assert!(matches!(
            harness.services.orders.cancel_order(created.order_id, stranger, None).await,
            Err(AppError::OrderAccessDenied(_))
        ));
        assert!(matches!(
            harness.services.orders.get_order(created.order_id, stranger).await,
            Err(AppError::OrderAccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_close_only_applies_to_unpaid_orders() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let buyer = Uuid::new_v4();
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 1)).await.unwrap();

        let closed = harness
            .services
            .orders
            .close_order(created.order_id, Uuid::new_v4(), Some("fraud".into()))
            .await
            .unwrap();
        assert_eq!(closed.status, OrderStatus::Closed);
        assert!(closed.finished_at.is_some());
        assert_eq!(harness.stock(sku.id).await, 5);

        let err = harness
            .services
            .orders
            .confirm_receipt(created.order_id, buyer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Order(OrderError::IllegalTransition { from: OrderStatus::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_refuses_partially_paid_order() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 50).await;
        let buyer = Uuid::new_v4();
        harness.store.set_balance(buyer, Decimal::from(30)).await;
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 2)).await.unwrap();
        harness
            .services
            .payments
            .create_payment(CreatePaymentRequest {
                order_id: created.order_id,
                user_id: buyer,
                method: PaymentMethod::Balance,
                amount: Some(Decimal::from(30)),
                return_url: None,
                notify_url: None,
            })
            .await
            .unwrap();
        let version = harness.order(created.order_id).await.version;

        let err = harness
            .services
            .orders
            .close_order(created.order_id, Uuid::new_v4(), Some("fraud".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Order(OrderError::TransitionConditionFailed { to: OrderStatus::Closed, .. })
        ));

        let order = harness.order(created.order_id).await;
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.version, version);
        assert_eq!(order.paid_amount, Decimal::from(30));
        assert_eq!(harness.stock(sku.id).await, 3);

        // Cancelling is the way out, and it gives the money back
        let outcome = harness
            .services
            .orders
            .cancel_order(created.order_id, Operator::buyer(buyer), None)
            .await
            .unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Refunded);
        assert_eq!(harness.store.balance(buyer).await.unwrap(), Decimal::from(30));
    }

    #[tokio::test]
    async fn test_concurrent_transitions_serialize() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let buyer = Uuid::new_v4();
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 1)).await.unwrap();

        let attempts = (0..8).map(|_| {
            let services = harness.services.clone();
            tokio::spawn(async move {
                services
                    .orders
                    .cancel_order(created.order_id, Operator::buyer(buyer), None)
                    .await
            })
        });
        let results = join_all(attempts).await;

        let succeeded = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(succeeded, 1);
        for result in results.iter().filter_map(|r| r.as_ref().ok()).filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(
                    result,
                    AppError::ResourceBusy(_)
                        | AppError::ConcurrentModification(_)
                        | AppError::Order(OrderError::IllegalTransition { .. })
                ),
                "unexpected error {result:?}"
            );
        }
        assert_eq!(harness.stock(sku.id).await, 5);
    }

    #[tokio::test]
    async fn test_reads_are_cached_and_invalidated_by_mutations() {
        let harness = Harness::new();
        let sku = harness.seed_sku(5, 10).await;
        let buyer = Uuid::new_v4();
        let created = harness.services.orders.create_order(harness.cart(buyer, sku.id, 1)).await.unwrap();
        let key = OrderCache::order_key(created.order_id);

        let first = harness.services.orders.get_order(created.order_id, Operator::buyer(buyer)).await.unwrap();
        assert_eq!(first.status, OrderStatus::Pending);
        harness.wait_for_cache(&key).await;

        harness
            .services
            .orders
            .cancel_order(created.order_id, Operator::buyer(buyer), None)
            .await
            .unwrap();
        assert!(!harness.cache_has(&key).await);

        let fresh = harness.services.orders.get_order(created.order_id, Operator::buyer(buyer)).await.unwrap();
        assert_eq!(fresh.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let harness = Harness::new();
        let sku = harness.seed_sku(10, 10).await;
        let buyer = Uuid::new_v4();
        for _ in 0..3 {
            harness.services.orders.create_order(harness.cart(buyer, sku.id, 1)).await.unwrap();
        }

        let page = harness
            .services
            .orders
            .list_orders(OrderQuery {
                user_id: Some(buyer),
                status: Some(OrderStatus::Pending),
                page: 1,
                page_size: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.orders.len(), 2);

        let stats = harness.services.orders.stats(Some(buyer)).await.unwrap();
        assert_eq!(stats.total_orders, 3);
        assert_eq!(stats.by_status.get("pending"), Some(&3));

        let bad = OrderQuery {
            user_id: None,
            status: None,
            page: 0,
            page_size: 10,
        };
        assert!(matches!(harness.services.orders.list_orders(bad).await, Err(AppError::Validation(_))));
    }
}
