//! Fixtures shared by the unit tests: sample rows, a scripted gateway and a
//! fully wired in-memory service stack.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::{CacheStore, MemoryCacheStore, OrderCache};
use crate::concurrency::{DistributedLock, MemoryLockStore, OptimisticGuard};
use crate::config::AppConfig;
use crate::domain::order::{Order, OrderItem, OrderStatus, ShippingAddress};
use crate::domain::payment::{OrderPayment, PaymentMethod};
use crate::domain::stock::Sku;
use crate::gateway::{
    GatewayClient, GatewayError, GatewayRegistry, PaymentInitiation, PaymentInitiationRequest, RefundReceipt,
    RefundRequest,
};
use crate::metrics::Metrics;
use crate::services::{AppContext, CartLine, CreateOrderRequest, NoDiscounts, Services};
use crate::storage::{ChangeSet, MemoryOrderStore, OrderStore, PaymentWrite};
use crate::utils::RetryConfig;

pub fn address() -> ShippingAddress {
    ShippingAddress {
        receiver_name: "Ada".into(),
        receiver_phone: "13800000000".into(),
        province: "Zhejiang".into(),
        city: "Hangzhou".into(),
        district: "Xihu".into(),
        detail: "1 Lake Road".into(),
    }
}

/// Pending order with a single line priced at `amount`.
pub fn sample_order(amount: Decimal) -> Order {
    let now = Utc::now();
    let id = Uuid::now_v7();
    Order {
        id,
        order_no: format!("{}{}", now.format("%Y%m%d%H%M%S"), &id.simple().to_string()[..6]),
        user_id: Uuid::new_v4(),
        status: OrderStatus::Pending,
        version: 0,
        total_amount: amount,
        discount_amount: Decimal::ZERO,
        shipping_fee: Decimal::ZERO,
        payable_amount: amount,
        paid_amount: Decimal::ZERO,
        refund_amount: Decimal::ZERO,
        shipping: address(),
        remark: None,
        cancel_reason: None,
        ordered_at: now,
        paid_at: None,
        shipped_at: None,
        delivered_at: None,
        received_at: None,
        finished_at: None,
        cancelled_at: None,
        refunded_at: None,
        pay_expire_at: now + ChronoDuration::minutes(30),
        receive_expire_at: None,
        review_expire_at: None,
        updated_at: now,
        items: vec![OrderItem {
            id: Uuid::new_v4(),
            order_id: id,
            sku_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            product_name: "Sample".into(),
            unit_price: amount,
            quantity: 1,
            refunded_quantity: 0,
        }],
    }
}

pub fn sample_sku(stock: i64) -> Sku {
    Sku {
        id: Uuid::new_v4(),
        product_id: Uuid::new_v4(),
        name: "Sample SKU".into(),
        price: Decimal::from(10),
        stock,
        sold_count: 0,
        on_sale: true,
    }
}

// ----------------------------------------------------------------------------
// Scripted gateway
// ----------------------------------------------------------------------------

pub struct MockGateway {
    method: PaymentMethod,
    delay: Option<Duration>,
    initiate_failures: Mutex<VecDeque<GatewayError>>,
    refund_failures: Mutex<VecDeque<GatewayError>>,
    initiated: Mutex<Vec<String>>,
    refunds: Mutex<Vec<RefundRequest>>,
}

impl MockGateway {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            delay: None,
            initiate_failures: Mutex::new(VecDeque::new()),
            refund_failures: Mutex::new(VecDeque::new()),
            initiated: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn fail_next_initiation(&self, err: GatewayError) {
        self.initiate_failures.lock().await.push_back(err);
    }

    pub async fn fail_next_refund(&self, err: GatewayError) {
        self.refund_failures.lock().await.push_back(err);
    }

    /// Payment numbers initiated successfully, in call order.
    pub async fn initiated(&self) -> Vec<String> {
        self.initiated.lock().await.clone()
    }

    /// Refunds the gateway accepted, in call order.
    pub async fn refunds(&self) -> Vec<RefundRequest> {
        self.refunds.lock().await.clone()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(&self, request: &PaymentInitiationRequest) -> Result<PaymentInitiation, GatewayError> {
        self.pause().await;
        if let Some(err) = self.initiate_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.initiated.lock().await.push(request.payment_no.clone());
        Ok(match self.method {
            PaymentMethod::Wallet => PaymentInitiation::QrCode {
                payload: format!("wallet://pay/{}", request.payment_no),
            },
            _ => PaymentInitiation::Redirect {
                url: format!("https://pay.test/{}", request.payment_no),
            },
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundReceipt, GatewayError> {
        self.pause().await;
        if let Some(err) = self.refund_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.refunds.lock().await.push(request.clone());
        Ok(RefundReceipt {
            refund_no: request.refund_no.clone(),
            gateway_ref: Some(format!("gw-{}", request.refund_no)),
        })
    }
}

// ----------------------------------------------------------------------------
// Service harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub ctx: Arc<AppContext>,
    pub services: Services,
    pub store: Arc<MemoryOrderStore>,
    pub cache_store: Arc<MemoryCacheStore>,
    pub card: Arc<MockGateway>,
    pub wallet: Arc<MockGateway>,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(MemoryOrderStore::new());
        let cache_store = Arc::new(MemoryCacheStore::new());
        let card = Arc::new(MockGateway::new(PaymentMethod::Card));
        let wallet = Arc::new(MockGateway::new(PaymentMethod::Wallet));

        let lock = DistributedLock::new(Arc::new(MemoryLockStore::new()), config.lock.ttl);
        let ctx = Arc::new(AppContext {
            store: store.clone(),
            guard: OptimisticGuard::new(lock, RetryConfig::immediate(3), metrics.clone()),
            cache: OrderCache::new(cache_store.clone(), config.cache.clone(), metrics.clone()),
            gateways: GatewayRegistry::new(config.gateways.timeout, metrics.clone())
                .with(card.clone())
                .with(wallet.clone()),
            discounts: Arc::new(NoDiscounts),
            metrics: metrics.clone(),
            config,
        });

        Self {
            services: Services::new(ctx.clone()),
            ctx,
            store,
            cache_store,
            card,
            wallet,
            metrics,
        }
    }

    /// Insert `order` as-is (version 1), creating any SKU its lines reference.
    pub async fn insert_order(&self, order: Order) -> Order {
        for item in &order.items {
            if self.store.sku(item.sku_id).await.is_none() {
                let mut sku = sample_sku(10);
                sku.id = item.sku_id;
                sku.price = item.unit_price;
                self.store.insert_sku(sku).await;
            }
        }
        let id = order.id;
        self.store.commit(ChangeSet::insert(order)).await.unwrap();
        self.order(id).await
    }

    pub async fn order(&self, order_id: Uuid) -> Order {
        self.store.load_order(order_id).await.unwrap().unwrap()
    }

    pub async fn seed_sku(&self, stock: i64, price: i64) -> Sku {
        let mut sku = sample_sku(stock);
        sku.price = Decimal::from(price);
        self.store.insert_sku(sku.clone()).await;
        sku
    }

    pub fn cart(&self, user_id: Uuid, sku_id: Uuid, quantity: i32) -> CreateOrderRequest {
        CreateOrderRequest {
            user_id,
            lines: vec![CartLine { sku_id, quantity }],
            shipping: address(),
            coupon_code: None,
            points: None,
            remark: None,
        }
    }

    pub async fn stock(&self, sku_id: Uuid) -> i64 {
        self.store.sku(sku_id).await.map(|sku| sku.stock).unwrap_or_default()
    }

    /// Cache fills happen in the background; wait until `key` lands.
    pub async fn wait_for_cache(&self, key: &str) {
        for _ in 0..100 {
            if self.cache_has(key).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cache entry {key} never populated");
    }

    pub async fn cache_has(&self, key: &str) -> bool {
        self.cache_store.get(key).await.unwrap().is_some()
    }
}

/// A `paid` order whose payable amount is the sum of `payments`, captured in
/// the given order.
pub async fn paid_order(harness: &Harness, payments: &[(PaymentMethod, i64)]) -> (Order, Vec<OrderPayment>) {
    let total: Decimal = payments.iter().map(|(_, amount)| Decimal::from(*amount)).sum();
    let order = harness.insert_order(sample_order(total)).await;

    let now = Utc::now();
    let count = payments.len() as i64;
    let records: Vec<OrderPayment> = payments
        .iter()
        .enumerate()
        .map(|(i, (method, amount))| {
            let at = now - ChronoDuration::minutes(count - i as i64);
            let mut payment = OrderPayment::new_pending(
                format!("P{}{i}", order.order_no),
                order.id,
                order.user_id,
                *method,
                Decimal::from(*amount),
                at,
            );
            payment.mark_paid(format!("tx-{i}-{}", order.order_no), None, at);
            payment
        })
        .collect();

    let mut changes = ChangeSet::update(order);
    changes.order.paid_amount = total;
    changes.order.status = OrderStatus::Paid;
    changes.order.paid_at = Some(now);
    changes.payments = records.iter().cloned().map(PaymentWrite::Insert).collect();
    let order_id = changes.order.id;
    harness.store.commit(changes).await.unwrap();

    (harness.order(order_id).await, records)
}
