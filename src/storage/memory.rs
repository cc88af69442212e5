use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AfterSaleWrite, BalanceDirection, ChangeSet, DueKind, OrderPage, OrderQuery, OrderStats, OrderStore,
    PaymentWrite, ShipmentWrite, StoreError,
};
use crate::domain::after_sale::OrderAfterSale;
use crate::domain::order::{Order, OrderStatusLog};
use crate::domain::payment::OrderPayment;
use crate::domain::shipment::OrderShipment;
use crate::domain::stock::Sku;

// ============================================================================
// In-Memory Order Store
// ============================================================================
//
// A commit stages every change on a copy of the tables and swaps the copy in
// only when all steps succeed, so a failed commit is invisible.
//
// ============================================================================

#[derive(Default, Clone)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    status_logs: Vec<OrderStatusLog>,
    skus: HashMap<Uuid, Sku>,
    payments: Vec<OrderPayment>,
    after_sales: Vec<OrderAfterSale>,
    shipments: Vec<OrderShipment>,
    balances: HashMap<Uuid, Decimal>,
}

#[derive(Default)]
pub struct MemoryOrderStore {
    tables: Mutex<Tables>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_sku(&self, sku: Sku) {
        self.tables.lock().await.skus.insert(sku.id, sku);
    }

    pub async fn set_balance(&self, user_id: Uuid, amount: Decimal) {
        self.tables.lock().await.balances.insert(user_id, amount);
    }

    pub async fn sku(&self, sku_id: Uuid) -> Option<Sku> {
        self.tables.lock().await.skus.get(&sku_id).cloned()
    }
}

impl Tables {
    fn apply(&mut self, changes: ChangeSet) -> Result<i64, StoreError> {
        let order_id = changes.order.id;

        if changes.is_insert() {
            if self.orders.contains_key(&order_id) {
                return Err(StoreError::Duplicate(format!("order {order_id}")));
            }
        } else {
            let current = self
                .orders
                .get(&order_id)
                .ok_or_else(|| StoreError::Missing(format!("order {order_id}")))?;
            if current.version != changes.expected_version {
                return Err(StoreError::VersionConflict {
                    order_id,
                    expected: changes.expected_version,
                });
            }
        }

        for movement in &changes.stock {
            let sku = self
                .skus
                .get_mut(&movement.sku_id)
                .ok_or(StoreError::UnknownSku(movement.sku_id))?;
            sku.apply(movement).map_err(|shortage| StoreError::InsufficientStock {
                sku_id: shortage.sku_id,
                requested: shortage.requested,
                available: shortage.available,
            })?;
        }

        for write in changes.payments {
            match write {
                PaymentWrite::Insert(payment) => {
                    if self.payments.iter().any(|p| p.payment_no == payment.payment_no) {
                        return Err(StoreError::Duplicate(format!("payment {}", payment.payment_no)));
                    }
                    self.payments.push(payment);
                }
                PaymentWrite::Update(payment) => {
                    let slot = self
                        .payments
                        .iter_mut()
                        .find(|p| p.id == payment.id)
                        .ok_or_else(|| StoreError::Missing(format!("payment {}", payment.payment_no)))?;
                    *slot = payment;
                }
            }
        }

        for write in changes.after_sales {
            match write {
                AfterSaleWrite::Insert(request) => self.after_sales.push(request),
                AfterSaleWrite::Update(request) => {
                    let slot = self
                        .after_sales
                        .iter_mut()
                        .find(|r| r.id == request.id)
                        .ok_or_else(|| StoreError::Missing(format!("after-sale {}", request.id)))?;
                    *slot = request;
                }
            }
        }

        match changes.shipment {
            Some(ShipmentWrite::Insert(shipment)) => {
                let taken = self.shipments.iter().any(|s| {
                    s.order_id == shipment.order_id
                        || (s.carrier_code == shipment.carrier_code && s.tracking_no == shipment.tracking_no)
                });
                if taken {
                    return Err(StoreError::Duplicate(format!("shipment for order {}", shipment.order_id)));
                }
                self.shipments.push(shipment);
            }
            Some(ShipmentWrite::Append { shipment, .. }) => {
                let slot = self
                    .shipments
                    .iter_mut()
                    .find(|s| s.id == shipment.id)
                    .ok_or_else(|| StoreError::Missing(format!("shipment {}", shipment.id)))?;
                *slot = shipment;
            }
            None => {}
        }

        for movement in &changes.balance {
            let balance = self.balances.entry(movement.user_id).or_insert(Decimal::ZERO);
            match movement.direction {
                BalanceDirection::Debit => {
                    if *balance < movement.amount {
                        return Err(StoreError::InsufficientBalance {
                            user_id: movement.user_id,
                            required: movement.amount,
                            available: *balance,
                        });
                    }
                    *balance -= movement.amount;
                }
                BalanceDirection::Credit => *balance += movement.amount,
            }
        }

        self.status_logs.extend(changes.status_logs);

        let version = changes.order.version;
        self.orders.insert(order_id, changes.order);
        Ok(version)
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.tables.lock().await.orders.get(&order_id).cloned())
    }

    async fn list_orders(&self, query: &OrderQuery) -> Result<OrderPage, StoreError> {
        let tables = self.tables.lock().await;
        let mut matching: Vec<&Order> = tables
            .orders
            .values()
            .filter(|o| query.user_id.is_none_or(|user| o.user_id == user))
            .filter(|o| query.status.is_none_or(|status| o.status == status))
            .collect();
        matching.sort_by(|a, b| b.ordered_at.cmp(&a.ordered_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let orders = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size as usize)
            .cloned()
            .collect();

        Ok(OrderPage {
            orders,
            total,
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn order_stats(&self, user_id: Option<Uuid>) -> Result<OrderStats, StoreError> {
        let tables = self.tables.lock().await;
        let mut stats = OrderStats::default();
        for order in tables.orders.values().filter(|o| user_id.is_none_or(|u| o.user_id == u)) {
            stats.total_orders += 1;
            *stats.by_status.entry(order.status.as_str().to_string()).or_default() += 1;
            stats.paid_amount += order.paid_amount;
            stats.refund_amount += order.refund_amount;
        }
        Ok(stats)
    }

    async fn status_history(&self, order_id: Uuid) -> Result<Vec<OrderStatusLog>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.status_logs.iter().filter(|l| l.order_id == order_id).cloned().collect())
    }

    async fn skus(&self, sku_ids: &[Uuid]) -> Result<Vec<Sku>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(sku_ids.iter().filter_map(|id| tables.skus.get(id).cloned()).collect())
    }

    async fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<OrderPayment>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.payments.iter().filter(|p| p.order_id == order_id).cloned().collect())
    }

    async fn payment_by_no(&self, payment_no: &str) -> Result<Option<OrderPayment>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.payments.iter().find(|p| p.payment_no == payment_no).cloned())
    }

    async fn after_sales_for_order(&self, order_id: Uuid) -> Result<Vec<OrderAfterSale>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.after_sales.iter().filter(|r| r.order_id == order_id).cloned().collect())
    }

    async fn after_sale(&self, after_sale_id: Uuid) -> Result<Option<OrderAfterSale>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.after_sales.iter().find(|r| r.id == after_sale_id).cloned())
    }

    async fn shipment_for_order(&self, order_id: Uuid) -> Result<Option<OrderShipment>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.shipments.iter().find(|s| s.order_id == order_id).cloned())
    }

    async fn shipment_by_tracking(
        &self,
        carrier_code: &str,
        tracking_no: &str,
    ) -> Result<Option<OrderShipment>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .shipments
            .iter()
            .find(|s| s.carrier_code == carrier_code && s.tracking_no == tracking_no)
            .cloned())
    }

    async fn balance(&self, user_id: Uuid) -> Result<Decimal, StoreError> {
        Ok(self.tables.lock().await.balances.get(&user_id).copied().unwrap_or_default())
    }

    async fn due_orders(&self, kind: DueKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.lock().await;
        let blocked = |order: &Order| {
            kind == DueKind::ReviewOverdue
                && tables
                    .after_sales
                    .iter()
                    .any(|r| r.order_id == order.id && r.status.is_open())
        };
        let mut due: Vec<&Order> = tables
            .orders
            .values()
            .filter(|o| kind.is_due(o, now) && !blocked(o))
            .collect();
        due.sort_by_key(|o| kind.deadline(o));
        Ok(due.into_iter().take(limit as usize).map(|o| o.id).collect())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut staged = tables.clone();
        let version = staged.apply(changes)?;
        *tables = staged;
        Ok(version)
    }
}
