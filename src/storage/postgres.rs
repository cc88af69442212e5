use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::{
    AfterSaleWrite, BalanceDirection, BalanceMovement, ChangeSet, DueKind, OrderPage, OrderQuery, OrderStats,
    OrderStore, PaymentWrite, ShipmentWrite, StoreError,
};
use crate::domain::after_sale::{AfterSaleStatus, OrderAfterSale, ReturnLine};
use crate::domain::order::{Operator, Order, OrderItem, OrderStatus, OrderStatusLog, ShippingAddress};
use crate::domain::payment::OrderPayment;
use crate::domain::shipment::{OrderShipment, TrackingEvent};
use crate::domain::stock::{Sku, StockDirection, StockMovement};

// ============================================================================
// PostgreSQL Order Store
// ============================================================================
//
// `commit` runs inside one transaction. Every early `?` return drops the
// transaction, which rolls it back; only the final `commit()` publishes.
//
// ============================================================================

const SCHEMA: &str = include_str!("../../migrations/0001_order_lifecycle.sql");

const ORDER_COLUMNS: &str = "id, order_no, user_id, status, version, total_amount, discount_amount, \
    shipping_fee, payable_amount, paid_amount, refund_amount, receiver_name, receiver_phone, province, \
    city, district, address_detail, remark, cancel_reason, ordered_at, paid_at, shipped_at, delivered_at, \
    received_at, finished_at, cancelled_at, refunded_at, pay_expire_at, receive_expire_at, \
    review_expire_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, payment_no, order_id, user_id, method, amount, refunded_amount, \
    refund_count, status, third_party_ref, raw_payload, failure_reason, created_at, paid_at, updated_at";

const AFTER_SALE_COLUMNS: &str = "id, after_sale_no, order_id, order_item_id, user_id, kind, status, reason, \
    amount, refunded_amount, quantity, return_item_ids, return_quantities, evidence, return_carrier, \
    return_tracking_no, reject_reason, created_at, approved_at, returned_at, completed_at, updated_at";

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn items_for(&self, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<OrderItem>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, sku_id, product_id, product_name, unit_price, quantity, refunded_quantity
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position
            "#,
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in rows {
            let item = OrderItem {
                id: row.try_get("id")?,
                order_id: row.try_get("order_id")?,
                sku_id: row.try_get("sku_id")?,
                product_id: row.try_get("product_id")?,
                product_name: row.try_get("product_name")?,
                unit_price: row.try_get("unit_price")?,
                quantity: row.try_get("quantity")?,
                refunded_quantity: row.try_get("refunded_quantity")?,
            };
            grouped.entry(item.order_id).or_default().push(item);
        }
        Ok(grouped)
    }

    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<Order>, StoreError> {
        let ids: Vec<Uuid> = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<_, _>>()?;
        let mut items = self.items_for(&ids).await?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id")?;
                order_from_row(row, items.remove(&id).unwrap_or_default())
            })
            .collect()
    }
}

fn parse<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn order_from_row(row: &PgRow, items: Vec<OrderItem>) -> Result<Order, StoreError> {
    Ok(Order {
        id: row.try_get("id")?,
        order_no: row.try_get("order_no")?,
        user_id: row.try_get("user_id")?,
        status: parse(row, "status")?,
        version: row.try_get("version")?,
        total_amount: row.try_get("total_amount")?,
        discount_amount: row.try_get("discount_amount")?,
        shipping_fee: row.try_get("shipping_fee")?,
        payable_amount: row.try_get("payable_amount")?,
        paid_amount: row.try_get("paid_amount")?,
        refund_amount: row.try_get("refund_amount")?,
        shipping: ShippingAddress {
            receiver_name: row.try_get("receiver_name")?,
            receiver_phone: row.try_get("receiver_phone")?,
            province: row.try_get("province")?,
            city: row.try_get("city")?,
            district: row.try_get("district")?,
            detail: row.try_get("address_detail")?,
        },
        remark: row.try_get("remark")?,
        cancel_reason: row.try_get("cancel_reason")?,
        ordered_at: row.try_get("ordered_at")?,
        paid_at: row.try_get("paid_at")?,
        shipped_at: row.try_get("shipped_at")?,
        delivered_at: row.try_get("delivered_at")?,
        received_at: row.try_get("received_at")?,
        finished_at: row.try_get("finished_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        refunded_at: row.try_get("refunded_at")?,
        pay_expire_at: row.try_get("pay_expire_at")?,
        receive_expire_at: row.try_get("receive_expire_at")?,
        review_expire_at: row.try_get("review_expire_at")?,
        updated_at: row.try_get("updated_at")?,
        items,
    })
}

fn payment_from_row(row: &PgRow) -> Result<OrderPayment, StoreError> {
    Ok(OrderPayment {
        id: row.try_get("id")?,
        payment_no: row.try_get("payment_no")?,
        order_id: row.try_get("order_id")?,
        user_id: row.try_get("user_id")?,
        method: parse(row, "method")?,
        amount: row.try_get("amount")?,
        refunded_amount: row.try_get("refunded_amount")?,
        refund_count: row.try_get("refund_count")?,
        status: parse(row, "status")?,
        third_party_ref: row.try_get("third_party_ref")?,
        raw_payload: row.try_get("raw_payload")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn after_sale_from_row(row: &PgRow) -> Result<OrderAfterSale, StoreError> {
    Ok(OrderAfterSale {
        id: row.try_get("id")?,
        after_sale_no: row.try_get("after_sale_no")?,
        order_id: row.try_get("order_id")?,
        order_item_id: row.try_get("order_item_id")?,
        user_id: row.try_get("user_id")?,
        kind: parse(row, "kind")?,
        status: parse(row, "status")?,
        reason: row.try_get("reason")?,
        amount: row.try_get("amount")?,
        refunded_amount: row.try_get("refunded_amount")?,
        quantity: row.try_get("quantity")?,
        lines: return_lines_from_row(row)?,
        evidence: row.try_get("evidence")?,
        return_carrier: row.try_get("return_carrier")?,
        return_tracking_no: row.try_get("return_tracking_no")?,
        reject_reason: row.try_get("reject_reason")?,
        created_at: row.try_get("created_at")?,
        approved_at: row.try_get("approved_at")?,
        returned_at: row.try_get("returned_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn return_lines_from_row(row: &PgRow) -> Result<Vec<ReturnLine>, StoreError> {
    let item_ids: Vec<Uuid> = row.try_get("return_item_ids")?;
    let quantities: Vec<i32> = row.try_get("return_quantities")?;
    if item_ids.len() != quantities.len() {
        return Err(StoreError::Corrupt(format!(
            "return lines: {} items but {} quantities",
            item_ids.len(),
            quantities.len()
        )));
    }
    Ok(item_ids
        .into_iter()
        .zip(quantities)
        .map(|(order_item_id, quantity)| ReturnLine { order_item_id, quantity })
        .collect())
}

fn split_return_lines(lines: &[ReturnLine]) -> (Vec<Uuid>, Vec<i32>) {
    lines.iter().map(|l| (l.order_item_id, l.quantity)).unzip()
}

fn log_from_row(row: &PgRow) -> Result<OrderStatusLog, StoreError> {
    let from_status: Option<String> = row.try_get("from_status")?;
    Ok(OrderStatusLog {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        from_status: from_status
            .map(|s| s.parse::<OrderStatus>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("from_status: {e}")))?,
        to_status: parse(row, "to_status")?,
        operator: Operator {
            kind: parse(row, "operator_type")?,
            id: row.try_get("operator_id")?,
        },
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn duplicate_or(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate(what()),
        _ => StoreError::Database(err),
    }
}

// ----------------------------------------------------------------------------
// Commit steps
// ----------------------------------------------------------------------------

async fn insert_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO orders ({ORDER_COLUMNS}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, \
          $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31)"
    ))
    .bind(order.id)
    .bind(&order.order_no)
    .bind(order.user_id)
    .bind(order.status.as_str())
    .bind(order.version)
    .bind(order.total_amount)
    .bind(order.discount_amount)
    .bind(order.shipping_fee)
    .bind(order.payable_amount)
    .bind(order.paid_amount)
    .bind(order.refund_amount)
    .bind(&order.shipping.receiver_name)
    .bind(&order.shipping.receiver_phone)
    .bind(&order.shipping.province)
    .bind(&order.shipping.city)
    .bind(&order.shipping.district)
    .bind(&order.shipping.detail)
    .bind(&order.remark)
    .bind(&order.cancel_reason)
    .bind(order.ordered_at)
    .bind(order.paid_at)
    .bind(order.shipped_at)
    .bind(order.delivered_at)
    .bind(order.received_at)
    .bind(order.finished_at)
    .bind(order.cancelled_at)
    .bind(order.refunded_at)
    .bind(order.pay_expire_at)
    .bind(order.receive_expire_at)
    .bind(order.review_expire_at)
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| duplicate_or(e, || format!("order {}", order.order_no)))?;

    for (position, item) in order.items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO order_items
                (id, order_id, sku_id, product_id, product_name, unit_price, quantity, refunded_quantity, position)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.id)
        .bind(order.id)
        .bind(item.sku_id)
        .bind(item.product_id)
        .bind(&item.product_name)
        .bind(item.unit_price)
        .bind(item.quantity)
        .bind(item.refunded_quantity)
        .bind(position as i32)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn update_order(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
    expected_version: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE orders SET
            status = $3, version = $4, paid_amount = $5, refund_amount = $6, cancel_reason = $7,
            paid_at = $8, shipped_at = $9, delivered_at = $10, received_at = $11, finished_at = $12,
            cancelled_at = $13, refunded_at = $14, receive_expire_at = $15, review_expire_at = $16,
            updated_at = $17
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(order.id)
    .bind(expected_version)
    .bind(order.status.as_str())
    .bind(order.version)
    .bind(order.paid_amount)
    .bind(order.refund_amount)
    .bind(&order.cancel_reason)
    .bind(order.paid_at)
    .bind(order.shipped_at)
    .bind(order.delivered_at)
    .bind(order.received_at)
    .bind(order.finished_at)
    .bind(order.cancelled_at)
    .bind(order.refunded_at)
    .bind(order.receive_expire_at)
    .bind(order.review_expire_at)
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict {
            order_id: order.id,
            expected: expected_version,
        });
    }

    for item in &order.items {
        sqlx::query("UPDATE order_items SET refunded_quantity = $2 WHERE id = $1")
            .bind(item.id)
            .bind(item.refunded_quantity)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn apply_stock(tx: &mut Transaction<'_, Postgres>, movement: &StockMovement) -> Result<(), StoreError> {
    let result = match movement.direction {
        StockDirection::Deduct => {
            sqlx::query(
                r#"
                UPDATE skus SET stock = stock - $2, sold_count = sold_count + $2
                WHERE id = $1 AND stock >= $2
                "#,
            )
            .bind(movement.sku_id)
            .bind(movement.quantity)
            .execute(&mut **tx)
            .await?
        }
        StockDirection::Restore => {
            sqlx::query(
                r#"
                UPDATE skus SET stock = stock + $2, sold_count = GREATEST(sold_count - $2, 0)
                WHERE id = $1
                "#,
            )
            .bind(movement.sku_id)
            .bind(movement.quantity)
            .execute(&mut **tx)
            .await?
        }
    };

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let available: Option<i64> = sqlx::query_scalar("SELECT stock FROM skus WHERE id = $1")
        .bind(movement.sku_id)
        .fetch_optional(&mut **tx)
        .await?;

    match available {
        Some(available) => Err(StoreError::InsufficientStock {
            sku_id: movement.sku_id,
            requested: movement.quantity,
            available,
        }),
        None => Err(StoreError::UnknownSku(movement.sku_id)),
    }
}

async fn insert_log(tx: &mut Transaction<'_, Postgres>, log: &OrderStatusLog) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO order_status_logs
            (id, order_id, from_status, to_status, operator_type, operator_id, reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(log.id)
    .bind(log.order_id)
    .bind(log.from_status.map(|s| s.as_str()))
    .bind(log.to_status.as_str())
    .bind(log.operator.kind.as_str())
    .bind(log.operator.id)
    .bind(&log.reason)
    .bind(log.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_payment(tx: &mut Transaction<'_, Postgres>, write: &PaymentWrite) -> Result<(), StoreError> {
    match write {
        PaymentWrite::Insert(p) => {
            sqlx::query(&format!(
                "INSERT INTO order_payments ({PAYMENT_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
            ))
            .bind(p.id)
            .bind(&p.payment_no)
            .bind(p.order_id)
            .bind(p.user_id)
            .bind(p.method.as_str())
            .bind(p.amount)
            .bind(p.refunded_amount)
            .bind(p.refund_count)
            .bind(p.status.as_str())
            .bind(&p.third_party_ref)
            .bind(&p.raw_payload)
            .bind(&p.failure_reason)
            .bind(p.created_at)
            .bind(p.paid_at)
            .bind(p.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| duplicate_or(e, || format!("payment {}", p.payment_no)))?;
        }
        PaymentWrite::Update(p) => {
            let result = sqlx::query(
                r#"
                UPDATE order_payments SET
                    refunded_amount = $2, refund_count = $3, status = $4, third_party_ref = $5,
                    raw_payload = $6, failure_reason = $7, paid_at = $8, updated_at = $9
                WHERE id = $1
                "#,
            )
            .bind(p.id)
            .bind(p.refunded_amount)
            .bind(p.refund_count)
            .bind(p.status.as_str())
            .bind(&p.third_party_ref)
            .bind(&p.raw_payload)
            .bind(&p.failure_reason)
            .bind(p.paid_at)
            .bind(p.updated_at)
            .execute(&mut **tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Missing(format!("payment {}", p.payment_no)));
            }
        }
    }
    Ok(())
}

async fn write_after_sale(tx: &mut Transaction<'_, Postgres>, write: &AfterSaleWrite) -> Result<(), StoreError> {
    match write {
        AfterSaleWrite::Insert(r) => {
            let (item_ids, quantities) = split_return_lines(&r.lines);
            sqlx::query(&format!(
                "INSERT INTO order_after_sales ({AFTER_SALE_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
            ))
            .bind(r.id)
            .bind(&r.after_sale_no)
            .bind(r.order_id)
            .bind(r.order_item_id)
            .bind(r.user_id)
            .bind(r.kind.as_str())
            .bind(r.status.as_str())
            .bind(&r.reason)
            .bind(r.amount)
            .bind(r.refunded_amount)
            .bind(r.quantity)
            .bind(&item_ids)
            .bind(&quantities)
            .bind(&r.evidence)
            .bind(&r.return_carrier)
            .bind(&r.return_tracking_no)
            .bind(&r.reject_reason)
            .bind(r.created_at)
            .bind(r.approved_at)
            .bind(r.returned_at)
            .bind(r.completed_at)
            .bind(r.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| duplicate_or(e, || format!("after-sale {}", r.after_sale_no)))?;
        }
        AfterSaleWrite::Update(r) => {
            let (item_ids, quantities) = split_return_lines(&r.lines);
            let result = sqlx::query(
                r#"
                UPDATE order_after_sales SET
                    status = $2, refunded_amount = $3, return_carrier = $4, return_tracking_no = $5,
                    reject_reason = $6, approved_at = $7, returned_at = $8, completed_at = $9, updated_at = $10,
                    quantity = $11, return_item_ids = $12, return_quantities = $13
                WHERE id = $1
                "#,
            )
            .bind(r.id)
            .bind(r.status.as_str())
            .bind(r.refunded_amount)
            .bind(&r.return_carrier)
            .bind(&r.return_tracking_no)
            .bind(&r.reject_reason)
            .bind(r.approved_at)
            .bind(r.returned_at)
            .bind(r.completed_at)
            .bind(r.updated_at)
            .bind(r.quantity)
            .bind(&item_ids)
            .bind(&quantities)
            .execute(&mut **tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Missing(format!("after-sale {}", r.id)));
            }
        }
    }
    Ok(())
}

async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    shipment_id: Uuid,
    events: &[TrackingEvent],
) -> Result<(), StoreError> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO shipment_events (shipment_id, occurred_at, status, location, description)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (shipment_id, occurred_at, status) DO NOTHING
            "#,
        )
        .bind(shipment_id)
        .bind(event.occurred_at)
        .bind(event.status.as_str())
        .bind(&event.location)
        .bind(&event.description)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_shipment(tx: &mut Transaction<'_, Postgres>, write: &ShipmentWrite) -> Result<(), StoreError> {
    match write {
        ShipmentWrite::Insert(s) => {
            sqlx::query(
                r#"
                INSERT INTO order_shipments (id, order_id, carrier_code, tracking_no, status, shipped_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(s.id)
            .bind(s.order_id)
            .bind(&s.carrier_code)
            .bind(&s.tracking_no)
            .bind(s.status.as_str())
            .bind(s.shipped_at)
            .bind(s.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| duplicate_or(e, || format!("shipment for order {}", s.order_id)))?;
            insert_events(tx, s.id, &s.events).await
        }
        ShipmentWrite::Append { shipment, events } => {
            sqlx::query("UPDATE order_shipments SET status = $2, updated_at = $3 WHERE id = $1")
                .bind(shipment.id)
                .bind(shipment.status.as_str())
                .bind(shipment.updated_at)
                .execute(&mut **tx)
                .await?;
            insert_events(tx, shipment.id, events).await
        }
    }
}

async fn apply_balance(
    tx: &mut Transaction<'_, Postgres>,
    movement: &BalanceMovement,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match movement.direction {
        BalanceDirection::Debit => {
            let result = sqlx::query(
                r#"
                UPDATE user_balances SET balance = balance - $2, updated_at = $3
                WHERE user_id = $1 AND balance >= $2
                "#,
            )
            .bind(movement.user_id)
            .bind(movement.amount)
            .bind(now)
            .execute(&mut **tx)
            .await?;

            if result.rows_affected() == 0 {
                let available: Option<Decimal> =
                    sqlx::query_scalar("SELECT balance FROM user_balances WHERE user_id = $1")
                        .bind(movement.user_id)
                        .fetch_optional(&mut **tx)
                        .await?;
                return Err(StoreError::InsufficientBalance {
                    user_id: movement.user_id,
                    required: movement.amount,
                    available: available.unwrap_or_default(),
                });
            }
        }
        BalanceDirection::Credit => {
            sqlx::query(
                r#"
                INSERT INTO user_balances (user_id, balance, updated_at) VALUES ($1, $2, $3)
                ON CONFLICT (user_id)
                DO UPDATE SET balance = user_balances.balance + EXCLUDED.balance, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(movement.user_id)
            .bind(movement.amount)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_orders(&self, query: &OrderQuery) -> Result<OrderPage, StoreError> {
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE ($1::uuid IS NULL OR user_id = $1) AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(query.user_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ($1::uuid IS NULL OR user_id = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY ordered_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(query.user_id)
        .bind(status)
        .bind(i64::from(query.page_size))
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(OrderPage {
            orders: self.hydrate(rows).await?,
            total: total.max(0) as u64,
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn order_stats(&self, user_id: Option<Uuid>) -> Result<OrderStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS orders, SUM(paid_amount) AS paid, SUM(refund_amount) AS refunded
            FROM orders
            WHERE ($1::uuid IS NULL OR user_id = $1)
            GROUP BY status
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OrderStats::default();
        for row in rows {
            let count: i64 = row.try_get("orders")?;
            let count = count.max(0) as u64;
            stats.total_orders += count;
            stats.by_status.insert(row.try_get("status")?, count);
            stats.paid_amount += row.try_get::<Option<Decimal>, _>("paid")?.unwrap_or_default();
            stats.refund_amount += row.try_get::<Option<Decimal>, _>("refunded")?.unwrap_or_default();
        }
        Ok(stats)
    }

    async fn status_history(&self, order_id: Uuid) -> Result<Vec<OrderStatusLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, from_status, to_status, operator_type, operator_id, reason, created_at
            FROM order_status_logs
            WHERE order_id = $1
            ORDER BY seq
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }

    async fn skus(&self, sku_ids: &[Uuid]) -> Result<Vec<Sku>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, product_id, name, price, stock, sold_count, on_sale FROM skus WHERE id = ANY($1)",
        )
        .bind(sku_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(Sku {
                    id: row.try_get("id")?,
                    product_id: row.try_get("product_id")?,
                    name: row.try_get("name")?,
                    price: row.try_get("price")?,
                    stock: row.try_get("stock")?,
                    sold_count: row.try_get("sold_count")?,
                    on_sale: row.try_get("on_sale")?,
                })
            })
            .collect()
    }

    async fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<OrderPayment>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM order_payments WHERE order_id = $1 ORDER BY created_at, id"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(payment_from_row).collect()
    }

    async fn payment_by_no(&self, payment_no: &str) -> Result<Option<OrderPayment>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM order_payments WHERE payment_no = $1"))
            .bind(payment_no)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn after_sales_for_order(&self, order_id: Uuid) -> Result<Vec<OrderAfterSale>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {AFTER_SALE_COLUMNS} FROM order_after_sales WHERE order_id = $1 ORDER BY created_at, id"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(after_sale_from_row).collect()
    }

    async fn after_sale(&self, after_sale_id: Uuid) -> Result<Option<OrderAfterSale>, StoreError> {
        let row = sqlx::query(&format!("SELECT {AFTER_SALE_COLUMNS} FROM order_after_sales WHERE id = $1"))
            .bind(after_sale_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(after_sale_from_row).transpose()
    }

    async fn shipment_for_order(&self, order_id: Uuid) -> Result<Option<OrderShipment>, StoreError> {
        let row = sqlx::query(
            "SELECT id, order_id, carrier_code, tracking_no, status, shipped_at, updated_at \
             FROM order_shipments WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.shipment_with_events(&row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn shipment_by_tracking(
        &self,
        carrier_code: &str,
        tracking_no: &str,
    ) -> Result<Option<OrderShipment>, StoreError> {
        let row = sqlx::query(
            "SELECT id, order_id, carrier_code, tracking_no, status, shipped_at, updated_at \
             FROM order_shipments WHERE carrier_code = $1 AND tracking_no = $2",
        )
        .bind(carrier_code)
        .bind(tracking_no)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.shipment_with_events(&row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn balance(&self, user_id: Uuid) -> Result<Decimal, StoreError> {
        let balance: Option<Decimal> = sqlx::query_scalar("SELECT balance FROM user_balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance.unwrap_or_default())
    }

    async fn due_orders(&self, kind: DueKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>, StoreError> {
        let deadline = match kind {
            DueKind::PaymentExpired => "pay_expire_at",
            DueKind::ReceiveOverdue => "receive_expire_at",
            DueKind::ReviewOverdue => "review_expire_at",
        };

        // Orders held by an open after-sale cannot complete and must not take batch slots.
        let blocked = match kind {
            DueKind::ReviewOverdue => {
                " AND NOT EXISTS (SELECT 1 FROM order_after_sales a \
                 WHERE a.order_id = orders.id AND a.status = ANY($4))"
            }
            DueKind::PaymentExpired | DueKind::ReceiveOverdue => "",
        };
        let open: Vec<&str> = [AfterSaleStatus::Pending, AfterSaleStatus::Approved, AfterSaleStatus::Returning]
            .iter()
            .map(AfterSaleStatus::as_str)
            .collect();

        let sql = format!(
            "SELECT id FROM orders WHERE status = $1 AND {deadline} <= $2{blocked} ORDER BY {deadline} LIMIT $3"
        );
        let mut query = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(kind.status().as_str())
            .bind(now)
            .bind(i64::from(limit));
        if kind == DueKind::ReviewOverdue {
            query = query.bind(open);
        }
        let ids: Vec<Uuid> = query.fetch_all(&self.pool).await?;

        Ok(ids)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = changes.order.updated_at;

        if changes.is_insert() {
            insert_order(&mut tx, &changes.order).await?;
        } else {
            update_order(&mut tx, &changes.order, changes.expected_version).await?;
        }

        for movement in &changes.stock {
            apply_stock(&mut tx, movement).await?;
        }
        for log in &changes.status_logs {
            insert_log(&mut tx, log).await?;
        }
        for write in &changes.payments {
            write_payment(&mut tx, write).await?;
        }
        for write in &changes.after_sales {
            write_after_sale(&mut tx, write).await?;
        }
        if let Some(write) = &changes.shipment {
            write_shipment(&mut tx, write).await?;
        }
        for movement in &changes.balance {
            apply_balance(&mut tx, movement, now).await?;
        }

        tx.commit().await?;
        Ok(changes.order.version)
    }
}

impl PgOrderStore {
    async fn shipment_with_events(&self, row: &PgRow) -> Result<OrderShipment, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let event_rows = sqlx::query(
            "SELECT occurred_at, status, location, description FROM shipment_events \
             WHERE shipment_id = $1 ORDER BY occurred_at, seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let events = event_rows
            .iter()
            .map(|e| {
                Ok::<_, StoreError>(TrackingEvent {
                    occurred_at: e.try_get("occurred_at")?,
                    status: parse(e, "status")?,
                    location: e.try_get("location")?,
                    description: e.try_get("description")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(OrderShipment {
            id,
            order_id: row.try_get("order_id")?,
            carrier_code: row.try_get("carrier_code")?,
            tracking_no: row.try_get("tracking_no")?,
            status: parse(row, "status")?,
            events,
            shipped_at: row.try_get("shipped_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
