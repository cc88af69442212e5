use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Payment Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Wallet,
    Balance,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Balance => "balance",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(PaymentMethod::Card),
            "wallet" => Ok(PaymentMethod::Wallet),
            "balance" => Ok(PaymentMethod::Balance),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Captured money: counts towards the order's paid amount.
    pub fn is_captured(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Refunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayment {
    pub id: Uuid,
    pub payment_no: String,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub refunded_amount: Decimal,
    /// Number of refund slices drawn from this payment so far
    pub refund_count: i32,
    pub status: PaymentStatus,
    pub third_party_ref: Option<String>,
    pub raw_payload: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OrderPayment {
    pub fn new_pending(
        payment_no: String,
        order_id: Uuid,
        user_id: Uuid,
        method: PaymentMethod,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_no,
            order_id,
            user_id,
            method,
            amount,
            refunded_amount: Decimal::ZERO,
            refund_count: 0,
            status: PaymentStatus::Pending,
            third_party_ref: None,
            raw_payload: None,
            failure_reason: None,
            created_at: now,
            paid_at: None,
            updated_at: now,
        }
    }

    pub fn refundable(&self) -> Decimal {
        if self.status.is_captured() {
            (self.amount - self.refunded_amount).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }

    pub fn mark_paid(&mut self, transaction_id: String, raw_payload: Option<String>, at: DateTime<Utc>) {
        self.status = PaymentStatus::Paid;
        self.third_party_ref = Some(transaction_id);
        self.raw_payload = raw_payload;
        self.paid_at = Some(at);
        self.updated_at = at;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, raw_payload: Option<String>, at: DateTime<Utc>) {
        self.status = PaymentStatus::Failed;
        self.failure_reason = Some(reason.into());
        if raw_payload.is_some() {
            self.raw_payload = raw_payload;
        }
        self.updated_at = at;
    }

    pub fn mark_cancelled(&mut self, at: DateTime<Utc>) {
        self.status = PaymentStatus::Cancelled;
        self.updated_at = at;
    }

    /// Book a refunded slice; flips to `refunded` once nothing is left.
    pub fn record_refund(&mut self, amount: Decimal, at: DateTime<Utc>) {
        self.refunded_amount += amount;
        self.refund_count += 1;
        if self.refunded_amount >= self.amount {
            self.status = PaymentStatus::Refunded;
        }
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Success,
    Failed,
}

/// Notification delivered (at least once) by a payment gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub payment_no: String,
    pub transaction_id: String,
    pub amount: Decimal,
    pub status: CallbackStatus,
    pub paid_at: DateTime<Utc>,
    pub raw_payload: Option<String>,
}

/// One slice of a refund, drawn from a single captured payment.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundSlice {
    pub payment_id: Uuid,
    pub payment_no: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub sequence: u32,
}

/// Split `amount` across captured payments in creation order.
///
/// Returns `None` when the payments cannot cover the amount.
pub fn allocate_refund(payments: &[OrderPayment], amount: Decimal) -> Option<Vec<RefundSlice>> {
    let mut ordered: Vec<&OrderPayment> = payments.iter().filter(|p| !p.refundable().is_zero()).collect();
    ordered.sort_by_key(|p| p.created_at);

    let mut remaining = amount;
    let mut slices = Vec::new();
    for payment in ordered {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = payment.refundable().min(remaining);
        slices.push(RefundSlice {
            payment_id: payment.id,
            payment_no: payment.payment_no.clone(),
            method: payment.method,
            amount: take,
            sequence: payment.refund_count.max(0) as u32,
        });
        remaining -= take;
    }

    (remaining <= Decimal::ZERO).then_some(slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn paid(amount: i64, minutes_ago: i64) -> OrderPayment {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        let mut payment = OrderPayment::new_pending(
            format!("P{minutes_ago}"),
            Uuid::new_v4(),
            Uuid::new_v4(),
            PaymentMethod::Card,
            Decimal::from(amount),
            at,
        );
        payment.mark_paid("tx".into(), None, at);
        payment
    }

    #[test]
    fn test_allocation_follows_creation_order() {
        let payments = vec![paid(30, 1), paid(70, 10)];
        let slices = allocate_refund(&payments, Decimal::from(80)).unwrap();

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].payment_no, "P10");
        assert_eq!(slices[0].amount, Decimal::from(70));
        assert_eq!(slices[1].amount, Decimal::from(10));
    }

    #[test]
    fn test_allocation_skips_uncaptured_and_exhausted() {
        let mut exhausted = paid(50, 5);
        exhausted.record_refund(Decimal::from(50), Utc::now());
        let pending = OrderPayment::new_pending(
            "P0".into(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            PaymentMethod::Wallet,
            Decimal::from(40),
            Utc::now(),
        );

        let payments = vec![exhausted, pending, paid(20, 1)];
        let slices = allocate_refund(&payments, Decimal::from(20)).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].payment_no, "P1");

        assert!(allocate_refund(&payments, Decimal::from(21)).is_none());
    }

    #[test]
    fn test_full_refund_flips_status() {
        let mut payment = paid(25, 0);
        payment.record_refund(Decimal::from(10), Utc::now());
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.refundable(), Decimal::from(15));

        payment.record_refund(Decimal::from(15), Utc::now());
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.refund_count, 2);
        assert!(payment.refundable().is_zero());
    }
}
