use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::errors::OrderError;

// ============================================================================
// Order Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Delivered,
    Received,
    Completed,
    Cancelled,
    Refunding,
    Refunded,
    Closed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 10] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Received,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Refunding,
        OrderStatus::Refunded,
        OrderStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Received => "received",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunding => "refunding",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::UnknownStatus(s.to_string()))
    }
}

/// Who asked for a mutation. Recorded on every status log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Buyer,
    Admin,
    System,
    Gateway,
    Carrier,
}

impl OperatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorType::Buyer => "buyer",
            OperatorType::Admin => "admin",
            OperatorType::System => "system",
            OperatorType::Gateway => "gateway",
            OperatorType::Carrier => "carrier",
        }
    }
}

impl FromStr for OperatorType {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buyer" => Ok(OperatorType::Buyer),
            "admin" => Ok(OperatorType::Admin),
            "system" => Ok(OperatorType::System),
            "gateway" => Ok(OperatorType::Gateway),
            "carrier" => Ok(OperatorType::Carrier),
            other => Err(OrderError::UnknownOperator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub kind: OperatorType,
    pub id: Option<Uuid>,
}

impl Operator {
    pub fn buyer(user_id: Uuid) -> Self {
        Self { kind: OperatorType::Buyer, id: Some(user_id) }
    }

    pub fn admin(admin_id: Uuid) -> Self {
        Self { kind: OperatorType::Admin, id: Some(admin_id) }
    }

    pub fn system() -> Self {
        Self { kind: OperatorType::System, id: None }
    }

    pub fn gateway() -> Self {
        Self { kind: OperatorType::Gateway, id: None }
    }

    pub fn carrier() -> Self {
        Self { kind: OperatorType::Carrier, id: None }
    }

    pub fn is_buyer(&self) -> bool {
        self.kind == OperatorType::Buyer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub receiver_name: String,
    pub receiver_phone: String,
    pub province: String,
    pub city: String,
    pub district: String,
    pub detail: String,
}

impl ShippingAddress {
    /// Returns the name of the first blank field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("receiver_name", &self.receiver_name),
            ("receiver_phone", &self.receiver_phone),
            ("province", &self.province),
            ("city", &self.city),
            ("detail", &self.detail),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
