use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::OrderStatus;

// ============================================================================
// Shipment Tracking
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Collected,
    InTransit,
    OutForDelivery,
    Delivered,
    Signed,
    Exception,
    Returned,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Collected => "collected",
            TrackingStatus::InTransit => "in_transit",
            TrackingStatus::OutForDelivery => "out_for_delivery",
            TrackingStatus::Delivered => "delivered",
            TrackingStatus::Signed => "signed",
            TrackingStatus::Exception => "exception",
            TrackingStatus::Returned => "returned",
        }
    }

    /// Order status a carrier event of this kind drives the order towards.
    pub fn order_target(&self) -> Option<OrderStatus> {
        match self {
            TrackingStatus::Delivered => Some(OrderStatus::Delivered),
            TrackingStatus::Signed => Some(OrderStatus::Received),
            _ => None,
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collected" => Ok(TrackingStatus::Collected),
            "in_transit" => Ok(TrackingStatus::InTransit),
            "out_for_delivery" => Ok(TrackingStatus::OutForDelivery),
            "delivered" => Ok(TrackingStatus::Delivered),
            "signed" => Ok(TrackingStatus::Signed),
            "exception" => Ok(TrackingStatus::Exception),
            "returned" => Ok(TrackingStatus::Returned),
            other => Err(format!("unknown tracking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub occurred_at: DateTime<Utc>,
    pub status: TrackingStatus,
    pub location: Option<String>,
    pub description: String,
}

impl TrackingEvent {
    fn same_as(&self, other: &TrackingEvent) -> bool {
        self.occurred_at == other.occurred_at && self.status == other.status
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub carrier_code: String,
    pub tracking_no: String,
    pub status: TrackingStatus,
    pub events: Vec<TrackingEvent>,
    pub shipped_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderShipment {
    pub fn new(order_id: Uuid, carrier_code: String, tracking_no: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            carrier_code,
            tracking_no,
            status: TrackingStatus::Collected,
            events: Vec::new(),
            shipped_at: now,
            updated_at: now,
        }
    }

    /// Filter `incoming` down to events not yet in the log (same time and
    /// status), ordered by time. The caller appends what is returned.
    pub fn unseen(&self, incoming: &[TrackingEvent]) -> Vec<TrackingEvent> {
        let mut fresh: Vec<TrackingEvent> = Vec::new();
        for event in incoming {
            let known = self.events.iter().chain(fresh.iter()).any(|e| e.same_as(event));
            if !known {
                fresh.push(event.clone());
            }
        }
        fresh.sort_by_key(|e| e.occurred_at);
        fresh
    }

    /// Append already-deduplicated events and refresh the headline status.
    pub fn append(&mut self, events: &[TrackingEvent], now: DateTime<Utc>) {
        self.events.extend_from_slice(events);
        self.events.sort_by_key(|e| e.occurred_at);
        if let Some(latest) = self.events.last() {
            self.status = latest.status;
        }
        self.updated_at = now;
    }
}
