use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::lifecycle::{authorize, OrderMutation, Planned};
use super::AppContext;
use crate::domain::order::{Operator, Order, OrderStateMachine, OrderStatus};
use crate::domain::shipment::{OrderShipment, TrackingEvent, TrackingStatus};
use crate::errors::AppError;
use crate::storage::{ChangeSet, ShipmentWrite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShipment {
    pub order_id: Uuid,
    pub carrier_code: String,
    pub tracking_no: String,
    /// Events the carrier already reported at pickup, if any
    pub events: Vec<TrackingEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingUpdate {
    pub order_id: Uuid,
    /// Events that were new to the log
    pub appended: usize,
    pub tracking_status: TrackingStatus,
    pub order_status: OrderStatus,
}

#[derive(Clone)]
pub struct ShipmentService {
    ctx: Arc<AppContext>,
}

fn require_tracking(carrier: &str, tracking_no: &str) -> Result<(), AppError> {
    if carrier.trim().is_empty() || tracking_no.trim().is_empty() {
        return Err(AppError::Validation("carrier and tracking number are required".into()));
    }
    Ok(())
}

/// Move the order as far as the latest carrier status allows. Statuses the
/// order has already passed are ignored.
fn drive_order(
    ctx: &AppContext,
    changes: &mut ChangeSet,
    status: TrackingStatus,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let Some(target) = status.order_target() else {
        return Ok(());
    };
    if changes.order.status == target {
        return Ok(());
    }
    if OrderStateMachine::can_transition(&changes.order, target) {
        ctx.advance(changes, target, Operator::carrier(), Some(format!("carrier reported {status}")), now)?;
    } else {
        tracing::debug!(
            order_id = %changes.order.id,
            order_status = %changes.order.status,
            tracking_status = %status,
            "Carrier status does not move the order"
        );
    }
    Ok(())
}

impl ShipmentService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn create_shipment(&self, request: CreateShipment, operator: Operator) -> Result<OrderShipment, AppError> {
        require_tracking(&request.carrier_code, &request.tracking_no)?;
        let order_id = request.order_id;
        let ship = Ship { request, operator };
        let executed = self.ctx.execute(order_id, &ship).await?;
        tracing::info!(
            order_id = %order_id,
            carrier = %executed.output.carrier_code,
            tracking_no = %executed.output.tracking_no,
            "Order shipped"
        );
        Ok(executed.output)
    }

    /// Apply a carrier webhook. Events already in the log are skipped, so a
    /// redelivered batch changes nothing.
    pub async fn ingest_tracking(
        &self,
        carrier: &str,
        tracking_no: &str,
        events: Vec<TrackingEvent>,
    ) -> Result<TrackingUpdate, AppError> {
        require_tracking(carrier, tracking_no)?;
        let shipment = self
            .ctx
            .store
            .shipment_by_tracking(carrier, tracking_no)
            .await?
            .ok_or_else(|| AppError::ShipmentNotFound(format!("{carrier}/{tracking_no}")))?;

        let ingest = Ingest { events };
        let executed = self.ctx.execute(shipment.order_id, &ingest).await?;
        let (appended, tracking_status) = executed.output;
        if appended > 0 {
            tracing::info!(
                order_id = %shipment.order_id,
                appended,
                tracking_status = %tracking_status,
                "Tracking events ingested"
            );
        }
        Ok(TrackingUpdate {
            order_id: shipment.order_id,
            appended,
            tracking_status,
            order_status: executed.order.status,
        })
    }

    pub async fn tracking(&self, order_id: Uuid, viewer: Operator) -> Result<OrderShipment, AppError> {
        let order = self
            .ctx
            .store
            .load_order(order_id)
            .await?
            .ok_or(AppError::OrderNotFound(order_id))?;
        authorize(&order, &viewer)?;
        self.ctx
            .store
            .shipment_for_order(order_id)
            .await?
            .ok_or_else(|| AppError::ShipmentNotFound(order_id.to_string()))
    }
}

struct Ship {
    request: CreateShipment,
    operator: Operator,
}

#[async_trait]
impl OrderMutation for Ship {
    type Output = OrderShipment;

    fn operation(&self) -> &'static str {
        "create_shipment"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<OrderShipment>, AppError> {
        if self.operator.is_buyer() {
            return Err(AppError::OrderAccessDenied(order.id));
        }
        if ctx.store.shipment_for_order(order.id).await?.is_some() {
            return Err(AppError::ShipmentExists(order.id));
        }

        let mut shipment = OrderShipment::new(
            order.id,
            self.request.carrier_code.clone(),
            self.request.tracking_no.clone(),
            now,
        );
        let mut changes = ChangeSet::update(order);
        ctx.advance(&mut changes, OrderStatus::Shipped, self.operator, None, now)?;

        let events = shipment.unseen(&self.request.events);
        shipment.append(&events, now);
        drive_order(ctx, &mut changes, shipment.status, now)?;

        changes.shipment = Some(ShipmentWrite::Insert(shipment.clone()));
        Ok(Planned::Commit {
            changes,
            output: shipment,
        })
    }
}

struct Ingest {
    events: Vec<TrackingEvent>,
}

#[async_trait]
impl OrderMutation for Ingest {
    type Output = (usize, TrackingStatus);

    fn operation(&self) -> &'static str {
        "ingest_tracking"
    }

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<Self::Output>, AppError> {
        let mut shipment = ctx
            .store
            .shipment_for_order(order.id)
            .await?
            .ok_or_else(|| AppError::ShipmentNotFound(order.id.to_string()))?;

        let fresh = shipment.unseen(&self.events);
        if fresh.is_empty() {
            return Ok(Planned::Unchanged {
                order,
                output: (0, shipment.status),
            });
        }

        shipment.append(&fresh, now);
        let mut changes = ChangeSet::update(order);
        drive_order(ctx, &mut changes, shipment.status, now)?;

        let output = (fresh.len(), shipment.status);
        changes.shipment = Some(ShipmentWrite::Append {
            shipment,
            events: fresh,
        });
        Ok(Planned::Commit { changes, output })
    }
}
