use actix::prelude::*;
use std::time::Duration;

use crate::services::{ExpiryReconciler, SweepReport};

// ============================================================================
// Reconciler Actor - Drives expiry sweeps on a fixed interval
// ============================================================================
//
// The sweep itself lives in `ExpiryReconciler`; this actor only owns the
// schedule. A tick that lands while the previous sweep is still running is
// dropped by the reconciler.
//
// ============================================================================

/// Run one sweep immediately, outside the schedule.
#[derive(Message)]
#[rtype(result = "Option<SweepReport>")]
pub struct SweepNow;

pub struct ReconcilerActor {
    reconciler: ExpiryReconciler,
    interval: Duration,
}

impl ReconcilerActor {
    pub fn new(reconciler: ExpiryReconciler, interval: Duration) -> Self {
        Self { reconciler, interval }
    }
}

impl Actor for ReconcilerActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(interval_secs = self.interval.as_secs(), "ReconcilerActor started");

        ctx.run_interval(self.interval, |act, _ctx| {
            let reconciler = act.reconciler.clone();
            actix::spawn(async move {
                reconciler.sweep().await;
            });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("ReconcilerActor stopped");
    }
}

impl Handler<SweepNow> for ReconcilerActor {
    type Result = ResponseFuture<Option<SweepReport>>;

    fn handle(&mut self, _msg: SweepNow, _: &mut Self::Context) -> Self::Result {
        let reconciler = self.reconciler.clone();
        Box::pin(async move { reconciler.sweep().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderStatus;
    use crate::testing::{sample_order, Harness};
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[actix::test]
    async fn test_sweep_now_cancels_expired_order() {
        let harness = Harness::new();
        let mut order = sample_order(Decimal::from(10));
        order.pay_expire_at = Utc::now() - chrono::Duration::minutes(1);
        let order = harness.insert_order(order).await;

        let actor = ReconcilerActor::new(harness.services.reconciler.clone(), Duration::from_secs(3600)).start();
        let report = actor.send(SweepNow).await.unwrap().unwrap();

        assert_eq!(report.cancelled, 1);
        assert_eq!(harness.order(order.id).await.status, OrderStatus::Cancelled);
    }

    #[actix::test]
    async fn test_interval_tick_runs_sweep() {
        let harness = Harness::new();
        let mut order = sample_order(Decimal::from(10));
        order.pay_expire_at = Utc::now() - chrono::Duration::minutes(1);
        let order = harness.insert_order(order).await;

        let _actor = ReconcilerActor::new(harness.services.reconciler.clone(), Duration::from_millis(20)).start();

        for _ in 0..50 {
            if harness.order(order.id).await.status == OrderStatus::Cancelled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("scheduled sweep never cancelled the expired order");
    }
}
