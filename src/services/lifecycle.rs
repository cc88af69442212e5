use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Instant;
use uuid::Uuid;

use super::AppContext;
use crate::domain::order::{Operator, Order, OrderStateMachine, OrderStatus};
use crate::errors::AppError;
use crate::storage::ChangeSet;

// ============================================================================
// Mutation Pipeline
// ============================================================================
//
// guard.run(order_id):
//   load order -> plan (validate, build ChangeSet) -> check invariants -> commit
// then, once committed:
//   transition metrics + logs -> cache invalidation
//
// A plan must read everything it depends on from storage inside `plan`, since
// a version conflict re-runs it from scratch.
//
// ============================================================================

/// Result of planning one mutation against a freshly loaded order.
pub enum Planned<T> {
    Commit { changes: ChangeSet, output: T },
    /// Nothing to write (idempotent replay, nothing due, ...)
    Unchanged { order: Order, output: T },
}

#[derive(Debug)]
pub struct Executed<T> {
    /// Order as committed, or as loaded when nothing was written
    pub order: Order,
    pub output: T,
    pub committed: bool,
}

#[async_trait]
pub trait OrderMutation: Send + Sync {
    type Output: Send;

    fn operation(&self) -> &'static str;

    async fn plan(&self, ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<Self::Output>, AppError>;
}

/// Buyers may only act on their own orders.
pub fn authorize(order: &Order, operator: &Operator) -> Result<(), AppError> {
    if operator.is_buyer() && operator.id != Some(order.user_id) {
        return Err(AppError::OrderAccessDenied(order.id));
    }
    Ok(())
}

impl AppContext {
    pub async fn execute<M: OrderMutation>(&self, order_id: Uuid, mutation: &M) -> Result<Executed<M::Output>, AppError> {
        let operation = mutation.operation();
        let started = Instant::now();
        let ctx = self;

        let result = self
            .guard
            .run(order_id, operation, |_attempt| async move {
                let order = ctx
                    .store
                    .load_order(order_id)
                    .await?
                    .ok_or(AppError::OrderNotFound(order_id))?;

                match mutation.plan(ctx, order, Utc::now()).await? {
                    Planned::Unchanged { order, output } => Ok::<_, AppError>((
                        Executed {
                            order,
                            output,
                            committed: false,
                        },
                        Vec::new(),
                    )),
                    Planned::Commit { changes, output } => {
                        changes.order.check_invariants()?;
                        let order = changes.order.clone();
                        let logs = changes.status_logs.clone();
                        ctx.store.commit(changes).await?;
                        Ok((
                            Executed {
                                order,
                                output,
                                committed: true,
                            },
                            logs,
                        ))
                    }
                }
            })
            .await;

        self.metrics
            .observe_operation(operation, started.elapsed().as_secs_f64());

        let (executed, logs) = result?;
        if executed.committed {
            for log in &logs {
                let from = log.from_status.map_or("none", |s| s.as_str());
                self.metrics.record_transition(from, log.to_status.as_str());
                tracing::info!(
                    order_id = %order_id,
                    from,
                    to = %log.to_status,
                    operator = %log.operator.kind.as_str(),
                    operation,
                    "Order transitioned"
                );
            }
            tracing::debug!(order_id = %order_id, operation, version = executed.order.version, "Order committed");
            self.cache.invalidate_order(order_id, executed.order.user_id).await;
        }

        Ok(executed)
    }

    /// Apply one state-machine transition to the order being changed.
    pub fn advance(
        &self,
        changes: &mut ChangeSet,
        to: OrderStatus,
        operator: Operator,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let outcome = OrderStateMachine::transition(
            &mut changes.order,
            to,
            &self.config.orders.transitions(),
            operator,
            reason,
            now,
        )?;
        changes.status_logs.push(outcome.log);
        changes.stock.extend(outcome.stock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OrderStore;
    use crate::testing::{sample_order, Harness};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Touch {
        calls: AtomicU32,
        skip: bool,
    }

    #[async_trait]
    impl OrderMutation for Touch {
        type Output = u32;

        fn operation(&self) -> &'static str {
            "touch"
        }

        async fn plan(&self, _ctx: &AppContext, order: Order, now: DateTime<Utc>) -> Result<Planned<u32>, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.skip {
                return Ok(Planned::Unchanged { order, output: call });
            }
            let mut changes = ChangeSet::update(order);
            changes.order.remark = Some(format!("touched at {now}"));
            Ok(Planned::Commit { changes, output: call })
        }
    }

    #[tokio::test]
    async fn test_commit_bumps_version_by_one() {
        let harness = Harness::new();
        let order = harness.insert_order(sample_order(Decimal::from(10))).await;
        let touch = Touch {
            calls: AtomicU32::new(0),
            skip: false,
        };

        let executed = harness.ctx.execute(order.id, &touch).await.unwrap();
        assert!(executed.committed);
        assert_eq!(executed.order.version, order.version + 1);

        let stored = harness.store.load_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.version, order.version + 1);
    }

    #[tokio::test]
    async fn test_unchanged_plan_writes_nothing() {
        let harness = Harness::new();
        let order = harness.insert_order(sample_order(Decimal::from(10))).await;
        let touch = Touch {
            calls: AtomicU32::new(0),
            skip: true,
        };

        let executed = harness.ctx.execute(order.id, &touch).await.unwrap();
        assert!(!executed.committed);
        assert_eq!(harness.store.load_order(order.id).await.unwrap().unwrap().version, order.version);
    }

    #[tokio::test]
    async fn test_missing_order_is_not_found() {
        let harness = Harness::new();
        let touch = Touch {
            calls: AtomicU32::new(0),
            skip: false,
        };
        let id = Uuid::new_v4();
        assert!(matches!(harness.ctx.execute(id, &touch).await, Err(AppError::OrderNotFound(x)) if x == id));
    }

    #[test]
    fn test_buyers_are_confined_to_their_orders() {
        let order = sample_order(Decimal::from(10));
        assert!(authorize(&order, &Operator::buyer(order.user_id)).is_ok());
        assert!(matches!(
            authorize(&order, &Operator::buyer(Uuid::new_v4())),
            Err(AppError::OrderAccessDenied(_))
        ));
        assert!(authorize(&order, &Operator::admin(Uuid::new_v4())).is_ok());
    }
}
