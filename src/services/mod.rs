// ============================================================================
// Order Services
// ============================================================================
//
// Every collaborator is built once at startup and handed to the services
// through one `AppContext`; there are no process-wide accessors.
//
//   OrderService      create / query / cancel / close / receipt / complete
//   PaymentService    initiate / cancel / gateway callbacks / status
//   AfterSaleService  refund, return and exchange requests
//   ShipmentService   shipping and carrier tracking
//   ExpiryReconciler  periodic deadline sweeps
//
// ============================================================================

pub mod after_sales;
pub mod lifecycle;
pub mod orders;
pub mod payments;
pub mod reconciler;
pub mod refunds;
pub mod shipments;

pub use after_sales::{AfterSaleOutcome, AfterSaleService, SubmitAfterSale};
pub use lifecycle::{Executed, OrderMutation, Planned};
pub use orders::{
    CancelOutcome, CartLine, CreateOrderRequest, DiscountPolicy, DiscountRequest, NoDiscounts, OrderCreated,
    OrderHistory, OrderService,
};
pub use payments::{CallbackAck, CallbackResponse, CreatePaymentRequest, PaymentCreated, PaymentService};
pub use reconciler::{ExpiryReconciler, SweepReport};
pub use shipments::{CreateShipment, ShipmentService, TrackingUpdate};

use std::sync::Arc;

use crate::cache::OrderCache;
use crate::concurrency::OptimisticGuard;
use crate::config::AppConfig;
use crate::gateway::GatewayRegistry;
use crate::metrics::Metrics;
use crate::storage::OrderStore;

/// Application-scoped collaborators shared by every service.
pub struct AppContext {
    pub store: Arc<dyn OrderStore>,
    pub guard: OptimisticGuard,
    pub cache: OrderCache,
    pub gateways: GatewayRegistry,
    pub discounts: Arc<dyn DiscountPolicy>,
    pub metrics: Arc<Metrics>,
    pub config: AppConfig,
}

#[derive(Clone)]
pub struct Services {
    pub orders: OrderService,
    pub payments: PaymentService,
    pub after_sales: AfterSaleService,
    pub shipments: ShipmentService,
    pub reconciler: ExpiryReconciler,
}

impl Services {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            orders: OrderService::new(ctx.clone()),
            payments: PaymentService::new(ctx.clone()),
            after_sales: AfterSaleService::new(ctx.clone()),
            shipments: ShipmentService::new(ctx.clone()),
            reconciler: ExpiryReconciler::new(ctx),
        }
    }
}
