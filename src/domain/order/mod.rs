// ============================================================================
// Order Domain - Business Logic for the Order Aggregate
// ============================================================================
//
// - Value objects (OrderStatus, Operator, ShippingAddress)
// - Aggregate (Order, OrderItem, OrderStatusLog + amount invariants)
// - Transitions (static transition table and the state machine)
// - Errors (OrderError)
//
// ============================================================================

pub mod value_objects;
pub mod errors;
pub mod aggregate;
pub mod transitions;

pub use value_objects::*;
pub use errors::*;
pub use aggregate::*;
pub use transitions::*;
