// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Pure types and rules. Nothing here performs I/O; the services layer loads
// state, asks the domain what changes, and commits the result atomically.
//
// - order:      aggregate, value objects and the status state machine
// - stock:      SKU ledger movements
// - payment:    payment records, callbacks and refund allocation
// - after_sale: refund/return/exchange requests and their workflow
// - shipment:   carrier tracking log
//
// ============================================================================

pub mod order;
pub mod stock;
pub mod payment;
pub mod after_sale;
pub mod shipment;
