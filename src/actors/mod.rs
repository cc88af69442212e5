// ============================================================================
// Actors Module
// ============================================================================
//
// Actors are reserved for scheduling concerns. Order mutations go through the
// services and their optimistic guard, not through actor mailboxes.
//
// ============================================================================

mod reconciler;

pub use reconciler::{ReconcilerActor, SweepNow};
