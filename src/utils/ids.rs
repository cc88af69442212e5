use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

// ============================================================================
// Business Reference Numbers
// ============================================================================
//
// Orders:      yyyyMMddHHmmss + 6 random digits
// Payments:    "P"  + yyyyMMddHHmmss + 6 random digits
// After-sales: "AS" + yyyyMMddHHmmss + 6 random digits
// Refunds:     derived, so a retried refund reuses the same number and the
//              gateway can deduplicate it
//
// ============================================================================

fn stamped(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{prefix}{}{suffix:06}", now.format("%Y%m%d%H%M%S"))
}

pub fn order_no(now: DateTime<Utc>) -> String {
    stamped("", now)
}

pub fn payment_no(now: DateTime<Utc>) -> String {
    stamped("P", now)
}

pub fn after_sale_no(now: DateTime<Utc>) -> String {
    stamped("AS", now)
}

/// Refund number for one slice of a refund against one payment.
///
/// `source` identifies what triggered the refund (an after-sale id or the order
/// id for a cancellation); `sequence` distinguishes successive refunds drawn
/// from the same payment by the same source.
pub fn refund_no(payment_no: &str, source: Uuid, sequence: u32) -> String {
    let simple = source.simple().to_string();
    format!("R{payment_no}-{}-{sequence}", &simple[..8])
}
