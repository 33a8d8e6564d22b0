//! Time-sortable identifiers.
//!
//! Every identifier that needs creation-order (events, versions, branches) is
//! a UUIDv7: the first 48 bits are a millisecond Unix timestamp, so lexical
//! and numeric comparison of two ids agree with their creation order.

use uuid::Uuid;

/// Mint a new time-sortable id.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// True if `a` was minted no later than `b`.
pub fn happens_before_or_eq(a: Uuid, b: Uuid) -> bool {
    a <= b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_enough_for_ordering() {
        let a = new_id();
        let b = new_id();
        assert!(happens_before_or_eq(a, b) || a == b);
    }
}
