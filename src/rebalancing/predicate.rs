//! Filters applied to entries while rebalancing.

use crate::clock::Clock;
use crate::storage::GridEntry;
use crate::types::PartitionId;
use std::sync::Arc;

/// Decides whether an entry takes part in rebalancing.
///
/// Evaluated by the supplier before sending and by the demander before
/// applying. Entries for which it returns false are skipped.
pub type PreloadPredicate = Arc<dyn Fn(PartitionId, &GridEntry) -> bool + Send + Sync>;

/// Predicate that skips entries already expired according to `clock`.
pub fn skip_expired(clock: Arc<dyn Clock>) -> PreloadPredicate {
    Arc::new(move |_: PartitionId, entry: &GridEntry| {
        !entry.is_expired(clock.wall_millis())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn test_skip_expired() {
        let predicate = skip_expired(Arc::new(SystemClock));

        assert!(predicate(0, &GridEntry::new("live", "v", 1)));
        assert!(!predicate(0, &GridEntry::new("dead", "v", 1).with_expiration(1)));
        assert!(predicate(
            0,
            &GridEntry::new("later", "v", 1).with_expiration(u64::MAX)
        ));
    }
}
