//! Correlation id generator

use std::sync::atomic::{AtomicI64, Ordering};

/// Ids wrap back to 1 before reaching this bound
pub const MAX_SEQUENCE_ID: i64 = 0x7fff_ffff;

/// Cyclic correlation id source, one per pool
///
/// Emits `1, 2, …, MAX_SEQUENCE_ID - 1, 1, 2, …`. Never emits 0 or negative
/// ids; `-1` is reserved for the readiness signal.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Generator whose first id is `id`, clamped into the valid range
    pub fn starting_at(id: i64) -> Self {
        Self {
            next: AtomicI64::new(id.clamp(1, MAX_SEQUENCE_ID - 1)),
        }
    }

    pub fn next_id(&self) -> i64 {
        let previous = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                let following = id + 1;
                Some(if following >= MAX_SEQUENCE_ID {
                    1
                } else {
                    following
                })
            });
        match previous {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_one() {
        let ids = SequenceGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_wraps_before_boundary() {
        let ids = SequenceGenerator::starting_at(MAX_SEQUENCE_ID - 2);
        assert_eq!(ids.next_id(), MAX_SEQUENCE_ID - 2);
        assert_eq!(ids.next_id(), MAX_SEQUENCE_ID - 1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_starting_point_clamped() {
        assert_eq!(SequenceGenerator::starting_at(0).next_id(), 1);
        assert_eq!(SequenceGenerator::starting_at(-1).next_id(), 1);
        assert_eq!(
            SequenceGenerator::starting_at(i64::MAX).next_id(),
            MAX_SEQUENCE_ID - 1
        );
    }

    #[test]
    fn test_independent_generators() {
        let a = SequenceGenerator::new();
        let b = SequenceGenerator::new();
        a.next_id();
        a.next_id();
        assert_eq!(b.next_id(), 1);
    }

    #[test]
    fn test_concurrent_ids_unique() {
        let ids = std::sync::Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
