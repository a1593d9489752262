//! Transaction id allocation
//!
//! This link answers StartTransaction in the central system role, so it hands
//! out the transaction ids. Ids come from one process-wide counter seeded from
//! the wall clock, which keeps them increasing across connectors, connections
//! and (at under one transaction per second on average) process restarts.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Shared, monotonically increasing transaction id source
#[derive(Debug, Clone)]
pub struct TransactionIds {
    next: Arc<AtomicI32>,
}

impl TransactionIds {
    /// Seed from the current Unix time in seconds
    pub fn new() -> Self {
        let seed = Utc::now().timestamp().rem_euclid(i32::MAX as i64) as i32;
        Self::starting_at(seed)
    }

    /// Start from a fixed id (ids are always positive)
    pub fn starting_at(first: i32) -> Self {
        Self {
            next: Arc::new(AtomicI32::new(first.max(1))),
        }
    }

    /// Allocate the next id, wrapping back to 1 after `i32::MAX`
    pub fn next(&self) -> i32 {
        let step = |v: i32| Some(if v == i32::MAX { 1 } else { v + 1 });
        match self.next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, step) {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_increase() {
        let ids = TransactionIds::starting_at(100);
        assert_eq!(ids.next(), 100);
        assert_eq!(ids.next(), 101);
    }

    #[test]
    fn test_clones_share_the_counter() {
        let a = TransactionIds::starting_at(1);
        let b = a.clone();
        assert_eq!(a.next(), 1);
        assert_eq!(b.next(), 2);
    }

    #[test]
    fn test_wraps_to_positive() {
        let ids = TransactionIds::starting_at(i32::MAX);
        assert_eq!(ids.next(), i32::MAX);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn test_unique_across_threads() {
        let ids = TransactionIds::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id > 0);
                assert!(seen.insert(id), "duplicate transaction id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
