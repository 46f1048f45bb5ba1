//! Process-wide identifier source.
//!
//! One [`AtomicCounter`] is built at startup and handed (behind an `Arc`) to
//! every acceptor, so connection ids stay unique across the protocol socket,
//! the push-socket endpoint and the resource surface.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AtomicCounter {
    next: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter whose first id is `seed`.
    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Return the current value and advance.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`AtomicCounter::next_id`] will hand out.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_monotonic() {
        let counter = AtomicCounter::starting_at(10);
        assert_eq!(counter.next_id(), 10);
        assert_eq!(counter.next_id(), 11);
        assert_eq!(counter.peek(), 12);
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let counter = Arc::new(AtomicCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || (0..500).map(|_| c.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
