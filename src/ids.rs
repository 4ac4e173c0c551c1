//! Monotonic, collision-free id generation.
//!
//! Candidate ids are plain integers, monotonically increasing within the
//! process. On startup the generator is seeded past the highest candidate id
//! observed in the scanned event log, so a restarted runtime never reuses an
//! id that already appears on disk.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::Event;

/// Generates monotonically increasing `u64` ids.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Seed from previously logged events: `1 + max(candidate_id observed)`.
    pub fn seeded_from(events: &[Event]) -> Self {
        let max_seen = events.iter().filter_map(|e| e.candidate_id).max().unwrap_or(0);
        Self::starting_at(max_seen + 1)
    }

    /// Return the next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let ids = IdGenerator::starting_at(1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn seed_skips_past_logged_candidates() {
        let events = vec![
            Event::runtime_started(1),
            Event::candidate_aborted(4),
            Event::candidate_aborted(2),
        ];
        let ids = IdGenerator::seeded_from(&events);
        assert_eq!(ids.next_id(), 5);
    }

    #[test]
    fn seed_from_empty_log_starts_at_one() {
        let ids = IdGenerator::seeded_from(&[]);
        assert_eq!(ids.next_id(), 1);
    }
}
