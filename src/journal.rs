//! Pairing of the durable event log with the derived state store.
//!
//! All state changes flow through [`Journal::record`]: the event is appended
//! to the log first (the write fence), then folded into the store. There is
//! no other way to mutate the projection, which is what makes replaying the
//! log reproduce the live state exactly.

use std::sync::Arc;

use crate::error::EventLogError;
use crate::events::{Event, EventLog};
use crate::state::{RuntimeSnapshot, StateStore};

/// Single writer over the event log + state store pair.
pub struct Journal {
    log: EventLog,
    store: StateStore,
}

impl Journal {
    pub fn new(log: EventLog, store: StateStore) -> Arc<Self> {
        Arc::new(Self { log, store })
    }

    /// Durably record `event` and fold it into the state.
    ///
    /// Returns the assigned sequence number. A failed log write is fatal to
    /// the caller; the store is not touched in that case.
    pub fn record(&self, mut event: Event) -> Result<u64, EventLogError> {
        let seq = self.log.append(event.clone())?;
        event.seq = seq;
        self.store.apply(&event);
        Ok(seq)
    }

    /// Copy-on-read view of the projected state.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.store.snapshot()
    }
}
