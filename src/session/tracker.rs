//! Per-connection id bookkeeping
//!
//! Ids are connection-scoped: every connection owns its counters and
//! trackers, nothing here is shared across connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Monotonic id source; never yields 0 and never reuses a value
#[derive(Debug)]
pub struct IdCounter(AtomicU32);

impl IdCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rids of requests the broker has sent to a responder and not seen closed
#[derive(Debug, Default)]
pub struct RequestTracker {
    counter: IdCounter,
    in_flight: Mutex<HashSet<u32>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and track a fresh rid
    pub fn allocate(&self) -> Result<u32> {
        let rid = self.counter.next();
        self.track(rid)?;
        Ok(rid)
    }

    pub fn track(&self, rid: u32) -> Result<()> {
        if !self.in_flight.lock().insert(rid) {
            return Err(Error::DuplicateTracking { kind: "rid", id: rid });
        }
        Ok(())
    }

    pub fn untrack(&self, rid: u32) -> bool {
        self.in_flight.lock().remove(&rid)
    }

    pub fn is_tracked(&self, rid: u32) -> bool {
        self.in_flight.lock().contains(&rid)
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ids a client has opened with the broker, mapped to what serves them
///
/// An id can be reserved before the value serving it exists, so a
/// duplicate is rejected before any work is done for it.
#[derive(Debug)]
pub struct ResponseTracker<T> {
    kind: &'static str,
    entries: Mutex<HashMap<u32, Option<T>>>,
}

impl<T> ResponseTracker<T> {
    /// `kind` names the id space in errors ("rid", "sid")
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fail if `id` is already in use
    pub fn check(&self, id: u32) -> Result<()> {
        if self.entries.lock().contains_key(&id) {
            return Err(self.duplicate(id));
        }
        Ok(())
    }

    pub fn track(&self, id: u32, value: T) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(self.duplicate(id));
        }
        entries.insert(id, Some(value));
        Ok(())
    }

    /// Claim `id` ahead of its value
    pub fn reserve(&self, id: u32) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(self.duplicate(id));
        }
        entries.insert(id, None);
        Ok(())
    }

    /// Store `value` under a reserved `id`
    ///
    /// Returns false if the reservation is gone (untracked or drained in
    /// the meantime) or already filled; `value` is not stored.
    pub fn fill(&self, id: u32, value: T) -> bool {
        match self.entries.lock().get_mut(&id) {
            Some(slot) if slot.is_none() => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Release `id`, returning its value if it was filled
    pub fn untrack(&self, id: u32) -> Option<T> {
        self.entries.lock().remove(&id).flatten()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Remove every entry, returning the filled ones
    pub fn drain(&self) -> Vec<(u32, T)> {
        self.entries
            .lock()
            .drain()
            .filter_map(|(id, value)| value.map(|value| (id, value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn duplicate(&self, id: u32) -> Error {
        Error::DuplicateTracking {
            kind: self.kind,
            id,
        }
    }
}
