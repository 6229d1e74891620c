//! Outgoing message ids.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide source of unique outgoing message ids.
///
/// Ids are handed out in strictly increasing order of issuance. The counter is a single atomic, so any number of
/// concurrently running handlers may call [`next`](IdGenerator::next) without two calls returning the same value.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator whose first id is `first`.
    pub const fn starting_at(first: u64) -> Self {
        IdGenerator {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next id, or `None` once the ids are exhausted.
    ///
    /// `u64::MAX` is never issued. Once the counter reaches it every call returns `None`, so no id is ever
    /// handed out twice.
    pub fn try_next(&self) -> Option<u64> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .ok()
    }

    /// Returns the next id.
    ///
    /// # Panics
    ///
    /// Panics if the ids are exhausted. See [`try_next`](IdGenerator::try_next).
    pub fn next(&self) -> u64 {
        match self.try_next() {
            Some(id) => id,
            None => panic!("outgoing message ids exhausted"),
        }
    }

    /// Returns the id the next call to [`next`](IdGenerator::next) will return, without consuming it.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::starting_at(1)
    }
}
