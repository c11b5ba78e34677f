//! Per-category cooldown gate
//!
//! The vision service reports a held gesture on every poll. The gate collapses
//! those repeats into one trigger per window and per gesture type, so only the
//! first observation of a window reaches the inference providers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

pub struct CooldownGate {
    /// Category → last trigger time in milliseconds on the gate's clock.
    last_triggered: DashMap<String, u64>,
    epoch: Instant,
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownGate {
    pub fn new() -> Self {
        Self {
            last_triggered: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Returns true and records `now_ms` iff more than `window_ms` elapsed
    /// since the category last fired. Unknown categories always fire.
    ///
    /// A `now_ms` earlier than the recorded trigger is refused, so the stored
    /// time never moves backwards.
    pub fn try_acquire(&self, category: &str, now_ms: u64, window_ms: u64) -> bool {
        match self.last_triggered.entry(category.to_string()) {
            Entry::Occupied(mut entry) => {
                let last = *entry.get();
                if now_ms > last && now_ms - last > window_ms {
                    entry.insert(now_ms);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now_ms);
                true
            }
        }
    }

    /// [`try_acquire`](Self::try_acquire) against the gate's monotonic clock.
    pub fn try_acquire_now(&self, category: &str, window: Duration) -> bool {
        self.try_acquire(category, self.now_ms(), window.as_millis() as u64)
    }

    /// Milliseconds since the gate was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn last_triggered(&self, category: &str) -> Option<u64> {
        self.last_triggered.get(category).map(|v| *v)
    }

    pub fn reset(&self) {
        self.last_triggered.clear();
    }

    /// Number of categories that have fired at least once.
    pub fn len(&self) -> usize {
        self.last_triggered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_triggered.is_empty()
    }
}
