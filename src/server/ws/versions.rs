//! Presence/health state versions
//!
//! Two independent process-wide counters stamped onto `presence` and
//! `health` broadcasts. A client that observes `N` and then `N + 2` on the
//! same stream knows it missed exactly one update and can resync via
//! `system-presence` or `health`.
//!
//! Counters are `u64`, start at zero and do not wrap within a process
//! lifetime.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of both counters, serialized as `stateVersion`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

#[derive(Debug, Default)]
pub struct StateVersions {
    presence: AtomicU64,
    health: AtomicU64,
}

impl StateVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the presence version and return the new value.
    pub fn bump_presence(&self) -> u64 {
        self.presence.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_presence(&self) -> u64 {
        self.presence.load(Ordering::Acquire)
    }

    /// Increment the health version and return the new value.
    pub fn bump_health(&self) -> u64 {
        self.health.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_health(&self) -> u64 {
        self.health.load(Ordering::Acquire)
    }

    pub fn current(&self) -> StateVersion {
        StateVersion {
            presence: self.current_presence(),
            health: self.current_health(),
        }
    }
}
