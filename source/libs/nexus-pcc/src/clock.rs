// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Time sources for deadline polling and command spacing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Clock source used by the ownership poll, MRTT spacing and MPAR windows.
pub trait Clock: Send + Sync {
    /// Monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Stalls the calling thread for `duration`.
    fn delay(&self, duration: Duration);
}

/// Host clock backed by `std::time::Instant`.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        duration_to_ns(self.start.elapsed())
    }

    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Synthetic clock that only moves when someone delays on it or advances it.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration_to_ns(duration), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub(crate) fn duration_to_ns(d: Duration) -> u64 {
    d.as_secs().saturating_mul(1_000_000_000).saturating_add(u64::from(d.subsec_nanos()))
}
