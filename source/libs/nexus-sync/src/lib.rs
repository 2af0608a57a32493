// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking synchronisation helpers for host and driver services
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 unit tests
//!
//! PUBLIC API:
//!   - SequenceGate: monotonically increasing counter; waiters park until it moves past
//!     the value they observed

#![forbid(unsafe_code)]

use parking_lot::{Condvar, Mutex};

/// Counter that only moves forward and wakes every waiter when it does.
///
/// Waiters record [`SequenceGate::current`] and later park in
/// [`SequenceGate::wait_past`] until some other thread calls
/// [`SequenceGate::advance`]. The check and the park happen under the same
/// lock, so an advance between the two is never lost.
pub struct SequenceGate {
    value: Mutex<u64>,
    advanced: Condvar,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self { value: Mutex::new(0), advanced: Condvar::new() }
    }

    pub fn current(&self) -> u64 {
        *self.value.lock()
    }

    /// Moves the counter forward by one and wakes all waiters. Returns the new value.
    pub fn advance(&self) -> u64 {
        let mut value = self.value.lock();
        *value = value.wrapping_add(1);
        self.advanced.notify_all();
        *value
    }

    /// Blocks until the counter differs from `seen`. Returns the value observed.
    pub fn wait_past(&self, seen: u64) -> u64 {
        let mut value = self.value.lock();
        while *value == seen {
            self.advanced.wait(&mut value);
        }
        *value
    }
}

impl Default for SequenceGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::SequenceGate;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn advance_is_monotonic() {
        let gate = SequenceGate::new();
        assert_eq!(gate.current(), 0);
        assert_eq!(gate.advance(), 1);
        assert_eq!(gate.advance(), 2);
        assert_eq!(gate.current(), 2);
    }

    #[test]
    fn wait_past_returns_immediately_when_moved() {
        let gate = SequenceGate::new();
        gate.advance();
        assert_eq!(gate.wait_past(0), 1);
    }

    #[test]
    fn all_waiters_wake_on_one_advance() {
        let gate = Arc::new(SequenceGate::new());
        let seen = gate.current();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait_past(seen))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        gate.advance();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), seen + 1);
        }
    }
}
