// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Platform-declared command spacing (MRTT) and rate cap (MPAR).
//!
//! MPAR is enforced by dropping: once a window's budget is spent every further
//! command fails until the window has run for a full minute. Nothing is queued.

use std::time::Duration;

use crate::clock::duration_to_ns;
use crate::{ChannelError, Result};

/// Length of one MPAR accounting window.
pub const MPAR_WINDOW: Duration = Duration::from_secs(60);

pub(crate) struct Throttle {
    min_turnaround_ns: u64,
    max_access_rate: u32,
    last_completion_ns: Option<u64>,
    window_start_ns: Option<u64>,
    remaining: u32,
}

impl Throttle {
    pub(crate) fn new(min_turnaround: Duration, max_access_rate: u32) -> Self {
        Self {
            min_turnaround_ns: duration_to_ns(min_turnaround),
            max_access_rate,
            last_completion_ns: None,
            window_start_ns: None,
            remaining: 0,
        }
    }

    /// Time still to wait before the next command may be posted.
    pub(crate) fn turnaround_remaining(&self, now_ns: u64) -> Option<Duration> {
        let last = self.last_completion_ns?;
        let elapsed = now_ns.saturating_sub(last);
        (elapsed < self.min_turnaround_ns)
            .then(|| Duration::from_nanos(self.min_turnaround_ns - elapsed))
    }

    /// Charges one command against the current window.
    pub(crate) fn admit(&mut self, now_ns: u64) -> Result<()> {
        if self.max_access_rate == 0 {
            return Ok(());
        }
        if self.remaining == 0 {
            if let Some(start) = self.window_start_ns {
                if now_ns.saturating_sub(start) < duration_to_ns(MPAR_WINDOW) {
                    return Err(ChannelError::RateLimited);
                }
            }
            self.window_start_ns = Some(now_ns);
            self.remaining = self.max_access_rate;
        }
        self.remaining -= 1;
        Ok(())
    }

    pub(crate) fn record_completion(&mut self, now_ns: u64) {
        self.last_completion_ns = Some(now_ns);
    }
}
