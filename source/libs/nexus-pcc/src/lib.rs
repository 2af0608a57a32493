// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Platform Communication Channel (PCC) mailbox manager
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module, integration tests for ownership and batching
//!
//! PUBLIC API:
//!   - PccChannel: ownership protocol over one shared command region + doorbell
//!   - ChannelGuard: exclusive access; the only way to submit a command
//!   - Requestor: per-caller slot for batched writes (PccChannel::write_batched)
//!   - SubspaceConfig: immutable channel registration parameters
//!   - SharedRegion / CompletionPoll: comm region and completion polling seam
//!   - Clock: time source for deadlines, MRTT spacing and MPAR windows
//!   - host::LoopbackPlatform: in-process platform used by host tests
//!
//! CONCURRENCY:
//!   - Writers stage under shared access and race for exclusive access without blocking;
//!     the winner rings the doorbell once for the whole batch, losers wait on the write
//!     sequence and read their result slot.
//!   - A read command drains any staged write before it is posted.
//!
//! ERROR CONDITIONS:
//!   - ChannelError::Timeout: platform did not complete within the deadline
//!   - ChannelError::RemoteError: platform completed with the error bit set
//!   - ChannelError::RateLimited: MPAR budget for the current 60 s window is spent
//!   - ChannelError::Transport: doorbell refused the command
//!   - ChannelError::InvalidData: platform returned zero for a mandatory field
//!
//! DEPENDENCIES:
//!   - nexus-hal: Doorbell and register contracts
//!   - nexus-sync: SequenceGate for batched waiters
//!   - parking_lot: RwLock with try_write for flush election

#![forbid(unsafe_code)]
#![deny(clippy::all)]

mod batch;
mod channel;
mod clock;
mod config;
pub mod host;
mod shmem;
mod throttle;

pub use batch::Requestor;
pub use channel::{ChannelGuard, PccChannel, POLL_INTERVAL};
pub use clock::{Clock, HostClock, ManualClock};
pub use config::{ConfigError, SubspaceConfig, NUM_RETRIES};
pub use shmem::{CompletionPoll, PccStatus, SharedRegion, HEADER_LEN, PCC_SIGNATURE};
pub use throttle::MPAR_WINDOW;

use nexus_hal::HalError;
use thiserror::Error;

/// Result alias for channel operations.
pub type Result<T> = core::result::Result<T, ChannelError>;

/// Failures of a single channel command. None of them poison the channel.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The platform did not signal completion within the deadline.
    #[error("platform did not complete the command in time")]
    Timeout,
    /// The platform completed the command and flagged an error.
    #[error("platform reported a command error")]
    RemoteError,
    /// The periodic access budget is exhausted; the command was dropped.
    #[error("command dropped: periodic access rate exceeded")]
    RateLimited,
    /// The doorbell could not post the command.
    #[error("transport error: {0}")]
    Transport(HalError),
    /// A mandatory telemetry field read back as zero.
    #[error("platform returned invalid data")]
    InvalidData,
    /// A register backing a field could not be accessed.
    #[error("register access failed: {0}")]
    Register(HalError),
}

/// Commands understood by the platform side of a CPPC channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Refresh the shared region with platform-owned values.
    Read,
    /// Consume values the OS staged in the shared region.
    Write,
}

impl Command {
    pub const fn code(self) -> u16 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelError, Command};
    use nexus_hal::HalError;

    #[test]
    fn command_codes_roundtrip() {
        for cmd in [Command::Read, Command::Write] {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_code(7), None);
    }

    #[test]
    fn transport_error_mentions_cause() {
        let err = ChannelError::Transport(HalError::Busy);
        assert_eq!(err.to_string(), "transport error: doorbell busy");
    }
}
