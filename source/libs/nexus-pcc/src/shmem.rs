// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared memory command region of a PCC subspace
//!
//! Layout of the generic communications shared memory region:
//!
//! ```text
//! 0x00  signature  u32   0x50434300 | subspace id
//! 0x04  command    u16
//! 0x06  status     u16   PccStatus bits
//! 0x08  payload          register offsets are relative to this point
//! ```
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code; every byte is an atomic cell so OS and platform threads may touch
//!     disjoint fields concurrently
//!   - All accesses are bounds checked against the mapped length

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use nexus_hal::HalError;

/// Signature base; the subspace id is or-ed into the low byte.
pub const PCC_SIGNATURE: u32 = 0x5043_4300;

/// Bytes preceding the payload.
pub const HEADER_LEN: usize = 8;

const SIGNATURE_OFFSET: usize = 0;
const COMMAND_OFFSET: usize = 4;
const STATUS_OFFSET: usize = 6;

bitflags! {
    /// Status word of the shared region header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PccStatus: u16 {
        /// The platform finished the last command; the OS owns the region.
        const COMMAND_COMPLETE = 1 << 0;
        const PLATFORM_INTERRUPT = 1 << 1;
        /// The last command failed on the platform side.
        const ERROR = 1 << 2;
        const PLATFORM_NOTIFICATION = 1 << 3;
    }
}

/// Source of the completion status while waiting for the platform.
pub trait CompletionPoll: Send + Sync {
    /// Reads the status word once.
    fn poll_status(&self) -> PccStatus;
}

/// Handle to a shared command region. Clones alias the same memory.
#[derive(Clone)]
pub struct SharedRegion {
    bytes: Arc<[AtomicU8]>,
}

impl SharedRegion {
    /// Allocates a zeroed region of `len` bytes.
    pub fn new(len: usize) -> Self {
        let bytes: Vec<AtomicU8> = (0..len).map(|_| AtomicU8::new(0)).collect();
        Self { bytes: bytes.into() }
    }

    /// Allocates a region the way firmware leaves it at boot: signed for
    /// `subspace` with the completion bit set.
    pub fn initialized(subspace: u8, len: usize) -> Self {
        let region = Self::new(len.max(HEADER_LEN));
        region.store(SIGNATURE_OFFSET, 4, u64::from(PCC_SIGNATURE | u32::from(subspace)));
        region.set_status(PccStatus::COMMAND_COMPLETE);
        region
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn signature(&self) -> u32 {
        self.load(SIGNATURE_OFFSET, 4) as u32
    }

    pub fn command(&self) -> u16 {
        self.load(COMMAND_OFFSET, 2) as u16
    }

    pub fn set_command(&self, command: u16) {
        self.store(COMMAND_OFFSET, 2, u64::from(command));
    }

    pub fn status(&self) -> PccStatus {
        PccStatus::from_bits_retain(self.load(STATUS_OFFSET, 2) as u16)
    }

    pub fn set_status(&self, status: PccStatus) {
        self.store(STATUS_OFFSET, 2, u64::from(status.bits()));
    }

    /// Platform side: flag the current command as done, optionally failed.
    pub fn complete(&self, failed: bool) {
        let mut status = self.status() | PccStatus::COMMAND_COMPLETE;
        status.set(PccStatus::ERROR, failed);
        self.set_status(status);
    }

    /// Reads a `bit_width` register at `offset` bytes into the payload.
    pub fn read(&self, offset: u64, bit_width: u8) -> Result<u64, HalError> {
        let (start, len) = self.payload_span(offset, bit_width)?;
        Ok(self.load(start, len))
    }

    /// Writes a `bit_width` register at `offset` bytes into the payload.
    pub fn write(&self, offset: u64, bit_width: u8, value: u64) -> Result<(), HalError> {
        let (start, len) = self.payload_span(offset, bit_width)?;
        self.store(start, len, value);
        Ok(())
    }

    fn payload_span(&self, offset: u64, bit_width: u8) -> Result<(usize, usize), HalError> {
        let len = match bit_width {
            8 | 16 | 32 | 64 => usize::from(bit_width / 8),
            other => return Err(HalError::BadWidth(other)),
        };
        let start = usize::try_from(offset)
            .ok()
            .and_then(|off| off.checked_add(HEADER_LEN))
            .filter(|start| start.checked_add(len).is_some_and(|end| end <= self.bytes.len()))
            .ok_or(HalError::OutOfBounds { offset, len })?;
        Ok((start, len))
    }

    // Little endian, byte-wise; callers guarantee the span is in bounds.
    fn load(&self, start: usize, len: usize) -> u64 {
        self.bytes[start..start + len]
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(byte.load(Ordering::Acquire)))
    }

    fn store(&self, start: usize, len: usize, value: u64) {
        for (i, byte) in self.bytes[start..start + len].iter().enumerate() {
            byte.store((value >> (8 * i)) as u8, Ordering::Release);
        }
    }
}

impl CompletionPoll for SharedRegion {
    fn poll_status(&self) -> PccStatus {
        self.status()
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len())
            .field("signature", &format_args!("{:#x}", self.signature()))
            .field("status", &self.status())
            .finish()
    }
}
