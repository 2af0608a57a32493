// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware access contracts shared by platform drivers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 4 unit tests, 3 integration tests
//!
//! PUBLIC API:
//!   - RegisterDescriptor / AddressSpace: where a firmware-described register lives
//!   - RegisterAccess: address-space polymorphic register reads and writes
//!   - Doorbell: notification primitive for mailbox style channels
//!   - HalError: failures reported by the primitives above

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

use core::fmt;

/// Address space a register is described in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Plain memory-mapped register.
    SystemMemory,
    /// Port I/O space.
    SystemIo,
    /// Offset into a platform communication channel payload.
    PlatformComm,
    /// Firmware-defined accessor.
    FixedHardware,
}

/// Firmware-supplied register location (generic address structure).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegisterDescriptor {
    pub space: AddressSpace,
    pub address: u64,
    pub bit_width: u8,
    pub bit_offset: u8,
    /// Access size; for platform channel registers this carries the subspace id.
    pub access_width: u8,
}

impl RegisterDescriptor {
    /// Descriptor for a register that is not implemented by the platform.
    pub const NULL: Self = Self {
        space: AddressSpace::SystemMemory,
        address: 0,
        bit_width: 0,
        bit_offset: 0,
        access_width: 0,
    };

    pub const fn system_memory(address: u64, bit_width: u8) -> Self {
        Self { space: AddressSpace::SystemMemory, address, bit_width, bit_offset: 0, access_width: 0 }
    }

    /// `address` is relative to the channel payload, `subspace` selects the channel.
    pub const fn platform_comm(address: u64, bit_width: u8, subspace: u8) -> Self {
        Self {
            space: AddressSpace::PlatformComm,
            address,
            bit_width,
            bit_offset: 0,
            access_width: subspace,
        }
    }

    pub const fn fixed_hardware(address: u64, bit_width: u8) -> Self {
        Self { space: AddressSpace::FixedHardware, address, bit_width, bit_offset: 0, access_width: 0 }
    }

    /// Returns `true` for the all-zero system memory descriptor.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Width in bytes for naturally sized registers.
    pub const fn width_bytes(&self) -> Option<usize> {
        match self.bit_width {
            8 => Some(1),
            16 => Some(2),
            32 => Some(4),
            64 => Some(8),
            _ => None,
        }
    }
}

/// Errors produced by register accessors and doorbells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// The address space is not handled by this accessor.
    Unsupported(AddressSpace),
    /// The register width cannot be accessed.
    BadWidth(u8),
    /// Access fell outside the mapped window.
    OutOfBounds { offset: u64, len: usize },
    /// The notification primitive refused the message.
    Busy,
    /// Device-specific failure code.
    Device(i32),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(space) => write!(f, "address space {space:?} not supported"),
            Self::BadWidth(bits) => write!(f, "cannot access {bits} bit register"),
            Self::OutOfBounds { offset, len } => {
                write!(f, "access of {len} bytes at {offset:#x} out of bounds")
            }
            Self::Busy => write!(f, "doorbell busy"),
            Self::Device(code) => write!(f, "device error {code}"),
        }
    }
}

/// Reads and writes single registers regardless of address space.
pub trait RegisterAccess: Send + Sync {
    /// Reads the register on behalf of `cpu`.
    fn read(&self, cpu: usize, reg: &RegisterDescriptor) -> Result<u64, HalError>;

    /// Writes `value` to the register on behalf of `cpu`.
    fn write(&self, cpu: usize, reg: &RegisterDescriptor, value: u64) -> Result<(), HalError>;

    /// Whether registers in `space` can be reached through this accessor.
    fn supports(&self, space: AddressSpace) -> bool {
        matches!(space, AddressSpace::SystemMemory)
    }
}

/// Notification primitive telling the remote side a command was posted.
pub trait Doorbell: Send + Sync {
    /// Posts `command` to the remote side.
    fn ring(&self, command: u16) -> Result<(), HalError>;

    /// Reports the outcome of the last posted command back to the transport.
    fn tx_done(&self, _ok: bool) {}
}

#[cfg(test)]
mod tests {
    use super::{AddressSpace, Doorbell, HalError, RegisterAccess, RegisterDescriptor};

    struct MockRegs(u64);

    impl RegisterAccess for MockRegs {
        fn read(&self, _cpu: usize, reg: &RegisterDescriptor) -> Result<u64, HalError> {
            if self.supports(reg.space) {
                Ok(self.0)
            } else {
                Err(HalError::Unsupported(reg.space))
            }
        }

        fn write(&self, _cpu: usize, _reg: &RegisterDescriptor, _value: u64) -> Result<(), HalError> {
            Ok(())
        }
    }

    struct MockDoorbell;

    impl Doorbell for MockDoorbell {
        fn ring(&self, _command: u16) -> Result<(), HalError> {
            Ok(())
        }
    }

    #[test]
    fn null_descriptor_detected() {
        assert!(RegisterDescriptor::NULL.is_null());
        assert!(!RegisterDescriptor::system_memory(0x1000, 32).is_null());
        assert!(!RegisterDescriptor::platform_comm(0, 32, 0).is_null());
    }

    #[test]
    fn width_bytes_only_for_natural_sizes() {
        assert_eq!(RegisterDescriptor::system_memory(0, 16).width_bytes(), Some(2));
        assert_eq!(RegisterDescriptor::system_memory(0, 64).width_bytes(), Some(8));
        assert_eq!(RegisterDescriptor::system_memory(0, 12).width_bytes(), None);
    }

    #[test]
    fn default_accessor_only_reaches_memory() {
        let regs = MockRegs(7);
        assert_eq!(regs.read(0, &RegisterDescriptor::system_memory(0x10, 32)), Ok(7));
        let ffh = RegisterDescriptor::fixed_hardware(0x10, 64);
        assert_eq!(regs.read(0, &ffh), Err(HalError::Unsupported(AddressSpace::FixedHardware)));
    }

    #[test]
    fn doorbell_tx_done_defaults_to_noop() {
        let bell = MockDoorbell;
        assert_eq!(bell.ring(1), Ok(()));
        bell.tx_done(true);
    }
}
