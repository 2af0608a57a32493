// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host backends for the CPPC service
//!
//! PUBLIC API:
//!   - MemoryRegisters: RegisterAccess over an in-memory map (system memory and FFH)
//!   - LoopbackProvider: ChannelProvider handing out LoopbackPlatform subspaces

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nexus_hal::{AddressSpace, HalError, RegisterAccess, RegisterDescriptor};
use nexus_pcc::host::LoopbackPlatform;
use nexus_pcc::{Clock, ConfigError, SubspaceConfig};
use parking_lot::Mutex;

use crate::platform::{ChannelBinding, ChannelProvider};

/// Register file keyed by address space and address.
#[derive(Default)]
pub struct MemoryRegisters {
    cells: Mutex<HashMap<(AddressSpace, u64), u64>>,
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presets `reg`, bypassing width checks.
    pub fn set(&self, reg: &RegisterDescriptor, value: u64) {
        self.cells.lock().insert((reg.space, reg.address), value);
    }

    pub fn get(&self, reg: &RegisterDescriptor) -> u64 {
        self.cells.lock().get(&(reg.space, reg.address)).copied().unwrap_or(0)
    }

    fn mask(&self, reg: &RegisterDescriptor) -> Result<u64, HalError> {
        if !self.supports(reg.space) {
            return Err(HalError::Unsupported(reg.space));
        }
        match reg.width_bytes() {
            Some(8) => Ok(u64::MAX),
            Some(bytes) => Ok((1u64 << (bytes * 8)) - 1),
            None => Err(HalError::BadWidth(reg.bit_width)),
        }
    }
}

impl RegisterAccess for MemoryRegisters {
    fn read(&self, _cpu: usize, reg: &RegisterDescriptor) -> Result<u64, HalError> {
        let mask = self.mask(reg)?;
        Ok(self.get(reg) & mask)
    }

    fn write(&self, _cpu: usize, reg: &RegisterDescriptor, value: u64) -> Result<(), HalError> {
        let mask = self.mask(reg)?;
        self.set(reg, value & mask);
        Ok(())
    }

    fn supports(&self, space: AddressSpace) -> bool {
        matches!(space, AddressSpace::SystemMemory | AddressSpace::FixedHardware)
    }
}

/// Hands out loopback subspaces registered with [`LoopbackProvider::add`].
#[derive(Default)]
pub struct LoopbackProvider {
    subspaces: Mutex<HashMap<u8, (SubspaceConfig, Arc<LoopbackPlatform>)>>,
    clock: Option<Arc<dyn Clock>>,
    requests: AtomicUsize,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every channel handed out to `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a subspace and returns its emulated platform.
    pub fn add(&self, config: SubspaceConfig) -> Arc<LoopbackPlatform> {
        let platform = Arc::new(LoopbackPlatform::new(config.subspace_index, config.length as usize));
        self.subspaces.lock().insert(config.subspace_index, (config, platform.clone()));
        platform
    }

    /// Adds an unthrottled subspace.
    pub fn add_subspace(&self, index: u8, length: u64, nominal_latency_us: u32) -> Arc<LoopbackPlatform> {
        self.add(SubspaceConfig {
            subspace_index: index,
            base_address: 0,
            length,
            nominal_latency_us,
            min_turnaround_us: 0,
            max_access_rate: 0,
        })
    }

    pub fn platform(&self, index: u8) -> Option<Arc<LoopbackPlatform>> {
        self.subspaces.lock().get(&index).map(|(_, platform)| platform.clone())
    }

    /// Number of channel requests served or refused so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl ChannelProvider for LoopbackProvider {
    fn request_channel(&self, subspace: u8) -> Result<ChannelBinding, ConfigError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let subspaces = self.subspaces.lock();
        let (config, platform) = subspaces.get(&subspace).ok_or(ConfigError::NoSubspace(subspace))?;
        Ok(ChannelBinding {
            config: config.clone(),
            region: platform.region().clone(),
            doorbell: platform.clone(),
            clock: self.clock.clone(),
        })
    }
}
