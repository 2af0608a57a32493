// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registration of logical CPUs and lazy PCC channel setup
//!
//! All PCC registers of all CPUs must name the same subspace. The channel is
//! requested from the provider the first time a CPU needs it and is shared by
//! every CPU afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use nexus_hal::{AddressSpace, RegisterAccess};
use nexus_pcc::{PccChannel, Requestor, HEADER_LEN};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::cpc::{CpcDescriptor, CpcField};
use crate::platform::ChannelProvider;
use crate::CppcError;

pub(crate) struct CpuState {
    pub(crate) cpc: CpcDescriptor,
    /// Present when the desired performance register lives in the channel.
    /// Locked for the whole batched write so one CPU never has two in flight.
    pub(crate) requestor: Option<Mutex<Requestor>>,
}

/// CPPC service state: registered CPUs plus the shared PCC channel.
pub struct Cppc {
    pub(crate) registers: Arc<dyn RegisterAccess>,
    provider: Arc<dyn ChannelProvider>,
    channel: OnceCell<Arc<PccChannel>>,
    cpus: RwLock<HashMap<usize, Arc<CpuState>>>,
}

impl Cppc {
    pub fn new(registers: Arc<dyn RegisterAccess>, provider: Arc<dyn ChannelProvider>) -> Self {
        Self { registers, provider, channel: OnceCell::new(), cpus: RwLock::new(HashMap::new()) }
    }

    /// The PCC channel, once some CPU needed it.
    pub fn channel(&self) -> Option<&Arc<PccChannel>> {
        self.channel.get()
    }

    pub fn is_registered(&self, cpu: usize) -> bool {
        self.cpus.read().contains_key(&cpu)
    }

    /// Registered CPUs in ascending order.
    pub fn cpus(&self) -> Vec<usize> {
        let mut cpus: Vec<usize> = self.cpus.read().keys().copied().collect();
        cpus.sort_unstable();
        cpus
    }

    /// Registers `cpc` for its CPU.
    ///
    /// Sets up the PCC channel on first use. A failure leaves the CPU
    /// unregistered.
    pub fn register_cpu(&self, cpc: CpcDescriptor) -> Result<(), CppcError> {
        let cpu = cpc.cpu();
        if self.is_registered(cpu) {
            return Err(CppcError::AlreadyRegistered(cpu));
        }
        if let Some(subspace) = self.validate(&cpc)? {
            let channel = self.channel_for(subspace)?;
            check_pcc_fit(&cpc, channel.region().len())?;
        }

        let requestor = match self.channel.get() {
            Some(channel) if cpc.in_pcc(CpcField::DesiredPerf) => {
                Some(Mutex::new(channel.register_requestor(cpu)))
            }
            _ => None,
        };
        let batched = requestor.is_some();

        let mut cpus = self.cpus.write();
        if cpus.contains_key(&cpu) {
            return Err(CppcError::AlreadyRegistered(cpu));
        }
        cpus.insert(cpu, Arc::new(CpuState { cpc, requestor }));
        info!("cppc: registered cpu {cpu} (batched desired writes: {batched})");
        Ok(())
    }

    /// Drops the descriptor and write slot of `cpu`.
    pub fn unregister_cpu(&self, cpu: usize) -> Result<(), CppcError> {
        match self.cpus.write().remove(&cpu) {
            Some(_) => {
                debug!("cppc: unregistered cpu {cpu}");
                Ok(())
            }
            None => Err(CppcError::NoDevice(cpu)),
        }
    }

    pub(crate) fn cpu(&self, cpu: usize) -> Result<Arc<CpuState>, CppcError> {
        self.cpus.read().get(&cpu).cloned().ok_or(CppcError::NoDevice(cpu))
    }

    pub(crate) fn pcc(&self) -> Result<&Arc<PccChannel>, CppcError> {
        // Registration guarantees the channel for any CPU with PCC registers.
        self.channel.get().ok_or(CppcError::NoChannel)
    }

    /// Checks register address spaces; returns the PCC subspace named by `cpc`.
    fn validate(&self, cpc: &CpcDescriptor) -> Result<Option<u8>, CppcError> {
        let mut subspace = None;
        for (field, reg) in cpc.registers() {
            match reg.space {
                AddressSpace::PlatformComm => match subspace {
                    None => subspace = Some(reg.access_width),
                    Some(expected) if expected != reg.access_width => {
                        return Err(CppcError::SubspaceMismatch { expected, found: reg.access_width });
                    }
                    Some(_) => {}
                },
                space if self.registers.supports(space) => {}
                space => {
                    return Err(CppcError::UnsupportedSpace { cpu: cpc.cpu(), field, space });
                }
            }
        }
        Ok(subspace)
    }

    fn channel_for(&self, subspace: u8) -> Result<&Arc<PccChannel>, CppcError> {
        let channel = self.channel.get_or_try_init(|| {
            let binding = self.provider.request_channel(subspace)?;
            if binding.config.subspace_index != subspace {
                return Err(CppcError::SubspaceMismatch {
                    expected: subspace,
                    found: binding.config.subspace_index,
                });
            }
            let mut channel = PccChannel::new(binding.config, binding.region, binding.doorbell)?;
            if let Some(clock) = binding.clock {
                channel = channel.with_clock(clock);
            }
            Ok(Arc::new(channel))
        })?;
        if channel.subspace_index() != subspace {
            return Err(CppcError::SubspaceMismatch { expected: channel.subspace_index(), found: subspace });
        }
        Ok(channel)
    }
}

/// Every PCC register of `cpc` must be naturally sized and lie inside the payload.
fn check_pcc_fit(cpc: &CpcDescriptor, region_len: usize) -> Result<(), CppcError> {
    let cpu = cpc.cpu();
    for (field, reg) in cpc.registers().filter(|(_, reg)| reg.space == AddressSpace::PlatformComm) {
        let width = reg.width_bytes().ok_or(CppcError::BadRegister { cpu, field, reason: "unsupported width" })?;
        let end = reg.address.checked_add((HEADER_LEN + width) as u64);
        if end.map_or(true, |end| end > region_len as u64) {
            return Err(CppcError::BadRegister { cpu, field, reason: "outside the shared region" });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpc::CpcEntry;
    use crate::host::{LoopbackProvider, MemoryRegisters};
    use nexus_hal::RegisterDescriptor;

    fn cppc() -> (Arc<LoopbackProvider>, Cppc) {
        let provider = Arc::new(LoopbackProvider::new());
        provider.add_subspace(2, 64, 10);
        let cppc = Cppc::new(Arc::new(MemoryRegisters::new()), provider.clone());
        (provider, cppc)
    }

    fn pcc(offset: u64, subspace: u8) -> CpcEntry {
        CpcEntry::Register(RegisterDescriptor::platform_comm(offset, 32, subspace))
    }

    #[test]
    fn memory_only_cpu_needs_no_channel() {
        let (provider, cppc) = cppc();
        let cpc = CpcDescriptor::new(0).with(
            CpcField::DesiredPerf,
            CpcEntry::Register(RegisterDescriptor::system_memory(0x1000, 32)),
        );
        cppc.register_cpu(cpc).unwrap();
        assert!(cppc.channel().is_none());
        assert_eq!(provider.requests(), 0);
        assert!(cppc.cpu(0).unwrap().requestor.is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (_provider, cppc) = cppc();
        cppc.register_cpu(CpcDescriptor::new(3)).unwrap();
        assert!(matches!(cppc.register_cpu(CpcDescriptor::new(3)), Err(CppcError::AlreadyRegistered(3))));
    }

    #[test]
    fn mixed_subspaces_within_one_cpu_rejected() {
        let (provider, cppc) = cppc();
        let cpc = CpcDescriptor::new(0)
            .with(CpcField::HighestPerf, pcc(0, 2))
            .with(CpcField::DesiredPerf, pcc(4, 5));
        assert!(matches!(
            cppc.register_cpu(cpc),
            Err(CppcError::SubspaceMismatch { expected: 2, found: 5 })
        ));
        assert_eq!(provider.requests(), 0);
        assert!(!cppc.is_registered(0));
    }

    #[test]
    fn unregister_unknown_cpu_is_no_device() {
        let (_provider, cppc) = cppc();
        assert!(matches!(cppc.unregister_cpu(9), Err(CppcError::NoDevice(9))));
    }

    #[test]
    fn pcc_desired_register_gets_a_requestor() {
        let (_provider, cppc) = cppc();
        cppc.register_cpu(CpcDescriptor::new(1).with(CpcField::DesiredPerf, pcc(4, 2))).unwrap();
        let state = cppc.cpu(1).unwrap();
        assert_eq!(state.requestor.as_ref().map(|r| r.lock().id()), Some(1));
        assert_eq!(cppc.cpus(), vec![1]);
    }

    #[test]
    fn pcc_registers_must_fit_the_region() {
        let (_provider, cppc) = cppc();
        let odd = CpcDescriptor::new(0)
            .with(CpcField::DesiredPerf, CpcEntry::Register(RegisterDescriptor::platform_comm(4, 12, 2)));
        assert!(matches!(
            cppc.register_cpu(odd),
            Err(CppcError::BadRegister { cpu: 0, field: CpcField::DesiredPerf, .. })
        ));

        // 64 byte region: payload ends at offset 56.
        let past_end = CpcDescriptor::new(1).with(CpcField::DeliveredCounter, pcc(56, 2));
        assert!(matches!(
            cppc.register_cpu(past_end),
            Err(CppcError::BadRegister { cpu: 1, field: CpcField::DeliveredCounter, .. })
        ));
        let huge = CpcDescriptor::new(2).with(CpcField::DesiredPerf, pcc(u64::MAX - 2, 2));
        assert!(matches!(cppc.register_cpu(huge), Err(CppcError::BadRegister { cpu: 2, .. })));
        assert!(cppc.cpus().is_empty());

        cppc.register_cpu(CpcDescriptor::new(3).with(CpcField::DesiredPerf, pcc(52, 2))).unwrap();
    }
}
