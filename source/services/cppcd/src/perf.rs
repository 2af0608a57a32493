// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Performance requests and telemetry
//!
//! PUBLIC API:
//!   - Cppc::set_desired_performance: batched when the desired register is in PCC
//!   - Cppc::get_performance_capabilities / Cppc::get_feedback_counters: one read
//!     command refreshes every PCC field, values are read under exclusive access
//!   - Cppc::transition_latency_ns
//!
//! ERROR CONDITIONS:
//!   - NoDevice for unregistered CPUs
//!   - Channel(InvalidData) when a mandatory value reads zero
//!   - Channel(Register) when a backing register cannot be accessed

use nexus_hal::AddressSpace;
use nexus_pcc::{ChannelError, ChannelGuard, Command, SharedRegion};

use crate::cpc::{CpcDescriptor, CpcEntry, CpcField};
use crate::registry::Cppc;
use crate::CppcError;

/// Returned by [`Cppc::transition_latency_ns`] when the latency is not known.
pub const LATENCY_UNKNOWN: u32 = u32::MAX;

/// Static performance range of a CPU, in abstract performance units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerfCaps {
    pub highest: u64,
    pub nominal: u64,
    pub lowest_nonlinear: u64,
    pub lowest: u64,
}

/// Snapshot of the delivered/reference counter pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedbackCounters {
    pub delivered: u64,
    pub reference: u64,
    pub reference_perf: u64,
    /// Seconds until the counters wrap; `u64::MAX` when they never do.
    pub wraparound_time: u64,
}

impl Cppc {
    /// Requests performance level `perf` for `cpu`.
    pub fn set_desired_performance(&self, cpu: usize, perf: u64) -> Result<(), CppcError> {
        let state = self.cpu(cpu)?;
        let entry = state.cpc.get(CpcField::DesiredPerf);
        let reg = *entry.register().ok_or(CppcError::NotWritable { cpu, field: CpcField::DesiredPerf })?;

        match &state.requestor {
            Some(requestor) => {
                let requestor = requestor.lock();
                self.pcc()?.write_batched(&requestor, perf, |region: &SharedRegion, value| {
                    region.write(reg.address, reg.bit_width, value).map_err(ChannelError::Register)
                })?;
            }
            None => self.write_entry(cpu, entry, perf)?,
        }
        Ok(())
    }

    pub fn get_performance_capabilities(&self, cpu: usize) -> Result<PerfCaps, CppcError> {
        let state = self.cpu(cpu)?;
        let cpc = &state.cpc;
        let fields = [
            CpcField::HighestPerf,
            CpcField::NominalPerf,
            CpcField::LowestNonlinearPerf,
            CpcField::LowestPerf,
        ];

        let _guard = self.refresh(cpc, &fields)?;
        let caps = PerfCaps {
            highest: self.read_entry(cpu, cpc.get(CpcField::HighestPerf))?,
            nominal: self.read_entry(cpu, cpc.get(CpcField::NominalPerf))?,
            lowest_nonlinear: self.read_entry(cpu, cpc.get(CpcField::LowestNonlinearPerf))?,
            lowest: self.read_entry(cpu, cpc.get(CpcField::LowestPerf))?,
        };
        if caps.highest == 0 || caps.nominal == 0 || caps.lowest == 0 {
            return Err(ChannelError::InvalidData.into());
        }
        Ok(caps)
    }

    pub fn get_feedback_counters(&self, cpu: usize) -> Result<FeedbackCounters, CppcError> {
        let state = self.cpu(cpu)?;
        let cpc = &state.cpc;
        // Without a reference performance register the counters tick at nominal.
        let reference_perf = if cpc.supported(CpcField::ReferencePerf) {
            CpcField::ReferencePerf
        } else {
            CpcField::NominalPerf
        };
        let fields = [
            CpcField::DeliveredCounter,
            CpcField::ReferenceCounter,
            reference_perf,
            CpcField::CounterWraparoundTime,
        ];

        let _guard = self.refresh(cpc, &fields)?;
        let delivered = self.read_entry(cpu, cpc.get(CpcField::DeliveredCounter))?;
        let reference = self.read_entry(cpu, cpc.get(CpcField::ReferenceCounter))?;
        let reference_perf = self.read_entry(cpu, cpc.get(reference_perf))?;
        let wraparound_time = if cpc.supported(CpcField::CounterWraparoundTime) {
            self.read_entry(cpu, cpc.get(CpcField::CounterWraparoundTime))?
        } else {
            u64::MAX
        };
        if delivered == 0 || reference == 0 || reference_perf == 0 {
            return Err(ChannelError::InvalidData.into());
        }
        Ok(FeedbackCounters { delivered, reference, reference_perf, wraparound_time })
    }

    /// Worst-case time for a performance request to take effect.
    pub fn transition_latency_ns(&self, cpu: usize) -> u32 {
        let Ok(state) = self.cpu(cpu) else {
            return LATENCY_UNKNOWN;
        };
        match self.channel() {
            Some(channel) if state.cpc.in_pcc(CpcField::DesiredPerf) => channel.transition_latency_ns(),
            _ => LATENCY_UNKNOWN,
        }
    }

    /// Takes exclusive access and posts a read when any of `fields` is in PCC.
    fn refresh(&self, cpc: &CpcDescriptor, fields: &[CpcField]) -> Result<Option<ChannelGuard<'_>>, CppcError> {
        if !fields.iter().any(|field| cpc.in_pcc(*field)) {
            return Ok(None);
        }
        let guard = self.pcc()?.exclusive();
        guard.submit_command(Command::Read)?;
        Ok(Some(guard))
    }

    fn read_entry(&self, cpu: usize, entry: &CpcEntry) -> Result<u64, CppcError> {
        let reg = match entry {
            CpcEntry::Integer(value) => return Ok(*value),
            CpcEntry::Register(reg) => reg,
        };
        let value = match reg.space {
            AddressSpace::PlatformComm => self.pcc()?.region().read(reg.address, reg.bit_width),
            _ => self.registers.read(cpu, reg),
        };
        Ok(value.map_err(ChannelError::Register)?)
    }

    fn write_entry(&self, cpu: usize, entry: &CpcEntry, value: u64) -> Result<(), CppcError> {
        let Some(reg) = entry.register() else {
            return Ok(());
        };
        let result = match reg.space {
            AddressSpace::PlatformComm => self.pcc()?.region().write(reg.address, reg.bit_width, value),
            _ => self.registers.write(cpu, reg, value),
        };
        Ok(result.map_err(ChannelError::Register)?)
    }
}
