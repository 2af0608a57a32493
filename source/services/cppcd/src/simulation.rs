// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host simulation of a CPPC platform behind one PCC subspace
//!
//! Payload layout published by the emulated platform:
//!
//! ```text
//! 0x00  highest_perf         u32
//! 0x04  nominal_perf         u32
//! 0x08  lowest_nonlinear     u32
//! 0x0c  lowest_perf          u32
//! 0x10  per CPU, 0x18 bytes each:
//!       +0x00 desired_perf   u32  (OS writes)
//!       +0x08 delivered      u64  (platform updates on read)
//!       +0x10 reference      u64  (platform updates on read)
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use nexus_hal::RegisterDescriptor;
use nexus_pcc::host::{Completion, LoopbackPlatform};
use nexus_pcc::{Command, SharedRegion, HEADER_LEN};

use crate::config::DaemonConfig;
use crate::cpc::{CpcDescriptor, CpcEntry, CpcField};
use crate::host::{LoopbackProvider, MemoryRegisters};
use crate::perf::{FeedbackCounters, PerfCaps};
use crate::registry::Cppc;
use crate::CppcError;

const CPU_BLOCK: u64 = 0x10;
const CPU_STRIDE: u64 = 0x18;

fn desired_offset(cpu: usize) -> u64 {
    (cpu as u64).saturating_mul(CPU_STRIDE).saturating_add(CPU_BLOCK)
}

fn delivered_offset(cpu: usize) -> u64 {
    desired_offset(cpu).saturating_add(0x08)
}

fn reference_offset(cpu: usize) -> u64 {
    desired_offset(cpu).saturating_add(0x10)
}

/// Descriptor the emulated firmware reports for `cpu` on `subspace`.
pub fn simulated_descriptor(cpu: usize, subspace: u8) -> CpcDescriptor {
    let pcc = |offset, width| CpcEntry::Register(RegisterDescriptor::platform_comm(offset, width, subspace));
    CpcDescriptor::new(cpu)
        .with(CpcField::HighestPerf, pcc(0x00, 32))
        .with(CpcField::NominalPerf, pcc(0x04, 32))
        .with(CpcField::LowestNonlinearPerf, pcc(0x08, 32))
        .with(CpcField::LowestPerf, pcc(0x0c, 32))
        .with(CpcField::DesiredPerf, pcc(desired_offset(cpu), 32))
        .with(CpcField::DeliveredCounter, pcc(delivered_offset(cpu), 64))
        .with(CpcField::ReferenceCounter, pcc(reference_offset(cpu), 64))
}

/// Outcome of one simulation run.
#[derive(Clone, Debug)]
pub struct Report {
    pub cpus: usize,
    pub requests: u64,
    pub failed_requests: u64,
    pub write_rings: usize,
    pub read_rings: usize,
    pub write_flushes: u64,
    pub caps: PerfCaps,
    pub counters: Vec<FeedbackCounters>,
    pub transition_latency_ns: u32,
    pub elapsed: Duration,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cppcd: {} cpus, {} requests ({} failed) in {:?}",
            self.cpus, self.requests, self.failed_requests, self.elapsed
        )?;
        writeln!(
            f,
            "cppcd: doorbell rings: {} write, {} read; write flushes: {}",
            self.write_rings, self.read_rings, self.write_flushes
        )?;
        writeln!(
            f,
            "cppcd: perf caps highest={} nominal={} lowest_nonlinear={} lowest={}",
            self.caps.highest, self.caps.nominal, self.caps.lowest_nonlinear, self.caps.lowest
        )?;
        for (cpu, ctrs) in self.counters.iter().enumerate() {
            writeln!(
                f,
                "cppcd: cpu{cpu} feedback delivered={} reference={} reference_perf={}",
                ctrs.delivered, ctrs.reference, ctrs.reference_perf
            )?;
        }
        write!(f, "cppcd: transition latency {}ns", self.transition_latency_ns)
    }
}

/// Platform side: publish capabilities, advance counters on every read.
fn install_firmware(platform: &LoopbackPlatform, config: &DaemonConfig) {
    let sim = config.simulation.clone();
    let region = platform.region();
    let publish = |offset, value: u32| {
        let _ = region.write(offset, 32, u64::from(value));
    };
    publish(0x00, sim.highest_perf);
    publish(0x04, sim.nominal_perf);
    publish(0x08, sim.lowest_nonlinear_perf);
    publish(0x0c, sim.lowest_perf);

    platform.set_handler(move |cmd: Command, region: &SharedRegion| {
        if cmd != Command::Read {
            return;
        }
        for cpu in 0..sim.cpus {
            let desired = region.read(desired_offset(cpu), 32).unwrap_or(0);
            let delivered = region.read(delivered_offset(cpu), 64).unwrap_or(0);
            let reference = region.read(reference_offset(cpu), 64).unwrap_or(0);
            let _ = region.write(delivered_offset(cpu), 64, delivered.wrapping_add(desired.max(1)));
            let _ = region.write(reference_offset(cpu), 64, reference.wrapping_add(u64::from(sim.nominal_perf)));
        }
    });

    let completion = match sim.completion_us {
        0 => Completion::Immediate,
        us => Completion::After(Duration::from_micros(us)),
    };
    platform.set_completion(completion);
}

/// Runs the configured workload against a loopback platform.
pub fn run(config: &DaemonConfig) -> Result<Report, CppcError> {
    let sim = &config.simulation;
    sim.validate()?;
    let started = Instant::now();

    let mut subspace = config.subspace.clone();
    let needed = HEADER_LEN as u64 + desired_offset(sim.cpus);
    if subspace.length < needed {
        warn!("cppcd: growing subspace {} to {needed} bytes for {} cpus", subspace.subspace_index, sim.cpus);
        subspace.length = needed;
    }
    let index = subspace.subspace_index;

    let provider = Arc::new(LoopbackProvider::new());
    let platform = provider.add(subspace);
    install_firmware(&platform, config);

    let registers = Arc::new(MemoryRegisters::new());
    let cppc = Arc::new(Cppc::new(registers, provider));
    for cpu in 0..sim.cpus {
        cppc.register_cpu(simulated_descriptor(cpu, index))?;
    }
    let caps = cppc.get_performance_capabilities(0)?;
    info!("cppcd: {} cpus registered on subspace {index}", sim.cpus);

    let span = caps.highest.saturating_sub(caps.lowest) + 1;
    let workers: Vec<_> = (0..sim.cpus)
        .map(|cpu| {
            let cppc = Arc::clone(&cppc);
            let requests = sim.requests_per_cpu;
            let lowest = caps.lowest;
            thread::spawn(move || {
                let mut failed = 0u64;
                for n in 0..requests {
                    let perf = lowest + (n * 7 + cpu as u64) % span;
                    if let Err(err) = cppc.set_desired_performance(cpu, perf) {
                        warn!("cppcd: cpu{cpu} request {n} failed: {err}");
                        failed += 1;
                    }
                }
                failed
            })
        })
        .collect();
    let mut failed_requests = 0;
    for worker in workers {
        failed_requests += worker.join().map_err(|_| CppcError::Worker)?;
    }

    let counters = (0..sim.cpus)
        .map(|cpu| cppc.get_feedback_counters(cpu))
        .collect::<Result<Vec<_>, _>>()?;
    let write_flushes = cppc.channel().map_or(0, |channel| channel.write_sequence());

    Ok(Report {
        cpus: sim.cpus,
        requests: sim.requests_per_cpu * sim.cpus as u64,
        failed_requests,
        write_rings: platform.rings_of(Command::Write),
        read_rings: platform.rings_of(Command::Read),
        write_flushes,
        caps,
        counters,
        transition_latency_ns: cppc.transition_latency_ns(0),
        elapsed: started.elapsed(),
    })
}
