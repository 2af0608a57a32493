// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: CPPC performance-request service
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, integration tests in tests/api.rs
//!
//! PUBLIC API:
//!   - Cppc::register_cpu / Cppc::unregister_cpu
//!   - Cppc::set_desired_performance
//!   - Cppc::get_performance_capabilities / Cppc::get_feedback_counters
//!   - Cppc::transition_latency_ns
//!   - ChannelProvider: maps the PCC subspace named by the descriptors
//!
//! DEPENDENCIES:
//!   - nexus-pcc: channel ownership and batched writes
//!   - nexus-hal: register access for non-PCC address spaces
//!   - once_cell: single channel setup shared by every CPU

#![forbid(unsafe_code)]

mod cli;
mod config;
mod cpc;
pub mod host;
mod perf;
mod platform;
mod registry;
pub mod simulation;

pub use cli::{execute, help, run};
pub use config::{DaemonConfig, SimulationConfig, MAX_SIMULATED_CPUS};
pub use cpc::{CpcDescriptor, CpcEntry, CpcField, CPC_NUM_ENTRIES, CPC_REVISION};
pub use perf::{FeedbackCounters, PerfCaps, LATENCY_UNKNOWN};
pub use platform::{ChannelBinding, ChannelProvider};
pub use registry::Cppc;

use nexus_hal::AddressSpace;
use nexus_pcc::{ChannelError, ConfigError};
use thiserror::Error;

/// Failures of the CPPC service.
#[derive(Debug, Error)]
pub enum CppcError {
    #[error("cpu {0} has no CPPC descriptor")]
    NoDevice(usize),
    #[error("cpu {0} is already registered")]
    AlreadyRegistered(usize),
    #[error("cpu {cpu}: malformed CPC table: {reason}")]
    BadTable { cpu: usize, reason: &'static str },
    #[error("cpu {cpu}: {field:?} register in unsupported address space {space:?}")]
    UnsupportedSpace { cpu: usize, field: CpcField, space: AddressSpace },
    #[error("cpu {cpu}: {field:?} register {reason}")]
    BadRegister { cpu: usize, field: CpcField, reason: &'static str },
    #[error("PCC subspace mismatch: expected {expected}, found {found}")]
    SubspaceMismatch { expected: u8, found: u8 },
    #[error("cpu {cpu}: {field:?} is not a register")]
    NotWritable { cpu: usize, field: CpcField },
    /// A PCC register was used before any channel was set up.
    #[error("no PCC channel is bound")]
    NoChannel,
    #[error("channel setup failed: {0}")]
    Setup(#[from] ConfigError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("cannot read {path}: {reason}")]
    ConfigFile { path: String, reason: String },
    #[error("unexpected arguments: {0}")]
    Usage(String),
    #[error("invalid simulation: {0}")]
    Simulation(&'static str),
    #[error("simulation worker panicked")]
    Worker,
}
