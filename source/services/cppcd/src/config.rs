// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Daemon configuration
//!
//! ```toml
//! [subspace]
//! subspace_index = 0
//! length = 512
//! nominal_latency_us = 20
//! min_turnaround_us = 0
//! max_access_rate = 0
//!
//! [simulation]
//! cpus = 4
//! requests_per_cpu = 100
//! completion_us = 50
//! ```
//!
//! Both sections and every simulation key are optional.

use std::path::Path;

use nexus_pcc::{ConfigError, SubspaceConfig};
use serde::Deserialize;

use crate::CppcError;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_subspace")]
    pub subspace: SubspaceConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Workload the host simulation drives through the service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub cpus: usize,
    pub requests_per_cpu: u64,
    /// Platform processing time per command; 0 completes inline.
    pub completion_us: u64,
    pub highest_perf: u32,
    pub nominal_perf: u32,
    pub lowest_nonlinear_perf: u32,
    pub lowest_perf: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            requests_per_cpu: 100,
            completion_us: 50,
            highest_perf: 300,
            nominal_perf: 200,
            lowest_nonlinear_perf: 100,
            lowest_perf: 50,
        }
    }
}

/// Largest CPU count the simulation lays out in one subspace.
pub const MAX_SIMULATED_CPUS: usize = 1024;

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), CppcError> {
        match self.cpus {
            0 => Err(CppcError::Simulation("cpus must be at least 1")),
            n if n > MAX_SIMULATED_CPUS => Err(CppcError::Simulation("too many cpus")),
            _ => Ok(()),
        }
    }
}

fn default_subspace() -> SubspaceConfig {
    SubspaceConfig {
        subspace_index: 0,
        base_address: 0,
        length: 512,
        nominal_latency_us: 20,
        min_turnaround_us: 0,
        max_access_rate: 0,
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { subspace: default_subspace(), simulation: SimulationConfig::default() }
    }
}

impl DaemonConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, CppcError> {
        let config: Self = toml::from_str(text).map_err(ConfigError::from)?;
        config.subspace.validate()?;
        config.simulation.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CppcError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| CppcError::ConfigFile { path: path.display().to_string(), reason: err.to_string() })?;
        Self::from_toml_str(&text)
    }
}
