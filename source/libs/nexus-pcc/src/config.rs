// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registration parameters of a PCC subspace
//!
//! The values come from the platform description once at boot and never
//! change afterwards. Loaded from TOML on host builds:
//!
//! ```toml
//! subspace_index = 2
//! base_address = 0xfe000000
//! length = 256
//! nominal_latency_us = 20
//! min_turnaround_us = 0
//! max_access_rate = 0
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::shmem::{SharedRegion, HEADER_LEN, PCC_SIGNATURE};

/// Safety multiplier on the nominal latency; slow platforms and emulators
/// routinely take far longer than advertised.
pub const NUM_RETRIES: u64 = 500;

/// Errors raised while binding a channel.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration text could not be parsed.
    #[error("failed to parse subspace config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The region cannot even hold the command header.
    #[error("shared region of {0} bytes is smaller than the header")]
    RegionTooSmall(u64),
    /// The mapped region is shorter than the subspace it claims to be.
    #[error("shared region of {found} bytes is shorter than the configured {length}")]
    RegionShorterThanConfig { length: u64, found: u64 },
    /// The mapped region belongs to another subspace.
    #[error("signature mismatch: expected {expected:#x}, found {found:#x}")]
    SignatureMismatch { expected: u32, found: u32 },
    /// No channel is available for the requested subspace.
    #[error("no PCC subspace {0}")]
    NoSubspace(u8),
}

/// Immutable timing and placement of one PCC subspace.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SubspaceConfig {
    pub subspace_index: u8,
    #[serde(default)]
    pub base_address: u64,
    pub length: u64,
    /// Expected latency to process a command, in microseconds.
    pub nominal_latency_us: u32,
    /// Minimum gap after a completion before the next command, in microseconds.
    #[serde(default)]
    pub min_turnaround_us: u32,
    /// Commands per minute; 0 means unlimited.
    #[serde(default)]
    pub max_access_rate: u32,
}

impl SubspaceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.length < HEADER_LEN as u64 {
            return Err(ConfigError::RegionTooSmall(self.length));
        }
        Ok(())
    }

    /// Upper bound for one completion wait.
    pub fn deadline(&self) -> Duration {
        Duration::from_micros(u64::from(self.nominal_latency_us) * NUM_RETRIES)
    }

    pub fn nominal_latency(&self) -> Duration {
        Duration::from_micros(u64::from(self.nominal_latency_us))
    }

    pub fn min_turnaround(&self) -> Duration {
        Duration::from_micros(u64::from(self.min_turnaround_us))
    }

    pub fn signature(&self) -> u32 {
        PCC_SIGNATURE | u32::from(self.subspace_index)
    }

    /// Checks that `region` is the one this subspace describes.
    pub fn check_region(&self, region: &SharedRegion) -> Result<(), ConfigError> {
        if region.len() < HEADER_LEN {
            return Err(ConfigError::RegionTooSmall(region.len() as u64));
        }
        let mapped = region.len() as u64;
        if mapped < self.length {
            return Err(ConfigError::RegionShorterThanConfig { length: self.length, found: mapped });
        }
        let found = region.signature();
        if found != self.signature() {
            return Err(ConfigError::SignatureMismatch { expected: self.signature(), found });
        }
        Ok(())
    }
}
