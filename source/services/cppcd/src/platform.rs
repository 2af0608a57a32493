// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Seam between the CPPC registry and whoever maps PCC subspaces

use std::sync::Arc;

use nexus_hal::Doorbell;
use nexus_pcc::{Clock, ConfigError, SharedRegion, SubspaceConfig};

/// Everything needed to bind one PCC subspace.
pub struct ChannelBinding {
    pub config: SubspaceConfig,
    pub region: SharedRegion,
    pub doorbell: Arc<dyn Doorbell>,
    /// Overrides the host clock, mostly for tests.
    pub clock: Option<Arc<dyn Clock>>,
}

/// Maps a subspace's region and doorbell on request.
pub trait ChannelProvider: Send + Sync {
    fn request_channel(&self, subspace: u8) -> Result<ChannelBinding, ConfigError>;
}
