// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Channel ownership protocol
//!
//! The shared region alternates strictly between the two sides:
//!
//! ```text
//! OS owned --submit--> platform owned --COMMAND_COMPLETE observed--> OS owned
//! ```
//!
//! Access discipline (`lock`):
//!   - shared: staging writers (Phase I of a batched write). They only touch their
//!     own payload fields plus the atomic `platform_owns` / `pending_write` flags.
//!   - exclusive: anything that posts a command. [`ChannelGuard`] is the proof of
//!     exclusive access and the only type with `submit_command`.
//!
//! ERROR CONDITIONS:
//!   - Timeout / RemoteError from the completion poll
//!   - RateLimited from the MPAR window
//!   - Transport when the doorbell refuses the command; ownership stays with the
//!     platform until a later poll observes completion

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace};
use nexus_hal::Doorbell;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::batch::WriteBatch;
use crate::clock::{duration_to_ns, Clock, HostClock};
use crate::config::{ConfigError, SubspaceConfig};
use crate::shmem::{CompletionPoll, PccStatus, SharedRegion};
use crate::throttle::Throttle;
use crate::{ChannelError, Command, Result};

/// Gap between two reads of the status word while waiting for completion.
pub const POLL_INTERVAL: Duration = Duration::from_micros(3);

/// One PCC subspace bound to its shared region and doorbell.
pub struct PccChannel {
    config: SubspaceConfig,
    deadline: Duration,
    region: SharedRegion,
    doorbell: Arc<dyn Doorbell>,
    poll: Arc<dyn CompletionPoll>,
    clock: Arc<dyn Clock>,
    lock: RwLock<()>,
    platform_owns: AtomicBool,
    pending_write: AtomicBool,
    throttle: Mutex<Throttle>,
    pub(crate) batch: WriteBatch,
}

impl PccChannel {
    /// Binds a channel to `region` and `doorbell`.
    ///
    /// The platform is assumed to own the region until the first completion
    /// bit is observed.
    pub fn new(
        config: SubspaceConfig,
        region: SharedRegion,
        doorbell: Arc<dyn Doorbell>,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        config.check_region(&region)?;
        info!(
            "pcc: bound subspace {} ({} bytes, nominal {}us, mrtt {}us, mpar {}/min)",
            config.subspace_index,
            region.len(),
            config.nominal_latency_us,
            config.min_turnaround_us,
            config.max_access_rate
        );
        Ok(Self {
            deadline: config.deadline(),
            throttle: Mutex::new(Throttle::new(config.min_turnaround(), config.max_access_rate)),
            poll: Arc::new(region.clone()),
            clock: Arc::new(HostClock::new()),
            lock: RwLock::new(()),
            platform_owns: AtomicBool::new(true),
            pending_write: AtomicBool::new(false),
            batch: WriteBatch::new(),
            config,
            region,
            doorbell,
        })
    }

    /// Replaces the time source used for deadlines and throttling.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the source of completion status (defaults to the region header).
    pub fn with_poller(mut self, poll: Arc<dyn CompletionPoll>) -> Self {
        self.poll = poll;
        self
    }

    pub fn config(&self) -> &SubspaceConfig {
        &self.config
    }

    pub fn subspace_index(&self) -> u8 {
        self.config.subspace_index
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn platform_owns(&self) -> bool {
        self.platform_owns.load(Ordering::Acquire)
    }

    pub fn pending_write(&self) -> bool {
        self.pending_write.load(Ordering::Acquire)
    }

    /// Number of write flushes completed so far (successful or not).
    pub fn write_sequence(&self) -> u64 {
        self.batch.sequence()
    }

    /// Blocks until exclusive access is granted.
    pub fn exclusive(&self) -> ChannelGuard<'_> {
        ChannelGuard { channel: self, _lock: self.lock.write() }
    }

    /// Grants exclusive access only if nobody holds the channel right now.
    pub fn try_exclusive(&self) -> Option<ChannelGuard<'_>> {
        self.lock.try_write().map(|lock| ChannelGuard { channel: self, _lock: lock })
    }

    pub(crate) fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub(crate) fn mark_pending_write(&self) {
        self.pending_write.store(true, Ordering::Release);
    }

    /// Expected latency of a performance change routed through this channel.
    pub fn transition_latency_ns(&self) -> u32 {
        let mut latency_ns: u64 = 0;
        if self.config.max_access_rate != 0 {
            latency_ns = 60 * (1_000_000_000 / u64::from(self.config.max_access_rate));
        }
        latency_ns = latency_ns.max(u64::from(self.config.nominal_latency_us) * 1_000);
        latency_ns = latency_ns.max(u64::from(self.config.min_turnaround_us) * 1_000);
        u32::try_from(latency_ns).unwrap_or(u32::MAX)
    }

    /// Waits until the OS owns the region.
    ///
    /// Returns at once when the OS already owns it. Otherwise polls the status
    /// word until the platform sets `COMMAND_COMPLETE` or the deadline passes.
    pub(crate) fn await_ownership(&self, check_error: bool) -> Result<()> {
        if !self.platform_owns() {
            return Ok(());
        }
        let deadline_ns = self.clock.now_ns().saturating_add(duration_to_ns(self.deadline));
        let mut status = PccStatus::empty();
        while self.clock.now_ns() <= deadline_ns {
            status = self.poll.poll_status();
            if status.contains(PccStatus::COMMAND_COMPLETE) {
                self.platform_owns.store(false, Ordering::Release);
                if check_error && status.contains(PccStatus::ERROR) {
                    error!("pcc: platform flagged error, status={:#x}", status.bits());
                    return Err(ChannelError::RemoteError);
                }
                return Ok(());
            }
            self.clock.delay(POLL_INTERVAL);
        }
        error!("pcc: check channel failed, status={:#x}", status.bits());
        Err(ChannelError::Timeout)
    }

    fn submit(&self, cmd: Command) -> Result<()> {
        if cmd == Command::Read && self.pending_write() {
            // A read stole exclusive access from a staged batch; deliver it first.
            let _ = self.submit(Command::Write);
        }
        let result = self.post(cmd);
        if cmd == Command::Write {
            self.batch.complete(result);
        }
        result
    }

    fn post(&self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Read => self.await_ownership(false)?,
            Command::Write => self.pending_write.store(false, Ordering::Release),
        }

        let mut throttle = self.throttle.lock();
        if let Some(wait) = throttle.turnaround_remaining(self.clock.now_ns()) {
            self.clock.delay(wait);
        }
        if let Err(err) = throttle.admit(self.clock.now_ns()) {
            debug!("pcc: {cmd:?} not sent due to MPAR limit");
            return Err(err);
        }

        self.region.set_command(cmd.code());
        self.region.set_status(PccStatus::empty());
        self.platform_owns.store(true, Ordering::Release);

        if let Err(err) = self.doorbell.ring(cmd.code()) {
            error!("pcc: doorbell failed for {cmd:?}: {err}");
            return Err(ChannelError::Transport(err));
        }
        trace!("pcc: posted {cmd:?}");

        let result = self.await_ownership(true);
        if result.is_ok() {
            throttle.record_completion(self.clock.now_ns());
        }
        self.doorbell.tx_done(result.is_ok());
        result
    }
}

impl core::fmt::Debug for PccChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PccChannel")
            .field("subspace", &self.config.subspace_index)
            .field("platform_owns", &self.platform_owns())
            .field("pending_write", &self.pending_write())
            .field("write_sequence", &self.write_sequence())
            .finish()
    }
}

/// Exclusive access to a [`PccChannel`]; released on drop.
pub struct ChannelGuard<'a> {
    channel: &'a PccChannel,
    _lock: RwLockWriteGuard<'a, ()>,
}

impl ChannelGuard<'_> {
    /// Posts `cmd` and waits for the platform to complete it.
    ///
    /// A read first flushes any staged write. A write, whatever its outcome,
    /// advances the write sequence and wakes every batched waiter.
    pub fn submit_command(&self, cmd: Command) -> Result<()> {
        self.channel.submit(cmd)
    }

    /// Waits until the OS owns the region.
    pub fn await_ownership(&self, check_error: bool) -> Result<()> {
        self.channel.await_ownership(check_error)
    }

    pub fn channel(&self) -> &PccChannel {
        self.channel
    }

    pub fn region(&self) -> &SharedRegion {
        &self.channel.region
    }
}

impl Drop for ChannelGuard<'_> {
    // Batched writers that lost the election wait on whoever holds exclusive
    // access; a holder that posted nothing still owes them the flush.
    fn drop(&mut self) {
        if self.channel.pending_write() {
            debug!("pcc: flushing staged write on release");
            let _ = self.channel.submit(Command::Write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::{Completion, LoopbackPlatform};

    fn config(mrtt_us: u32, mpar: u32) -> SubspaceConfig {
        SubspaceConfig {
            subspace_index: 0,
            base_address: 0,
            length: 64,
            nominal_latency_us: 10,
            min_turnaround_us: mrtt_us,
            max_access_rate: mpar,
        }
    }

    fn bind(config: SubspaceConfig) -> (Arc<LoopbackPlatform>, Arc<ManualClock>, PccChannel) {
        let platform = Arc::new(LoopbackPlatform::new(config.subspace_index, config.length as usize));
        let clock = Arc::new(ManualClock::new());
        let channel = PccChannel::new(config, platform.region().clone(), platform.clone())
            .unwrap()
            .with_clock(clock.clone());
        (platform, clock, channel)
    }

    #[test]
    fn starts_platform_owned_and_takes_over_on_boot_completion() {
        let (_platform, _clock, channel) = bind(config(0, 0));
        assert!(channel.platform_owns());
        channel.exclusive().await_ownership(false).unwrap();
        assert!(!channel.platform_owns());
    }

    #[test]
    fn command_code_and_status_are_written_before_ring() {
        let (platform, _clock, channel) = bind(config(0, 0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        platform.set_handler(move |cmd, region| log.lock().push((cmd, region.command(), region.status())));
        channel.exclusive().submit_command(Command::Read).unwrap();
        assert_eq!(*seen.lock(), vec![(Command::Read, 0, PccStatus::empty())]);
    }

    #[test]
    fn error_bit_only_checked_after_posting() {
        let (platform, _clock, channel) = bind(config(0, 0));
        platform.set_completion(Completion::Error);
        let guard = channel.exclusive();
        assert_eq!(guard.submit_command(Command::Read), Err(ChannelError::RemoteError));
        // Completion was still observed; the OS owns the region again.
        assert!(!channel.platform_owns());
        // A read does not look at a stale error bit before posting.
        platform.set_completion(Completion::Immediate);
        assert_eq!(guard.submit_command(Command::Read), Ok(()));
    }

    #[test]
    fn refused_doorbell_leaves_platform_owner() {
        let (platform, clock, channel) = bind(config(0, 0));
        platform.set_reject(true);
        let guard = channel.exclusive();
        assert_eq!(
            guard.submit_command(Command::Write),
            Err(ChannelError::Transport(nexus_hal::HalError::Busy))
        );
        assert!(channel.platform_owns());
        assert_eq!(channel.write_sequence(), 1);
        // Nobody completes the command, so the next read times out.
        platform.set_reject(false);
        let before = clock.now_ns();
        assert_eq!(guard.submit_command(Command::Read), Err(ChannelError::Timeout));
        assert!(clock.now_ns() - before >= duration_to_ns(channel.deadline()));
    }

    #[test]
    fn timeout_lands_within_one_poll_of_deadline() {
        let (platform, clock, channel) = bind(config(0, 0));
        platform.set_completion(Completion::Never);
        let guard = channel.exclusive();
        guard.await_ownership(false).unwrap();
        let start = clock.now_ns();
        assert_eq!(guard.submit_command(Command::Read), Err(ChannelError::Timeout));
        let elapsed = clock.now_ns() - start;
        let deadline = duration_to_ns(channel.deadline());
        let poll = duration_to_ns(POLL_INTERVAL);
        assert!(elapsed + poll >= deadline, "gave up early: {elapsed}ns");
        assert!(elapsed <= deadline + poll, "gave up late: {elapsed}ns");
    }

    #[test]
    fn mpar_drops_excess_writes_until_window_rolls() {
        let (platform, clock, channel) = bind(config(0, 2));
        let guard = channel.exclusive();
        assert_eq!(guard.submit_command(Command::Write), Ok(()));
        clock.advance(Duration::from_millis(300));
        assert_eq!(guard.submit_command(Command::Write), Ok(()));
        clock.advance(Duration::from_millis(300));
        assert_eq!(guard.submit_command(Command::Write), Err(ChannelError::RateLimited));
        assert_eq!(platform.rings(), 2);
        // Dropped writes still count as completed flushes.
        assert_eq!(channel.write_sequence(), 3);
        clock.advance(Duration::from_secs(60));
        assert_eq!(guard.submit_command(Command::Write), Ok(()));
        assert_eq!(platform.rings(), 3);
    }

    #[test]
    fn mrtt_spaces_consecutive_commands() {
        let (platform, clock, channel) = bind(config(250, 0));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let (log, time) = (stamps.clone(), clock.clone());
        platform.set_handler(move |_, _| log.lock().push(time.now_ns()));
        let guard = channel.exclusive();
        guard.submit_command(Command::Write).unwrap();
        guard.submit_command(Command::Write).unwrap();
        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] - stamps[0] >= 250_000);
    }

    #[test]
    fn read_drains_pending_write_first() {
        let (platform, _clock, channel) = bind(config(0, 0));
        channel.exclusive().await_ownership(false).unwrap();
        channel.mark_pending_write();
        channel.exclusive().submit_command(Command::Read).unwrap();
        assert_eq!(platform.commands(), vec![Command::Write, Command::Read]);
        assert!(!channel.pending_write());
        assert_eq!(channel.write_sequence(), 1);
    }

    #[test]
    fn idle_guard_flushes_staged_write_on_release() {
        let (platform, _clock, channel) = bind(config(0, 0));
        let guard = channel.exclusive();
        guard.await_ownership(false).unwrap();
        channel.mark_pending_write();
        drop(guard);
        assert_eq!(platform.commands(), vec![Command::Write]);
        assert_eq!(channel.write_sequence(), 1);
    }

    #[test]
    fn transition_latency_takes_the_slowest_bound() {
        let (_p, _c, channel) = bind(config(0, 0));
        assert_eq!(channel.transition_latency_ns(), 10_000);
        let (_p, _c, channel) = bind(config(50, 0));
        assert_eq!(channel.transition_latency_ns(), 50_000);
        let (_p, _c, channel) = bind(config(50, 1_000));
        assert_eq!(channel.transition_latency_ns(), 60_000_000);
    }
}
