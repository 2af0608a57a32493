// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Batched write coordinator
//!
//! Phase I (shared access, any number of callers at once):
//!   make sure the OS owns the region, write the caller's own payload field, then set
//!   `pending_write` and arm the caller's slot with the current write sequence.
//!
//! Phase II (after leaving shared access):
//!   try to take exclusive access without blocking.
//!   - won: flush if `pending_write` is still set (someone may have flushed already).
//!   - lost: someone else holds or is about to hold exclusive access, and every holder
//!     flushes a pending write before doing anything else. Wait for the write sequence
//!     to move past the armed value.
//!
//! Either way the caller returns its slot status, which the flushing thread filled in.
//! A caller that failed Phase I still runs the election, and returns its own error.
//! A group of overlapping callers costs one doorbell: the last one out of Phase I
//! rings it for everybody.

use std::sync::{Arc, Weak};

use log::trace;
use nexus_sync::SequenceGate;
use parking_lot::Mutex;

use crate::channel::PccChannel;
use crate::shmem::SharedRegion;
use crate::{Command, Result};

/// Result slot of one caller, filled in by whichever thread flushes its write.
struct RequestorSlot {
    id: usize,
    state: Mutex<SlotState>,
}

struct SlotState {
    expected_sequence: u64,
    staged_value: Option<u64>,
    last_flush_status: Result<()>,
}

/// Per-caller handle for [`PccChannel::write_batched`].
///
/// One caller must not run two batched writes at once; successive writes from
/// the same requestor are therefore delivered in order.
pub struct Requestor {
    slot: Arc<RequestorSlot>,
}

impl Requestor {
    pub fn id(&self) -> usize {
        self.slot.id
    }

    /// Write sequence value this requestor last waited on.
    pub fn expected_sequence(&self) -> u64 {
        self.slot.state.lock().expected_sequence
    }

    /// Value staged by the most recent batched write.
    pub fn staged_value(&self) -> Option<u64> {
        self.slot.state.lock().staged_value
    }

    /// Outcome of the flush that carried the most recent staged value.
    pub fn last_flush_status(&self) -> Result<()> {
        self.slot.state.lock().last_flush_status
    }
}

impl core::fmt::Debug for Requestor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.slot.state.lock();
        f.debug_struct("Requestor")
            .field("id", &self.slot.id)
            .field("expected_sequence", &state.expected_sequence)
            .field("staged_value", &state.staged_value)
            .field("last_flush_status", &state.last_flush_status)
            .finish()
    }
}

/// Write sequence plus the slots that may be waiting on it.
pub(crate) struct WriteBatch {
    sequence: SequenceGate,
    slots: Mutex<Vec<Weak<RequestorSlot>>>,
}

impl WriteBatch {
    pub(crate) fn new() -> Self {
        Self { sequence: SequenceGate::new(), slots: Mutex::new(Vec::new()) }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.current()
    }

    fn register(&self, id: usize) -> Requestor {
        let slot = Arc::new(RequestorSlot {
            id,
            state: Mutex::new(SlotState {
                expected_sequence: self.sequence.current(),
                staged_value: None,
                last_flush_status: Ok(()),
            }),
        });
        let mut slots = self.slots.lock();
        slots.retain(|slot| slot.strong_count() > 0);
        slots.push(Arc::downgrade(&slot));
        Requestor { slot }
    }

    fn arm(&self, requestor: &Requestor, value: u64) -> u64 {
        let expected = self.sequence.current();
        let mut state = requestor.slot.state.lock();
        state.expected_sequence = expected;
        state.staged_value = Some(value);
        state.last_flush_status = Ok(());
        expected
    }

    /// Ends a flush. Runs under exclusive access only.
    ///
    /// Failures are copied into every slot armed for this flush before the
    /// sequence moves, so woken waiters always find their result in place.
    pub(crate) fn complete(&self, result: Result<()>) {
        let flushed = self.sequence.current();
        if let Err(err) = result {
            let mut slots = self.slots.lock();
            slots.retain(|weak| match weak.upgrade() {
                Some(slot) => {
                    let mut state = slot.state.lock();
                    if state.expected_sequence == flushed {
                        state.last_flush_status = Err(err);
                    }
                    true
                }
                None => false,
            });
        }
        let now = self.sequence.advance();
        trace!("pcc: write flush {flushed} -> {now} done: {result:?}");
    }

    fn wait_past(&self, expected: u64) {
        self.sequence.wait_past(expected);
    }
}

impl PccChannel {
    /// Creates the result slot for one caller (one logical CPU).
    ///
    /// Dropping the returned handle deregisters it.
    pub fn register_requestor(&self, id: usize) -> Requestor {
        self.batch.register(id)
    }

    /// Delivers `value` through a batched write.
    ///
    /// `stage` writes the caller's own field into the shared region. It runs
    /// concurrently with other callers' `stage`, so it must only touch memory
    /// that belongs to this caller.
    pub fn write_batched<F>(&self, requestor: &Requestor, value: u64, stage: F) -> Result<()>
    where
        F: FnOnce(&SharedRegion, u64) -> Result<()>,
    {
        let staged = {
            let _shared = self.shared();
            let owned = if self.platform_owns() { self.await_ownership(false) } else { Ok(()) };
            owned.and_then(|()| stage(self.region(), value)).map(|()| {
                // No reader can take exclusive access before the shared section
                // ends, so marking after staging still precedes any post.
                self.mark_pending_write();
                self.batch.arm(requestor, value)
            })
        };

        // Failed callers still run the election: a writer that lost it to
        // their shared access relies on the last one out to flush.
        match self.try_exclusive() {
            Some(guard) => {
                if self.pending_write() {
                    let _ = guard.submit_command(Command::Write);
                }
            }
            None => {
                if let Ok(expected) = staged {
                    trace!("pcc: requestor {} batched behind flush {expected}", requestor.id());
                    self.batch.wait_past(expected);
                }
            }
        }
        staged.and_then(|_| requestor.last_flush_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SubspaceConfig;
    use crate::host::{Completion, LoopbackPlatform};
    use crate::ChannelError;

    fn bind() -> (Arc<LoopbackPlatform>, PccChannel) {
        let config = SubspaceConfig {
            subspace_index: 5,
            base_address: 0,
            length: 64,
            nominal_latency_us: 10,
            min_turnaround_us: 0,
            max_access_rate: 0,
        };
        let platform = Arc::new(LoopbackPlatform::new(5, 64));
        let channel = PccChannel::new(config, platform.region().clone(), platform.clone())
            .unwrap()
            .with_clock(Arc::new(ManualClock::new()));
        (platform, channel)
    }

    fn stage_at(offset: u64) -> impl FnOnce(&SharedRegion, u64) -> Result<()> {
        move |region, value| region.write(offset, 32, value).map_err(ChannelError::Register)
    }

    #[test]
    fn lone_writer_flushes_itself() {
        let (platform, channel) = bind();
        let requestor = channel.register_requestor(0);
        channel.write_batched(&requestor, 42, stage_at(0)).unwrap();
        assert_eq!(platform.commands(), vec![Command::Write]);
        assert_eq!(channel.region().read(0, 32).unwrap(), 42);
        assert_eq!(channel.write_sequence(), 1);
        assert_eq!(requestor.staged_value(), Some(42));
        assert_eq!(requestor.expected_sequence(), 0);
        assert!(!channel.pending_write());
    }

    #[test]
    fn failed_flush_reaches_requestor_slot() {
        let (platform, channel) = bind();
        platform.set_completion(Completion::Error);
        let requestor = channel.register_requestor(1);
        assert_eq!(channel.write_batched(&requestor, 7, stage_at(4)), Err(ChannelError::RemoteError));
        assert_eq!(requestor.last_flush_status(), Err(ChannelError::RemoteError));
        // The next write starts from a clean slot.
        platform.set_completion(Completion::Immediate);
        assert_eq!(channel.write_batched(&requestor, 8, stage_at(4)), Ok(()));
        assert_eq!(requestor.last_flush_status(), Ok(()));
    }

    #[test]
    fn staging_error_is_returned_without_flush() {
        let (platform, channel) = bind();
        let requestor = channel.register_requestor(2);
        let err = channel.write_batched(&requestor, 1, stage_at(1_000)).unwrap_err();
        assert!(matches!(err, ChannelError::Register(_)));
        assert_eq!(platform.rings(), 0);
        assert!(!channel.pending_write());
        assert_eq!(requestor.staged_value(), None);
    }

    #[test]
    fn held_exclusive_access_defers_flush_to_its_holder() {
        let (platform, channel) = bind();
        let channel = Arc::new(channel);
        let requestor = channel.register_requestor(3);
        let guard = channel.exclusive();
        guard.await_ownership(false).unwrap();

        let writer = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || {
                // Blocks in Phase I until the guard is released.
                channel.write_batched(&requestor, 9, stage_at(8))
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(platform.rings(), 0);
        drop(guard);
        assert_eq!(writer.join().unwrap(), Ok(()));
        assert_eq!(platform.commands(), vec![Command::Write]);
    }

    #[test]
    fn dropped_requestors_are_pruned() {
        let (platform, channel) = bind();
        platform.set_completion(Completion::Error);
        let kept = channel.register_requestor(0);
        drop(channel.register_requestor(1));
        let _ = channel.write_batched(&kept, 1, stage_at(0));
        assert_eq!(channel.batch.slots.lock().len(), 1);
    }
}
