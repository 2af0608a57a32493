// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process platform emulation for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - LoopbackPlatform: owns a firmware-initialised SharedRegion and acts as its doorbell
//!   - Completion: how the emulated platform answers a posted command
//!
//! FEATURES:
//!   - Immediate, delayed, failing and silent completion
//!   - Refusing the doorbell (transport failure)
//!   - Per-command handler to publish platform values into the region
//!   - Ring log for asserting how many round-trips a workload cost

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::debug;
use nexus_hal::{Doorbell, HalError};
use parking_lot::Mutex;

use crate::shmem::SharedRegion;
use crate::Command;

type Handler = Box<dyn Fn(Command, &SharedRegion) + Send + Sync>;

/// How the emulated platform answers a posted command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Set the completion bit before `ring` returns.
    Immediate,
    /// Set the completion bit from another thread after the delay.
    After(Duration),
    /// Complete with the error bit set.
    Error,
    /// Never complete.
    Never,
}

/// Emulated platform side of one PCC subspace.
pub struct LoopbackPlatform {
    region: SharedRegion,
    completion: Mutex<Completion>,
    reject: AtomicBool,
    commands: Mutex<Vec<Command>>,
    handler: Mutex<Option<Handler>>,
}

impl LoopbackPlatform {
    /// Creates the platform with a region already signed for `subspace`.
    pub fn new(subspace: u8, len: usize) -> Self {
        Self {
            region: SharedRegion::initialized(subspace, len),
            completion: Mutex::new(Completion::Immediate),
            reject: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn set_completion(&self, completion: Completion) {
        *self.completion.lock() = completion;
    }

    /// Makes the doorbell refuse every command while `reject` is set.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Runs `handler` for every accepted command before it completes.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(Command, &SharedRegion) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    /// Commands accepted so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn rings(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn rings_of(&self, cmd: Command) -> usize {
        self.commands.lock().iter().filter(|c| **c == cmd).count()
    }
}

impl Doorbell for LoopbackPlatform {
    fn ring(&self, command: u16) -> Result<(), HalError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(HalError::Busy);
        }
        let cmd = Command::from_code(command).ok_or(HalError::Device(i32::from(command)))?;
        self.commands.lock().push(cmd);
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(cmd, &self.region);
        }
        match *self.completion.lock() {
            Completion::Immediate => self.region.complete(false),
            Completion::Error => self.region.complete(true),
            Completion::Never => debug!("loopback: leaving {cmd:?} incomplete"),
            Completion::After(delay) => {
                let region = self.region.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    region.complete(false);
                });
            }
        }
        Ok(())
    }
}
