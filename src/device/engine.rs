/*
 *  device/engine.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Asynchronous transfer engine: buffer pool, submission queue and
 *  completion reconciliation shared by the USB and SPI transports
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::device::buffer::{BufferPolicy, BufferState, TransferBuffer};
use crate::device::error::DeviceError;

pub type TransferId = u64;

/// How a submitted transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success { bytes: usize },
    Failed(String),
    Cancelled,
}

/// Message handed from the hardware stack's callback context to the engine
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub outcome: TransferOutcome,
    /// The submitted storage, returned to its owner
    pub storage: Vec<u8>,
}

/// Completion notification for exactly one transfer.
///
/// This is all a hardware stack gets to touch from inside its event step:
/// consuming the sink queues a [`Completion`] for the next `poll_events` or
/// `flush` on the control thread. It cannot reach device write or flush logic.
#[derive(Debug)]
pub struct CompletionSink {
    id: TransferId,
    tx: Sender<Completion>,
}

impl CompletionSink {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn complete(self, outcome: TransferOutcome, storage: Vec<u8>) {
        // receiver gone means the transport was dropped; nobody is waiting
        let _ = self.tx.send(Completion { id: self.id, outcome, storage });
    }
}

/// Submission refused by the hardware stack; ownership of the data comes back
#[derive(Debug)]
pub struct Rejected {
    pub reason: String,
    pub storage: Vec<u8>,
}

/// The submit/cancel/event surface of one hardware endpoint
pub trait Submitter {
    /// Queue `storage` for transfer; the stack must eventually consume `sink`
    /// exactly once, even for cancelled transfers.
    fn submit(&mut self, storage: Vec<u8>, sink: CompletionSink) -> Result<(), Rejected>;

    /// Request cancellation; confirmation arrives through the transfer's sink
    fn cancel(&mut self, id: TransferId);

    /// Run the stack's event step, delivering any finished completions
    fn handle_events(&mut self, timeout: Duration) -> Result<(), String>;
}

/// Tunables for one engine instance
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Buffers in the pool; at least two so staging never waits on hardware
    pub buffers: usize,
    pub max_in_flight: usize,
    /// Consecutive rejected submissions before the device is declared dead
    pub submit_attempts: u32,
    pub endpoint: u8,
    pub cancel_timeout: Duration,
    /// Bound on a synchronous write waiting for its completion
    pub sync_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffers: 2,
            max_in_flight: 2,
            submit_attempts: 3,
            endpoint: 1,
            cancel_timeout: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters reported through `describe()`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub bytes_completed: u64,
}

/// Result of staging a block of data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Queued,
    /// Every buffer is staged or in flight; try again after `flush()`
    Busy,
    /// Engine is dead; data dropped
    Discarded,
}

#[derive(Debug)]
struct InFlight {
    id: TransferId,
    /// Pool slot lent to the stack, `None` for a private copy
    buffer: Option<usize>,
}

/// Buffer pool plus transfer state machine:
/// `Staged -> Submitted -> (Completed | Failed) -> reconciled`.
pub struct TransferEngine {
    policy: BufferPolicy,
    config: TransferConfig,
    buffers: Vec<TransferBuffer>,
    queue: VecDeque<usize>,
    in_flight: VecDeque<InFlight>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    next_id: TransferId,
    consecutive_rejects: u32,
    dead: bool,
    last_success: Option<DateTime<Utc>>,
    stats: TransferStats,
}

impl TransferEngine {
    pub fn new(policy: BufferPolicy, config: TransferConfig, buffer_len: usize) -> Self {
        let count = config.buffers.max(2);
        let (tx, rx) = mpsc::channel();
        Self {
            policy,
            buffers: (0..count).map(|_| TransferBuffer::new(buffer_len)).collect(),
            config,
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            tx,
            rx,
            next_id: 1,
            consecutive_rejects: 0,
            dead: false,
            last_success: None,
            stats: TransferStats::default(),
        }
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Isolate this engine: later stages are dropped and nothing is resubmitted
    pub fn mark_dead(&mut self) {
        if !self.dead {
            warn!("transfer engine marked dead ({} queued frame(s) dropped)", self.queue.len());
        }
        self.dead = true;
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn buffer_states(&self) -> Vec<BufferState> {
        self.buffers.iter().map(TransferBuffer::state).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Copy `data` into a free buffer and queue it behind earlier stagings
    pub fn stage(&mut self, data: &[u8]) -> Result<StageOutcome, DeviceError> {
        if self.dead {
            return Ok(StageOutcome::Discarded);
        }
        let Some(slot) = self.buffers.iter().position(|b| b.state() == BufferState::Free) else {
            return Ok(StageOutcome::Busy);
        };
        self.buffers[slot].stage(data)?;
        self.queue.push_back(slot);
        Ok(StageOutcome::Queued)
    }

    /// Submit queued buffers in order, up to the in-flight limit.
    ///
    /// A rejection leaves the buffer at the head of the queue for the next
    /// attempt; after `submit_attempts` consecutive rejections the engine dies.
    pub fn pump(&mut self, hw: &mut dyn Submitter) -> Result<usize, DeviceError> {
        let mut submitted = 0;
        while !self.dead && self.in_flight.len() < self.config.max_in_flight {
            let Some(&slot) = self.queue.front() else { break };
            let id = self.next_id;
            let sink = CompletionSink { id, tx: self.tx.clone() };

            let (storage, lent) = if self.policy.copies() {
                // the copy is what travels; the staged bytes stay put until accepted
                let copy = self.buffers[slot].bytes().map(<[u8]>::to_vec);
                (copy.ok_or(DeviceError::BufferExhausted)?, false)
            } else {
                (self.buffers[slot].lend()?, true)
            };

            match hw.submit(storage, sink) {
                Ok(()) => {
                    self.queue.pop_front();
                    self.next_id += 1;
                    self.consecutive_rejects = 0;
                    self.stats.submitted += 1;
                    let buffer = if lent {
                        self.buffers[slot].mark_in_flight()?;
                        Some(slot)
                    } else {
                        self.buffers[slot].release()?;
                        None
                    };
                    debug!("transfer {} submitted ({})", id, self.policy);
                    self.in_flight.push_back(InFlight { id, buffer });
                    submitted += 1;
                }
                Err(rejected) => {
                    if lent {
                        self.buffers[slot].restore(rejected.storage);
                    }
                    self.consecutive_rejects += 1;
                    self.stats.rejected += 1;
                    warn!(
                        "transfer submission rejected ({}/{}): {}",
                        self.consecutive_rejects, self.config.submit_attempts, rejected.reason
                    );
                    let attempts = self.consecutive_rejects;
                    if attempts >= self.config.submit_attempts {
                        self.mark_dead();
                    }
                    return Err(DeviceError::TransferSubmit { attempts, reason: rejected.reason });
                }
            }
        }
        Ok(submitted)
    }

    /// Drain completion notifications: mark buffers `Completed` and record
    /// each outcome. Returns how many transfers were reconciled.
    pub fn reconcile(&mut self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.rx.try_recv() {
            let Some(pos) = self.in_flight.iter().position(|t| t.id == completion.id) else {
                debug!("completion for unknown transfer {}", completion.id);
                continue;
            };
            let Some(transfer) = self.in_flight.remove(pos) else { continue };
            if let Some(slot) = transfer.buffer {
                if let Err(e) = self.buffers[slot].complete(completion.storage) {
                    warn!("transfer {}: {}", transfer.id, e);
                }
            }
            match completion.outcome {
                TransferOutcome::Success { bytes } => {
                    self.stats.completed += 1;
                    self.stats.bytes_completed += bytes as u64;
                    self.last_success = Some(Utc::now());
                }
                TransferOutcome::Failed(reason) => {
                    self.stats.failed += 1;
                    warn!("transfer {} failed: {}", transfer.id, reason);
                }
                TransferOutcome::Cancelled => {
                    self.stats.cancelled += 1;
                }
            }
            count += 1;
        }
        count
    }

    /// Return every `Completed` buffer to `Free`
    pub fn recycle(&mut self) -> Result<(), DeviceError> {
        for buffer in self.buffers.iter_mut().filter(|b| b.state() == BufferState::Completed) {
            buffer.recycle()?;
        }
        Ok(())
    }

    /// Reconcile, recycle and resubmit queued work. A dead engine only
    /// reconciles; it never resubmits.
    pub fn flush(&mut self, hw: &mut dyn Submitter) -> Result<(), DeviceError> {
        self.reconcile();
        self.recycle()?;
        if self.dead {
            return Ok(());
        }
        self.pump(hw).map(|_| ())
    }

    /// Submit and then drive the event step until nothing is in flight.
    /// Used by transports whose writes are synchronous.
    pub fn wait_idle(&mut self, hw: &mut dyn Submitter) -> Result<(), DeviceError> {
        self.pump(hw)?;
        let deadline = Instant::now() + self.config.sync_timeout;
        loop {
            self.reconcile();
            if self.in_flight.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::TransferSubmit {
                    attempts: 0,
                    reason: format!("{} write(s) unfinished after {:?}", self.in_flight.len(), self.config.sync_timeout),
                });
            }
            hw.handle_events(Duration::from_millis(5)).map_err(DeviceError::Bridge)?;
        }
        self.recycle()
    }

    /// Cancel everything in flight and wait for the stack to confirm.
    ///
    /// Queued-but-unsubmitted data is dropped. Fails with `CancelFailed` if
    /// confirmations do not arrive within `cancel_timeout`.
    pub fn cancel_all(&mut self, hw: &mut dyn Submitter) -> Result<(), DeviceError> {
        for slot in self.queue.drain(..) {
            if let Err(e) = self.buffers[slot].release() {
                debug!("dropping queued buffer {}: {}", slot, e);
            }
        }
        for transfer in &self.in_flight {
            hw.cancel(transfer.id);
        }

        let deadline = Instant::now() + self.config.cancel_timeout;
        let slice = Duration::from_millis(10);
        loop {
            self.reconcile();
            if self.in_flight.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::CancelFailed(format!(
                    "{} transfer(s) unconfirmed after {:?}",
                    self.in_flight.len(),
                    self.config.cancel_timeout
                )));
            }
            hw.handle_events(slice).map_err(DeviceError::CancelFailed)?;
        }
        self.recycle()
    }
}
