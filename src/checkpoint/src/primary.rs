// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-tick checkpoint state machine run on the primary.
//!
//! Each tick: reset the staging ring, pause the guest, insert the network
//! barrier covering the *next* checkpoint, serialize guest state into the
//! ring, resume the guest, stream the staged bytes to the secondary,
//! wait for the acknowledgement, release the previous barrier, sleep until
//! the next tick. The loop runs on a dedicated worker thread and takes the
//! hypervisor lock only around pause → save → resume.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{io, thread};

use log::{error, info};
use utils::time::{get_time_ms, ClockType};

use crate::config::{CheckpointConfig, ConfigError};
use crate::hypervisor::{DirtyStats, Hypervisor, HypervisorError};
use crate::netbuf::{NetBuffer, NetBufferError};
use crate::protocol;
use crate::protocol::{ProtocolError, Transaction};
use crate::slab::SlabRing;
use crate::stream::CheckpointStream;

/// Replication lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    /// Replication requested but checkpointing has not started.
    Active = 0,
    /// The checkpoint loop is running.
    MicroCheckpointing = 1,
    /// Replication stopped in an orderly fashion.
    Completed = 2,
    /// Replication failed.
    Error = 3,
}

/// A replication state variable shared between the worker thread and its
/// controller. The loop re-reads it every tick; flipping it away from
/// [`MigrationState::MicroCheckpointing`] requests an orderly exit after
/// the current checkpoint.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl Default for StateCell {
    fn default() -> StateCell {
        StateCell::new()
    }
}

impl StateCell {
    pub fn new() -> StateCell {
        StateCell(Arc::new(AtomicU8::new(MigrationState::Active as u8)))
    }

    pub fn get(&self) -> MigrationState {
        match self.0.load(Ordering::Acquire) {
            0 => MigrationState::Active,
            1 => MigrationState::MicroCheckpointing,
            2 => MigrationState::Completed,
            _ => MigrationState::Error,
        }
    }

    pub fn set(&self, state: MigrationState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Progress counters for the checkpoint loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointMetrics {
    /// Checkpoints acknowledged by the secondary.
    pub checkpoints: u64,
    /// Total checkpoint bytes transmitted.
    pub bytes_transferred: u64,
    /// Guest downtime of the last checkpoint, in ms.
    pub last_downtime_ms: u64,
    /// Transmit-plus-acknowledge time of the last checkpoint, in ms.
    pub last_xmit_ms: u64,
    /// Wall time of the last complete tick, in ms.
    pub last_total_ms: u64,
    /// Hypervisor-reported dirty-tracking durations.
    pub dirty: DirtyStats,
}

/// Errors that terminate the checkpoint loop.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CheckpointError {
    /// Invalid configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot enable network buffering: {0}
    Buffering(#[from] NetBufferError),
    /// Replication control stream failed: {0}
    Protocol(#[from] ProtocolError),
    /// Transmitting checkpoint data failed: {0}
    Transmit(io::Error),
    /// Hypervisor operation failed: {0}
    Hypervisor(#[from] HypervisorError),
    /// Checkpoint of {0} bytes exceeds the stream framing limit
    CheckpointTooLarge(u64),
}

/// The primary-side checkpoint loop.
pub struct CheckpointLoop<H: Hypervisor, S: Read + Write> {
    hypervisor: Arc<Mutex<H>>,
    stream: S,
    ring: SlabRing,
    netbuf: NetBuffer,
    state: StateCell,
    config: CheckpointConfig,
    metrics: CheckpointMetrics,
}

impl<H: Hypervisor, S: Read + Write> CheckpointLoop<H, S> {
    /// Creates a loop over an established replication stream.
    pub fn new(
        hypervisor: Arc<Mutex<H>>,
        stream: S,
        netbuf: NetBuffer,
        state: StateCell,
        config: CheckpointConfig,
    ) -> CheckpointLoop<H, S> {
        let ring = SlabRing::new(config.max_strikes());
        CheckpointLoop {
            hypervisor,
            stream,
            ring,
            netbuf,
            state,
            config,
            metrics: CheckpointMetrics::default(),
        }
    }

    /// Progress counters, updated after every acknowledged checkpoint.
    pub fn metrics(&self) -> &CheckpointMetrics {
        &self.metrics
    }

    /// Runs checkpoints until cancellation or error. Buffering is always
    /// disabled on the way out, and the shared state ends up in
    /// [`MigrationState::Completed`] or [`MigrationState::Error`].
    pub fn run(&mut self) -> Result<(), CheckpointError> {
        let result = self.run_inner();
        self.netbuf.disable();
        match &result {
            Ok(()) => {
                if self.state.get() == MigrationState::MicroCheckpointing {
                    self.state.set(MigrationState::Completed);
                }
                info!("checkpoint loop finished after {} checkpoints", self.metrics.checkpoints);
            }
            Err(err) => {
                error!("checkpoint loop failed: {}", err);
                self.state.set(MigrationState::Error);
            }
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), CheckpointError> {
        self.config.validate()?;

        if self.state.get() == MigrationState::Active {
            self.state.set(MigrationState::MicroCheckpointing);
        }

        {
            let nics = self.hypervisor.lock().expect("Poisoned lock").nics();
            self.netbuf.enable(&nics)?;
        }

        // One ACK from the secondary kicks everything off.
        match protocol::recv_transaction(&mut self.stream)? {
            Transaction::Ack => {}
            other => {
                return Err(ProtocolError::UnexpectedTransaction(Transaction::Ack, other).into());
            }
        }

        let mut last_log_ms = get_time_ms(ClockType::Monotonic);

        while self.state.get() == MigrationState::MicroCheckpointing {
            let tick_start_ms = get_time_ms(ClockType::Monotonic);

            self.ring.reset_for_checkpoint();
            let downtime_ms = self.capture_checkpoint()?;

            let xmit_start_ms = get_time_ms(ClockType::Monotonic);
            let bytes = self.ring.slab_total();

            // The checkpoint is staged and the guest is running again;
            // start the transaction.
            protocol::send_transaction(&mut self.stream, Transaction::Commit)
                .map_err(ProtocolError::Io)?;
            let size = u32::try_from(bytes)
                .map_err(|_| CheckpointError::CheckpointTooLarge(bytes))?;
            protocol::send_be_u32(&mut self.stream, size).map_err(ProtocolError::Io)?;
            self.ring
                .drain_to(&mut self.stream)
                .map_err(CheckpointError::Transmit)?;
            self.stream.flush().map_err(CheckpointError::Transmit)?;

            match protocol::recv_transaction(&mut self.stream)? {
                // The checkpoint is safe on the secondary; its packets may
                // become externally visible.
                Transaction::Ack => self.netbuf.release_one(),
                Transaction::Cancel => {
                    info!("secondary requested an orderly stop");
                    break;
                }
                other => {
                    return Err(
                        ProtocolError::UnexpectedTransaction(Transaction::Ack, other).into()
                    );
                }
            }

            let end_ms = get_time_ms(ClockType::Monotonic);
            self.metrics.checkpoints += 1;
            self.metrics.bytes_transferred += bytes;
            self.metrics.last_downtime_ms = downtime_ms;
            self.metrics.last_xmit_ms = end_ms.saturating_sub(xmit_start_ms);
            self.metrics.last_total_ms = end_ms.saturating_sub(tick_start_ms);
            self.metrics.dirty = self.hypervisor.lock().expect("Poisoned lock").dirty_stats();

            if end_ms >= last_log_ms + 1000 {
                info!(
                    "checkpoint {}: {} bytes, downtime {} ms, xmit {} ms, sync {} ms, logdirty {} ms",
                    self.metrics.checkpoints,
                    bytes,
                    self.metrics.last_downtime_ms,
                    self.metrics.last_xmit_ms,
                    self.metrics.dirty.bitmap_sync_ms,
                    self.metrics.dirty.log_dirty_ms,
                );
                last_log_ms = end_ms;
            }

            thread::sleep(Duration::from_millis(self.config.interval_ms));
        }

        Ok(())
    }

    /// Pauses the guest, stages one checkpoint into the slab ring and
    /// resumes the guest. Returns the guest downtime in ms. The iothread
    /// lock is held for the whole capture.
    fn capture_checkpoint(&mut self) -> Result<u64, CheckpointError> {
        let mut hypervisor = self.hypervisor.lock().expect("Poisoned lock");

        hypervisor.reset_dirty_accounting();
        hypervisor.pause()?;
        let pause_start_ms = get_time_ms(ClockType::Monotonic);

        // Plug packets for the *next* checkpoint; the current one's
        // packets were already barriered on the previous tick and will be
        // released after this checkpoint is acknowledged.
        self.netbuf.insert_barrier();

        let mut stream = CheckpointStream::new(&mut self.ring);
        hypervisor.save_state_begin(&mut stream)?;
        hypervisor.save_state_complete(&mut stream)?;
        let save_end_ms = get_time_ms(ClockType::Monotonic);

        hypervisor.resume()?;
        Ok(save_end_ms.saturating_sub(pause_start_ms))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;
    use crate::netbuf::DEFAULT_BUFFER_SIZE;
    use crate::protocol::{recv_be_u32, recv_transaction, send_transaction};
    use crate::testing::{FakeShaper, TestHypervisor};

    fn test_loop(
        hypervisor: TestHypervisor,
        stream: UnixStream,
        state: StateCell,
    ) -> (
        CheckpointLoop<TestHypervisor, UnixStream>,
        Arc<Mutex<TestHypervisor>>,
    ) {
        let hypervisor = Arc::new(Mutex::new(hypervisor));
        let shaper = FakeShaper::new();
        let netbuf = NetBuffer::new(Box::new(shaper), DEFAULT_BUFFER_SIZE);
        let config = CheckpointConfig {
            interval_ms: 1,
            ..Default::default()
        };
        let cl = CheckpointLoop::new(hypervisor.clone(), stream, netbuf, state, config);
        (cl, hypervisor)
    }

    #[test]
    fn test_checkpoints_flow_until_completed() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        theirs
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let state = StateCell::new();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let (mut cl, hypervisor) = test_loop(TestHypervisor::new(payload.clone()), ours, state.clone());

        let worker = thread::spawn(move || {
            let res = cl.run();
            (res, cl)
        });

        let mut theirs = theirs;
        send_transaction(&mut theirs, Transaction::Ack).unwrap();

        let mut served = 0u32;
        loop {
            match recv_transaction(&mut theirs) {
                Ok(Transaction::Commit) => {
                    let size = recv_be_u32(&mut theirs).unwrap();
                    assert!(size > 0);
                    let mut data = vec![0u8; size as usize];
                    theirs.read_exact(&mut data).unwrap();
                    served += 1;
                    if served == 2 {
                        state.set(MigrationState::Completed);
                    }
                    send_transaction(&mut theirs, Transaction::Ack).unwrap();
                }
                Ok(other) => panic!("unexpected transaction {:?}", other),
                // EOF or timeout: the loop exited.
                Err(_) => break,
            }
        }

        let (res, cl) = worker.join().unwrap();
        res.unwrap();
        assert_eq!(state.get(), MigrationState::Completed);
        assert!(cl.metrics().checkpoints >= 2);
        assert!(cl.metrics().bytes_transferred > 0);

        let hv = hypervisor.lock().unwrap();
        assert!(hv.pause_count >= 2);
        assert_eq!(hv.pause_count, hv.resume_count);
        assert!(!hv.paused);
    }

    #[test]
    fn test_cancel_stops_orderly() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let state = StateCell::new();
        let (mut cl, _hypervisor) = test_loop(TestHypervisor::new(vec![7u8; 64]), ours, state.clone());

        let worker = thread::spawn(move || cl.run());

        let mut theirs = theirs;
        send_transaction(&mut theirs, Transaction::Ack).unwrap();
        assert_eq!(
            recv_transaction(&mut theirs).unwrap(),
            Transaction::Commit
        );
        let size = recv_be_u32(&mut theirs).unwrap();
        let mut data = vec![0u8; size as usize];
        theirs.read_exact(&mut data).unwrap();
        send_transaction(&mut theirs, Transaction::Cancel).unwrap();

        worker.join().unwrap().unwrap();
        assert_eq!(state.get(), MigrationState::Completed);
    }

    #[test]
    fn test_save_failure_transitions_to_error() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let state = StateCell::new();
        let mut hypervisor = TestHypervisor::new(vec![1u8; 16]);
        hypervisor.fail_save = true;
        let (mut cl, _hypervisor) = test_loop(hypervisor, ours, state.clone());

        let worker = thread::spawn(move || cl.run());

        let mut theirs = theirs;
        send_transaction(&mut theirs, Transaction::Ack).unwrap();
        // The loop dies during capture; the stream simply closes.
        let res = worker.join().unwrap();
        assert!(matches!(res, Err(CheckpointError::Hypervisor(_))));
        assert_eq!(state.get(), MigrationState::Error);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let state = StateCell::new();
        let hypervisor = Arc::new(Mutex::new(TestHypervisor::new(vec![])));
        let netbuf = NetBuffer::new(Box::new(FakeShaper::new()), DEFAULT_BUFFER_SIZE);
        let config = CheckpointConfig {
            interval_ms: 0,
            ..Default::default()
        };
        let mut cl = CheckpointLoop::new(hypervisor, ours, netbuf, state, config);
        assert!(matches!(cl.run(), Err(CheckpointError::Config(_))));
    }
}
