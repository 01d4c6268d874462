// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The mirror loop run on the secondary.
//!
//! After signaling readiness with one ACK, the receiver loops: receive a
//! COMMIT, receive the checkpoint size and exactly that many bytes into
//! the staging ring, acknowledge, and replay the bytes through the
//! hypervisor's load-state call. The acknowledgement is sent before the
//! replay so the primary's guest resumes with minimal latency; a replay
//! failure therefore terminates the process, because continuing would
//! silently diverge from the primary.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::hypervisor::Hypervisor;
use crate::protocol;
use crate::protocol::{ProtocolError, Transaction};
use crate::slab::SlabRing;
use crate::stream::CheckpointStream;

/// Errors that abort the receive loop.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ReceiverError {
    /// Replication control stream failed: {0}
    Protocol(#[from] ProtocolError),
    /// Receiving checkpoint data failed: {0}
    Receive(std::io::Error),
    /// Received an empty checkpoint
    EmptyCheckpoint,
}

/// The secondary-side checkpoint receiver.
pub struct CheckpointReceiver<H: Hypervisor, S: Read + Write> {
    hypervisor: Arc<Mutex<H>>,
    stream: S,
    ring: SlabRing,
    applied: u64,
}

impl<H: Hypervisor, S: Read + Write> CheckpointReceiver<H, S> {
    pub fn new(hypervisor: Arc<Mutex<H>>, stream: S, max_strikes: u32) -> CheckpointReceiver<H, S> {
        CheckpointReceiver {
            hypervisor,
            stream,
            ring: SlabRing::new(max_strikes),
            applied: 0,
        }
    }

    /// Number of checkpoints applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Receives and applies checkpoints until the primary cancels or the
    /// stream breaks. An error return means the last replicated state is
    /// still intact and the embedder may recover the guest from it.
    pub fn run(&mut self) -> Result<(), ReceiverError> {
        info!("signaling readiness to primary");
        protocol::send_transaction(&mut self.stream, Transaction::Ack)
            .map_err(ProtocolError::Io)?;

        loop {
            self.ring.reset_for_checkpoint();

            match protocol::recv_transaction(&mut self.stream)? {
                Transaction::Commit => {}
                Transaction::Cancel => {
                    info!("primary requested an orderly stop");
                    return Ok(());
                }
                other => {
                    return Err(ProtocolError::UnexpectedTransaction(
                        Transaction::Commit,
                        other,
                    )
                    .into());
                }
            }

            let size = protocol::recv_be_u32(&mut self.stream).map_err(ProtocolError::Io)?;
            if size == 0 {
                warn!("received an empty checkpoint");
                return Err(ReceiverError::EmptyCheckpoint);
            }

            self.ring
                .fill_from(&mut self.stream, u64::from(size))
                .map_err(ReceiverError::Receive)?;
            self.ring.rewind();

            protocol::send_transaction(&mut self.stream, Transaction::Ack)
                .map_err(ProtocolError::Io)?;

            let mut hypervisor = self.hypervisor.lock().expect("Poisoned lock");
            let mut source = CheckpointStream::new(&mut self.ring);
            if let Err(err) = hypervisor.load_state(&mut source) {
                // The staged bytes were already acknowledged; failing to
                // apply them silently diverges from the primary.
                error!("applying a committed checkpoint failed: {}", err);
                std::process::exit(1);
            }
            self.applied += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::send_be_u32;
    use crate::testing::{Pipe, TestHypervisor};

    fn checkpoint_bytes(payload: &[u8]) -> Vec<u8> {
        // TestHypervisor's state framing: length-prefixed payload.
        let mut bytes = Vec::new();
        send_be_u32(&mut bytes, payload.len() as u32).unwrap();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn script(commits: &[&[u8]], trailer: Option<Transaction>) -> Vec<u8> {
        let mut input = Vec::new();
        for payload in commits {
            protocol::send_transaction(&mut input, Transaction::Commit).unwrap();
            let body = checkpoint_bytes(payload);
            send_be_u32(&mut input, body.len() as u32).unwrap();
            input.extend_from_slice(&body);
        }
        if let Some(t) = trailer {
            protocol::send_transaction(&mut input, t).unwrap();
        }
        input
    }

    #[test]
    fn test_receive_apply_and_cancel() {
        let first = vec![0xAAu8; 5000];
        let second = vec![0x55u8; 9000];
        let input = script(&[&first, &second], Some(Transaction::Cancel));
        let hypervisor = Arc::new(Mutex::new(TestHypervisor::new(vec![])));
        let mut receiver =
            CheckpointReceiver::new(hypervisor.clone(), Pipe::new(input), 100);

        receiver.run().unwrap();
        assert_eq!(receiver.applied(), 2);

        let hv = hypervisor.lock().unwrap();
        assert_eq!(hv.loaded, vec![first, second]);

        // Initial readiness ACK plus one ACK per checkpoint.
        let output = receiver.stream.output.clone();
        assert_eq!(output.len(), 3 * 4);
        for chunk in output.chunks(4) {
            assert_eq!(chunk, [0, 0, 0, 3]);
        }
    }

    #[test]
    fn test_zero_size_is_a_protocol_violation() {
        let mut input = Vec::new();
        protocol::send_transaction(&mut input, Transaction::Commit).unwrap();
        send_be_u32(&mut input, 0).unwrap();
        let hypervisor = Arc::new(Mutex::new(TestHypervisor::new(vec![])));
        let mut receiver = CheckpointReceiver::new(hypervisor, Pipe::new(input), 100);
        assert!(matches!(
            receiver.run(),
            Err(ReceiverError::EmptyCheckpoint)
        ));
    }

    #[test]
    fn test_unexpected_sentinel_aborts() {
        let mut input = Vec::new();
        protocol::send_transaction(&mut input, Transaction::Ack).unwrap();
        let hypervisor = Arc::new(Mutex::new(TestHypervisor::new(vec![])));
        let mut receiver = CheckpointReceiver::new(hypervisor, Pipe::new(input), 100);
        assert!(matches!(
            receiver.run(),
            Err(ReceiverError::Protocol(
                ProtocolError::UnexpectedTransaction(Transaction::Commit, Transaction::Ack)
            ))
        ));
    }

    #[test]
    fn test_truncated_stream_aborts() {
        let mut input = Vec::new();
        protocol::send_transaction(&mut input, Transaction::Commit).unwrap();
        send_be_u32(&mut input, 1024).unwrap();
        input.extend_from_slice(&[0u8; 100]);
        let hypervisor = Arc::new(Mutex::new(TestHypervisor::new(vec![])));
        let mut receiver = CheckpointReceiver::new(hypervisor, Pipe::new(input), 100);
        assert!(matches!(receiver.run(), Err(ReceiverError::Receive(_))));
    }
}
