// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! An in-memory device backend that lets the transport core run without
//! RDMA hardware.
//!
//! The mock records registrations, posted writes and decoded control
//! sends. Peer behavior is scripted: each batch queued with
//! [`MockBackend::script_reply`] is delivered into the posted RECV
//! buffers right after the next control SEND, mimicking a responsive
//! peer.

use std::collections::{HashMap, VecDeque};

use crate::backend::{Completion, IbBackend, WriteRequest, WC_SUCCESS};
use crate::error::{RdmaError, Result};
use crate::registry::{Link, MrHandle, MrInfo, NB_LINKS};
use crate::wire::{ControlHeader, ControlType};
use crate::wrid::{WorkRequestId, WrKind};

/// One recorded memory registration.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub link: Link,
    pub addr: u64,
    pub len: u64,
    pub remote_access: bool,
}

#[derive(Debug)]
struct PostedRecv {
    wr_id: WorkRequestId,
    addr: u64,
    len: u32,
}

/// A scriptable in-memory [`IbBackend`].
#[derive(Debug, Default)]
pub struct MockBackend {
    next_handle: u64,
    /// Live registrations by handle.
    pub registrations: HashMap<u64, Registration>,
    /// Handles released so far.
    pub deregistered: Vec<u64>,
    /// Every posted RDMA write, in order.
    pub writes: Vec<(Link, WriteRequest)>,
    /// Every control SEND, decoded.
    pub sent: Vec<(ControlHeader, Vec<u8>)>,
    /// Queue pairs forced into the error state.
    pub qp_errors: Vec<Link>,
    /// Queue write completions only when the waiter blocks, instead of
    /// immediately at post time.
    pub manual_write_completions: bool,
    /// Fail this many upcoming write posts with a full send queue.
    pub fail_post_writes: u32,

    completions: [VecDeque<Completion>; NB_LINKS],
    pending_writes: [Vec<Completion>; NB_LINKS],
    posted_recvs: Vec<PostedRecv>,
    script: VecDeque<Vec<(usize, Vec<u8>)>>,
    fail_completion_status: Option<u32>,
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend::default()
    }

    /// Queues a batch of peer messages, delivered after the next control
    /// SEND. Each entry targets one control-buffer slot.
    pub fn script_reply(&mut self, batch: Vec<(usize, Vec<u8>)>) {
        self.script.push_back(batch);
    }

    /// Makes the next polled completion carry a failure status.
    pub fn fail_next_completion(&mut self, status: u32) {
        self.fail_completion_status = Some(status);
    }

    fn deliver(&mut self, slot: usize, bytes: &[u8]) {
        let position = self
            .posted_recvs
            .iter()
            .position(|recv| recv.wr_id.kind() == WrKind::RecvControl(slot))
            .unwrap_or_else(|| panic!("no RECV posted for control slot {}", slot));
        let recv = self.posted_recvs.remove(position);
        assert!(bytes.len() <= recv.len as usize, "message exceeds RECV buffer");
        // SAFETY: the address belongs to a live, registered control
        // buffer owned by the transport under test.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), recv.addr as *mut u8, bytes.len());
        }
        self.completions[Link::Remote as usize].push_back(Completion {
            wr_id: recv.wr_id,
            status: WC_SUCCESS,
            byte_len: bytes.len() as u32,
        });
    }
}

impl IbBackend for MockBackend {
    fn register(
        &mut self,
        link: Link,
        addr: u64,
        len: u64,
        remote_access: bool,
    ) -> Result<MrInfo> {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.registrations.insert(
            handle,
            Registration {
                link,
                addr,
                len,
                remote_access,
            },
        );
        Ok(MrInfo {
            handle: MrHandle(handle),
            lkey: 0x1000 + handle as u32,
            rkey: 0x2000 + handle as u32,
        })
    }

    fn deregister(&mut self, _link: Link, handle: MrHandle) -> Result<()> {
        if self.registrations.remove(&handle.0).is_none() {
            return Err(RdmaError::DeregisterFailure(libc::EINVAL));
        }
        self.deregistered.push(handle.0);
        Ok(())
    }

    fn post_write(&mut self, link: Link, wr: WriteRequest) -> Result<()> {
        if self.fail_post_writes > 0 {
            self.fail_post_writes -= 1;
            return Err(RdmaError::SendQueueFull);
        }
        self.writes.push((link, wr));
        if wr.signaled {
            let completion = Completion {
                wr_id: wr.wr_id,
                status: WC_SUCCESS,
                byte_len: wr.len,
            };
            if self.manual_write_completions {
                self.pending_writes[link as usize].push(completion);
            } else {
                self.completions[link as usize].push_back(completion);
            }
        }
        Ok(())
    }

    fn post_send(
        &mut self,
        link: Link,
        wr_id: WorkRequestId,
        addr: u64,
        len: u32,
        _lkey: u32,
    ) -> Result<()> {
        // SAFETY: the address belongs to the transport's registered
        // control buffer.
        let raw =
            unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) }.to_vec();
        let head = ControlHeader::from_wire(&raw[..ControlHeader::WIRE_SIZE])?;
        let payload = raw[ControlHeader::WIRE_SIZE..].to_vec();
        // READY announcements are protocol plumbing, not interesting to
        // assertions.
        if head.kind != ControlType::Ready {
            self.sent.push((head, payload));
        }

        self.completions[link as usize].push_back(Completion {
            wr_id,
            status: WC_SUCCESS,
            byte_len: len,
        });

        if let Some(batch) = self.script.pop_front() {
            for (slot, bytes) in batch {
                self.deliver(slot, &bytes);
            }
        }
        Ok(())
    }

    fn post_recv(
        &mut self,
        _link: Link,
        wr_id: WorkRequestId,
        addr: u64,
        len: u32,
        _lkey: u32,
    ) -> Result<()> {
        self.posted_recvs.push(PostedRecv { wr_id, addr, len });
        Ok(())
    }

    fn poll(&mut self, link: Link) -> Result<Option<Completion>> {
        let mut completion = match self.completions[link as usize].pop_front() {
            Some(c) => c,
            None => return Ok(None),
        };
        if let Some(status) = self.fail_completion_status.take() {
            completion.status = status;
        }
        Ok(Some(completion))
    }

    fn wait_completion(&mut self, link: Link) -> Result<()> {
        if !self.completions[link as usize].is_empty() {
            return Ok(());
        }
        if let Some(completion) = self.pending_writes[link as usize].pop() {
            self.completions[link as usize].push_back(completion);
            return Ok(());
        }
        Err(RdmaError::Protocol(
            "blocking wait with no completion in flight",
        ))
    }

    fn set_qp_error(&mut self, link: Link) -> Result<()> {
        self.qp_errors.push(link);
        Ok(())
    }
}

/// Canned wire messages for scripting the fake peer.
pub mod messages {
    use crate::wire::{
        CompressCommand, ControlHeader, ControlType, RegisterCommand, RegisterResult, RemoteBlock,
    };

    fn framed(kind: ControlType, payload: &[u8], repeat: u32) -> Vec<u8> {
        let mut raw = vec![0u8; ControlHeader::WIRE_SIZE + payload.len()];
        ControlHeader::new(kind, payload.len() as u32, repeat)
            .to_wire(&mut raw[..ControlHeader::WIRE_SIZE]);
        raw[ControlHeader::WIRE_SIZE..].copy_from_slice(payload);
        raw
    }

    pub fn ready() -> Vec<u8> {
        framed(ControlType::Ready, &[], 1)
    }

    pub fn register_finished() -> Vec<u8> {
        framed(ControlType::RegisterFinished, &[], 1)
    }

    pub fn unregister_finished() -> Vec<u8> {
        framed(ControlType::UnregisterFinished, &[], 1)
    }

    pub fn byte_stream(payload: &[u8]) -> Vec<u8> {
        framed(ControlType::ByteStream, payload, 1)
    }

    pub fn register_result(rkey: u32, host_addr: u64) -> Vec<u8> {
        let result = RegisterResult { rkey, host_addr };
        let mut payload = [0u8; RegisterResult::WIRE_SIZE];
        result.to_wire(&mut payload);
        framed(ControlType::RegisterResult, &payload, 1)
    }

    pub fn register_request(reg: &RegisterCommand) -> Vec<u8> {
        let mut payload = [0u8; RegisterCommand::WIRE_SIZE];
        reg.to_wire(&mut payload);
        framed(ControlType::RegisterRequest, &payload, 1)
    }

    pub fn compress(comp: &CompressCommand) -> Vec<u8> {
        let mut payload = [0u8; CompressCommand::WIRE_SIZE];
        comp.to_wire(&mut payload);
        framed(ControlType::Compress, &payload, 1)
    }

    pub fn remote_blocks(blocks: &[RemoteBlock]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(blocks.len() * RemoteBlock::WIRE_SIZE);
        for block in blocks {
            let mut raw = [0u8; RemoteBlock::WIRE_SIZE];
            block.to_wire(&mut raw);
            payload.extend_from_slice(&raw);
        }
        framed(ControlType::RamBlocksResult, &payload, 1)
    }
}
