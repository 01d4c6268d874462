// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The verbs data-plane seam.
//!
//! Everything the transport core needs from the RDMA device fits behind
//! this trait: memory registration, posting work requests, and draining
//! completions. The production implementation (feature `rdma`) drives
//! libibverbs queue pairs; tests drive the core with an in-memory mock.

use crate::error::Result;
use crate::registry::{Link, MrHandle, MrInfo};
use crate::wrid::WorkRequestId;

/// Completion status of a successful work request.
pub const WC_SUCCESS: u32 = 0;

/// One drained work completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: WorkRequestId,
    /// Zero on success; any other value is fatal for the connection.
    pub status: u32,
    pub byte_len: u32,
}

/// How a blocking completion wait behaves.
///
/// `Block` makes a blocking verbs call on the completion channel;
/// `PollFdReadable` polls the channel file descriptor first so a
/// cooperative caller can interleave other work. Chosen at connection
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    Block,
    PollFdReadable,
}

/// Parameters of one RDMA WRITE work request.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest {
    pub wr_id: WorkRequestId,
    pub local_addr: u64,
    pub len: u32,
    pub lkey: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    pub signaled: bool,
}

/// Operations the transport core requires from the RDMA device.
pub trait IbBackend {
    /// Pins `len` bytes at `addr` for `link`'s protection domain.
    /// `remote_access` additionally grants the peer write access.
    fn register(&mut self, link: Link, addr: u64, len: u64, remote_access: bool)
        -> Result<MrInfo>;

    /// Releases a registration.
    fn deregister(&mut self, link: Link, handle: MrHandle) -> Result<()>;

    /// Posts an RDMA WRITE. Returns [`crate::RdmaError::SendQueueFull`]
    /// when the send queue is exhausted; the caller waits for a
    /// completion and retries.
    fn post_write(&mut self, link: Link, wr: WriteRequest) -> Result<()>;

    /// Posts an IB SEND of `len` bytes at `addr`.
    fn post_send(&mut self, link: Link, wr_id: WorkRequestId, addr: u64, len: u32, lkey: u32)
        -> Result<()>;

    /// Posts an IB RECV buffer of `len` bytes at `addr`.
    fn post_recv(&mut self, link: Link, wr_id: WorkRequestId, addr: u64, len: u32, lkey: u32)
        -> Result<()>;

    /// Drains at most one completion without blocking.
    fn poll(&mut self, link: Link) -> Result<Option<Completion>>;

    /// Blocks until at least one completion is available on `link`.
    fn wait_completion(&mut self, link: Link) -> Result<()>;

    /// Forces `link`'s queue pair into the error state.
    fn set_qp_error(&mut self, link: Link) -> Result<()>;
}
