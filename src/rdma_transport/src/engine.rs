// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The RDMA write engine.
//!
//! Pages offered by the hypervisor are merged into per-cursor ranges and
//! only posted when a range becomes unmergeable, reaches the merge cap,
//! or a synchronization point flushes it. Three cursors exist: one for
//! remote transfer and two for the local-copy pair. Per chunk, at most
//! one write is ever in flight (`transit` bitmap); in chunk-on-demand
//! mode a chunk is registered on both sides on first touch, an all-zero
//! never-registered chunk short-circuits into a COMPRESS control message,
//! and completed chunks may be queued for speculative unpinning.

use log::{debug, error, warn};

use crate::backend::{Completion, IbBackend, WriteRequest, WC_SUCCESS};
use crate::error::{RdmaError, Result};
use crate::registry::{other_local, Link, CHUNK_SIZE};
use crate::wire::{
    CompressCommand, ControlHeader, ControlType, RegisterCommand, RegisterResult, RemoteBlock,
    CONTROL_MAX_COMMANDS,
};
use crate::wrid::{WorkRequestId, WrKind};
use crate::{RdmaTransport, CTRL_DATA, CTRL_READY, MERGE_MAX};

pub use checkpoint::stream::RamPhase;

/// Cursor used for pages headed to the peer.
pub(crate) const CURSOR_REMOTE: usize = 0;
/// Cursor for the source side of local copies.
pub(crate) const CURSOR_LOCAL_SRC: usize = 1;
/// Cursor for the destination side of local copies.
pub(crate) const CURSOR_LOCAL_DEST: usize = 2;

/// A running, mergeable page range plus the chunk boundaries computed at
/// flush time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteCursor {
    /// VM-space address where the running range starts.
    pub current_addr: u64,
    /// Accumulated length awaiting flush.
    pub current_length: u64,
    pub current_block: Option<u32>,
    pub current_chunk: Option<u64>,
    /// Inputs of the most recent save/copy call.
    pub block_offset: u64,
    pub offset: u64,
    /// Flush-time boundaries.
    pub chunk_idx: u64,
    pub chunk_start: u64,
    pub chunk_end: u64,
    /// Host address of the range start.
    pub addr: u64,
    /// Additional sequential chunks spanned by the range.
    pub chunks: u64,
}

/// Fixed ring of work-request ids queued for speculative unpinning.
/// A zero entry marks an empty slot.
#[derive(Debug)]
pub(crate) struct UnregisterQueue {
    slots: Box<[u64]>,
    current: usize,
    next: usize,
}

impl UnregisterQueue {
    pub(crate) fn new(capacity: usize) -> UnregisterQueue {
        UnregisterQueue {
            slots: vec![0u64; capacity].into_boxed_slice(),
            current: 0,
            next: 0,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots[self.next] != 0
    }

    pub(crate) fn push(&mut self, wrid: u64) {
        debug_assert!(wrid != 0);
        self.slots[self.next] = wrid;
        self.next = (self.next + 1) % self.slots.len();
    }

    pub(crate) fn take(&mut self) -> Option<u64> {
        let wrid = self.slots[self.current];
        if wrid == 0 {
            return None;
        }
        self.slots[self.current] = 0;
        self.current = (self.current + 1) % self.slots.len();
        Some(wrid)
    }
}

/// Whether every byte of the range is zero.
fn range_is_zero(addr: u64, len: u64) -> bool {
    // SAFETY: the range was validated against a hypervisor-enumerated RAM
    // block by `BlockRegistry::search` before the cursor accepted it.
    let buf = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
    buf.iter().all(|&b| b == 0)
}

impl<B: IbBackend> RdmaTransport<B> {
    /// The queue pair local copies are posted on.
    pub(crate) fn local_link(&self) -> Link {
        if self.source {
            Link::LocalSrc
        } else {
            Link::LocalDest
        }
    }

    /// Drains one completion without blocking, updating transit state.
    /// A non-success status is fatal.
    pub(crate) fn poll_one(&mut self, link: Link) -> Result<Option<Completion>> {
        let completion = match self.backend.poll(link)? {
            Some(c) => c,
            None => return Ok(None),
        };

        if completion.status != WC_SUCCESS {
            error!(
                "work completion failed: wrid {} status {}",
                completion.wr_id.name(),
                completion.status
            );
            return Err(RdmaError::WorkCompletion(completion.status));
        }

        if self.control_ready_expected
            && matches!(completion.wr_id.kind(), WrKind::RecvControl(_))
        {
            self.control_ready_expected = false;
        }

        if matches!(
            completion.wr_id.kind(),
            WrKind::WriteRemote | WrKind::WriteLocal
        ) {
            let block_idx = completion.wr_id.block_index();
            let chunk = completion.wr_id.chunk();

            self.registry.get_mut(block_idx).transit.clear(chunk);
            self.nb_sent = self.nb_sent.saturating_sub(1);
            let li = link as usize;
            self.link_sent[li] = self.link_sent[li].saturating_sub(1);

            if self.speculative_unregister
                && !self.pin_all
                && self.registry.get(block_idx).pins[Link::Remote as usize].chunks
                    [chunk as usize]
                    .is_some()
            {
                self.signal_unregister(block_idx, chunk, completion.wr_id);
            }
        }

        Ok(Some(completion))
    }

    /// Polls until a completion with the wanted type bits is drained,
    /// blocking on the completion channel when the queue runs dry.
    /// Returns the matching completion's byte length.
    pub(crate) fn block_for_wrid(&mut self, link: Link, wanted: u64) -> Result<u32> {
        loop {
            while let Some(completion) = self.poll_one(link)? {
                if completion.wr_id.type_bits() == wanted {
                    return Ok(completion.byte_len);
                }
                debug!(
                    "wanted wrid type {} but drained {}",
                    wanted,
                    completion.wr_id.name()
                );
            }
            self.backend.wait_completion(link)?;
        }
    }

    /// Drains whatever has already completed, without blocking.
    pub(crate) fn poll_until_empty(&mut self, link: Link) -> Result<()> {
        while self.poll_one(link)?.is_some() {}
        Ok(())
    }

    /// Offers a guest page range for remote transfer. The range is merged
    /// into the running cursor when contiguous; otherwise the cursor is
    /// flushed as one RDMA write first. Transfer is asynchronous.
    pub fn save_page(&mut self, block_offset: u64, offset: u64, len: u64) -> Result<()> {
        self.check_error()?;
        let result = self.save_page_inner(block_offset, offset, len);
        if let Err(err) = &result {
            self.set_error(err.clone());
        }
        result
    }

    fn save_page_inner(&mut self, block_offset: u64, offset: u64, len: u64) -> Result<()> {
        let cursor = &mut self.cursors[CURSOR_REMOTE];
        cursor.block_offset = block_offset;
        cursor.offset = offset;

        self.flush_unmergable(CURSOR_REMOTE, None, len)?;

        if self.cursors[CURSOR_REMOTE].current_length >= MERGE_MAX {
            self.write_flush(CURSOR_REMOTE, None)?;
        }

        self.poll_until_empty(Link::Remote)
    }

    /// Offers a local RAM-to-RAM copy over the local queue-pair pair.
    pub fn copy_page(
        &mut self,
        dst_block_offset: u64,
        dst_offset: u64,
        src_block_offset: u64,
        src_offset: u64,
        len: u64,
    ) -> Result<()> {
        self.check_error()?;
        let result =
            self.copy_page_inner(dst_block_offset, dst_offset, src_block_offset, src_offset, len);
        if let Err(err) = &result {
            self.set_error(err.clone());
        }
        result
    }

    fn copy_page_inner(
        &mut self,
        dst_block_offset: u64,
        dst_offset: u64,
        src_block_offset: u64,
        src_offset: u64,
        len: u64,
    ) -> Result<()> {
        let src = &mut self.cursors[CURSOR_LOCAL_SRC];
        src.block_offset = src_block_offset;
        src.offset = src_offset;
        let dst = &mut self.cursors[CURSOR_LOCAL_DEST];
        dst.block_offset = dst_block_offset;
        dst.offset = dst_offset;

        self.flush_unmergable(CURSOR_LOCAL_SRC, Some(CURSOR_LOCAL_DEST), len)?;

        if self.cursors[CURSOR_LOCAL_SRC].current_length >= MERGE_MAX
            || self.cursors[CURSOR_LOCAL_DEST].current_length >= MERGE_MAX
        {
            self.write_flush(CURSOR_LOCAL_SRC, Some(CURSOR_LOCAL_DEST))?;
        }

        self.poll_until_empty(self.local_link())
    }

    /// Hints that the chunk containing `block_offset + offset` will not
    /// be written again soon and may be unpinned.
    pub fn advise_unregister(&mut self, block_offset: u64, offset: u64) -> Result<()> {
        self.check_error()?;
        let (block_idx, chunk) = self.registry.search(block_offset, offset, 0)?;
        self.signal_unregister(block_idx, chunk, WorkRequestId::write_remote(block_idx, chunk));
        Ok(())
    }

    fn mergeable(&self, cursor_id: usize, current_addr: u64, len: u64) -> bool {
        let cursor = &self.cursors[cursor_id];
        let (block_idx, chunk) = match (cursor.current_block, cursor.current_chunk) {
            (Some(b), Some(c)) => (b, c),
            _ => return false,
        };
        if cursor.current_length == 0 {
            return false;
        }
        let block = self.registry.get(block_idx);

        // Only merge exactly sequential ranges that stay inside the block
        // and inside the chunk the range started in.
        if current_addr != cursor.current_addr + cursor.current_length {
            return false;
        }
        if current_addr < block.offset
            || current_addr + len > block.offset + block.length
        {
            return false;
        }
        let host = block.host_addr + (current_addr - block.offset);
        host + len <= block.chunk_end(chunk)
    }

    fn write_start(&mut self, cursor_id: usize, len: u64, current_addr: u64) -> Result<()> {
        let (block_offset, offset) = {
            let cursor = &self.cursors[cursor_id];
            (cursor.block_offset, cursor.offset)
        };
        let (block_idx, chunk) = self.registry.search(block_offset, offset, len)?;
        let cursor = &mut self.cursors[cursor_id];
        cursor.current_addr = current_addr;
        cursor.current_block = Some(block_idx);
        cursor.current_chunk = Some(chunk);
        Ok(())
    }

    /// Merges the offered range into the cursor, flushing the previous
    /// range first when it cannot be extended.
    fn flush_unmergable(
        &mut self,
        src_id: usize,
        dest_id: Option<usize>,
        len: u64,
    ) -> Result<()> {
        let src_addr = self.cursors[src_id].block_offset + self.cursors[src_id].offset;
        let dest_addr = dest_id.map(|d| self.cursors[d].block_offset + self.cursors[d].offset);

        let merge = self.mergeable(src_id, src_addr, len)
            && dest_id
                .map(|d| self.mergeable(d, dest_addr.unwrap_or(0), len))
                .unwrap_or(true);

        if !merge {
            self.write_flush(src_id, dest_id)?;
            self.write_start(src_id, len, src_addr)?;
            if let Some(d) = dest_id {
                self.write_start(d, len, dest_addr.unwrap_or(0))?;
            }
        }

        self.cursors[src_id].current_length += len;
        if let Some(d) = dest_id {
            self.cursors[d].current_length += len;
        }
        Ok(())
    }

    fn install_boundaries(&self, cursor: &mut WriteCursor) -> Result<u32> {
        let block_idx = cursor
            .current_block
            .ok_or(RdmaError::Protocol("flush without a staged range"))?;
        let block = self.registry.get(block_idx);

        let len = if block.is_ram_block {
            cursor.current_length
        } else {
            block.length
        };
        cursor.chunks = len / CHUNK_SIZE;
        if cursor.chunks > 0 && len % CHUNK_SIZE == 0 {
            cursor.chunks -= 1;
        }

        cursor.addr = block.host_addr + (cursor.current_addr - block.offset);
        cursor.chunk_idx = block.chunk_index(cursor.addr);
        cursor.chunk_start = block.chunk_start(cursor.chunk_idx);
        cursor.chunk_end = block.chunk_end(cursor.chunk_idx + cursor.chunks);
        Ok(block_idx)
    }

    /// Pins a chunk range (or reuses the whole-block pin) on `link` and
    /// returns the registration keys.
    pub(crate) fn register_chunk_range(
        &mut self,
        block_idx: u32,
        chunk_idx: u64,
        extra_chunks: u64,
        link: Link,
        remote_access: bool,
    ) -> Result<crate::registry::MrInfo> {
        if let Some(whole) = self.registry.get(block_idx).pins[link as usize].whole {
            return Ok(whole);
        }
        if let Some(mr) =
            self.registry.get(block_idx).pins[link as usize].chunks[chunk_idx as usize]
        {
            return Ok(mr);
        }

        let (start, end) = {
            let block = self.registry.get(block_idx);
            (
                block.chunk_start(chunk_idx),
                block.chunk_end(chunk_idx + extra_chunks),
            )
        };
        debug!("registering {} bytes at {:#x}", end - start, start);
        let mr = self
            .backend
            .register(link, start, end - start, remote_access)
            .map_err(|_| RdmaError::RegisterFailure)?;
        self.total_registrations += 1;
        self.registry.get_mut(block_idx).pins[link as usize].chunks[chunk_idx as usize] = Some(mr);
        Ok(mr)
    }

    /// Posts the staged range of `src_id` (and, for local copies,
    /// `dest_id`) as one RDMA write, registering on demand.
    pub(crate) fn write_flush(&mut self, src_id: usize, dest_id: Option<usize>) -> Result<()> {
        if self.cursors[src_id].current_length == 0 {
            return Ok(());
        }

        let copy = dest_id.is_some();
        let link = if copy { self.local_link() } else { Link::Remote };

        loop {
            let mut src = self.cursors[src_id];
            let src_block_idx = self.install_boundaries(&mut src)?;
            let dest = match dest_id {
                Some(d) => {
                    let mut dest = self.cursors[d];
                    self.install_boundaries(&mut dest)?;
                    Some(dest)
                }
                None => None,
            };

            if !self.pin_all && self.speculative_unregister {
                self.unregister_waiting()?;
            }

            // At most one write per chunk may be in flight.
            while self.registry.get(src_block_idx).transit.test(src.chunk_idx) {
                debug!(
                    "not clobbering: block {} chunk {} has a write in flight",
                    src_block_idx, src.chunk_idx
                );
                self.block_for_wrid(link, WorkRequestId::write_remote(0, 0).type_bits())?;
            }

            let lkey;
            let rkey;
            if let Some(dest) = &dest {
                lkey = self
                    .register_chunk_range(src_block_idx, src.chunk_idx, src.chunks, link, false)?
                    .lkey;
                let dest_block_idx = dest
                    .current_block
                    .ok_or(RdmaError::Protocol("local copy without a destination range"))?;
                rkey = self
                    .register_chunk_range(
                        dest_block_idx,
                        dest.chunk_idx,
                        dest.chunks,
                        other_local(link),
                        true,
                    )?
                    .rkey;
            } else {
                let is_ram_block = self.registry.get(src_block_idx).is_ram_block;
                if (!self.pin_all || !is_ram_block)
                    && self.registry.get(src_block_idx).remote_keys[src.chunk_idx as usize] == 0
                {
                    // The chunk was never registered remotely. An all-zero
                    // chunk of genuine RAM is not worth a registration:
                    // the peer memsets it instead.
                    if is_ram_block && range_is_zero(src.addr, src.current_length) {
                        let comp = CompressCommand {
                            value: 0,
                            block_index: src_block_idx,
                            offset: src.current_addr,
                            length: src.current_length,
                        };
                        let mut payload = [0u8; CompressCommand::WIRE_SIZE];
                        comp.to_wire(&mut payload);
                        let head = ControlHeader::new(
                            ControlType::Compress,
                            CompressCommand::WIRE_SIZE as u32,
                            1,
                        );
                        self.exchange_send(head, Some(&payload), None, None)?;

                        let cursor = &mut self.cursors[src_id];
                        cursor.current_length = 0;
                        cursor.current_addr = 0;
                        return Ok(());
                    }

                    // Pin locally, then ask the peer for its key.
                    lkey = self
                        .register_chunk_range(src_block_idx, src.chunk_idx, src.chunks, link, false)?
                        .lkey;

                    let reg = RegisterCommand {
                        key: if is_ram_block {
                            src.current_addr
                        } else {
                            src.chunk_idx
                        },
                        block_index: src_block_idx,
                        chunks: src.chunks,
                    };
                    let mut payload = [0u8; RegisterCommand::WIRE_SIZE];
                    reg.to_wire(&mut payload);
                    let head = ControlHeader::new(
                        ControlType::RegisterRequest,
                        RegisterCommand::WIRE_SIZE as u32,
                        1,
                    );
                    self.exchange_send(
                        head,
                        Some(&payload),
                        Some(ControlType::RegisterResult),
                        None,
                    )?;
                    let result = RegisterResult::from_wire(self.ctrl_payload(CTRL_DATA));

                    let block = self.registry.get_mut(src_block_idx);
                    block.remote_keys[src.chunk_idx as usize] = result.rkey;
                    block.remote_host_addr = result.host_addr;
                    rkey = result.rkey;
                } else if !self.pin_all || !is_ram_block {
                    // Registered on a previous write.
                    lkey = self
                        .register_chunk_range(src_block_idx, src.chunk_idx, src.chunks, link, false)?
                        .lkey;
                    rkey = self.registry.get(src_block_idx).remote_keys[src.chunk_idx as usize];
                } else {
                    // Pin-all: whole-block keys cached at connect.
                    lkey = self
                        .register_chunk_range(src_block_idx, src.chunk_idx, src.chunks, link, false)?
                        .lkey;
                    rkey = self.registry.get(src_block_idx).remote_rkey;
                }
            }

            let remote_addr = match &dest {
                Some(dest) => dest.addr,
                None => {
                    let block = self.registry.get(src_block_idx);
                    block.remote_host_addr + (src.current_addr - block.offset)
                }
            };

            let request = WriteRequest {
                wr_id: WorkRequestId::write_remote(src_block_idx, src.chunk_idx),
                local_addr: src.addr,
                len: src.current_length as u32,
                lkey,
                remote_addr,
                rkey,
                signaled: true,
            };

            match self.backend.post_write(link, request) {
                Err(RdmaError::SendQueueFull) => {
                    debug!("send queue is full, waiting for a completion");
                    self.block_for_wrid(link, WorkRequestId::write_remote(0, 0).type_bits())?;
                    continue;
                }
                Err(err) => return Err(err),
                Ok(()) => {}
            }

            self.registry.get_mut(src_block_idx).transit.set(src.chunk_idx);
            self.nb_sent += 1;
            self.link_sent[link as usize] += 1;
            self.total_writes += 1;

            let cursor = &mut self.cursors[src_id];
            cursor.current_length = 0;
            cursor.current_addr = 0;
            if let Some(d) = dest_id {
                let cursor = &mut self.cursors[d];
                cursor.current_length = 0;
                cursor.current_addr = 0;
            }
            return Ok(());
        }
    }

    /// Flushes the remote cursor; used before control-channel traffic so
    /// RAM writes never reorder behind control messages.
    pub(crate) fn flush_remote(&mut self) -> Result<()> {
        self.write_flush(CURSOR_REMOTE, None)
    }

    /// Queues a chunk for speculative unpinning, deduplicated by the
    /// unregister bitmap.
    pub(crate) fn signal_unregister(&mut self, block_idx: u32, chunk: u64, wr_id: WorkRequestId) {
        if self.unreg.is_full() {
            error!("unregister queue is full");
            return;
        }
        let block = self.registry.get_mut(block_idx);
        if block.unregister.test_and_set(chunk) {
            debug!("chunk {} already queued for unpinning", chunk);
            return;
        }
        self.unreg.push(wr_id.retag(block_idx, chunk).0);
    }

    /// Drains the unpin queue. Chunks that acquired a new in-flight write
    /// since being queued are skipped; they will be re-queued by their
    /// next completion.
    pub(crate) fn unregister_waiting(&mut self) -> Result<()> {
        while let Some(raw) = self.unreg.take() {
            let wrid = WorkRequestId(raw);
            let block_idx = wrid.block_index();
            let chunk = wrid.chunk();

            let in_transit = {
                let block = self.registry.get_mut(block_idx);
                block.unregister.clear(chunk);
                block.transit.test(chunk)
            };
            if in_transit {
                debug!("cannot unpin in-flight chunk {}", chunk);
                continue;
            }

            let mr = self.registry.get_mut(block_idx).pins[Link::Remote as usize].chunks
                [chunk as usize]
                .take();
            let mr = match mr {
                Some(mr) => mr,
                None => continue,
            };

            debug!("unpinning chunk {} of block {}", chunk, block_idx);
            self.backend.deregister(Link::Remote, mr.handle)?;
            self.registry.get_mut(block_idx).remote_keys[chunk as usize] = 0;
            self.total_registrations = self.total_registrations.saturating_sub(1);

            let reg = RegisterCommand {
                key: chunk,
                block_index: block_idx,
                chunks: 0,
            };
            let mut payload = [0u8; RegisterCommand::WIRE_SIZE];
            reg.to_wire(&mut payload);
            let head = ControlHeader::new(
                ControlType::UnregisterRequest,
                RegisterCommand::WIRE_SIZE as u32,
                1,
            );
            self.exchange_send(
                head,
                Some(&payload),
                Some(ControlType::UnregisterFinished),
                None,
            )?;
        }
        Ok(())
    }

    /// Flushes the cursor pair and blocks until the hardware delivered
    /// every outstanding write on its link, then drains the unpin queue.
    pub(crate) fn drain_cq(&mut self, src_id: usize, dest_id: Option<usize>) -> Result<()> {
        let link = if dest_id.is_some() {
            self.local_link()
        } else {
            Link::Remote
        };

        self.write_flush(src_id, dest_id)?;

        while self.link_sent[link as usize] > 0 {
            self.block_for_wrid(link, WorkRequestId::write_remote(0, 0).type_bits())?;
        }

        self.unregister_waiting()
    }

    /// Pins every RAM block wholesale: the pin-all discipline. On the
    /// source this runs concurrently with the block-table exchange.
    pub(crate) fn register_whole_ram_blocks(&mut self) -> Result<()> {
        let second_link = if self.source {
            Link::LocalSrc
        } else {
            Link::LocalDest
        };
        for block_idx in 0..self.registry.len() as u32 {
            let (addr, len) = {
                let block = self.registry.get(block_idx);
                (block.host_addr, block.length)
            };
            for link in [Link::Remote, second_link] {
                if self.registry.get(block_idx).pins[link as usize].whole.is_some() {
                    continue;
                }
                let mr = self
                    .backend
                    .register(link, addr, len, true)
                    .map_err(|_| RdmaError::RegisterFailure)?;
                self.total_registrations += 1;
                self.registry.get_mut(block_idx).pins[link as usize].whole = Some(mr);
            }
        }
        Ok(())
    }

    /// Called before a RAM iteration. A flush round synchronizes the
    /// local-copy queue pairs.
    pub fn ram_iteration_start(&mut self, phase: RamPhase) -> Result<()> {
        self.check_error()?;
        if phase == RamPhase::Flush && self.source {
            let result = self.drain_cq(CURSOR_LOCAL_SRC, Some(CURSOR_LOCAL_DEST));
            if let Err(err) = &result {
                self.set_error(err.clone());
            }
            return result;
        }
        Ok(())
    }

    /// Called after a RAM iteration: drain the remote queue, exchange the
    /// RAM block tables on the setup round, and tell the peer that this
    /// iteration's registrations are finished.
    pub fn ram_iteration_finish(&mut self, phase: RamPhase) -> Result<()> {
        self.check_error()?;
        let result = self.ram_iteration_finish_inner(phase);
        if let Err(err) = &result {
            self.set_error(err.clone());
        }
        result
    }

    fn ram_iteration_finish_inner(&mut self, phase: RamPhase) -> Result<()> {
        self.drain_cq(CURSOR_REMOTE, None)?;

        if phase == RamPhase::Setup {
            // Pinning the whole guest takes a while on both sides;
            // interleave ours with the peer's reply.
            let hook: Option<fn(&mut Self) -> Result<()>> = if self.pin_all {
                Some(Self::register_whole_ram_blocks)
            } else {
                None
            };
            let head = ControlHeader::new(ControlType::RamBlocksRequest, 0, 1);
            let resp = self
                .exchange_send(head, None, Some(ControlType::RamBlocksResult), hook)?
                .ok_or(RdmaError::Protocol("missing block table response"))?;

            if resp.len as usize % RemoteBlock::WIRE_SIZE != 0 {
                return Err(RdmaError::MalformedLength(resp.len));
            }
            let nb_remote_blocks = resp.len as usize / RemoteBlock::WIRE_SIZE;
            if nb_remote_blocks != self.registry.len() {
                error!(
                    "peer reports {} RAM blocks, local guest has {}",
                    nb_remote_blocks,
                    self.registry.len()
                );
                return Err(RdmaError::BlockMismatch);
            }

            let payload = self.ctrl_payload(CTRL_DATA).to_vec();
            for raw in payload.chunks_exact(RemoteBlock::WIRE_SIZE) {
                let remote = RemoteBlock::from_wire(raw);
                let mut matched = false;
                for block in self.registry.iter_mut() {
                    if block.offset != remote.offset {
                        continue;
                    }
                    if block.length != remote.length {
                        return Err(RdmaError::BlockMismatch);
                    }
                    block.remote_host_addr = remote.host_addr;
                    block.remote_rkey = remote.rkey;
                    matched = true;
                    break;
                }
                if !matched {
                    return Err(RdmaError::BlockMismatch);
                }
            }
        }

        let head = ControlHeader::new(ControlType::RegisterFinished, 0, 1);
        self.exchange_send(head, None, None, None)?;
        Ok(())
    }

    /// Destination-side request handler: serves pinning, unpinning and
    /// zero-fill requests until the peer finishes its iteration.
    pub fn serve_ram_load(&mut self) -> Result<()> {
        self.check_error()?;
        let result = self.serve_ram_load_inner();
        if let Err(err) = &result {
            self.set_error(err.clone());
        }
        result
    }

    fn serve_ram_load_inner(&mut self) -> Result<()> {
        loop {
            let head = self.exchange_recv(None)?;

            if head.repeat > CONTROL_MAX_COMMANDS {
                return Err(RdmaError::TooManyRecords(head.repeat));
            }

            match head.kind {
                ControlType::Compress => {
                    if head.len as usize != CompressCommand::WIRE_SIZE {
                        return Err(RdmaError::MalformedLength(head.len));
                    }
                    let comp = CompressCommand::from_wire(self.ctrl_payload(CTRL_READY));
                    if comp.block_index as usize >= self.registry.len() {
                        return Err(RdmaError::Protocol("compress for an unknown block"));
                    }
                    let block = self.registry.get(comp.block_index);
                    if comp.offset < block.offset
                        || comp.offset + comp.length > block.offset + block.length
                    {
                        return Err(RdmaError::RangeOutOfBounds(
                            block.offset,
                            comp.offset,
                            comp.length,
                        ));
                    }
                    let host = block.host_addr + (comp.offset - block.offset);
                    debug!(
                        "zapping {} repeated bytes at block {} offset {:#x}",
                        comp.length, comp.block_index, comp.offset
                    );
                    // SAFETY: the range was bounds-checked against a
                    // hypervisor-enumerated block just above.
                    unsafe {
                        std::ptr::write_bytes(
                            host as *mut u8,
                            comp.value as u8,
                            comp.length as usize,
                        );
                    }
                }
                ControlType::RegisterFinished => return Ok(()),
                ControlType::RamBlocksRequest => {
                    if self.pin_all {
                        self.register_whole_ram_blocks()?;
                    }
                    let mut payload =
                        Vec::with_capacity(self.registry.len() * RemoteBlock::WIRE_SIZE);
                    for block in self.registry.iter() {
                        let remote = RemoteBlock {
                            host_addr: block.host_addr,
                            offset: block.offset,
                            length: block.length,
                            rkey: block.pins[Link::Remote as usize]
                                .whole
                                .map(|mr| mr.rkey)
                                .unwrap_or(0),
                        };
                        let mut raw = [0u8; RemoteBlock::WIRE_SIZE];
                        remote.to_wire(&mut raw);
                        payload.extend_from_slice(&raw);
                    }
                    let head =
                        ControlHeader::new(ControlType::RamBlocksResult, payload.len() as u32, 1);
                    self.post_send_control(head, Some(&payload))?;
                }
                ControlType::RegisterRequest => {
                    let expected = head.repeat as usize * RegisterCommand::WIRE_SIZE;
                    if head.len as usize != expected {
                        return Err(RdmaError::MalformedLength(head.len));
                    }
                    let commands: Vec<RegisterCommand> = self
                        .ctrl_payload(CTRL_READY)
                        .chunks_exact(RegisterCommand::WIRE_SIZE)
                        .map(RegisterCommand::from_wire)
                        .collect();

                    let mut payload =
                        Vec::with_capacity(commands.len() * RegisterResult::WIRE_SIZE);
                    for reg in commands {
                        if reg.block_index as usize >= self.registry.len() {
                            return Err(RdmaError::Protocol("registration for an unknown block"));
                        }
                        let chunk_idx = {
                            let block = self.registry.get(reg.block_index);
                            if block.is_ram_block {
                                if reg.key < block.offset
                                    || reg.key >= block.offset + block.length
                                {
                                    return Err(RdmaError::RangeOutOfBounds(
                                        block.offset,
                                        reg.key,
                                        0,
                                    ));
                                }
                                block.chunk_index(block.host_addr + (reg.key - block.offset))
                            } else {
                                if reg.key >= block.nb_chunks {
                                    return Err(RdmaError::Protocol("chunk index out of range"));
                                }
                                reg.key
                            }
                        };
                        let mr = self.register_chunk_range(
                            reg.block_index,
                            chunk_idx,
                            reg.chunks,
                            Link::Remote,
                            true,
                        )?;
                        let result = RegisterResult {
                            rkey: mr.rkey,
                            host_addr: self.registry.get(reg.block_index).host_addr,
                        };
                        let mut raw = [0u8; RegisterResult::WIRE_SIZE];
                        result.to_wire(&mut raw);
                        payload.extend_from_slice(&raw);
                    }
                    let resp = ControlHeader::new(
                        ControlType::RegisterResult,
                        payload.len() as u32,
                        head.repeat,
                    );
                    self.post_send_control(resp, Some(&payload))?;
                }
                ControlType::UnregisterRequest => {
                    let expected = head.repeat as usize * RegisterCommand::WIRE_SIZE;
                    if head.len as usize != expected {
                        return Err(RdmaError::MalformedLength(head.len));
                    }
                    let commands: Vec<RegisterCommand> = self
                        .ctrl_payload(CTRL_READY)
                        .chunks_exact(RegisterCommand::WIRE_SIZE)
                        .map(RegisterCommand::from_wire)
                        .collect();

                    for reg in commands {
                        if reg.block_index as usize >= self.registry.len() {
                            return Err(RdmaError::Protocol(
                                "unregistration for an unknown block",
                            ));
                        }
                        let block = self.registry.get_mut(reg.block_index);
                        if reg.key >= block.nb_chunks {
                            return Err(RdmaError::Protocol("chunk index out of range"));
                        }
                        let mr = block.pins[Link::Remote as usize].chunks[reg.key as usize].take();
                        if let Some(mr) = mr {
                            self.backend.deregister(Link::Remote, mr.handle)?;
                            self.total_registrations =
                                self.total_registrations.saturating_sub(1);
                            debug!("unregistered chunk {} on request", reg.key);
                        } else {
                            warn!("peer asked to unpin chunk {} which is not pinned", reg.key);
                        }
                    }
                    let resp = ControlHeader::new(
                        ControlType::UnregisterFinished,
                        0,
                        head.repeat,
                    );
                    self.post_send_control(resp, None)?;
                }
                ControlType::RegisterResult => {
                    return Err(RdmaError::Protocol("RESULT message at the destination"));
                }
                other => {
                    return Err(RdmaError::UnexpectedMessage("a request", other.name()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use checkpoint::hypervisor::RamBlockInfo;

    use super::*;
    use crate::testing::{messages, MockBackend};
    use crate::{TransportOptions, SEND_MAX};

    const MIB: u64 = 1024 * 1024;

    fn guest_memory(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    fn transport(
        source: bool,
        pin_all: bool,
        speculative: bool,
        memory: &[u8],
    ) -> RdmaTransport<MockBackend> {
        let options = TransportOptions {
            pin_all,
            keepalive: true,
            speculative_unregister: speculative,
        };
        let mut transport = RdmaTransport::new(MockBackend::new(), source, options).unwrap();
        transport
            .seed_ram_blocks(&[RamBlockInfo {
                host_addr: memory.as_ptr() as u64,
                offset: 0,
                len: memory.len() as u64,
            }])
            .unwrap();
        transport
    }

    fn prime_pin_all(transport: &mut RdmaTransport<MockBackend>) {
        transport.register_whole_ram_blocks().unwrap();
        let block = transport.registry.get_mut(0);
        block.remote_host_addr = 0xD000_0000;
        block.remote_rkey = 0x99;
    }

    #[test]
    fn test_contiguous_pages_merge_into_one_write() {
        let memory = guest_memory(4 * MIB as usize, 1);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);

        transport.save_page(0, 0, 4096).unwrap();
        transport.save_page(0, 4096, 4096).unwrap();
        assert!(transport.backend.writes.is_empty());

        transport.flush_remote().unwrap();
        // Pin-all steady state: no registration traffic at all.
        assert!(transport.backend.sent.is_empty());
        assert_eq!(transport.backend.writes.len(), 1);
        let (link, request) = &transport.backend.writes[0];
        assert_eq!(*link, Link::Remote);
        assert_eq!(request.len, 8192);
        assert_eq!(request.rkey, 0x99);
        assert_eq!(request.remote_addr, 0xD000_0000);
        assert_eq!(request.local_addr, memory.as_ptr() as u64);
        assert_eq!(request.wr_id.block_index(), 0);
        assert_eq!(request.wr_id.chunk(), 0);

        // The chunk is marked in transit until its completion drains.
        assert!(transport.registry.get(0).transit.test(0));
        assert_eq!(transport.registry.get(0).transit.count_set(), 1);
        transport.poll_until_empty(Link::Remote).unwrap();
        assert!(!transport.registry.get(0).transit.test(0));
        assert_eq!(transport.nb_sent, 0);
    }

    #[test]
    fn test_chunk_boundary_breaks_merging() {
        let memory = guest_memory(4 * MIB as usize, 2);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);

        // Contiguous pages either side of the first 1 MiB boundary.
        transport.save_page(0, CHUNK_SIZE - 4096, 4096).unwrap();
        transport.save_page(0, CHUNK_SIZE, 4096).unwrap();
        // The first range was flushed when the second could not merge.
        assert_eq!(transport.backend.writes.len(), 1);

        transport.flush_remote().unwrap();
        assert_eq!(transport.backend.writes.len(), 2);
        assert_eq!(transport.backend.writes[0].1.wr_id.chunk(), 0);
        assert_eq!(transport.backend.writes[1].1.wr_id.chunk(), 1);
    }

    #[test]
    fn test_single_range_spans_chunks_in_one_write() {
        let memory = guest_memory(4 * MIB as usize, 3);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);

        // One 2 MiB range reaches the merge cap and flushes immediately,
        // spanning two chunks in a single write.
        transport.save_page(0, 0, 2 * CHUNK_SIZE).unwrap();
        assert_eq!(transport.backend.writes.len(), 1);
        assert_eq!(transport.backend.writes[0].1.len, 2 * CHUNK_SIZE as u32);
    }

    #[test]
    fn test_page_stream_flushes_at_chunk_granularity() {
        let memory = guest_memory(6 * MIB as usize, 4);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);

        // 1025 contiguous 4 KiB pages: merging is chunk-bounded, so the
        // stream flushes once per chunk crossed, never as one giant write.
        for page in 0..1025u64 {
            transport.save_page(0, page * 4096, 4096).unwrap();
        }
        assert_eq!(transport.backend.writes.len(), 4);
        assert!(transport
            .backend
            .writes
            .iter()
            .all(|(_, w)| w.len == CHUNK_SIZE as u32));

        // The trailing page is still staged.
        assert_eq!(transport.cursors[CURSOR_REMOTE].current_length, 4096);
        transport.flush_remote().unwrap();
        assert_eq!(transport.backend.writes.len(), 5);
        assert_eq!(transport.backend.writes[4].1.len, 4096);
    }

    #[test]
    fn test_zero_chunk_elides_rdma_with_compress() {
        let memory = guest_memory(2 * MIB as usize, 0);
        let mut transport = transport(true, false, false, &memory);

        transport.save_page(0, 0, 4096).unwrap();
        transport.flush_remote().unwrap();

        // No RDMA write, no registration; one COMPRESS control message.
        assert!(transport.backend.writes.is_empty());
        assert_eq!(transport.backend.sent.len(), 1);
        let (head, payload) = &transport.backend.sent[0];
        assert_eq!(head.kind, ControlType::Compress);
        let comp = CompressCommand::from_wire(payload);
        assert_eq!(comp.value, 0);
        assert_eq!(comp.block_index, 0);
        assert_eq!(comp.offset, 0);
        assert_eq!(comp.length, 4096);
        assert_eq!(transport.registry.get(0).remote_keys[0], 0);
        assert!(transport.registry.get(0).pins[Link::Remote as usize].chunks[0].is_none());
    }

    #[test]
    fn test_dynamic_registration_uses_peer_key() {
        let memory = guest_memory(2 * MIB as usize, 5);
        let mut transport = transport(true, false, false, &memory);

        // The peer replies to the registration request with its key.
        transport.backend.script_reply(vec![(
            CTRL_DATA,
            messages::register_result(0x77, 0xBEEF_0000),
        )]);

        transport.save_page(0, 0, 4096).unwrap();
        transport.flush_remote().unwrap();

        assert_eq!(transport.backend.sent.len(), 1);
        assert_eq!(transport.backend.sent[0].0.kind, ControlType::RegisterRequest);
        let reg = RegisterCommand::from_wire(&transport.backend.sent[0].1);
        assert_eq!(reg.key, 0);
        assert_eq!(reg.block_index, 0);

        assert_eq!(transport.backend.writes.len(), 1);
        let request = transport.backend.writes[0].1;
        assert_eq!(request.rkey, 0x77);
        assert_eq!(request.remote_addr, 0xBEEF_0000);
        assert_eq!(transport.registry.get(0).remote_keys[0], 0x77);
        assert_eq!(transport.registry.get(0).remote_host_addr, 0xBEEF_0000);
        // The local chunk pin exists.
        assert!(transport.registry.get(0).pins[Link::Remote as usize].chunks[0].is_some());
    }

    #[test]
    fn test_register_request_count_matches_chunks_touched() {
        let memory = guest_memory(4 * MIB as usize, 6);
        let mut transport = transport(true, false, false, &memory);

        // Touch three distinct chunks; each first touch asks the peer
        // for one registration.
        for chunk in 0..3u64 {
            transport.backend.script_reply(vec![
                (CTRL_DATA, messages::register_result(0x100 + chunk as u32, 0xBEEF_0000)),
                (CTRL_READY, messages::ready()),
            ]);
        }
        for chunk in 0..3u64 {
            transport.save_page(0, chunk * CHUNK_SIZE, 4096).unwrap();
            transport.flush_remote().unwrap();
        }

        let register_requests = transport
            .backend
            .sent
            .iter()
            .filter(|(head, _)| head.kind == ControlType::RegisterRequest)
            .count();
        assert_eq!(register_requests, 3);
        assert_eq!(transport.backend.writes.len(), 3);

        // Re-dirtying an already-registered chunk asks for nothing.
        transport.save_page(0, 4096, 4096).unwrap();
        transport.flush_remote().unwrap();
        let register_requests_after = transport
            .backend
            .sent
            .iter()
            .filter(|(head, _)| head.kind == ControlType::RegisterRequest)
            .count();
        assert_eq!(register_requests_after, 3);
        assert_eq!(transport.backend.writes.len(), 4);
    }

    #[test]
    fn test_transit_bitmap_serializes_writes_per_chunk() {
        let memory = guest_memory(2 * MIB as usize, 7);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);
        transport.backend.manual_write_completions = true;

        transport.save_page(0, 0, 4096).unwrap();
        transport.flush_remote().unwrap();
        assert!(transport.registry.get(0).transit.test(0));

        // A second non-contiguous write to the same chunk must wait for
        // the first completion.
        transport.save_page(0, 8192, 4096).unwrap();
        transport.flush_remote().unwrap();
        assert_eq!(transport.backend.writes.len(), 2);
        // The first completion was consumed while waiting.
        assert_eq!(transport.nb_sent, 1);
        assert!(transport.registry.get(0).transit.test(0));
    }

    #[test]
    fn test_send_queue_full_waits_and_retries() {
        let memory = guest_memory(4 * MIB as usize, 8);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);
        transport.backend.manual_write_completions = true;

        transport.save_page(0, 0, 4096).unwrap();
        transport.flush_remote().unwrap();
        assert_eq!(transport.backend.writes.len(), 1);

        transport.backend.fail_post_writes = 1;
        transport.save_page(0, CHUNK_SIZE, 4096).unwrap();
        transport.flush_remote().unwrap();

        // The retry landed after consuming the first write's completion.
        assert_eq!(transport.backend.writes.len(), 2);
        assert_eq!(transport.nb_sent, 1);
    }

    #[test]
    fn test_completion_clears_transit_and_counts() {
        let memory = guest_memory(2 * MIB as usize, 9);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);

        transport.save_page(0, 0, 4096).unwrap();
        transport.flush_remote().unwrap();
        assert_eq!(transport.nb_sent, 1);
        assert_eq!(transport.link_sent[Link::Remote as usize], 1);

        transport.drain_cq(CURSOR_REMOTE, None).unwrap();
        assert_eq!(transport.nb_sent, 0);
        assert_eq!(transport.link_sent[Link::Remote as usize], 0);
        assert_eq!(transport.registry.get(0).transit.count_set(), 0);
    }

    #[test]
    fn test_failed_completion_is_fatal_and_sticky() {
        let memory = guest_memory(2 * MIB as usize, 10);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);

        transport.save_page(0, 0, 4096).unwrap();
        transport.flush_remote().unwrap();
        transport.backend.fail_next_completion(13);

        let err = transport.drain_cq(CURSOR_REMOTE, None).unwrap_err();
        assert_eq!(err, RdmaError::WorkCompletion(13));
        transport.set_error(err);

        // Every later entry point short-circuits.
        assert_eq!(
            transport.save_page(0, 4096, 4096).unwrap_err(),
            RdmaError::WorkCompletion(13)
        );
    }

    #[test]
    fn test_speculative_unregister_roundtrip() {
        let memory = guest_memory(2 * MIB as usize, 11);
        let mut transport = transport(true, false, true, &memory);

        // Registration reply, then the READY + UNREGISTER_FINISHED pair
        // for the unpin exchange that follows the completion.
        transport.backend.script_reply(vec![
            (CTRL_DATA, messages::register_result(0x42, 0xBEEF_0000)),
            (CTRL_READY, messages::ready()),
        ]);
        transport.backend.script_reply(vec![
            (CTRL_DATA, messages::unregister_finished()),
            (CTRL_READY, messages::ready()),
        ]);

        transport.save_page(0, 0, 4096).unwrap();
        transport.drain_cq(CURSOR_REMOTE, None).unwrap();

        // The completion queued the chunk for unpinning and the drain
        // performed it: pin gone, key cleared, request sent.
        assert!(transport.registry.get(0).pins[Link::Remote as usize].chunks[0].is_none());
        assert_eq!(transport.registry.get(0).remote_keys[0], 0);
        assert_eq!(transport.registry.get(0).unregister.count_set(), 0);
        assert_eq!(transport.backend.deregistered.len(), 1);
        let kinds: Vec<ControlType> =
            transport.backend.sent.iter().map(|(h, _)| h.kind).collect();
        assert_eq!(
            kinds,
            vec![ControlType::RegisterRequest, ControlType::UnregisterRequest]
        );
    }

    #[test]
    fn test_unregister_queue_ring_behavior() {
        let mut queue = UnregisterQueue::new(4);
        assert!(queue.take().is_none());
        queue.push(WorkRequestId::write_remote(0, 1).0);
        queue.push(WorkRequestId::write_remote(0, 2).0);
        assert_eq!(WorkRequestId(queue.take().unwrap()).chunk(), 1);
        queue.push(WorkRequestId::write_remote(0, 3).0);
        queue.push(WorkRequestId::write_remote(0, 4).0);
        queue.push(WorkRequestId::write_remote(0, 5).0);
        assert!(queue.is_full());
        for expected in 2..=5u64 {
            assert_eq!(WorkRequestId(queue.take().unwrap()).chunk(), expected);
        }
        assert!(queue.take().is_none());
        assert_eq!(SEND_MAX, 512);
    }

    #[test]
    fn test_block_table_exchange_on_setup() {
        let memory = guest_memory(2 * MIB as usize, 12);
        let mut transport = transport(true, true, false, &memory);

        let table = messages::remote_blocks(&[RemoteBlock {
            host_addr: 0xCAFE_0000,
            offset: 0,
            length: memory.len() as u64,
            rkey: 0x55,
        }]);
        transport
            .backend
            .script_reply(vec![(CTRL_DATA, table), (CTRL_READY, messages::ready())]);

        transport.ram_iteration_finish(RamPhase::Setup).unwrap();

        let block = transport.registry.get(0);
        assert_eq!(block.remote_host_addr, 0xCAFE_0000);
        assert_eq!(block.remote_rkey, 0x55);
        // Pin-all registered the whole block for the remote and the
        // local-copy source links.
        assert!(block.pins[Link::Remote as usize].whole.is_some());
        assert!(block.pins[Link::LocalSrc as usize].whole.is_some());

        let kinds: Vec<ControlType> =
            transport.backend.sent.iter().map(|(h, _)| h.kind).collect();
        assert_eq!(
            kinds,
            vec![ControlType::RamBlocksRequest, ControlType::RegisterFinished]
        );
    }

    #[test]
    fn test_block_table_mismatch_is_fatal() {
        let memory = guest_memory(2 * MIB as usize, 13);
        let mut transport = transport(true, false, false, &memory);

        let table = messages::remote_blocks(&[
            RemoteBlock {
                host_addr: 0xCAFE_0000,
                offset: 0,
                length: memory.len() as u64,
                rkey: 0,
            },
            RemoteBlock {
                host_addr: 0xCAFE_8000,
                offset: 0x8000_0000,
                length: 4096,
                rkey: 0,
            },
        ]);
        transport
            .backend
            .script_reply(vec![(CTRL_DATA, table), (CTRL_READY, messages::ready())]);

        assert_eq!(
            transport.ram_iteration_finish(RamPhase::Setup).unwrap_err(),
            RdmaError::BlockMismatch
        );
        assert!(transport.error_state().is_some());
    }

    #[test]
    fn test_destination_serves_compress_and_finishes() {
        let memory = guest_memory(2 * MIB as usize, 14);
        let mut transport = transport(false, false, false, &memory);
        transport.establish().unwrap();

        let comp = CompressCommand {
            value: 0,
            block_index: 0,
            offset: 4096,
            length: 8192,
        };
        transport
            .backend
            .script_reply(vec![(CTRL_READY, messages::compress(&comp))]);
        transport
            .backend
            .script_reply(vec![(CTRL_READY, messages::register_finished())]);

        transport.serve_ram_load().unwrap();

        assert!(memory[4096..4096 + 8192].iter().all(|&b| b == 0));
        assert_eq!(memory[0], 14);
        assert_eq!(memory[4096 + 8192], 14);
    }

    #[test]
    fn test_destination_serves_registration_requests() {
        let memory = guest_memory(4 * MIB as usize, 15);
        let mut transport = transport(false, false, false, &memory);
        transport.establish().unwrap();

        let reg = RegisterCommand {
            key: CHUNK_SIZE,
            block_index: 0,
            chunks: 0,
        };
        transport
            .backend
            .script_reply(vec![(CTRL_READY, messages::register_request(&reg))]);
        transport
            .backend
            .script_reply(vec![(CTRL_READY, messages::register_finished())]);

        transport.serve_ram_load().unwrap();

        // Chunk 1 got pinned with remote access and its key was sent back.
        assert!(transport.registry.get(0).pins[Link::Remote as usize].chunks[1].is_some());
        let result_msg = transport
            .backend
            .sent
            .iter()
            .find(|(h, _)| h.kind == ControlType::RegisterResult)
            .cloned()
            .unwrap();
        assert_eq!(result_msg.0.repeat, 1);
        let result = RegisterResult::from_wire(&result_msg.1);
        assert_eq!(result.host_addr, memory.as_ptr() as u64);
        assert_ne!(result.rkey, 0);
    }

    #[test]
    fn test_destination_rejects_oversized_batches() {
        let memory = guest_memory(2 * MIB as usize, 16);
        let mut transport = transport(false, false, false, &memory);
        transport.establish().unwrap();

        let mut raw = messages::register_finished();
        // Rewrite the repeat field beyond the cap.
        utils::byte_order::write_be_u32(&mut raw[8..], CONTROL_MAX_COMMANDS + 1);
        transport.backend.script_reply(vec![(CTRL_READY, raw)]);

        assert_eq!(
            transport.serve_ram_load().unwrap_err(),
            RdmaError::TooManyRecords(CONTROL_MAX_COMMANDS + 1)
        );
    }

    #[test]
    fn test_local_copy_posts_on_local_link() {
        let memory = guest_memory(4 * MIB as usize, 17);
        let mut transport = transport(true, true, false, &memory);
        prime_pin_all(&mut transport);
        // Local copies need pins on both local links.
        let block = transport.registry.get(0);
        let (addr, len) = (block.host_addr, block.length);
        let mr = transport
            .backend
            .register(Link::LocalDest, addr, len, true)
            .unwrap();
        transport.registry.get_mut(0).pins[Link::LocalDest as usize].whole = Some(mr);

        transport
            .copy_page(0, 2 * CHUNK_SIZE, 0, 0, 4096)
            .unwrap();
        transport
            .drain_cq(CURSOR_LOCAL_SRC, Some(CURSOR_LOCAL_DEST))
            .unwrap();

        assert_eq!(transport.backend.writes.len(), 1);
        let (link, request) = &transport.backend.writes[0];
        assert_eq!(*link, Link::LocalSrc);
        assert_eq!(request.len, 4096);
        // The destination address is the local host address of the
        // destination range.
        assert_eq!(
            request.remote_addr,
            memory.as_ptr() as u64 + 2 * CHUNK_SIZE
        );
    }
}
