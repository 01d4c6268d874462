// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The byte-stream interface between the hypervisor's state serializer and
//! a checkpoint transport.
//!
//! The hypervisor saves and loads guest state through plain `Read`/`Write`
//! byte streams, extended with optional hooks that let a transport take
//! over bulk RAM transfer (RDMA writes instead of inline bytes) and
//! synchronize at iteration boundaries. [`CheckpointStream`] is the default
//! adapter over the in-memory slab ring; the RDMA transport provides its
//! own implementation of the same traits.

use std::io::{Read, Write};
use std::io;

use crate::slab::SlabRing;

/// Phase markers passed to the RAM iteration hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamPhase {
    /// First iteration: peers exchange their RAM block tables.
    Setup,
    /// An ordinary dirty-page iteration.
    Round,
    /// A local-copy flush round.
    Flush,
}

/// What a sink did with a page handed to [`StateSink::save_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageControl {
    /// The sink did not consume the page; the caller must serialize the
    /// page bytes into the stream itself.
    Inline,
    /// The sink queued the page for asynchronous transfer.
    Delayed,
}

/// Destination of serialized guest state on the primary, with optional
/// page-level and iteration-level hooks.
pub trait StateSink: Write {
    /// Offers a guest RAM page range for transport-accelerated transfer.
    fn save_page(&mut self, _block_offset: u64, _offset: u64, _len: u64) -> io::Result<PageControl> {
        Ok(PageControl::Inline)
    }

    /// Offers a local RAM-to-RAM copy for transport acceleration.
    fn copy_page(
        &mut self,
        _dst_block_offset: u64,
        _dst_offset: u64,
        _src_block_offset: u64,
        _src_offset: u64,
        _len: u64,
    ) -> io::Result<PageControl> {
        Ok(PageControl::Inline)
    }

    /// Called before a RAM iteration begins.
    fn ram_iteration_start(&mut self, _phase: RamPhase) -> io::Result<()> {
        Ok(())
    }

    /// Called after a RAM iteration completes.
    fn ram_iteration_finish(&mut self, _phase: RamPhase) -> io::Result<()> {
        Ok(())
    }

    /// Announces a memory region that subsequent page operations may refer
    /// to by `block_offset`. Must be mirrored on the peer in the same
    /// order and with the same length.
    fn add_block(&mut self, _host_addr: u64, _block_offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Withdraws a region previously announced with `add_block`.
    fn remove_block(&mut self, _block_offset: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Source of serialized guest state on the secondary.
pub trait StateSource: Read {
    /// Invoked when the state stream reaches a transport hook mark; serves
    /// transport-level requests (registrations, zero-page fills) until the
    /// peer finishes the iteration.
    fn ram_load_hook(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// See [`StateSink::add_block`].
    fn add_block(&mut self, _host_addr: u64, _block_offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// See [`StateSink::remove_block`].
    fn remove_block(&mut self, _block_offset: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts a [`SlabRing`] to the hypervisor's save/load byte-stream
/// interface. All pages are carried inline in the stream.
#[derive(Debug)]
pub struct CheckpointStream<'a> {
    ring: &'a mut SlabRing,
}

impl<'a> CheckpointStream<'a> {
    pub fn new(ring: &'a mut SlabRing) -> CheckpointStream<'a> {
        CheckpointStream { ring }
    }
}

impl Write for CheckpointStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.ring.put(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for CheckpointStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.ring.get(buf))
    }
}

impl StateSink for CheckpointStream<'_> {}
impl StateSource for CheckpointStream<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_roundtrip() {
        let mut ring = SlabRing::new(10);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        {
            let mut stream = CheckpointStream::new(&mut ring);
            stream.write_all(&data).unwrap();
            stream.flush().unwrap();
        }
        ring.rewind();
        let mut out = vec![0u8; data.len()];
        let mut stream = CheckpointStream::new(&mut ring);
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_default_hooks_are_inline_noops() {
        let mut ring = SlabRing::new(10);
        let mut stream = CheckpointStream::new(&mut ring);
        assert_eq!(
            stream.save_page(0, 0, 4096).unwrap(),
            PageControl::Inline
        );
        assert_eq!(
            stream.copy_page(0, 0, 0, 0, 4096).unwrap(),
            PageControl::Inline
        );
        stream.ram_iteration_start(RamPhase::Setup).unwrap();
        stream.ram_iteration_finish(RamPhase::Round).unwrap();
    }
}
