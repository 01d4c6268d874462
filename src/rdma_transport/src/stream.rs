// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The migration byte stream carried over the control channel.
//!
//! RDMA links are not byte streams, so the ordinary `Read`/`Write`
//! traffic of the checkpoint protocol travels as BYTE_STREAM control
//! messages in bounded increments, while guest RAM pages bypass the
//! stream entirely through the page hooks. Writing always flushes any
//! merged-but-unposted RAM writes first, so page data never reorders
//! behind the control stream that describes it.

use std::io;
use std::io::{Read, Write};

use checkpoint::stream::{PageControl, RamPhase, StateSink, StateSource};

use crate::backend::IbBackend;
use crate::engine::CURSOR_REMOTE;
use crate::wire::{ControlHeader, ControlType};
use crate::{RdmaTransport, CTRL_READY, SEND_INCREMENT};

/// `Read + Write` adapter over an established transport, suitable for the
/// checkpoint loop and receiver.
pub struct RdmaStream<B: IbBackend> {
    transport: RdmaTransport<B>,
}

impl<B: IbBackend> RdmaStream<B> {
    pub fn new(transport: RdmaTransport<B>) -> RdmaStream<B> {
        RdmaStream { transport }
    }

    pub fn transport(&self) -> &RdmaTransport<B> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut RdmaTransport<B> {
        &mut self.transport
    }

    pub fn into_inner(self) -> RdmaTransport<B> {
        self.transport
    }
}

impl<B: IbBackend> Write for RdmaStream<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.check_error()?;

        // Push out any RAM writes queued behind the stream position.
        self.transport.flush_remote()?;

        for piece in buf.chunks(SEND_INCREMENT) {
            let head = ControlHeader::new(ControlType::ByteStream, piece.len() as u32, 1);
            self.transport.exchange_send(head, Some(piece), None, None)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: IbBackend> Read for RdmaStream<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.check_error()?;

        // Dish out leftovers of the last message first.
        let taken = self.transport.ctrl_fill(CTRL_READY, buf);
        if taken > 0 {
            return Ok(taken);
        }

        // Out of bytes: block until the peer sends more.
        self.transport
            .exchange_recv(Some(ControlType::ByteStream))?;
        Ok(self.transport.ctrl_fill(CTRL_READY, buf))
    }
}

impl<B: IbBackend> StateSink for RdmaStream<B> {
    fn save_page(&mut self, block_offset: u64, offset: u64, len: u64) -> io::Result<PageControl> {
        self.transport.save_page(block_offset, offset, len)?;
        Ok(PageControl::Delayed)
    }

    fn copy_page(
        &mut self,
        dst_block_offset: u64,
        dst_offset: u64,
        src_block_offset: u64,
        src_offset: u64,
        len: u64,
    ) -> io::Result<PageControl> {
        self.transport.copy_page(
            dst_block_offset,
            dst_offset,
            src_block_offset,
            src_offset,
            len,
        )?;
        Ok(PageControl::Delayed)
    }

    fn ram_iteration_start(&mut self, phase: RamPhase) -> io::Result<()> {
        self.transport.ram_iteration_start(phase)?;
        Ok(())
    }

    fn ram_iteration_finish(&mut self, phase: RamPhase) -> io::Result<()> {
        self.transport.ram_iteration_finish(phase)?;
        Ok(())
    }

    fn add_block(&mut self, host_addr: u64, block_offset: u64, len: u64) -> io::Result<()> {
        self.transport.registry.add(host_addr, block_offset, len)?;
        Ok(())
    }

    fn remove_block(&mut self, block_offset: u64) -> io::Result<()> {
        let block = self.transport.registry.delete(block_offset)?;
        self.transport.release_block_pins(block);
        Ok(())
    }
}

impl<B: IbBackend> StateSource for RdmaStream<B> {
    fn ram_load_hook(&mut self) -> io::Result<()> {
        self.transport.serve_ram_load()?;
        Ok(())
    }

    fn add_block(&mut self, host_addr: u64, block_offset: u64, len: u64) -> io::Result<()> {
        self.transport.registry.add(host_addr, block_offset, len)?;
        Ok(())
    }

    fn remove_block(&mut self, block_offset: u64) -> io::Result<()> {
        let block = self.transport.registry.delete(block_offset)?;
        self.transport.release_block_pins(block);
        Ok(())
    }
}

impl<B: IbBackend> RdmaStream<B> {
    /// Blocks until every outstanding remote write has been delivered by
    /// the hardware. Called before control-level synchronization points
    /// that must observe quiescent hardware, and at teardown.
    pub fn drain(&mut self) -> io::Result<()> {
        self.transport.drain_cq(CURSOR_REMOTE, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use checkpoint::hypervisor::RamBlockInfo;

    use super::*;
    use crate::testing::{messages, MockBackend};
    use crate::TransportOptions;

    fn stream(source: bool) -> RdmaStream<MockBackend> {
        let mut transport =
            RdmaTransport::new(MockBackend::new(), source, TransportOptions::default()).unwrap();
        transport
            .seed_ram_blocks(&[RamBlockInfo {
                host_addr: 0x7000_0000,
                offset: 0,
                len: 1 << 20,
            }])
            .unwrap();
        RdmaStream::new(transport)
    }

    #[test]
    fn test_write_slices_into_increments() {
        let mut stream = stream(true);
        let data = vec![0x5Au8; SEND_INCREMENT + 100];
        // Two exchanges follow the first; feed READY for each.
        stream
            .transport_mut()
            .backend
            .script_reply(vec![(CTRL_READY, messages::ready())]);
        stream
            .transport_mut()
            .backend
            .script_reply(vec![(CTRL_READY, messages::ready())]);

        assert_eq!(stream.write(&data).unwrap(), data.len());

        let sent = &stream.transport().backend.sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.kind, ControlType::ByteStream);
        assert_eq!(sent[0].1.len(), SEND_INCREMENT);
        assert_eq!(sent[1].1.len(), 100);
        assert_eq!(sent[1].1, vec![0x5Au8; 100]);
    }

    #[test]
    fn test_read_drains_one_message_across_calls() {
        let mut stream = stream(false);
        stream.transport_mut().establish().unwrap();
        let payload: Vec<u8> = (0..100u8).collect();
        stream
            .transport_mut()
            .backend
            .script_reply(vec![(CTRL_READY, messages::byte_stream(&payload))]);

        let mut first = [0u8; 64];
        assert_eq!(stream.read(&mut first).unwrap(), 64);
        assert_eq!(&first[..], &payload[..64]);

        let mut second = [0u8; 64];
        assert_eq!(stream.read(&mut second).unwrap(), 36);
        assert_eq!(&second[..36], &payload[64..]);
    }
}
