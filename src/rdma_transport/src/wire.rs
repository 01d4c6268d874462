// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact wire formats of the out-of-band control protocol.
//!
//! Every control exchange is one IB SEND carrying a 16-byte header
//! followed by `len` bytes of message-specific payload. All integers are
//! big-endian, and every record has an explicit encode/decode pair; no
//! struct is ever reinterpreted in place.

use utils::byte_order::{read_be_u32, read_be_u64, write_be_u32, write_be_u64};

use crate::error::{RdmaError, Result};

/// Maximum size of one control message, header included.
pub const CONTROL_MAX_BUFFER: usize = 512 * 1024;
/// Maximum number of records batched in one control message.
pub const CONTROL_MAX_COMMANDS: u32 = 4096;
/// Version negotiated in the connection private data.
pub const CONTROL_VERSION: u32 = 1;

/// Capability flag: pin all guest RAM at connection time.
pub const CAP_PIN_ALL: u32 = 0x01;
/// Capability flag: keepalive liveness checking.
pub const CAP_KEEPALIVE: u32 = 0x02;
/// Capabilities this implementation understands.
pub const KNOWN_CAPABILITIES: u32 = CAP_PIN_ALL | CAP_KEEPALIVE;

/// Control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlType {
    /// Wildcard used when any message is acceptable.
    None = 0,
    /// Peer hit a fatal error.
    Error = 1,
    /// Ready to receive the next message.
    Ready = 2,
    /// A slice of the migration byte stream.
    ByteStream = 3,
    /// Request for the peer's RAM block table.
    RamBlocksRequest = 4,
    /// The peer's RAM block table.
    RamBlocksResult = 5,
    /// A chunk consists of one repeated byte value; no RDMA needed.
    Compress = 6,
    /// Pin these chunks and return their keys.
    RegisterRequest = 7,
    /// Keys for a prior registration request.
    RegisterResult = 8,
    /// The current iteration's registrations are complete.
    RegisterFinished = 9,
    /// Unpin these chunks.
    UnregisterRequest = 10,
    /// Unpinning finished.
    UnregisterFinished = 11,
}

impl ControlType {
    pub fn from_wire(raw: u32) -> Option<ControlType> {
        match raw {
            0 => Some(ControlType::None),
            1 => Some(ControlType::Error),
            2 => Some(ControlType::Ready),
            3 => Some(ControlType::ByteStream),
            4 => Some(ControlType::RamBlocksRequest),
            5 => Some(ControlType::RamBlocksResult),
            6 => Some(ControlType::Compress),
            7 => Some(ControlType::RegisterRequest),
            8 => Some(ControlType::RegisterResult),
            9 => Some(ControlType::RegisterFinished),
            10 => Some(ControlType::UnregisterRequest),
            11 => Some(ControlType::UnregisterFinished),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ControlType::None => "NONE",
            ControlType::Error => "ERROR",
            ControlType::Ready => "READY",
            ControlType::ByteStream => "BYTE STREAM",
            ControlType::RamBlocksRequest => "RAM BLOCKS REQUEST",
            ControlType::RamBlocksResult => "RAM BLOCKS RESULT",
            ControlType::Compress => "COMPRESS",
            ControlType::RegisterRequest => "REGISTER REQUEST",
            ControlType::RegisterResult => "REGISTER RESULT",
            ControlType::RegisterFinished => "REGISTER FINISHED",
            ControlType::UnregisterRequest => "UNREGISTER REQUEST",
            ControlType::UnregisterFinished => "UNREGISTER FINISHED",
        }
    }
}

/// Header prepended to every control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Length of the data portion.
    pub len: u32,
    /// Message type.
    pub kind: ControlType,
    /// Number of same-type records in the data portion.
    pub repeat: u32,
}

impl ControlHeader {
    pub const WIRE_SIZE: usize = 16;

    pub fn new(kind: ControlType, len: u32, repeat: u32) -> ControlHeader {
        ControlHeader { len, kind, repeat }
    }

    pub fn to_wire(&self, buf: &mut [u8]) {
        write_be_u32(&mut buf[0..], self.len);
        write_be_u32(&mut buf[4..], self.kind as u32);
        write_be_u32(&mut buf[8..], self.repeat);
        write_be_u32(&mut buf[12..], 0);
    }

    pub fn from_wire(buf: &[u8]) -> Result<ControlHeader> {
        let len = read_be_u32(&buf[0..]);
        let raw_kind = read_be_u32(&buf[4..]);
        let repeat = read_be_u32(&buf[8..]);
        let kind =
            ControlType::from_wire(raw_kind).ok_or(RdmaError::Protocol("unknown message type"))?;
        Ok(ControlHeader { len, kind, repeat })
    }
}

/// Capability record carried in the connection-manager private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub version: u32,
    pub flags: u32,
    /// Key of the responder's keepalive slot.
    pub keepalive_rkey: u32,
    /// Address of the responder's keepalive slot.
    pub keepalive_addr: u64,
}

impl Capabilities {
    pub const WIRE_SIZE: usize = 20;

    pub fn to_wire(&self, buf: &mut [u8]) {
        write_be_u32(&mut buf[0..], self.version);
        write_be_u32(&mut buf[4..], self.flags);
        write_be_u32(&mut buf[8..], self.keepalive_rkey);
        write_be_u64(&mut buf[12..], self.keepalive_addr);
    }

    pub fn from_wire(buf: &[u8]) -> Capabilities {
        Capabilities {
            version: read_be_u32(&buf[0..]),
            flags: read_be_u32(&buf[4..]),
            keepalive_rkey: read_be_u32(&buf[8..]),
            keepalive_addr: read_be_u64(&buf[12..]),
        }
    }
}

/// One chunk (un)registration command.
///
/// `key` is the address of the range for genuine RAM blocks, or the chunk
/// index for caller-announced regions and for unregistrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCommand {
    pub key: u64,
    pub block_index: u32,
    /// Number of additional sequential chunks covered.
    pub chunks: u64,
}

impl RegisterCommand {
    pub const WIRE_SIZE: usize = 24;

    pub fn to_wire(&self, buf: &mut [u8]) {
        write_be_u64(&mut buf[0..], self.key);
        write_be_u32(&mut buf[8..], self.block_index);
        write_be_u32(&mut buf[12..], 0);
        write_be_u64(&mut buf[16..], self.chunks);
    }

    pub fn from_wire(buf: &[u8]) -> RegisterCommand {
        RegisterCommand {
            key: read_be_u64(&buf[0..]),
            block_index: read_be_u32(&buf[8..]),
            chunks: read_be_u64(&buf[16..]),
        }
    }
}

/// The responder's answer to one registration command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterResult {
    pub rkey: u32,
    /// Host virtual address of the block on the responder.
    pub host_addr: u64,
}

impl RegisterResult {
    pub const WIRE_SIZE: usize = 16;

    pub fn to_wire(&self, buf: &mut [u8]) {
        write_be_u32(&mut buf[0..], self.rkey);
        write_be_u32(&mut buf[4..], 0);
        write_be_u64(&mut buf[8..], self.host_addr);
    }

    pub fn from_wire(buf: &[u8]) -> RegisterResult {
        RegisterResult {
            rkey: read_be_u32(&buf[0..]),
            host_addr: read_be_u64(&buf[8..]),
        }
    }
}

/// Tells the peer a range consists of one repeated byte value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressCommand {
    /// The repeated byte value (zero in practice).
    pub value: u32,
    pub block_index: u32,
    /// Address of the range in the sender's VM space.
    pub offset: u64,
    pub length: u64,
}

impl CompressCommand {
    pub const WIRE_SIZE: usize = 24;

    pub fn to_wire(&self, buf: &mut [u8]) {
        write_be_u32(&mut buf[0..], self.value);
        write_be_u32(&mut buf[4..], self.block_index);
        write_be_u64(&mut buf[8..], self.offset);
        write_be_u64(&mut buf[16..], self.length);
    }

    pub fn from_wire(buf: &[u8]) -> CompressCommand {
        CompressCommand {
            value: read_be_u32(&buf[0..]),
            block_index: read_be_u32(&buf[4..]),
            offset: read_be_u64(&buf[8..]),
            length: read_be_u64(&buf[16..]),
        }
    }
}

/// One RAM block as described by the destination at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBlock {
    pub host_addr: u64,
    pub offset: u64,
    pub length: u64,
    /// Whole-block key; only meaningful in pin-all mode.
    pub rkey: u32,
}

impl RemoteBlock {
    pub const WIRE_SIZE: usize = 32;

    pub fn to_wire(&self, buf: &mut [u8]) {
        write_be_u64(&mut buf[0..], self.host_addr);
        write_be_u64(&mut buf[8..], self.offset);
        write_be_u64(&mut buf[16..], self.length);
        write_be_u32(&mut buf[24..], self.rkey);
        write_be_u32(&mut buf[28..], 0);
    }

    pub fn from_wire(buf: &[u8]) -> RemoteBlock {
        RemoteBlock {
            host_addr: read_be_u64(&buf[0..]),
            offset: read_be_u64(&buf[8..]),
            length: read_be_u64(&buf[16..]),
            rkey: read_be_u32(&buf[24..]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_golden_bytes() {
        let head = ControlHeader::new(ControlType::RegisterRequest, 24, 1);
        let mut buf = [0u8; ControlHeader::WIRE_SIZE];
        head.to_wire(&mut buf);
        assert_eq!(
            buf,
            [
                0x00, 0x00, 0x00, 0x18, // len
                0x00, 0x00, 0x00, 0x07, // type
                0x00, 0x00, 0x00, 0x01, // repeat
                0x00, 0x00, 0x00, 0x00, // padding
            ]
        );
        assert_eq!(ControlHeader::from_wire(&buf).unwrap(), head);
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut buf = [0u8; ControlHeader::WIRE_SIZE];
        write_be_u32(&mut buf[4..], 99);
        assert!(ControlHeader::from_wire(&buf).is_err());
    }

    #[test]
    fn test_capabilities_golden_bytes() {
        let caps = Capabilities {
            version: CONTROL_VERSION,
            flags: CAP_PIN_ALL | CAP_KEEPALIVE,
            keepalive_rkey: 0xAABB_CCDD,
            keepalive_addr: 0x1122_3344_5566_7788,
        };
        let mut buf = [0u8; Capabilities::WIRE_SIZE];
        caps.to_wire(&mut buf);
        assert_eq!(
            buf,
            [
                0x00, 0x00, 0x00, 0x01, // version
                0x00, 0x00, 0x00, 0x03, // flags
                0xAA, 0xBB, 0xCC, 0xDD, // keepalive rkey
                0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, // keepalive addr
            ]
        );
        assert_eq!(Capabilities::from_wire(&buf), caps);
    }

    #[test]
    fn test_record_roundtrips() {
        let reg = RegisterCommand {
            key: 0xDEAD_BEEF_0000_1000,
            block_index: 3,
            chunks: 2,
        };
        let mut buf = [0u8; RegisterCommand::WIRE_SIZE];
        reg.to_wire(&mut buf);
        assert_eq!(RegisterCommand::from_wire(&buf), reg);

        let result = RegisterResult {
            rkey: 0x1234_5678,
            host_addr: 0x7F00_0000_0000,
        };
        let mut buf = [0u8; RegisterResult::WIRE_SIZE];
        result.to_wire(&mut buf);
        assert_eq!(RegisterResult::from_wire(&buf), result);

        let comp = CompressCommand {
            value: 0,
            block_index: 1,
            offset: 0x10_0000,
            length: 4096,
        };
        let mut buf = [0u8; CompressCommand::WIRE_SIZE];
        comp.to_wire(&mut buf);
        assert_eq!(CompressCommand::from_wire(&buf), comp);

        let block = RemoteBlock {
            host_addr: 0x7F12_3456_0000,
            offset: 0,
            length: 1 << 30,
            rkey: 42,
        };
        let mut buf = [0u8; RemoteBlock::WIRE_SIZE];
        block.to_wire(&mut buf);
        assert_eq!(RemoteBlock::from_wire(&buf), block);
    }

    #[test]
    fn test_compress_golden_bytes() {
        let comp = CompressCommand {
            value: 0,
            block_index: 2,
            offset: 0x0010_0000,
            length: 0x1000,
        };
        let mut buf = [0u8; CompressCommand::WIRE_SIZE];
        comp.to_wire(&mut buf);
        assert_eq!(
            buf,
            [
                0x00, 0x00, 0x00, 0x00, // value
                0x00, 0x00, 0x00, 0x02, // block index
                0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, // offset
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, // length
            ]
        );
    }
}
