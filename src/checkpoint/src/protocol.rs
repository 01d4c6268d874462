// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The replication control protocol spoken between primary and secondary.
//!
//! Per checkpoint, all integers big-endian:
//!
//! ```text
//! primary -> secondary: u32 COMMIT
//! primary -> secondary: u32 size
//! primary -> secondary: size bytes of opaque VM state
//! secondary -> primary: u32 ACK
//! ```
//!
//! The secondary opens the conversation with a single ACK before the first
//! COMMIT.

use std::io;
use std::io::{Read, Write};

use utils::byte_order;

/// Transaction sentinels exchanged on the control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    /// Negative acknowledgement.
    Nack,
    /// A checkpoint follows.
    Commit,
    /// Orderly stop requested.
    Cancel,
    /// Checkpoint received and safe.
    Ack,
}

impl Transaction {
    fn to_wire(self) -> u32 {
        match self {
            Transaction::Nack => u32::MAX,
            Transaction::Commit => 1,
            Transaction::Cancel => 2,
            Transaction::Ack => 3,
        }
    }

    fn from_wire(raw: u32) -> Option<Transaction> {
        match raw {
            u32::MAX => Some(Transaction::Nack),
            1 => Some(Transaction::Commit),
            2 => Some(Transaction::Cancel),
            3 => Some(Transaction::Ack),
            _ => None,
        }
    }
}

/// Errors on the replication control stream.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ProtocolError {
    /// Control stream I/O failed: {0}
    Io(#[from] io::Error),
    /// Unknown transaction sentinel {0:#x}
    UnknownTransaction(u32),
    /// Expected {0:?} transaction, got {1:?}
    UnexpectedTransaction(Transaction, Transaction),
}

/// Writes one big-endian `u32` to `dst` and flushes.
pub fn send_be_u32<W: Write>(dst: &mut W, value: u32) -> io::Result<()> {
    let mut buf = [0u8; 4];
    byte_order::write_be_u32(&mut buf, value);
    dst.write_all(&buf)?;
    dst.flush()
}

/// Reads one big-endian `u32` from `src`.
pub fn recv_be_u32<R: Read>(src: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    src.read_exact(&mut buf)?;
    Ok(byte_order::read_be_u32(&buf))
}

/// Sends a transaction sentinel.
pub fn send_transaction<W: Write>(dst: &mut W, transaction: Transaction) -> io::Result<()> {
    send_be_u32(dst, transaction.to_wire())
}

/// Receives the next transaction sentinel.
pub fn recv_transaction<R: Read>(src: &mut R) -> Result<Transaction, ProtocolError> {
    let raw = recv_be_u32(src)?;
    Transaction::from_wire(raw).ok_or(ProtocolError::UnknownTransaction(raw))
}

/// Receives a sentinel and requires it to be `expected`.
pub fn expect_transaction<R: Read>(
    src: &mut R,
    expected: Transaction,
) -> Result<(), ProtocolError> {
    let got = recv_transaction(src)?;
    if got != expected {
        return Err(ProtocolError::UnexpectedTransaction(expected, got));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_sentinel_values() {
        assert_eq!(Transaction::Nack.to_wire(), 0xFFFF_FFFF);
        assert_eq!(Transaction::Commit.to_wire(), 1);
        assert_eq!(Transaction::Cancel.to_wire(), 2);
        assert_eq!(Transaction::Ack.to_wire(), 3);
    }

    #[test]
    fn test_roundtrip() {
        for t in [
            Transaction::Nack,
            Transaction::Commit,
            Transaction::Cancel,
            Transaction::Ack,
        ] {
            let mut buf = Vec::new();
            send_transaction(&mut buf, t).unwrap();
            assert_eq!(buf.len(), 4);
            assert_eq!(recv_transaction(&mut Cursor::new(&buf)).unwrap(), t);
        }
    }

    #[test]
    fn test_unknown_sentinel() {
        let buf = [0x00, 0x00, 0x00, 0x2A];
        let err = recv_transaction(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTransaction(0x2A)));
    }

    #[test]
    fn test_expect_mismatch() {
        let mut buf = Vec::new();
        send_transaction(&mut buf, Transaction::Cancel).unwrap();
        let err = expect_transaction(&mut Cursor::new(&buf), Transaction::Ack).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedTransaction(Transaction::Ack, Transaction::Cancel)
        ));
    }
}
