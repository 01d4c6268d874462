// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport error taxonomy.
//!
//! A failed write can leave the peer's view of guest RAM incoherent, so
//! errors are sticky: the first one is latched into the transport's error
//! state, and every later entry point short-circuits with a clone of it
//! until the connection is torn down.

use std::io;

/// Errors produced by the RDMA transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum RdmaError {
    /// Peer is unreachable (keepalive failed)
    PeerUnreachable,
    /// Send queue is full
    SendQueueFull,
    /// Work completion failed with status {0}
    WorkCompletion(u32),
    /// Posting a work request failed: errno {0}
    PostFailure(i32),
    /// Registering memory with the device failed
    RegisterFailure,
    /// Deregistering memory failed: errno {0}
    DeregisterFailure(i32),
    /// Control protocol violation: {0}
    Protocol(&'static str),
    /// Expected a {0} control message, got {1}
    UnexpectedMessage(&'static str, &'static str),
    /// Control message length {0} is malformed
    MalformedLength(u32),
    /// Control message of {0} bytes exceeds the control buffer
    ControlOverflow(u32),
    /// Too many records in one control message: {0}
    TooManyRecords(u32),
    /// RAM block layout differs between peers
    BlockMismatch,
    /// No RAM block registered at offset {0:#x}
    UnknownBlock(u64),
    /// Range {1:#x}+{2} is outside RAM block at {0:#x}
    RangeOutOfBounds(u64, u64, u64),
    /// Connection setup failed: {0}
    Setup(&'static str),
    /// Device operation failed: errno {0}
    Verbs(i32),
}

/// Result alias used across the transport.
pub type Result<T> = std::result::Result<T, RdmaError>;

impl From<RdmaError> for io::Error {
    fn from(err: RdmaError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_strings() {
        assert_eq!(
            RdmaError::PeerUnreachable.to_string(),
            "Peer is unreachable (keepalive failed)"
        );
        assert_eq!(
            RdmaError::WorkCompletion(12).to_string(),
            "Work completion failed with status 12"
        );
    }

    #[test]
    fn test_io_conversion_preserves_message() {
        let io_err: io::Error = RdmaError::SendQueueFull.into();
        assert!(io_err.to_string().contains("Send queue is full"));
    }
}
