// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interface to the hypervisor hosting the replicated guest.
//!
//! The replication core never touches the guest directly; everything it
//! needs — lifecycle control, state serialization, NIC and RAM-block
//! enumeration — goes through this trait. The hypervisor instance is
//! shared behind `Arc<Mutex<_>>`; the checkpoint worker holds the lock
//! only across pause → save → resume so the hypervisor's own event loop
//! keeps running between checkpoints.

use std::io;

use crate::stream::{StateSink, StateSource};

/// A guest NIC as seen by the traffic-buffer controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    /// The guest-facing device name.
    pub name: String,
    /// Name of the host peer device carrying this NIC's traffic, if any.
    pub peer_device: Option<String>,
}

/// A guest RAM block as enumerated by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamBlockInfo {
    /// Host virtual address of the block's first byte.
    pub host_addr: u64,
    /// Offset of the block in the guest's flat RAM space.
    pub offset: u64,
    /// Block length in bytes.
    pub len: u64,
}

/// Dirty-tracking durations reported by the hypervisor for the last
/// checkpoint. The core only reads and logs these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyStats {
    /// Time spent synchronizing the dirty bitmap, in ms.
    pub bitmap_sync_ms: u64,
    /// Time spent in dirty logging, in ms.
    pub log_dirty_ms: u64,
    /// Time spent copying RAM, in ms.
    pub ram_copy_ms: u64,
}

/// Errors reported by hypervisor operations.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum HypervisorError {
    /// Cannot pause the guest: {0}
    Pause(String),
    /// Cannot resume the guest: {0}
    Resume(String),
    /// Cannot save guest state: {0}
    SaveState(io::Error),
    /// Cannot load guest state: {0}
    LoadState(io::Error),
}

/// Operations the replication core requires from the hosting hypervisor.
pub trait Hypervisor: Send {
    /// Stops guest vcpus. The guest stays pausable/resumable repeatedly.
    fn pause(&mut self) -> Result<(), HypervisorError>;

    /// Restarts guest vcpus after a pause.
    fn resume(&mut self) -> Result<(), HypervisorError>;

    /// Serializes the live (iterative) part of guest state into `sink`.
    fn save_state_begin(&mut self, sink: &mut dyn StateSink) -> Result<(), HypervisorError>;

    /// Serializes the remaining device state into `sink`, completing one
    /// consistent snapshot.
    fn save_state_complete(&mut self, sink: &mut dyn StateSink) -> Result<(), HypervisorError>;

    /// Replaces guest state with a snapshot read from `source`.
    fn load_state(&mut self, source: &mut dyn StateSource) -> Result<(), HypervisorError>;

    /// Enumerates guest NICs.
    fn nics(&self) -> Vec<NicInfo>;

    /// Enumerates guest RAM blocks.
    fn ram_blocks(&self) -> Vec<RamBlockInfo>;

    /// Clears per-checkpoint dirty accounting.
    fn reset_dirty_accounting(&mut self) {}

    /// Reports dirty-tracking durations for the last checkpoint.
    fn dirty_stats(&self) -> DirtyStats {
        DirtyStats::default()
    }
}
