// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Live micro-checkpoint replication for a running virtual machine.
//!
//! A primary host pauses its guest at a configurable cadence (tens to
//! hundreds of milliseconds), captures the dirty state into an elastic
//! in-memory staging area, resumes the guest, and streams the captured
//! checkpoint to a secondary host which acknowledges and applies it. The
//! guest's network output produced between two checkpoints is held behind a
//! traffic-shaper barrier and released only once the covering checkpoint
//! has been acknowledged, so no externally visible packet ever outruns the
//! replicated state.
//!
//! The crate is transport agnostic: the primary loop and the secondary
//! receiver run over any `Read + Write` stream — a TCP/Unix socket, or the
//! byte-stream adapter exposed by the `rdma_transport` crate.
//!
//! The hypervisor itself (guest pause/resume, state serialization, NIC and
//! RAM-block enumeration) is an external collaborator modeled by the
//! [`hypervisor::Hypervisor`] trait, and the kernel traffic-shaping
//! facility by the [`netbuf::TrafficShaper`] trait.

pub mod config;
pub mod hypervisor;
pub mod netbuf;
pub mod primary;
pub mod protocol;
pub mod secondary;
pub mod slab;
pub mod stream;
pub mod testing;

pub use config::CheckpointConfig;
pub use primary::{CheckpointLoop, MigrationState, StateCell};
pub use secondary::CheckpointReceiver;
pub use slab::SlabRing;
