// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy RDMA transport for checkpoint replication.
//!
//! Guest RAM pages travel as one-sided RDMA WRITEs over a
//! reliable-connected queue pair while control messages (registration
//! commands, block tables, the migration byte stream itself) travel as IB
//! SEND/RECV on an out-of-band channel. Two pinning disciplines are
//! negotiated at connect time: pin the entire guest once, or pin 1 MiB
//! chunks on first touch and speculatively unpin them later. A keepalive
//! subsystem writes a counter into a pre-registered slot on the peer so
//! liveness is observable even when application traffic quiesces.
//!
//! The crate splits into a device-independent core — wire formats, block
//! registry, write engine, control exchange, liveness policy — written
//! against the [`backend::IbBackend`] trait, and the libibverbs/librdmacm
//! connection layer in [`verbs`], compiled only with the `rdma` feature so
//! hosts without rdma-core still build and test the core.

pub mod backend;
pub mod control;
pub mod engine;
pub mod error;
pub mod keepalive;
pub mod registry;
pub mod stream;
pub mod testing;
#[cfg(feature = "rdma")]
pub mod verbs;
pub mod wire;
pub mod wrid;

use backend::IbBackend;
use engine::{UnregisterQueue, WriteCursor};
use keepalive::LivenessMonitor;
use log::error;
use registry::{BlockRegistry, Link, MrInfo, NB_LINKS};

pub use error::{RdmaError, Result};

/// Do not merge page ranges beyond this size.
pub const MERGE_MAX: u64 = 2 * 1024 * 1024;
/// Send queue depth, sized for merge-cap-sized transfers of 4 KiB pages.
pub const SEND_MAX: usize = (MERGE_MAX / 4096) as usize;
/// Byte-stream slice carried per control message.
pub const SEND_INCREMENT: usize = 32768;

/// Control-buffer slot awaiting the peer's next message.
pub(crate) const CTRL_READY: usize = 0;
/// Control-buffer slot for an anticipated response.
pub(crate) const CTRL_DATA: usize = 1;
/// Control-buffer slot backing our own sends.
pub(crate) const CTRL_SEND: usize = 2;
/// Number of control-buffer slots.
pub(crate) const NB_CTRL_SLOTS: usize = 3;

/// Connection-time options of the transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Pin all guest RAM at connection time instead of chunk-on-demand.
    pub pin_all: bool,
    /// Run the keepalive subsystem.
    pub keepalive: bool,
    /// Speculatively unpin chunks after their writes complete
    /// (chunk-on-demand mode only).
    pub speculative_unregister: bool,
}

impl Default for TransportOptions {
    fn default() -> TransportOptions {
        TransportOptions {
            pin_all: false,
            keepalive: true,
            speculative_unregister: false,
        }
    }
}

/// One registered control buffer and the cursor over its last message.
pub(crate) struct ControlSlot {
    pub(crate) buf: Box<[u8]>,
    pub(crate) mr: MrInfo,
    /// Unconsumed payload bytes of the last message landed here.
    pub(crate) len: usize,
    /// Read position within the payload.
    pub(crate) cur: usize,
}

impl ControlSlot {
    pub(crate) fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }
}

/// An established RDMA replication channel.
///
/// Owns the device backend, the RAM block registry, the control-channel
/// buffers and the three write cursors (remote, local-copy source,
/// local-copy destination). All operations run on the single worker
/// thread that owns this value; only the keepalive timers touch it from
/// the host event loop, via their own handler methods.
pub struct RdmaTransport<B: IbBackend> {
    pub(crate) backend: B,
    pub(crate) registry: BlockRegistry,
    pub(crate) source: bool,
    pub(crate) pin_all: bool,
    pub(crate) do_keepalive: bool,
    pub(crate) speculative_unregister: bool,

    pub(crate) ctrl: Vec<ControlSlot>,
    pub(crate) control_ready_expected: bool,

    /// Outstanding RDMA writes across all links.
    pub(crate) nb_sent: u32,
    /// Outstanding RDMA writes per link.
    pub(crate) link_sent: [u32; NB_LINKS],

    pub(crate) cursors: [WriteCursor; 3],
    pub(crate) unreg: UnregisterQueue,

    pub(crate) error_state: Option<RdmaError>,
    pub(crate) error_reported: bool,

    pub(crate) total_registrations: u64,
    pub(crate) total_writes: u64,

    /// Slot the peer's keepalive writes land in.
    pub(crate) keepalive_value: Box<u64>,
    /// Our outgoing keepalive counter.
    pub(crate) next_keepalive: Box<u64>,
    pub(crate) keepalive_mr: Option<MrInfo>,
    pub(crate) next_keepalive_mr: Option<MrInfo>,
    pub(crate) peer_keepalive_addr: u64,
    pub(crate) peer_keepalive_rkey: u32,
    pub(crate) liveness: LivenessMonitor,
}

impl<B: IbBackend> RdmaTransport<B> {
    /// Builds a transport over an already-connected backend, registering
    /// the control buffers and the keepalive slots.
    pub fn new(mut backend: B, source: bool, options: TransportOptions) -> Result<RdmaTransport<B>> {
        let mut ctrl = Vec::with_capacity(NB_CTRL_SLOTS);
        for _ in 0..NB_CTRL_SLOTS {
            let buf = vec![0u8; wire::CONTROL_MAX_BUFFER].into_boxed_slice();
            let mr = backend.register(
                Link::Remote,
                buf.as_ptr() as u64,
                wire::CONTROL_MAX_BUFFER as u64,
                true,
            )?;
            ctrl.push(ControlSlot {
                buf,
                mr,
                len: 0,
                cur: 0,
            });
        }

        let keepalive_value = Box::new(0u64);
        let next_keepalive = Box::new(0u64);
        let keepalive_mr = backend.register(
            Link::Remote,
            &*keepalive_value as *const u64 as u64,
            std::mem::size_of::<u64>() as u64,
            true,
        )?;
        let next_keepalive_mr = backend.register(
            Link::Remote,
            &*next_keepalive as *const u64 as u64,
            std::mem::size_of::<u64>() as u64,
            true,
        )?;

        Ok(RdmaTransport {
            backend,
            registry: BlockRegistry::new(),
            source,
            pin_all: options.pin_all,
            do_keepalive: options.keepalive,
            speculative_unregister: options.speculative_unregister,
            ctrl,
            control_ready_expected: false,
            nb_sent: 0,
            link_sent: [0; NB_LINKS],
            cursors: [WriteCursor::default(); 3],
            unreg: UnregisterQueue::new(SEND_MAX),
            error_state: None,
            error_reported: false,
            total_registrations: NB_CTRL_SLOTS as u64 + 2,
            total_writes: 0,
            keepalive_value,
            next_keepalive,
            keepalive_mr: Some(keepalive_mr),
            next_keepalive_mr: Some(next_keepalive_mr),
            peer_keepalive_addr: 0,
            peer_keepalive_rkey: 0,
            liveness: LivenessMonitor::default(),
        })
    }

    /// Registers the hypervisor-enumerated RAM blocks.
    pub fn seed_ram_blocks(
        &mut self,
        blocks: &[checkpoint::hypervisor::RamBlockInfo],
    ) -> Result<()> {
        self.registry.seed(blocks)
    }

    /// Posts the initial control RECV and arms the READY discipline.
    /// Called once both sides have connected.
    pub fn establish(&mut self) -> Result<()> {
        self.post_recv_control(CTRL_READY)?;
        if self.source {
            self.control_ready_expected = true;
        }
        Ok(())
    }

    /// The keepalive slot this side exposes, advertised to the peer in
    /// the connection private data.
    pub fn local_keepalive_slot(&self) -> wire::Capabilities {
        let mr = self.keepalive_mr.as_ref();
        wire::Capabilities {
            version: wire::CONTROL_VERSION,
            flags: 0,
            keepalive_rkey: mr.map(|m| m.rkey).unwrap_or(0),
            keepalive_addr: &*self.keepalive_value as *const u64 as u64,
        }
    }

    /// Records where the peer's keepalive slot lives.
    pub fn set_peer_keepalive(&mut self, rkey: u32, addr: u64) {
        self.peer_keepalive_rkey = rkey;
        self.peer_keepalive_addr = addr;
    }

    /// Applies the capability flags that survived negotiation.
    pub fn set_negotiated(&mut self, pin_all: bool, keepalive: bool) {
        if self.pin_all && !pin_all {
            log::warn!("peer cannot pin all memory; registering dynamically");
        }
        if self.do_keepalive && !keepalive {
            log::warn!("peer cannot keep alive; liveness checking disabled");
        }
        self.pin_all = pin_all;
        self.do_keepalive = keepalive;
    }

    /// The device backend, for connection-layer plumbing.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_source(&self) -> bool {
        self.source
    }

    pub fn pin_all(&self) -> bool {
        self.pin_all
    }

    pub fn keepalive_enabled(&self) -> bool {
        self.do_keepalive
    }

    /// The latched fatal error, if any.
    pub fn error_state(&self) -> Option<&RdmaError> {
        self.error_state.as_ref()
    }

    /// Lifetime count of memory registrations.
    pub fn total_registrations(&self) -> u64 {
        self.total_registrations
    }

    /// Lifetime count of posted RDMA writes.
    pub fn total_writes(&self) -> u64 {
        self.total_writes
    }

    /// Latches `err` as the sticky error state.
    pub(crate) fn set_error(&mut self, err: RdmaError) {
        if self.error_state.is_none() {
            self.error_state = Some(err);
        }
    }

    /// Short-circuits every public entry point once a fatal error was
    /// recorded.
    pub(crate) fn check_error(&mut self) -> Result<()> {
        if let Some(err) = &self.error_state {
            if !self.error_reported {
                error!("transport is in an error state, waiting for teardown: {}", err);
                self.error_reported = true;
            }
            return Err(err.clone());
        }
        Ok(())
    }

    /// Best-effort release of every registration this transport holds.
    /// The connection itself is torn down by the owner of the backend.
    pub fn close(&mut self) {
        // Tell the peer we died on purpose, unless the peer itself is
        // the reason we are dying.
        if let Some(err) = self.error_state.clone() {
            if err != RdmaError::PeerUnreachable && !self.ctrl.is_empty() {
                let head = wire::ControlHeader::new(wire::ControlType::Error, 0, 1);
                if self.post_send_control(head, None).is_err() {
                    log::warn!("could not signal the error to the peer");
                }
            }
        }

        while self.registry.len() != 0 {
            let offset = self.registry.iter().next().map(|b| b.offset);
            let Some(offset) = offset else { break };
            match self.registry.delete(offset) {
                Ok(block) => self.release_block_pins(block),
                Err(_) => break,
            }
        }

        for slot in std::mem::take(&mut self.ctrl) {
            if let Err(err) = self.backend.deregister(Link::Remote, slot.mr.handle) {
                log::warn!("failed to release a control buffer: {}", err);
            }
        }
        for mr in [self.keepalive_mr.take(), self.next_keepalive_mr.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.backend.deregister(Link::Remote, mr.handle) {
                log::warn!("failed to release a keepalive slot: {}", err);
            }
        }
    }

    /// Deregisters every pin of a block removed from the registry.
    pub(crate) fn release_block_pins(&mut self, block: registry::LocalBlock) {
        for (link, pins) in [Link::Remote, Link::LocalSrc, Link::LocalDest]
            .into_iter()
            .zip(block.pins.into_iter())
        {
            if let Some(mr) = pins.whole {
                if self.backend.deregister(link, mr.handle).is_ok() {
                    self.total_registrations = self.total_registrations.saturating_sub(1);
                }
            }
            for mr in pins.chunks.into_iter().flatten() {
                if self.backend.deregister(link, mr.handle).is_ok() {
                    self.total_registrations = self.total_registrations.saturating_sub(1);
                }
            }
        }
    }
}
