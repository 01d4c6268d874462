// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Traffic-buffer controller.
//!
//! Between two checkpoints the guest's outbound packets must not become
//! externally visible, because the state that produced them is not yet
//! replicated. The controller drives a kernel traffic shaper (a `plug`
//! qdisc on the NIC's buffer device) to hold packets behind barriers:
//! a barrier is inserted for checkpoint *k+1* while the guest is paused
//! for checkpoint *k*, and the oldest barrier is released once the
//! secondary acknowledges the checkpoint that covers it.
//!
//! Only the first guest NIC is buffered. The shaper itself (the netlink
//! qdisc machinery) is an external facility modeled by [`TrafficShaper`].

use std::io;

use log::{info, warn};

use crate::hypervisor::NicInfo;

/// Expected prefix of the host peer device of the buffered NIC.
pub const DEFAULT_NIC_PREFIX: &str = "tap";
/// Prefix substituted to derive the buffer device name.
pub const DEFAULT_BUFFER_NIC_PREFIX: &str = "ifb";

/// Default qdisc byte limit: one second of a saturated 1 Gbps pipe.
pub const DEFAULT_BUFFER_SIZE: u32 = 1_000_000_000 / 8;

/// Errors reported while enabling network buffering.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum NetBufferError {
    /// Peer device {0} does not start with the expected prefix {1}
    UnexpectedPrefix(String, String),
    /// Traffic shaper {0} operation failed: {1}
    Shaper(&'static str, io::Error),
}

/// The kernel traffic-shaping facility, reduced to the operations the
/// controller needs. The production implementation manipulates a `plug`
/// qdisc over netlink; tests substitute a recording fake.
pub trait TrafficShaper: Send {
    /// Creates the plug qdisc at the root of `device`.
    fn create_plug(&mut self, device: &str) -> io::Result<()>;

    /// Sets the qdisc byte limit.
    fn set_limit(&mut self, bytes: u32) -> io::Result<()>;

    /// Records a cut point; packets enqueued afterwards are held.
    fn insert_barrier(&mut self) -> io::Result<()>;

    /// Releases packets up to the oldest barrier.
    fn release_one(&mut self) -> io::Result<()>;

    /// Releases everything and keeps passing packets through.
    fn release_indefinite(&mut self) -> io::Result<()>;

    /// Deletes the qdisc.
    fn destroy(&mut self) -> io::Result<()>;
}

/// Controller for checkpoint-covered network buffering on the first guest
/// NIC.
///
/// Failures while enabling are hard errors; failures at runtime downgrade
/// the controller to the unbuffered state with a warning, and the
/// checkpoint loop proceeds without network-consistency guarantees.
pub struct NetBuffer {
    shaper: Box<dyn TrafficShaper>,
    enabled: bool,
    device: Option<String>,
    buffer_size: u32,
    new_buffer_size: u32,
    nic_prefix: String,
    buffer_nic_prefix: String,
}

impl std::fmt::Debug for NetBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetBuffer")
            .field("enabled", &self.enabled)
            .field("device", &self.device)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl NetBuffer {
    pub fn new(shaper: Box<dyn TrafficShaper>, buffer_size: u32) -> NetBuffer {
        NetBuffer {
            shaper,
            enabled: false,
            device: None,
            buffer_size,
            new_buffer_size: buffer_size,
            nic_prefix: DEFAULT_NIC_PREFIX.to_string(),
            buffer_nic_prefix: DEFAULT_BUFFER_NIC_PREFIX.to_string(),
        }
    }

    /// Overrides the tap/ifb prefix pair.
    pub fn with_prefixes(mut self, nic_prefix: &str, buffer_nic_prefix: &str) -> NetBuffer {
        self.nic_prefix = nic_prefix.to_string();
        self.buffer_nic_prefix = buffer_nic_prefix.to_string();
        self
    }

    /// Whether packets are currently being buffered.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The current qdisc byte limit.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Requests a new qdisc byte limit, applied at the next barrier.
    pub fn request_buffer_size(&mut self, bytes: u32) {
        self.new_buffer_size = bytes;
    }

    /// Picks the buffered NIC and derives the buffer device name.
    ///
    /// Returns `None` when no NIC qualifies (no NIC at all, or the first
    /// NIC has no peer host device); the guest then runs unbuffered.
    fn pick_buffer_device(&self, nics: &[NicInfo]) -> Result<Option<String>, NetBufferError> {
        if nics.len() > 1 {
            warn!("buffering with multiple NICs is not supported; using the first one");
        }
        let nic = match nics.first() {
            Some(nic) => nic,
            None => {
                warn!("guest has no NIC to buffer; VM output will not be consistent");
                return Ok(None);
            }
        };
        let peer = match &nic.peer_device {
            Some(peer) => peer,
            None => {
                warn!(
                    "NIC {} has no peer host device for buffering; VM output will not be consistent",
                    nic.name
                );
                return Ok(None);
            }
        };
        let suffix = peer.strip_prefix(&self.nic_prefix).ok_or_else(|| {
            NetBufferError::UnexpectedPrefix(peer.clone(), self.nic_prefix.clone())
        })?;
        Ok(Some(format!("{}{}", self.buffer_nic_prefix, suffix)))
    }

    /// Installs the plug qdisc on the buffer device derived from the first
    /// guest NIC, sets its byte limit, and suspends buffering until the
    /// first barrier. Partial state is torn down on failure.
    pub fn enable(&mut self, nics: &[NicInfo]) -> Result<(), NetBufferError> {
        if self.enabled {
            warn!("buffering already enabled, skipping");
            return Ok(());
        }

        let device = match self.pick_buffer_device(nics)? {
            Some(device) => device,
            // Degraded mode: run without buffering.
            None => return Ok(()),
        };

        info!("initializing network buffering on device {}", device);

        if let Err(err) = self.shaper.create_plug(&device) {
            return Err(NetBufferError::Shaper("create", err));
        }
        self.enabled = true;
        self.device = Some(device);

        if let Err(err) = self.shaper.set_limit(self.buffer_size) {
            self.disable();
            return Err(NetBufferError::Shaper("set-limit", err));
        }
        if let Err(err) = self.shaper.release_indefinite() {
            self.disable();
            return Err(NetBufferError::Shaper("suspend", err));
        }

        info!(
            "buffering enabled, size: {} MB",
            self.buffer_size / 1024 / 1024
        );
        Ok(())
    }

    fn downgrade(&mut self, op: &str, err: io::Error) {
        warn!(
            "traffic shaper {} failed ({}); disabling buffering, VM output will not be consistent",
            op, err
        );
        self.disable();
    }

    /// Inserts a barrier for the next checkpoint. A pending buffer-size
    /// change is applied first.
    pub fn insert_barrier(&mut self) {
        if !self.enabled {
            return;
        }
        if self.new_buffer_size != self.buffer_size {
            self.buffer_size = self.new_buffer_size;
            info!("applying new buffer size {}", self.buffer_size);
            if let Err(err) = self.shaper.set_limit(self.buffer_size) {
                self.downgrade("set-limit", err);
                return;
            }
        }
        if let Err(err) = self.shaper.insert_barrier() {
            self.downgrade("insert-barrier", err);
        }
    }

    /// Makes one checkpoint's worth of output externally visible.
    pub fn release_one(&mut self) {
        if !self.enabled {
            return;
        }
        if let Err(err) = self.shaper.release_one() {
            self.downgrade("release-one", err);
        }
    }

    /// Suspends buffering and removes the qdisc.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        if let Err(err) = self.shaper.release_indefinite() {
            warn!("traffic shaper release-indefinite failed on disable: {}", err);
        }
        if let Err(err) = self.shaper.destroy() {
            warn!("traffic shaper destroy failed on disable: {}", err);
        }
        self.enabled = false;
        self.device = None;
        info!("buffering disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeShaper, ShaperLog};

    fn nic(peer: Option<&str>) -> Vec<NicInfo> {
        vec![NicInfo {
            name: "net0".to_string(),
            peer_device: peer.map(String::from),
        }]
    }

    fn buffer_with_log() -> (NetBuffer, ShaperLog) {
        let shaper = FakeShaper::new();
        let log = shaper.log();
        (NetBuffer::new(Box::new(shaper), DEFAULT_BUFFER_SIZE), log)
    }

    #[test]
    fn test_enable_derives_buffer_device() {
        let (mut netbuf, log) = buffer_with_log();
        netbuf.enable(&nic(Some("tap3"))).unwrap();
        assert!(netbuf.is_enabled());
        assert_eq!(
            log.ops(),
            vec![
                "create:ifb3".to_string(),
                format!("limit:{}", DEFAULT_BUFFER_SIZE),
                "release-indefinite".to_string(),
            ]
        );
    }

    #[test]
    fn test_no_peer_degrades_without_error() {
        let (mut netbuf, log) = buffer_with_log();
        netbuf.enable(&nic(None)).unwrap();
        assert!(!netbuf.is_enabled());
        assert!(log.ops().is_empty());
        // Runtime operations are silent no-ops when degraded.
        netbuf.insert_barrier();
        netbuf.release_one();
        assert!(log.ops().is_empty());
    }

    #[test]
    fn test_wrong_prefix_refuses_to_enable() {
        let (mut netbuf, _log) = buffer_with_log();
        let err = netbuf.enable(&nic(Some("eth0"))).unwrap_err();
        assert!(matches!(err, NetBufferError::UnexpectedPrefix(..)));
        assert!(!netbuf.is_enabled());
    }

    #[test]
    fn test_enable_disable_restores_state() {
        let (mut netbuf, log) = buffer_with_log();
        netbuf.enable(&nic(Some("tap0"))).unwrap();
        netbuf.disable();
        assert!(!netbuf.is_enabled());
        let ops = log.ops();
        assert_eq!(ops.last().unwrap(), "destroy");
        assert_eq!(ops[ops.len() - 2], "release-indefinite");
    }

    #[test]
    fn test_barrier_and_release_sequence() {
        let (mut netbuf, log) = buffer_with_log();
        netbuf.enable(&nic(Some("tap1"))).unwrap();
        netbuf.insert_barrier();
        netbuf.insert_barrier();
        netbuf.release_one();
        let ops = log.ops();
        assert_eq!(
            &ops[3..],
            &[
                "barrier".to_string(),
                "barrier".to_string(),
                "release-one".to_string()
            ]
        );
    }

    #[test]
    fn test_runtime_failure_downgrades() {
        let shaper = FakeShaper::new();
        let log = shaper.log();
        shaper.fail_next_barrier();
        let mut netbuf = NetBuffer::new(Box::new(shaper), DEFAULT_BUFFER_SIZE);
        netbuf.enable(&nic(Some("tap0"))).unwrap();

        netbuf.insert_barrier();
        assert!(!netbuf.is_enabled());
        // Subsequent operations are no-ops.
        let nb_ops = log.ops().len();
        netbuf.release_one();
        netbuf.insert_barrier();
        assert_eq!(log.ops().len(), nb_ops);
    }

    #[test]
    fn test_deferred_resize_applies_at_barrier() {
        let (mut netbuf, log) = buffer_with_log();
        netbuf.enable(&nic(Some("tap0"))).unwrap();
        netbuf.request_buffer_size(1024);
        assert_eq!(netbuf.buffer_size(), DEFAULT_BUFFER_SIZE);
        netbuf.insert_barrier();
        assert_eq!(netbuf.buffer_size(), 1024);
        let ops = log.ops();
        assert!(ops.contains(&"limit:1024".to_string()));
    }
}
