// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Out-of-band liveness checking.
//!
//! Application traffic may legitimately quiesce for long stretches, and
//! verbs-level disconnect events do not fire on every fabric, so each
//! side periodically RDMA-writes an incrementing counter into a slot the
//! peer registered at connect time, and independently watches its own
//! slot for progress. A stalled counter accumulates misses; past the
//! threshold the queue pair is forced into the error state and the
//! transport latches [`RdmaError::PeerUnreachable`].
//!
//! The two timers are not self-driving. The embedder registers their
//! file descriptors with its event loop and invokes the handler methods
//! on expiry.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::{debug, error, warn};
use timerfd::{SetTimeFlags, TimerFd, TimerState};

use crate::backend::{IbBackend, WriteRequest};
use crate::error::RdmaError;
use crate::registry::Link;
use crate::wrid::WorkRequestId;
use crate::RdmaTransport;

/// Keepalive write and watch period.
pub const KEEPALIVE_INTERVAL_MS: u64 = 300;
/// Extra slack granted after the first miss.
pub const KEEPALIVE_FIRST_MISS_GRACE_MS: u64 = 1000;
/// Consecutive misses tolerated once the peer has been seen alive.
pub const MAX_LOST_KEEPALIVE: u64 = 10;
/// Consecutive misses tolerated before the peer was ever seen alive.
pub const MAX_STARTUP_MISSED_KEEPALIVE: u64 = 100;

/// What the watcher should do after one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// The counter moved.
    Healthy,
    /// The counter stalled; `first` selects the grace window.
    Miss { first: bool },
    /// The peer has not produced its first increment yet.
    StartupWait,
    /// The peer is gone.
    Dead,
}

/// Pure miss-accounting state of the keepalive watcher.
#[derive(Debug, Default)]
pub struct LivenessMonitor {
    last: u64,
    missed: u64,
    startup: bool,
}

impl LivenessMonitor {
    /// Feeds one reading of the local keepalive slot.
    pub fn observe(&mut self, current: u64) -> LivenessVerdict {
        if current == self.last {
            self.missed += 1;
        } else {
            self.startup = true;
            self.missed = 0;
        }
        self.last = current;

        if self.startup {
            if self.missed == 0 {
                LivenessVerdict::Healthy
            } else if self.missed > MAX_LOST_KEEPALIVE {
                LivenessVerdict::Dead
            } else {
                LivenessVerdict::Miss {
                    first: self.missed == 1,
                }
            }
        } else if self.missed < MAX_STARTUP_MISSED_KEEPALIVE {
            LivenessVerdict::StartupWait
        } else {
            // The peer never came up; stop extending the startup grace.
            self.startup = true;
            LivenessVerdict::StartupWait
        }
    }

    /// Consecutive misses recorded so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

impl<B: IbBackend> RdmaTransport<B> {
    /// Sender tick: posts the next counter value into the peer's slot as
    /// an unsignaled RDMA WRITE. A full send queue simply defers to the
    /// next tick.
    pub fn keepalive_tick(&mut self) {
        if self.error_state.is_some() || !self.do_keepalive {
            return;
        }
        let mr = match &self.next_keepalive_mr {
            Some(mr) => *mr,
            None => return,
        };

        *self.next_keepalive += 1;
        let request = WriteRequest {
            wr_id: WorkRequestId::KEEPALIVE,
            local_addr: &*self.next_keepalive as *const u64 as u64,
            len: std::mem::size_of::<u64>() as u32,
            lkey: mr.lkey,
            remote_addr: self.peer_keepalive_addr,
            rkey: self.peer_keepalive_rkey,
            signaled: false,
        };

        match self.backend.post_write(Link::Remote, request) {
            Ok(()) => {}
            Err(RdmaError::SendQueueFull) => {
                debug!("send queue is full, keepalive deferred one interval");
            }
            Err(err) => {
                error!("posting keepalive failed: {}", err);
                self.set_error(err);
            }
        }
    }

    /// Watcher tick: compares the local keepalive slot against its last
    /// reading. Returns extra delay to add before the next tick, if any.
    pub fn liveness_tick(&mut self) -> Option<Duration> {
        if self.error_state.is_some() || !self.do_keepalive {
            return None;
        }

        // The peer's NIC writes this slot behind our back.
        let current = unsafe { std::ptr::read_volatile(&*self.keepalive_value) };
        match self.liveness.observe(current) {
            LivenessVerdict::Healthy | LivenessVerdict::StartupWait => None,
            LivenessVerdict::Miss { first: true } => {
                debug!("first missed keepalive, extending the window");
                Some(Duration::from_millis(KEEPALIVE_FIRST_MISS_GRACE_MS))
            }
            LivenessVerdict::Miss { first: false } => {
                warn!("missed keepalive: {}", self.liveness.missed());
                None
            }
            LivenessVerdict::Dead => {
                error!("peer keepalive failed");
                self.set_error(RdmaError::PeerUnreachable);
                if let Err(err) = self.backend.set_qp_error(Link::Remote) {
                    error!("failed to force the queue pair into error: {}", err);
                }
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_keepalive(&mut self, value: u64) {
        *self.keepalive_value = value;
    }
}

/// The pair of keepalive timer file descriptors, to be registered with
/// the embedder's event loop.
pub struct KeepaliveTimers {
    sender: TimerFd,
    watcher: TimerFd,
}

impl KeepaliveTimers {
    pub fn new() -> std::io::Result<KeepaliveTimers> {
        Ok(KeepaliveTimers {
            sender: TimerFd::new()?,
            watcher: TimerFd::new()?,
        })
    }

    /// Arms both timers at the keepalive interval.
    pub fn start(&mut self) {
        arm(&mut self.sender, Duration::from_millis(KEEPALIVE_INTERVAL_MS));
        arm(&mut self.watcher, Duration::from_millis(KEEPALIVE_INTERVAL_MS));
    }

    pub fn sender_fd(&self) -> RawFd {
        self.sender.as_raw_fd()
    }

    pub fn watcher_fd(&self) -> RawFd {
        self.watcher.as_raw_fd()
    }

    /// Handles an expiry of the sender timer.
    pub fn on_sender_event<B: IbBackend>(&mut self, transport: &mut RdmaTransport<B>) {
        self.sender.read();
        transport.keepalive_tick();
        arm(&mut self.sender, Duration::from_millis(KEEPALIVE_INTERVAL_MS));
    }

    /// Handles an expiry of the watcher timer.
    pub fn on_watcher_event<B: IbBackend>(&mut self, transport: &mut RdmaTransport<B>) {
        self.watcher.read();
        let extra = transport.liveness_tick().unwrap_or(Duration::ZERO);
        arm(
            &mut self.watcher,
            Duration::from_millis(KEEPALIVE_INTERVAL_MS) + extra,
        );
    }
}

fn arm(timer: &mut TimerFd, interval: Duration) {
    timer.set_state(TimerState::Oneshot(interval), SetTimeFlags::Default);
}

#[cfg(test)]
mod tests {
    use checkpoint::hypervisor::RamBlockInfo;

    use super::*;
    use crate::testing::MockBackend;
    use crate::TransportOptions;

    fn transport() -> RdmaTransport<MockBackend> {
        let mut transport =
            RdmaTransport::new(MockBackend::new(), true, TransportOptions::default()).unwrap();
        transport
            .seed_ram_blocks(&[RamBlockInfo {
                host_addr: 0x1000,
                offset: 0,
                len: 4096,
            }])
            .unwrap();
        transport.set_peer_keepalive(0xAB, 0xDEAD_0000);
        transport
    }

    #[test]
    fn test_monitor_requires_startup_before_failing() {
        let mut monitor = LivenessMonitor::default();
        // The counter never moves; up to 100 observations stay in the
        // startup grace.
        for _ in 0..(MAX_STARTUP_MISSED_KEEPALIVE - 1) {
            assert_eq!(monitor.observe(0), LivenessVerdict::StartupWait);
        }
        assert_eq!(monitor.observe(0), LivenessVerdict::StartupWait);
        // Startup grace exhausted; misses now count for real.
        assert_eq!(monitor.observe(0), LivenessVerdict::Dead);
    }

    #[test]
    fn test_monitor_misses_then_recovery() {
        let mut monitor = LivenessMonitor::default();
        assert_eq!(monitor.observe(1), LivenessVerdict::Healthy);

        assert_eq!(monitor.observe(1), LivenessVerdict::Miss { first: true });
        for _ in 0..8 {
            assert_eq!(monitor.observe(1), LivenessVerdict::Miss { first: false });
        }
        assert_eq!(monitor.missed(), 9);

        // The link comes back inside the window: no state change.
        assert_eq!(monitor.observe(2), LivenessVerdict::Healthy);
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.observe(3), LivenessVerdict::Healthy);
    }

    #[test]
    fn test_monitor_dies_after_threshold() {
        let mut monitor = LivenessMonitor::default();
        monitor.observe(1);
        for _ in 0..MAX_LOST_KEEPALIVE {
            assert!(matches!(monitor.observe(1), LivenessVerdict::Miss { .. }));
        }
        assert_eq!(monitor.observe(1), LivenessVerdict::Dead);
    }

    #[test]
    fn test_sender_posts_unsignaled_counter_writes() {
        let mut transport = transport();
        transport.keepalive_tick();
        transport.keepalive_tick();

        assert_eq!(transport.backend.writes.len(), 2);
        let (link, request) = &transport.backend.writes[1];
        assert_eq!(*link, Link::Remote);
        assert_eq!(request.wr_id, WorkRequestId::KEEPALIVE);
        assert_eq!(request.remote_addr, 0xDEAD_0000);
        assert_eq!(request.rkey, 0xAB);
        assert!(!request.signaled);
        assert_eq!(*transport.next_keepalive, 2);
    }

    #[test]
    fn test_sender_defers_on_full_queue() {
        let mut transport = transport();
        transport.backend.fail_post_writes = 1;
        transport.keepalive_tick();
        assert!(transport.backend.writes.is_empty());
        assert!(transport.error_state().is_none());

        transport.keepalive_tick();
        assert_eq!(transport.backend.writes.len(), 1);
    }

    #[test]
    fn test_watcher_kills_qp_after_misses() {
        let mut transport = transport();
        transport.inject_keepalive(5);
        assert_eq!(transport.liveness_tick(), None);

        // First miss asks for the grace window.
        assert_eq!(
            transport.liveness_tick(),
            Some(Duration::from_millis(KEEPALIVE_FIRST_MISS_GRACE_MS))
        );
        for _ in 0..(MAX_LOST_KEEPALIVE - 1) {
            assert_eq!(transport.liveness_tick(), None);
        }
        assert!(transport.error_state().is_none());

        // The 11th consecutive miss is fatal.
        transport.liveness_tick();
        assert_eq!(
            transport.error_state(),
            Some(&RdmaError::PeerUnreachable)
        );
        assert_eq!(transport.backend.qp_errors, vec![Link::Remote]);

        // Subsequent ticks are inert.
        assert_eq!(transport.liveness_tick(), None);
    }

    #[test]
    fn test_watcher_recovers_within_window() {
        let mut transport = transport();
        transport.inject_keepalive(1);
        transport.liveness_tick();
        for _ in 0..5 {
            transport.liveness_tick();
        }
        transport.inject_keepalive(2);
        assert_eq!(transport.liveness_tick(), None);
        assert!(transport.error_state().is_none());
        assert_eq!(transport.liveness.missed(), 0);
    }
}
