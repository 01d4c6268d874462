// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the external collaborators: a scripted hypervisor, a
//! recording traffic shaper and an in-memory control stream.

use std::io;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::hypervisor::{Hypervisor, HypervisorError, NicInfo, RamBlockInfo};
use crate::netbuf::TrafficShaper;
use crate::stream::{StateSink, StateSource};

/// A hypervisor double. Saved state is a length-prefixed copy of
/// `payload`; loaded checkpoints are collected in `loaded`.
#[derive(Debug, Default)]
pub struct TestHypervisor {
    /// Bytes serialized on every checkpoint.
    pub payload: Vec<u8>,
    /// Injects a failure into `save_state_begin`.
    pub fail_save: bool,
    /// Whether the guest is currently paused.
    pub paused: bool,
    /// Number of pause calls observed.
    pub pause_count: u32,
    /// Number of resume calls observed.
    pub resume_count: u32,
    /// Checkpoint payloads applied through `load_state`.
    pub loaded: Vec<Vec<u8>>,
    /// NICs reported to the traffic-buffer controller.
    pub nic_list: Vec<NicInfo>,
    /// RAM blocks reported to the transport.
    pub block_list: Vec<RamBlockInfo>,
}

impl TestHypervisor {
    pub fn new(payload: Vec<u8>) -> TestHypervisor {
        TestHypervisor {
            payload,
            nic_list: vec![NicInfo {
                name: "net0".to_string(),
                peer_device: Some("tap0".to_string()),
            }],
            ..Default::default()
        }
    }
}

impl Hypervisor for TestHypervisor {
    fn pause(&mut self) -> Result<(), HypervisorError> {
        if self.paused {
            return Err(HypervisorError::Pause("already paused".to_string()));
        }
        self.paused = true;
        self.pause_count += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), HypervisorError> {
        if !self.paused {
            return Err(HypervisorError::Resume("not paused".to_string()));
        }
        self.paused = false;
        self.resume_count += 1;
        Ok(())
    }

    fn save_state_begin(&mut self, sink: &mut dyn StateSink) -> Result<(), HypervisorError> {
        if self.fail_save {
            return Err(HypervisorError::SaveState(io::Error::new(
                io::ErrorKind::Other,
                "injected save failure",
            )));
        }
        let mut header = [0u8; 4];
        utils::byte_order::write_be_u32(&mut header, self.payload.len() as u32);
        sink.write_all(&header)
            .map_err(HypervisorError::SaveState)
    }

    fn save_state_complete(&mut self, sink: &mut dyn StateSink) -> Result<(), HypervisorError> {
        sink.write_all(&self.payload)
            .map_err(HypervisorError::SaveState)
    }

    fn load_state(&mut self, source: &mut dyn StateSource) -> Result<(), HypervisorError> {
        let mut header = [0u8; 4];
        source
            .read_exact(&mut header)
            .map_err(HypervisorError::LoadState)?;
        let len = utils::byte_order::read_be_u32(&header) as usize;
        let mut payload = vec![0u8; len];
        source
            .read_exact(&mut payload)
            .map_err(HypervisorError::LoadState)?;
        self.loaded.push(payload);
        Ok(())
    }

    fn nics(&self) -> Vec<NicInfo> {
        self.nic_list.clone()
    }

    fn ram_blocks(&self) -> Vec<RamBlockInfo> {
        self.block_list.clone()
    }
}

/// Shared view of the operations a [`FakeShaper`] performed.
#[derive(Debug, Clone, Default)]
pub struct ShaperLog(Arc<Mutex<Vec<String>>>);

impl ShaperLog {
    pub fn ops(&self) -> Vec<String> {
        self.0.lock().expect("Poisoned lock").clone()
    }

    fn push(&self, op: String) {
        self.0.lock().expect("Poisoned lock").push(op);
    }
}

/// A traffic shaper that records operations and can inject failures.
#[derive(Debug, Default)]
pub struct FakeShaper {
    log: ShaperLog,
    fail_barrier: Arc<AtomicBool>,
}

impl FakeShaper {
    pub fn new() -> FakeShaper {
        FakeShaper::default()
    }

    /// A handle for inspecting the recorded operations.
    pub fn log(&self) -> ShaperLog {
        self.log.clone()
    }

    /// Makes the next `insert_barrier` fail.
    pub fn fail_next_barrier(&self) {
        self.fail_barrier.store(true, Ordering::SeqCst);
    }
}

impl TrafficShaper for FakeShaper {
    fn create_plug(&mut self, device: &str) -> io::Result<()> {
        self.log.push(format!("create:{}", device));
        Ok(())
    }

    fn set_limit(&mut self, bytes: u32) -> io::Result<()> {
        self.log.push(format!("limit:{}", bytes));
        Ok(())
    }

    fn insert_barrier(&mut self) -> io::Result<()> {
        if self.fail_barrier.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected qdisc failure"));
        }
        self.log.push("barrier".to_string());
        Ok(())
    }

    fn release_one(&mut self) -> io::Result<()> {
        self.log.push("release-one".to_string());
        Ok(())
    }

    fn release_indefinite(&mut self) -> io::Result<()> {
        self.log.push("release-indefinite".to_string());
        Ok(())
    }

    fn destroy(&mut self) -> io::Result<()> {
        self.log.push("destroy".to_string());
        Ok(())
    }
}

/// A scripted `Read + Write` stream: reads consume a canned input, writes
/// accumulate into `output`.
#[derive(Debug)]
pub struct Pipe {
    input: io::Cursor<Vec<u8>>,
    /// Everything written so far.
    pub output: Vec<u8>,
}

impl Pipe {
    pub fn new(input: Vec<u8>) -> Pipe {
        Pipe {
            input: io::Cursor::new(input),
            output: Vec::new(),
        }
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
