// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Elastic staging memory for one checkpoint's serialized bytes.
//!
//! Checkpoints are typically only a few MB when the guest is idle but can
//! transiently grow to the size of guest RAM under heavy workloads. The
//! staging area is therefore a chain of identically sized slabs: growth
//! allocates one slab at a time at the tail, and an idle ring shrinks back
//! by halves once enough consecutive under-filled checkpoints ("strikes")
//! have been observed. The head slab is permanently allocated, so a quiet
//! guest causes no allocation at all, and every slab keeps a stable address
//! for the lifetime of the ring — an arrangement that stays pinnable for
//! DMA.

use std::io::{Read, Write};
use std::{cmp, io};

/// Size of one staging slab.
pub const SLAB_BUFFER_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug)]
struct Slab {
    buf: Box<[u8]>,
    /// Bytes filled.
    size: usize,
    /// Bytes consumed by the read cursor.
    read: usize,
}

impl Slab {
    fn new() -> Slab {
        Slab {
            buf: vec![0u8; SLAB_BUFFER_SIZE].into_boxed_slice(),
            size: 0,
            read: 0,
        }
    }

    fn reset(&mut self) {
        self.size = 0;
        self.read = 0;
    }
}

/// An elastic byte-stream staging buffer backed by a chain of fixed-size
/// slabs.
///
/// Slab 0 is the head and is never freed while the ring lives. The shrink
/// policy runs at the start of every checkpoint via
/// [`SlabRing::reset_for_checkpoint`]: a checkpoint that fits in one slab
/// less than currently allocated is a strike, and once the configured
/// number of strikes accumulates, half of the non-head slabs are freed.
#[derive(Debug)]
pub struct SlabRing {
    slabs: Vec<Slab>,
    /// Index of the slab the read or write cursor is on.
    current: usize,
    /// Total valid bytes across the ring.
    slab_total: u64,
    strikes: u32,
    max_strikes: u32,
}

impl SlabRing {
    /// Creates a ring with a single (head) slab.
    ///
    /// `max_strikes` is the number of consecutive under-filled checkpoints
    /// tolerated before the ring is cut in half; derive it from the
    /// checkpoint cadence with [`crate::config::CheckpointConfig::max_strikes`].
    pub fn new(max_strikes: u32) -> SlabRing {
        SlabRing {
            slabs: vec![Slab::new()],
            current: 0,
            slab_total: 0,
            strikes: 0,
            max_strikes,
        }
    }

    /// Number of slabs currently allocated.
    pub fn nb_slabs(&self) -> usize {
        self.slabs.len()
    }

    /// Total valid bytes staged in the ring.
    pub fn slab_total(&self) -> u64 {
        self.slab_total
    }

    #[cfg(test)]
    pub(crate) fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Moves the cursor to the next slab, allocating one at the tail if
    /// none is left, and resets the new slab's fill state.
    fn advance_write(&mut self) {
        if self.current + 1 == self.slabs.len() {
            self.slabs.push(Slab::new());
            log::debug!(
                "staging area extended to {} slabs ({} MB)",
                self.slabs.len(),
                self.slabs.len() * SLAB_BUFFER_SIZE / 1024 / 1024
            );
        }
        self.current += 1;
        self.slabs[self.current].reset();
    }

    /// Appends `data` across the slab chain. Never short-writes; the ring
    /// grows as needed. Returns `data.len()`.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let mut remaining = data;
        while !remaining.is_empty() {
            let slab = &mut self.slabs[self.current];
            let space = SLAB_BUFFER_SIZE - slab.size;
            let take = cmp::min(space, remaining.len());
            slab.buf[slab.size..slab.size + take].copy_from_slice(&remaining[..take]);
            slab.size += take;
            self.slab_total += take as u64;
            remaining = &remaining[take..];
            if !remaining.is_empty() {
                self.advance_write();
            }
        }
        data.len()
    }

    /// Reads up to `buf.len()` bytes starting from the current read cursor,
    /// crossing slab boundaries as needed. Returns the number of bytes
    /// produced. The ring does not track where valid data ends across
    /// checkpoints; callers own the framing of the staged byte stream and
    /// must not read past what they wrote.
    pub fn get(&mut self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            let slab = &mut self.slabs[self.current];
            let avail = slab.size - slab.read;
            let take = cmp::min(avail, buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&slab.buf[slab.read..slab.read + take]);
            slab.read += take;
            self.slab_total = self.slab_total.saturating_sub(take as u64);
            filled += take;
            if filled < buf.len() {
                if self.current + 1 == self.slabs.len() {
                    break;
                }
                self.current += 1;
            }
        }
        filled
    }

    /// Applies the elastic sizing policy, then rewinds the ring so the next
    /// checkpoint starts filling at the head. Invoked once at the start of
    /// every checkpoint.
    pub fn reset_for_checkpoint(&mut self) {
        if self.slabs.len() >= 2 {
            if self.strikes >= self.max_strikes {
                let nb_slabs_to_free = cmp::max(1, (self.slabs.len() - 1) / 2);
                log::debug!(
                    "staging area reached max strikes, freeing {} / {} slabs",
                    nb_slabs_to_free,
                    self.slabs.len()
                );
                for _ in 0..nb_slabs_to_free {
                    self.slabs.pop();
                }
                self.strikes = 0;
            } else if self.slab_total <= ((self.slabs.len() - 1) * SLAB_BUFFER_SIZE) as u64 {
                self.strikes += 1;
            } else if self.strikes != 0 {
                // The previous checkpoint used every slab.
                self.strikes = 0;
            }
        } else if self.strikes != 0 {
            self.strikes = 0;
        }

        self.slab_total = 0;
        self.current = 0;
        self.slabs[0].reset();
    }

    /// Rewinds the read cursor to the head without touching fill state.
    pub fn rewind(&mut self) {
        self.current = 0;
    }

    /// Reads exactly `size` bytes from `src` directly into successive slab
    /// buffers, allocating as needed. The receive path uses this to avoid
    /// an intermediate copy.
    pub fn fill_from<R: Read>(&mut self, src: &mut R, size: u64) -> io::Result<()> {
        let mut received = 0u64;
        while received < size {
            let take = cmp::min(size - received, SLAB_BUFFER_SIZE as u64) as usize;
            let slab = &mut self.slabs[self.current];
            slab.size = take;
            src.read_exact(&mut slab.buf[..take])?;
            self.slab_total += take as u64;
            received += take as u64;
            if received < size {
                self.advance_write();
            }
        }
        Ok(())
    }

    /// Writes every filled slab to `dst`, zeroing each slab's fill state as
    /// it goes out. Returns the number of bytes written.
    pub fn drain_to<W: Write>(&mut self, dst: &mut W) -> io::Result<u64> {
        let mut total = 0u64;
        for slab in self.slabs.iter_mut() {
            if slab.size == 0 {
                break;
            }
            dst.write_all(&slab.buf[..slab.size])?;
            total += slab.size as u64;
            slab.size = 0;
            slab.read = 0;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_put_get_roundtrip_single_slab() {
        let mut ring = SlabRing::new(10);
        let data = pattern(4096);
        assert_eq!(ring.put(&data), 4096);
        assert_eq!(ring.slab_total(), 4096);
        assert_eq!(ring.nb_slabs(), 1);

        ring.rewind();
        let mut out = vec![0u8; 4096];
        assert_eq!(ring.get(&mut out), 4096);
        assert_eq!(out, data);
        assert_eq!(ring.slab_total(), 0);
    }

    #[test]
    fn test_put_get_roundtrip_across_slabs() {
        // 10 MiB crosses at least two 5 MiB slabs.
        let mut ring = SlabRing::new(10);
        let data = pattern(10 * 1024 * 1024);
        ring.put(&data);
        assert!(ring.nb_slabs() >= 2);

        ring.rewind();
        let mut out = vec![0u8; data.len()];
        assert_eq!(ring.get(&mut out), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_get_stops_at_end_of_ring() {
        let mut ring = SlabRing::new(10);
        ring.put(&pattern(100));
        ring.rewind();
        let mut out = vec![0u8; 200];
        // Only 100 bytes were staged; the read stops there.
        assert_eq!(ring.get(&mut out), 100);
    }

    #[test]
    fn test_reset_invariants() {
        let mut ring = SlabRing::new(10);
        ring.put(&pattern(7 * 1024 * 1024));
        ring.reset_for_checkpoint();
        assert!(ring.nb_slabs() >= 1);
        assert_eq!(ring.slab_total(), 0);
        assert_eq!(ring.slabs[0].size, 0);
        assert_eq!(ring.slabs[0].read, 0);
        assert_eq!(ring.current, 0);
    }

    #[test]
    fn test_strikes_accumulate_and_shrink_halves_ring() {
        let max_strikes = 100;
        let mut ring = SlabRing::new(max_strikes);
        // Grow to 5 slabs (21 MiB of data).
        ring.put(&pattern(21 * 1024 * 1024));
        assert_eq!(ring.nb_slabs(), 5);
        ring.reset_for_checkpoint();
        assert_eq!(ring.strikes(), 0);

        // 100 under-filled checkpoints of one byte each.
        for i in 0..max_strikes {
            ring.put(&[0u8]);
            ring.reset_for_checkpoint();
            assert_eq!(ring.strikes(), i + 1);
        }

        // The next reset crosses the threshold: free max(1, (5-1)/2) = 2.
        ring.put(&[0u8]);
        ring.reset_for_checkpoint();
        assert_eq!(ring.nb_slabs(), 3);
        assert_eq!(ring.strikes(), 0);
    }

    #[test]
    fn test_shrink_never_frees_head() {
        let mut ring = SlabRing::new(0);
        ring.put(&pattern(6 * 1024 * 1024));
        assert_eq!(ring.nb_slabs(), 2);
        // max_strikes of zero shrinks on every reset, down to the head.
        ring.reset_for_checkpoint();
        assert_eq!(ring.nb_slabs(), 1);
        ring.reset_for_checkpoint();
        assert_eq!(ring.nb_slabs(), 1);
    }

    #[test]
    fn test_full_ring_resets_strikes() {
        let mut ring = SlabRing::new(100);
        ring.put(&pattern(6 * 1024 * 1024));
        ring.reset_for_checkpoint();
        ring.put(&pattern(1));
        ring.reset_for_checkpoint();
        ring.put(&pattern(1));
        ring.reset_for_checkpoint();
        assert_eq!(ring.strikes(), 2);

        // Fill both slabs completely; the next reset clears the count.
        ring.put(&pattern(2 * SLAB_BUFFER_SIZE));
        ring.reset_for_checkpoint();
        assert_eq!(ring.strikes(), 0);
    }

    #[test]
    fn test_fill_from_and_drain_to() {
        let data = pattern(12 * 1024 * 1024);
        let mut ring = SlabRing::new(10);
        ring.fill_from(&mut Cursor::new(&data), data.len() as u64)
            .unwrap();
        assert_eq!(ring.slab_total(), data.len() as u64);
        assert_eq!(ring.nb_slabs(), 3);

        ring.rewind();
        let mut out = Vec::new();
        assert_eq!(ring.drain_to(&mut out).unwrap(), data.len() as u64);
        assert_eq!(out, data);

        // Draining clears per-slab fill state.
        let mut again = Vec::new();
        assert_eq!(ring.drain_to(&mut again).unwrap(), 0);
    }

    #[test]
    fn test_fill_from_short_source_errors() {
        let mut ring = SlabRing::new(10);
        let res = ring.fill_from(&mut Cursor::new(&[0u8; 16]), 64);
        assert!(res.is_err());
    }
}
