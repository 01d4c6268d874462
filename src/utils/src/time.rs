// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Constant to convert seconds to nanoseconds.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
/// Constant to convert milliseconds to nanoseconds.
pub const NANOS_PER_MILLISECOND: u64 = 1_000_000;

/// Wrapper over `libc::clockid_t` to specify a Linux kernel clock source.
#[derive(Debug, Clone, Copy)]
pub enum ClockType {
    /// Equivalent to `libc::CLOCK_MONOTONIC`.
    Monotonic,
    /// Equivalent to `libc::CLOCK_REALTIME`.
    Real,
}

impl From<ClockType> for libc::clockid_t {
    fn from(clock_type: ClockType) -> Self {
        match clock_type {
            ClockType::Monotonic => libc::CLOCK_MONOTONIC,
            ClockType::Real => libc::CLOCK_REALTIME,
        }
    }
}

fn get_time_ns(clock_type: ClockType) -> u64 {
    let mut time_struct = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: the clock id is valid and the timespec is a local out-param.
    unsafe { libc::clock_gettime(clock_type.into(), &mut time_struct) };
    (time_struct.tv_sec as u64) * NANOS_PER_SECOND + (time_struct.tv_nsec as u64)
}

/// Returns a timestamp in milliseconds based on the provided clock type.
pub fn get_time_ms(clock_type: ClockType) -> u64 {
    get_time_ns(clock_type) / NANOS_PER_MILLISECOND
}

/// Returns a timestamp in microseconds based on the provided clock type.
pub fn get_time_us(clock_type: ClockType) -> u64 {
    get_time_ns(clock_type) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_time() {
        for clock in &[ClockType::Monotonic, ClockType::Real] {
            let t1 = get_time_ms(*clock);
            let t2 = get_time_ms(*clock);
            assert!(t2 >= t1);
        }

        let us = get_time_us(ClockType::Monotonic);
        let ms = get_time_ms(ClockType::Monotonic);
        assert!(ms <= us / 1000 + 1);
    }
}
