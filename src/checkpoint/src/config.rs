// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint cadence and buffering configuration.

use serde::{Deserialize, Serialize};

use crate::netbuf::{DEFAULT_BUFFER_NIC_PREFIX, DEFAULT_NIC_PREFIX};

/// Default checkpoint period.
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 100;
/// Default number of seconds' worth of checkpoints to observe before
/// re-evaluating the staging-memory size.
pub const DEFAULT_SHRINK_WINDOW_SECS: u64 = 10;
/// Default network buffer limit in bytes.
pub const DEFAULT_NET_BUFFER_BYTES: u32 = 1_000_000_000 / 8;

/// Errors validating a [`CheckpointConfig`].
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ConfigError {
    /// The checkpoint interval cannot be zero
    ZeroInterval,
    /// The staging shrink window cannot be zero
    ZeroShrinkWindow,
    /// The network buffer size cannot be zero
    ZeroNetBuffer,
}

/// Tunables of the checkpoint loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Checkpoint period in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Seconds' worth of under-filled checkpoints tolerated before the
    /// staging memory shrinks.
    #[serde(default = "default_shrink_window_secs")]
    pub shrink_window_secs: u64,
    /// Byte limit of the network buffering qdisc.
    #[serde(default = "default_net_buffer_bytes")]
    pub net_buffer_bytes: u32,
    /// Expected prefix of the buffered NIC's host peer device.
    #[serde(default = "default_nic_prefix")]
    pub nic_prefix: String,
    /// Prefix of the derived buffer device.
    #[serde(default = "default_buffer_nic_prefix")]
    pub buffer_nic_prefix: String,
}

fn default_interval_ms() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL_MS
}

fn default_shrink_window_secs() -> u64 {
    DEFAULT_SHRINK_WINDOW_SECS
}

fn default_net_buffer_bytes() -> u32 {
    DEFAULT_NET_BUFFER_BYTES
}

fn default_nic_prefix() -> String {
    DEFAULT_NIC_PREFIX.to_string()
}

fn default_buffer_nic_prefix() -> String {
    DEFAULT_BUFFER_NIC_PREFIX.to_string()
}

impl Default for CheckpointConfig {
    fn default() -> CheckpointConfig {
        CheckpointConfig {
            interval_ms: default_interval_ms(),
            shrink_window_secs: default_shrink_window_secs(),
            net_buffer_bytes: default_net_buffer_bytes(),
            nic_prefix: default_nic_prefix(),
            buffer_nic_prefix: default_buffer_nic_prefix(),
        }
    }
}

impl CheckpointConfig {
    /// Checks the configuration for nonsensical values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.shrink_window_secs == 0 {
            return Err(ConfigError::ZeroShrinkWindow);
        }
        if self.net_buffer_bytes == 0 {
            return Err(ConfigError::ZeroNetBuffer);
        }
        Ok(())
    }

    /// Number of under-filled checkpoints after which the staging memory
    /// shrinks: the shrink window expressed in checkpoints.
    pub fn max_strikes(&self) -> u32 {
        std::cmp::max(1, (self.shrink_window_secs * 1000 / self.interval_ms) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CheckpointConfig::default();
        assert_eq!(config.interval_ms, 100);
        assert_eq!(config.shrink_window_secs, 10);
        assert_eq!(config.net_buffer_bytes, 125_000_000);
        assert_eq!(config.nic_prefix, "tap");
        assert_eq!(config.buffer_nic_prefix, "ifb");
        config.validate().unwrap();
        // 10 s of 100 ms checkpoints.
        assert_eq!(config.max_strikes(), 100);
    }

    #[test]
    fn test_validation() {
        let mut config = CheckpointConfig {
            interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroInterval));
        config.interval_ms = 50;
        config.shrink_window_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroShrinkWindow));
        config.shrink_window_secs = 1;
        config.net_buffer_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroNetBuffer));
    }

    #[test]
    fn test_deserialization() {
        let json = r#"{
            "interval_ms": 50,
            "shrink_window_secs": 5
        }"#;
        let config: CheckpointConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.interval_ms, 50);
        assert_eq!(config.shrink_window_secs, 5);
        assert_eq!(config.net_buffer_bytes, DEFAULT_NET_BUFFER_BYTES);
        assert_eq!(config.max_strikes(), 100);

        let err = serde_json::from_str::<CheckpointConfig>(r#"{"bogus": 1}"#);
        assert!(err.is_err());
    }
}
