// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::DropPolicy;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ServerConfig {
    /// Socket-level parameters for the TCP and UDP listeners.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Accept-pipeline concurrency and per-IP admission limits.
    #[serde(default)]
    pub accept: AcceptConfig,
    /// Dispatch-channel sizing, backpressure and handler-runtime knobs.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Listener socket configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(rename = "Port")]
    /// TCP listen port.
    pub port: u16,

    #[serde(default, rename = "UdpPort")]
    /// Optional UDP listen port; the UDP listener only starts when set.
    pub udp_port: Option<u16>,

    #[serde(rename = "BufferSize")]
    /// Per-socket send/receive buffer size in bytes.
    pub buffer_size: i32,

    #[serde(rename = "NoDelay")]
    /// Disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,

    #[serde(rename = "KeepAlive")]
    /// Enable TCP keepalive on accepted sockets.
    pub keep_alive: bool,

    #[serde(rename = "ReuseAddress")]
    /// Set SO_REUSEADDR before binding.
    pub reuse_address: bool,

    #[serde(rename = "Backlog")]
    /// Listen backlog; normalized to at least 100.
    pub backlog: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7777,
            udp_port: None,
            buffer_size: 64 * 1024,
            no_delay: true,
            keep_alive: true,
            reuse_address: true,
            backlog: 128,
        }
    }
}

/// Accept pipeline and rate-limiter configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AcceptConfig {
    #[serde(rename = "MaxParallel")]
    /// Number of concurrent accept loops.
    pub max_parallel: i32,

    #[serde(rename = "MaxConnectionsPerIp")]
    /// Cap on simultaneously open connections from one remote address.
    pub max_connections_per_ip: u32,

    #[serde(rename = "ConnectionAllowance")]
    /// Token-bucket burst: connection attempts allowed per window.
    pub connection_allowance: u32,

    #[serde(rename = "AllowanceWindow", with = "serde_secs")]
    /// Refill window for the token bucket.
    pub allowance_window: Duration,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            max_connections_per_ip: 32,
            connection_allowance: 16,
            allowance_window: Duration::from_secs(10),
        }
    }
}

/// Dispatch-channel and handler-runtime configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DispatchConfig {
    #[serde(rename = "MaxPerConnectionQueue")]
    /// Queued-lease cap per connection; 0 means unbounded.
    pub max_per_connection_queue: i32,

    #[serde(rename = "DropPolicy")]
    /// Reaction to a full per-connection queue.
    pub drop_policy: DropPolicy,

    #[serde(rename = "MaxGroupConcurrency")]
    /// Pull-worker count (also the UDP worker-group size).
    pub max_group_concurrency: i32,

    #[serde(rename = "ShardCount")]
    /// Requested dispatch shards; normalized up to a power of two.
    pub shard_count: u32,

    #[serde(rename = "Timeout", with = "serde_secs")]
    /// Packet expiry age; zero disables expiry.
    pub timeout: Duration,

    #[serde(rename = "EnableMetrics")]
    /// Record per-priority dispatch counters.
    pub enable_metrics: bool,

    #[serde(rename = "EnableValidation")]
    /// Verify payload checksums on deserialization.
    pub enable_validation: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_per_connection_queue: 0,
            drop_policy: DropPolicy::DropNewest,
            max_group_concurrency: 4,
            shard_count: 4,
            timeout: Duration::ZERO,
            enable_metrics: true,
            enable_validation: true,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: ServerConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        // Port 0 is allowed: the OS assigns an ephemeral port and the
        // listener reports the resolved address.
        ensure!(self.transport.buffer_size > 0, "BufferSize must be > 0");
        if self.transport.backlog < 100 {
            self.transport.backlog = 100;
        }

        ensure!(self.accept.max_parallel >= 1, "MaxParallel must be >= 1");
        ensure!(
            self.accept.connection_allowance >= 1,
            "ConnectionAllowance must be >= 1"
        );
        ensure!(
            !self.accept.allowance_window.is_zero(),
            "AllowanceWindow must be > 0"
        );

        ensure!(
            self.dispatch.max_per_connection_queue >= 0,
            "MaxPerConnectionQueue must be >= 0 (0 disables the cap)"
        );
        ensure!(
            self.dispatch.max_group_concurrency >= 1,
            "MaxGroupConcurrency must be >= 1"
        );
        ensure!(self.dispatch.shard_count >= 1, "ShardCount must be >= 1");
        self.dispatch.shard_count = self.dispatch.shard_count.next_power_of_two();

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
