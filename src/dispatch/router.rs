// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sharded fan-out over dispatch channels.
//!
//! Connections hash onto a power-of-two number of independent shards, so
//! the per-shard maps and ready sets never contend across shards. A
//! connection is pinned to its shard for its whole lifetime.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::lease::BufferLease,
    connection::connection::Connection,
    dispatch::channel::{
        DispatchChannel, DispatchMetrics, DispatchOptions, MetricsSnapshot,
    },
};

/// Fibonacci multiplier; spreads sequential connection ids across shards.
const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

pub struct DispatchRouter {
    shards: Vec<DispatchChannel>,
    mask: u64,
    cursor: AtomicUsize,
    metrics: Arc<DispatchMetrics>,
    notify: Arc<Notify>,
}

impl DispatchRouter {
    /// `shard_count` is rounded up to a power of two (min 1). All shards
    /// share one metrics block and one wake signal.
    pub fn new(shard_count: u32, opts: DispatchOptions, enable_metrics: bool) -> Self {
        let count = shard_count.max(1).next_power_of_two() as usize;
        let metrics = Arc::new(DispatchMetrics::new(enable_metrics));
        let notify = Arc::new(Notify::new());

        let shards = (0..count)
            .map(|_| {
                DispatchChannel::new(opts, Arc::clone(&metrics), Arc::clone(&notify))
            })
            .collect();

        Self {
            shards,
            mask: (count - 1) as u64,
            cursor: AtomicUsize::new(0),
            metrics,
            notify,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_for(&self, conn_id: u64) -> &DispatchChannel {
        let h = conn_id.wrapping_mul(HASH_MULTIPLIER) >> 32;
        &self.shards[(h & self.mask) as usize]
    }

    /// Route a lease to its connection's shard.
    pub async fn push(&self, conn: &Arc<Connection>, lease: BufferLease) {
        self.shard_for(conn.id()).push(conn, lease).await;
    }

    /// Round-robin the shards once, returning the first ready lease.
    pub fn try_pull(&self) -> Option<(Arc<Connection>, BufferLease)> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let n = self.shards.len();
        for i in 0..n {
            if let Some(found) = self.shards[(start + i) & self.mask as usize].try_pull()
            {
                return Some(found);
            }
        }
        None
    }

    /// Pull from any shard, suspending until work arrives or `cancel`
    /// fires.
    pub async fn pull(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(Arc<Connection>, BufferLease)> {
        loop {
            if let Some(found) = self.try_pull() {
                return Some(found);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {},
            }
        }
    }

    /// Drop a closed connection from its shard, draining queued leases.
    pub fn unregister(&self, conn_id: u64) -> usize {
        self.shard_for(conn_id).unregister(conn_id)
    }

    /// Approximate queued-lease count of one connection.
    pub fn pending_for(&self, conn_id: u64) -> i32 {
        self.shard_for(conn_id).pending_for(conn_id)
    }

    /// Best-effort snapshot summed across shards.
    pub fn total_packets(&self) -> i64 {
        self.shards.iter().map(|s| i64::from(s.total_packets())).sum()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }
}
