// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ready-set dispatch channel.
//!
//! The channel answers one question in O(1): *which connection has data,
//! highest priority first?* Per-connection lanes hold the leases; the
//! ready queues hold connection ids, at most one occurrence per
//! connection, tracked by the `in_ready` membership set.
//!
//! Liveness invariant: a connection with at least one queued lease is
//! either present in exactly one ready queue (and in `in_ready`), or an
//! in-flight pull is about to re-enqueue it. Push inserts into the ready
//! set only after the lease is visible in a lane; pull re-enqueues before
//! returning whenever residual work remains. Either side may observe a
//! stale ready entry (popped id whose lanes race empty); those are
//! skipped, never returned.

use std::sync::{
    Arc,
    atomic::{AtomicI32, AtomicU64, Ordering},
};

use crossbeam_queue::SegQueue;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    buffer::lease::BufferLease,
    cfg::enums::DropPolicy,
    connection::connection::Connection,
    dispatch::queues::{ApproxCounters, PriorityLanes},
    packet::priority::{PRIORITY_LEVELS, classify_priority_index},
};

/// Spins between cooperative yields while `BLOCK` waits for room.
const BLOCK_SPIN_BUDGET: u32 = 64;

/// Sizing and backpressure knobs of one dispatch channel (shared verbatim
/// by every shard of a router).
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Queued-lease cap per connection; 0 disables the cap.
    pub max_per_connection: i32,
    pub policy: DropPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { max_per_connection: 0, policy: DropPolicy::DropNewest }
    }
}

/// Per-priority dispatch counters. All methods are no-ops when disabled.
pub struct DispatchMetrics {
    enabled: bool,
    enqueued: [AtomicU64; PRIORITY_LEVELS],
    dequeued: [AtomicU64; PRIORITY_LEVELS],
    expired: [AtomicU64; PRIORITY_LEVELS],
    rejected: [AtomicU64; PRIORITY_LEVELS],
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: [u64; PRIORITY_LEVELS],
    pub dequeued: [u64; PRIORITY_LEVELS],
    pub expired: [u64; PRIORITY_LEVELS],
    pub rejected: [u64; PRIORITY_LEVELS],
}

impl DispatchMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            enqueued: Default::default(),
            dequeued: Default::default(),
            expired: Default::default(),
            rejected: Default::default(),
        }
    }

    #[inline]
    pub fn record_enqueued(&self, priority: usize) {
        if self.enabled {
            self.enqueued[priority].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_dequeued(&self, priority: usize) {
        if self.enabled {
            self.dequeued[priority].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_expired(&self, priority: usize) {
        if self.enabled {
            self.expired[priority].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_rejected(&self, priority: usize) {
        if self.enabled {
            self.rejected[priority].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |arr: &[AtomicU64; PRIORITY_LEVELS]| {
            std::array::from_fn(|i| arr[i].load(Ordering::Relaxed))
        };
        MetricsSnapshot {
            enqueued: load(&self.enqueued),
            dequeued: load(&self.dequeued),
            expired: load(&self.expired),
            rejected: load(&self.rejected),
        }
    }
}

struct ConnEntry {
    conn: Arc<Connection>,
    lanes: PriorityLanes,
    counters: ApproxCounters,
}

impl ConnEntry {
    fn new(conn: Arc<Connection>) -> Self {
        Self { conn, lanes: PriorityLanes::new(), counters: ApproxCounters::new() }
    }
}

/// One dispatch shard: per-connection lanes plus the ready set.
pub struct DispatchChannel {
    entries: DashMap<u64, Arc<ConnEntry>>,
    ready: [SegQueue<u64>; PRIORITY_LEVELS],
    in_ready: DashSet<u64>,
    total_packets: AtomicI32,
    opts: DispatchOptions,
    metrics: Arc<DispatchMetrics>,
    notify: Arc<Notify>,
}

impl DispatchChannel {
    pub fn new(
        opts: DispatchOptions,
        metrics: Arc<DispatchMetrics>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            ready: std::array::from_fn(|_| SegQueue::new()),
            in_ready: DashSet::new(),
            total_packets: AtomicI32::new(0),
            opts,
            metrics,
            notify,
        }
    }

    /// Enqueue a lease for `conn`, classifying priority from the raw
    /// packet bytes. Never fails; backpressure resolves per the configured
    /// policy and surfaces only as metrics.
    pub async fn push(&self, conn: &Arc<Connection>, mut lease: BufferLease) {
        let id = conn.id();
        let priority = classify_priority_index(lease.bytes());

        if conn.is_closed() {
            self.metrics.record_rejected(priority);
            lease.release();
            return;
        }

        let entry = {
            let slot = self
                .entries
                .entry(id)
                .or_insert_with(|| Arc::new(ConnEntry::new(Arc::clone(conn))));
            Arc::clone(&slot)
        };

        let max = self.opts.max_per_connection;
        if max > 0 && entry.counters.total() + 1 > max {
            match self.opts.policy {
                DropPolicy::DropNewest => {
                    self.metrics.record_rejected(priority);
                    lease.release();
                    return;
                },
                DropPolicy::DropOldest | DropPolicy::Coalesce => {
                    if !self.evict_oldest(&entry) {
                        // Nothing to evict (counters raced): drop incoming.
                        self.metrics.record_rejected(priority);
                        lease.release();
                        return;
                    }
                },
                DropPolicy::Block => {
                    let mut spins = 0u32;
                    while entry.counters.total() + 1 > max {
                        if conn.is_closed() || !self.entries.contains_key(&id) {
                            self.metrics.record_rejected(priority);
                            lease.release();
                            return;
                        }
                        spins += 1;
                        if spins.is_multiple_of(BLOCK_SPIN_BUDGET) {
                            tokio::task::yield_now().await;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                },
            }
        }

        // Lease first, ready-set second: a pull that pops the ready entry
        // is guaranteed to find the lease (or a concurrent one).
        entry.lanes.enqueue(priority, lease);
        entry.counters.bump(priority);
        self.total_packets.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_enqueued(priority);

        if self.in_ready.insert(id) {
            self.ready[priority].push(id);
        }
        self.notify.notify_one();
        trace!(conn = id, priority, "lease enqueued");
    }

    /// Evict the oldest queued lease, scanning priorities low to high.
    fn evict_oldest(&self, entry: &ConnEntry) -> bool {
        for q in 0..PRIORITY_LEVELS {
            if let Some(mut old) = entry.lanes.try_dequeue(q) {
                old.release();
                entry.counters.unbump(q);
                self.total_packets.fetch_sub(1, Ordering::AcqRel);
                self.metrics.record_rejected(q);
                return true;
            }
        }
        false
    }

    /// Pull any ready connection's next lease, highest priority first.
    /// Returns `None` when no ready connection yields a usable lease.
    pub fn try_pull(&self) -> Option<(Arc<Connection>, BufferLease)> {
        for p in (0..PRIORITY_LEVELS).rev() {
            while let Some(id) = self.ready[p].pop() {
                self.in_ready.remove(&id);

                // Unregistered between enqueue and now: stale entry.
                let Some(entry) =
                    self.entries.get(&id).map(|e| Arc::clone(&e))
                else {
                    continue;
                };

                // The ready priority is only the ticket's lane. The ticket
                // may be stale both ways: racing pulls can have emptied
                // that lane, and pushes after the ticket was enqueued can
                // have filled a higher one (they skip the ready queue while
                // the connection is already a member). Strict per-connection
                // priority therefore always scans from the top.
                let mut got = None;
                for q in (0..PRIORITY_LEVELS).rev() {
                    if let Some(lease) = entry.lanes.try_dequeue(q) {
                        got = Some((q, lease));
                        break;
                    }
                }
                let Some((q, lease)) = got else {
                    continue;
                };

                entry.counters.unbump(q);
                self.total_packets.fetch_sub(1, Ordering::AcqRel);
                self.metrics.record_dequeued(q);

                // Residual work: put the connection back at its current
                // highest non-empty lane before handing out the lease.
                if let Some(next) = entry.lanes.highest_non_empty()
                    && self.in_ready.insert(id)
                {
                    self.ready[next].push(id);
                    self.notify.notify_one();
                }

                return Some((Arc::clone(&entry.conn), lease));
            }
        }
        None
    }

    /// Pull, suspending until something is ready or `cancel` fires.
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

    /// Remove a connection and drain its lanes, releasing every lease.
    /// Returns the number drained. Ready-queue occurrences become stale
    /// entries that later pulls skip.
    pub fn unregister(&self, id: u64) -> usize {
        let Some((_, entry)) = self.entries.remove(&id) else {
            return 0;
        };
        self.in_ready.remove(&id);

        let drained = entry.lanes.drain_all();
        if drained > 0 {
            self.total_packets.fetch_sub(drained as i32, Ordering::AcqRel);
        }
        trace!(conn = id, drained, "connection unregistered from dispatch");
        drained
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Approximate queued-lease count of one connection; 0 when unknown.
    pub fn pending_for(&self, id: u64) -> i32 {
        self.entries.get(&id).map_or(0, |e| e.counters.total().max(0))
    }

    /// Best-effort global queue depth.
    pub fn total_packets(&self) -> i32 {
        self.total_packets.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }
}
