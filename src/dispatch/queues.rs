// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection priority lanes and their approximate counters.
//!
//! Five lock-free MPMC FIFOs, one per priority level. The counters are
//! bumped by the dispatch channel around each queue operation and are
//! allowed to be transiently off by one; correctness decisions always read
//! the queues themselves.

use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_queue::SegQueue;

use crate::{buffer::lease::BufferLease, packet::priority::PRIORITY_LEVELS};

/// The five per-priority FIFOs of one connection.
pub struct PriorityLanes {
    lanes: [SegQueue<BufferLease>; PRIORITY_LEVELS],
}

impl Default for PriorityLanes {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityLanes {
    pub fn new() -> Self {
        Self { lanes: std::array::from_fn(|_| SegQueue::new()) }
    }

    #[inline]
    pub fn enqueue(&self, priority: usize, lease: BufferLease) {
        self.lanes[priority].push(lease);
    }

    #[inline]
    pub fn try_dequeue(&self, priority: usize) -> Option<BufferLease> {
        self.lanes[priority].pop()
    }

    #[inline]
    pub fn is_empty(&self, priority: usize) -> bool {
        self.lanes[priority].is_empty()
    }

    /// Highest priority lane that currently holds a lease.
    pub fn highest_non_empty(&self) -> Option<usize> {
        (0..PRIORITY_LEVELS).rev().find(|&p| !self.lanes[p].is_empty())
    }

    /// Pop everything from every lane, releasing each lease. Returns the
    /// number drained.
    pub fn drain_all(&self) -> usize {
        let mut drained = 0;
        for lane in &self.lanes {
            while let Some(mut lease) = lane.pop() {
                lease.release();
                drained += 1;
            }
        }
        drained
    }
}

/// Approximate queue-depth counters of one connection.
///
/// `i32` on purpose: racing bump/unbump may briefly push a reading below
/// zero, which an unsigned type would turn into a wild value.
#[derive(Default)]
pub struct ApproxCounters {
    total: AtomicI32,
    by_priority: [AtomicI32; PRIORITY_LEVELS],
}

impl ApproxCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn total(&self) -> i32 {
        self.total.load(Ordering::Acquire)
    }

    #[inline]
    pub fn at(&self, priority: usize) -> i32 {
        self.by_priority[priority].load(Ordering::Acquire)
    }

    #[inline]
    pub fn bump(&self, priority: usize) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.by_priority[priority].fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn unbump(&self, priority: usize) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.by_priority[priority].fetch_sub(1, Ordering::AcqRel);
    }
}
