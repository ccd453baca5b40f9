// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Size-bucketed byte-buffer pool.
//!
//! Every bucket keeps a lock-free freelist of fixed-size buffers. `rent`
//! never fails: requests above the largest bucket fall through to a plain
//! allocation, and such buffers are simply dropped on return instead of
//! being retained.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

/// Bucket sizes, smallest first. The largest matches the frame limit so a
/// maximum-size frame always fits a pooled buffer.
const BUCKET_SIZES: [usize; 5] = [256, 1024, 4096, 16384, 65536];

/// Upper bound on idle buffers retained per bucket; give-backs beyond it
/// are dropped to keep the pool's footprint bounded.
const MAX_RETAINED: usize = 256;

struct Bucket {
    size: usize,
    free: SegQueue<Vec<u8>>,
    idle: AtomicUsize,
}

impl Bucket {
    fn new(size: usize) -> Self {
        Self { size, free: SegQueue::new(), idle: AtomicUsize::new(0) }
    }
}

/// Shared pool of reusable byte buffers.
///
/// Rented buffers always come back with `len() == bucket size`; holders
/// index into them and must not truncate. Ownership between `rent` and
/// `give_back` is exclusive and usually carried by a
/// [`BufferLease`](crate::buffer::lease::BufferLease).
pub struct BufferPool {
    buckets: [Bucket; BUCKET_SIZES.len()],
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self { buckets: BUCKET_SIZES.map(Bucket::new) }
    }

    /// Rent a buffer with `len() >= min_bytes`. Never fails.
    pub fn rent(&self, min_bytes: usize) -> Vec<u8> {
        for bucket in &self.buckets {
            if bucket.size >= min_bytes {
                if let Some(buf) = bucket.free.pop() {
                    bucket.idle.fetch_sub(1, Ordering::Relaxed);
                    return buf;
                }
                return vec![0u8; bucket.size];
            }
        }
        // Above the largest bucket: plain allocation, not retained.
        vec![0u8; min_bytes]
    }

    /// Return a rented buffer to its bucket. Callers must not touch the
    /// buffer afterwards. Oversized or over-quota buffers are dropped.
    pub fn give_back(&self, buf: Vec<u8>) {
        let len = buf.len();
        for bucket in &self.buckets {
            if bucket.size == len {
                if bucket.idle.load(Ordering::Relaxed) < MAX_RETAINED {
                    bucket.idle.fetch_add(1, Ordering::Relaxed);
                    bucket.free.push(buf);
                }
                return;
            }
        }
    }

    /// Idle buffers currently parked across all buckets.
    pub fn idle_buffers(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.idle.load(Ordering::Relaxed))
            .sum()
    }
}
