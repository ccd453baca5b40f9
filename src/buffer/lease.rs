// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Exclusive lease over a rented buffer.
//!
//! A [`BufferLease`] is how packet bytes travel from the framed channel
//! through the dispatch queues to a handler: one owner at a time, and the
//! underlying buffer goes back to its pool exactly once: explicitly via
//! [`BufferLease::release`], or on drop as a backstop.

use std::sync::Arc;

use crate::buffer::pool::BufferPool;

/// A borrowed, exclusively owned byte window `[offset, offset + length)`
/// over a pooled buffer.
pub struct BufferLease {
    buf: Option<Vec<u8>>,
    offset: usize,
    length: usize,
    pool: Arc<BufferPool>,
}

impl BufferLease {
    /// Wrap a rented buffer. The lease takes over the give-back duty.
    ///
    /// The window must lie inside the buffer.
    pub fn take_ownership(
        pool: &Arc<BufferPool>,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
    ) -> Self {
        assert!(
            offset.checked_add(length).is_some_and(|end| end <= buf.len()),
            "lease window [{offset}, {offset}+{length}) outside buffer of {}",
            buf.len()
        );
        Self { buf: Some(buf), offset, length, pool: Arc::clone(pool) }
    }

    /// Copy `bytes` into a freshly rented buffer and lease the copy.
    /// Used by the UDP path, which receives into a long-lived scratch
    /// buffer it cannot hand out.
    pub fn copied_from(pool: &Arc<BufferPool>, bytes: &[u8]) -> Self {
        let mut buf = pool.rent(bytes.len().max(1));
        buf[..bytes.len()].copy_from_slice(bytes);
        Self::take_ownership(pool, buf, 0, bytes.len())
    }

    /// The leased window. Empty once released.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[self.offset..self.offset + self.length],
            None => &[],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.buf.is_some() { self.length } else { 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the underlying buffer to its pool. Idempotent.
    pub fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("released", &self.buf.is_none())
            .finish()
    }
}
