// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection event subscriptions.
//!
//! Each slot holds a copy-on-write list of callbacks: subscribing or
//! removing swaps in a new list, while firing clones the current `Arc` and
//! walks it outside any lock, so a callback may itself subscribe or
//! unsubscribe without deadlocking.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
};

use crate::connection::connection::Connection;

/// Boxed event callback. Receives the connection the event fired on.
pub type EventCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Token returned by [`EventSlot::subscribe`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// One named event with a copy-on-write subscriber list.
#[derive(Default)]
pub struct EventSlot {
    subs: RwLock<Arc<Vec<(u64, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, cb: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.subs.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, cb));
        *guard = Arc::new(next);
        SubscriptionId(id)
    }

    pub fn remove(&self, id: SubscriptionId) {
        let mut guard = self.subs.write().unwrap_or_else(|e| e.into_inner());
        if guard.iter().any(|(sub, _)| *sub == id.0) {
            let next: Vec<_> =
                guard.iter().filter(|(sub, _)| *sub != id.0).cloned().collect();
            *guard = Arc::new(next);
        }
    }

    /// Invoke every subscriber with `conn`.
    pub fn fire(&self, conn: &Connection) {
        let snapshot = {
            let guard = self.subs.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        for (_, cb) in snapshot.iter() {
            cb(conn);
        }
    }

    /// Detach all subscribers, returning the final list so a close path can
    /// fire it one last time.
    pub fn detach_all(&self) -> Arc<Vec<(u64, EventCallback)>> {
        let mut guard = self.subs.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.subs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three lifecycle events a connection exposes.
#[derive(Default)]
pub struct ConnectionEvents {
    /// Fired exactly once when the connection closes.
    pub on_close: EventSlot,
    /// Fired before a pulled packet reaches its handler.
    pub on_process: EventSlot,
    /// Fired after the handler (and any reply) completed.
    pub on_post_process: EventSlot,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every subscriber on every slot.
    pub fn detach_all(&self) {
        let _ = self.on_close.detach_all();
        let _ = self.on_process.detach_all();
        let _ = self.on_post_process.detach_all();
    }
}
