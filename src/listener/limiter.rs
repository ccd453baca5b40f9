// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-address connection admission.
//!
//! Two gates per remote IP: a token bucket over connection *attempts*
//! (refilled continuously across the configured window) and a hard cap on
//! *simultaneously open* connections. The accept pipeline consults
//! [`ConnectionLimiter::is_connection_allowed`] before any I/O and wires
//! [`ConnectionLimiter::release`] into the close path so slots come back
//! on every exit.

use std::{net::IpAddr, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

struct IpBucket {
    /// Connections from this address currently open.
    active: u32,
    /// Remaining admission tokens; fractional during refill.
    tokens: f64,
    last_refill: Instant,
}

pub struct ConnectionLimiter {
    buckets: DashMap<IpAddr, IpBucket>,
    max_active: u32,
    allowance: u32,
    window: Duration,
}

impl ConnectionLimiter {
    pub fn new(max_active: u32, allowance: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_active: max_active.max(1),
            allowance: allowance.max(1),
            window,
        }
    }

    /// Admission check for one connection attempt. Consumes a token and
    /// claims an active slot when allowed.
    pub fn is_connection_allowed(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| IpBucket {
            active: 0,
            tokens: f64::from(self.allowance),
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill =
            elapsed.as_secs_f64() / self.window.as_secs_f64() * f64::from(self.allowance);
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.allowance));
        bucket.last_refill = now;

        if bucket.active >= self.max_active || bucket.tokens < 1.0 {
            debug!(%ip, active = bucket.active, tokens = bucket.tokens, "connection denied");
            return false;
        }

        bucket.tokens -= 1.0;
        bucket.active += 1;
        true
    }

    /// Give back the active slot of a closed connection.
    pub fn release(&self, ip: IpAddr) {
        if let Some(mut bucket) = self.buckets.get_mut(&ip) {
            bucket.active = bucket.active.saturating_sub(1);
        }
    }

    /// Open connections currently attributed to `ip`.
    pub fn active(&self, ip: IpAddr) -> u32 {
        self.buckets.get(&ip).map_or(0, |b| b.active)
    }
}
