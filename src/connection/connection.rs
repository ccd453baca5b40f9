// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One accepted client connection.
//!
//! A connection glues a framed channel to the dispatch fabric: it carries
//! the identifiers the rest of the system keys on, the lifecycle events
//! other components subscribe to, and the close-once latch that makes
//! teardown safe to trigger from any path (receive loop, handler, server
//! shutdown) without double-firing cleanup.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Instant,
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    buffer::pool::BufferPool,
    channel::framed::FramedChannel,
    connection::{events::ConnectionEvents, identifier::Identifier},
    packet::packet::Packet,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on the process-local monotonic clock.
pub fn monotonic_ms() -> u64 {
    PROCESS_START.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

pub struct Connection {
    /// Process-local sequence number; the dispatch router shards on it.
    id: u64,
    /// Globally addressable wire identifier (UDP datagrams carry it).
    identifier: Identifier,
    remote: SocketAddr,
    channel: FramedChannel,
    events: ConnectionEvents,
    closed: AtomicBool,
    permission_level: AtomicU8,
    last_ping_ms: AtomicU64,
}

impl Connection {
    /// Wrap an accepted socket. `parent` is the listener cancellation
    /// token; `machine` stamps the generated identifier.
    pub fn accept(
        stream: TcpStream,
        remote: SocketAddr,
        pool: Arc<BufferPool>,
        parent: &CancellationToken,
        machine: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            identifier: Identifier::generate(machine),
            remote,
            channel: FramedChannel::new(stream, pool, parent),
            events: ConnectionEvents::new(),
            closed: AtomicBool::new(false),
            permission_level: AtomicU8::new(0),
            last_ping_ms: AtomicU64::new(monotonic_ms()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn channel(&self) -> &FramedChannel {
        &self.channel
    }

    #[inline]
    pub fn events(&self) -> &ConnectionEvents {
        &self.events
    }

    pub fn permission_level(&self) -> u8 {
        self.permission_level.load(Ordering::Acquire)
    }

    /// Raise or lower the tenant's permission level (set by auth layers).
    pub fn set_permission_level(&self, level: u8) {
        self.permission_level.store(level, Ordering::Release);
    }

    /// Stamp of the last received frame, monotonic milliseconds.
    pub fn last_ping_ms(&self) -> u64 {
        self.last_ping_ms.load(Ordering::Acquire)
    }

    /// Record frame arrival; called by the receive loop per frame.
    pub fn touch(&self) {
        self.last_ping_ms.store(monotonic_ms(), Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send raw packet bytes as one frame.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.channel
            .send(bytes)
            .await
            .with_context(|| format!("send to {} failed", self.remote))
    }

    /// Serialize and send a packet.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_packet_bytes()?;
        self.send(&bytes).await
    }

    /// Close the connection. One-shot: the first caller disposes the
    /// channel, fires `on_close` exactly once, and detaches every
    /// listener; later callers are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = self.id, remote = %self.remote, "closing connection");

        self.channel.dispose();

        // Detach-then-fire: even a callback that re-enters close() cannot
        // run the close list twice.
        let close_subs = self.events.on_close.detach_all();
        for (_, cb) in close_subs.iter() {
            cb(self);
        }
        self.events.detach_all();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
