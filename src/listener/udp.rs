// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! UDP listener.
//!
//! Datagrams are identifier-addressed: the trailing [`Identifier::SIZE`]
//! bytes name an existing (TCP-established) connection, and the rest of
//! the datagram is injected as that connection's next inbound frame.
//! There is no handshake on this path, so authentication is an explicit
//! predicate that defaults to deny.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::{net::UdpSocket, sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffer::lease::BufferLease,
    connection::{connection::Connection, identifier::Identifier},
    packet::header::{MAX_FRAME_LEN, PACKET_HEADER_LEN},
    server::ServerContext,
};

/// Decides whether a datagram claiming `conn`'s identifier may be
/// dispatched on it. The fabric cannot know what proof an application
/// embeds in its datagrams, so the default answer is no.
pub trait DatagramAuthenticator: Send + Sync {
    fn is_authenticated(&self, _conn: &Connection, _datagram: &[u8]) -> bool {
        false
    }
}

/// The default-deny authenticator.
pub struct DenyAll;

impl DatagramAuthenticator for DenyAll {}

/// Receive-path counters, all atomic.
#[derive(Default)]
pub struct UdpCounters {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub drop_short: AtomicU64,
    pub drop_unknown: AtomicU64,
    pub drop_unauth: AtomicU64,
    pub recv_errors: AtomicU64,
}

/// Point-in-time copy of [`UdpCounters`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct UdpCountersSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub drop_short: u64,
    pub drop_unknown: u64,
    pub drop_unauth: u64,
    pub recv_errors: u64,
}

impl UdpCounters {
    pub fn snapshot(&self) -> UdpCountersSnapshot {
        UdpCountersSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            drop_short: self.drop_short.load(Ordering::Relaxed),
            drop_unknown: self.drop_unknown.load(Ordering::Relaxed),
            drop_unauth: self.drop_unauth.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// A started UDP listener.
pub struct UdpListenerHandle {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Bind the UDP port and spawn the single receive loop. Dispatch of each
/// accepted datagram runs on a worker bounded by `MaxGroupConcurrency`.
pub async fn start_udp_listener(
    ctx: Arc<ServerContext>,
    authenticator: Arc<dyn DatagramAuthenticator>,
    cancel: CancellationToken,
) -> Result<UdpListenerHandle> {
    let port = ctx
        .config
        .transport
        .udp_port
        .context("UdpPort is not configured")?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind UDP {addr}"))?;
    let local_addr = socket.local_addr()?;
    info!(%local_addr, "UDP listener bound");

    let workers = Arc::new(Semaphore::new(
        ctx.config.dispatch.max_group_concurrency.max(1) as usize,
    ));

    let task = tokio::spawn(async move {
        receive_loop(socket, ctx, authenticator, workers, cancel).await;
    });

    Ok(UdpListenerHandle { local_addr, task })
}

async fn receive_loop(
    socket: UdpSocket,
    ctx: Arc<ServerContext>,
    authenticator: Arc<dyn DatagramAuthenticator>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let counters = Arc::clone(&ctx.udp_counters);
    let mut scratch = vec![0u8; MAX_FRAME_LEN];

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut scratch) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "UDP recv failed");
                    continue;
                },
            },
        };

        counters.rx_packets.fetch_add(1, Ordering::Relaxed);
        counters.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);

        // Too short to even carry a header plus the trailing identifier:
        // dropped before any connection lookup.
        if len < PACKET_HEADER_LEN + Identifier::SIZE {
            counters.drop_short.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let datagram = &scratch[..len];
        let Some(identifier) = Identifier::from_wire_suffix(datagram) else {
            counters.drop_short.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        let Some(conn) = ctx.hub.get(identifier) else {
            counters.drop_unknown.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, %identifier, "datagram for unknown connection");
            continue;
        };

        if !authenticator.is_authenticated(&conn, datagram) {
            counters.drop_unauth.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        // Body = datagram minus the trailing identifier; same shape as a
        // TCP frame's packet bytes.
        let body = &datagram[..len - Identifier::SIZE];
        let lease = BufferLease::copied_from(&ctx.pool, body);

        let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
            break;
        };
        let router = Arc::clone(&ctx.router);
        tokio::spawn(async move {
            conn.touch();
            router.push(&conn, lease).await;
            drop(permit);
        });
    }
    debug!("UDP receive loop stopped");
}
