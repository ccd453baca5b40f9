// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP accept pipeline.
//!
//! Binds the configured port, runs `MaxParallel` accept loops against one
//! shared listener, and turns each admitted socket into a connection with
//! its receive loop and close fan-out wired. Everything hangs off a
//! listener-scoped cancellation token: cancelling it stops the accept
//! loops and cascades into every receive loop through the per-channel
//! child tokens.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{connection::connection::Connection, server::ServerContext};

/// Back-off after a transient accept error, to avoid a hot error loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A started TCP listener: the resolved local address plus its accept
/// tasks.
pub struct TcpListenerHandle {
    pub local_addr: SocketAddr,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Bind the configured port and spawn the accept loops.
///
/// `cancel` is the server's listener token; accept loops and receive
/// loops both stop when it fires.
pub async fn start_tcp_listener(
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
) -> Result<TcpListenerHandle> {
    let transport = &ctx.config.transport;

    let socket = TcpSocket::new_v4().context("failed to create TCP socket")?;
    if transport.reuse_address {
        socket.set_reuseaddr(true)?;
    }
    socket.set_recv_buffer_size(transport.buffer_size as u32)?;
    socket.set_send_buffer_size(transport.buffer_size as u32)?;
    if transport.keep_alive {
        socket.set_keepalive(true)?;
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, transport.port));
    socket.bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    let listener = socket
        .listen(transport.backlog)
        .with_context(|| format!("failed to listen on {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "TCP listener bound");

    let listener = Arc::new(listener);
    let tasks = (0..ctx.config.accept.max_parallel.max(1))
        .map(|loop_idx| {
            let listener = Arc::clone(&listener);
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                accept_loop(loop_idx, listener, ctx, cancel).await;
            })
        })
        .collect();

    Ok(TcpListenerHandle { local_addr, tasks })
}

/// Accept errors that mean the listener itself is done.
fn is_benign_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}

async fn accept_loop(
    loop_idx: i32,
    listener: Arc<TcpListener>,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
) {
    debug!(loop_idx, "accept loop started");
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) if is_benign_accept_error(&e) => {
                    debug!(loop_idx, error = %e, "accept loop ending");
                    break;
                },
                Err(e) => {
                    warn!(loop_idx, error = %e, "transient accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                },
            },
        };

        // Admission before any I/O: a denied socket is closed on the spot.
        if !ctx.limiter.is_connection_allowed(peer.ip()) {
            debug!(%peer, "rate limited, dropping socket");
            drop(stream);
            continue;
        }

        if let Err(e) = stream.set_nodelay(ctx.config.transport.no_delay) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }

        attach_connection(stream, peer, &ctx, &cancel);
    }
    debug!(loop_idx, "accept loop stopped");
}

/// Wrap an admitted socket: build the connection, register it, wire the
/// close fan-out, and start its receive loop.
fn attach_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &Arc<ServerContext>,
    cancel: &CancellationToken,
) {
    let conn =
        Connection::accept(stream, peer, Arc::clone(&ctx.pool), cancel, ctx.machine);

    // Cleanup fan-out runs on every exit path, exactly once, because
    // Connection::close is latched.
    let cleanup_ctx = Arc::clone(ctx);
    conn.events().on_close.subscribe(Arc::new(move |c: &Connection| {
        cleanup_ctx.router.unregister(c.id());
        cleanup_ctx.hub.unregister(c.identifier());
        cleanup_ctx.limiter.release(c.remote().ip());
    }));

    ctx.hub.register(Arc::clone(&conn));
    debug!(conn = conn.id(), %peer, "connection accepted");

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        run_receive_loop(conn, ctx).await;
    });
}

/// Upper bound on waiting for queued frames to dispatch after a peer FIN.
const GRACEFUL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive one connection's framed receive loop until it closes.
async fn run_receive_loop(conn: Arc<Connection>, ctx: Arc<ServerContext>) {
    let graceful = loop {
        match conn.channel().read_frame().await {
            Ok(lease) => {
                conn.touch();
                ctx.router.push(&conn, lease).await;
            },
            Err(e) => {
                if e.is_benign() {
                    debug!(conn = conn.id(), reason = %e, "receive loop ending");
                    break true;
                }
                // Protocol violations and unexpected socket faults are
                // logged, then close immediately, dropping whatever is
                // still queued.
                warn!(conn = conn.id(), error = %e, "receive loop failed");
                break false;
            },
        }
    };

    // Orderly FIN: frames the peer already delivered still reach their
    // handlers before on_close fires.
    if graceful {
        let deadline = tokio::time::Instant::now() + GRACEFUL_DRAIN_TIMEOUT;
        while ctx.router.pending_for(conn.id()) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
    conn.close();
}
