// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Runtime half of the registry: pull a lease, materialize the packet,
//! check the handler's gates, run it, send the optional reply.
//!
//! Error policy mirrors the fabric-wide taxonomy: malformed packets close
//! the offending connection; unknown opcodes, failed gates, handler errors
//! and timeouts are per-request failures that leave the connection open.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    buffer::lease::BufferLease,
    cfg::config::DispatchConfig,
    connection::connection::Connection,
    dispatch::{channel::DispatchMetrics, router::DispatchRouter},
    packet::{flags::PacketFlags, packet::Packet},
    registry::{context::PacketContext, table::DispatchTable},
};

pub struct Dispatcher {
    table: Arc<DispatchTable>,
    metrics: Arc<DispatchMetrics>,
    /// Packets older than this are dropped unhandled; `None` disables
    /// expiry.
    packet_expiry: Option<Duration>,
    verify_checksums: bool,
}

impl Dispatcher {
    pub fn new(
        table: Arc<DispatchTable>,
        metrics: Arc<DispatchMetrics>,
        cfg: &DispatchConfig,
    ) -> Self {
        let packet_expiry =
            if cfg.timeout.is_zero() { None } else { Some(cfg.timeout) };
        Self {
            table,
            metrics,
            packet_expiry,
            verify_checksums: cfg.enable_validation,
        }
    }

    /// Process one pulled lease end to end. The lease is always released
    /// here, on every path.
    pub async fn dispatch(&self, conn: Arc<Connection>, mut lease: BufferLease) {
        let packet = match Packet::from_packet_bytes(lease.bytes(), self.verify_checksums)
        {
            Ok(p) => p,
            Err(e) => {
                // Protocol error: the offending connection closes, others
                // are unaffected.
                warn!(conn = conn.id(), error = %e, "malformed packet, closing");
                lease.release();
                conn.close();
                return;
            },
        };
        lease.release();

        let priority = packet.priority.index();

        if let Some(expiry) = self.packet_expiry
            && Duration::from_micros(packet.age_micros()) > expiry
        {
            self.metrics.record_expired(priority);
            debug!(conn = conn.id(), opcode = packet.opcode, "packet expired");
            return;
        }

        let Some(entry) = self.table.lookup(packet.opcode) else {
            // Recoverable: unknown opcodes never take the connection down.
            warn!(conn = conn.id(), opcode = packet.opcode, "no handler for opcode");
            return;
        };

        if conn.permission_level() < entry.meta.min_permission {
            warn!(
                conn = conn.id(),
                handler = entry.meta.name,
                "permission denied"
            );
            return;
        }
        if entry.meta.requires_encryption
            && !packet.flags.contains(PacketFlags::ENCRYPTED)
        {
            warn!(
                conn = conn.id(),
                handler = entry.meta.name,
                "plaintext packet on encrypted-only opcode"
            );
            return;
        }

        conn.events().on_process.fire(&conn);

        let ctx = PacketContext::new(packet, Arc::clone(&conn));
        let fut = (entry.invoker)(ctx);

        let outcome = match entry.meta.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(res) => res,
                Err(_) => {
                    // Per-request failure; the connection stays open.
                    warn!(
                        conn = conn.id(),
                        handler = entry.meta.name,
                        timeout_ms = deadline.as_millis() as u64,
                        "handler timed out"
                    );
                    conn.events().on_post_process.fire(&conn);
                    return;
                },
            },
            None => fut.await,
        };

        match outcome {
            Ok(Some(reply)) => {
                if let Err(e) = conn.send_packet(&reply).await {
                    debug!(conn = conn.id(), error = %e, "reply send failed");
                }
            },
            Ok(None) => {},
            Err(e) => {
                warn!(
                    conn = conn.id(),
                    handler = entry.meta.name,
                    error = %e,
                    "handler failed"
                );
            },
        }

        conn.events().on_post_process.fire(&conn);
    }
}

/// Spawn the pull-worker group. Each worker loops `router.pull` →
/// `dispatcher.dispatch` until `cancel` fires.
pub fn spawn_pull_workers(
    router: Arc<DispatchRouter>,
    dispatcher: Arc<Dispatcher>,
    count: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let router = Arc::clone(&router);
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                debug!(worker, "pull worker started");
                while let Some((conn, lease)) = router.pull(&cancel).await {
                    dispatcher.dispatch(conn, lease).await;
                }
                debug!(worker, "pull worker stopped");
            })
        })
        .collect()
}
