// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server assembly.
//!
//! No process-wide singletons: everything the listeners and the dispatch
//! fabric share lives in one [`ServerContext`] created before `start` and
//! dropped after `shutdown`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    buffer::pool::BufferPool,
    cfg::config::ServerConfig,
    connection::hub::ConnectionHub,
    dispatch::{
        channel::{DispatchOptions, MetricsSnapshot},
        router::DispatchRouter,
    },
    listener::{
        limiter::ConnectionLimiter,
        tcp::start_tcp_listener,
        udp::{DatagramAuthenticator, DenyAll, UdpCounters, start_udp_listener},
    },
    registry::{
        dispatcher::{Dispatcher, spawn_pull_workers},
        table::DispatchTable,
    },
};

/// Shared collaborators of one server instance.
pub struct ServerContext {
    pub config: ServerConfig,
    /// Machine tag stamped into generated connection identifiers.
    pub machine: u16,
    pub pool: Arc<BufferPool>,
    pub limiter: Arc<ConnectionLimiter>,
    pub hub: Arc<ConnectionHub>,
    pub router: Arc<DispatchRouter>,
    pub udp_counters: Arc<UdpCounters>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_machine(config, 0)
    }

    pub fn with_machine(config: ServerConfig, machine: u16) -> Arc<Self> {
        let opts = DispatchOptions {
            max_per_connection: config.dispatch.max_per_connection_queue,
            policy: config.dispatch.drop_policy,
        };
        let router = Arc::new(DispatchRouter::new(
            config.dispatch.shard_count,
            opts,
            config.dispatch.enable_metrics,
        ));
        let limiter = Arc::new(ConnectionLimiter::new(
            config.accept.max_connections_per_ip,
            config.accept.connection_allowance,
            config.accept.allowance_window,
        ));

        Arc::new(Self {
            config,
            machine,
            pool: Arc::new(BufferPool::new()),
            limiter,
            hub: Arc::new(ConnectionHub::new()),
            router,
            udp_counters: Arc::new(UdpCounters::default()),
        })
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.router.metrics_snapshot()
    }
}

/// A running packet-fabric server: TCP accept pipeline, optional UDP
/// listener, and the pull-worker group.
pub struct Server {
    ctx: Arc<ServerContext>,
    table: Arc<DispatchTable>,
    authenticator: Arc<dyn DatagramAuthenticator>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
}

impl Server {
    pub fn new(ctx: Arc<ServerContext>, table: Arc<DispatchTable>) -> Self {
        Self {
            ctx,
            table,
            authenticator: Arc::new(DenyAll),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            tcp_addr: None,
            udp_addr: None,
        }
    }

    /// Replace the default-deny UDP authenticator.
    pub fn with_authenticator(mut self, auth: Arc<dyn DatagramAuthenticator>) -> Self {
        self.authenticator = auth;
        self
    }

    /// External cancellation surface; linked into every listener and
    /// worker.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Address the TCP listener actually bound (resolves `Port: 0`).
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind listeners and spawn the worker group. Idempotent only in the
    /// sense that a second call binds nothing new while running.
    pub async fn start(&mut self) -> Result<()> {
        if self.tcp_addr.is_some() {
            return Ok(());
        }

        let mut opcodes: Vec<String> =
            self.table.opcodes().map(|op| format!("0x{op:04x}")).collect();
        opcodes.sort_unstable();
        info!(
            handlers = self.table.len(),
            opcodes = ?opcodes,
            "dispatch table frozen"
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.table),
            Arc::clone(self.ctx.router.metrics()),
            &self.ctx.config.dispatch,
        ));

        let workers = spawn_pull_workers(
            Arc::clone(&self.ctx.router),
            dispatcher,
            self.ctx.config.dispatch.max_group_concurrency.max(1) as usize,
            self.cancel.clone(),
        );
        self.tasks.extend(workers);

        let tcp =
            start_tcp_listener(Arc::clone(&self.ctx), self.cancel.clone()).await?;
        self.tcp_addr = Some(tcp.local_addr);
        self.tasks.extend(tcp.tasks);

        if self.ctx.config.transport.udp_port.is_some() {
            let udp = start_udp_listener(
                Arc::clone(&self.ctx),
                Arc::clone(&self.authenticator),
                self.cancel.clone(),
            )
            .await?;
            self.udp_addr = Some(udp.local_addr);
            self.tasks.push(udp.task);
        }

        info!(
            tcp = %tcp.local_addr,
            started_at = %chrono::Utc::now().to_rfc3339(),
            shards = self.ctx.router.shard_count(),
            "server started"
        );
        Ok(())
    }

    /// Stop accepting, close every connection, and wait for all tasks.
    /// Idempotent.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.ctx.hub.close_all();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("server stopped");
    }
}
