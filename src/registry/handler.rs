// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handler abstraction with sync/async parity.
//!
//! Every registered handler, whether it was written as an `async fn` or a
//! plain function, compiles down to one invoker shape: take a context,
//! return a boxed future of an optional reply. Callers never branch on how
//! the handler was written.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Result;

use crate::{packet::packet::Packet, registry::context::PacketContext};

/// Uniform completion surface: an optional reply packet, or a handler
/// error. `None` means the handler owed no response.
pub type HandlerResult = Result<Option<Packet>>;

/// The boxed future every invoker returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// A compiled, monomorphization-free invoker stored in the dispatch table.
pub type Invoker = Arc<dyn Fn(PacketContext) -> HandlerFuture + Send + Sync>;

/// Static metadata attached to one opcode's handler.
#[derive(Debug, Clone)]
pub struct HandlerMeta {
    pub opcode: u16,
    /// Diagnostic name, shown in logs.
    pub name: &'static str,
    /// When set, the invoker is raced against this deadline; losing the
    /// race fails the request but keeps the connection open.
    pub timeout: Option<Duration>,
    /// Minimum connection permission level; below it the packet is
    /// discarded before the handler runs.
    pub min_permission: u8,
    /// Demand the `ENCRYPTED` packet flag.
    pub requires_encryption: bool,
}

impl HandlerMeta {
    pub fn new(opcode: u16, name: &'static str) -> Self {
        Self {
            opcode,
            name,
            timeout: None,
            min_permission: 0,
            requires_encryption: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_min_permission(mut self, level: u8) -> Self {
        self.min_permission = level;
        self
    }

    pub fn with_encryption_required(mut self) -> Self {
        self.requires_encryption = true;
        self
    }
}

/// Box an async handler function into an [`Invoker`].
pub fn invoker_from_async<F, Fut>(f: F) -> Invoker
where
    F: Fn(PacketContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Box a synchronous handler function into an [`Invoker`]. The closure
/// runs inline on the dispatch worker; its result is lifted into an
/// already-completed future.
pub fn invoker_from_sync<F>(f: F) -> Invoker
where
    F: Fn(PacketContext) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |ctx| {
        let out = f(ctx);
        Box::pin(async move { out })
    })
}
