// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Opcode → invoker table.
//!
//! Registration happens once at startup through [`RegistryBuilder`];
//! [`RegistryBuilder::build`] freezes the table, and dispatch afterwards is
//! a plain map lookup with no locking. Registration problems (duplicate
//! opcode, empty controller) are fatal at build time, matching the rule
//! that a broken controller never reaches the wire.

use std::{collections::HashMap, fmt, future::Future};

use thiserror::Error;

use crate::registry::handler::{
    HandlerMeta, HandlerResult, Invoker, invoker_from_async, invoker_from_sync,
};
use crate::registry::context::PacketContext;

/// Fatal registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for opcode 0x{0:04x}")]
    DuplicateOpcode(u16),
    #[error("controller registered no handlers")]
    NoHandlers,
}

pub struct HandlerEntry {
    pub meta: HandlerMeta,
    pub invoker: Invoker,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry").field("meta", &self.meta).finish_non_exhaustive()
    }
}

/// Accumulates handlers before the table freezes.
#[derive(Default, Debug)]
pub struct RegistryBuilder {
    handlers: HashMap<u16, HandlerEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler under `meta.opcode`.
    pub fn register<F, Fut>(&mut self, meta: HandlerMeta, f: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(PacketContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(meta, invoker_from_async(f))
    }

    /// Register a synchronous handler under `meta.opcode`. It shares the
    /// async completion surface; callers cannot tell the difference.
    pub fn register_sync<F>(
        &mut self,
        meta: HandlerMeta,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(PacketContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(meta, invoker_from_sync(f))
    }

    fn insert(
        &mut self,
        meta: HandlerMeta,
        invoker: Invoker,
    ) -> Result<&mut Self, RegistryError> {
        let opcode = meta.opcode;
        if self.handlers.contains_key(&opcode) {
            return Err(RegistryError::DuplicateOpcode(opcode));
        }
        self.handlers.insert(opcode, HandlerEntry { meta, invoker });
        Ok(self)
    }

    /// Freeze the table. A controller that registered nothing is a
    /// configuration bug, not an empty server.
    pub fn build(self) -> Result<DispatchTable, RegistryError> {
        if self.handlers.is_empty() {
            return Err(RegistryError::NoHandlers);
        }
        Ok(DispatchTable { handlers: self.handlers })
    }
}

/// Frozen opcode → invoker map. Immutable after build; lookups are
/// lock-free by construction.
#[derive(Debug)]
pub struct DispatchTable {
    handlers: HashMap<u16, HandlerEntry>,
}

impl DispatchTable {
    pub fn lookup(&self, opcode: u16) -> Option<&HandlerEntry> {
        self.handlers.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered opcodes, unordered.
    pub fn opcodes(&self) -> impl Iterator<Item = u16> + '_ {
        self.handlers.keys().copied()
    }
}
