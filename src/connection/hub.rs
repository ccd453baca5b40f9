// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Identifier-keyed registry of live connections.
//!
//! The UDP listener resolves the trailing identifier of every datagram
//! here; server shutdown walks it to close everything.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{connection::Connection, identifier::Identifier};

#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<Identifier, Arc<Connection>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.identifier(), conn);
    }

    pub fn unregister(&self, identifier: Identifier) -> Option<Arc<Connection>> {
        self.connections.remove(&identifier).map(|(_, conn)| conn)
    }

    pub fn get(&self, identifier: Identifier) -> Option<Arc<Connection>> {
        self.connections.get(&identifier).map(|e| Arc::clone(&e))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Copy of the current connection set.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| Arc::clone(&e)).collect()
    }

    /// Close every registered connection. Close callbacks unregister each
    /// one, so collect first instead of closing under the iterator.
    pub fn close_all(&self) {
        for conn in self.snapshot() {
            conn.close();
        }
    }
}
