// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{connection::connection::Connection, packet::packet::Packet};

/// Everything a handler receives: the deserialized packet and the
/// connection it arrived on.
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub packet: Packet,
    pub connection: Arc<Connection>,
}

impl PacketContext {
    pub fn new(packet: Packet, connection: Arc<Connection>) -> Self {
        Self { packet, connection }
    }
}
