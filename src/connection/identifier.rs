// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Globally addressable connection identifier.
//!
//! Seven little-endian bytes on the wire:
//!
//! ```text
//! +-------------+------------+--------+
//! | value (u32) | machine    | kind   |
//! |             | (u16)      | (u8)   |
//! +-------------+------------+--------+
//! ```
//!
//! UDP datagrams carry the identifier as their trailing [`Identifier::SIZE`]
//! bytes, which is how a connectionless datagram finds its connection.

use std::fmt;

use rand::RngExt;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32},
};

/// What an identifier addresses.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    #[default]
    Unknown = 0,
    /// An accepted client connection.
    Session = 1,
    /// A fabric-internal endpoint.
    System = 2,
}

/// Fixed-size wire identifier of a connection.
#[repr(C)]
#[derive(
    FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, PartialEq,
    Eq, Hash, Default,
)]
pub struct Identifier {
    value: U32,
    machine: U16,
    kind: u8,
}

impl Identifier {
    /// Wire size in bytes.
    pub const SIZE: usize = 7;

    pub const fn new(value: u32, machine: u16, kind: IdentifierKind) -> Self {
        Self {
            value: U32::new(value),
            machine: U16::new(machine),
            kind: kind as u8,
        }
    }

    /// Fresh random session identifier for `machine`.
    pub fn generate(machine: u16) -> Self {
        let value: u32 = rand::rng().random();
        Self::new(value, machine, IdentifierKind::Session)
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.value.get()
    }

    #[inline]
    pub fn machine(&self) -> u16 {
        self.machine.get()
    }

    pub fn kind(&self) -> IdentifierKind {
        match self.kind {
            1 => IdentifierKind::Session,
            2 => IdentifierKind::System,
            _ => IdentifierKind::Unknown,
        }
    }

    /// Parse the trailing [`Identifier::SIZE`] bytes of a datagram.
    pub fn from_wire_suffix(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < Self::SIZE {
            return None;
        }
        Self::read_from_bytes(&datagram[datagram.len() - Self::SIZE..]).ok()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identifier")
            .field("value", &self.value.get())
            .field("machine", &self.machine.get())
            .field("kind", &self.kind())
            .finish()
    }
}
