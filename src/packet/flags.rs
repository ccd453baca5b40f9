// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `kind` and `flags` bytes of the packet header.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Transport-level attributes of a packet. Unknown bits are preserved
    /// on the wire but ignored by the fabric.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// Payload is compressed; the handler is expected to inflate it.
        const COMPRESSED = 0b0000_0001;
        /// Payload was produced by an opaque cipher transform.
        const ENCRYPTED = 0b0000_0010;
        /// Sender expects an application-level acknowledgement.
        const ACK_REQUIRED = 0b0000_0100;
    }
}

/// Returned when a strict consumer refuses an undefined `kind` byte.
#[derive(Debug, Error)]
#[error("unknown packet kind: 0x{0:02x}")]
pub struct UnknownPacketKind(pub u8);

/// Payload encoding discriminator carried in the `kind` byte.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Raw bytes, no declared structure.
    #[default]
    Binary = 0,
    /// UTF-8 text.
    Text = 1,
    /// JSON document.
    Json = 2,
    /// Fabric-internal control message.
    Control = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = UnknownPacketKind;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Binary,
            1 => Self::Text,
            2 => Self::Json,
            3 => Self::Control,
            other => return Err(UnknownPacketKind(other)),
        })
    }
}
