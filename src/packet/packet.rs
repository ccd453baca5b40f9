// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Assembled packet and its wire codec.
//!
//! [`Packet`] is the deserialized form handlers work with. The codec only
//! runs at the edges: the framed channel and the dispatch queues move raw
//! leases around, and a packet materializes right before its handler runs.

use bytes::Bytes;
use crc::{CRC_32_ISO_HDLC, Crc};
use thiserror::Error;
use zerocopy::IntoBytes;

use crate::packet::{
    flags::{PacketFlags, PacketKind},
    header::{
        FRAME_PREFIX_LEN, MAX_PAYLOAD_LEN, PACKET_HEADER_LEN, PacketHeader,
    },
    priority::Priority,
};

/// CRC-32 (ISO-HDLC polynomial) used for the payload checksum field.
pub const PACKET_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Fabric epoch: 2020-01-01T00:00:00Z, expressed in Unix seconds.
/// Packet timestamps count microseconds from this point.
pub const EPOCH_UNIX_SECS: u64 = 1_577_836_800;

/// Microseconds elapsed since the fabric epoch.
///
/// Clocks before the epoch (badly configured hosts) saturate to zero
/// instead of wrapping.
pub fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_unix) => since_unix
            .as_micros()
            .saturating_sub(u128::from(EPOCH_UNIX_SECS) * 1_000_000)
            .min(u128::from(u64::MAX)) as u64,
        Err(_) => 0,
    }
}

/// Codec failures. Every variant is a protocol error for the offending
/// connection; none of them affect other connections.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet truncated: got {got} bytes, header needs {PACKET_HEADER_LEN}")]
    Truncated { got: usize },
    #[error("payload of {got} bytes exceeds the {MAX_PAYLOAD_LEN}-byte frame limit")]
    PayloadTooLarge { got: usize },
    #[error("checksum mismatch: header says 0x{expected:08x}, payload hashes to 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// A self-describing message, the unit every handler consumes and produces.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Caller-assigned request identifier, echoed in replies.
    pub id: u16,
    /// Selects the handler in the dispatch registry.
    pub opcode: u16,
    /// Raw payload-encoding byte; see [`Packet::kind`].
    pub kind: u8,
    pub flags: PacketFlags,
    pub priority: Priority,
    /// Microseconds since [`EPOCH_UNIX_SECS`].
    pub timestamp: u64,
    pub payload: Bytes,
}

impl Packet {
    /// New packet stamped with the current time. Defaults: `Binary` kind,
    /// empty flags, `Normal` priority.
    pub fn new(opcode: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            opcode,
            kind: PacketKind::Binary as u8,
            flags: PacketFlags::empty(),
            priority: Priority::Normal,
            timestamp: now_micros(),
            payload: payload.into(),
        }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kind(mut self, kind: PacketKind) -> Self {
        self.kind = kind as u8;
        self
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Decoded `kind` byte, if it names a defined encoding.
    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::try_from(self.kind).ok()
    }

    /// Total length of the TCP frame this packet serializes to, prefix
    /// included.
    pub fn frame_len(&self) -> usize {
        FRAME_PREFIX_LEN + PACKET_HEADER_LEN + self.payload.len()
    }

    /// Serialize to packet bytes (header + payload, no frame prefix).
    /// This is the shape the framed channel sends and UDP datagrams embed.
    pub fn to_packet_bytes(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge { got: self.payload.len() });
        }

        let header = PacketHeader {
            id: self.id.into(),
            opcode: self.opcode.into(),
            kind: self.kind,
            flags: self.flags.bits(),
            priority: self.priority as u8,
            timestamp: self.timestamp.into(),
            checksum: PACKET_CRC.checksum(&self.payload).into(),
        };

        let mut out = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Serialize to a complete TCP frame, length prefix included.
    pub fn to_frame_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let body = self.to_packet_bytes()?;
        let total = (FRAME_PREFIX_LEN + body.len()) as u16;

        let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + body.len());
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize packet bytes (the contents of a lease or a UDP datagram
    /// body). `verify_checksum` is the `EnableValidation` knob; when on, a
    /// checksum mismatch rejects the packet.
    pub fn from_packet_bytes(
        bytes: &[u8],
        verify_checksum: bool,
    ) -> Result<Self, PacketError> {
        let Some(header) = PacketHeader::read_from_prefix_bytes(bytes) else {
            return Err(PacketError::Truncated { got: bytes.len() });
        };

        let payload = &bytes[PACKET_HEADER_LEN..];
        let expected = header.checksum.get();
        if verify_checksum {
            let actual = PACKET_CRC.checksum(payload);
            if actual != expected {
                return Err(PacketError::ChecksumMismatch { expected, actual });
            }
        }

        Ok(Self {
            id: header.id.get(),
            opcode: header.opcode.get(),
            kind: header.kind,
            flags: PacketFlags::from_bits_retain(header.flags),
            priority: Priority::from_u8(header.priority),
            timestamp: header.timestamp.get(),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Age of this packet relative to the local clock. Skewed remote clocks
    /// (timestamp in the future) read as zero age.
    pub fn age_micros(&self) -> u64 {
        now_micros().saturating_sub(self.timestamp)
    }
}
