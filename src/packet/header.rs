// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire layout of the packet header.
//!
//! A TCP frame is a little-endian `u16` length prefix followed by the packet
//! bytes; the prefix counts itself, so `payload = total - 2`. The packet
//! bytes open with a fixed 19-byte header:
//!
//! ```text
//! offset  0        2        4      5      6         7           15
//!         +--------+--------+------+------+---------+-----------+----------+
//!         | id u16 | op u16 | kind | flag | priority| ts u64 µs | crc32    |
//!         +--------+--------+------+------+---------+-----------+----------+
//! ```
//!
//! All integers are little-endian. UDP datagrams carry the same packet bytes
//! (no length prefix; the datagram boundary frames them) followed by a
//! trailing connection identifier.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32, U64},
};

/// Length of the `u16` frame prefix on a TCP stream.
pub const FRAME_PREFIX_LEN: usize = 2;

/// Largest value the frame prefix can express; frames above it are invalid.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Fixed header inside the packet bytes.
pub const PACKET_HEADER_LEN: usize = 19;

/// Offset of the priority byte inside the packet bytes. The dispatch
/// channel reads exactly this byte to classify a frame.
pub const PRIORITY_OFFSET: usize = 6;

/// Offset of the `u64` microsecond timestamp inside the packet bytes.
pub const TIMESTAMP_OFFSET: usize = 7;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_PREFIX_LEN - PACKET_HEADER_LEN;

/// Zero-copy view of the fixed packet header.
///
/// `Unaligned` keeps every field a byte array under the hood, so the struct
/// can be overlaid on any offset of a receive buffer.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Default)]
pub struct PacketHeader {
    /// Caller-assigned request identifier.
    pub id: U16,
    /// Handler selector.
    pub opcode: U16,
    /// Payload encoding discriminator.
    pub kind: u8,
    /// Compression / encryption / ack flag bits.
    pub flags: u8,
    /// Scheduling class, clamped on read.
    pub priority: u8,
    /// Microseconds since the fabric epoch.
    pub timestamp: U64,
    /// CRC-32 of the payload bytes.
    pub checksum: U32,
}

impl PacketHeader {
    /// Overlay a header on the front of `packet_bytes`, if long enough.
    #[inline]
    pub fn read_from_prefix_bytes(packet_bytes: &[u8]) -> Option<&Self> {
        Self::ref_from_prefix(packet_bytes).ok().map(|(h, _)| h)
    }
}

impl core::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("id", &self.id.get())
            .field("opcode", &format_args!("0x{:04x}", self.opcode.get()))
            .field("kind", &self.kind)
            .field("flags", &format_args!("0b{:08b}", self.flags))
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp.get())
            .field("checksum", &format_args!("0x{:08x}", self.checksum.get()))
            .finish()
    }
}
