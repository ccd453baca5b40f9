// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use hex_literal::hex;
use packet_fabric_rs::packet::{
    flags::PacketFlags,
    header::{
        FRAME_PREFIX_LEN, PACKET_HEADER_LEN, PRIORITY_OFFSET, PacketHeader,
    },
    packet::{PACKET_CRC, Packet, PacketError},
    priority::{Priority, classify_priority_index},
};

#[test]
fn test_wire_offsets_are_stable() {
    // Any change to these constants is a wire-format break.
    assert_eq!(FRAME_PREFIX_LEN, 2);
    assert_eq!(PACKET_HEADER_LEN, 19);
    assert_eq!(PRIORITY_OFFSET, 6);

    let p = Packet::new(0x0A0B, &b"z"[..])
        .with_id(0x0C0D)
        .with_priority(Priority::Urgent);
    let bytes = p.to_packet_bytes().expect("ok");

    assert_eq!(&bytes[0..2], &0x0C0Du16.to_le_bytes(), "id at offset 0");
    assert_eq!(&bytes[2..4], &0x0A0Bu16.to_le_bytes(), "opcode at offset 2");
    assert_eq!(bytes[PRIORITY_OFFSET], Priority::Urgent as u8);
    assert_eq!(&bytes[PACKET_HEADER_LEN..], b"z");
}

#[test]
fn test_known_answer_frame() {
    // The CRC-32 check string: crc32("123456789") = 0xCBF43926.
    // id=1, opcode=2, kind=0, flags=0, priority=2 (Normal), timestamp=0,
    // total frame = 2 + 19 + 9 = 30 (0x1E).
    let payload = b"123456789";
    assert_eq!(PACKET_CRC.checksum(payload), 0xCBF4_3926);

    let mut p = Packet::new(2, &payload[..]).with_id(1);
    p.timestamp = 0;
    let frame = p.to_frame_bytes().expect("ok");

    let expected = hex!(
        "1e00"               // total length 30
        "0100"               // id
        "0200"               // opcode
        "00"                 // kind
        "00"                 // flags
        "02"                 // priority Normal
        "0000000000000000"   // timestamp
        "2639f4cb"           // crc32 little-endian
        "313233343536373839" // "123456789"
    );
    assert_eq!(frame, expected);
}

#[test]
fn test_priority_classification_uses_single_byte() {
    let p = Packet::new(1, &b"x"[..]).with_priority(Priority::High);
    let bytes = p.to_packet_bytes().expect("ok");
    assert_eq!(classify_priority_index(&bytes), Priority::High.index());

    // Classification never parses the rest: corrupting the checksum
    // changes nothing about the lane choice.
    let mut corrupted = bytes;
    corrupted[15] ^= 0xFF;
    assert_eq!(classify_priority_index(&corrupted), Priority::High.index());
}

#[test]
fn test_header_overlay_matches_codec() {
    let p = Packet::new(0x1234, &b"body"[..])
        .with_id(77)
        .with_flags(PacketFlags::ENCRYPTED);
    let bytes = p.to_packet_bytes().expect("ok");

    let hdr = PacketHeader::read_from_prefix_bytes(&bytes).expect("overlay");
    assert_eq!(hdr.id.get(), 77);
    assert_eq!(hdr.opcode.get(), 0x1234);
    assert_eq!(hdr.flags, PacketFlags::ENCRYPTED.bits());
    assert_eq!(hdr.checksum.get(), PACKET_CRC.checksum(b"body"));
}

#[test]
fn test_empty_payload_packet_is_valid() {
    let p = Packet::new(1, Vec::new());
    let bytes = p.to_packet_bytes().expect("header-only packet");
    assert_eq!(bytes.len(), PACKET_HEADER_LEN);

    let back = Packet::from_packet_bytes(&bytes, true).expect("parse");
    assert!(back.payload.is_empty());
}

#[test]
fn test_short_bytes_are_truncated_error() {
    for n in 0..PACKET_HEADER_LEN {
        assert!(
            matches!(
                Packet::from_packet_bytes(&vec![0u8; n], true),
                Err(PacketError::Truncated { .. })
            ),
            "{n} bytes must not parse"
        );
    }
}
