// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use packet_fabric_rs::{
    buffer::pool::BufferPool,
    channel::framed::{ChannelError, FramedChannel},
    packet::header::{FRAME_PREFIX_LEN, MAX_FRAME_LEN},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::socket_pair;

fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let total = (FRAME_PREFIX_LEN + payload.len()) as u16;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

async fn server_channel() -> (FramedChannel, tokio::net::TcpStream, Arc<BufferPool>) {
    let pool = Arc::new(BufferPool::new());
    let (client, server) = socket_pair().await;
    let channel =
        FramedChannel::new(server, Arc::clone(&pool), &CancellationToken::new());
    (channel, client, pool)
}

#[tokio::test]
async fn test_receive_round_trip() {
    let (channel, mut client, _pool) = server_channel().await;

    let payload = b"exact bytes over the wire";
    client.write_all(&frame_bytes(payload)).await.expect("write frame");

    let lease = channel.read_frame().await.expect("one frame");
    assert_eq!(lease.bytes(), payload);
}

#[tokio::test]
async fn test_send_round_trip() {
    let (channel, mut client, _pool) = server_channel().await;

    let payload = vec![0x5Au8; 4096];
    channel.send(&payload).await.expect("send");

    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    client.read_exact(&mut prefix).await.expect("prefix");
    let total = u16::from_le_bytes(prefix) as usize;
    assert_eq!(total, FRAME_PREFIX_LEN + payload.len());

    let mut got = vec![0u8; total - FRAME_PREFIX_LEN];
    client.read_exact(&mut got).await.expect("payload");
    assert_eq!(got, payload);
}

#[tokio::test]
async fn test_arbitrary_chunking_preserves_frames() {
    let (channel, mut client, _pool) = server_channel().await;

    let frames: Vec<Vec<u8>> = (0u8..10)
        .map(|i| {
            let len = 1 + usize::from(i) * 97;
            vec![i; len]
        })
        .collect();
    let mut wire = Vec::new();
    for f in &frames {
        wire.extend_from_slice(&frame_bytes(f));
    }

    // Fuzz the split points: write in chunks unrelated to frame
    // boundaries, with pauses so the reads really observe partial data.
    tokio::spawn(async move {
        for chunk in wire.chunks(13) {
            client.write_all(chunk).await.expect("chunk");
            client.flush().await.expect("flush");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    for expected in &frames {
        let lease = channel.read_frame().await.expect("frame");
        assert_eq!(lease.bytes(), expected.as_slice());
    }
}

#[tokio::test]
async fn test_undersized_length_is_protocol_error() {
    let (channel, mut client, pool) = server_channel().await;

    // total_length = 1 < FRAME_PREFIX_LEN
    client.write_all(&1u16.to_le_bytes()).await.expect("write");

    let err = channel.read_frame().await.expect_err("must reject");
    assert!(matches!(err, ChannelError::Protocol(_)), "got {err:?}");
    assert_eq!(pool.idle_buffers(), 1, "rented buffer must not leak");
}

#[tokio::test]
async fn test_peer_fin_reports_closed() {
    let (channel, client, _pool) = server_channel().await;
    drop(client);

    let err = channel.read_frame().await.expect_err("fin");
    assert!(matches!(err, ChannelError::Closed), "got {err:?}");
    assert!(err.is_benign());
}

#[tokio::test]
async fn test_mid_frame_fin_reports_closed() {
    let (channel, mut client, pool) = server_channel().await;

    // Announce 100 bytes, deliver 10, then FIN.
    client.write_all(&100u16.to_le_bytes()).await.expect("prefix");
    client.write_all(&[0u8; 10]).await.expect("partial");
    drop(client);

    let err = channel.read_frame().await.expect_err("truncated");
    assert!(matches!(err, ChannelError::Closed), "got {err:?}");
    assert_eq!(pool.idle_buffers(), 1, "rented buffer must not leak");
}

#[tokio::test]
async fn test_cancel_receive_unblocks_reader() {
    let (channel, _client, _pool) = server_channel().await;
    let channel = Arc::new(channel);

    let reader = Arc::clone(&channel);
    let pending = tokio::spawn(async move { reader.read_frame().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    channel.cancel_receive();

    let err = pending.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, ChannelError::Cancelled), "got {err:?}");
}

#[tokio::test]
async fn test_send_rejects_empty_and_oversized() {
    let (channel, _client, _pool) = server_channel().await;

    assert!(matches!(
        channel.send(&[]).await,
        Err(ChannelError::Rejected(_))
    ));

    let too_big = vec![0u8; MAX_FRAME_LEN - FRAME_PREFIX_LEN + 1];
    assert!(matches!(
        channel.send(&too_big).await,
        Err(ChannelError::Rejected(_))
    ));
}

#[tokio::test]
async fn test_dispose_is_one_shot() {
    let (channel, _client, _pool) = server_channel().await;

    assert!(channel.dispose(), "first dispose owns the close");
    assert!(!channel.dispose(), "second dispose is a no-op");
    assert!(channel.is_closed());

    assert!(matches!(
        channel.read_frame().await,
        Err(ChannelError::Closed)
    ));
}
