// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A client sends a framed packet and receives the echoed payload back
//! through the whole pipeline: accept, framing, dispatch, handler, reply.

use packet_fabric_rs::packet::{packet::Packet, priority::Priority};

use super::common::{RawClient, echo_table, start_server, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_client_echo() {
    let mut server = start_server(test_config(), echo_table()).await;
    let mut client = RawClient::connect(&server).await.expect("connect");

    let request = Packet::new(0x0001, &b"hi"[..])
        .with_id(42)
        .with_priority(Priority::Normal);
    client.send_packet(&request).await.expect("send");

    let reply = client.read_packet().await.expect("echo reply");
    assert_eq!(reply.opcode, 0x0001);
    assert_eq!(reply.id, 42);
    assert_eq!(reply.payload.as_ref(), b"hi");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_many_sequential_echoes() {
    let mut server = start_server(test_config(), echo_table()).await;
    let mut client = RawClient::connect(&server).await.expect("connect");

    for i in 0..100u16 {
        let payload = format!("message-{i}").into_bytes();
        let request = Packet::new(0x0001, payload.clone()).with_id(i);
        client.send_packet(&request).await.expect("send");

        let reply = client.read_packet().await.expect("reply");
        assert_eq!(reply.id, i);
        assert_eq!(reply.payload.as_ref(), payload.as_slice());
    }

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_echo_independently() {
    let server = start_server(test_config(), echo_table()).await;

    let mut joins = Vec::new();
    for c in 0..8u16 {
        let mut client = RawClient::connect(&server).await.expect("connect");
        joins.push(tokio::spawn(async move {
            for i in 0..20u16 {
                let payload = format!("client-{c}-msg-{i}").into_bytes();
                let request = Packet::new(0x0001, payload.clone()).with_id(i);
                client.send_packet(&request).await.expect("send");
                let reply = client.read_packet().await.expect("reply");
                assert_eq!(reply.payload.as_ref(), payload.as_slice());
            }
        }));
    }
    for join in joins {
        join.await.expect("client task");
    }

    let mut server = server;
    server.shutdown().await;
}
