// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The UDP admission ladder: short datagrams drop before any lookup,
//! unknown identifiers drop, unauthenticated datagrams drop by default,
//! and an explicit authenticator opens the path to dispatch.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use packet_fabric_rs::{
    connection::identifier::Identifier,
    listener::udp::DatagramAuthenticator,
    packet::{header::PACKET_HEADER_LEN, packet::Packet},
    registry::{handler::HandlerMeta, table::RegistryBuilder},
    server::{Server, ServerContext},
};
use serial_test::serial;
use tokio::net::UdpSocket;
use zerocopy::IntoBytes;

use super::common::{RawClient, echo_table, start_server, test_config, wait_until};

struct AllowAll;

impl DatagramAuthenticator for AllowAll {
    fn is_authenticated(
        &self,
        _conn: &packet_fabric_rs::connection::connection::Connection,
        _datagram: &[u8],
    ) -> bool {
        true
    }
}

fn udp_config() -> packet_fabric_rs::cfg::config::ServerConfig {
    let mut cfg = test_config();
    cfg.transport.udp_port = Some(0);
    cfg
}

async fn udp_client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind udp client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_short_datagram_drops_before_lookup() {
    let mut server = start_server(udp_config(), echo_table()).await;
    let ctx = Arc::clone(server.context());
    let udp_addr = server.udp_addr().expect("udp addr");

    let client = udp_client().await;
    let short = vec![0u8; PACKET_HEADER_LEN + Identifier::SIZE - 1];
    client.send_to(&short, udp_addr).await.expect("send");

    let counters = Arc::clone(&ctx.udp_counters);
    wait_until("drop_short to increment", Duration::from_secs(5), move || {
        counters.snapshot().drop_short == 1
    })
    .await;
    let snap = ctx.udp_counters.snapshot();
    assert_eq!(snap.drop_unknown, 0, "no connection lookup was attempted");
    assert_eq!(snap.rx_packets, 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_unknown_identifier_drops() {
    let mut server = start_server(udp_config(), echo_table()).await;
    let ctx = Arc::clone(server.context());
    let udp_addr = server.udp_addr().expect("udp addr");

    let mut datagram = Packet::new(0x0001, &b"hello"[..])
        .to_packet_bytes()
        .expect("packet");
    datagram.extend_from_slice(Identifier::generate(9).as_bytes());

    let client = udp_client().await;
    client.send_to(&datagram, udp_addr).await.expect("send");

    let counters = Arc::clone(&ctx.udp_counters);
    wait_until("drop_unknown to increment", Duration::from_secs(5), move || {
        counters.snapshot().drop_unknown == 1
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_default_deny_drops_known_identifier() {
    let mut server = start_server(udp_config(), echo_table()).await;
    let ctx = Arc::clone(server.context());
    let udp_addr = server.udp_addr().expect("udp addr");

    // Establish the connection over TCP so the identifier is known.
    let _tcp = RawClient::connect(&server).await.expect("connect");
    let hub_probe = Arc::clone(&ctx);
    wait_until("connection to register", Duration::from_secs(5), move || {
        hub_probe.hub.len() == 1
    })
    .await;
    let identifier =
        ctx.hub.snapshot().pop().expect("one connection").identifier();

    let mut datagram = Packet::new(0x0001, &b"hello"[..])
        .to_packet_bytes()
        .expect("packet");
    datagram.extend_from_slice(identifier.as_bytes());

    let client = udp_client().await;
    client.send_to(&datagram, udp_addr).await.expect("send");

    let counters = Arc::clone(&ctx.udp_counters);
    wait_until("drop_unauth to increment", Duration::from_secs(5), move || {
        counters.snapshot().drop_unauth == 1
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_authenticated_datagram_dispatches() {
    let handled = Arc::new(AtomicU32::new(0));
    let handled_in_handler = Arc::clone(&handled);

    let mut builder = RegistryBuilder::new();
    builder
        .register_sync(HandlerMeta::new(0x0055, "udp-sink"), move |ctx| {
            assert_eq!(ctx.packet.payload.as_ref(), b"datagram body");
            handled_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .expect("register");

    let ctx = ServerContext::new(udp_config());
    let mut server = Server::new(Arc::clone(&ctx), Arc::new(builder.build().expect("table")))
        .with_authenticator(Arc::new(AllowAll));
    server.start().await.expect("server starts");
    let udp_addr = server.udp_addr().expect("udp addr");

    let _tcp = RawClient::connect(&server).await.expect("connect");
    let hub_probe = Arc::clone(&ctx);
    wait_until("connection to register", Duration::from_secs(5), move || {
        hub_probe.hub.len() == 1
    })
    .await;
    let identifier =
        ctx.hub.snapshot().pop().expect("one connection").identifier();

    let mut datagram = Packet::new(0x0055, &b"datagram body"[..])
        .to_packet_bytes()
        .expect("packet");
    datagram.extend_from_slice(identifier.as_bytes());

    let client = udp_client().await;
    client.send_to(&datagram, udp_addr).await.expect("send");

    let handled_probe = Arc::clone(&handled);
    wait_until("datagram to reach handler", Duration::from_secs(5), move || {
        handled_probe.load(Ordering::SeqCst) == 1
    })
    .await;

    server.shutdown().await;
}
