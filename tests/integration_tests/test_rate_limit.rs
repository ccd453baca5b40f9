// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connections beyond the per-IP allowance are closed promptly, before
//! any data is exchanged; connections within it stay up.

use std::{sync::Arc, time::Duration};

use serial_test::serial;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::common::{echo_table, start_server, test_config, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_connections_beyond_allowance_are_closed() {
    let mut cfg = test_config();
    cfg.accept.max_connections_per_ip = 5;
    cfg.accept.connection_allowance = 5;
    cfg.accept.allowance_window = Duration::from_secs(60);

    let mut server = start_server(cfg, echo_table()).await;
    let addr = server.tcp_addr().expect("tcp addr");
    let ctx = Arc::clone(server.context());

    let mut sockets = Vec::new();
    for _ in 0..20 {
        sockets.push(TcpStream::connect(addr).await.expect("tcp connect"));
    }

    // Exactly the allowance survives; every admitted socket is registered.
    let hub_probe = Arc::clone(&ctx);
    wait_until("admitted connections to register", Duration::from_secs(5), move || {
        hub_probe.hub.len() == 5
    })
    .await;
    // Let the accept loops finish rejecting the rest before probing.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Rejected sockets see EOF within the latency budget, with no bytes.
    let mut closed = 0;
    let mut open = 0;
    for mut socket in sockets {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(100), socket.read(&mut byte))
            .await
        {
            Ok(Ok(0)) => closed += 1,
            Ok(Ok(_)) => panic!("server must not send data"),
            Ok(Err(_)) => closed += 1,
            // Still open: the read just waits.
            Err(_) => open += 1,
        }
    }
    assert_eq!(open, 5, "allowance worth of connections stay up");
    assert_eq!(closed, 15, "the rest are closed without any data");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_closed_connections_release_their_slots() {
    let mut cfg = test_config();
    cfg.accept.max_connections_per_ip = 2;
    cfg.accept.connection_allowance = 100;
    cfg.accept.allowance_window = Duration::from_secs(1);

    let mut server = start_server(cfg, echo_table()).await;
    let addr = server.tcp_addr().expect("tcp addr");
    let ctx = Arc::clone(server.context());

    let first = TcpStream::connect(addr).await.expect("connect");
    let _second = TcpStream::connect(addr).await.expect("connect");
    let hub_probe = Arc::clone(&ctx);
    wait_until("two connections", Duration::from_secs(5), move || {
        hub_probe.hub.len() == 2
    })
    .await;

    // Slot comes back once a connection closes.
    drop(first);
    let hub_probe = Arc::clone(&ctx);
    wait_until("close to release the slot", Duration::from_secs(5), move || {
        hub_probe.hub.len() == 1
    })
    .await;

    let _third = TcpStream::connect(addr).await.expect("connect");
    let hub_probe = Arc::clone(&ctx);
    wait_until("replacement to be admitted", Duration::from_secs(5), move || {
        hub_probe.hub.len() == 2
    })
    .await;

    server.shutdown().await;
}
