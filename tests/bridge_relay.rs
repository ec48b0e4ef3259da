//! Duplex bridge tests against a loopback "emulator".
//!
//! The guest side is an in-memory `tokio::io::duplex` pair; the remote side is
//! a `TcpListener` the test accepts from directly, so it can drop and accept
//! connections at will.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, duplex};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use vdevice_launcher::bridge::{
    Bridge, BridgeConfig, RemoteLink, guest_to_remote, remote_to_guest,
};
use vdevice_launcher::state_machine::link_sm::LinkStatus;

const RETRY: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

async fn emulator() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    timeout(WAIT, listener.accept())
        .await
        .expect("bridge never connected")
        .unwrap()
        .0
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, reader.read(&mut buf))
        .await
        .expect("no data arrived")
        .unwrap();
    buf[..n].to_vec()
}

fn config(remote: SocketAddr) -> BridgeConfig {
    BridgeConfig {
        retry_interval: RETRY,
        ..BridgeConfig::new(remote)
    }
}

#[tokio::test]
async fn relays_bytes_in_both_directions() {
    let (listener, addr) = emulator().await;
    let (mut guest_tx, guest_in) = duplex(256);
    let (guest_out, mut guest_rx) = duplex(256);

    let bridge = Bridge::connect(config(addr), guest_in, guest_out).await;
    assert_eq!(bridge.link().generation(), 1);
    assert_eq!(bridge.link().status().await, LinkStatus::Connected);
    tokio::spawn(bridge.run());

    let mut remote = accept(&listener).await;

    guest_tx.write_all(b"\x01\x03\x0c\x00").await.unwrap();
    assert_eq!(read_some(&mut remote).await, b"\x01\x03\x0c\x00");

    remote.write_all(b"\x04\x0e\x04").await.unwrap();
    assert_eq!(read_some(&mut guest_rx).await, b"\x04\x0e\x04");
}

#[tokio::test]
async fn initial_connect_waits_for_remote() {
    // Reserve a port, then free it so the first attempts are refused.
    let addr = {
        let (listener, addr) = emulator().await;
        drop(listener);
        addr
    };

    let connecting = tokio::spawn(RemoteLink::connect(addr, RETRY));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!connecting.is_finished());

    let listener = TcpListener::bind(addr).await.unwrap();
    let link = timeout(WAIT, connecting).await.unwrap().unwrap();
    let _remote = accept(&listener).await;

    assert_eq!(link.generation(), 1);
    assert_eq!(link.status().await, LinkStatus::Connected);
}

#[tokio::test]
async fn redundant_reconnects_open_one_socket() {
    let (listener, addr) = emulator().await;
    let link = RemoteLink::connect(addr, RETRY).await;
    let _first = accept(&listener).await;

    let (a, b) = tokio::join!(link.reconnect(1), link.reconnect(1));
    assert_eq!(a.generation(), 2);
    assert_eq!(b.generation(), 2);
    let _second = accept(&listener).await;

    // A late caller holding the old generation does not dial again.
    assert_eq!(link.reconnect(1).await.generation(), 2);
    assert!(
        timeout(Duration::from_millis(200), listener.accept()).await.is_err(),
        "a stale reconnect opened another connection"
    );
    assert_eq!(link.losses().await, 1);
    assert_eq!(link.status().await, LinkStatus::Connected);
}

#[tokio::test]
async fn failed_chunk_is_dropped_and_next_chunk_uses_new_connection() {
    let (listener, addr) = emulator().await;
    let link = Arc::new(RemoteLink::connect(addr, RETRY).await);
    let mut first = accept(&listener).await;

    let (mut guest_tx, guest_in) = duplex(256);
    tokio::spawn({
        let link = Arc::clone(&link);
        async move { guest_to_remote(&link, guest_in, 16).await }
    });

    guest_tx.write_all(b"a").await.unwrap();
    assert_eq!(read_some(&mut first).await, b"a");
    drop(first);

    // Writes to a peer that just closed may still succeed once; keep feeding
    // single chunks until one fails and the relay dials again.
    let mut second = None;
    for _ in 0..50 {
        guest_tx.write_all(b"x").await.unwrap();
        if let Ok(accepted) = timeout(Duration::from_millis(200), listener.accept()).await {
            second = Some(accepted.unwrap().0);
            break;
        }
    }
    let mut second = second.expect("relay never reconnected");

    guest_tx.write_all(b"y").await.unwrap();
    assert_eq!(read_some(&mut second).await, b"y");
    assert_eq!(link.generation(), 2);
}

#[tokio::test]
async fn remote_close_is_recovered_by_reader() {
    let (listener, addr) = emulator().await;
    let (_guest_tx, guest_in) = duplex(256);
    let (guest_out, mut guest_rx) = duplex(256);

    let bridge = Bridge::connect(config(addr), guest_in, guest_out).await;
    tokio::spawn(bridge.run());

    let first = accept(&listener).await;
    drop(first);

    let mut second = accept(&listener).await;
    second.write_all(b"after").await.unwrap();
    assert_eq!(read_some(&mut guest_rx).await, b"after");
}

#[tokio::test]
async fn reader_abandons_replaced_connection() {
    let (listener, addr) = emulator().await;
    let link = Arc::new(RemoteLink::connect(addr, RETRY).await);
    let mut first = accept(&listener).await;

    let (guest_out, mut guest_rx) = duplex(256);
    tokio::spawn({
        let link = Arc::clone(&link);
        async move { remote_to_guest(&link, guest_out, 64).await }
    });
    // Let the reader park on the first connection.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The other direction replaces the connection.
    link.reconnect(1).await;
    let mut second = accept(&listener).await;

    second.write_all(b"new").await.unwrap();
    assert_eq!(read_some(&mut guest_rx).await, b"new");

    first.write_all(b"old").await.unwrap();
    let mut buf = [0u8; 8];
    assert!(
        timeout(Duration::from_millis(200), guest_rx.read(&mut buf)).await.is_err(),
        "bytes from a replaced connection reached the guest"
    );
}

#[tokio::test]
async fn guest_input_eof_ends_that_direction() {
    let (listener, addr) = emulator().await;
    let link = RemoteLink::connect(addr, RETRY).await;
    let _remote = accept(&listener).await;

    let (guest_tx, guest_in) = duplex(64);
    drop(guest_tx);
    timeout(WAIT, guest_to_remote(&link, guest_in, 64))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn guest_output_failure_stops_the_bridge() {
    let (listener, addr) = emulator().await;
    let (_guest_tx, guest_in) = duplex(64);
    let (guest_out, guest_rx) = duplex(64);
    drop(guest_rx);

    let bridge = Bridge::connect(config(addr), guest_in, guest_out).await;
    let running = tokio::spawn(bridge.run());

    let mut remote = accept(&listener).await;
    remote.write_all(b"lost").await.unwrap();

    let result = timeout(WAIT, running).await.unwrap().unwrap();
    assert!(result.is_err());
}
