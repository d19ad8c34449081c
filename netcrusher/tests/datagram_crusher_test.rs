//! Datagram crusher integration tests over loopback.

mod common;

use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use common::{UdpEchoServer, is_timeout, udp_client, udp_round_trip, wait_until};
use netcrusher::{
    CrusherError, CrusherState, DatagramCrusher, DatagramCrusherBuilder, NetCrusher, Reactor,
};

fn crusher(reactor: &Reactor, remote: SocketAddr, max_idle: Duration) -> DatagramCrusher {
    DatagramCrusherBuilder::new()
        .reactor(reactor)
        .bind_address("127.0.0.1:0")
        .connect_address(remote)
        .max_idle(max_idle)
        .build_and_open()
        .expect("open crusher")
}

fn fast_reactor() -> Reactor {
    Reactor::builder()
        .tick(Duration::from_millis(10))
        .build()
        .unwrap()
}

fn assert_no_datagram(socket: &UdpSocket) {
    let mut buf = [0u8; 1024];
    match socket.recv_from(&mut buf) {
        Ok((n, _)) => panic!("unexpected datagram: {:?}", &buf[..n]),
        Err(e) => assert!(is_timeout(&e), "unexpected error: {e}"),
    }
}

// ============================================================================
// Relaying
// ============================================================================

#[test]
fn test_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = Reactor::new().unwrap();
    let crusher = crusher(&reactor, server.addr, Duration::ZERO);
    let target = crusher.bind_address();

    let client = udp_client();
    assert_eq!(udp_round_trip(&client, target, b"hello"), b"hello");

    let inner = crusher.inner().unwrap();
    assert_eq!(inner.received, 1);
    assert_eq!(inner.sent, 1);
    assert_eq!(inner.sessions, 1);

    let outers = crusher.outers().unwrap();
    assert_eq!(outers.len(), 1);
    assert_eq!(outers[0].client, client.local_addr().unwrap());
    assert_eq!(outers[0].upstream.datagrams, 1);
    assert_eq!(outers[0].upstream.bytes, 5);
    assert_eq!(outers[0].downstream.datagrams, 1);

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_replies_routed_to_their_peer() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = Reactor::new().unwrap();
    let crusher = crusher(&reactor, server.addr, Duration::ZERO);
    let target = crusher.bind_address();

    let peers: Vec<_> = (0..2)
        .map(|id| {
            thread::spawn(move || {
                let client = udp_client();
                for seq in 0..50 {
                    let payload = format!("peer-{id}-{seq}");
                    let reply = udp_round_trip(&client, target, payload.as_bytes());
                    assert_eq!(reply, payload.as_bytes());
                }
                client.local_addr().unwrap()
            })
        })
        .collect();
    let mut clients: Vec<_> = peers.into_iter().map(|p| p.join().unwrap()).collect();
    clients.sort();

    let outers = crusher.outers().unwrap();
    let sessions: Vec<_> = outers.iter().map(|o| o.client).collect();
    assert_eq!(sessions, clients);
    assert!(outers.iter().all(|o| o.upstream.datagrams == 50));
    assert_eq!(server.received(), 100);

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_filter_can_drop_datagrams() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = Reactor::new().unwrap();
    let crusher = DatagramCrusherBuilder::new()
        .reactor(&reactor)
        .bind_address("127.0.0.1:0")
        .connect_address(server.addr)
        .outgoing_filter("drop", |_: SocketAddr, data: Vec<u8>| {
            if data == b"drop me" { Vec::new() } else { data }
        })
        .incoming_filter("upper", |_: SocketAddr, data: Vec<u8>| data.to_ascii_uppercase())
        .build_and_open()
        .unwrap();
    let target = crusher.bind_address();

    let client = udp_client();
    client.send_to(b"drop me", target).unwrap();
    assert_no_datagram(&client);
    assert_eq!(udp_round_trip(&client, target, b"keep me"), b"KEEP ME");

    assert_eq!(server.received(), 1);
    assert_eq!(crusher.inner().unwrap().dropped, 1);

    crusher.close().unwrap();
    reactor.close();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_freeze_drops_datagrams() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = Reactor::new().unwrap();
    let crusher = crusher(&reactor, server.addr, Duration::ZERO);
    let target = crusher.bind_address();

    let client = udp_client();
    assert_eq!(udp_round_trip(&client, target, b"before"), b"before");

    crusher.freeze().unwrap();
    assert!(crusher.is_frozen());
    client.send_to(b"lost", target).unwrap();
    assert_no_datagram(&client);

    crusher.unfreeze().unwrap();
    // Still not delivered after unfreeze
    assert_no_datagram(&client);
    assert_eq!(server.received(), 1);

    // The session survived the freeze
    assert_eq!(crusher.outers().unwrap().len(), 1);
    assert!(crusher.inner().unwrap().dropped >= 1);
    assert_eq!(udp_round_trip(&client, target, b"after"), b"after");

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_crush_discards_sessions() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = Reactor::new().unwrap();
    let crusher = crusher(&reactor, server.addr, Duration::ZERO);
    let target = crusher.bind_address();

    let client = udp_client();
    assert_eq!(udp_round_trip(&client, target, b"one"), b"one");
    assert_eq!(crusher.outers().unwrap().len(), 1);

    crusher.crush().unwrap();
    assert_eq!(crusher.bind_address(), target);
    assert!(crusher.outers().unwrap().is_empty());
    assert_eq!(crusher.inner().unwrap().received, 0);

    assert_eq!(udp_round_trip(&client, target, b"two"), b"two");
    assert_eq!(crusher.outers().unwrap().len(), 1);
    assert_eq!(crusher.inner().unwrap().received, 1);

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_state_and_invalid_transitions() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = Reactor::new().unwrap();
    let crusher = crusher(&reactor, server.addr, Duration::ZERO);

    assert_eq!(crusher.state(), CrusherState::Open);
    assert!(matches!(crusher.open(), Err(CrusherError::InvalidState(_))));

    crusher.freeze().unwrap();
    assert_eq!(crusher.state(), CrusherState::Frozen);
    crusher.crush().unwrap();
    assert_eq!(crusher.state(), CrusherState::Open);

    crusher.close().unwrap();
    assert_eq!(crusher.state(), CrusherState::Closed);
    assert!(matches!(crusher.freeze(), Err(CrusherError::InvalidState(_))));
    assert!(matches!(crusher.outers(), Err(CrusherError::InvalidState(_))));
    crusher.close().unwrap();

    reactor.close();
}

// ============================================================================
// Idle eviction
// ============================================================================

#[test]
fn test_idle_session_is_evicted() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = fast_reactor();
    let crusher = crusher(&reactor, server.addr, Duration::from_millis(200));
    let target = crusher.bind_address();

    let client = udp_client();
    assert_eq!(udp_round_trip(&client, target, b"ping"), b"ping");
    assert_eq!(crusher.outers().unwrap().len(), 1);
    let tokens = || reactor.execute(|el| Ok(el.token_count())).unwrap();
    // Inner socket plus the session socket
    assert_eq!(tokens(), 2);

    assert!(wait_until(Duration::from_secs(2), || {
        crusher.outers().unwrap().is_empty()
    }));
    assert_eq!(tokens(), 1);

    // A new datagram opens a fresh session
    assert_eq!(udp_round_trip(&client, target, b"ping"), b"ping");
    assert_eq!(crusher.outers().unwrap().len(), 1);

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_active_session_is_kept() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = fast_reactor();
    let crusher = crusher(&reactor, server.addr, Duration::from_millis(300));
    let target = crusher.bind_address();

    let client = udp_client();
    let first = {
        udp_round_trip(&client, target, b"0");
        crusher.outers().unwrap()[0].local
    };

    for i in 1..10 {
        thread::sleep(Duration::from_millis(60));
        let payload = i.to_string();
        assert_eq!(udp_round_trip(&client, target, payload.as_bytes()), payload.as_bytes());
    }

    let outers = crusher.outers().unwrap();
    assert_eq!(outers.len(), 1);
    assert_eq!(outers[0].local, first);
    assert_eq!(outers[0].upstream.datagrams, 10);

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_zero_idle_never_evicts() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = fast_reactor();
    let crusher = crusher(&reactor, server.addr, Duration::ZERO);
    let target = crusher.bind_address();

    let client = udp_client();
    udp_round_trip(&client, target, b"stay");
    thread::sleep(Duration::from_millis(200));
    assert_eq!(crusher.outers().unwrap().len(), 1);

    crusher.close().unwrap();
    reactor.close();
}

#[test]
fn test_frozen_sessions_are_not_evicted() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = UdpEchoServer::start();
    let reactor = fast_reactor();
    let crusher = crusher(&reactor, server.addr, Duration::from_millis(100));
    let target = crusher.bind_address();

    let client = udp_client();
    udp_round_trip(&client, target, b"x");

    crusher.freeze().unwrap();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(crusher.outers().unwrap().len(), 1);

    crusher.unfreeze().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        crusher.outers().unwrap().is_empty()
    }));

    crusher.close().unwrap();
    reactor.close();
}
