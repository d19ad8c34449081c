//! Loopback servers and polling helpers shared by the integration tests.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// TCP server echoing every connection until end of stream, then shutting
/// down its write half.
pub struct TcpEchoServer {
    pub addr: SocketAddr,
    received: Arc<AtomicUsize>,
}

impl TcpEchoServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo server");
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&received);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let counter = Arc::clone(&counter);
                thread::spawn(move || echo(stream, counter));
            }
        });

        Self { addr, received }
    }

    /// Bytes received over all connections.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

fn echo(mut stream: TcpStream, counter: Arc<AtomicUsize>) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                counter.fetch_add(n, Ordering::SeqCst);
                if stream.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
    let _ = stream.shutdown(Shutdown::Write);
}

/// UDP server replying to every datagram with the same payload.
pub struct UdpEchoServer {
    pub addr: SocketAddr,
    received: Arc<AtomicUsize>,
}

impl UdpEchoServer {
    pub fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind echo server");
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&received);
        thread::spawn(move || {
            let mut buf = [0u8; 65536];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf) else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket.send_to(&buf[..n], peer);
            }
        });

        Self { addr, received }
    }

    /// Datagrams received so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

/// Loopback UDP client with a receive timeout.
pub fn udp_client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    socket
}

/// Send `payload` to `target` and wait for one reply.
pub fn udp_round_trip(socket: &UdpSocket, target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    socket.send_to(payload, target).unwrap();
    let mut buf = [0u8; 65536];
    let (n, from) = socket.recv_from(&mut buf).expect("datagram reply");
    assert_eq!(from, target);
    buf[..n].to_vec()
}

/// Whether a blocking read timed out rather than returning data or EOF.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
