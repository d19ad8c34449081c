//! Per-client socket connected to the remote endpoint.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Token};
use serde::Serialize;

use crate::filter::{FilterChain, FilterRepository};
use crate::reactor::{Context, Registration};
use crate::socket::{self, DatagramSocketOptions};

/// Datagram counters of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatagramFlowInfo {
    pub datagrams: u64,
    pub bytes: u64,
}

impl DatagramFlowInfo {
    fn record(&mut self, len: usize) {
        self.datagrams += 1;
        self.bytes += len as u64;
    }
}

/// Snapshot of one client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatagramOuterInfo {
    pub client: SocketAddr,
    /// Local address of the socket connected to the remote endpoint.
    pub local: SocketAddr,
    /// Sent to the remote endpoint, after filtering.
    pub upstream: DatagramFlowInfo,
    /// Received from the remote endpoint, before filtering.
    pub downstream: DatagramFlowInfo,
    /// Time since the last datagram in either direction.
    #[serde(with = "crate::millis")]
    pub idle: Duration,
}

pub(crate) struct DatagramOuter {
    client: SocketAddr,
    socket: UdpSocket,
    reg: Registration,
    local: SocketAddr,
    upstream_chain: FilterChain,
    downstream_chain: FilterChain,
    upstream: DatagramFlowInfo,
    downstream: DatagramFlowInfo,
    last_activity: Instant,
}

impl DatagramOuter {
    pub(crate) fn open(
        ctx: &mut Context<'_>,
        client: SocketAddr,
        remote: SocketAddr,
        options: &DatagramSocketOptions,
        filters: &FilterRepository,
    ) -> io::Result<Self> {
        let mut socket = socket::udp_connect(remote, options)?;
        let local = socket.local_addr()?;

        let mut reg = ctx.registration();
        if let Err(e) = reg.update(ctx, &mut socket, Some(Interest::READABLE)) {
            reg.release(ctx, &mut socket);
            return Err(e);
        }

        Ok(Self {
            client,
            socket,
            reg,
            local,
            upstream_chain: filters.outgoing().snapshot(),
            downstream_chain: filters.incoming().snapshot(),
            upstream: DatagramFlowInfo::default(),
            downstream: DatagramFlowInfo::default(),
            last_activity: Instant::now(),
        })
    }

    pub(crate) fn token(&self) -> Token {
        self.reg.token()
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > max_idle
    }

    /// Filter a client datagram and send it to the remote endpoint.
    ///
    /// Returns false if the datagram was suppressed or the socket buffer was
    /// full.
    pub(crate) fn send(&mut self, data: &[u8]) -> io::Result<bool> {
        self.touch();
        let data = self.upstream_chain.apply(self.client, data.to_vec());
        if data.is_empty() {
            return Ok(false);
        }
        match self.socket.send(&data) {
            Ok(_) => {
                self.upstream.record(data.len());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Receive one reply and filter it for the client.
    ///
    /// `Ok(None)` once the socket would block.
    pub(crate) fn recv(&mut self, scratch: &mut [u8]) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.socket.recv(scratch) {
                Ok(n) => {
                    self.touch();
                    self.downstream.record(n);
                    return Ok(Some(
                        self.downstream_chain.apply(self.client, scratch[..n].to_vec()),
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Discard everything queued in the socket. Returns the datagram count.
    pub(crate) fn drain(&mut self, scratch: &mut [u8]) -> usize {
        let mut dropped = 0;
        loop {
            match self.socket.recv(scratch) {
                Ok(_) => dropped += 1,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return dropped,
            }
        }
    }

    pub(crate) fn set_frozen(&mut self, ctx: &Context<'_>, frozen: bool) -> io::Result<()> {
        let wanted = (!frozen).then_some(Interest::READABLE);
        self.reg.update(ctx, &mut self.socket, wanted)
    }

    pub(crate) fn close(self, ctx: &mut Context<'_>) {
        let DatagramOuter {
            mut socket, reg, ..
        } = self;
        reg.release(ctx, &mut socket);
    }

    pub(crate) fn info(&self, now: Instant) -> DatagramOuterInfo {
        DatagramOuterInfo {
            client: self.client,
            local: self.local,
            upstream: self.upstream,
            downstream: self.downstream,
            idle: now.saturating_duration_since(self.last_activity),
        }
    }
}
