//! One relayed TCP connection: the accepted client socket (inner) and the
//! socket connected to the remote endpoint (outer).

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream;
use serde::Serialize;
use tracing::trace;

use crate::filter::FilterChain;
use crate::reactor::{Context, Registration, interest};
use crate::transfer::{TransferQueue, Watermarks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Inner,
    Outer,
}

/// Byte counters of one direction of a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpFlowInfo {
    /// Bytes read from the source socket, before filtering.
    pub read_bytes: u64,
    /// Bytes written to the destination socket, after filtering.
    pub written_bytes: u64,
    /// Bytes queued for the destination socket.
    pub pending_bytes: usize,
}

/// Snapshot of a live pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpPairInfo {
    pub client: SocketAddr,
    /// Crusher side of the client connection.
    pub inner_local: SocketAddr,
    /// Local end of the connection to the remote endpoint.
    pub outer_local: SocketAddr,
    pub remote: SocketAddr,
    /// Client to remote.
    pub upstream: TcpFlowInfo,
    /// Remote to client.
    pub downstream: TcpFlowInfo,
    pub frozen: bool,
    #[serde(with = "crate::millis")]
    pub age: Duration,
}

/// Data moving from one socket of the pair to the other.
#[derive(Debug)]
struct Flow {
    queue: TransferQueue,
    chain: FilterChain,
    read_bytes: u64,
    written_bytes: u64,
    /// Source reached end of stream
    eof: bool,
    /// Write half of the destination was shut down
    shut: bool,
}

impl Flow {
    fn new(chain: FilterChain, limits: Watermarks) -> Self {
        Self {
            queue: TransferQueue::new(limits),
            chain,
            read_bytes: 0,
            written_bytes: 0,
            eof: false,
            shut: false,
        }
    }

    fn can_read(&self) -> bool {
        !self.eof && !self.queue.is_saturated()
    }

    /// Read from `src` until it would block, queueing filtered data for `dst`.
    fn pump(
        &mut self,
        client: SocketAddr,
        src: &mut TcpStream,
        dst: &mut TcpStream,
        scratch: &mut [u8],
    ) -> io::Result<()> {
        while self.can_read() {
            match src.read(scratch) {
                Ok(0) => {
                    trace!(client = %client, "End of stream");
                    self.eof = true;
                }
                Ok(n) => {
                    self.read_bytes += n as u64;
                    let data = self.chain.apply(client, scratch[..n].to_vec());
                    self.queue.push(data);
                    self.flush(dst)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.finish(dst)
    }

    fn flush(&mut self, dst: &mut TcpStream) -> io::Result<()> {
        let written = self.queue.write_to(dst)?;
        self.written_bytes += written as u64;
        Ok(())
    }

    /// Propagate end of stream once everything queued was written.
    fn finish(&mut self, dst: &mut TcpStream) -> io::Result<()> {
        if self.eof && !self.shut && self.queue.is_empty() {
            match dst.shutdown(Shutdown::Write) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            self.shut = true;
        }
        Ok(())
    }

    fn info(&self) -> TcpFlowInfo {
        TcpFlowInfo {
            read_bytes: self.read_bytes,
            written_bytes: self.written_bytes,
            pending_bytes: self.queue.len(),
        }
    }
}

/// Addresses of both connections of a pair, fixed at setup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PairAddresses {
    inner_local: SocketAddr,
    outer_local: SocketAddr,
    remote: SocketAddr,
}

impl PairAddresses {
    pub(crate) fn of(inner: &TcpStream, outer: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            inner_local: inner.local_addr()?,
            outer_local: outer.local_addr()?,
            remote: outer.peer_addr()?,
        })
    }
}

pub(crate) struct TcpPair {
    client: SocketAddr,
    inner: TcpStream,
    inner_reg: Registration,
    outer: TcpStream,
    outer_reg: Registration,
    upstream: Flow,
    downstream: Flow,
    addresses: PairAddresses,
    frozen: bool,
    created: Instant,
}

impl TcpPair {
    /// `upstream` filters client to remote traffic, `downstream` the reverse.
    pub(crate) fn new(
        client: SocketAddr,
        addresses: PairAddresses,
        (inner, inner_reg): (TcpStream, Registration),
        (outer, outer_reg): (TcpStream, Registration),
        upstream: FilterChain,
        downstream: FilterChain,
        limits: Watermarks,
    ) -> Self {
        Self {
            client,
            inner,
            inner_reg,
            outer,
            outer_reg,
            upstream: Flow::new(upstream, limits),
            downstream: Flow::new(downstream, limits),
            addresses,
            frozen: false,
            created: Instant::now(),
        }
    }

    pub(crate) fn tokens(&self) -> [mio::Token; 2] {
        [self.inner_reg.token(), self.outer_reg.token()]
    }

    /// Both directions reached end of stream and were fully flushed.
    pub(crate) fn is_finished(&self) -> bool {
        self.upstream.shut && self.downstream.shut
    }

    pub(crate) fn ready(
        &mut self,
        ctx: &Context<'_>,
        side: Side,
        event: &Event,
        scratch: &mut [u8],
    ) -> io::Result<()> {
        if self.frozen {
            return Ok(());
        }

        let client = self.client;
        // `outgoing` leaves through this socket, `incoming` arrives on it
        let (incoming, outgoing, this, other) = match side {
            Side::Inner => (
                &mut self.upstream,
                &mut self.downstream,
                &mut self.inner,
                &mut self.outer,
            ),
            Side::Outer => (
                &mut self.downstream,
                &mut self.upstream,
                &mut self.outer,
                &mut self.inner,
            ),
        };

        if event.is_writable() {
            outgoing.flush(this)?;
            outgoing.finish(this)?;
        }
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            incoming.pump(client, this, other, scratch)?;
        }

        self.refresh(ctx)
    }

    /// Recompute the interest of both sockets from queue and freeze state.
    pub(crate) fn refresh(&mut self, ctx: &Context<'_>) -> io::Result<()> {
        let active = !self.frozen;

        let inner = interest(
            active && self.upstream.can_read(),
            active && !self.downstream.queue.is_empty(),
        );
        let outer = interest(
            active && self.downstream.can_read(),
            active && !self.upstream.queue.is_empty(),
        );

        self.inner_reg.update(ctx, &mut self.inner, inner)?;
        self.outer_reg.update(ctx, &mut self.outer, outer)
    }

    pub(crate) fn set_frozen(&mut self, ctx: &Context<'_>, frozen: bool) -> io::Result<()> {
        self.frozen = frozen;
        self.refresh(ctx)
    }

    /// Deregister and drop both sockets.
    pub(crate) fn close(self, ctx: &mut Context<'_>) {
        let TcpPair {
            mut inner,
            inner_reg,
            mut outer,
            outer_reg,
            ..
        } = self;
        inner_reg.release(ctx, &mut inner);
        outer_reg.release(ctx, &mut outer);
    }

    pub(crate) fn info(&self) -> TcpPairInfo {
        TcpPairInfo {
            client: self.client,
            inner_local: self.addresses.inner_local,
            outer_local: self.addresses.outer_local,
            remote: self.addresses.remote,
            upstream: self.upstream.info(),
            downstream: self.downstream.info(),
            frozen: self.frozen,
            age: self.created.elapsed(),
        }
    }
}
