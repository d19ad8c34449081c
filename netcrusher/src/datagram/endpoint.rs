//! Loop-side state of a datagram crusher: the client-facing socket and the
//! session table keyed by client address.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::event::Event;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::DatagramConfig;
use super::outer::{DatagramOuter, DatagramOuterInfo};
use crate::crusher::Endpoint;
use crate::filter::FilterRepository;
use crate::reactor::{Context, Registration, Service};
use crate::socket;

/// Counters of the client-facing socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatagramInnerInfo {
    pub local: SocketAddr,
    /// Datagrams received from clients.
    pub received: u64,
    /// Datagrams delivered back to clients.
    pub sent: u64,
    /// Datagrams dropped in either direction: suppressed by a filter,
    /// socket buffer full, or arrived while frozen.
    pub dropped: u64,
    pub sessions: usize,
}

pub(crate) struct DatagramEndpoint {
    config: Arc<DatagramConfig>,
    filters: FilterRepository,
    inner: UdpSocket,
    inner_reg: Registration,
    local: SocketAddr,
    outers: HashMap<SocketAddr, DatagramOuter>,
    routes: HashMap<Token, SocketAddr>,
    frozen: bool,
    received: u64,
    sent: u64,
    dropped: u64,
    scratch: Vec<u8>,
}

impl DatagramEndpoint {
    /// Relay client datagrams until the inner socket would block.
    fn read_inner(&mut self, ctx: &mut Context<'_>) -> io::Result<()> {
        loop {
            let (len, client) = match self.inner.recv_from(&mut self.scratch) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.received += 1;

            if !self.outers.contains_key(&client) {
                let remote = self.config.connect_address;
                match DatagramOuter::open(ctx, client, remote, &self.config.options, &self.filters) {
                    Ok(outer) => {
                        self.routes.insert(outer.token(), client);
                        self.outers.insert(client, outer);
                        debug!(client = %client, remote = %remote, "Datagram session created");
                    }
                    Err(e) => {
                        warn!(client = %client, error = %e, "Failed to open datagram session");
                        self.dropped += 1;
                        continue;
                    }
                }
            }

            let Some(outer) = self.outers.get_mut(&client) else {
                continue;
            };
            match outer.send(&self.scratch[..len]) {
                Ok(true) => {}
                Ok(false) => self.dropped += 1,
                Err(e) => {
                    debug!(client = %client, error = %e, "Datagram send failed");
                    self.dropped += 1;
                    self.close_outer(ctx, client);
                }
            }
        }
    }

    /// Relay replies of one session back to its client.
    fn read_outer(&mut self, client: SocketAddr) -> io::Result<()> {
        let Some(outer) = self.outers.get_mut(&client) else {
            return Ok(());
        };

        while let Some(data) = outer.recv(&mut self.scratch)? {
            if data.is_empty() {
                self.dropped += 1;
                continue;
            }
            match self.inner.send_to(&data, client) {
                Ok(_) => self.sent += 1,
                Err(e) => {
                    trace!(client = %client, error = %e, "Reply dropped");
                    self.dropped += 1;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn close_outer(&mut self, ctx: &mut Context<'_>, client: SocketAddr) -> bool {
        let Some(outer) = self.outers.remove(&client) else {
            return false;
        };
        self.routes.remove(&outer.token());
        outer.close(ctx);
        debug!(client = %client, "Datagram session closed");
        true
    }

    pub(crate) fn inner_info(&self) -> DatagramInnerInfo {
        DatagramInnerInfo {
            local: self.local,
            received: self.received,
            sent: self.sent,
            dropped: self.dropped,
            sessions: self.outers.len(),
        }
    }

    pub(crate) fn outers(&self) -> Vec<DatagramOuterInfo> {
        let now = Instant::now();
        let mut outers: Vec<_> = self.outers.values().map(|o| o.info(now)).collect();
        outers.sort_by_key(|o| o.client);
        outers
    }

    /// Drop whatever queued up in kernel buffers while frozen.
    fn discard_queued(&mut self) {
        let mut dropped = 0;
        loop {
            match self.inner.recv_from(&mut self.scratch) {
                Ok(_) => dropped += 1,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        for outer in self.outers.values_mut() {
            dropped += outer.drain(&mut self.scratch);
            // Time spent frozen does not count as idle
            outer.touch();
        }

        if dropped > 0 {
            debug!(bind = %self.local, dropped, "Discarded datagrams received while frozen");
        }
        self.dropped += dropped as u64;
    }
}

impl Endpoint for DatagramEndpoint {
    type Config = DatagramConfig;

    fn open(
        ctx: &mut Context<'_>,
        config: Arc<DatagramConfig>,
        bind: SocketAddr,
        filters: FilterRepository,
    ) -> io::Result<Self> {
        let mut inner = socket::udp_bind(bind, &config.options)?;
        let local = inner.local_addr()?;

        let mut inner_reg = ctx.registration();
        inner_reg.update(ctx, &mut inner, Some(Interest::READABLE))?;

        let scratch = vec![0; config.buffer_size];
        Ok(Self {
            config,
            filters,
            inner,
            inner_reg,
            local,
            outers: HashMap::new(),
            routes: HashMap::new(),
            frozen: false,
            received: 0,
            sent: 0,
            dropped: 0,
            scratch,
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn set_frozen(&mut self, ctx: &mut Context<'_>, frozen: bool) -> io::Result<()> {
        self.frozen = frozen;
        if !frozen {
            self.discard_queued();
        }

        let wanted = (!frozen).then_some(Interest::READABLE);
        self.inner_reg.update(ctx, &mut self.inner, wanted)?;

        let mut broken = Vec::new();
        for (client, outer) in self.outers.iter_mut() {
            if let Err(e) = outer.set_frozen(ctx, frozen) {
                debug!(client = %client, error = %e, "Failed to update session interest");
                broken.push(*client);
            }
        }
        for client in broken {
            self.close_outer(ctx, client);
        }
        Ok(())
    }
}

impl Service for DatagramEndpoint {
    fn ready(&mut self, ctx: &mut Context<'_>, token: Token, _event: &Event) -> io::Result<()> {
        if self.frozen {
            return Ok(());
        }

        if token == self.inner_reg.token() {
            return self.read_inner(ctx);
        }
        match self.routes.get(&token) {
            Some(&client) => self.read_outer(client),
            None => Ok(()),
        }
    }

    fn fail(&mut self, ctx: &mut Context<'_>, token: Token, error: io::Error) {
        if let Some(&client) = self.routes.get(&token) {
            debug!(client = %client, error = %error, "Datagram session failed");
            self.close_outer(ctx, client);
        } else {
            warn!(bind = %self.local, error = %error, "Datagram socket failed");
        }
    }

    fn tick(&mut self, ctx: &mut Context<'_>, now: Instant) {
        let max_idle = self.config.max_idle;
        if self.frozen || max_idle.is_zero() {
            return;
        }

        let idle: Vec<_> = self
            .outers
            .iter()
            .filter(|(_, outer)| outer.is_idle(now, max_idle))
            .map(|(client, _)| *client)
            .collect();
        for client in idle {
            debug!(client = %client, max_idle_ms = max_idle.as_millis() as u64, "Evicting idle session");
            self.close_outer(ctx, client);
        }
    }

    fn shutdown(&mut self, ctx: &mut Context<'_>) {
        let clients: Vec<_> = self.outers.keys().copied().collect();
        for client in clients {
            self.close_outer(ctx, client);
        }
        // The token itself is purged with the service
        let _ = self.inner_reg.update(ctx, &mut self.inner, None);
        debug!(bind = %self.local, "Datagram endpoint shut down");
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
