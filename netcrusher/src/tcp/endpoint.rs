//! Loop-side state of a TCP crusher: the listener, connects in flight and
//! the live pairs.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use tracing::{debug, warn};

use super::TcpConfig;
use super::pair::{PairAddresses, Side, TcpPair, TcpPairInfo};
use crate::crusher::Endpoint;
use crate::filter::FilterRepository;
use crate::reactor::{Context, Registration, Service};
use crate::socket::{self, ConnectState};

/// Accepted client waiting for its connection to the remote endpoint.
struct Connecting {
    client: SocketAddr,
    inner: TcpStream,
    outer: TcpStream,
    outer_reg: Registration,
}

impl Connecting {
    /// Drop both sockets, resetting the client connection.
    fn abort(self, ctx: &mut Context<'_>) {
        let Connecting {
            inner,
            mut outer,
            outer_reg,
            ..
        } = self;
        outer_reg.release(ctx, &mut outer);
        socket::tcp_abort(&inner);
    }
}

pub(crate) struct TcpEndpoint {
    config: Arc<TcpConfig>,
    filters: FilterRepository,
    listener: TcpListener,
    listener_reg: Registration,
    local: SocketAddr,
    connecting: HashMap<Token, Connecting>,
    pairs: HashMap<SocketAddr, TcpPair>,
    routes: HashMap<Token, (SocketAddr, Side)>,
    frozen: bool,
    /// Accept failed with connections possibly left in the backlog
    accept_retry: bool,
    scratch: Vec<u8>,
}

impl TcpEndpoint {
    /// Accept until the backlog is empty.
    ///
    /// Readiness is edge-triggered, so after a failed accept (e.g. out of
    /// descriptors) the remaining backlog raises no new event; the next tick
    /// tries again.
    fn accept(&mut self, ctx: &mut Context<'_>) {
        self.accept_retry = false;
        loop {
            match self.listener.accept() {
                Ok((inner, client)) => {
                    self.config.accepted.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.connect(ctx, inner, client) {
                        warn!(client = %client, error = %e, "Failed to start remote connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(bind = %self.local, error = %e, "Accept failed, retrying on next tick");
                    self.accept_retry = true;
                    break;
                }
            }
        }
    }

    fn connect(&mut self, ctx: &mut Context<'_>, inner: TcpStream, client: SocketAddr) -> io::Result<()> {
        let result = socket::tcp_configure(&inner, &self.config.options)
            .and_then(|()| socket::tcp_connect(self.config.connect_address, &self.config.options));
        let mut outer = match result {
            Ok(outer) => outer,
            Err(e) => {
                socket::tcp_abort(&inner);
                return Err(e);
            }
        };

        let mut outer_reg = ctx.registration();
        if let Err(e) = outer_reg.update(ctx, &mut outer, Some(Interest::WRITABLE)) {
            outer_reg.release(ctx, &mut outer);
            socket::tcp_abort(&inner);
            return Err(e);
        }

        debug!(client = %client, remote = %self.config.connect_address, "Connecting to remote");
        self.connecting.insert(
            outer_reg.token(),
            Connecting {
                client,
                inner,
                outer,
                outer_reg,
            },
        );
        Ok(())
    }

    fn complete_connect(&mut self, ctx: &mut Context<'_>, token: Token) {
        let Some(pending) = self.connecting.get(&token) else {
            return;
        };
        match socket::tcp_connect_state(&pending.outer) {
            Ok(ConnectState::InProgress) => return,
            Ok(ConnectState::Connected) => {}
            Err(e) => {
                if let Some(pending) = self.connecting.remove(&token) {
                    debug!(client = %pending.client, error = %e, "Remote connection failed");
                    pending.abort(ctx);
                }
                return;
            }
        }

        let Some(Connecting {
            client,
            inner,
            mut outer,
            outer_reg,
        }) = self.connecting.remove(&token)
        else {
            return;
        };

        let addresses = match PairAddresses::of(&inner, &outer) {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!(client = %client, error = %e, "Connection dropped before pair setup");
                outer_reg.release(ctx, &mut outer);
                return;
            }
        };

        // A client port is reused only after its previous connection closed
        if self.pairs.contains_key(&client) {
            self.close_pair(ctx, client);
        }

        let inner_reg = ctx.registration();
        let inner_token = inner_reg.token();
        let mut pair = TcpPair::new(
            client,
            addresses,
            (inner, inner_reg),
            (outer, outer_reg),
            self.filters.outgoing().snapshot(),
            self.filters.incoming().snapshot(),
            self.config.watermarks,
        );

        self.routes.insert(inner_token, (client, Side::Inner));
        self.routes.insert(token, (client, Side::Outer));

        let started = pair.set_frozen(ctx, self.frozen);
        self.pairs.insert(client, pair);
        match started {
            Ok(()) => debug!(client = %client, remote = %self.config.connect_address, "Pair created"),
            Err(e) => {
                debug!(client = %client, error = %e, "Failed to register pair");
                self.close_pair(ctx, client);
            }
        }
    }

    pub(crate) fn close_pair(&mut self, ctx: &mut Context<'_>, client: SocketAddr) -> bool {
        let Some(pair) = self.pairs.remove(&client) else {
            return false;
        };
        for token in pair.tokens() {
            self.routes.remove(&token);
        }
        pair.close(ctx);
        debug!(client = %client, "Pair closed");
        true
    }

    pub(crate) fn pairs(&self) -> Vec<TcpPairInfo> {
        let mut pairs: Vec<_> = self.pairs.values().map(TcpPair::info).collect();
        pairs.sort_by_key(|p| p.client);
        pairs
    }
}

impl Endpoint for TcpEndpoint {
    type Config = TcpConfig;

    fn open(
        ctx: &mut Context<'_>,
        config: Arc<TcpConfig>,
        bind: SocketAddr,
        filters: FilterRepository,
    ) -> io::Result<Self> {
        let mut listener = socket::tcp_listen(bind, &config.options)?;
        let local = listener.local_addr()?;

        let mut listener_reg = ctx.registration();
        listener_reg.update(ctx, &mut listener, Some(Interest::READABLE))?;

        let scratch = vec![0; config.buffer_size];
        Ok(Self {
            config,
            filters,
            listener,
            listener_reg,
            local,
            connecting: HashMap::new(),
            pairs: HashMap::new(),
            routes: HashMap::new(),
            frozen: false,
            accept_retry: false,
            scratch,
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn set_frozen(&mut self, ctx: &mut Context<'_>, frozen: bool) -> io::Result<()> {
        self.frozen = frozen;

        let accept = (!frozen).then_some(Interest::READABLE);
        self.listener_reg.update(ctx, &mut self.listener, accept)?;

        let connect = (!frozen).then_some(Interest::WRITABLE);
        for pending in self.connecting.values_mut() {
            pending.outer_reg.update(ctx, &mut pending.outer, connect)?;
        }

        let mut broken = Vec::new();
        for (client, pair) in self.pairs.iter_mut() {
            if let Err(e) = pair.set_frozen(ctx, frozen) {
                debug!(client = %client, error = %e, "Failed to update pair interest");
                broken.push(*client);
            }
        }
        for client in broken {
            self.close_pair(ctx, client);
        }
        Ok(())
    }
}

impl Service for TcpEndpoint {
    fn ready(&mut self, ctx: &mut Context<'_>, token: Token, event: &Event) -> io::Result<()> {
        // Events fetched in the same batch as a freeze command
        if self.frozen {
            return Ok(());
        }

        if token == self.listener_reg.token() {
            self.accept(ctx);
            return Ok(());
        }
        if self.connecting.contains_key(&token) {
            self.complete_connect(ctx, token);
            return Ok(());
        }

        let Some(&(client, side)) = self.routes.get(&token) else {
            return Ok(());
        };
        let Some(pair) = self.pairs.get_mut(&client) else {
            return Ok(());
        };
        pair.ready(ctx, side, event, &mut self.scratch)?;
        if pair.is_finished() {
            self.close_pair(ctx, client);
        }
        Ok(())
    }

    fn fail(&mut self, ctx: &mut Context<'_>, token: Token, error: io::Error) {
        if let Some(&(client, _)) = self.routes.get(&token) {
            debug!(client = %client, error = %error, "Pair I/O failed");
            self.close_pair(ctx, client);
        } else if let Some(pending) = self.connecting.remove(&token) {
            debug!(client = %pending.client, error = %error, "Remote connection failed");
            pending.abort(ctx);
        } else {
            warn!(bind = %self.local, error = %error, "Listener failed");
        }
    }

    fn tick(&mut self, ctx: &mut Context<'_>, _now: Instant) {
        if self.accept_retry && !self.frozen {
            self.accept(ctx);
        }
    }

    fn shutdown(&mut self, ctx: &mut Context<'_>) {
        let clients: Vec<_> = self.pairs.keys().copied().collect();
        for client in clients {
            self.close_pair(ctx, client);
        }
        for (_, pending) in self.connecting.drain() {
            let Connecting {
                mut outer,
                outer_reg,
                ..
            } = pending;
            outer_reg.release(ctx, &mut outer);
        }

        // The token itself is purged with the service
        let _ = self.listener_reg.update(ctx, &mut self.listener, None);
        debug!(bind = %self.local, "TCP endpoint shut down");
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
