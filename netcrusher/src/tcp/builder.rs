use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::AtomicU64;

use super::{TcpConfig, TcpCrusher};
use crate::crusher::{Lifecycle, NetCrusher, resolve};
use crate::error::{CrusherError, Result};
use crate::filter::{Filter, FilterRepository};
use crate::reactor::Reactor;
use crate::socket::TcpSocketOptions;
use crate::transfer::{DEFAULT_BUFFER_SIZE, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK, Watermarks};

/// Builder for [`TcpCrusher`].
///
/// Reactor, bind address and connect address are required. Address errors
/// are reported by [`build`](TcpCrusherBuilder::build).
pub struct TcpCrusherBuilder {
    reactor: Option<Reactor>,
    bind_address: Option<Result<SocketAddr>>,
    connect_address: Option<Result<SocketAddr>>,
    buffer_size: usize,
    watermarks: (usize, usize),
    options: TcpSocketOptions,
    filters: FilterRepository,
}

impl Default for TcpCrusherBuilder {
    fn default() -> Self {
        Self {
            reactor: None,
            bind_address: None,
            connect_address: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            watermarks: (DEFAULT_LOW_WATERMARK, DEFAULT_HIGH_WATERMARK),
            options: TcpSocketOptions::default(),
            filters: FilterRepository::new(),
        }
    }
}

impl TcpCrusherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reactor(mut self, reactor: &Reactor) -> Self {
        self.reactor = Some(reactor.clone());
        self
    }

    /// Address clients connect to. Port 0 binds an ephemeral port.
    pub fn bind_address<A: ToSocketAddrs>(mut self, addr: A) -> Self {
        self.bind_address = Some(resolve(addr, "bind address"));
        self
    }

    pub fn connect_address<A: ToSocketAddrs>(mut self, addr: A) -> Self {
        self.connect_address = Some(resolve(addr, "connect address"));
        self
    }

    /// Size of a single socket read.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Per-direction queue thresholds: reading pauses at `high` queued bytes
    /// and resumes at `low`.
    pub fn watermarks(mut self, low: usize, high: usize) -> Self {
        self.watermarks = (low, high);
        self
    }

    pub fn socket_options(mut self, options: TcpSocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Share an existing filter repository.
    pub fn filters(mut self, filters: FilterRepository) -> Self {
        self.filters = filters;
        self
    }

    /// Add a client to remote filter.
    pub fn outgoing_filter(self, name: impl Into<String>, filter: impl Filter + 'static) -> Self {
        self.filters.outgoing().add(name, filter);
        self
    }

    /// Add a remote to client filter.
    pub fn incoming_filter(self, name: impl Into<String>, filter: impl Filter + 'static) -> Self {
        self.filters.incoming().add(name, filter);
        self
    }

    /// Validate the configuration. The crusher starts closed.
    pub fn build(self) -> Result<TcpCrusher> {
        let reactor = self
            .reactor
            .ok_or_else(|| CrusherError::Config("reactor is not set".into()))?;
        let bind_address = self
            .bind_address
            .ok_or_else(|| CrusherError::Config("bind address is not set".into()))??;
        let connect_address = self
            .connect_address
            .ok_or_else(|| CrusherError::Config("connect address is not set".into()))??;
        if self.buffer_size == 0 {
            return Err(CrusherError::Config("buffer size must be positive".into()));
        }
        let (low, high) = self.watermarks;
        let watermarks = Watermarks::new(low, high)?;

        let config = TcpConfig {
            connect_address,
            buffer_size: self.buffer_size,
            watermarks,
            options: self.options,
            accepted: AtomicU64::new(0),
        };

        Ok(TcpCrusher {
            lifecycle: Lifecycle::new(
                "tcp",
                reactor,
                config,
                self.filters,
                bind_address,
                connect_address,
            ),
        })
    }

    pub fn build_and_open(self) -> Result<TcpCrusher> {
        let crusher = self.build()?;
        crusher.open()?;
        Ok(crusher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_reactor() {
        let result = TcpCrusherBuilder::new()
            .bind_address("127.0.0.1:0")
            .connect_address("127.0.0.1:1")
            .build();
        assert!(matches!(result, Err(CrusherError::Config(_))));
    }

    #[test]
    fn test_missing_addresses() {
        let reactor = Reactor::new().unwrap();

        let result = TcpCrusherBuilder::new()
            .reactor(&reactor)
            .connect_address("127.0.0.1:1")
            .build();
        assert!(matches!(result, Err(CrusherError::Config(_))));

        let result = TcpCrusherBuilder::new()
            .reactor(&reactor)
            .bind_address("127.0.0.1:0")
            .build();
        assert!(matches!(result, Err(CrusherError::Config(_))));
        reactor.close();
    }

    #[test]
    fn test_unresolvable_address() {
        let reactor = Reactor::new().unwrap();
        let result = TcpCrusherBuilder::new()
            .reactor(&reactor)
            .bind_address("not an address")
            .connect_address("127.0.0.1:1")
            .build();
        assert!(matches!(result, Err(CrusherError::Config(_))));
        reactor.close();
    }

    #[test]
    fn test_invalid_sizes() {
        let reactor = Reactor::new().unwrap();
        let base = || {
            TcpCrusherBuilder::new()
                .reactor(&reactor)
                .bind_address("127.0.0.1:0")
                .connect_address("127.0.0.1:1")
        };

        assert!(matches!(
            base().buffer_size(0).build(),
            Err(CrusherError::Config(_))
        ));
        assert!(matches!(
            base().watermarks(1024, 1024).build(),
            Err(CrusherError::Config(_))
        ));
        assert!(base().watermarks(1, 2).build().is_ok());
        reactor.close();
    }

    #[test]
    fn test_build_starts_closed() {
        let reactor = Reactor::new().unwrap();
        let crusher = TcpCrusherBuilder::new()
            .reactor(&reactor)
            .bind_address("127.0.0.1:0")
            .connect_address("127.0.0.1:1")
            .outgoing_filter("noop", |_: SocketAddr, d: Vec<u8>| d)
            .build()
            .unwrap();

        assert!(!crusher.is_open());
        assert!(!crusher.is_frozen());
        assert_eq!(crusher.filters().outgoing().names(), vec!["noop"]);
        assert!(crusher.pairs().is_err());
        drop(crusher);
        reactor.close();
    }
}
