use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use super::{DatagramConfig, DatagramCrusher};
use crate::crusher::{Lifecycle, NetCrusher, resolve};
use crate::error::{CrusherError, Result};
use crate::filter::{Filter, FilterRepository};
use crate::reactor::Reactor;
use crate::socket::DatagramSocketOptions;
use crate::transfer::DEFAULT_BUFFER_SIZE;

/// Builder for [`DatagramCrusher`].
pub struct DatagramCrusherBuilder {
    reactor: Option<Reactor>,
    bind_address: Option<Result<SocketAddr>>,
    connect_address: Option<Result<SocketAddr>>,
    buffer_size: usize,
    max_idle: Duration,
    options: DatagramSocketOptions,
    filters: FilterRepository,
}

impl Default for DatagramCrusherBuilder {
    fn default() -> Self {
        Self {
            reactor: None,
            bind_address: None,
            connect_address: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_idle: Duration::ZERO,
            options: DatagramSocketOptions::default(),
            filters: FilterRepository::new(),
        }
    }
}

impl DatagramCrusherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reactor(mut self, reactor: &Reactor) -> Self {
        self.reactor = Some(reactor.clone());
        self
    }

    pub fn bind_address<A: ToSocketAddrs>(mut self, addr: A) -> Self {
        self.bind_address = Some(resolve(addr, "bind address"));
        self
    }

    pub fn connect_address<A: ToSocketAddrs>(mut self, addr: A) -> Self {
        self.connect_address = Some(resolve(addr, "connect address"));
        self
    }

    /// Receive buffer size; longer datagrams are truncated.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Evict sessions without traffic for longer than `max_idle`.
    /// [`Duration::ZERO`] (the default) keeps them until close.
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn socket_options(mut self, options: DatagramSocketOptions) -> Self {
        self.options = options;
        self
    }

    pub fn filters(mut self, filters: FilterRepository) -> Self {
        self.filters = filters;
        self
    }

    pub fn outgoing_filter(self, name: impl Into<String>, filter: impl Filter + 'static) -> Self {
        self.filters.outgoing().add(name, filter);
        self
    }

    pub fn incoming_filter(self, name: impl Into<String>, filter: impl Filter + 'static) -> Self {
        self.filters.incoming().add(name, filter);
        self
    }

    pub fn build(self) -> Result<DatagramCrusher> {
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

        let config = DatagramConfig {
            connect_address,
            buffer_size: self.buffer_size,
            max_idle: self.max_idle,
            options: self.options,
        };

        Ok(DatagramCrusher {
            lifecycle: Lifecycle::new(
                "udp",
                reactor,
                config,
                self.filters,
                bind_address,
                connect_address,
            ),
        })
    }

    pub fn build_and_open(self) -> Result<DatagramCrusher> {
        let crusher = self.build()?;
        crusher.open()?;
        Ok(crusher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields() {
        let reactor = Reactor::new().unwrap();

        assert!(matches!(
            DatagramCrusherBuilder::new()
                .bind_address("127.0.0.1:0")
                .connect_address("127.0.0.1:1")
                .build(),
            Err(CrusherError::Config(_))
        ));
        assert!(matches!(
            DatagramCrusherBuilder::new()
                .reactor(&reactor)
                .connect_address("127.0.0.1:1")
                .build(),
            Err(CrusherError::Config(_))
        ));
        assert!(matches!(
            DatagramCrusherBuilder::new()
                .reactor(&reactor)
                .bind_address("127.0.0.1:0")
                .buffer_size(16)
                .build(),
            Err(CrusherError::Config(_))
        ));
        reactor.close();
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let reactor = Reactor::new().unwrap();
        let result = DatagramCrusherBuilder::new()
            .reactor(&reactor)
            .bind_address("127.0.0.1:0")
            .connect_address("127.0.0.1:1")
            .buffer_size(0)
            .build();
        assert!(matches!(result, Err(CrusherError::Config(_))));
        reactor.close();
    }

    #[test]
    fn test_open_binds_ephemeral_port() {
        let reactor = Reactor::new().unwrap();
        let crusher = DatagramCrusherBuilder::new()
            .reactor(&reactor)
            .bind_address("127.0.0.1:0")
            .connect_address("127.0.0.1:1")
            .max_idle(Duration::from_secs(1))
            .build_and_open()
            .unwrap();

        let bound = crusher.bind_address();
        assert_ne!(bound.port(), 0);
        assert_eq!(crusher.inner().unwrap().local, bound);
        assert!(crusher.outers().unwrap().is_empty());

        crusher.close().unwrap();
        assert!(crusher.inner().is_err());
        reactor.close();
    }
}
