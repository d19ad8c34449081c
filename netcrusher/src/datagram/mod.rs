//! Datagram (UDP) crusher.
//!
//! One client-facing socket (the inner) receives datagrams from any number
//! of clients. Each client address gets its own socket connected to the
//! remote endpoint (an outer); replies on that socket are sent back to the
//! client through the inner. Sessions idle for longer than the configured
//! limit are evicted on reactor ticks.
//!
//! Nothing is buffered: a datagram that cannot be sent right away, or that
//! arrives while the crusher is frozen, is dropped.

mod builder;
mod endpoint;
mod outer;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub use builder::DatagramCrusherBuilder;
pub use endpoint::DatagramInnerInfo;
pub use outer::{DatagramFlowInfo, DatagramOuterInfo};

use self::endpoint::DatagramEndpoint;
use crate::crusher::{CrusherState, Lifecycle, NetCrusher};
use crate::error::Result;
use crate::filter::FilterRepository;
use crate::socket::DatagramSocketOptions;

#[derive(Debug)]
pub(crate) struct DatagramConfig {
    connect_address: SocketAddr,
    /// Largest datagram relayed without truncation
    buffer_size: usize,
    /// Zero disables eviction
    max_idle: Duration,
    options: DatagramSocketOptions,
}

/// UDP relay between a bound address and a remote address.
///
/// Dropping the crusher closes it.
pub struct DatagramCrusher {
    lifecycle: Lifecycle<DatagramEndpoint>,
}

impl DatagramCrusher {
    pub fn builder() -> DatagramCrusherBuilder {
        DatagramCrusherBuilder::new()
    }

    /// Counters of the client-facing socket since the last open.
    pub fn inner(&self) -> Result<DatagramInnerInfo> {
        self.lifecycle.query(|endpoint, _| endpoint.inner_info())
    }

    /// Snapshot of the live sessions, ordered by client address.
    pub fn outers(&self) -> Result<Vec<DatagramOuterInfo>> {
        self.lifecycle.query(|endpoint, _| endpoint.outers())
    }

    /// Close the session of `client`. Returns false if there is none.
    pub fn close_outer(&self, client: SocketAddr) -> Result<bool> {
        self.lifecycle
            .query(move |endpoint, ctx| endpoint.close_outer(ctx, client))
    }

    pub fn max_idle(&self) -> Duration {
        self.lifecycle.config().max_idle
    }
}

impl NetCrusher for DatagramCrusher {
    fn open(&self) -> Result<()> {
        self.lifecycle.open()
    }

    fn close(&self) -> Result<()> {
        self.lifecycle.close()
    }

    fn crush(&self) -> Result<()> {
        self.lifecycle.crush()
    }

    fn freeze(&self) -> Result<()> {
        self.lifecycle.freeze()
    }

    fn unfreeze(&self) -> Result<()> {
        self.lifecycle.unfreeze()
    }

    fn state(&self) -> CrusherState {
        self.lifecycle.state()
    }

    fn bind_address(&self) -> SocketAddr {
        self.lifecycle.bind_address()
    }

    fn connect_address(&self) -> SocketAddr {
        self.lifecycle.connect_address()
    }

    fn filters(&self) -> &FilterRepository {
        self.lifecycle.filters()
    }
}

impl fmt::Debug for DatagramCrusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramCrusher")
            .field("bind", &self.bind_address())
            .field("connect", &self.connect_address())
            .field("state", &self.state())
            .field("max_idle", &self.max_idle())
            .finish()
    }
}
