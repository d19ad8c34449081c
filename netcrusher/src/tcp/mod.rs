//! TCP crusher.
//!
//! Every accepted client connection gets its own connection to the remote
//! endpoint. The two are relayed as a pair: bytes flow both ways through
//! per-direction queues and filter chains, reads pause while the opposite
//! queue is above its high watermark, and an orderly shutdown on one side
//! is propagated to the other once its queue is flushed.

mod builder;
mod endpoint;
mod pair;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

pub use builder::TcpCrusherBuilder;
pub use pair::{TcpFlowInfo, TcpPairInfo};

use self::endpoint::TcpEndpoint;
use crate::crusher::{CrusherState, Lifecycle, NetCrusher};
use crate::error::Result;
use crate::filter::FilterRepository;
use crate::socket::TcpSocketOptions;
use crate::transfer::Watermarks;

/// Settings shared by the handle and the loop-side endpoint.
#[derive(Debug)]
pub(crate) struct TcpConfig {
    connect_address: SocketAddr,
    buffer_size: usize,
    watermarks: Watermarks,
    options: TcpSocketOptions,
    /// Connections accepted over the crusher's lifetime
    accepted: AtomicU64,
}

/// TCP relay between a bound address and a remote address.
///
/// Dropping the crusher closes it.
pub struct TcpCrusher {
    lifecycle: Lifecycle<TcpEndpoint>,
}

impl TcpCrusher {
    pub fn builder() -> TcpCrusherBuilder {
        TcpCrusherBuilder::new()
    }

    /// Snapshot of the live pairs, ordered by client address.
    pub fn pairs(&self) -> Result<Vec<TcpPairInfo>> {
        self.lifecycle.query(|endpoint, _| endpoint.pairs())
    }

    /// Close the pair of `client`. Returns false if there is none.
    pub fn close_pair(&self, client: SocketAddr) -> Result<bool> {
        self.lifecycle
            .query(move |endpoint, ctx| endpoint.close_pair(ctx, client))
    }

    /// Client connections accepted since the crusher was built.
    pub fn accepted_count(&self) -> u64 {
        self.lifecycle.config().accepted.load(Ordering::Relaxed)
    }
}

impl NetCrusher for TcpCrusher {
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

impl fmt::Debug for TcpCrusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpCrusher")
            .field("bind", &self.bind_address())
            .field("connect", &self.connect_address())
            .field("state", &self.state())
            .finish()
    }
}
