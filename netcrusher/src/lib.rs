//! netcrusher: a controllable TCP/UDP relay for failure-injection tests.
//!
//! A crusher listens on a bind address and relays traffic to a remote
//! address. Tests can sever every session ([`NetCrusher::crush`]), suspend
//! traffic ([`NetCrusher::freeze`]) and resume it
//! ([`NetCrusher::unfreeze`]) without touching the code under test.
//!
//! ```no_run
//! use netcrusher::{NetCrusher, Reactor, TcpCrusherBuilder};
//!
//! # fn main() -> netcrusher::Result<()> {
//! let reactor = Reactor::new()?;
//! let crusher = TcpCrusherBuilder::new()
//!     .reactor(&reactor)
//!     .bind_address("127.0.0.1:10081")
//!     .connect_address("127.0.0.1:10082")
//!     .build_and_open()?;
//!
//! // exercise the client against 127.0.0.1:10081
//! crusher.crush()?;
//! // the client must reconnect now
//!
//! crusher.close()?;
//! reactor.close();
//! # Ok(())
//! # }
//! ```

pub mod crusher;
pub mod datagram;
pub mod error;
pub mod filter;
pub mod reactor;
pub mod socket;
pub mod tcp;
pub mod transfer;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use crusher::{CrusherState, NetCrusher};
pub use datagram::{
    DatagramCrusher, DatagramCrusherBuilder, DatagramFlowInfo, DatagramInnerInfo, DatagramOuterInfo,
};
pub use error::{CrusherError, Result};
pub use filter::{Filter, FilterChain, FilterList, FilterRepository};
pub use reactor::{Pending, Reactor, ReactorBuilder};
pub use socket::{AddressFamily, DatagramSocketOptions, TcpSocketOptions};
pub use tcp::{TcpCrusher, TcpCrusherBuilder, TcpFlowInfo, TcpPairInfo};
pub use transfer::Watermarks;

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
