//! Crusher lifecycle shared by the TCP and datagram crushers.
//!
//! ```text
//! Closed --open--> Open --freeze--> Frozen
//!   ^               |  <--unfreeze--  |
//!   +----close------+-------close-----+
//! ```
//!
//! `crush` is `close` followed by `open` under the same lock. Every
//! transition runs its socket work as a command on the reactor thread and
//! returns once that command finished.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CrusherError, Result};
use crate::filter::FilterRepository;
use crate::lock;
use crate::reactor::{Context, Reactor, Service, ServiceId};

/// Lifecycle state of a crusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrusherState {
    Closed,
    Open,
    Frozen,
}

/// Control surface common to TCP and datagram crushers.
pub trait NetCrusher {
    /// Bind and start relaying. Fails if already open.
    fn open(&self) -> Result<()>;

    /// Close every session and the bound socket. No-op when closed.
    fn close(&self) -> Result<()>;

    /// Close and reopen, severing every session.
    fn crush(&self) -> Result<()>;

    /// Suspend all I/O, keeping sessions and queued data.
    fn freeze(&self) -> Result<()>;

    /// Resume I/O after [`freeze`](NetCrusher::freeze).
    fn unfreeze(&self) -> Result<()>;

    fn state(&self) -> CrusherState;

    /// True when open or frozen.
    fn is_open(&self) -> bool {
        self.state() != CrusherState::Closed
    }

    fn is_frozen(&self) -> bool {
        self.state() == CrusherState::Frozen
    }

    /// Address clients connect to. After the first `open` this is the
    /// actual bound address, so an ephemeral port stays stable across
    /// reopens.
    fn bind_address(&self) -> SocketAddr;

    /// Address traffic is relayed to.
    fn connect_address(&self) -> SocketAddr;

    fn filters(&self) -> &FilterRepository;
}

/// Resolve `addr` to its first socket address.
pub(crate) fn resolve<A: ToSocketAddrs>(addr: A, what: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| CrusherError::Config(format!("cannot resolve {what}: {e}")))?
        .next()
        .ok_or_else(|| CrusherError::Config(format!("{what} resolved to no address")))
}

/// Loop-side half of a crusher: owns the bound socket and every session.
pub(crate) trait Endpoint: Service + Sized {
    type Config: Send + Sync + 'static;

    /// Bind to `bind` and register with the reactor.
    fn open(
        ctx: &mut Context<'_>,
        config: Arc<Self::Config>,
        bind: SocketAddr,
        filters: FilterRepository,
    ) -> io::Result<Self>;

    fn local_addr(&self) -> SocketAddr;

    fn set_frozen(&mut self, ctx: &mut Context<'_>, frozen: bool) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct LifecycleState {
    service: Option<ServiceId>,
    frozen: bool,
    /// Actual address of the last successful bind
    bound: Option<SocketAddr>,
}

impl LifecycleState {
    fn crusher_state(&self) -> CrusherState {
        match (self.service, self.frozen) {
            (None, _) => CrusherState::Closed,
            (Some(_), false) => CrusherState::Open,
            (Some(_), true) => CrusherState::Frozen,
        }
    }
}

/// Caller-side state machine driving an [`Endpoint`] on a reactor.
///
/// The mutex serialises transitions of one crusher and is held while the
/// transition's command runs. Readers never take it: every transition
/// publishes a copy of its state, so filters running on the loop thread
/// can inspect the crusher while a transition waits on that thread.
/// Transitions and queries issued from the loop thread itself fail with
/// [`CrusherError::ReactorThread`].
pub(crate) struct Lifecycle<E: Endpoint> {
    kind: &'static str,
    reactor: Reactor,
    config: Arc<E::Config>,
    filters: FilterRepository,
    bind_address: SocketAddr,
    connect_address: SocketAddr,
    state: Mutex<LifecycleState>,
    published: ArcSwap<LifecycleState>,
}

impl<E: Endpoint> Lifecycle<E> {
    pub(crate) fn new(
        kind: &'static str,
        reactor: Reactor,
        config: E::Config,
        filters: FilterRepository,
        bind_address: SocketAddr,
        connect_address: SocketAddr,
    ) -> Self {
        let initial = LifecycleState {
            service: None,
            frozen: false,
            bound: None,
        };
        Self {
            kind,
            reactor,
            config: Arc::new(config),
            filters,
            bind_address,
            connect_address,
            state: Mutex::new(initial),
            published: ArcSwap::from_pointee(initial),
        }
    }

    pub(crate) fn config(&self) -> &E::Config {
        &self.config
    }

    pub(crate) fn filters(&self) -> &FilterRepository {
        &self.filters
    }

    pub(crate) fn connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn bind_address(&self) -> SocketAddr {
        self.published.load().bound.unwrap_or(self.bind_address)
    }

    pub(crate) fn state(&self) -> CrusherState {
        self.published.load().crusher_state()
    }

    pub(crate) fn open(&self) -> Result<()> {
        self.transition(|state| {
            if state.service.is_some() {
                return Err(CrusherError::invalid_state(format!(
                    "{} crusher is already open",
                    self.kind
                )));
            }
            self.open_locked(state)
        })
    }

    pub(crate) fn close(&self) -> Result<()> {
        self.transition(|state| self.close_locked(state))
    }

    pub(crate) fn crush(&self) -> Result<()> {
        self.transition(|state| {
            if state.service.is_none() {
                return Err(CrusherError::invalid_state(format!(
                    "{} crusher is closed",
                    self.kind
                )));
            }
            self.close_locked(state)?;
            self.open_locked(state)?;
            info!(kind = self.kind, bind = ?state.bound, "Crusher crushed");
            Ok(())
        })
    }

    pub(crate) fn freeze(&self) -> Result<()> {
        self.transition(|state| self.set_frozen_locked(state, true))
    }

    pub(crate) fn unfreeze(&self) -> Result<()> {
        self.transition(|state| self.set_frozen_locked(state, false))
    }

    /// Run `f` against the loop-side endpoint. Fails when closed.
    pub(crate) fn query<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut E, &mut Context<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.reactor.in_reactor_thread() {
            return Err(CrusherError::ReactorThread);
        }
        let id = self.published.load().service.ok_or_else(|| {
            CrusherError::invalid_state(format!("{} crusher is closed", self.kind))
        })?;
        // A concurrent close leaves `id` uninstalled, reported as invalid state
        self.reactor.execute(move |el| el.with_service::<E, _, _>(id, f))
    }

    /// Run `f` under the transition lock and publish the resulting state.
    fn transition<R>(&self, f: impl FnOnce(&mut LifecycleState) -> Result<R>) -> Result<R> {
        if self.reactor.in_reactor_thread() {
            return Err(CrusherError::ReactorThread);
        }
        let mut state = lock(&self.state);
        let result = f(&mut *state);
        self.published.store(Arc::new(*state));
        result
    }

    fn open_locked(&self, state: &mut LifecycleState) -> Result<()> {
        let bind = state.bound.unwrap_or(self.bind_address);
        let config = Arc::clone(&self.config);
        let filters = self.filters.clone();

        let (id, local) = self.reactor.execute(move |el| {
            let id = el.add_service(|ctx| E::open(ctx, config, bind, filters))?;
            let local = el.with_service::<E, _, _>(id, |endpoint, _| endpoint.local_addr())?;
            Ok((id, local))
        })?;

        state.service = Some(id);
        state.frozen = false;
        state.bound = Some(local);
        info!(
            kind = self.kind,
            bind = %local,
            connect = %self.connect_address,
            "Crusher opened"
        );
        Ok(())
    }

    fn close_locked(&self, state: &mut LifecycleState) -> Result<()> {
        let Some(id) = state.service.take() else {
            return Ok(());
        };
        state.frozen = false;

        match self.reactor.execute(move |el| Ok(el.remove_service(id))) {
            Ok(_) => {}
            // Sockets were released when the loop stopped
            Err(CrusherError::ReactorClosed) => {
                debug!(kind = self.kind, "Reactor already closed");
            }
            Err(e) => {
                state.service = Some(id);
                return Err(e);
            }
        }

        info!(kind = self.kind, bind = ?state.bound, "Crusher closed");
        Ok(())
    }

    fn set_frozen_locked(&self, state: &mut LifecycleState, frozen: bool) -> Result<()> {
        let id = state.service.ok_or_else(|| {
            CrusherError::invalid_state(format!("{} crusher is closed", self.kind))
        })?;
        if state.frozen == frozen {
            return Ok(());
        }

        self.reactor
            .execute(move |el| el.with_service::<E, _, _>(id, |e, ctx| e.set_frozen(ctx, frozen)))??;

        state.frozen = frozen;
        info!(
            kind = self.kind,
            bind = ?state.bound,
            "{}",
            if frozen { "Crusher frozen" } else { "Crusher unfrozen" }
        );
        Ok(())
    }
}

impl<E: Endpoint> Drop for Lifecycle<E> {
    fn drop(&mut self) {
        if !self.reactor.in_reactor_thread() {
            if let Err(e) = self.close() {
                warn!(kind = self.kind, error = %e, "Failed to close crusher on drop");
            }
            return;
        }

        // A blocking close on the loop thread would wait on itself
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = state.service.take() else {
            return;
        };
        match self.reactor.submit(move |el| Ok(el.remove_service(id))) {
            Ok(_pending) => debug!(kind = self.kind, "Crusher removal queued on drop"),
            Err(CrusherError::ReactorClosed) => {}
            Err(e) => warn!(kind = self.kind, error = %e, "Failed to close crusher on drop"),
        }
    }
}
