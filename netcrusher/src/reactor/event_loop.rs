//! State owned by the reactor's loop thread.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Poll};
use tracing::{debug, trace, warn};

use super::command::panic_message;
use super::service::{Context, Service, ServiceId, TokenTable};
use crate::error::{CrusherError, Result};

/// Everything the loop thread owns: the selector, the installed services and
/// the token table.
///
/// Only reachable from commands submitted through
/// [`Reactor::submit`](super::Reactor::submit), so every mutation of the
/// registration table happens on the loop thread.
pub struct EventLoop {
    poll: Poll,
    services: HashMap<ServiceId, Box<dyn Service>>,
    tokens: TokenTable,
    next_service: u64,
}

impl EventLoop {
    pub(crate) fn new(poll: Poll, first_token: usize) -> Self {
        Self {
            poll,
            services: HashMap::new(),
            tokens: TokenTable::new(first_token),
            next_service: 1,
        }
    }

    /// Number of services currently installed.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of live socket tokens across all services.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub(crate) fn select(&mut self, events: &mut Events, timeout: Duration) -> io::Result<()> {
        self.poll.poll(events, Some(timeout))
    }

    /// Build a service on the loop thread and install it.
    ///
    /// Tokens reserved by a failing builder are released again.
    pub(crate) fn add_service<S, F>(&mut self, build: F) -> io::Result<ServiceId>
    where
        S: Service,
        F: FnOnce(&mut Context<'_>) -> io::Result<S>,
    {
        let id = ServiceId(self.next_service);
        self.next_service += 1;

        let mut ctx = Context::new(self.poll.registry(), &mut self.tokens, id);
        match build(&mut ctx) {
            Ok(service) => {
                self.services.insert(id, Box::new(service));
                debug!(service = %id, "Service installed");
                Ok(id)
            }
            Err(e) => {
                self.tokens.purge(id);
                Err(e)
            }
        }
    }

    /// Shut a service down and drop it. Returns false if it was not installed.
    pub(crate) fn remove_service(&mut self, id: ServiceId) -> bool {
        let Some(mut service) = self.services.remove(&id) else {
            return false;
        };

        let mut ctx = Context::new(self.poll.registry(), &mut self.tokens, id);
        service.shutdown(&mut ctx);
        self.tokens.purge(id);
        debug!(service = %id, "Service removed");
        true
    }

    /// Run `f` against the installed service `id` of concrete type `S`.
    pub(crate) fn with_service<S, R, F>(&mut self, id: ServiceId, f: F) -> Result<R>
    where
        S: Service,
        F: FnOnce(&mut S, &mut Context<'_>) -> R,
    {
        let service = self
            .services
            .get_mut(&id)
            .and_then(|s| s.as_any_mut().downcast_mut::<S>())
            .ok_or_else(|| CrusherError::invalid_state(format!("{id} is not installed")))?;

        let mut ctx = Context::new(self.poll.registry(), &mut self.tokens, id);
        Ok(f(service, &mut ctx))
    }

    /// Deliver one readiness event to the service owning its token.
    ///
    /// A failing or panicking handler only closes the session behind the
    /// token; the loop keeps running.
    pub(crate) fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        let Some(id) = self.tokens.owner(token) else {
            trace!(?token, "Event for released token");
            return;
        };
        let Some(service) = self.services.get_mut(&id) else {
            return;
        };

        let mut ctx = Context::new(self.poll.registry(), &mut self.tokens, id);
        let result = panic::catch_unwind(AssertUnwindSafe(|| service.ready(&mut ctx, token, event)))
            .unwrap_or_else(|payload| {
                Err(io::Error::other(format!(
                    "handler panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        if let Err(e) = result {
            service.fail(&mut ctx, token, e);
        }
    }

    pub(crate) fn tick(&mut self, now: Instant) {
        for (id, service) in self.services.iter_mut() {
            let mut ctx = Context::new(self.poll.registry(), &mut self.tokens, *id);
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| service.tick(&mut ctx, now)))
            {
                warn!(service = %id, error = %panic_message(payload.as_ref()), "Tick panicked");
            }
        }
    }

    /// Shut down every service. Used when the loop stops.
    pub(crate) fn shutdown_all(&mut self) {
        for (id, mut service) in self.services.drain() {
            let mut ctx = Context::new(self.poll.registry(), &mut self.tokens, id);
            service.shutdown(&mut ctx);
            self.tokens.purge(id);
        }
    }
}
