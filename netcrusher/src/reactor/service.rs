//! Loop-side services and socket registrations.
//!
//! Every crusher installs one [`Service`] on its reactor. The service owns
//! the crusher's sockets and session table; the reactor only maps readiness
//! tokens back to the service that registered them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Instant;

use mio::event::{Event, Source};
use mio::{Interest, Registry, Token};

/// Identifier of a service installed on a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub(crate) u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service({})", self.0)
    }
}

/// Loop-side state of a crusher. Only ever touched on the loop thread.
pub(crate) trait Service: Any + Send {
    /// Handle readiness of the socket registered under `token`.
    fn ready(&mut self, ctx: &mut Context<'_>, token: Token, event: &Event) -> io::Result<()>;

    /// `ready` failed for `token`; close the session that owns it.
    fn fail(&mut self, ctx: &mut Context<'_>, token: Token, error: io::Error);

    /// Periodic housekeeping, called once per reactor tick.
    fn tick(&mut self, _ctx: &mut Context<'_>, _now: Instant) {}

    /// Release every socket. Called once, when the service is removed or
    /// the reactor stops.
    fn shutdown(&mut self, ctx: &mut Context<'_>);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Token allocation and ownership.
///
/// Tokens are never reused, so a readiness event that arrives after its
/// session was closed can never be delivered to a newer session.
pub(crate) struct TokenTable {
    next: usize,
    owners: HashMap<Token, ServiceId>,
}

impl TokenTable {
    pub(crate) fn new(first: usize) -> Self {
        Self {
            next: first,
            owners: HashMap::new(),
        }
    }

    fn allocate(&mut self, owner: ServiceId) -> Token {
        let token = Token(self.next);
        self.next += 1;
        self.owners.insert(token, owner);
        token
    }

    fn release(&mut self, token: Token) {
        self.owners.remove(&token);
    }

    pub(crate) fn owner(&self, token: Token) -> Option<ServiceId> {
        self.owners.get(&token).copied()
    }

    pub(crate) fn purge(&mut self, owner: ServiceId) {
        self.owners.retain(|_, o| *o != owner);
    }

    pub(crate) fn len(&self) -> usize {
        self.owners.len()
    }
}

/// What a service may touch while handling an event or a command.
pub(crate) struct Context<'a> {
    registry: &'a Registry,
    tokens: &'a mut TokenTable,
    service: ServiceId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(registry: &'a Registry, tokens: &'a mut TokenTable, service: ServiceId) -> Self {
        Self {
            registry,
            tokens,
            service,
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.registry
    }

    /// Reserve a token for a new socket. Interest starts as none.
    pub(crate) fn registration(&mut self) -> Registration {
        Registration {
            token: self.tokens.allocate(self.service),
            interest: None,
        }
    }
}

/// Readiness interest of one socket: none, read, write or both.
///
/// mio has no empty interest, so "none" is expressed by deregistering the
/// socket while keeping its token.
#[derive(Debug)]
pub(crate) struct Registration {
    token: Token,
    interest: Option<Interest>,
}

impl Registration {
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    #[cfg(test)]
    pub(crate) fn interest(&self) -> Option<Interest> {
        self.interest
    }

    /// Switch the socket's interest to `wanted`, touching the selector only
    /// when it actually changes.
    pub(crate) fn update<S>(
        &mut self,
        ctx: &Context<'_>,
        source: &mut S,
        wanted: Option<Interest>,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let registry = ctx.registry();
        match (self.interest, wanted) {
            (None, None) => {}
            (None, Some(interest)) => registry.register(source, self.token, interest)?,
            (Some(_), None) => registry.deregister(source)?,
            (Some(current), Some(interest)) => {
                if current != interest {
                    registry.reregister(source, self.token, interest)?;
                }
            }
        }
        self.interest = wanted;
        Ok(())
    }

    /// Deregister the socket and give the token back.
    pub(crate) fn release<S>(self, ctx: &mut Context<'_>, source: &mut S)
    where
        S: Source + ?Sized,
    {
        if self.interest.is_some() {
            let _ = ctx.registry().deregister(source);
        }
        ctx.tokens.release(self.token);
    }
}

/// Interest for the given read/write wishes.
pub(crate) fn interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_combinations() {
        assert_eq!(interest(false, false), None);
        assert_eq!(interest(true, false), Some(Interest::READABLE));
        assert_eq!(interest(false, true), Some(Interest::WRITABLE));
        assert_eq!(
            interest(true, true),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn test_token_table_never_reuses() {
        let mut table = TokenTable::new(1);
        let a = table.allocate(ServiceId(1));
        table.release(a);
        let b = table.allocate(ServiceId(1));
        assert_ne!(a, b);
        assert_eq!(table.owner(a), None);
        assert_eq!(table.owner(b), Some(ServiceId(1)));
    }

    #[test]
    fn test_token_table_purge() {
        let mut table = TokenTable::new(1);
        table.allocate(ServiceId(1));
        table.allocate(ServiceId(1));
        let kept = table.allocate(ServiceId(2));
        table.purge(ServiceId(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.owner(kept), Some(ServiceId(2)));
    }

    #[test]
    fn test_registration_toggles_interest() {
        let poll = mio::Poll::new().unwrap();
        let mut tokens = TokenTable::new(1);
        let mut ctx = Context::new(poll.registry(), &mut tokens, ServiceId(7));

        let mut socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut reg = ctx.registration();
        assert_eq!(reg.interest(), None);

        reg.update(&ctx, &mut socket, interest(true, false)).unwrap();
        assert_eq!(reg.interest(), Some(Interest::READABLE));

        reg.update(&ctx, &mut socket, interest(true, true)).unwrap();
        reg.update(&ctx, &mut socket, None).unwrap();
        assert_eq!(reg.interest(), None);

        // Registering again after a full deregistration must work
        reg.update(&ctx, &mut socket, interest(false, true)).unwrap();
        let token = reg.token();
        reg.release(&mut ctx, &mut socket);
        assert_eq!(tokens.owner(token), None);
    }
}
