//! Single-threaded readiness reactor.
//!
//! One loop thread owns the selector and every socket of every crusher
//! registered with it. Other threads never touch that state directly; they
//! submit commands which the loop thread drains on each wake-up:
//!
//! 1. wait on the selector, bounded by the tick interval
//! 2. run queued commands in submission order
//! 3. dispatch readiness events to the owning services
//! 4. run periodic housekeeping (idle sweeps) once per tick
//!
//! Several crushers may share one reactor.

mod command;
mod event_loop;
mod service;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Poll, Token, Waker};
use tracing::{debug, error, info};

pub use command::Pending;
pub use event_loop::EventLoop;
pub use service::ServiceId;

pub(crate) use command::Command;
pub(crate) use service::{Context, Registration, Service, interest};

use crate::error::{CrusherError, Result};
use crate::lock;

/// Default bounded wait of the selector, also the housekeeping period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(20);

/// Readiness events fetched per selector wait.
const EVENTS_CAPACITY: usize = 1024;

/// Token of the waker used to interrupt the selector on submission.
const WAKER_TOKEN: Token = Token(0);

/// Handle to a running reactor. Cheap to clone; the loop stops when
/// [`close`](Reactor::close) is called or the last handle is dropped.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    commands: Sender<Command>,
    /// Second receiver so a submitter can discard commands that raced with shutdown.
    backlog: Receiver<Command>,
    waker: Waker,
    closed: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

/// Builder for [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorBuilder {
    name: String,
    tick: Duration,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self {
            name: "netcrusher-reactor".to_string(),
            tick: DEFAULT_TICK,
        }
    }
}

impl ReactorBuilder {
    /// Name of the loop thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Upper bound of a selector wait. Idle sweeps run at this granularity.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Create the selector and start the loop thread.
    pub fn build(self) -> Result<Reactor> {
        if self.tick.is_zero() {
            return Err(CrusherError::Config("reactor tick must be positive".into()));
        }

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (commands, queue) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop::new(poll, WAKER_TOKEN.0 + 1);
        let loop_queue = queue.clone();
        let loop_closed = Arc::clone(&closed);
        let tick = self.tick;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(name, event_loop, loop_queue, loop_closed, tick))?;

        let thread_id = handle.thread().id();

        Ok(Reactor {
            shared: Arc::new(Shared {
                name: self.name,
                commands,
                backlog: queue,
                waker,
                closed,
                thread: Mutex::new(Some(handle)),
                thread_id,
            }),
        })
    }
}

impl Reactor {
    /// Start a reactor with default settings.
    pub fn new() -> Result<Self> {
        ReactorBuilder::default().build()
    }

    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True once the reactor was closed or its selector failed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether the calling thread is this reactor's loop thread.
    pub fn in_reactor_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Queue `f` for execution on the loop thread.
    ///
    /// Commands run exactly once, in submission order. A command that
    /// returns an error or panics only fails its own result; the loop
    /// carries on. Commands still queued when the reactor stops fail with
    /// [`CrusherError::ReactorClosed`].
    pub fn submit<T, F>(&self, f: F) -> Result<Pending<T>>
    where
        F: FnOnce(&mut EventLoop) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(CrusherError::ReactorClosed);
        }

        let (command, pending) = command::command(f);
        self.shared
            .commands
            .send(command)
            .map_err(|_| CrusherError::ReactorClosed)?;

        if self.is_closed() {
            // The loop may have drained its queue before our send landed
            self.shared.discard_backlog();
        } else {
            self.shared.waker.wake()?;
        }

        Ok(pending)
    }

    /// Submit `f` and block until it has run.
    ///
    /// Fails with [`CrusherError::ReactorThread`] when called from the loop
    /// thread itself, which would otherwise wait on itself forever.
    pub fn execute<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut EventLoop) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.in_reactor_thread() {
            return Err(CrusherError::ReactorThread);
        }
        self.submit(f)?.wait()
    }

    /// Stop the loop, fail pending commands and release the selector.
    ///
    /// Idempotent and callable from any thread. Close dependent crushers
    /// first; their sockets are released here regardless.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Shared {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(reactor = %self.name, "Closing reactor");
        }
        let _ = self.waker.wake();

        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        if thread::current().id() == self.thread_id {
            // Closed from within a command; the loop exits after this wake-up
            return;
        }
        if handle.join().is_err() {
            error!(reactor = %self.name, "Reactor thread panicked");
        }
    }

    fn discard_backlog(&self) {
        for command in self.backlog.try_iter() {
            drop(command);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

fn run(
    name: String,
    mut event_loop: EventLoop,
    commands: Receiver<Command>,
    closed: Arc<AtomicBool>,
    tick: Duration,
) {
    info!(reactor = %name, tick_ms = tick.as_millis() as u64, "Reactor started");

    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut next_tick = Instant::now() + tick;

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        if let Err(e) = event_loop.select(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(reactor = %name, error = %e, "Selector failed, stopping reactor");
            break;
        }

        // 1. Commands, in submission order
        for command in commands.try_iter() {
            command(&mut event_loop);
        }

        if closed.load(Ordering::Acquire) {
            break;
        }

        // 2. Readiness
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            event_loop.dispatch(event);
        }

        // 3. Housekeeping
        let now = Instant::now();
        if now >= next_tick {
            event_loop.tick(now);
            next_tick = now + tick;
        }
    }

    closed.store(true, Ordering::Release);
    event_loop.shutdown_all();
    let discarded = commands.try_iter().count();

    info!(reactor = %name, discarded, "Reactor stopped");
}
