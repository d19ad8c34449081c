//! Commands executed on the reactor's loop thread and their result slots.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};

use super::event_loop::EventLoop;
use crate::error::{CrusherError, Result};

/// A unit of work queued for the loop thread.
///
/// Dropping a command without running it drops its result sender, which the
/// waiting side observes as [`CrusherError::ReactorClosed`].
pub(crate) type Command = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Wrap `f` into a command plus the slot its result is delivered to.
pub(crate) fn command<T, F>(f: F) -> (Command, Pending<T>)
where
    F: FnOnce(&mut EventLoop) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = bounded(1);

    let command: Command = Box::new(move |event_loop| {
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(event_loop))).unwrap_or_else(
            |payload| Err(CrusherError::CommandPanicked(panic_message(payload.as_ref()))),
        );
        // The waiter may have given up already
        let _ = tx.send(result);
    });

    (command, Pending { rx })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pending result of a command submitted to a [`Reactor`](super::Reactor).
///
/// Abandoning the wait (dropping this value or timing out) does not cancel
/// the command; it still runs on the loop thread.
#[must_use = "a pending result does nothing unless waited on"]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Block until the command has run and return its result.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(CrusherError::ReactorClosed))
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CrusherError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CrusherError::ReactorClosed),
        }
    }

    /// Non-blocking poll; `None` while the command has not run yet.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(CrusherError::ReactorClosed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");

        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");

        let s: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(s.as_ref()), "unknown panic");
    }

    #[test]
    fn test_dropped_command_reports_reactor_closed() {
        let (command, pending) = command(|_| Ok(1u32));
        drop(command);
        assert!(matches!(pending.wait(), Err(CrusherError::ReactorClosed)));
    }

    #[test]
    fn test_pending_try_take_before_run() {
        let (_command, pending) = command(|_| Ok(()));
        assert!(pending.try_take().is_none());
    }
}
