//! Event poll (§4.1, C1): a single kernel readiness object multiplexing
//! every fd a Processor cares about — peer sockets, the listening socket,
//! and the internal kick eventfd (C2).
//!
//! Grounded on the teacher's dependency on `mio` (previously only for
//! `mio::unix::pipe` in `process/channel.rs`); generalized here to the
//! crate's full `Poll`/`Registry`/`Events` surface.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;

bitflags::bitflags! {
    /// §4.1: "a bitset of {readable, writable, error, hangup}".
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(ev: &mio::event::Event) -> Self {
        let mut r = Readiness::empty();
        if ev.is_readable() {
            r |= Readiness::READABLE;
        }
        if ev.is_writable() {
            r |= Readiness::WRITABLE;
        }
        if ev.is_error() {
            r |= Readiness::ERROR;
        }
        if ev.is_read_closed() || ev.is_write_closed() {
            r |= Readiness::HANGUP;
        }
        r
    }
}

type Callback = Box<dyn FnMut(Readiness) -> bool + Send>;

/// The poll (§4.1). One per Processor; owns no sockets, only callbacks
/// keyed by the fd's `mio::Token`.
pub struct Poller {
    poll: Mutex<Poll>,
    registry: mio::Registry,
    next_token: AtomicUsize,
    callbacks: Mutex<HashMap<Token, (RawFd, Callback)>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            next_token: AtomicUsize::new(1),
            callbacks: Mutex::new(HashMap::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// The poll's own fd, so it can be nested inside another loop (§4.1).
    pub fn as_raw_fd(&self) -> RawFd {
        self.poll.lock().unwrap().as_raw_fd()
    }

    /// `add(fd, events, callback)`. Registration is thread-safe: it takes
    /// effect before the dispatcher's next wakeup because the dispatcher
    /// only ever touches `callbacks` while holding its mutex, same as a
    /// registration from another thread.
    pub fn add(&self, fd: RawFd, events: Readiness, callback: Callback) -> Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        let interest = to_interest(events);
        self.registry.register(&mut SourceFd(&fd), token, interest)?;
        self.callbacks.lock().unwrap().insert(token, (fd, callback));
        Ok(token)
    }

    /// `remove(fd)`'s token-keyed counterpart. Safe to call from inside
    /// any callback, including the callback of the very token being
    /// removed: `dispatch` never holds `callbacks` while a callback is
    /// running (see below), so this lock is never re-entered on the
    /// dispatcher's own thread. Removing from another thread blocks on
    /// the same mutex an in-flight `dispatch` holds while it is taking a
    /// callback out to run it, which is "wait for any in-flight
    /// invocation to be claimed" (§4.1) — not a full wait for the
    /// invocation to finish, since the lock isn't held for that long.
    pub fn remove(&self, token: Token) -> Result<()> {
        let mut callbacks = self.callbacks.lock().unwrap();
        if let Some((fd, _)) = callbacks.remove(&token) {
            let _ = self.registry.deregister(&mut SourceFd(&fd));
        }
        Ok(())
    }

    /// One `dispatch` tick: blocks up to `timeout`, then invokes every
    /// ready callback. A callback returning `false` removes its fd.
    ///
    /// Each callback is taken out of `callbacks` before it runs and the
    /// lock is released for the duration of the call — a callback may
    /// itself remove a peer (including its own fd, e.g. `drop_peer` on
    /// HANGUP/ERROR) and `Poller::remove` must be free to lock
    /// `callbacks` again without deadlocking on itself.
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = Events::with_capacity(128);
        match self.poll.lock().unwrap().poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in &events {
            let token = event.token();
            let readiness = Readiness::from(event);

            let taken = self.callbacks.lock().unwrap().remove(&token);
            let (fd, mut cb) = match taken {
                Some(v) => v,
                None => continue,
            };

            let keep = cb(readiness);

            if keep {
                self.callbacks.lock().unwrap().insert(token, (fd, cb));
            } else {
                let _ = self.registry.deregister(&mut SourceFd(&fd));
            }
        }
        Ok(())
    }

    /// `run()`: dispatches until `stop()` is called.
    pub fn run(&self) -> Result<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            self.dispatch(Some(Duration::from_millis(250)))?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn to_interest(events: Readiness) -> Interest {
    let mut interest = None;
    if events.contains(Readiness::READABLE) {
        interest = Some(Interest::READABLE);
    }
    if events.contains(Readiness::WRITABLE) {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn add_then_remove_clears_the_callback_table() {
        let poller = Poller::new().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        let token = poller
            .add(r, Readiness::READABLE, Box::new(|_| true))
            .unwrap();
        assert_eq!(poller.callbacks.lock().unwrap().len(), 1);
        poller.remove(token).unwrap();
        assert_eq!(poller.callbacks.lock().unwrap().len(), 0);
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }

    #[test]
    fn writable_pipe_wakes_dispatch() {
        let poller = Poller::new().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = fired.clone();
        poller
            .add(w, Readiness::WRITABLE, Box::new(move |_| {
                fired_cb.store(true, Ordering::SeqCst);
                false
            }))
            .unwrap();
        poller.dispatch(Some(Duration::from_millis(500))).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }
}
