//! Request queue (§4.2, C2): a `(Tag, T)` FIFO backed by an eventfd kick
//! channel, so a poll loop can observe "queue non-empty" without racing a
//! concurrent pusher.
//!
//! Resolves SPEC_FULL §B.2/§D.1: the original had two near-duplicate
//! `RequestQueue`s differing in locking discipline; this crate has exactly
//! one, always internally locked.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};

use crate::error::Result;

/// A FIFO of `(tag, payload)` pairs plus the eventfd that makes "queue
/// non-empty" observable to a poll loop (§4.2).
pub struct RequestQueue<Tag, T> {
    items: Mutex<VecDeque<(Tag, T)>>,
    event_fd: RawFd,
}

impl<Tag, T> RequestQueue<Tag, T> {
    pub fn new() -> Result<Self> {
        let event_fd = eventfd(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_SEMAPHORE,
        )?;
        Ok(Self {
            items: Mutex::new(VecDeque::new()),
            event_fd,
        })
    }

    /// fd to register with a poll (C1) for readability.
    pub fn event_fd(&self) -> RawFd {
        self.event_fd
    }

    fn signal(&self) -> Result<()> {
        let one: u64 = 1;
        write(self.event_fd, &one.to_ne_bytes())?;
        Ok(())
    }

    pub fn push_back(&self, tag: Tag, payload: T) -> Result<()> {
        self.items.lock().unwrap().push_back((tag, payload));
        self.signal()
    }

    pub fn push_front(&self, tag: Tag, payload: T) -> Result<()> {
        self.items.lock().unwrap().push_front((tag, payload));
        self.signal()
    }

    /// Consumes exactly one eventfd credit and returns one item. Callers
    /// must not call this when the queue is observably empty (§4.2) —
    /// i.e. only in response to the eventfd becoming readable.
    pub fn pop(&self) -> Result<Option<(Tag, T)>> {
        let mut buf = [0u8; 8];
        match read(self.event_fd, &mut buf) {
            Ok(_) => {}
            Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(self.items.lock().unwrap().pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

impl<Tag, T> Drop for RequestQueue<Tag, T> {
    fn drop(&mut self) {
        let _ = close(self.event_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_round_trips_in_fifo_order() {
        let q: RequestQueue<u32, &'static str> = RequestQueue::new().unwrap();
        q.push_back(1, "a").unwrap();
        q.push_back(2, "b").unwrap();
        assert_eq!(q.pop().unwrap(), Some((1, "a")));
        assert_eq!(q.pop().unwrap(), Some((2, "b")));
        assert_eq!(q.pop().unwrap(), None);
    }

    #[test]
    fn push_front_jumps_the_queue() {
        let q: RequestQueue<u32, &'static str> = RequestQueue::new().unwrap();
        q.push_back(1, "a").unwrap();
        q.push_front(0, "urgent").unwrap();
        assert_eq!(q.pop().unwrap(), Some((0, "urgent")));
        assert_eq!(q.pop().unwrap(), Some((1, "a")));
    }
}
