//! Socket-multiplexing request/reply and signal engine shared by the
//! vasum host daemon, its CLI, and the in-zone agent.
//!
//! Layering, bottom to top:
//! - [`poll`] — the event poll (C1), one per process.
//! - [`queue`] — an eventfd-backed FIFO (C2) used for cross-thread
//!   completions.
//! - [`socket`] — framed reads/writes and `SCM_RIGHTS` fd passing over
//!   an `AF_UNIX` stream socket (C3).
//! - [`codec`] — structural-recursion (de)serialization of typed values
//!   onto a frame's payload and ancillary fd list (C4).
//! - [`processor`] — the central dispatcher: peers, methods, signals,
//!   pending calls, timeouts (C5).
//! - [`service`] — `Service`/`Client`, the typed, role-specific entry
//!   points most callers use instead of `Processor` directly (C6).

pub mod codec;
pub mod error;
pub mod poll;
pub mod processor;
pub mod queue;
pub mod service;
pub mod socket;

pub use codec::{decode, encode, Blob, FileDescriptor, Reader, Visitable, Writer};
pub use error::{Error, Result};
pub use processor::{PeerId, Processor, Role, UserError};
pub use service::{Client, Service};
