//! lxcpp: the from-scratch container runtime behind a vasum zone (§4).
//!
//! Mirrors the teacher's own crate layout — one module per concern, a
//! shared `error::Error`/`Result` pair, and a `Syscall` trait seam so the
//! kernel-facing pieces can be swapped for a recording fake in tests.

pub mod container;
pub mod error;
pub mod lifecycle;
pub mod namespaces;
pub mod network;
pub mod process;
pub mod rootfs;
pub mod syscall;
pub mod tty;

pub use container::{Container, ContainerState, State};
pub use error::{Error, Result};
