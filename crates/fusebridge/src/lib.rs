//! Serve a FUSE filesystem from handlers running on a single-threaded
//! `tokio` event loop.
//!
//! A dedicated worker thread talks to the kernel. Each request is handed to
//! the event loop as a command, the matching handler is called with a
//! completion, and the worker waits until that completion has been called
//! before it reads the next request. Handlers never block the kernel side and
//! never need to be `Send`.
//!
//! Two vocabularies are offered:
//!
//! * [`path`]: handlers see paths, the bridge keeps track of inode numbers.
//! * [`inode`]: handlers see the kernel's inode numbers and a larger set of
//!   operations.
//!
//! Both are started from within a [`tokio::task::LocalSet`] and return a
//! [`Mount`].

#![forbid(clippy::todo, clippy::unimplemented)]

#[macro_use]
mod nix;

mod bridge;
mod bytes;
mod conn;
mod decoder;
mod error;
mod mount;
mod op;
mod reply;
mod session;
mod stat;

#[cfg(test)]
mod testing;

pub mod inode;
pub mod path;

pub use crate::{
    bridge::{Mount, Options, SharedBuffer},
    error::Error,
    session::{CapabilityFlags, KernelConfig},
    stat::{Stat, StatFs},
};
