//! Errors reported to the application that mounts the filesystem.

use std::{io, path::PathBuf};

/// The error type of the setup and teardown of a bridged mount.
///
/// Errors of individual filesystem operations never show up here, they are
/// negative errno values sent to the kernel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The mountpoint does not exist or is not a directory.
    #[error("invalid mountpoint {}: {source}", .path.display())]
    InvalidMountpoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The rendezvous for this mount could not be set up.
    #[error("failed to create rendezvous `{name}`: {source}")]
    Rendezvous {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Mounting or talking to the kernel failed.
    #[error("FUSE transport error: {0}")]
    Io(#[from] io::Error),

    /// The kernel worker thread panicked.
    #[error("the kernel worker thread panicked")]
    WorkerPanicked,

    /// The session ended before its destroy sequence could run.
    #[error("the session was torn down before destroy completed")]
    Aborted,
}
