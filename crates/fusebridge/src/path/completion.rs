//! Completions handed to path handlers.

use crate::{
    bridge::{Continuation, SharedBuffer},
    stat::{Stat, StatFs},
};
use std::ffi::OsString;

/// What a path handler answered, as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A bare status. Also the answer to failed cycles of every shape.
    Status(i32),
    Attr(Stat),
    Names(Vec<OsString>),
    Open(u64),
    Data(Vec<u8>),
    Link(OsString),
    Statfs(StatFs),
}

impl Default for Outcome {
    fn default() -> Self {
        Self::Status(-libc::EPERM)
    }
}

impl Outcome {
    /// The errno to reply with when this is not the expected success shape.
    pub(crate) fn errno(&self) -> i32 {
        match *self {
            Self::Status(status) if status < 0 => status.saturating_neg(),
            _ => libc::EIO,
        }
    }
}

macro_rules! define_completion {
    ($(
        $(#[$m:meta])*
        $name:ident;
    )*) => {$(
        $(#[$m])*
        #[derive(Debug)]
        #[must_use = "the kernel waits until the completion is called"]
        pub struct $name {
            inner: Continuation<Outcome>,
        }

        impl $name {
            pub(crate) fn new(inner: Continuation<Outcome>) -> Self {
                Self { inner }
            }
        }
    )*};
}

define_completion! {
    /// Completes an operation that only reports a status.
    StatusCompletion;

    /// Completes `getattr`.
    AttrCompletion;

    /// Completes `readdir`.
    ReaddirCompletion;

    /// Completes `readlink`.
    ReadlinkCompletion;

    /// Completes `open` and `create`.
    OpenCompletion;

    /// Completes `write`.
    WriteCompletion;

    /// Completes `statfs`.
    StatfsCompletion;
}

impl StatusCompletion {
    /// `status` is zero (or positive) on success and a negated errno on failure.
    pub fn complete(self, status: i32) {
        self.inner.finish(Outcome::Status(status));
    }
}

impl AttrCompletion {
    /// `stat` is ignored unless `status` reports success.
    pub fn complete(self, status: i32, stat: Stat) {
        self.inner.finish(if status >= 0 {
            Outcome::Attr(stat)
        } else {
            Outcome::Status(status)
        });
    }
}

impl ReaddirCompletion {
    /// Complete with the names of the directory entries.
    pub fn complete<I>(self, status: i32, names: I)
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.inner.finish(if status >= 0 {
            Outcome::Names(names.into_iter().map(Into::into).collect())
        } else {
            Outcome::Status(status)
        });
    }
}

impl ReadlinkCompletion {
    pub fn complete(self, status: i32, target: impl Into<OsString>) {
        self.inner.finish(if status >= 0 {
            Outcome::Link(target.into())
        } else {
            Outcome::Status(status)
        });
    }
}

impl OpenCompletion {
    /// Complete with the file handle passed to later `read`, `write` and
    /// `release` calls on this open file.
    pub fn complete(self, status: i32, fh: u64) {
        self.inner.finish(if status >= 0 {
            Outcome::Open(fh)
        } else {
            Outcome::Status(status)
        });
    }
}

impl WriteCompletion {
    /// `status` is the number of bytes written, or a negated errno.
    pub fn complete(self, status: i32) {
        self.inner.finish(Outcome::Status(status));
    }
}

impl StatfsCompletion {
    pub fn complete(self, status: i32, stat: StatFs) {
        self.inner.finish(if status >= 0 {
            Outcome::Statfs(stat)
        } else {
            Outcome::Status(status)
        });
    }
}

/// Completes `read`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct ReadCompletion {
    inner: Continuation<Outcome>,
    buffer: SharedBuffer,
    len: usize,
}

impl ReadCompletion {
    pub(crate) fn new(inner: Continuation<Outcome>, buffer: SharedBuffer, len: usize) -> Self {
        Self { inner, buffer, len }
    }

    /// `status` is the number of bytes put into the buffer, or a negated
    /// errno. Counts beyond the requested length are clamped.
    pub fn complete(self, status: i32) {
        let outcome = if status >= 0 {
            Outcome::Data(self.buffer.prefix(self.len.min(status as usize)))
        } else {
            Outcome::Status(status)
        };
        // The bridge's clone of the buffer goes away here.
        drop(self.buffer);
        self.inner.finish(outcome);
    }
}
