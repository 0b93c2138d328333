//! Completions handed to inode handlers. Each one sends the kernel reply
//! itself and then lets the worker move on.

use super::Answer;
use crate::{
    bridge::{Continuation, SharedBuffer, Ttl},
    reply::{AttrOut, DirentBuf, EntryOut, OpenOut, StatfsOut, WriteOut, XattrOut},
    session::Replier,
    stat::{Stat, StatFs},
};
use either::Either;
use std::{cmp, ffi::OsStr, os::unix::prelude::*};

fn errno(status: i32) -> i32 {
    status.saturating_neg()
}

/// Completes an operation answered by status alone, and `init`/`destroy`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct StatusCompletion {
    inner: Continuation<Answer>,
    replier: Option<Replier>,
}

impl StatusCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Option<Replier>) -> Self {
        Self { inner, replier }
    }

    /// `status` is zero (or positive) on success and a negated errno on failure.
    pub fn complete(self, status: i32) {
        if let Some(replier) = self.replier {
            replier.error(if status >= 0 { 0 } else { errno(status) });
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `lookup`, `mknod`, `mkdir`, `symlink` and `link`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct EntryCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    ttl: Ttl,
}

impl EntryCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier, ttl: Ttl) -> Self {
        Self {
            inner,
            replier,
            ttl,
        }
    }

    /// On success the kernel takes one lookup reference on `ino`, which it
    /// gives back through `forget`.
    pub fn complete(self, status: i32, ino: u64, stat: Stat) {
        if status >= 0 {
            let out = EntryOut::new(ino, &stat, self.ttl.entry, self.ttl.attr);
            self.replier.reply(&out);
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `getattr` and `setattr`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct AttrCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    ttl: Ttl,
}

impl AttrCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier, ttl: Ttl) -> Self {
        Self {
            inner,
            replier,
            ttl,
        }
    }

    pub fn complete(self, status: i32, stat: Stat) {
        if status >= 0 {
            self.replier.reply(&AttrOut::new(&stat, self.ttl.attr));
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `readlink`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct ReadlinkCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
}

impl ReadlinkCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier) -> Self {
        Self { inner, replier }
    }

    pub fn complete(self, status: i32, target: impl AsRef<OsStr>) {
        if status >= 0 {
            self.replier.reply(&target.as_ref());
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `open` and `opendir`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct OpenCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
}

impl OpenCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier) -> Self {
        Self { inner, replier }
    }

    /// `fh` comes back with every later request on the opened file.
    pub fn complete(self, status: i32, fh: u64) {
        if status >= 0 {
            self.replier.reply(&OpenOut::new(fh, 0));
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `read`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct ReadCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    buffer: SharedBuffer,
    len: usize,
}

impl ReadCompletion {
    pub(crate) fn new(
        inner: Continuation<Answer>,
        replier: Replier,
        buffer: SharedBuffer,
        len: usize,
    ) -> Self {
        Self {
            inner,
            replier,
            buffer,
            len,
        }
    }

    /// `status` is the number of bytes put into the buffer, or a negated
    /// errno. Counts beyond the requested length are clamped.
    pub fn complete(self, status: i32) {
        if status >= 0 {
            let data = self.buffer.prefix(cmp::min(self.len, status as usize));
            self.replier.reply(&data);
        } else {
            self.replier.error(errno(status));
        }
        drop(self.buffer);
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `write`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct WriteCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    len: usize,
}

impl WriteCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier, len: usize) -> Self {
        Self {
            inner,
            replier,
            len,
        }
    }

    /// `status` is the number of bytes written, or a negated errno.
    pub fn complete(self, status: i32) {
        if status >= 0 {
            let written = cmp::min(self.len, status as usize);
            self.replier.reply(&WriteOut::new(written as u32));
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `readdir`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct ReaddirCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    size: usize,
    offset: u64,
}

impl ReaddirCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier, size: usize, offset: u64) -> Self {
        Self {
            inner,
            replier,
            size,
            offset,
        }
    }

    /// Complete with the whole listing as `(name, ino)` pairs.
    ///
    /// Entries are packed until the next one does not fit into the size the
    /// kernel asked for. Any later call on the same listing (a nonzero
    /// offset) is answered with an empty buffer, which ends the listing.
    pub fn complete<I, N>(self, status: i32, entries: I)
    where
        I: IntoIterator<Item = (N, u64)>,
        N: AsRef<OsStr>,
    {
        if status < 0 {
            self.replier.error(errno(status));
        } else if self.offset > 0 {
            self.replier.reply(&());
        } else {
            let mut buf = DirentBuf::new(self.size);
            for (name, ino) in entries {
                let name = name.as_ref();
                let off = buf.len() + DirentBuf::entry_size(name);
                if buf.push(name, ino, 0, off as u64) {
                    break;
                }
            }
            self.replier.reply(&buf);
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `statfs`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct StatfsCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
}

impl StatfsCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier) -> Self {
        Self { inner, replier }
    }

    pub fn complete(self, status: i32, stat: StatFs) {
        if status >= 0 {
            self.replier.reply(&StatfsOut::new(&stat));
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}

/// Completes `getxattr` and `listxattr`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct XattrCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    size: u32,
}

impl XattrCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier, size: u32) -> Self {
        Self {
            inner,
            replier,
            size,
        }
    }

    /// Complete with the attribute value, or for `listxattr` with the
    /// NUL-terminated names one after another.
    ///
    /// A zero-sized request only learns the length. A value longer than the
    /// requested size fails with `ERANGE`.
    pub fn complete(self, status: i32, value: impl AsRef<[u8]>) {
        let value = value.as_ref();
        if status < 0 {
            self.replier.error(errno(status));
        } else if self.size != 0 && value.len() > self.size as usize {
            self.replier.error(libc::ERANGE);
        } else {
            let out = if self.size == 0 {
                Either::Left(XattrOut::new(value.len() as u32))
            } else {
                Either::Right(value)
            };
            self.replier.reply(&out);
        }
        self.inner.finish(Answer::Replied);
    }

    /// Like [`complete`](Self::complete), joining `names` with NUL bytes.
    pub fn complete_names<I>(self, status: i32, names: I)
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        let mut value = vec![];
        for name in names {
            value.extend_from_slice(name.as_ref().as_bytes());
            value.push(0);
        }
        self.complete(status, value);
    }
}

/// Completes `create`.
#[derive(Debug)]
#[must_use = "the kernel waits until the completion is called"]
pub struct CreateCompletion {
    inner: Continuation<Answer>,
    replier: Replier,
    ttl: Ttl,
}

impl CreateCompletion {
    pub(crate) fn new(inner: Continuation<Answer>, replier: Replier, ttl: Ttl) -> Self {
        Self {
            inner,
            replier,
            ttl,
        }
    }

    pub fn complete(self, status: i32, ino: u64, stat: Stat, fh: u64) {
        if status >= 0 {
            let entry = EntryOut::new(ino, &stat, self.ttl.entry, self.ttl.attr);
            self.replier.reply(&(entry, OpenOut::new(fh, 0)));
        } else {
            self.replier.error(errno(status));
        }
        self.inner.finish(Answer::Replied);
    }
}
