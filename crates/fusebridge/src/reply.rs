//! Reply payloads in the layout the kernel expects.

use crate::{
    bytes::{Bytes, FillBytes},
    stat::{Stat, StatFs},
};
use fusebridge_kernel::*;
use std::{ffi::OsStr, fmt, mem, os::unix::prelude::*, time::Duration};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

macro_rules! impl_bytes_for_out {
    ($($t:ident),* $(,)?) => {$(
        impl Bytes for $t {
            #[inline]
            fn size(&self) -> usize {
                mem::size_of::<Self>()
            }

            #[inline]
            fn count(&self) -> usize {
                1
            }

            #[inline]
            fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
                dst.put(self.as_bytes());
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($t)).field(&self.raw).finish()
            }
        }
    )*};
}

impl_bytes_for_out!(AttrOut, EntryOut, OpenOut, WriteOut, StatfsOut, XattrOut);

#[derive(Default, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub(crate) struct AttrOut {
    raw: fuse_attr_out,
}

impl AttrOut {
    pub(crate) fn new(stat: &Stat, ttl: Duration) -> Self {
        let mut out = Self::default();
        out.raw.attr = stat.to_attr();
        out.raw.attr_valid = ttl.as_secs();
        out.raw.attr_valid_nsec = ttl.subsec_nanos();
        out
    }
}

#[derive(Default, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub(crate) struct EntryOut {
    raw: fuse_entry_out,
}

impl EntryOut {
    /// An entry for `ino`. A zero `ino` is a negative entry.
    pub(crate) fn new(ino: u64, stat: &Stat, entry_ttl: Duration, attr_ttl: Duration) -> Self {
        let mut out = Self::default();
        out.raw.nodeid = ino;
        out.raw.attr = stat.to_attr();
        out.raw.entry_valid = entry_ttl.as_secs();
        out.raw.entry_valid_nsec = entry_ttl.subsec_nanos();
        out.raw.attr_valid = attr_ttl.as_secs();
        out.raw.attr_valid_nsec = attr_ttl.subsec_nanos();
        out
    }
}

#[derive(Default, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub(crate) struct OpenOut {
    raw: fuse_open_out,
}

impl OpenOut {
    pub(crate) fn new(fh: u64, open_flags: u32) -> Self {
        let mut out = Self::default();
        out.raw.fh = fh;
        out.raw.open_flags = open_flags;
        out
    }
}

#[derive(Default, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub(crate) struct WriteOut {
    raw: fuse_write_out,
}

impl WriteOut {
    pub(crate) fn new(size: u32) -> Self {
        let mut out = Self::default();
        out.raw.size = size;
        out
    }
}

#[derive(Default, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub(crate) struct StatfsOut {
    raw: fuse_statfs_out,
}

impl StatfsOut {
    pub(crate) fn new(st: &StatFs) -> Self {
        let mut out = Self::default();
        out.raw.st = st.to_kstatfs();
        out
    }
}

/// The answer to a `getxattr`/`listxattr` size query.
#[derive(Default, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub(crate) struct XattrOut {
    raw: fuse_getxattr_out,
}

impl XattrOut {
    pub(crate) fn new(size: u32) -> Self {
        let mut out = Self::default();
        out.raw.size = size;
        out
    }
}

#[inline]
fn aligned(len: usize) -> usize {
    (len + mem::size_of::<u64>() - 1) & !(mem::size_of::<u64>() - 1)
}

/// A buffer of packed `fuse_dirent` records, bounded by the size the
/// kernel asked for.
pub(crate) struct DirentBuf {
    buf: Vec<u8>,
    capacity: usize,
}

impl fmt::Debug for DirentBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirentBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl DirentBuf {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// The number of bytes a record for `name` takes.
    pub(crate) fn entry_size(name: &OsStr) -> usize {
        aligned(mem::size_of::<fuse_dirent>() + name.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Append a record. Returns `true` without writing anything when the
    /// record does not fit.
    pub(crate) fn push(&mut self, name: &OsStr, ino: u64, typ: u32, off: u64) -> bool {
        let name = name.as_bytes();
        let entsize = aligned(mem::size_of::<fuse_dirent>() + name.len());
        if self.buf.len() + entsize > self.capacity {
            return true;
        }

        let header = fuse_dirent {
            ino,
            off,
            namelen: name.len() as u32,
            typ,
            name: [],
        };
        let start = self.buf.len();
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(start + entsize, 0);

        false
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Bytes for DirentBuf {
    #[inline]
    fn size(&self) -> usize {
        self.buf.size()
    }

    #[inline]
    fn count(&self) -> usize {
        self.buf.count()
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        self.buf.fill_bytes(dst)
    }
}
