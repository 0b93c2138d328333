//! Attribute values handed back by handlers.

use fusebridge_kernel::{fuse_attr, fuse_kstatfs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File attributes reported by a handler.
///
/// Every field is optional. Whatever is left out reaches the kernel as zero,
/// so a handler may answer with as little as a size and a mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub ino: Option<u64>,
    pub size: Option<u64>,
    pub blocks: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub mode: Option<u32>,
    pub nlink: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub rdev: Option<u32>,
    pub blksize: Option<u32>,
}

impl Stat {
    /// Convert from the metadata of a host file.
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            ino: Some(meta.ino()),
            size: Some(meta.size()),
            blocks: Some(meta.blocks()),
            atime: meta.accessed().ok(),
            mtime: meta.modified().ok(),
            ctime: Some(time_from_kernel(
                meta.ctime().max(0) as u64,
                meta.ctime_nsec() as u32,
            )),
            mode: Some(meta.mode()),
            nlink: Some(meta.nlink() as u32),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            rdev: Some(meta.rdev() as u32),
            blksize: Some(meta.blksize() as u32),
        }
    }

    pub(crate) fn to_attr(&self) -> fuse_attr {
        let (atime, atimensec) = split_time(self.atime);
        let (mtime, mtimensec) = split_time(self.mtime);
        let (ctime, ctimensec) = split_time(self.ctime);
        fuse_attr {
            ino: self.ino.unwrap_or(0),
            size: self.size.unwrap_or(0),
            blocks: self.blocks.unwrap_or(0),
            atime,
            mtime,
            ctime,
            atimensec,
            mtimensec,
            ctimensec,
            mode: self.mode.unwrap_or(0),
            nlink: self.nlink.unwrap_or(0),
            uid: self.uid.unwrap_or(0),
            gid: self.gid.unwrap_or(0),
            rdev: self.rdev.unwrap_or(0),
            blksize: self.blksize.unwrap_or(0),
            padding: 0,
        }
    }
}

/// Filesystem statistics reported by a handler. Missing fields encode as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: Option<u64>,
    pub bfree: Option<u64>,
    pub bavail: Option<u64>,
    pub files: Option<u64>,
    pub ffree: Option<u64>,
    pub bsize: Option<u32>,
    pub namelen: Option<u32>,
    pub frsize: Option<u32>,
}

impl StatFs {
    pub(crate) fn to_kstatfs(&self) -> fuse_kstatfs {
        fuse_kstatfs {
            blocks: self.blocks.unwrap_or(0),
            bfree: self.bfree.unwrap_or(0),
            bavail: self.bavail.unwrap_or(0),
            files: self.files.unwrap_or(0),
            ffree: self.ffree.unwrap_or(0),
            bsize: self.bsize.unwrap_or(0),
            namelen: self.namelen.unwrap_or(0),
            frsize: self.frsize.unwrap_or(0),
            ..Default::default()
        }
    }
}

// Times before the epoch are clamped to it.
fn split_time(time: Option<SystemTime>) -> (u64, u32) {
    let d = time
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    (d.as_secs(), d.subsec_nanos())
}

/// The kernel passes signed seconds in an unsigned field. Times that do not
/// fit a `SystemTime` fall back to the epoch.
pub(crate) fn time_from_kernel(secs: u64, nsecs: u32) -> SystemTime {
    let secs = secs as i64;
    let nanos = Duration::from_nanos(u64::from(nsecs.min(999_999_999)));
    let base = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(secs.unsigned_abs()))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(secs.unsigned_abs()))
    };
    base.and_then(|t| t.checked_add(nanos)).unwrap_or(UNIX_EPOCH)
}
