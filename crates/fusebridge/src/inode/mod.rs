//! Inode-addressed handlers.
//!
//! Requests are passed through with the inode numbers of the kernel, and the
//! completions reply to the kernel directly. The filesystem owns the inode
//! numbering: `lookup`, `mknod`, `mkdir`, `symlink`, `link` and `create` hand
//! out numbers, and the kernel refers to them afterwards. The root is inode 1.

mod completion;

pub use self::completion::{
    AttrCompletion, CreateCompletion, EntryCompletion, OpenCompletion, ReadCompletion,
    ReaddirCompletion, ReadlinkCompletion, StatfsCompletion, StatusCompletion, WriteCompletion,
    XattrCompletion,
};

use crate::{
    bridge::{self, Continuation, Mount, Options, SharedBuffer, Teardown, Ticket, Ttl, Vocabulary, WorkerCx},
    error::Error,
    op::Operation,
    session::Replier,
    stat::{self, Stat},
};
use fusebridge_kernel::{self as kernel, fuse_in_header};
use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::Path,
    time::SystemTime,
};

macro_rules! define_handlers {
    ($(
        $(#[$m:meta])*
        $name:ident: Fn($($arg:ty),* $(,)?);
    )*) => {
        /// The callbacks of an inode-addressed filesystem.
        ///
        /// Every callback runs on the event loop and receives a completion
        /// that must be called once, either right away or later from a
        /// spawned task. Operations without a callback fail with `EPERM`.
        #[derive(Default)]
        pub struct Handlers {
            $(
                $name: Option<Box<dyn Fn($($arg),*)>>,
            )*
        }

        impl Handlers {
            $(
                $(#[$m])*
                pub fn $name(&mut self, f: impl Fn($($arg),*) + 'static) -> &mut Self {
                    self.$name = Some(Box::new(f));
                    self
                }
            )*
        }
    };
}

define_handlers! {
    /// Called once after the kernel handshake.
    init: Fn(StatusCompletion);
    /// Called once when the session is over, including when mounting failed.
    destroy: Fn(StatusCompletion);
    /// Receives the parent inode and the name to look up.
    lookup: Fn(u64, &OsStr, EntryCompletion);
    getattr: Fn(u64, AttrCompletion);
    /// Receives the requested changes. Fields left alone are `None`.
    setattr: Fn(u64, &Stat, AttrCompletion);
    readlink: Fn(u64, ReadlinkCompletion);
    /// Receives the parent, name, mode and device number.
    mknod: Fn(u64, &OsStr, u32, u32, EntryCompletion);
    mkdir: Fn(u64, &OsStr, u32, EntryCompletion);
    unlink: Fn(u64, &OsStr, StatusCompletion);
    rmdir: Fn(u64, &OsStr, StatusCompletion);
    /// Receives the parent, the link target and the name of the link.
    symlink: Fn(u64, &OsStr, &OsStr, EntryCompletion);
    /// Receives the parent and name, then the new parent and new name.
    rename: Fn(u64, &OsStr, u64, &OsStr, StatusCompletion);
    /// Receives the linked inode, then the new parent and new name.
    link: Fn(u64, u64, &OsStr, EntryCompletion);
    /// Receives the `open(2)` flags.
    open: Fn(u64, u32, OpenCompletion);
    /// Receives `(ino, offset, len, buffer, fh, done)`. The buffer is
    /// zero-filled and `len` bytes long.
    read: Fn(u64, u64, usize, SharedBuffer, u64, ReadCompletion);
    /// Receives `(ino, offset, len, buffer, fh, done)` with the data in the
    /// buffer.
    write: Fn(u64, u64, usize, SharedBuffer, u64, WriteCompletion);
    flush: Fn(u64, u64, StatusCompletion);
    release: Fn(u64, u64, StatusCompletion);
    /// The flag is set when only the data needs to be flushed.
    fsync: Fn(u64, bool, u64, StatusCompletion);
    opendir: Fn(u64, u32, OpenCompletion);
    /// Receives `(ino, size, offset, fh, done)`.
    readdir: Fn(u64, usize, u64, u64, ReaddirCompletion);
    releasedir: Fn(u64, u64, StatusCompletion);
    fsyncdir: Fn(u64, bool, u64, StatusCompletion);
    statfs: Fn(u64, StatfsCompletion);
    /// Receives the attribute name, its value and the `setxattr(2)` flags.
    setxattr: Fn(u64, &OsStr, &[u8], u32, StatusCompletion);
    /// Receives the attribute name and the size of the caller's buffer.
    getxattr: Fn(u64, &OsStr, u32, XattrCompletion);
    listxattr: Fn(u64, u32, XattrCompletion);
    removexattr: Fn(u64, &OsStr, StatusCompletion);
    /// Receives the `access(2)` mask.
    access: Fn(u64, u32, StatusCompletion);
    /// Receives the parent, name, mode and `open(2)` flags.
    create: Fn(u64, &OsStr, u32, u32, CreateCompletion);
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// How a dispatch cycle ended, as seen by the worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Answer {
    /// Nobody replied to the kernel.
    #[default]
    Unanswered,
    Replied,
}

/// A kernel request carried from the worker to the event loop.
#[derive(Debug)]
pub(crate) enum Request {
    Lookup { parent: u64, name: OsString },
    Getattr { ino: u64 },
    Setattr { ino: u64, stat: Stat },
    Readlink { ino: u64 },
    Mknod { parent: u64, name: OsString, mode: u32, rdev: u32 },
    Mkdir { parent: u64, name: OsString, mode: u32 },
    Unlink { parent: u64, name: OsString },
    Rmdir { parent: u64, name: OsString },
    Symlink { parent: u64, target: OsString, name: OsString },
    Rename { parent: u64, name: OsString, newparent: u64, newname: OsString },
    Link { ino: u64, newparent: u64, newname: OsString },
    Open { ino: u64, flags: u32 },
    Read { ino: u64, offset: u64, len: usize, fh: u64 },
    Write { ino: u64, offset: u64, data: Vec<u8>, fh: u64 },
    Flush { ino: u64, fh: u64 },
    Release { ino: u64, fh: u64 },
    Fsync { ino: u64, datasync: bool, fh: u64 },
    Opendir { ino: u64, flags: u32 },
    Readdir { ino: u64, size: usize, offset: u64, fh: u64 },
    Releasedir { ino: u64, fh: u64 },
    Fsyncdir { ino: u64, datasync: bool, fh: u64 },
    Statfs { ino: u64 },
    Setxattr { ino: u64, name: OsString, value: Vec<u8>, flags: u32 },
    Getxattr { ino: u64, name: OsString, size: u32 },
    Listxattr { ino: u64, size: u32 },
    Removexattr { ino: u64, name: OsString },
    Access { ino: u64, mask: u32 },
    Create { parent: u64, name: OsString, mode: u32, flags: u32 },
}

impl Request {
    fn from_kernel(header: &fuse_in_header, op: Operation<'_>) -> Option<Self> {
        let ino = header.nodeid;
        Some(match op {
            Operation::Lookup { name } => Request::Lookup {
                parent: ino,
                name: name.to_owned(),
            },
            Operation::Getattr { .. } => Request::Getattr { ino },
            Operation::Setattr { arg } => Request::Setattr {
                ino,
                stat: requested(&arg),
            },
            Operation::Readlink => Request::Readlink { ino },
            Operation::Mknod { arg, name } => Request::Mknod {
                parent: ino,
                name: name.to_owned(),
                mode: arg.mode,
                rdev: arg.rdev,
            },
            Operation::Mkdir { arg, name } => Request::Mkdir {
                parent: ino,
                name: name.to_owned(),
                mode: arg.mode,
            },
            Operation::Unlink { name } => Request::Unlink {
                parent: ino,
                name: name.to_owned(),
            },
            Operation::Rmdir { name } => Request::Rmdir {
                parent: ino,
                name: name.to_owned(),
            },
            Operation::Symlink { name, link } => Request::Symlink {
                parent: ino,
                target: link.to_owned(),
                name: name.to_owned(),
            },
            Operation::Rename { arg, name, newname } => Request::Rename {
                parent: ino,
                name: name.to_owned(),
                newparent: arg.newdir,
                newname: newname.to_owned(),
            },
            Operation::Link { arg, newname } => Request::Link {
                ino: arg.oldnodeid,
                newparent: ino,
                newname: newname.to_owned(),
            },
            Operation::Open { arg } => Request::Open {
                ino,
                flags: arg.flags,
            },
            Operation::Read { arg } => Request::Read {
                ino,
                offset: arg.offset,
                len: arg.size as usize,
                fh: arg.fh,
            },
            Operation::Write { arg, data } => Request::Write {
                ino,
                offset: arg.offset,
                data: data.to_vec(),
                fh: arg.fh,
            },
            Operation::Flush { arg } => Request::Flush { ino, fh: arg.fh },
            Operation::Release { arg } => Request::Release { ino, fh: arg.fh },
            Operation::Fsync { arg } => Request::Fsync {
                ino,
                datasync: arg.fsync_flags & kernel::FUSE_FSYNC_FDATASYNC != 0,
                fh: arg.fh,
            },
            Operation::Opendir { arg } => Request::Opendir {
                ino,
                flags: arg.flags,
            },
            Operation::Readdir { arg } => Request::Readdir {
                ino,
                size: arg.size as usize,
                offset: arg.offset,
                fh: arg.fh,
            },
            Operation::Releasedir { arg } => Request::Releasedir { ino, fh: arg.fh },
            Operation::Fsyncdir { arg } => Request::Fsyncdir {
                ino,
                datasync: arg.fsync_flags & kernel::FUSE_FSYNC_FDATASYNC != 0,
                fh: arg.fh,
            },
            Operation::Statfs => Request::Statfs { ino },
            Operation::Setxattr { arg, name, value } => Request::Setxattr {
                ino,
                name: name.to_owned(),
                value: value.to_vec(),
                flags: arg.flags,
            },
            Operation::Getxattr { arg, name } => Request::Getxattr {
                ino,
                name: name.to_owned(),
                size: arg.size,
            },
            Operation::Listxattr { arg } => Request::Listxattr {
                ino,
                size: arg.size,
            },
            Operation::Removexattr { name } => Request::Removexattr {
                ino,
                name: name.to_owned(),
            },
            Operation::Access { arg } => Request::Access {
                ino,
                mask: arg.mask,
            },
            Operation::Create { arg, name } => Request::Create {
                parent: ino,
                name: name.to_owned(),
                mode: arg.mode,
                flags: arg.flags,
            },
            _ => return None,
        })
    }

    /// The name of the handler this request is dispatched to.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Request::Lookup { .. } => "lookup",
            Request::Getattr { .. } => "getattr",
            Request::Setattr { .. } => "setattr",
            Request::Readlink { .. } => "readlink",
            Request::Mknod { .. } => "mknod",
            Request::Mkdir { .. } => "mkdir",
            Request::Unlink { .. } => "unlink",
            Request::Rmdir { .. } => "rmdir",
            Request::Symlink { .. } => "symlink",
            Request::Rename { .. } => "rename",
            Request::Link { .. } => "link",
            Request::Open { .. } => "open",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Flush { .. } => "flush",
            Request::Release { .. } => "release",
            Request::Fsync { .. } => "fsync",
            Request::Opendir { .. } => "opendir",
            Request::Readdir { .. } => "readdir",
            Request::Releasedir { .. } => "releasedir",
            Request::Fsyncdir { .. } => "fsyncdir",
            Request::Statfs { .. } => "statfs",
            Request::Setxattr { .. } => "setxattr",
            Request::Getxattr { .. } => "getxattr",
            Request::Listxattr { .. } => "listxattr",
            Request::Removexattr { .. } => "removexattr",
            Request::Access { .. } => "access",
            Request::Create { .. } => "create",
        }
    }
}

/// The changes requested by `SETATTR`, as a partial `Stat`.
fn requested(arg: &kernel::fuse_setattr_in) -> Stat {
    let valid = arg.valid;
    let set = |flag: u32| valid & flag != 0;
    let time = |flag: u32, now: u32, secs: u64, nsecs: u32| {
        if set(now) {
            Some(SystemTime::now())
        } else if set(flag) {
            Some(stat::time_from_kernel(secs, nsecs))
        } else {
            None
        }
    };
    Stat {
        mode: set(kernel::FATTR_MODE).then_some(arg.mode),
        uid: set(kernel::FATTR_UID).then_some(arg.uid),
        gid: set(kernel::FATTR_GID).then_some(arg.gid),
        size: set(kernel::FATTR_SIZE).then_some(arg.size),
        atime: time(
            kernel::FATTR_ATIME,
            kernel::FATTR_ATIME_NOW,
            arg.atime,
            arg.atimensec,
        ),
        mtime: time(
            kernel::FATTR_MTIME,
            kernel::FATTR_MTIME_NOW,
            arg.mtime,
            arg.mtimensec,
        ),
        ctime: set(kernel::FATTR_CTIME).then(|| stat::time_from_kernel(arg.ctime, arg.ctimensec)),
        ..Stat::default()
    }
}

#[derive(Debug)]
pub(crate) enum Op {
    Init,
    Destroy,
    Kernel { replier: Replier, request: Request },
}

#[derive(Debug)]
pub(crate) struct Command {
    op: Op,
    ticket: Ticket<Answer>,
}

/// The inode-addressed vocabulary.
pub(crate) enum InodeBridge {}

impl Vocabulary for InodeBridge {
    type Command = Command;
    type Answer = Answer;
    type State = ();
    type Handlers = (Handlers, Ttl);

    fn init(ticket: Ticket<Answer>) -> Command {
        Command {
            op: Op::Init,
            ticket,
        }
    }

    fn destroy(ticket: Ticket<Answer>) -> Command {
        Command {
            op: Op::Destroy,
            ticket,
        }
    }

    fn is_destroy(command: &Command) -> bool {
        matches!(command.op, Op::Destroy)
    }

    fn handle(_: &mut (), cx: &WorkerCx<'_, Self>, header: &fuse_in_header, op: Operation<'_>) {
        let request = match op {
            // The filesystem keeps no inode table here, so there is nothing to drop.
            Operation::Forget { .. } | Operation::BatchForget { .. } => return,
            op => match Request::from_kernel(header, op) {
                Some(request) => request,
                None => {
                    tracing::debug!("not supported by inode handlers");
                    cx.replier(header.unique).error(libc::ENOSYS);
                    return;
                }
            },
        };

        let op = Op::Kernel {
            replier: cx.replier(header.unique),
            request,
        };
        if cx.call(|ticket| Command { op, ticket }) == Answer::Unanswered {
            cx.replier(header.unique).error(libc::EPERM);
        }
    }

    fn dispatch((handlers, ttl): &(Handlers, Ttl), command: Command, teardown: Option<Teardown>) {
        let Command { op, ticket } = command;
        let inner = Continuation::new(ticket, teardown);
        let ttl = *ttl;

        // Resolve the handler, or leave the reply to the worker by dropping the continuation.
        macro_rules! call {
            ($name:expr, $handler:ident, |$h:ident| $body:expr) => {
                match &handlers.$handler {
                    Some($h) => $body,
                    None => {
                        tracing::debug!(op = $name, "no handler registered");
                        drop(inner);
                    }
                }
            };
        }

        let (replier, request) = match op {
            Op::Init => return call!("init", init, |h| h(StatusCompletion::new(inner, None))),
            Op::Destroy => {
                return call!("destroy", destroy, |h| h(StatusCompletion::new(inner, None)))
            }
            Op::Kernel { replier, request } => (replier, request),
        };

        let name = request.name();
        macro_rules! status {
            () => {
                StatusCompletion::new(inner, Some(replier))
            };
        }
        match request {
            Request::Lookup { parent, name: n } => call!(name, lookup, |h| h(
                parent,
                &n,
                EntryCompletion::new(inner, replier, ttl)
            )),
            Request::Getattr { ino } => {
                call!(name, getattr, |h| h(ino, AttrCompletion::new(inner, replier, ttl)))
            }
            Request::Setattr { ino, stat } => call!(name, setattr, |h| h(
                ino,
                &stat,
                AttrCompletion::new(inner, replier, ttl)
            )),
            Request::Readlink { ino } => {
                call!(name, readlink, |h| h(ino, ReadlinkCompletion::new(inner, replier)))
            }
            Request::Mknod {
                parent,
                name: n,
                mode,
                rdev,
            } => call!(name, mknod, |h| h(
                parent,
                &n,
                mode,
                rdev,
                EntryCompletion::new(inner, replier, ttl)
            )),
            Request::Mkdir {
                parent,
                name: n,
                mode,
            } => call!(name, mkdir, |h| h(
                parent,
                &n,
                mode,
                EntryCompletion::new(inner, replier, ttl)
            )),
            Request::Unlink { parent, name: n } => {
                call!(name, unlink, |h| h(parent, &n, status!()))
            }
            Request::Rmdir { parent, name: n } => {
                call!(name, rmdir, |h| h(parent, &n, status!()))
            }
            Request::Symlink {
                parent,
                target,
                name: n,
            } => call!(name, symlink, |h| h(
                parent,
                &target,
                &n,
                EntryCompletion::new(inner, replier, ttl)
            )),
            Request::Rename {
                parent,
                name: n,
                newparent,
                newname,
            } => call!(name, rename, |h| h(
                parent,
                &n,
                newparent,
                &newname,
                status!()
            )),
            Request::Link {
                ino,
                newparent,
                newname,
            } => call!(name, link, |h| h(
                ino,
                newparent,
                &newname,
                EntryCompletion::new(inner, replier, ttl)
            )),
            Request::Open { ino, flags } => {
                call!(name, open, |h| h(ino, flags, OpenCompletion::new(inner, replier)))
            }
            Request::Read {
                ino,
                offset,
                len,
                fh,
            } => call!(name, read, |h| {
                let buffer = SharedBuffer::zeroed(len);
                let done = ReadCompletion::new(inner, replier, buffer.clone(), len);
                h(ino, offset, len, buffer, fh, done)
            }),
            Request::Write {
                ino,
                offset,
                data,
                fh,
            } => call!(name, write, |h| {
                let len = data.len();
                let buffer = SharedBuffer::from_vec(data);
                h(ino, offset, len, buffer, fh, WriteCompletion::new(inner, replier, len))
            }),
            Request::Flush { ino, fh } => call!(name, flush, |h| h(ino, fh, status!())),
            Request::Release { ino, fh } => call!(name, release, |h| h(ino, fh, status!())),
            Request::Fsync { ino, datasync, fh } => {
                call!(name, fsync, |h| h(ino, datasync, fh, status!()))
            }
            Request::Opendir { ino, flags } => {
                call!(name, opendir, |h| h(ino, flags, OpenCompletion::new(inner, replier)))
            }
            Request::Readdir {
                ino,
                size,
                offset,
                fh,
            } => call!(name, readdir, |h| h(
                ino,
                size,
                offset,
                fh,
                ReaddirCompletion::new(inner, replier, size, offset)
            )),
            Request::Releasedir { ino, fh } => {
                call!(name, releasedir, |h| h(ino, fh, status!()))
            }
            Request::Fsyncdir { ino, datasync, fh } => {
                call!(name, fsyncdir, |h| h(ino, datasync, fh, status!()))
            }
            Request::Statfs { ino } => {
                call!(name, statfs, |h| h(ino, StatfsCompletion::new(inner, replier)))
            }
            Request::Setxattr {
                ino,
                name: n,
                value,
                flags,
            } => call!(name, setxattr, |h| h(ino, &n, &value, flags, status!())),
            Request::Getxattr { ino, name: n, size } => call!(name, getxattr, |h| h(
                ino,
                &n,
                size,
                XattrCompletion::new(inner, replier, size)
            )),
            Request::Listxattr { ino, size } => call!(name, listxattr, |h| h(
                ino,
                size,
                XattrCompletion::new(inner, replier, size)
            )),
            Request::Removexattr { ino, name: n } => {
                call!(name, removexattr, |h| h(ino, &n, status!()))
            }
            Request::Access { ino, mask } => call!(name, access, |h| h(ino, mask, status!())),
            Request::Create {
                parent,
                name: n,
                mode,
                flags,
            } => call!(name, create, |h| h(
                parent,
                &n,
                mode,
                flags,
                CreateCompletion::new(inner, replier, ttl)
            )),
        }
    }
}

/// Mount `mountpoint` and serve it with inode-addressed `handlers`.
///
/// Must be called from within a [`tokio::task::LocalSet`]: the handlers run
/// on the calling thread. The returned [`Mount`] resolves
/// [`closed`](Mount::closed) once the `destroy` handler has completed.
pub fn start(
    mountpoint: impl AsRef<Path>,
    handlers: Handlers,
    options: &Options,
) -> Result<Mount, Error> {
    bridge::start::<InodeBridge>(mountpoint.as_ref(), (handlers, options.ttl()), (), options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        stat::StatFs,
        testing::{decode, encode_request, init_request, parse_dirents, with_names, FakeTransport},
    };
    use fusebridge_kernel::*;
    use std::{cell::RefCell, mem, rc::Rc, sync::Arc, time::Duration};
    use tokio::task::LocalSet;
    use zerocopy::IntoBytes;

    async fn serve_with(
        name: &str,
        requests: Vec<Vec<u8>>,
        handlers: Handlers,
        options: &Options,
    ) -> Arc<FakeTransport> {
        let conn = FakeTransport::new(std::iter::once(init_request()).chain(requests));
        LocalSet::new()
            .run_until(async {
                let mount = bridge::launch_fake::<InodeBridge>(
                    name,
                    Arc::clone(&conn),
                    (handlers, options.ttl()),
                    (),
                    options,
                )
                .unwrap();
                mount.closed().await.unwrap();
            })
            .await;
        conn
    }

    async fn serve(name: &str, requests: Vec<Vec<u8>>, handlers: Handlers) -> Arc<FakeTransport> {
        serve_with(name, requests, handlers, &Options::default()).await
    }

    fn stat(ino: u64, size: u64) -> Stat {
        Stat {
            ino: Some(ino),
            size: Some(size),
            mode: Some(libc::S_IFREG | 0o644),
            ..Stat::default()
        }
    }

    fn getxattr(unique: u64, size: u32) -> Vec<u8> {
        let arg = fuse_getxattr_in { size, padding: 0 };
        encode_request(FUSE_GETXATTR, unique, 2, &with_names(arg.as_bytes(), &["user.k"]))
    }

    fn readdir(unique: u64, offset: u64, size: u32) -> Vec<u8> {
        let arg = fuse_read_in {
            fh: 4,
            offset,
            size,
            ..Default::default()
        };
        encode_request(FUSE_READDIR, unique, 1, arg.as_bytes())
    }

    #[tokio::test]
    async fn entries_and_attributes_carry_the_ttls() {
        let mut handlers = Handlers::default();
        handlers
            .lookup(|parent, name, done| {
                if parent == FUSE_ROOT_ID && name == "file" {
                    done.complete(0, 5, stat(5, 12));
                } else {
                    done.complete(-libc::ENOENT, 0, Stat::default());
                }
            })
            .getattr(|ino, done| done.complete(0, stat(ino, 12)));

        let mut options = Options::default();
        options
            .entry_ttl(Duration::from_secs(2))
            .attr_ttl(Duration::from_millis(1500));
        let conn = serve_with(
            "inode-entries",
            vec![
                encode_request(FUSE_LOOKUP, 2, 1, &with_names(&[], &["file"])),
                encode_request(FUSE_LOOKUP, 3, 1, &with_names(&[], &["nope"])),
                encode_request(
                    FUSE_GETATTR,
                    4,
                    5,
                    fuse_getattr_in::default().as_bytes(),
                ),
            ],
            handlers,
            &options,
        )
        .await;

        let entry: fuse_entry_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(entry.nodeid, 5);
        assert_eq!((entry.entry_valid, entry.entry_valid_nsec), (2, 0));
        assert_eq!((entry.attr_valid, entry.attr_valid_nsec), (1, 500_000_000));
        assert_eq!(entry.attr.size, 12);

        assert_eq!(conn.reply_to(3).unwrap().error, -libc::ENOENT);

        let attr: fuse_attr_out = decode(&conn.reply_to(4).unwrap().payload);
        assert_eq!(attr.attr.ino, 5);
        assert_eq!((attr.attr_valid, attr.attr_valid_nsec), (1, 500_000_000));
    }

    #[tokio::test]
    async fn every_request_gets_one_reply() {
        let mut handlers = Handlers::default();
        handlers.getattr(|_, done| drop(done));

        let forget = fuse_forget_in { nlookup: 1 };
        let interrupt = fuse_interrupt_in { unique: 2 };
        let conn = serve(
            "inode-one-reply",
            vec![
                encode_request(FUSE_GETATTR, 2, 1, fuse_getattr_in::default().as_bytes()),
                encode_request(FUSE_READLINK, 3, 1, &[]),
                encode_request(FUSE_FORGET, 4, 5, forget.as_bytes()),
                encode_request(FUSE_INTERRUPT, 5, 0, interrupt.as_bytes()),
                encode_request(FUSE_BMAP, 6, 1, &[]),
                encode_request(FUSE_INIT, 7, 0, &[]),
            ],
            handlers,
        )
        .await;

        // A dropped completion and a missing handler.
        assert_eq!(conn.reply_to(2).unwrap().error, -libc::EPERM);
        assert_eq!(conn.reply_to(3).unwrap().error, -libc::EPERM);
        assert!(conn.reply_to(4).is_none());
        assert!(conn.reply_to(5).is_none());
        assert_eq!(conn.reply_to(6).unwrap().error, -libc::ENOSYS);
        assert_eq!(conn.reply_to(7).unwrap().error, -libc::EIO);
        // The INIT reply plus the four above.
        assert_eq!(conn.replies().len(), 5);
    }

    #[tokio::test]
    async fn readdir_packs_until_full() {
        let calls = Rc::new(RefCell::new(vec![]));
        let mut handlers = Handlers::default();
        handlers.readdir({
            let calls = calls.clone();
            move |ino, size, offset, fh, done| {
                calls.borrow_mut().push((ino, size, offset, fh));
                done.complete(0, [(".", 1), ("..", 1), ("a", 2), ("b", 3)]);
            }
        });

        let conn = serve(
            "inode-readdir",
            vec![readdir(2, 0, 100), readdir(3, 96, 100)],
            handlers,
        )
        .await;

        assert_eq!(
            parse_dirents(&conn.reply_to(2).unwrap().payload),
            [
                (1, 32, ".".to_owned()),
                (1, 64, "..".to_owned()),
                (2, 96, "a".to_owned())
            ]
        );
        assert!(conn.reply_to(3).unwrap().payload.is_empty());
        assert_eq!(*calls.borrow(), [(1, 100, 0, 4), (1, 100, 96, 4)]);
    }

    #[tokio::test]
    async fn xattr_size_query_and_erange() {
        let mut handlers = Handlers::default();
        handlers
            .getxattr(|ino, name, _, done| {
                assert_eq!((ino, name), (2, OsStr::new("user.k")));
                done.complete(0, b"value");
            })
            .listxattr(|_, _, done| done.complete_names(0, ["user.a", "user.b"]));

        let list = fuse_getxattr_in {
            size: 64,
            padding: 0,
        };
        let conn = serve(
            "inode-xattr",
            vec![
                getxattr(2, 0),
                getxattr(3, 2),
                getxattr(4, 64),
                encode_request(FUSE_LISTXATTR, 5, 2, list.as_bytes()),
            ],
            handlers,
        )
        .await;

        let sized: fuse_getxattr_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(sized.size, 5);
        assert_eq!(conn.reply_to(3).unwrap().error, -libc::ERANGE);
        assert_eq!(conn.reply_to(4).unwrap().payload, b"value");
        assert_eq!(conn.reply_to(5).unwrap().payload, b"user.a\0user.b\0");
    }

    #[tokio::test]
    async fn create_write_read() {
        let data = Rc::new(RefCell::new(Vec::<u8>::new()));
        let mut handlers = Handlers::default();
        handlers
            .create(|parent, name, mode, _, done| {
                assert_eq!((parent, name), (1, OsStr::new("new")));
                assert_eq!(mode & libc::S_IFMT, libc::S_IFREG);
                done.complete(0, 9, stat(9, 0), 3);
            })
            .write({
                let data = data.clone();
                move |ino, offset, _, buf, fh, done| {
                    assert_eq!((ino, offset, fh), (9, 0, 3));
                    data.borrow_mut().extend_from_slice(&buf.borrow());
                    // Claims more than was sent.
                    done.complete(1000);
                }
            })
            .read({
                let data = data.clone();
                move |_, offset, _, buf, _, done| {
                    let n = buf.fill(&data.borrow()[offset as usize..]);
                    done.complete(n as i32);
                }
            });

        let create = fuse_create_in {
            mode: libc::S_IFREG | 0o600,
            ..Default::default()
        };
        let write = fuse_write_in {
            fh: 3,
            size: 6,
            ..Default::default()
        };
        let mut write_msg = write.as_bytes().to_vec();
        write_msg.extend_from_slice(b"abcdef");
        let read = fuse_read_in {
            fh: 3,
            offset: 2,
            size: 3,
            ..Default::default()
        };
        let conn = serve(
            "inode-io",
            vec![
                encode_request(FUSE_CREATE, 2, 1, &with_names(create.as_bytes(), &["new"])),
                encode_request(FUSE_WRITE, 3, 9, &write_msg),
                encode_request(FUSE_READ, 4, 9, read.as_bytes()),
            ],
            handlers,
        )
        .await;

        let created = conn.reply_to(2).unwrap().payload;
        let entry: fuse_entry_out = decode(&created);
        let opened: fuse_open_out = decode(&created[mem::size_of::<fuse_entry_out>()..]);
        assert_eq!((entry.nodeid, opened.fh), (9, 3));

        let written: fuse_write_out = decode(&conn.reply_to(3).unwrap().payload);
        assert_eq!(written.size, 6);
        assert_eq!(conn.reply_to(4).unwrap().payload, b"cde");
    }

    #[tokio::test]
    async fn setattr_passes_only_requested_fields() {
        let mut handlers = Handlers::default();
        handlers.setattr(|ino, requested, done| {
            assert_eq!(requested.mode, None);
            assert_eq!(requested.size, Some(0));
            assert_eq!(requested.uid, Some(7));
            assert_eq!(requested.gid, None);
            assert!(requested.mtime.is_some());
            done.complete(0, stat(ino, 0));
        });

        let arg = fuse_setattr_in {
            valid: FATTR_SIZE | FATTR_UID | FATTR_MTIME | FATTR_MTIME_NOW,
            uid: 7,
            ..Default::default()
        };
        let conn = serve(
            "inode-setattr",
            vec![encode_request(FUSE_SETATTR, 2, 3, arg.as_bytes())],
            handlers,
        )
        .await;

        let attr: fuse_attr_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!((attr.attr.ino, attr.attr.size), (3, 0));
    }

    #[tokio::test]
    async fn setattr_times_before_the_epoch() {
        let mut handlers = Handlers::default();
        handlers.setattr(|ino, requested, done| {
            assert_eq!(
                requested.mtime,
                Some(std::time::UNIX_EPOCH - std::time::Duration::from_secs(86400))
            );
            assert_eq!(requested.atime, None);
            done.complete(0, stat(ino, 0));
        });

        let arg = fuse_setattr_in {
            valid: FATTR_MTIME,
            mtime: (-86400i64) as u64,
            ..Default::default()
        };
        let conn = serve(
            "inode-setattr-epoch",
            vec![encode_request(FUSE_SETATTR, 2, 3, arg.as_bytes())],
            handlers,
        )
        .await;

        let reply = conn.reply_to(2).unwrap();
        assert_eq!(reply.error, 0);
        let attr: fuse_attr_out = decode(&reply.payload);
        assert_eq!(attr.attr.ino, 3);
    }

    #[tokio::test]
    async fn status_replies_and_namespace_arguments() {
        let seen = Rc::new(RefCell::new(Vec::<String>::new()));
        let mut handlers = Handlers::default();
        handlers
            .rename({
                let seen = seen.clone();
                move |parent, name, newparent, newname, done| {
                    seen.borrow_mut().push(format!(
                        "rename {} {:?} {} {:?}",
                        parent, name, newparent, newname
                    ));
                    done.complete(0);
                }
            })
            .symlink({
                let seen = seen.clone();
                move |parent, target, name, done| {
                    seen.borrow_mut()
                        .push(format!("symlink {} {:?} {:?}", parent, target, name));
                    done.complete(-libc::EEXIST, 0, Stat::default());
                }
            })
            .fsync(|_, datasync, fh, done| {
                assert!(datasync);
                assert_eq!(fh, 8);
                done.complete(0);
            })
            .statfs(|_, done| {
                let st = StatFs {
                    bsize: Some(4096),
                    ..StatFs::default()
                };
                done.complete(0, st);
            })
            .access(|_, _, done| done.complete(-libc::EACCES));

        let rename = fuse_rename_in { newdir: 4 };
        let fsync = fuse_fsync_in {
            fh: 8,
            fsync_flags: FUSE_FSYNC_FDATASYNC,
            padding: 0,
        };
        let access = fuse_access_in {
            mask: libc::R_OK as u32,
            padding: 0,
        };
        let conn = serve(
            "inode-status",
            vec![
                encode_request(FUSE_RENAME, 2, 1, &with_names(rename.as_bytes(), &["a", "b"])),
                encode_request(FUSE_SYMLINK, 3, 1, &with_names(&[], &["link", "/target"])),
                encode_request(FUSE_FSYNC, 4, 2, fsync.as_bytes()),
                encode_request(FUSE_STATFS, 5, 1, &[]),
                encode_request(FUSE_ACCESS, 6, 1, access.as_bytes()),
            ],
            handlers,
        )
        .await;

        assert_eq!(conn.reply_to(2).unwrap().error, 0);
        assert!(conn.reply_to(2).unwrap().payload.is_empty());
        assert_eq!(conn.reply_to(3).unwrap().error, -libc::EEXIST);
        assert_eq!(conn.reply_to(4).unwrap().error, 0);
        let st: fuse_statfs_out = decode(&conn.reply_to(5).unwrap().payload);
        assert_eq!(st.st.bsize, 4096);
        assert_eq!(conn.reply_to(6).unwrap().error, -libc::EACCES);
        assert_eq!(
            *seen.borrow(),
            [
                r#"rename 1 "a" 4 "b""#,
                r#"symlink 1 "/target" "link""#
            ]
        );
    }

    #[tokio::test]
    async fn init_and_destroy_send_nothing_to_the_kernel() {
        let seen = Rc::new(RefCell::new(vec![]));
        let mut handlers = Handlers::default();
        handlers
            .init({
                let seen = seen.clone();
                move |done| {
                    seen.borrow_mut().push("init");
                    done.complete(-libc::EIO);
                }
            })
            .destroy({
                let seen = seen.clone();
                move |done| {
                    seen.borrow_mut().push("destroy");
                    tokio::task::spawn_local(async move { done.complete(0) });
                }
            });

        let conn = serve("inode-init", vec![], handlers).await;
        // Only the INIT handshake itself.
        assert_eq!(conn.replies().len(), 1);
        assert_eq!(*seen.borrow(), ["init", "destroy"]);
    }
}
