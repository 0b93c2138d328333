//! Translation of inode-addressed kernel requests into path operations.

use super::{completion::Outcome, table::PathTable, Command, Op, PathBridge};
use crate::{
    bridge::{Ttl, WorkerCx},
    op::Operation,
    reply::{AttrOut, DirentBuf, EntryOut, OpenOut, StatfsOut, WriteOut},
    stat::{self, Stat},
};
use fusebridge_kernel::{self as kernel, fuse_in_header, FUSE_UNKNOWN_INO};
use slab::Slab;
use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    time::SystemTime,
};

type Cx<'a> = WorkerCx<'a, PathBridge>;

/// A negated errno to answer the kernel with.
type Result<T> = std::result::Result<T, i32>;

#[derive(Debug)]
struct DirHandle {
    path: PathBuf,
    /// The listing taken at offset zero, with the offset of each entry.
    entries: Option<Vec<(OsString, u64)>>,
}

/// What the worker remembers between requests.
#[derive(Debug)]
pub(crate) struct Worker {
    table: PathTable,
    dirs: Slab<DirHandle>,
    ttl: Ttl,
}

fn run(cx: &Cx<'_>, op: Op) -> Outcome {
    cx.call(|ticket| Command::new(op, ticket))
}

fn status(cx: &Cx<'_>, op: Op) -> Result<i32> {
    match run(cx, op) {
        Outcome::Status(status) if status >= 0 => Ok(status),
        outcome => Err(outcome.errno()),
    }
}

fn getattr(cx: &Cx<'_>, path: PathBuf) -> Result<Stat> {
    match run(cx, Op::Getattr { path }) {
        Outcome::Attr(stat) => Ok(stat),
        outcome => Err(outcome.errno()),
    }
}

fn opened(outcome: Outcome) -> Result<u64> {
    match outcome {
        Outcome::Open(fh) => Ok(fh),
        outcome => Err(outcome.errno()),
    }
}

fn time_arg(valid: u32, set: u32, now: u32, secs: u64, nsecs: u32) -> Option<SystemTime> {
    if valid & now != 0 {
        Some(SystemTime::now())
    } else if valid & set != 0 {
        Some(stat::time_from_kernel(secs, nsecs))
    } else {
        None
    }
}

impl Worker {
    pub(crate) fn new(ttl: Ttl) -> Self {
        Self {
            table: PathTable::default(),
            dirs: Slab::new(),
            ttl,
        }
    }

    fn path(&self, ino: u64) -> Result<PathBuf> {
        self.table
            .path(ino)
            .map(ToOwned::to_owned)
            .ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.path(parent)?.join(name))
    }

    pub(crate) fn handle(&mut self, cx: &Cx<'_>, header: &fuse_in_header, op: Operation<'_>) {
        let ino = header.nodeid;
        let replier = || cx.replier(header.unique);

        let result = match op {
            Operation::Forget { arg } => {
                self.table.forget(ino, arg.nlookup);
                return;
            }
            Operation::BatchForget { forgets } => {
                for forget in forgets {
                    self.table.forget(forget.nodeid, forget.nlookup);
                }
                return;
            }

            Operation::Lookup { name } => self
                .lookup(cx, ino, name)
                .map(|out| replier().reply(&out)),
            Operation::Getattr { .. } => self.getattr(cx, ino).map(|out| replier().reply(&out)),
            Operation::Setattr { arg } => self
                .setattr(cx, ino, &arg)
                .map(|out| replier().reply(&out)),
            Operation::Readlink => self.path(ino).and_then(|path| {
                match run(cx, Op::Readlink { path }) {
                    Outcome::Link(target) => Ok(replier().reply(&target.as_os_str())),
                    outcome => Err(outcome.errno()),
                }
            }),

            Operation::Mkdir { arg, name } => self
                .mkdir(cx, ino, name, arg.mode)
                .map(|out| replier().reply(&out)),
            Operation::Create { arg, name } => self
                .create(cx, ino, name, &arg)
                .map(|out| replier().reply(&out)),
            Operation::Unlink { name } => self
                .remove(cx, ino, name, false)
                .map(|()| replier().error(0)),
            Operation::Rmdir { name } => self
                .remove(cx, ino, name, true)
                .map(|()| replier().error(0)),
            Operation::Rename { arg, name, newname } => self
                .rename(cx, ino, name, arg.newdir, newname)
                .map(|()| replier().error(0)),

            Operation::Open { arg } => self
                .path(ino)
                .and_then(|path| {
                    opened(run(
                        cx,
                        Op::Open {
                            path,
                            flags: arg.flags,
                        },
                    ))
                })
                .map(|fh| replier().reply(&OpenOut::new(fh, 0))),
            Operation::Read { arg } => self.read(cx, ino, &arg).map(|data| replier().reply(&data)),
            Operation::Write { arg, data } => self
                .write(cx, ino, &arg, data)
                .map(|out| replier().reply(&out)),
            Operation::Release { arg } => self
                .path(ino)
                .and_then(|path| status(cx, Op::Release { path, fh: arg.fh }))
                .map(|_| replier().error(0)),

            Operation::Opendir { .. } => self.path(ino).map(|path| {
                let fh = self.dirs.insert(DirHandle {
                    path,
                    entries: None,
                });
                replier().reply(&OpenOut::new(fh as u64, 0))
            }),
            Operation::Readdir { arg } => self.readdir(cx, &arg).map(|buf| replier().reply(&buf)),
            Operation::Releasedir { arg } => {
                let fh = arg.fh as usize;
                if self.dirs.contains(fh) {
                    self.dirs.remove(fh);
                }
                Ok(replier().error(0))
            }

            Operation::Statfs => match run(cx, Op::Statfs { path: "/".into() }) {
                Outcome::Statfs(st) => Ok(replier().reply(&StatfsOut::new(&st))),
                outcome => Err(outcome.errno()),
            },
            Operation::Setxattr { arg, name, value } => self
                .path(ino)
                .and_then(|path| {
                    status(
                        cx,
                        Op::Setxattr {
                            path,
                            name: name.to_owned(),
                            value: value.to_vec(),
                            flags: arg.flags,
                        },
                    )
                })
                .map(|_| replier().error(0)),

            op => {
                tracing::debug!("not supported by path handlers: {:?}", op);
                Err(libc::ENOSYS)
            }
        };

        if let Err(errno) = result {
            replier().error(errno);
        }
    }

    fn lookup(&mut self, cx: &Cx<'_>, parent: u64, name: &OsStr) -> Result<EntryOut> {
        let path = self.child(parent, name)?;
        self.entry(cx, path)
    }

    /// Stat a path the kernel is about to learn and take a reference on it.
    fn entry(&mut self, cx: &Cx<'_>, path: PathBuf) -> Result<EntryOut> {
        let mut stat = getattr(cx, path.clone())?;
        let ino = self.table.intern(&path);
        stat.ino = Some(ino);
        Ok(EntryOut::new(ino, &stat, self.ttl.entry, self.ttl.attr))
    }

    fn getattr(&self, cx: &Cx<'_>, ino: u64) -> Result<AttrOut> {
        let mut stat = getattr(cx, self.path(ino)?)?;
        stat.ino = Some(ino);
        Ok(AttrOut::new(&stat, self.ttl.attr))
    }

    fn setattr(&self, cx: &Cx<'_>, ino: u64, arg: &kernel::fuse_setattr_in) -> Result<AttrOut> {
        let path = self.path(ino)?;
        let valid = arg.valid;

        if valid & kernel::FATTR_MODE != 0 {
            status(
                cx,
                Op::Chmod {
                    path: path.clone(),
                    mode: arg.mode,
                },
            )?;
        }

        if valid & (kernel::FATTR_UID | kernel::FATTR_GID) != 0 {
            status(
                cx,
                Op::Chown {
                    path: path.clone(),
                    uid: (valid & kernel::FATTR_UID != 0).then_some(arg.uid),
                    gid: (valid & kernel::FATTR_GID != 0).then_some(arg.gid),
                },
            )?;
        }

        if valid & kernel::FATTR_SIZE != 0 {
            status(
                cx,
                Op::Truncate {
                    path: path.clone(),
                    size: arg.size,
                },
            )?;
        }

        let atime = time_arg(
            valid,
            kernel::FATTR_ATIME,
            kernel::FATTR_ATIME_NOW,
            arg.atime,
            arg.atimensec,
        );
        let mtime = time_arg(
            valid,
            kernel::FATTR_MTIME,
            kernel::FATTR_MTIME_NOW,
            arg.mtime,
            arg.mtimensec,
        );
        if atime.is_some() || mtime.is_some() {
            status(
                cx,
                Op::Utimens {
                    path: path.clone(),
                    atime,
                    mtime,
                },
            )?;
        }

        self.getattr(cx, ino)
    }

    fn mkdir(&mut self, cx: &Cx<'_>, parent: u64, name: &OsStr, mode: u32) -> Result<EntryOut> {
        let path = self.child(parent, name)?;
        status(
            cx,
            Op::Mkdir {
                path: path.clone(),
                mode,
            },
        )?;
        self.entry(cx, path)
    }

    fn create(
        &mut self,
        cx: &Cx<'_>,
        parent: u64,
        name: &OsStr,
        arg: &kernel::fuse_create_in,
    ) -> Result<(EntryOut, OpenOut)> {
        let path = self.child(parent, name)?;
        let fh = opened(run(
            cx,
            Op::Create {
                path: path.clone(),
                mode: arg.mode,
                flags: arg.flags,
            },
        ))?;
        let entry = self.entry(cx, path)?;
        Ok((entry, OpenOut::new(fh, 0)))
    }

    fn rename(
        &mut self,
        cx: &Cx<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<()> {
        let from = self.child(parent, name)?;
        let to = self.child(newparent, newname)?;
        status(
            cx,
            Op::Rename {
                from: from.clone(),
                to: to.clone(),
            },
        )?;
        self.table.rename(&from, &to);
        Ok(())
    }

    fn remove(&mut self, cx: &Cx<'_>, parent: u64, name: &OsStr, dir: bool) -> Result<()> {
        let path = self.child(parent, name)?;
        let op = if dir {
            Op::Rmdir { path: path.clone() }
        } else {
            Op::Unlink { path: path.clone() }
        };
        status(cx, op)?;
        self.table.unlink(&path);
        Ok(())
    }

    fn read(&self, cx: &Cx<'_>, ino: u64, arg: &kernel::fuse_read_in) -> Result<Vec<u8>> {
        let op = Op::Read {
            path: self.path(ino)?,
            offset: arg.offset,
            len: arg.size as usize,
            fh: arg.fh,
        };
        match run(cx, op) {
            Outcome::Data(data) => Ok(data),
            outcome => Err(outcome.errno()),
        }
    }

    fn write(
        &self,
        cx: &Cx<'_>,
        ino: u64,
        arg: &kernel::fuse_write_in,
        data: &[u8],
    ) -> Result<WriteOut> {
        let op = Op::Write {
            path: self.path(ino)?,
            offset: arg.offset,
            data: data.to_vec(),
            fh: arg.fh,
        };
        let written = status(cx, op)?;
        // The kernel rejects counts beyond what it sent.
        Ok(WriteOut::new((written as u32).min(data.len() as u32)))
    }

    fn readdir(&mut self, cx: &Cx<'_>, arg: &kernel::fuse_read_in) -> Result<DirentBuf> {
        let dir = self.dirs.get_mut(arg.fh as usize).ok_or(libc::EBADF)?;

        let entries = match &mut dir.entries {
            Some(entries) if arg.offset > 0 => entries,
            entries => {
                let names = match run(
                    cx,
                    Op::Readdir {
                        path: dir.path.clone(),
                    },
                ) {
                    Outcome::Names(names) => names,
                    outcome => return Err(outcome.errno()),
                };
                entries.insert(names.into_iter().zip(1..).collect())
            }
        };

        let mut buf = DirentBuf::new(arg.size as usize);
        for (name, off) in entries.iter().filter(|(_, off)| *off > arg.offset) {
            if buf.push(name, FUSE_UNKNOWN_INO, 0, *off) {
                break;
            }
        }
        Ok(buf)
    }
}
