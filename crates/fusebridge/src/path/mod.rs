//! Path-addressed handlers.
//!
//! The worker keeps the inode numbers the kernel knows about and turns every
//! request into one or more calls on paths, so handlers never see an inode.
//!
//! ```no_run
//! use fusebridge::{path, Options, Stat};
//!
//! # async fn run() -> Result<(), fusebridge::Error> {
//! let mut handlers = path::Handlers::default();
//! handlers.getattr(|path, done| {
//!     if path == std::path::Path::new("/") {
//!         let stat = Stat {
//!             mode: Some(libc::S_IFDIR | 0o755),
//!             nlink: Some(2),
//!             ..Stat::default()
//!         };
//!         done.complete(0, stat);
//!     } else {
//!         done.complete(-libc::ENOENT, Stat::default());
//!     }
//! });
//!
//! // Inside a `tokio::task::LocalSet`:
//! let mount = path::start("/mnt/hello", handlers, &Options::default())?;
//! mount.closed().await?;
//! # Ok(())
//! # }
//! ```

mod completion;
mod table;
mod worker;

pub use self::completion::{
    AttrCompletion, OpenCompletion, ReadCompletion, ReaddirCompletion, ReadlinkCompletion,
    StatfsCompletion, StatusCompletion, WriteCompletion,
};

use self::{completion::Outcome, worker::Worker};
use crate::{
    bridge::{self, Continuation, Mount, Options, SharedBuffer, Teardown, Ticket, Vocabulary, WorkerCx},
    error::Error,
    op::Operation,
};
use fusebridge_kernel::fuse_in_header;
use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::{Path, PathBuf},
    time::SystemTime,
};

type Handler<F> = Option<Box<F>>;

/// The callbacks of a path-addressed filesystem.
///
/// Every callback runs on the event loop and receives a completion that must
/// be called once, either right away or later from a spawned task. Operations
/// without a callback fail with `EPERM`.
#[derive(Default)]
pub struct Handlers {
    init: Handler<dyn Fn(StatusCompletion)>,
    destroy: Handler<dyn Fn(StatusCompletion)>,
    getattr: Handler<dyn Fn(&Path, AttrCompletion)>,
    readdir: Handler<dyn Fn(&Path, ReaddirCompletion)>,
    readlink: Handler<dyn Fn(&Path, ReadlinkCompletion)>,
    open: Handler<dyn Fn(&Path, u32, OpenCompletion)>,
    read: Handler<dyn Fn(&Path, u64, usize, SharedBuffer, u64, ReadCompletion)>,
    write: Handler<dyn Fn(&Path, u64, usize, SharedBuffer, u64, WriteCompletion)>,
    release: Handler<dyn Fn(&Path, u64, StatusCompletion)>,
    create: Handler<dyn Fn(&Path, u32, u32, OpenCompletion)>,
    mkdir: Handler<dyn Fn(&Path, u32, StatusCompletion)>,
    unlink: Handler<dyn Fn(&Path, StatusCompletion)>,
    rmdir: Handler<dyn Fn(&Path, StatusCompletion)>,
    rename: Handler<dyn Fn(&Path, &Path, StatusCompletion)>,
    truncate: Handler<dyn Fn(&Path, u64, StatusCompletion)>,
    chmod: Handler<dyn Fn(&Path, u32, StatusCompletion)>,
    chown: Handler<dyn Fn(&Path, Option<u32>, Option<u32>, StatusCompletion)>,
    utimens: Handler<dyn Fn(&Path, Option<SystemTime>, Option<SystemTime>, StatusCompletion)>,
    statfs: Handler<dyn Fn(&Path, StatfsCompletion)>,
    setxattr: Handler<dyn Fn(&Path, &OsStr, &[u8], u32, StatusCompletion)>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

impl Handlers {
    /// Called once after the kernel handshake.
    pub fn init(&mut self, f: impl Fn(StatusCompletion) + 'static) -> &mut Self {
        self.init = Some(Box::new(f));
        self
    }

    /// Called once when the session is over, including when mounting failed.
    pub fn destroy(&mut self, f: impl Fn(StatusCompletion) + 'static) -> &mut Self {
        self.destroy = Some(Box::new(f));
        self
    }

    /// Also answers name lookups, so a filesystem is not browsable without it.
    pub fn getattr(&mut self, f: impl Fn(&Path, AttrCompletion) + 'static) -> &mut Self {
        self.getattr = Some(Box::new(f));
        self
    }

    pub fn readdir(&mut self, f: impl Fn(&Path, ReaddirCompletion) + 'static) -> &mut Self {
        self.readdir = Some(Box::new(f));
        self
    }

    pub fn readlink(&mut self, f: impl Fn(&Path, ReadlinkCompletion) + 'static) -> &mut Self {
        self.readlink = Some(Box::new(f));
        self
    }

    /// Receives the `open(2)` flags.
    pub fn open(&mut self, f: impl Fn(&Path, u32, OpenCompletion) + 'static) -> &mut Self {
        self.open = Some(Box::new(f));
        self
    }

    /// Receives `(path, offset, len, buffer, fh, done)`. The buffer is
    /// zero-filled and `len` bytes long.
    pub fn read(
        &mut self,
        f: impl Fn(&Path, u64, usize, SharedBuffer, u64, ReadCompletion) + 'static,
    ) -> &mut Self {
        self.read = Some(Box::new(f));
        self
    }

    /// Receives `(path, offset, len, buffer, fh, done)` with the data in the
    /// buffer.
    pub fn write(
        &mut self,
        f: impl Fn(&Path, u64, usize, SharedBuffer, u64, WriteCompletion) + 'static,
    ) -> &mut Self {
        self.write = Some(Box::new(f));
        self
    }

    pub fn release(&mut self, f: impl Fn(&Path, u64, StatusCompletion) + 'static) -> &mut Self {
        self.release = Some(Box::new(f));
        self
    }

    /// Receives the mode and the `open(2)` flags.
    pub fn create(&mut self, f: impl Fn(&Path, u32, u32, OpenCompletion) + 'static) -> &mut Self {
        self.create = Some(Box::new(f));
        self
    }

    pub fn mkdir(&mut self, f: impl Fn(&Path, u32, StatusCompletion) + 'static) -> &mut Self {
        self.mkdir = Some(Box::new(f));
        self
    }

    pub fn unlink(&mut self, f: impl Fn(&Path, StatusCompletion) + 'static) -> &mut Self {
        self.unlink = Some(Box::new(f));
        self
    }

    pub fn rmdir(&mut self, f: impl Fn(&Path, StatusCompletion) + 'static) -> &mut Self {
        self.rmdir = Some(Box::new(f));
        self
    }

    pub fn rename(&mut self, f: impl Fn(&Path, &Path, StatusCompletion) + 'static) -> &mut Self {
        self.rename = Some(Box::new(f));
        self
    }

    pub fn truncate(&mut self, f: impl Fn(&Path, u64, StatusCompletion) + 'static) -> &mut Self {
        self.truncate = Some(Box::new(f));
        self
    }

    pub fn chmod(&mut self, f: impl Fn(&Path, u32, StatusCompletion) + 'static) -> &mut Self {
        self.chmod = Some(Box::new(f));
        self
    }

    /// An id is `None` when it is left unchanged.
    pub fn chown(
        &mut self,
        f: impl Fn(&Path, Option<u32>, Option<u32>, StatusCompletion) + 'static,
    ) -> &mut Self {
        self.chown = Some(Box::new(f));
        self
    }

    /// Receives the new access and modification times. A time is `None`
    /// when it is left unchanged.
    pub fn utimens(
        &mut self,
        f: impl Fn(&Path, Option<SystemTime>, Option<SystemTime>, StatusCompletion) + 'static,
    ) -> &mut Self {
        self.utimens = Some(Box::new(f));
        self
    }

    /// Always called with the root path.
    pub fn statfs(&mut self, f: impl Fn(&Path, StatfsCompletion) + 'static) -> &mut Self {
        self.statfs = Some(Box::new(f));
        self
    }

    /// Receives the attribute name, its value and the `setxattr(2)` flags.
    pub fn setxattr(
        &mut self,
        f: impl Fn(&Path, &OsStr, &[u8], u32, StatusCompletion) + 'static,
    ) -> &mut Self {
        self.setxattr = Some(Box::new(f));
        self
    }
}

/// One operation as carried from the worker to the event loop.
#[derive(Debug)]
pub(crate) enum Op {
    Init,
    Destroy,
    Getattr { path: PathBuf },
    Readdir { path: PathBuf },
    Readlink { path: PathBuf },
    Open { path: PathBuf, flags: u32 },
    Read { path: PathBuf, offset: u64, len: usize, fh: u64 },
    Write { path: PathBuf, offset: u64, data: Vec<u8>, fh: u64 },
    Release { path: PathBuf, fh: u64 },
    Create { path: PathBuf, mode: u32, flags: u32 },
    Mkdir { path: PathBuf, mode: u32 },
    Unlink { path: PathBuf },
    Rmdir { path: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Truncate { path: PathBuf, size: u64 },
    Chmod { path: PathBuf, mode: u32 },
    Chown { path: PathBuf, uid: Option<u32>, gid: Option<u32> },
    Utimens { path: PathBuf, atime: Option<SystemTime>, mtime: Option<SystemTime> },
    Statfs { path: PathBuf },
    Setxattr { path: PathBuf, name: OsString, value: Vec<u8>, flags: u32 },
}

impl Op {
    /// The name of the handler this operation is dispatched to.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Init => "init",
            Op::Destroy => "destroy",
            Op::Getattr { .. } => "getattr",
            Op::Readdir { .. } => "readdir",
            Op::Readlink { .. } => "readlink",
            Op::Open { .. } => "open",
            Op::Read { .. } => "read",
            Op::Write { .. } => "write",
            Op::Release { .. } => "release",
            Op::Create { .. } => "create",
            Op::Mkdir { .. } => "mkdir",
            Op::Unlink { .. } => "unlink",
            Op::Rmdir { .. } => "rmdir",
            Op::Rename { .. } => "rename",
            Op::Truncate { .. } => "truncate",
            Op::Chmod { .. } => "chmod",
            Op::Chown { .. } => "chown",
            Op::Utimens { .. } => "utimens",
            Op::Statfs { .. } => "statfs",
            Op::Setxattr { .. } => "setxattr",
        }
    }
}

#[derive(Debug)]
pub(crate) struct Command {
    op: Op,
    ticket: Ticket<Outcome>,
}

impl Command {
    pub(crate) fn new(op: Op, ticket: Ticket<Outcome>) -> Self {
        Self { op, ticket }
    }
}

/// The path-addressed vocabulary.
pub(crate) enum PathBridge {}

impl Vocabulary for PathBridge {
    type Command = Command;
    type Answer = Outcome;
    type State = Worker;
    type Handlers = Handlers;

    fn init(ticket: Ticket<Outcome>) -> Command {
        Command::new(Op::Init, ticket)
    }

    fn destroy(ticket: Ticket<Outcome>) -> Command {
        Command::new(Op::Destroy, ticket)
    }

    fn is_destroy(command: &Command) -> bool {
        matches!(command.op, Op::Destroy)
    }

    fn handle(
        state: &mut Worker,
        cx: &WorkerCx<'_, Self>,
        header: &fuse_in_header,
        op: Operation<'_>,
    ) {
        state.handle(cx, header, op);
    }

    fn dispatch(handlers: &Handlers, command: Command, teardown: Option<Teardown>) {
        let Command { op, ticket } = command;
        let name = op.name();
        let inner = Continuation::new(ticket, teardown);

        // Resolve the handler, or answer with the default by dropping the continuation.
        macro_rules! call {
            ($handler:ident, |$h:ident| $body:expr) => {
                match &handlers.$handler {
                    Some($h) => $body,
                    None => {
                        tracing::debug!(op = name, "no handler registered");
                        drop(inner);
                    }
                }
            };
        }

        match op {
            Op::Init => call!(init, |h| h(StatusCompletion::new(inner))),
            Op::Destroy => call!(destroy, |h| h(StatusCompletion::new(inner))),
            Op::Getattr { path } => call!(getattr, |h| h(&path, AttrCompletion::new(inner))),
            Op::Readdir { path } => call!(readdir, |h| h(&path, ReaddirCompletion::new(inner))),
            Op::Readlink { path } => call!(readlink, |h| h(&path, ReadlinkCompletion::new(inner))),
            Op::Open { path, flags } => call!(open, |h| h(&path, flags, OpenCompletion::new(inner))),
            Op::Read {
                path,
                offset,
                len,
                fh,
            } => call!(read, |h| {
                let buffer = SharedBuffer::zeroed(len);
                let done = ReadCompletion::new(inner, buffer.clone(), len);
                h(&path, offset, len, buffer, fh, done)
            }),
            Op::Write {
                path,
                offset,
                data,
                fh,
            } => call!(write, |h| {
                let len = data.len();
                let buffer = SharedBuffer::from_vec(data);
                h(&path, offset, len, buffer, fh, WriteCompletion::new(inner))
            }),
            Op::Release { path, fh } => {
                call!(release, |h| h(&path, fh, StatusCompletion::new(inner)))
            }
            Op::Create { path, mode, flags } => {
                call!(create, |h| h(&path, mode, flags, OpenCompletion::new(inner)))
            }
            Op::Mkdir { path, mode } => {
                call!(mkdir, |h| h(&path, mode, StatusCompletion::new(inner)))
            }
            Op::Unlink { path } => call!(unlink, |h| h(&path, StatusCompletion::new(inner))),
            Op::Rmdir { path } => call!(rmdir, |h| h(&path, StatusCompletion::new(inner))),
            Op::Rename { from, to } => {
                call!(rename, |h| h(&from, &to, StatusCompletion::new(inner)))
            }
            Op::Truncate { path, size } => {
                call!(truncate, |h| h(&path, size, StatusCompletion::new(inner)))
            }
            Op::Chmod { path, mode } => {
                call!(chmod, |h| h(&path, mode, StatusCompletion::new(inner)))
            }
            Op::Chown { path, uid, gid } => {
                call!(chown, |h| h(&path, uid, gid, StatusCompletion::new(inner)))
            }
            Op::Utimens { path, atime, mtime } => {
                call!(utimens, |h| h(&path, atime, mtime, StatusCompletion::new(inner)))
            }
            Op::Statfs { path } => call!(statfs, |h| h(&path, StatfsCompletion::new(inner))),
            Op::Setxattr {
                path,
                name,
                value,
                flags,
            } => call!(setxattr, |h| h(
                &path,
                &name,
                &value,
                flags,
                StatusCompletion::new(inner)
            )),
        }
    }
}

/// Mount `mountpoint` and serve it with path-addressed `handlers`.
///
/// Must be called from within a [`tokio::task::LocalSet`]: the handlers run
/// on the calling thread. The returned [`Mount`] resolves
/// [`closed`](Mount::closed) once the `destroy` handler has completed.
pub fn start(
    mountpoint: impl AsRef<Path>,
    handlers: Handlers,
    options: &Options,
) -> Result<Mount, Error> {
    bridge::start::<PathBridge>(
        mountpoint.as_ref(),
        handlers,
        Worker::new(options.ttl()),
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        stat::{Stat, StatFs},
        testing::{decode, encode_request, init_request, parse_dirents, with_names, FakeTransport},
    };
    use fusebridge_kernel::{self as kernel, *};
    use std::{cell::RefCell, rc::Rc, sync::Arc, time::Duration};
    use tokio::task::LocalSet;
    use zerocopy::IntoBytes;

    type Log = Rc<RefCell<Vec<String>>>;

    async fn serve(name: &str, requests: Vec<Vec<u8>>, handlers: Handlers) -> Arc<FakeTransport> {
        let conn = FakeTransport::new(std::iter::once(init_request()).chain(requests));
        let options = Options::default();
        LocalSet::new()
            .run_until(async {
                let mount = bridge::launch_fake::<PathBridge>(
                    name,
                    Arc::clone(&conn),
                    handlers,
                    Worker::new(options.ttl()),
                    &options,
                )
                .unwrap();
                mount.closed().await.unwrap();
            })
            .await;
        conn
    }

    fn file_stat(size: u64) -> Stat {
        Stat {
            size: Some(size),
            mode: Some(libc::S_IFREG | 0o644),
            nlink: Some(1),
            ..Stat::default()
        }
    }

    fn lookup(unique: u64, parent: u64, name: &str) -> Vec<u8> {
        encode_request(FUSE_LOOKUP, unique, parent, &with_names(&[], &[name]))
    }

    fn getattr(unique: u64, ino: u64) -> Vec<u8> {
        encode_request(
            FUSE_GETATTR,
            unique,
            ino,
            kernel::fuse_getattr_in::default().as_bytes(),
        )
    }

    fn open(unique: u64, ino: u64, opcode: u32) -> Vec<u8> {
        encode_request(opcode, unique, ino, kernel::fuse_open_in::default().as_bytes())
    }

    fn read(unique: u64, ino: u64, opcode: u32, fh: u64, offset: u64, size: u32) -> Vec<u8> {
        let arg = kernel::fuse_read_in {
            fh,
            offset,
            size,
            ..Default::default()
        };
        encode_request(opcode, unique, ino, arg.as_bytes())
    }

    #[tokio::test]
    async fn lookup_and_getattr_go_through_getattr() {
        let seen: Log = Rc::default();
        let mut handlers = Handlers::default();
        handlers.getattr({
            let seen = seen.clone();
            move |path, done| {
                seen.borrow_mut().push(path.display().to_string());
                if path == Path::new("/hello") {
                    done.complete(0, file_stat(42));
                } else {
                    done.complete(-libc::ENOENT, Stat::default());
                }
            }
        });

        let conn = serve(
            "path-getattr",
            vec![lookup(2, 1, "hello"), getattr(3, 2), lookup(4, 1, "missing")],
            handlers,
        )
        .await;

        let entry = conn.reply_to(2).unwrap();
        assert_eq!(entry.error, 0);
        let entry: kernel::fuse_entry_out = decode(&entry.payload);
        assert_eq!(entry.nodeid, 2);
        assert_eq!(entry.attr.size, 42);
        assert_eq!(entry.entry_valid, 0);
        assert_eq!(entry.attr_valid, 10);

        let attr = conn.reply_to(3).unwrap();
        assert_eq!(attr.error, 0);
        let attr: kernel::fuse_attr_out = decode(&attr.payload);
        assert_eq!(attr.attr.size, 42);
        assert_eq!(attr.attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(attr.attr.ino, 2);
        assert_eq!(attr.attr_valid, 10);

        assert_eq!(conn.reply_to(4).unwrap().error, -libc::ENOENT);
        assert_eq!(*seen.borrow(), ["/hello", "/hello", "/missing"]);
    }

    #[tokio::test]
    async fn missing_handlers_answer_eperm() {
        let conn = serve(
            "path-missing",
            vec![
                getattr(2, 1),
                encode_request(FUSE_GETLK, 3, 1, &[]),
                getattr(4, 99),
            ],
            Handlers::default(),
        )
        .await;

        assert_eq!(conn.reply_to(2).unwrap().error, -libc::EPERM);
        assert_eq!(conn.reply_to(3).unwrap().error, -libc::ENOSYS);
        assert_eq!(conn.reply_to(4).unwrap().error, -libc::ENOENT);
    }

    #[tokio::test]
    async fn dropped_completion_answers_eperm() {
        let mut handlers = Handlers::default();
        handlers.getattr(|_, done| drop(done));
        let conn = serve("path-dropped", vec![getattr(2, 1)], handlers).await;
        assert_eq!(conn.reply_to(2).unwrap().error, -libc::EPERM);
    }

    #[tokio::test]
    async fn init_and_destroy_run_once() {
        let seen: Log = Rc::default();
        let mut handlers = Handlers::default();
        handlers
            .init({
                let seen = seen.clone();
                move |done| {
                    seen.borrow_mut().push("init".into());
                    done.complete(0);
                }
            })
            .destroy({
                let seen = seen.clone();
                move |done| {
                    seen.borrow_mut().push("destroy".into());
                    done.complete(0);
                }
            });

        let conn = serve(
            "path-destroy",
            vec![encode_request(FUSE_DESTROY, 2, 0, &[]), getattr(3, 1)],
            handlers,
        )
        .await;

        assert_eq!(conn.reply_to(2).unwrap().error, 0);
        // Nothing is read after FUSE_DESTROY.
        assert!(conn.reply_to(3).is_none());
        assert_eq!(*seen.borrow(), ["init", "destroy"]);
    }

    #[tokio::test]
    async fn open_read_release_pass_the_file_handle() {
        let seen: Log = Rc::default();
        let mut handlers = Handlers::default();
        handlers
            .getattr(|_, done| done.complete(0, file_stat(5)))
            .open(|_, _, done| done.complete(0, 7))
            .read({
                let seen = seen.clone();
                move |path, offset, len, buf, fh, done| {
                    seen.borrow_mut()
                        .push(format!("read {} {} {} {}", path.display(), offset, len, fh));
                    buf.fill(b"hello");
                    // Claims more than was asked for.
                    done.complete(100);
                }
            })
            .release({
                let seen = seen.clone();
                move |path, fh, done| {
                    seen.borrow_mut()
                        .push(format!("release {} {}", path.display(), fh));
                    done.complete(0);
                }
            });

        let release = kernel::fuse_release_in {
            fh: 7,
            ..Default::default()
        };
        let conn = serve(
            "path-read",
            vec![
                lookup(2, 1, "hello"),
                open(3, 2, FUSE_OPEN),
                read(4, 2, FUSE_READ, 7, 0, 4),
                read(5, 2, FUSE_READ, 7, 0, 4096),
                encode_request(FUSE_RELEASE, 6, 2, release.as_bytes()),
            ],
            handlers,
        )
        .await;

        let opened: kernel::fuse_open_out = decode(&conn.reply_to(3).unwrap().payload);
        assert_eq!(opened.fh, 7);
        assert_eq!(conn.reply_to(4).unwrap().payload, b"hell");
        // Only the reported count is sent back, the rest of it stays zeroed.
        let full = conn.reply_to(5).unwrap().payload;
        assert_eq!(full.len(), 100);
        assert_eq!(&full[..5], b"hello");
        assert!(full[5..].iter().all(|&b| b == 0));
        assert_eq!(conn.reply_to(6).unwrap().error, 0);
        assert_eq!(
            *seen.borrow(),
            [
                "read /hello 0 4 7",
                "read /hello 0 4096 7",
                "release /hello 7"
            ]
        );
    }

    #[tokio::test]
    async fn write_passes_the_payload() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let mut handlers = Handlers::default();
        handlers
            .getattr(|_, done| done.complete(0, file_stat(0)))
            .write({
                let written = written.clone();
                move |_, offset, len, buf, fh, done| {
                    assert_eq!((offset, len, fh), (3, 4, 9));
                    written.borrow_mut().extend_from_slice(&buf.borrow());
                    done.complete(len as i32);
                }
            });

        let arg = kernel::fuse_write_in {
            fh: 9,
            offset: 3,
            size: 4,
            ..Default::default()
        };
        let mut msg = arg.as_bytes().to_vec();
        msg.extend_from_slice(b"data");
        let conn = serve(
            "path-write",
            vec![lookup(2, 1, "f"), encode_request(FUSE_WRITE, 3, 2, &msg)],
            handlers,
        )
        .await;

        let out: kernel::fuse_write_out = decode(&conn.reply_to(3).unwrap().payload);
        assert_eq!(out.size, 4);
        assert_eq!(*written.borrow(), b"data");
    }

    #[tokio::test]
    async fn completions_may_run_later() {
        let mut handlers = Handlers::default();
        handlers.getattr(|_, done| {
            tokio::task::spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.complete(0, file_stat(3));
            });
        });
        let conn = serve("path-async", vec![getattr(2, 1)], handlers).await;
        let attr: kernel::fuse_attr_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(attr.attr.size, 3);
    }

    #[tokio::test]
    async fn readdir_is_listed_once_and_paged() {
        let listed = Rc::new(RefCell::new(0));
        let mut handlers = Handlers::default();
        handlers.readdir({
            let listed = listed.clone();
            move |path, done| {
                assert_eq!(path, Path::new("/"));
                *listed.borrow_mut() += 1;
                done.complete(0, ["a", "b", "c"]);
            }
        });

        let release = kernel::fuse_release_in::default();
        let conn = serve(
            "path-readdir",
            vec![
                open(2, 1, FUSE_OPENDIR),
                // Room for two 32-byte entries.
                read(3, 1, FUSE_READDIR, 0, 0, 64),
                read(4, 1, FUSE_READDIR, 0, 2, 64),
                read(5, 1, FUSE_READDIR, 0, 3, 64),
                encode_request(FUSE_RELEASEDIR, 6, 1, release.as_bytes()),
                read(7, 1, FUSE_READDIR, 0, 3, 64),
            ],
            handlers,
        )
        .await;

        let opened: kernel::fuse_open_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(opened.fh, 0);
        assert_eq!(
            parse_dirents(&conn.reply_to(3).unwrap().payload),
            [
                (FUSE_UNKNOWN_INO, 1, "a".to_owned()),
                (FUSE_UNKNOWN_INO, 2, "b".to_owned())
            ]
        );
        assert_eq!(
            parse_dirents(&conn.reply_to(4).unwrap().payload),
            [(FUSE_UNKNOWN_INO, 3, "c".to_owned())]
        );
        assert!(conn.reply_to(5).unwrap().payload.is_empty());
        assert_eq!(conn.reply_to(6).unwrap().error, 0);
        assert_eq!(conn.reply_to(7).unwrap().error, -libc::EBADF);
        assert_eq!(*listed.borrow(), 1);
    }

    #[tokio::test]
    async fn setattr_runs_one_cycle_per_field() {
        let seen: Log = Rc::default();
        let record = |seen: &Log, what: String| seen.borrow_mut().push(what);
        let mut handlers = Handlers::default();
        handlers
            .getattr(|_, done| done.complete(0, file_stat(10)))
            .chmod({
                let seen = seen.clone();
                move |_, mode, done| {
                    record(&seen, format!("chmod {:o}", mode));
                    done.complete(0);
                }
            })
            .chown({
                let seen = seen.clone();
                move |_, uid, gid, done| {
                    record(&seen, format!("chown {:?} {:?}", uid, gid));
                    done.complete(0);
                }
            })
            .truncate({
                let seen = seen.clone();
                move |_, size, done| {
                    record(&seen, format!("truncate {}", size));
                    done.complete(if size == 0 { -libc::EROFS } else { 0 });
                }
            })
            .utimens({
                let seen = seen.clone();
                move |_, atime, mtime, done| {
                    record(
                        &seen,
                        format!("utimens {} {:?}", atime.is_some(), mtime),
                    );
                    done.complete(0);
                }
            });

        let changed = kernel::fuse_setattr_in {
            valid: FATTR_MODE | FATTR_GID | FATTR_SIZE | FATTR_MTIME,
            mode: 0o600,
            gid: 100,
            size: 10,
            mtime: 5,
            ..Default::default()
        };
        let failing = kernel::fuse_setattr_in {
            valid: FATTR_SIZE | FATTR_ATIME,
            size: 0,
            ..Default::default()
        };
        let conn = serve(
            "path-setattr",
            vec![
                encode_request(FUSE_SETATTR, 2, 1, changed.as_bytes()),
                encode_request(FUSE_SETATTR, 3, 1, failing.as_bytes()),
            ],
            handlers,
        )
        .await;

        let attr: kernel::fuse_attr_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(attr.attr.size, 10);
        assert_eq!(conn.reply_to(3).unwrap().error, -libc::EROFS);
        assert_eq!(
            *seen.borrow(),
            [
                "chmod 600".to_owned(),
                "chown None Some(100)".to_owned(),
                "truncate 10".to_owned(),
                format!(
                    "utimens false {:?}",
                    Some(std::time::UNIX_EPOCH + Duration::from_secs(5))
                ),
                "truncate 0".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn namespace_changes_keep_inodes() {
        let seen: Log = Rc::default();
        let mut handlers = Handlers::default();
        handlers
            .getattr({
                let seen = seen.clone();
                move |path, done| {
                    seen.borrow_mut().push(format!("getattr {}", path.display()));
                    done.complete(0, file_stat(1));
                }
            })
            .mkdir({
                let seen = seen.clone();
                move |path, mode, done| {
                    seen.borrow_mut()
                        .push(format!("mkdir {} {:o}", path.display(), mode));
                    done.complete(0);
                }
            })
            .create(|_, _, _, done| done.complete(0, 11))
            .rename({
                let seen = seen.clone();
                move |from, to, done| {
                    seen.borrow_mut()
                        .push(format!("rename {} {}", from.display(), to.display()));
                    done.complete(0);
                }
            })
            .unlink(|_, done| done.complete(-libc::EACCES));

        let mkdir = kernel::fuse_mkdir_in {
            mode: 0o755,
            umask: 0,
        };
        let create = kernel::fuse_create_in {
            mode: libc::S_IFREG | 0o644,
            ..Default::default()
        };
        let rename = kernel::fuse_rename_in { newdir: 1 };
        let conn = serve(
            "path-namespace",
            vec![
                encode_request(FUSE_MKDIR, 2, 1, &with_names(mkdir.as_bytes(), &["d"])),
                encode_request(FUSE_CREATE, 3, 2, &with_names(create.as_bytes(), &["f"])),
                encode_request(FUSE_RENAME, 4, 1, &with_names(rename.as_bytes(), &["d", "e"])),
                getattr(5, 3),
                encode_request(FUSE_UNLINK, 6, 2, &with_names(&[], &["f"])),
            ],
            handlers,
        )
        .await;

        let dir: kernel::fuse_entry_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(dir.nodeid, 2);

        let created = conn.reply_to(3).unwrap().payload;
        let entry: kernel::fuse_entry_out = decode(&created);
        let opened: kernel::fuse_open_out =
            decode(&created[std::mem::size_of::<kernel::fuse_entry_out>()..]);
        assert_eq!((entry.nodeid, opened.fh), (3, 11));

        assert_eq!(conn.reply_to(4).unwrap().error, 0);
        assert_eq!(conn.reply_to(5).unwrap().error, 0);
        assert_eq!(conn.reply_to(6).unwrap().error, -libc::EACCES);
        assert_eq!(
            *seen.borrow(),
            [
                "mkdir /d 755",
                "getattr /d",
                "getattr /d/f",
                "rename /d /e",
                "getattr /e/f",
            ]
        );
    }

    #[tokio::test]
    async fn statfs_and_xattrs() {
        let mut handlers = Handlers::default();
        handlers
            .statfs(|path, done| {
                assert_eq!(path, Path::new("/"));
                let st = StatFs {
                    blocks: Some(100),
                    namelen: Some(255),
                    ..StatFs::default()
                };
                done.complete(0, st);
            })
            .setxattr(|path, name, value, flags, done| {
                assert_eq!(path, Path::new("/"));
                assert_eq!(name, "user.k");
                assert_eq!(value, b"v");
                assert_eq!(flags, 1);
                done.complete(0);
            })
            .readlink(|_, done| done.complete(0, "target"));

        let setxattr = kernel::fuse_setxattr_in { size: 1, flags: 1 };
        let mut msg = with_names(setxattr.as_bytes(), &["user.k"]);
        msg.push(b'v');
        let conn = serve(
            "path-statfs",
            vec![
                encode_request(FUSE_STATFS, 2, 1, &[]),
                encode_request(FUSE_SETXATTR, 3, 1, &msg),
                encode_request(FUSE_READLINK, 4, 1, &[]),
            ],
            handlers,
        )
        .await;

        let st: kernel::fuse_statfs_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!((st.st.blocks, st.st.namelen, st.st.bsize), (100, 255, 0));
        assert_eq!(conn.reply_to(3).unwrap().error, 0);
        assert_eq!(conn.reply_to(4).unwrap().payload, b"target");
    }

    #[tokio::test]
    async fn setattr_accepts_times_before_the_epoch() {
        let seen: Rc<RefCell<Vec<Option<std::time::SystemTime>>>> = Rc::default();
        let mut handlers = Handlers::default();
        handlers
            .getattr(|_, done| done.complete(0, file_stat(1)))
            .utimens({
                let seen = seen.clone();
                move |_, _, mtime, done| {
                    seen.borrow_mut().push(mtime);
                    done.complete(0);
                }
            });

        let arg = kernel::fuse_setattr_in {
            valid: FATTR_MTIME,
            mtime: (-86400i64) as u64,
            ..Default::default()
        };
        let conn = serve(
            "path-setattr-epoch",
            vec![encode_request(FUSE_SETATTR, 2, 1, arg.as_bytes()), getattr(3, 1)],
            handlers,
        )
        .await;

        assert_eq!(conn.reply_to(2).unwrap().error, 0);
        assert_eq!(conn.reply_to(3).unwrap().error, 0);
        assert_eq!(
            *seen.borrow(),
            [Some(std::time::UNIX_EPOCH - Duration::from_secs(86400))]
        );
    }

    #[tokio::test]
    async fn removed_names_get_new_inodes() {
        let mut handlers = Handlers::default();
        handlers
            .getattr(|_, done| done.complete(0, file_stat(1)))
            .unlink(|_, done| done.complete(0))
            .rmdir(|_, done| done.complete(0))
            .mkdir(|_, _, done| done.complete(0));

        let mkdir = kernel::fuse_mkdir_in {
            mode: 0o755,
            umask: 0,
        };
        let conn = serve(
            "path-unlink",
            vec![
                lookup(2, 1, "x"),
                encode_request(FUSE_UNLINK, 3, 1, &with_names(&[], &["x"])),
                encode_request(FUSE_MKDIR, 4, 1, &with_names(mkdir.as_bytes(), &["x"])),
                encode_request(FUSE_RMDIR, 5, 1, &with_names(&[], &["x"])),
                lookup(6, 1, "x"),
                // The unlinked file is still reachable until it is forgotten.
                getattr(7, 2),
            ],
            handlers,
        )
        .await;

        let file: kernel::fuse_entry_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!(conn.reply_to(3).unwrap().error, 0);
        let dir: kernel::fuse_entry_out = decode(&conn.reply_to(4).unwrap().payload);
        assert_eq!(conn.reply_to(5).unwrap().error, 0);
        let again: kernel::fuse_entry_out = decode(&conn.reply_to(6).unwrap().payload);
        assert_eq!(file.nodeid, 2);
        assert_eq!(dir.nodeid, 3);
        assert_eq!(again.nodeid, 4);
        assert_eq!(conn.reply_to(7).unwrap().error, 0);
    }

    #[tokio::test]
    async fn getattr_reports_the_bridge_inode() {
        let mut handlers = Handlers::default();
        handlers.getattr(|_, done| {
            done.complete(
                0,
                Stat {
                    ino: Some(999),
                    ..file_stat(3)
                },
            )
        });

        let conn = serve(
            "path-getattr-ino",
            vec![lookup(2, 1, "f"), getattr(3, 2), getattr(4, 1)],
            handlers,
        )
        .await;

        let entry: kernel::fuse_entry_out = decode(&conn.reply_to(2).unwrap().payload);
        assert_eq!((entry.nodeid, entry.attr.ino), (2, 2));
        let attr: kernel::fuse_attr_out = decode(&conn.reply_to(3).unwrap().payload);
        assert_eq!(attr.attr.ino, 2);
        let root: kernel::fuse_attr_out = decode(&conn.reply_to(4).unwrap().payload);
        assert_eq!(root.attr.ino, 1);
    }

    #[tokio::test]
    async fn failed_handshake_still_runs_destroy() {
        let seen: Log = Rc::default();
        let mut handlers = Handlers::default();
        handlers
            .init({
                let seen = seen.clone();
                move |done| {
                    seen.borrow_mut().push("init".into());
                    done.complete(0);
                }
            })
            .destroy({
                let seen = seen.clone();
                move |done| {
                    seen.borrow_mut().push("destroy".into());
                    done.complete(0);
                }
            });

        let conn = FakeTransport::new(Vec::<Vec<u8>>::new());
        let options = Options::default();
        let closed = LocalSet::new()
            .run_until(async {
                let mount = bridge::launch_fake::<PathBridge>(
                    "path-no-init",
                    Arc::clone(&conn),
                    handlers,
                    Worker::new(options.ttl()),
                    &options,
                )
                .unwrap();
                mount.closed().await
            })
            .await;

        assert!(matches!(closed, Err(Error::Io(_))), "{:?}", closed);
        assert_eq!(*seen.borrow(), ["destroy"]);
        assert!(conn.replies().is_empty());
    }
}
