//! The machinery shared by both operation vocabularies.
//!
//! A request travels like this:
//!
//! 1. the worker thread reads it from the kernel and builds a command,
//! 2. the command is put into the [`Shared`] slot and the loop is notified,
//! 3. the dispatcher on the event loop takes it and calls the handler,
//! 4. the handler's completion releases the [`Ticket`] minted for the request,
//! 5. the worker wakes up in [`Rendezvous::wait`] and moves on.
//!
//! Only one command is ever in flight.

mod buffer;
mod options;
mod rendezvous;

pub use self::{buffer::SharedBuffer, options::Options};
pub(crate) use self::{
    options::Ttl,
    rendezvous::{Registration, Rendezvous, Ticket},
};

use crate::{
    conn::{Connection, Transport},
    error::Error,
    mount::{self, MountOptions, Mounted},
    op::Operation,
    session::{KernelConfig, Replier, Session},
};
use fusebridge_kernel::fuse_in_header;
use std::{
    cell::Cell,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};
use tokio::sync::{oneshot, Notify};

/// One vocabulary of operations carried over the bridge.
pub(crate) trait Vocabulary: Sized + 'static {
    /// The record handed from the worker to the dispatcher.
    type Command: Send + 'static;

    /// What a completion sends back to the worker. The default value is the
    /// answer of a request nobody handled.
    type Answer: Default + Send + 'static;

    /// Bookkeeping owned by the worker thread.
    type State: Send + 'static;

    /// The application's handlers. They live on the event loop only.
    type Handlers: 'static;

    fn init(ticket: Ticket<Self::Answer>) -> Self::Command;

    fn destroy(ticket: Ticket<Self::Answer>) -> Self::Command;

    fn is_destroy(command: &Self::Command) -> bool;

    /// Answer one kernel request. Runs on the worker thread.
    fn handle(
        state: &mut Self::State,
        cx: &WorkerCx<'_, Self>,
        header: &fuse_in_header,
        op: Operation<'_>,
    );

    /// Pass one command to its handler. Runs on the event loop.
    ///
    /// `teardown` is only present for the destroy command.
    fn dispatch(handlers: &Self::Handlers, command: Self::Command, teardown: Option<Teardown>);
}

// ==== command slot ====

struct Slot<C> {
    command: Option<C>,
    closed: bool,
}

/// The single command slot plus the wake-up signal of the event loop.
pub(crate) struct Shared<C> {
    slot: Mutex<Slot<C>>,
    notify: Notify,
}

impl<C> Shared<C> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                command: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Store a command and wake the dispatcher.
    ///
    /// Once the dispatcher is gone the command is dropped right away, which
    /// answers it with the default.
    fn put(&self, command: C) {
        let rejected = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.closed {
                Some(command)
            } else {
                debug_assert!(slot.command.is_none(), "the command slot is occupied");
                slot.command = Some(command);
                None
            }
        };
        match rejected {
            Some(command) => drop(command),
            None => self.notify.notify_one(),
        }
    }

    fn take(&self) -> Option<C> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.command.take()
    }

    fn close(&self) -> Option<C> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.closed = true;
        slot.command.take()
    }

    fn is_closed(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.closed
    }
}

/// The worker's end: put a command, then block until it is answered.
pub(crate) struct Caller<V: Vocabulary> {
    shared: Arc<Shared<V::Command>>,
    rendezvous: Rendezvous<V::Answer>,
}

impl<V: Vocabulary> Caller<V> {
    pub(crate) fn call(&self, make: impl FnOnce(Ticket<V::Answer>) -> V::Command) -> V::Answer {
        self.shared.put(make(self.rendezvous.ticket()));
        self.rendezvous.wait()
    }
}

/// What a vocabulary sees of the worker while answering a request.
pub(crate) struct WorkerCx<'a, V: Vocabulary> {
    session: &'a Session,
    caller: &'a Caller<V>,
}

impl<V: Vocabulary> WorkerCx<'_, V> {
    /// Run one dispatch cycle on the event loop and wait for its answer.
    pub(crate) fn call(&self, make: impl FnOnce(Ticket<V::Answer>) -> V::Command) -> V::Answer {
        self.caller.call(make)
    }

    pub(crate) fn replier(&self, unique: u64) -> Replier {
        self.session.replier(unique)
    }
}

// ==== completion plumbing ====

/// The worker's exit value: the rendezvous name and how the session ended.
type WorkerExit = (Registration, io::Result<()>);

/// The last steps of a session, run by the destroy completion.
pub(crate) struct Teardown {
    worker: JoinHandle<WorkerExit>,
    closed: oneshot::Sender<Result<(), Error>>,
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown").finish()
    }
}

impl Teardown {
    /// Join the worker, drop the rendezvous name and resolve `Mount::closed`.
    ///
    /// The destroy ticket must have been released already, or the join
    /// never returns.
    fn finish(self) {
        let result = match self.worker.join() {
            Ok((registration, result)) => {
                registration.destroy();
                result.map_err(Error::Io)
            }
            Err(_) => Err(Error::WorkerPanicked),
        };
        let _ = self.closed.send(result);
    }
}

/// The part common to every completion: release the ticket exactly once,
/// then run the teardown if this completes the destroy command.
pub(crate) struct Continuation<T: Default + Send> {
    ticket: Option<Ticket<T>>,
    teardown: Option<Teardown>,
}

impl<T: Default + Send> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("ticket", &self.ticket)
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

impl<T: Default + Send> Continuation<T> {
    pub(crate) fn new(ticket: Ticket<T>, teardown: Option<Teardown>) -> Self {
        Self {
            ticket: Some(ticket),
            teardown,
        }
    }

    pub(crate) fn finish(mut self, answer: T) {
        if let Some(ticket) = self.ticket.take() {
            ticket.release(answer);
        }
    }
}

impl<T: Default + Send> Drop for Continuation<T> {
    fn drop(&mut self) {
        // An unreleased ticket answers with the default when dropped.
        drop(self.ticket.take());
        if let Some(teardown) = self.teardown.take() {
            teardown.finish();
        }
    }
}

// ==== loop side ====

struct CloseOnDrop<C>(Arc<Shared<C>>);

impl<C> Drop for CloseOnDrop<C> {
    fn drop(&mut self) {
        drop(self.0.close());
    }
}

async fn dispatcher<V: Vocabulary>(
    shared: Arc<Shared<V::Command>>,
    handlers: V::Handlers,
    teardown: Rc<Cell<Option<Teardown>>>,
) {
    let shared = CloseOnDrop(shared);
    loop {
        shared.0.notify.notified().await;

        let Some(command) = shared.0.take() else {
            if shared.0.is_closed() {
                break;
            }
            continue;
        };

        if V::is_destroy(&command) {
            V::dispatch(&handlers, command, teardown.take());
            break;
        }
        V::dispatch(&handlers, command, None);
    }
    tracing::debug!("dispatcher finished");
}

// ==== worker side ====

/// Where the worker gets its transport from.
pub(crate) enum Connector {
    Mount {
        mountpoint: PathBuf,
        opts: MountOptions,
    },
    #[cfg(test)]
    Given(Arc<dyn Transport>),
}

impl Connector {
    fn connect(self) -> io::Result<(Arc<dyn Transport>, Option<Mounted>)> {
        match self {
            Self::Mount { mountpoint, opts } => {
                let (fd, mounted) = mount::mount(&mountpoint, &opts)?;
                tracing::debug!(mountpoint = %mountpoint.display(), "mounted");
                Ok((Arc::new(Connection::from(fd)), Some(mounted)))
            }
            #[cfg(test)]
            Self::Given(conn) => Ok((conn, None)),
        }
    }
}

fn run_worker<V: Vocabulary>(
    connector: Connector,
    config: KernelConfig,
    debug: bool,
    mut state: V::State,
    caller: Caller<V>,
) -> WorkerExit {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        serve(connector, &config, debug, &mut state, &caller)
    }))
    .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "the request loop panicked")));

    if let Err(err) = &result {
        tracing::error!("session ended with an error: {}", err);
    }

    // Always runs, so the event loop side can release its resources.
    let _ = caller.call(V::destroy);

    (caller.rendezvous.into_registration(), result)
}

fn serve<V: Vocabulary>(
    connector: Connector,
    config: &KernelConfig,
    debug: bool,
    state: &mut V::State,
    caller: &Caller<V>,
) -> io::Result<()> {
    let (conn, mounted) = connector.connect()?;
    let session = Session::init(conn, config, debug)?;
    let _ = caller.call(V::init);

    let cx = WorkerCx {
        session: &session,
        caller,
    };

    while let Some(req) = session.next_request()? {
        if caller.shared.is_closed() {
            tracing::warn!("the event loop is gone, leaving the request loop");
            break;
        }

        let header = *req.header();
        let span = tracing::debug_span!(
            "handle_request",
            unique = header.unique,
            opcode = header.opcode
        );
        let _enter = span.enter();

        let op = match req.operation() {
            Ok(op) => op,
            Err(err) => {
                tracing::warn!("failed to decode the request: {}", err);
                session.replier(header.unique).error(libc::EIO);
                continue;
            }
        };

        match op {
            Operation::Destroy => {
                session.replier(header.unique).error(0);
                break;
            }
            Operation::Init { .. } => {
                tracing::warn!("ignoring a second INIT request");
                session.replier(header.unique).error(libc::EIO);
            }
            // Interrupts are never answered.
            Operation::Interrupt { arg } => {
                tracing::debug!(interrupted = arg.unique, "interrupt is not supported");
            }
            Operation::Unknown => {
                tracing::debug!("unsupported opcode");
                session.replier(header.unique).error(libc::ENOSYS);
            }
            op => V::handle(state, &cx, &header, op),
        }
    }

    drop(session);
    if let Some(mounted) = mounted {
        mounted.unmount()?;
    }

    Ok(())
}

// ==== entry point ====

/// The handle of a running mount.
#[derive(Debug)]
pub struct Mount {
    mountpoint: PathBuf,
    mount_opts: MountOptions,
    closed: oneshot::Receiver<Result<(), Error>>,
}

impl Mount {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Detach the filesystem. The session winds down afterwards and
    /// [`closed`](Self::closed) resolves once `destroy` has completed.
    pub fn unmount(&self) -> Result<(), Error> {
        mount::unmount(&self.mountpoint, &self.mount_opts)?;
        Ok(())
    }

    /// Wait until the session has ended and its resources are released.
    pub async fn closed(self) -> Result<(), Error> {
        self.closed.await.unwrap_or(Err(Error::Aborted))
    }
}

pub(crate) fn rendezvous_name(mountpoint: &Path) -> String {
    format!("fusebridge-{}:{}", std::process::id(), mountpoint.display())
}

pub(crate) fn validate_mountpoint(path: &Path) -> Result<PathBuf, Error> {
    let invalid = |source| Error::InvalidMountpoint {
        path: path.to_owned(),
        source,
    };
    let canonical = path.canonicalize().map_err(invalid)?;
    if !canonical.is_dir() {
        return Err(invalid(io::Error::from_raw_os_error(libc::ENOTDIR)));
    }
    Ok(canonical)
}

/// Validate the arguments, then spawn the worker and the dispatcher.
pub(crate) fn start<V: Vocabulary>(
    mountpoint: &Path,
    handlers: V::Handlers,
    state: V::State,
    options: &Options,
) -> Result<Mount, Error> {
    let mountpoint = validate_mountpoint(mountpoint)?;
    let connector = Connector::Mount {
        mountpoint: mountpoint.clone(),
        opts: options.mount.clone(),
    };
    launch::<V>(
        rendezvous_name(&mountpoint),
        connector,
        mountpoint,
        handlers,
        state,
        options,
    )
}

pub(crate) fn launch<V: Vocabulary>(
    name: String,
    connector: Connector,
    mountpoint: PathBuf,
    handlers: V::Handlers,
    state: V::State,
    options: &Options,
) -> Result<Mount, Error> {
    let rendezvous = Rendezvous::create(name.clone()) //
        .map_err(|source| Error::Rendezvous { name, source })?;
    let shared = Arc::new(Shared::new());
    let teardown = Rc::new(Cell::new(None));

    // Spawned first: this panics outside of a `LocalSet`, before any thread exists.
    tokio::task::spawn_local(dispatcher::<V>(
        Arc::clone(&shared),
        handlers,
        Rc::clone(&teardown),
    ));

    let caller = Caller {
        shared: Arc::clone(&shared),
        rendezvous,
    };
    let config = options.config.clone();
    let debug = options.debug;
    let worker = thread::Builder::new()
        .name("fusebridge-worker".into())
        .spawn(move || run_worker::<V>(connector, config, debug, state, caller));
    let worker = match worker {
        Ok(worker) => worker,
        Err(err) => {
            drop(shared.close());
            shared.notify.notify_one();
            return Err(Error::Io(err));
        }
    };

    let (tx, rx) = oneshot::channel();
    teardown.set(Some(Teardown { worker, closed: tx }));

    Ok(Mount {
        mountpoint,
        mount_opts: options.mount.clone(),
        closed: rx,
    })
}

#[cfg(test)]
pub(crate) fn launch_fake<V: Vocabulary>(
    name: &str,
    conn: Arc<crate::testing::FakeTransport>,
    handlers: V::Handlers,
    state: V::State,
    options: &Options,
) -> Result<Mount, Error> {
    launch::<V>(
        name.to_owned(),
        Connector::Given(conn),
        PathBuf::from(name),
        handlers,
        state,
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_holds_one_command() {
        let shared = Shared::<u32>::new();
        assert_eq!(shared.take(), None);
        shared.put(1);
        assert_eq!(shared.take(), Some(1));
        assert_eq!(shared.take(), None);
    }

    #[test]
    fn closed_slot_drops_commands() {
        let rendezvous = Rendezvous::<i32>::create("test-closed-slot").unwrap();
        let shared = Shared::new();
        shared.put(rendezvous.ticket());
        let pending = shared.close();
        assert!(pending.is_some());
        drop(pending);
        assert_eq!(rendezvous.wait(), 0);

        // Anything put afterwards is answered with the default immediately.
        shared.put(rendezvous.ticket());
        assert_eq!(rendezvous.wait(), 0);
        assert!(shared.is_closed());
    }

    #[test]
    fn continuation_releases_once() {
        let rendezvous = Rendezvous::<i32>::create("test-continuation").unwrap();
        Continuation::new(rendezvous.ticket(), None).finish(5);
        assert_eq!(rendezvous.wait(), 5);

        drop(Continuation::new(rendezvous.ticket(), None));
        assert_eq!(rendezvous.wait(), 0);
    }

    #[test]
    fn mountpoint_validation() {
        let dir = std::env::temp_dir();
        assert!(validate_mountpoint(&dir).is_ok());

        let missing = dir.join("fusebridge-no-such-dir");
        assert!(matches!(
            validate_mountpoint(&missing),
            Err(Error::InvalidMountpoint { .. })
        ));

        let file = dir.join(format!("fusebridge-file-{}", std::process::id()));
        std::fs::write(&file, b"").unwrap();
        let err = validate_mountpoint(&file).unwrap_err();
        std::fs::remove_file(&file).unwrap();
        match err {
            Error::InvalidMountpoint { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOTDIR))
            }
            err => panic!("unexpected error: {}", err),
        }
    }

    #[test]
    fn rendezvous_name_contains_pid_and_root() {
        let name = rendezvous_name(Path::new("/mnt/x"));
        assert_eq!(name, format!("fusebridge-{}:/mnt/x", std::process::id()));
    }
}
