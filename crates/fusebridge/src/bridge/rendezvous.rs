//! The single-token handoff between the worker thread and the event loop.

use std::{
    collections::BTreeSet,
    fmt, io, mem,
    sync::{
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Mutex,
    },
};

// Names of the rendezvous that are alive in this process.
static REGISTRY: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// The claim on a rendezvous name. The name is released when this is dropped.
pub(crate) struct Registration {
    name: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registration").field(&self.name).finish()
    }
}

impl Registration {
    fn claim(name: String) -> io::Result<Self> {
        let mut registry = REGISTRY.lock().unwrap_or_else(|err| err.into_inner());
        if !registry.insert(name.clone()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rendezvous `{}` is in use", name),
            ));
        }
        Ok(Self { name })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Remove the name explicitly at the end of a session.
    pub(crate) fn destroy(mut self) {
        tracing::debug!(name = %self.name, "destroy rendezvous");
        self.release();
    }

    fn release(&mut self) {
        let name = mem::take(&mut self.name);
        if name.is_empty() {
            return;
        }
        let mut registry = REGISTRY.lock().unwrap_or_else(|err| err.into_inner());
        registry.remove(&name);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// A named wait primitive holding at most one answer.
///
/// The worker mints a [`Ticket`] per request and blocks in [`wait`] until the
/// event loop releases that ticket.
///
/// [`wait`]: Rendezvous::wait
pub(crate) struct Rendezvous<T> {
    registration: Registration,
    tx: SyncSender<T>,
    rx: Receiver<T>,
}

impl<T> fmt::Debug for Rendezvous<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rendezvous")
            .field("name", &self.registration.name)
            .finish()
    }
}

impl<T> Rendezvous<T>
where
    T: Default + Send,
{
    /// Create a rendezvous, failing if `name` is already in use in this process.
    pub(crate) fn create(name: impl Into<String>) -> io::Result<Self> {
        let registration = Registration::claim(name.into())?;
        let (tx, rx) = mpsc::sync_channel(1);
        Ok(Self {
            registration,
            tx,
            rx,
        })
    }

    pub(crate) fn name(&self) -> &str {
        self.registration.name()
    }

    pub(crate) fn ticket(&self) -> Ticket<T> {
        Ticket {
            tx: Some(self.tx.clone()),
        }
    }

    /// Block until the outstanding ticket is released.
    pub(crate) fn wait(&self) -> T {
        // `self.tx` keeps the channel open, so `recv` only returns with a value.
        self.rx.recv().unwrap_or_default()
    }

    pub(crate) fn into_registration(self) -> Registration {
        self.registration
    }
}

/// The single-use right to wake the worker.
///
/// A ticket dropped without being released wakes the worker with
/// `T::default()`.
pub(crate) struct Ticket<T: Default + Send> {
    tx: Option<SyncSender<T>>,
}

impl<T: Default + Send> fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("released", &self.tx.is_none())
            .finish()
    }
}

impl<T: Default + Send> Ticket<T> {
    pub(crate) fn release(mut self, value: T) {
        self.send(value);
    }

    fn send(&mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            match tx.try_send(value) {
                Ok(()) => (),
                // The worker is gone, nobody is left to wake up.
                Err(TrySendError::Disconnected(_)) => (),
                Err(TrySendError::Full(_)) => {
                    tracing::error!("rendezvous already holds an answer");
                }
            }
        }
    }
}

impl<T: Default + Send> Drop for Ticket<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!("request was dropped without an answer");
            self.send(T::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn release_wakes_the_waiter() {
        let rendezvous = Rendezvous::<i32>::create("test-release").unwrap();
        let ticket = rendezvous.ticket();
        let handle = thread::spawn(move || ticket.release(42));
        assert_eq!(rendezvous.wait(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn dropped_ticket_sends_the_default() {
        let rendezvous = Rendezvous::<i32>::create("test-drop").unwrap();
        drop(rendezvous.ticket());
        assert_eq!(rendezvous.wait(), 0);

        // The rendezvous is reusable for the next cycle.
        rendezvous.ticket().release(7);
        assert_eq!(rendezvous.wait(), 7);
    }

    #[test]
    fn names_are_exclusive_until_destroyed() {
        let first = Rendezvous::<()>::create("test-exclusive").unwrap();
        assert_eq!(first.name(), "test-exclusive");

        let err = Rendezvous::<()>::create("test-exclusive").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        first.into_registration().destroy();
        let second = Rendezvous::<()>::create("test-exclusive").unwrap();
        drop(second);
    }

    #[test]
    fn destroy_releases_the_name() {
        let registration = Registration::claim("test-destroy".into()).unwrap();
        assert!(REGISTRY.lock().unwrap().contains("test-destroy"));

        registration.destroy();
        assert!(!REGISTRY.lock().unwrap().contains("test-destroy"));

        let again = Registration::claim("test-destroy".into()).unwrap();
        assert_eq!(again.name(), "test-destroy");
    }
}
