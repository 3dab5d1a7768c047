//! Concurrency backends.
//!
//! Every backend implements the same three-step contract: [`Drive::spawn`]
//! starts a unit of work and returns immediately, the work calls
//! [`Drive::notify`] once it settled its promise, and [`Drive::wait`] blocks
//! the caller until that notification was observed. [`Drive::poll`] is the
//! non-blocking form of `wait`.
//!
//! | Backend | `spawn` | `wait` |
//! | --- | --- | --- |
//! | [`SyncDriver`] | runs the work inline | returns at once |
//! | [`CooperativeDriver`] | queues the work on the current thread | runs queued work until signaled |
//! | [`CoroutineDriver`] | hands the work to the tokio runtime | blocks on a one-slot channel |
//! | [`ForkDriver`] | runs the work in a forked child | reaps the child and decodes its exit code |
use std::task::Poll;

use crate::config::Backend;
use crate::slot::Outcome;
use crate::Error;

#[cfg(feature = "cooperative")]
pub mod cooperative;
#[cfg(feature = "coroutine")]
pub mod coroutine;
#[cfg(all(unix, feature = "fork"))]
pub mod fork;
pub mod sync;

#[cfg(feature = "cooperative")]
pub use self::cooperative::CooperativeDriver;
#[cfg(feature = "coroutine")]
pub use self::coroutine::CoroutineDriver;
#[cfg(all(unix, feature = "fork"))]
pub use self::fork::ForkDriver;
pub use self::sync::SyncDriver;

/// A unit of work as a driver sees it.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

pub trait Drive: Send + Sync {
    /// Starts `work` and returns without waiting for it. Called once.
    fn spawn(&self, work: Work) -> Result<(), Error>;

    /// Blocks until the work notified. Returns the outcome when it had to be
    /// carried over from another address space; `None` means it is already
    /// visible in shared memory.
    fn wait(&self) -> Result<Option<Outcome>, Error>;

    /// Signals that the work settled with `outcome`. Called once, from the
    /// context the work runs in.
    fn notify(&self, outcome: &Outcome) -> Result<(), Error>;

    /// Non-blocking `wait`.
    fn poll(&self) -> Result<Poll<Option<Outcome>>, Error>;

    /// Completion is only observable by calling `poll` again, there is no
    /// in-memory wakeup.
    fn needs_polling(&self) -> bool {
        false
    }

    /// The work runs in another address space: whatever it leaves in memory
    /// after `notify` is lost.
    fn crosses_address_space(&self) -> bool {
        false
    }
}

/// The closed set of backends, one instance per promise.
#[derive(Debug)]
pub enum Driver {
    Sync(SyncDriver),
    #[cfg(feature = "cooperative")]
    Cooperative(CooperativeDriver),
    #[cfg(feature = "coroutine")]
    Coroutine(CoroutineDriver),
    #[cfg(all(unix, feature = "fork"))]
    Fork(ForkDriver),
}

impl Driver {
    /// Instantiates `backend`, failing with [`Error::DriverUnavailable`] when
    /// the capability it needs is missing.
    pub fn new(backend: Backend) -> Result<Self, Error> {
        match backend.resolve() {
            Backend::Sync | Backend::Auto => Ok(Driver::Sync(SyncDriver)),
            Backend::Cooperative => cooperative(),
            Backend::Coroutine => coroutine(),
            Backend::Fork => fork(),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Driver::Sync(_) => Backend::Sync,
            #[cfg(feature = "cooperative")]
            Driver::Cooperative(_) => Backend::Cooperative,
            #[cfg(feature = "coroutine")]
            Driver::Coroutine(_) => Backend::Coroutine,
            #[cfg(all(unix, feature = "fork"))]
            Driver::Fork(_) => Backend::Fork,
        }
    }

    fn inner(&self) -> &dyn Drive {
        match self {
            Driver::Sync(driver) => driver,
            #[cfg(feature = "cooperative")]
            Driver::Cooperative(driver) => driver,
            #[cfg(feature = "coroutine")]
            Driver::Coroutine(driver) => driver,
            #[cfg(all(unix, feature = "fork"))]
            Driver::Fork(driver) => driver,
        }
    }
}

impl Drive for Driver {
    fn spawn(&self, work: Work) -> Result<(), Error> {
        tracing::debug!(backend = %self.backend(), "spawning unit of work");
        self.inner().spawn(work)
    }

    fn wait(&self) -> Result<Option<Outcome>, Error> {
        self.inner().wait()
    }

    fn notify(&self, outcome: &Outcome) -> Result<(), Error> {
        self.inner().notify(outcome)
    }

    fn poll(&self) -> Result<Poll<Option<Outcome>>, Error> {
        self.inner().poll()
    }

    fn needs_polling(&self) -> bool {
        self.inner().needs_polling()
    }

    fn crosses_address_space(&self) -> bool {
        self.inner().crosses_address_space()
    }
}

#[cfg(feature = "cooperative")]
fn cooperative() -> Result<Driver, Error> {
    Ok(Driver::Cooperative(CooperativeDriver::new()?))
}

#[cfg(not(feature = "cooperative"))]
fn cooperative() -> Result<Driver, Error> {
    Err(unavailable(Backend::Cooperative, "built without the `cooperative` feature"))
}

#[cfg(feature = "coroutine")]
fn coroutine() -> Result<Driver, Error> {
    Ok(Driver::Coroutine(CoroutineDriver::new()?))
}

#[cfg(not(feature = "coroutine"))]
fn coroutine() -> Result<Driver, Error> {
    Err(unavailable(Backend::Coroutine, "built without the `coroutine` feature"))
}

#[cfg(all(unix, feature = "fork"))]
fn fork() -> Result<Driver, Error> {
    Ok(Driver::Fork(ForkDriver::new()?))
}

#[cfg(not(all(unix, feature = "fork")))]
fn fork() -> Result<Driver, Error> {
    Err(unavailable(Backend::Fork, "process forking needs a unix target and the `fork` feature"))
}

/// Runs one unit of cooperative work queued on the current thread, if any.
/// Used wherever a thread is about to block on something that queued work
/// may be responsible for.
pub(crate) fn run_local() -> bool {
    #[cfg(feature = "cooperative")]
    {
        cooperative::run_next()
    }
    #[cfg(not(feature = "cooperative"))]
    {
        false
    }
}

#[allow(dead_code)]
pub(crate) fn unavailable(backend: Backend, reason: impl Into<String>) -> Error {
    Error::DriverUnavailable {
        backend,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_is_always_available() {
        assert_eq!(Driver::new(Backend::Sync).unwrap().backend(), Backend::Sync);
    }

    #[test]
    fn auto_resolves_outside_a_runtime() {
        assert_eq!(Driver::new(Backend::Auto).unwrap().backend(), Backend::Sync);
    }

    #[cfg(feature = "coroutine")]
    #[test]
    fn coroutine_needs_a_runtime() {
        match Driver::new(Backend::Coroutine) {
            Err(Error::DriverUnavailable { backend, .. }) => assert_eq!(backend, Backend::Coroutine),
            other => panic!("expected DriverUnavailable, got {:?}", other),
        }
    }

    #[cfg(not(feature = "cooperative"))]
    #[test]
    fn cooperative_compiled_out() {
        assert!(matches!(
            Driver::new(Backend::Cooperative),
            Err(Error::DriverUnavailable { backend: Backend::Cooperative, .. })
        ));
    }

    #[cfg(not(all(unix, feature = "fork")))]
    #[test]
    fn fork_compiled_out() {
        assert!(matches!(
            Driver::new(Backend::Fork),
            Err(Error::DriverUnavailable { backend: Backend::Fork, .. })
        ));
    }
}
