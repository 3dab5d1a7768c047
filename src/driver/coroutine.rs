//! Runtime-managed backend.
//!
//! The work is scheduled on the tokio runtime that is active when the driver
//! is created. Completion is a single token pushed through a one-slot
//! channel.
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use tokio::runtime::Handle;

use super::{unavailable, Drive, Work};
use crate::config::Backend;
use crate::slot::Outcome;
use crate::Error;

#[derive(Debug)]
pub struct CoroutineDriver {
    runtime: Handle,
    sender: Sender<()>,
    receiver: Receiver<()>,
    notified: AtomicBool,
}

impl CoroutineDriver {
    /// Binds to the current tokio runtime. Fails outside of one.
    pub fn new() -> Result<Self, Error> {
        let runtime = Handle::try_current()
            .map_err(|e| unavailable(Backend::Coroutine, e.to_string()))?;
        let (sender, receiver) = bounded(1);
        Ok(CoroutineDriver {
            runtime,
            sender,
            receiver,
            notified: AtomicBool::new(false),
        })
    }
}

impl Drive for CoroutineDriver {
    fn spawn(&self, work: Work) -> Result<(), Error> {
        // Work is plain blocking code that may itself wait on other drivers,
        // so it goes to the blocking pool instead of a worker thread.
        drop(self.runtime.spawn_blocking(work));
        Ok(())
    }

    fn wait(&self) -> Result<Option<Outcome>, Error> {
        self.receiver.recv().map_err(|_| Error::Disconnected)?;
        Ok(None)
    }

    fn notify(&self, _outcome: &Outcome) -> Result<(), Error> {
        if self.notified.swap(true, Ordering::AcqRel) {
            return Err(Error::PreconditionViolation(
                "coroutine driver notified twice",
            ));
        }
        self.sender.try_send(()).map_err(|_| Error::Disconnected)
    }

    fn poll(&self) -> Result<Poll<Option<Outcome>>, Error> {
        if self.notified.load(Ordering::Acquire) {
            Ok(Poll::Ready(None))
        } else {
            Ok(Poll::Pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Args;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn unavailable_outside_a_runtime() {
        assert!(matches!(
            CoroutineDriver::new(),
            Err(Error::DriverUnavailable { backend: Backend::Coroutine, .. })
        ));
    }

    #[test]
    fn wait_blocks_until_notified() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let driver = Arc::new(CoroutineDriver::new().unwrap());
        let notifier = driver.clone();
        driver
            .spawn(Box::new(move || {
                std::thread::sleep(Duration::from_millis(20));
                notifier.notify(&Outcome::Fulfilled(Args::none())).unwrap();
            }))
            .unwrap();
        assert_eq!(driver.poll().unwrap(), Poll::Pending);
        assert!(driver.wait().unwrap().is_none());
        assert_eq!(driver.poll().unwrap(), Poll::Ready(None));
    }

    #[test]
    fn notify_twice_is_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let driver = CoroutineDriver::new().unwrap();
        let done = Outcome::Fulfilled(Args::none());
        driver.notify(&done).unwrap();
        assert!(matches!(
            driver.notify(&done),
            Err(Error::PreconditionViolation(_))
        ));
    }
}
