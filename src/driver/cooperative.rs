//! Single-threaded cooperative backend.
//!
//! Each thread owns a FIFO run queue. `spawn` appends to the queue of the
//! thread that created the driver; nothing runs until that thread waits on
//! (or polls) a cooperative promise, at which point queued work runs to
//! completion one item at a time. Work queued on one thread is never run by
//! another, so waiting on a cooperative promise from a foreign thread only
//! returns once its owner drives the queue.
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::task::Poll;
use std::thread::{self, ThreadId};

use super::{Drive, Work};
use crate::slot::Outcome;
use crate::Error;

thread_local! {
    static RUN_QUEUE: RefCell<VecDeque<Work>> = RefCell::new(VecDeque::new());
}

/// Runs the oldest queued unit of work of the current thread. Returns
/// `false` when the queue was empty.
pub fn run_next() -> bool {
    // The borrow ends before the work runs: work may queue more work.
    let next = RUN_QUEUE.with(|queue| queue.borrow_mut().pop_front());
    match next {
        Some(work) => {
            work();
            true
        }
        None => false,
    }
}

/// Drains the current thread's queue, including anything queued while
/// draining. Returns how many units of work ran.
pub fn run_until_idle() -> usize {
    let mut ran = 0;
    while run_next() {
        ran += 1;
    }
    ran
}

pub fn pending() -> usize {
    RUN_QUEUE.with(|queue| queue.borrow().len())
}

#[derive(Debug)]
pub struct CooperativeDriver {
    owner: ThreadId,
    notified: Mutex<bool>,
    signaled: Condvar,
}

impl CooperativeDriver {
    pub fn new() -> Result<Self, Error> {
        Ok(CooperativeDriver {
            owner: thread::current().id(),
            notified: Mutex::new(false),
            signaled: Condvar::new(),
        })
    }

    fn on_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn is_notified(&self) -> bool {
        *self.notified.lock()
    }
}

impl Drive for CooperativeDriver {
    fn spawn(&self, work: Work) -> Result<(), Error> {
        if !self.on_owner() {
            return Err(Error::PreconditionViolation(
                "cooperative work must be spawned on the thread that owns the driver",
            ));
        }
        RUN_QUEUE.with(|queue| queue.borrow_mut().push_back(work));
        Ok(())
    }

    fn wait(&self) -> Result<Option<Outcome>, Error> {
        while !self.is_notified() {
            if self.on_owner() && run_next() {
                continue;
            }
            // Nothing left to run here: the work is settling on another
            // thread (an escaped resolver) or belongs to another thread.
            let mut notified = self.notified.lock();
            while !*notified {
                self.signaled.wait(&mut notified);
            }
        }
        Ok(None)
    }

    fn notify(&self, _outcome: &Outcome) -> Result<(), Error> {
        let mut notified = self.notified.lock();
        if *notified {
            return Err(Error::PreconditionViolation(
                "cooperative driver notified twice",
            ));
        }
        *notified = true;
        self.signaled.notify_all();
        Ok(())
    }

    fn poll(&self) -> Result<Poll<Option<Outcome>>, Error> {
        if !self.is_notified() && self.on_owner() {
            run_next();
        }
        if self.is_notified() {
            Ok(Poll::Ready(None))
        } else {
            Ok(Poll::Pending)
        }
    }

    fn needs_polling(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Args;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn done() -> Outcome {
        Outcome::Fulfilled(Args::none())
    }

    #[test]
    fn spawn_defers_until_wait() {
        let driver = Arc::new(CooperativeDriver::new().unwrap());
        let runs = Arc::new(AtomicUsize::new(0));
        let (counter, notifier) = (runs.clone(), driver.clone());
        driver
            .spawn(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                notifier.notify(&done()).unwrap();
            }))
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(pending(), 1);
        driver.wait().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(pending(), 0);
    }

    #[test]
    fn queue_runs_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let drivers: Vec<_> = (0..3)
            .map(|_| Arc::new(CooperativeDriver::new().unwrap()))
            .collect();
        for (i, driver) in drivers.iter().enumerate() {
            let (order, notifier) = (order.clone(), driver.clone());
            driver
                .spawn(Box::new(move || {
                    order.lock().push(i);
                    notifier.notify(&done()).unwrap();
                }))
                .unwrap();
        }
        drivers[2].wait().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(run_until_idle(), 0);
    }

    #[test]
    fn notify_twice_is_rejected() {
        let driver = CooperativeDriver::new().unwrap();
        driver.notify(&done()).unwrap();
        assert!(matches!(
            driver.notify(&done()),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn poll_makes_progress() {
        let driver = Arc::new(CooperativeDriver::new().unwrap());
        let notifier = driver.clone();
        driver
            .spawn(Box::new(move || notifier.notify(&done()).unwrap()))
            .unwrap();
        assert_eq!(driver.poll().unwrap(), Poll::Ready(None));
    }

    #[test]
    fn foreign_thread_waits_for_the_owner() {
        let driver = Arc::new(CooperativeDriver::new().unwrap());
        let notifier = driver.clone();
        driver
            .spawn(Box::new(move || notifier.notify(&done()).unwrap()))
            .unwrap();
        let waiter = driver.clone();
        let task = thread::spawn(move || waiter.wait().unwrap());
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(run_until_idle(), 1);
        task.join().expect("The waiting thread has panicked");
    }
}
