//! State shared between a promise, its unit of work and its observers.
//!
//! The [`Resolver`] is the producer half: it is handed to the unit of work
//! and consumed by the first settle, so each outcome slot has exactly one
//! writer. Observers (chaining, combinators, [`crate::Settled`]) read the
//! slots only once the driver signaled completion, or through the status
//! flip the resolver publishes.
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::Duration;

use crate::slot::{Args, Outcome, ResultSlot};
use crate::{Status, Value};

pub(crate) struct Core {
    state: Mutex<State>,
    changed: Condvar,
}

struct State {
    status: Status,
    fulfilled: ResultSlot,
    rejected: ResultSlot,
    /// A resolver handle for this core has not been consumed or dropped.
    resolver_live: bool,
    /// What the next link of a chain reads. Set once the unit of work is
    /// done, which may be later than the status flip.
    continuation: Option<Outcome>,
    /// Outcome the finished work derived while its resolver was still out.
    /// Applied if that resolver is released without settling.
    deferred: Option<Outcome>,
    /// Somebody read the outcome through a chain, a combinator or a getter.
    observed: bool,
    signals: Vec<Weak<Signal>>,
    wakers: Vec<Waker>,
}

impl State {
    fn outcome(&self) -> Option<Outcome> {
        match self.status {
            Status::Pending => None,
            Status::Fulfilled => Some(Outcome::Fulfilled(
                self.fulfilled.get().cloned().unwrap_or_default(),
            )),
            Status::Rejected => Some(Outcome::Rejected(
                self.rejected.get().cloned().unwrap_or_default(),
            )),
        }
    }

    /// Flips the status and fills the matching slot. A settled state is
    /// never overwritten.
    fn settle(&mut self, outcome: Outcome) -> bool {
        if self.status != Status::Pending {
            return false;
        }
        let (status, slot) = match outcome {
            Outcome::Fulfilled(args) => (Status::Fulfilled, self.fulfilled.fill(args)),
            Outcome::Rejected(args) => (Status::Rejected, self.rejected.fill(args)),
        };
        if slot {
            self.status = status;
        }
        slot
    }

    /// Turns the settle into the continuation. Wakes futures too.
    fn continue_with(&mut self, derived: Outcome) -> (Outcome, Observers) {
        self.settle(derived.clone());
        let outcome = self.outcome().unwrap_or(derived);
        self.continuation = Some(outcome.clone());
        self.deferred = None;
        (outcome, self.take_observers(true))
    }

    fn take_observers(&mut self, wake_futures: bool) -> Observers {
        self.signals.retain(|signal| signal.strong_count() > 0);
        Observers {
            signals: self.signals.iter().filter_map(Weak::upgrade).collect(),
            wakers: if wake_futures {
                std::mem::take(&mut self.wakers)
            } else {
                Vec::new()
            },
        }
    }
}

/// Observers collected under the lock and woken after it is released.
struct Observers {
    signals: Vec<Arc<Signal>>,
    wakers: Vec<Waker>,
}

impl Observers {
    fn wake(self) {
        for signal in self.signals {
            signal.notify();
        }
        for waker in self.wakers {
            waker.wake();
        }
    }
}

impl Core {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Core {
            state: Mutex::new(State {
                status: Status::Pending,
                fulfilled: ResultSlot::default(),
                rejected: ResultSlot::default(),
                resolver_live: false,
                continuation: None,
                deferred: None,
                observed: false,
                signals: Vec::new(),
                wakers: Vec::new(),
            }),
            changed: Condvar::new(),
        })
    }

    /// Hands out the settle handle for this core.
    pub(crate) fn resolver(self: &Arc<Self>) -> Resolver {
        self.state.lock().resolver_live = true;
        Resolver { core: self.clone() }
    }

    pub(crate) fn status(&self) -> Status {
        self.state.lock().status
    }

    /// The promise's own settle, read from its slots.
    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome()
    }

    pub(crate) fn continuation(&self) -> Option<Outcome> {
        self.state.lock().continuation.clone()
    }

    pub(crate) fn fulfilled(&self) -> ResultSlot {
        self.state.lock().fulfilled.clone()
    }

    pub(crate) fn rejected(&self) -> ResultSlot {
        self.state.lock().rejected.clone()
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if !state.settle(outcome.clone()) {
            return false;
        }
        // The work already finished and was waiting on this resolver.
        let observers = if state.deferred.is_some() {
            state.continue_with(outcome).1
        } else {
            state.take_observers(false)
        };
        drop(state);
        self.changed.notify_all();
        observers.wake();
        true
    }

    fn release_resolver(&self) {
        let mut state = self.state.lock();
        state.resolver_live = false;
        let observers = match state.deferred.take() {
            Some(derived) if state.continuation.is_none() => Some(state.continue_with(derived).1),
            _ => None,
        };
        drop(state);
        self.changed.notify_all();
        if let Some(observers) = observers {
            observers.wake();
        }
    }

    /// Records the result of the unit of work. An explicit settle that
    /// already happened takes precedence over `derived`; the effective
    /// outcome becomes the continuation and is returned.
    pub(crate) fn complete(&self, derived: Outcome) -> Outcome {
        let mut state = self.state.lock();
        let (outcome, observers) = state.continue_with(derived);
        drop(state);
        self.changed.notify_all();
        observers.wake();
        outcome
    }

    /// Like [`Core::complete`], except while the resolver is still out and
    /// unsettled: then `derived` is kept aside and `None` returned. The
    /// resolver's settle, or its release, completes the core later.
    pub(crate) fn finish(&self, derived: Outcome) -> Option<Outcome> {
        let mut state = self.state.lock();
        if state.resolver_live && state.status == Status::Pending {
            state.deferred = Some(derived);
            return None;
        }
        let (outcome, observers) = state.continue_with(derived);
        drop(state);
        self.changed.notify_all();
        observers.wake();
        Some(outcome)
    }

    /// Blocks until the continuation is set or can no longer be set. `idle`
    /// runs with the lock released and reports whether it made progress
    /// elsewhere, such as running queued cooperative work.
    pub(crate) fn wait_continuation(&self, mut idle: impl FnMut() -> bool) -> Option<Outcome> {
        let mut state = self.state.lock();
        loop {
            if state.continuation.is_some() || !state.resolver_live {
                break;
            }
            if MutexGuard::unlocked(&mut state, &mut idle) {
                continue;
            }
            if state.continuation.is_some() || !state.resolver_live {
                break;
            }
            self.changed.wait(&mut state);
        }
        state.continuation.clone()
    }

    pub(crate) fn subscribe(&self, signal: &Arc<Signal>) {
        self.state.lock().signals.push(Arc::downgrade(signal));
    }

    /// Registers a waker for the continuation. Returns `false` instead when
    /// the continuation is already there.
    pub(crate) fn register_waker(&self, waker: &Waker) -> bool {
        let mut state = self.state.lock();
        if state.continuation.is_some() {
            return false;
        }
        if !state.wakers.iter().any(|w| w.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }
        true
    }

    pub(crate) fn mark_observed(&self) {
        self.state.lock().observed = true;
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Core")
            .field("status", &state.status)
            .field("fulfilled", &state.fulfilled)
            .field("rejected", &state.rejected)
            .field("continued", &state.continuation.is_some())
            .finish()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.status == Status::Rejected && !state.observed {
            let reason = state.rejected.get().cloned().unwrap_or_default();
            tracing::warn!(%reason, "unhandled promise rejection");
        }
    }
}

/// Settles a promise from inside (or outside) its unit of work.
///
/// Every method consumes the resolver, so a promise is settled at most once
/// through it. Dropping it unsettled hands the decision back to the return
/// value of the unit of work.
///
/// # Examples
///
/// ```
/// use promise_driver::{json, Backend, Promise, Status};
///
/// let promise = Promise::with_backend(Backend::Sync, |resolver| {
///     resolver.reject_with(vec![json!(404), json!("not found")]);
/// })
/// .unwrap();
/// assert_eq!(promise.status().unwrap(), Status::Rejected);
/// assert_eq!(promise.outcome().unwrap().args().len(), 2);
/// ```
pub struct Resolver {
    core: Arc<Core>,
}

impl Resolver {
    pub fn resolve(self, value: Value) {
        self.settle(Outcome::Fulfilled(Args::from(value)));
    }

    pub fn reject(self, reason: Value) {
        self.settle(Outcome::Rejected(Args::from(reason)));
    }

    pub fn resolve_with(self, args: impl Into<Args>) {
        self.settle(Outcome::Fulfilled(args.into()));
    }

    pub fn reject_with(self, args: impl Into<Args>) {
        self.settle(Outcome::Rejected(args.into()));
    }

    pub fn settle(self, outcome: Outcome) {
        self.core.settle(outcome);
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("status", &self.core.status())
            .finish()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.core.release_resolver();
    }
}

/// Generation counter that combinators park on while their inputs settle.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Signal::default())
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Parks until the generation moves past `seen` or `timeout` elapses.
    pub(crate) fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let mut generation = self.generation.lock();
        if *generation == seen {
            self.changed.wait_for(&mut generation, timeout);
        }
        *generation != seen
    }
}
