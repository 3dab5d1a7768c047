//! The promise handle and its chaining API.
use parking_lot::ReentrantMutex;
use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::config::{Backend, Config};
use crate::driver::{self, Drive, Driver};
use crate::slot::{Args, Outcome, ResultSlot};
use crate::state::{Core, Resolver, Signal};
use crate::{Error, Status, Value};

/// What a unit of work handed back, once it returned normally.
#[derive(Debug)]
pub enum Flow {
    /// Nothing: fulfilled with no value.
    Empty,
    Value(Value),
    Outcome(Outcome),
    /// Adopt the outcome of another promise.
    Chain(Promise),
}

/// Return types a unit of work or a handler may have.
///
/// `Err` values turn into a rejection carrying the error's message.
pub trait IntoFlow {
    fn into_flow(self) -> Result<Flow, String>;
}

impl IntoFlow for Flow {
    fn into_flow(self) -> Result<Flow, String> {
        Ok(self)
    }
}

impl IntoFlow for () {
    fn into_flow(self) -> Result<Flow, String> {
        Ok(Flow::Empty)
    }
}

impl IntoFlow for Value {
    fn into_flow(self) -> Result<Flow, String> {
        Ok(Flow::Value(self))
    }
}

impl IntoFlow for Outcome {
    fn into_flow(self) -> Result<Flow, String> {
        Ok(Flow::Outcome(self))
    }
}

impl IntoFlow for Promise {
    fn into_flow(self) -> Result<Flow, String> {
        Ok(Flow::Chain(self))
    }
}

impl<T: IntoFlow> IntoFlow for Option<T> {
    fn into_flow(self) -> Result<Flow, String> {
        match self {
            Some(inner) => inner.into_flow(),
            None => Ok(Flow::Empty),
        }
    }
}

impl<T: IntoFlow, E: fmt::Display> IntoFlow for Result<T, E> {
    fn into_flow(self) -> Result<Flow, String> {
        match self {
            Ok(inner) => inner.into_flow(),
            Err(e) => Err(e.to_string()),
        }
    }
}

type Task = Box<dyn FnOnce(Resolver) -> Result<Flow, String> + Send + 'static>;
type Handler = Box<dyn FnOnce(Args) -> Result<Flow, String> + Send + 'static>;

fn handler<F, R>(f: F) -> Handler
where
    F: FnOnce(Args) -> R + Send + 'static,
    R: IntoFlow,
{
    Box::new(move |args| f(args).into_flow())
}

/// A deferred result bound to one [`Driver`].
///
/// Cloning is cheap and every clone observes the same settle. Chaining
/// blocks on the predecessor's driver first, so each link of a chain runs
/// after the one before it settled.
///
/// # Examples
///
/// ```
/// use promise_driver::{json, Backend, Promise, Status};
///
/// let failed = Promise::with_backend(Backend::Sync, |_| -> Result<(), String> {
///     Err("disk full".into())
/// })
/// .unwrap();
/// let recovered = failed
///     .catch(|reason| json!(format!("recovered from {}", reason)))
///     .unwrap();
/// assert_eq!(recovered.status().unwrap(), Status::Fulfilled);
/// assert_eq!(recovered.value().unwrap(), json!("recovered from disk full"));
/// ```
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<Core>,
    driver: Arc<Driver>,
    /// Serializes joins so a driver is waited on once.
    gate: ReentrantMutex<()>,
    config: Config,
}

impl Promise {
    /// Starts `work` on the process-wide default backend.
    pub fn new<F, R>(work: F) -> Result<Promise, Error>
    where
        F: FnOnce(Resolver) -> R + Send + 'static,
        R: IntoFlow,
    {
        Self::with_config(&Config::global(), work)
    }

    pub fn with_backend<F, R>(backend: Backend, work: F) -> Result<Promise, Error>
    where
        F: FnOnce(Resolver) -> R + Send + 'static,
        R: IntoFlow,
    {
        Self::with_config(&Config::new(backend), work)
    }

    /// Starts `work` on the backend `config` names. Fails at once with
    /// [`Error::DriverUnavailable`] when that backend cannot run here.
    pub fn with_config<F, R>(config: &Config, work: F) -> Result<Promise, Error>
    where
        F: FnOnce(Resolver) -> R + Send + 'static,
        R: IntoFlow,
    {
        let driver = Driver::new(config.backend)?;
        Self::start(*config, driver, Box::new(move |resolver| work(resolver).into_flow()))
    }

    /// A promise fulfilled with `value`.
    pub fn resolve(value: Value) -> Result<Promise, Error> {
        Self::new(move |resolver: Resolver| resolver.resolve(value))
    }

    /// A promise rejected with `reason`.
    pub fn reject(reason: Value) -> Result<Promise, Error> {
        Self::new(move |resolver: Resolver| resolver.reject(reason))
    }

    /// An already completed link that runs nothing.
    pub(crate) fn from_outcome(config: Config, outcome: Outcome) -> Promise {
        let core = Core::new();
        core.complete(outcome);
        Promise {
            inner: Arc::new(Inner {
                core,
                driver: Arc::new(Driver::Sync(driver::SyncDriver)),
                gate: ReentrantMutex::new(()),
                config,
            }),
        }
    }

    fn start(config: Config, driver: Driver, work: Task) -> Result<Promise, Error> {
        let core = Core::new();
        let driver = Arc::new(driver);
        let resolver = core.resolver();
        let (task_core, task_driver) = (core.clone(), driver.clone());
        driver.spawn(Box::new(move || {
            let returned = panic::catch_unwind(AssertUnwindSafe(move || work(resolver)))
                .unwrap_or_else(|payload| Err(panic_message(payload)));
            let outcome = finish(&task_core, &task_driver, returned);
            if let Err(e) = task_driver.notify(&outcome) {
                tracing::warn!(error = %e, "driver refused the completion notice");
            }
        }))?;
        Ok(Promise {
            inner: Arc::new(Inner {
                core,
                driver,
                gate: ReentrantMutex::new(()),
                config,
            }),
        })
    }

    /// Blocks on the driver once and returns the continuation.
    fn join(&self) -> Result<Outcome, Error> {
        let core = &self.inner.core;
        if let Some(outcome) = core.continuation() {
            return Ok(outcome);
        }
        let _gate = self.inner.gate.lock();
        if let Some(outcome) = core.continuation() {
            return Ok(outcome);
        }
        if let Some(transported) = self.inner.driver.wait()? {
            core.complete(transported);
        }
        // The work finished, but a resolver it handed out may still settle.
        let outcome = core
            .wait_continuation(driver::run_local)
            .ok_or(Error::ChainNotStarted)?;
        tracing::debug!(
            backend = %self.inner.driver.backend(),
            status = %outcome.status(),
            "promise joined"
        );
        Ok(outcome)
    }

    /// The settle if it is already known, without blocking.
    pub(crate) fn probe(&self) -> Result<Option<Outcome>, Error> {
        let core = &self.inner.core;
        if let Some(outcome) = core.outcome() {
            return Ok(Some(outcome));
        }
        self.poll_driver()?;
        Ok(core.outcome())
    }

    /// Gives the driver a chance to make progress. Skipped while another
    /// caller is joining.
    fn poll_driver(&self) -> Result<(), Error> {
        let _gate = match self.inner.gate.try_lock() {
            Some(gate) => gate,
            None => return Ok(()),
        };
        if self.inner.core.continuation().is_some() {
            return Ok(());
        }
        if let Poll::Ready(Some(transported)) = self.inner.driver.poll()? {
            self.inner.core.complete(transported);
        }
        Ok(())
    }

    pub(crate) fn subscribe(&self, signal: &Arc<Signal>) {
        self.inner.core.subscribe(signal);
    }

    pub(crate) fn mark_observed(&self) {
        self.inner.core.mark_observed();
    }

    /// Waits for the settle and returns it.
    pub fn outcome(&self) -> Result<Outcome, Error> {
        let outcome = self.join()?;
        self.mark_observed();
        Ok(outcome)
    }

    /// Waits for the settle and returns the first fulfilled argument. A
    /// rejection is returned as [`Error::Rejected`].
    pub fn value(&self) -> Result<Value, Error> {
        match self.outcome()? {
            Outcome::Fulfilled(args) => Ok(args.into_first()),
            Outcome::Rejected(args) => Err(Error::Rejected(args)),
        }
    }

    /// Waits for the settle and returns its status.
    pub fn status(&self) -> Result<Status, Error> {
        Ok(self.join()?.status())
    }

    /// The status as of now. May drive cooperative work one step.
    pub fn try_status(&self) -> Result<Status, Error> {
        Ok(self.probe()?.map_or(Status::Pending, |outcome| outcome.status()))
    }

    /// Snapshot of the fulfilled slot.
    pub fn fulfilled(&self) -> ResultSlot {
        self.inner.core.fulfilled()
    }

    /// Snapshot of the rejected slot.
    pub fn rejected(&self) -> ResultSlot {
        self.inner.core.rejected()
    }

    pub fn backend(&self) -> Backend {
        self.inner.driver.backend()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Runs `on_fulfilled` with the fulfilled arguments. A rejection passes
    /// through to the returned promise untouched.
    pub fn then<F, R>(&self, on_fulfilled: F) -> Result<Promise, Error>
    where
        F: FnOnce(Args) -> R + Send + 'static,
        R: IntoFlow,
    {
        self.react(Some(handler(on_fulfilled)), None)
    }

    /// Two-handler `then`. Whichever handler runs decides the returned
    /// promise, so a handled rejection stops here.
    pub fn then_or_else<F, R, G, S>(&self, on_fulfilled: F, on_rejected: G) -> Result<Promise, Error>
    where
        F: FnOnce(Args) -> R + Send + 'static,
        R: IntoFlow,
        G: FnOnce(Args) -> S + Send + 'static,
        S: IntoFlow,
    {
        self.react(Some(handler(on_fulfilled)), Some(handler(on_rejected)))
    }

    /// Runs `on_rejected` with the rejection arguments. A fulfillment passes
    /// through untouched.
    pub fn catch<G, S>(&self, on_rejected: G) -> Result<Promise, Error>
    where
        G: FnOnce(Args) -> S + Send + 'static,
        S: IntoFlow,
    {
        self.react(None, Some(handler(on_rejected)))
    }

    /// Runs `on_settled` whatever the outcome and passes the outcome on,
    /// unless the callback fails or returns a promise that rejects.
    pub fn finally<F, R>(&self, on_settled: F) -> Result<Promise, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoFlow,
    {
        let settled = self.outcome()?;
        self.continue_with(Box::new(move |_: Resolver| match on_settled().into_flow()? {
            Flow::Chain(next) => match next.adopt() {
                rejected @ Outcome::Rejected(_) => Ok(Flow::Outcome(rejected)),
                Outcome::Fulfilled(_) => Ok(Flow::Outcome(settled)),
            },
            _ => Ok(Flow::Outcome(settled)),
        }))
    }

    fn react(&self, on_fulfilled: Option<Handler>, on_rejected: Option<Handler>) -> Result<Promise, Error> {
        let outcome = self.outcome()?;
        let handler = match outcome {
            Outcome::Fulfilled(_) => on_fulfilled,
            Outcome::Rejected(_) => on_rejected,
        };
        match handler {
            Some(handler) => {
                self.continue_with(Box::new(move |_: Resolver| handler(outcome.into_args())))
            }
            None => {
                if outcome.is_rejected() {
                    tracing::debug!(reason = %outcome.args(), "rejection passed down the chain");
                }
                Ok(Promise::from_outcome(self.inner.config, outcome))
            }
        }
    }

    /// Starts the next link on a fresh driver of the same backend.
    fn continue_with(&self, work: Task) -> Result<Promise, Error> {
        let driver = Driver::new(self.inner.driver.backend())?;
        Self::start(self.inner.config, driver, work)
    }

    /// Joins and reads the outcome, folding a join failure into a
    /// rejection.
    fn adopt(&self) -> Outcome {
        self.outcome()
            .unwrap_or_else(|e| Outcome::rejected(Value::String(e.to_string())))
    }

    /// A future that resolves with the outcome once the promise settled.
    pub fn settled(&self) -> Settled {
        Settled {
            promise: self.clone(),
        }
    }
}

/// Decides the outcome of a finished unit of work and records it as the
/// continuation.
/// A resolver that is still out leaves the core pending; its settle or
/// release completes it later. The returned outcome is what `notify` hands
/// to the driver.
fn finish(core: &Core, drive: &Driver, returned: Result<Flow, String>) -> Outcome {
    let derived = match returned {
        Ok(Flow::Empty) => Outcome::Fulfilled(Args::none()),
        Ok(Flow::Value(value)) => Outcome::fulfilled(value),
        Ok(Flow::Outcome(outcome)) => outcome,
        Ok(Flow::Chain(next)) => next.adopt(),
        Err(message) => Outcome::rejected(Value::String(message)),
    };
    match core.finish(derived.clone()) {
        Some(outcome) => outcome,
        // Nothing the work leaves behind survives `notify` here.
        None if drive.crosses_address_space() => core
            .wait_continuation(driver::run_local)
            .unwrap_or(derived),
        None => derived,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unit of work panicked".to_string()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("backend", &self.inner.driver.backend())
            .field("core", &self.inner.core)
            .finish()
    }
}

/// Future returned by [`Promise::settled`].
///
/// # Examples
///
/// ```
/// use promise_driver::{json, Backend, Promise};
/// use futures::executor::block_on;
///
/// let promise = Promise::with_backend(Backend::Sync, |_| json!("later")).unwrap();
/// let outcome = block_on(async { promise.await }).unwrap();
/// assert_eq!(outcome.args().first(), &json!("later"));
/// ```
#[derive(Debug)]
pub struct Settled {
    promise: Promise,
}

impl Settled {
    fn ready(&self) -> Option<Outcome> {
        let outcome = self.promise.inner.core.continuation()?;
        self.promise.mark_observed();
        Some(outcome)
    }
}

impl Future for Settled {
    type Output = Result<Outcome, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.ready() {
            return Poll::Ready(Ok(outcome));
        }
        if let Err(e) = self.promise.poll_driver() {
            return Poll::Ready(Err(e));
        }
        if !self.promise.inner.core.register_waker(cx.waker()) {
            if let Some(outcome) = self.ready() {
                return Poll::Ready(Ok(outcome));
            }
        }
        if self.promise.inner.driver.needs_polling() {
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

impl IntoFuture for Promise {
    type Output = Result<Outcome, Error>;
    type IntoFuture = Settled;

    fn into_future(self) -> Settled {
        Settled { promise: self }
    }
}
