//! Deferred results with pluggable concurrency drivers.
//!
//! A [`Promise`] runs a unit of work through a [`Driver`] and exposes the
//! eventual outcome through blocking chaining (`then`, `catch`, `finally`),
//! the four combinators (`all`, `all_settled`, `race`, `any`) and an
//! awaitable [`Settled`] future. The driver decides how the work runs:
//! inline, on a per-thread cooperative queue, on a tokio runtime, or in a
//! forked child process. Call sites do not change between them.
//!
//! # Examples
//!
//! ```
//! use promise_driver::{json, Backend, Promise};
//!
//! let doubled = Promise::with_backend(Backend::Sync, |resolver| {
//!     resolver.resolve(json!(21));
//! })
//! .unwrap()
//! .then(|args| json!(args.first().as_i64().unwrap_or(0) * 2))
//! .unwrap();
//! assert_eq!(doubled.value().unwrap(), json!(42));
//! ```
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod combinator;
pub mod config;
mod state;
pub mod driver;
pub mod promise;
pub mod slot;

pub use crate::combinator::{Entry, SettledResult};
pub use crate::config::{Backend, Config};
pub use crate::state::Resolver;
pub use crate::driver::{Drive, Driver};
pub use crate::promise::{Flow, IntoFlow, Promise, Settled};
pub use crate::slot::{Args, Outcome, ResultSlot};
pub use serde_json::{json, Value};

/// Settle state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Pending => "pending",
            Status::Fulfilled => "fulfilled",
            Status::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("the {backend} driver is unavailable: {reason}")]
    DriverUnavailable { backend: Backend, reason: String },
    #[error("child process exited with unexpected code {0}")]
    UnexpectedExitCode(i32),
    #[error("precondition violated: {0}")]
    PreconditionViolation(&'static str),
    #[error("the promise has no continuation, its work never ran")]
    ChainNotStarted,
    #[error("promise rejected: {0}")]
    Rejected(Args),
    #[error("cannot transport the outcome: {0}")]
    Transport(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("the driver was dropped before it signaled completion")]
    Disconnected,
    #[error("the global configuration is already set")]
    ConfigAlreadySet,
}
