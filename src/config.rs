//! Backend selection.
//!
//! Promise constructors either take a [`Config`] explicitly or fall back to
//! [`Config::global`], which is read from the environment the first time it
//! is needed unless [`Config::install`] ran before.
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::Error;

pub const DRIVER_ENV: &str = "PROMISE_DRIVER";
pub const POLL_INTERVAL_ENV: &str = "PROMISE_POLL_INTERVAL_MS";

const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// The concurrency backend a promise runs its work on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Coroutine when a tokio runtime is active on the calling thread,
    /// synchronous otherwise.
    #[default]
    Auto,
    Sync,
    Cooperative,
    Coroutine,
    Fork,
}

impl Backend {
    /// Pins `Auto` to a concrete backend for the calling context.
    pub fn resolve(self) -> Backend {
        match self {
            Backend::Auto if coroutine_available() => Backend::Coroutine,
            Backend::Auto => Backend::Sync,
            other => other,
        }
    }
}

#[cfg(feature = "coroutine")]
fn coroutine_available() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

#[cfg(not(feature = "coroutine"))]
fn coroutine_available() -> bool {
    false
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Backend::Auto => "auto",
            Backend::Sync => "sync",
            Backend::Cooperative => "cooperative",
            Backend::Coroutine => "coroutine",
            Backend::Fork => "fork",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown promise driver `{0}`")]
pub struct UnknownBackend(String);

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "sync" | "polyfill" => Ok(Backend::Sync),
            "cooperative" | "fiber" => Ok(Backend::Cooperative),
            "coroutine" => Ok(Backend::Coroutine),
            "fork" | "process" => Ok(Backend::Fork),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    /// Upper bound on how long a combinator parks between scans. Children
    /// that cannot signal in memory (forked ones) are re-probed this often.
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The backend combinator bodies run on. A combinator only inspects
    /// promises owned by this process, so it never forks.
    pub(crate) fn for_combinator(&self) -> Config {
        match self.backend.resolve() {
            Backend::Fork => Config {
                backend: Backend::Sync,
                ..*self
            },
            backend => Config { backend, ..*self },
        }
    }

    /// Reads `PROMISE_DRIVER` and `PROMISE_POLL_INTERVAL_MS`. Unparseable
    /// values are logged and replaced by defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(name) = std::env::var(DRIVER_ENV) {
            match name.parse::<Backend>() {
                Ok(backend) => config.backend = backend,
                Err(e) => tracing::warn!("{}, using {}", e, config.backend),
            }
        }
        if let Ok(raw) = std::env::var(POLL_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval_ms = ms,
                _ => tracing::warn!(
                    "ignoring {}={:?}, using {}ms",
                    POLL_INTERVAL_ENV,
                    raw,
                    config.poll_interval_ms
                ),
            }
        }
        config
    }

    /// The process-wide default, initialized from the environment on first
    /// use.
    pub fn global() -> Config {
        *GLOBAL.get_or_init(|| {
            let config = Config::from_env();
            tracing::debug!(backend = %config.backend, "promise driver defaulted");
            config
        })
    }

    /// Sets the process-wide default. Only the first call (or the first
    /// implicit read through [`Config::global`]) wins.
    pub fn install(self) -> Result<(), Error> {
        GLOBAL.set(self).map_err(|_| Error::ConfigAlreadySet)?;
        tracing::debug!(backend = %self.backend, "promise driver installed");
        Ok(())
    }
}
