//! `all`, `all_settled`, `race` and `any`.
//!
//! Each combinator is itself a promise whose unit of work scans its entries
//! in input order until its termination condition holds. Between scans it
//! parks on a [`Signal`] that every entry notifies when it settles, bounded
//! by [`Config::poll_interval`] for entries that can only be polled.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::promise::Promise;
use crate::slot::{Args, Outcome};
use crate::state::{Resolver, Signal};
use crate::{Error, Status, Value};

/// One input of a combinator. Plain values count as already fulfilled.
#[derive(Debug, Clone)]
pub enum Entry {
    Value(Value),
    Promise(Promise),
}

impl From<Value> for Entry {
    fn from(value: Value) -> Self {
        Entry::Value(value)
    }
}

impl From<Promise> for Entry {
    fn from(promise: Promise) -> Self {
        Entry::Promise(promise)
    }
}

impl From<&Promise> for Entry {
    fn from(promise: &Promise) -> Self {
        Entry::Promise(promise.clone())
    }
}

/// One record of an `all_settled` result.
///
/// ```
/// use promise_driver::{json, SettledResult};
///
/// let record = SettledResult::Rejected { reason: json!("timeout") };
/// assert_eq!(record.into_value(), json!({"status": "rejected", "reason": "timeout"}));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SettledResult {
    Fulfilled { value: Value },
    Rejected { reason: Value },
}

impl SettledResult {
    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Fulfilled(args) => SettledResult::Fulfilled {
                value: args.into_first(),
            },
            Outcome::Rejected(args) => SettledResult::Rejected {
                reason: args.into_first(),
            },
        }
    }

    pub fn status(&self) -> Status {
        match self {
            SettledResult::Fulfilled { .. } => Status::Fulfilled,
            SettledResult::Rejected { .. } => Status::Rejected,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            SettledResult::Fulfilled { value } => {
                serde_json::json!({ "status": "fulfilled", "value": value })
            }
            SettledResult::Rejected { reason } => {
                serde_json::json!({ "status": "rejected", "reason": reason })
            }
        }
    }

    /// Reads back the array an `all_settled` promise fulfills with.
    pub fn parse_all(value: Value) -> Result<Vec<SettledResult>, Error> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Observation state of one combinator run.
struct Scan {
    signal: Arc<Signal>,
    interval: Duration,
    rounds: u64,
}

impl Scan {
    fn new(entries: &[Entry], interval: Duration) -> Self {
        let signal = Signal::new();
        for entry in entries {
            if let Entry::Promise(promise) = entry {
                promise.subscribe(&signal);
            }
        }
        Scan {
            signal,
            interval,
            rounds: 0,
        }
    }

    fn begin(&self) -> u64 {
        self.signal.generation()
    }

    /// The entry's settle if it is known. A failure to observe a promise
    /// counts as its rejection.
    fn observe(&self, entry: &Entry) -> Option<Outcome> {
        match entry {
            Entry::Value(value) => Some(Outcome::fulfilled(value.clone())),
            Entry::Promise(promise) => {
                let outcome = match promise.probe() {
                    Ok(outcome) => outcome?,
                    Err(e) => Outcome::rejected(Value::String(e.to_string())),
                };
                promise.mark_observed();
                Some(outcome)
            }
        }
    }

    fn park(&mut self, seen: u64, settled: usize, total: usize) {
        self.rounds += 1;
        tracing::trace!(round = self.rounds, settled, total, "combinator scan");
        self.signal.wait_past(seen, self.interval);
    }
}

fn collect<I>(entries: I) -> Vec<Entry>
where
    I: IntoIterator,
    I::Item: Into<Entry>,
{
    entries.into_iter().map(Into::into).collect()
}

fn spawn_scan<F>(config: &Config, entries: Vec<Entry>, body: F) -> Result<Promise, Error>
where
    F: FnOnce(Resolver, Vec<Entry>, Scan) + Send + 'static,
{
    let interval = config.poll_interval();
    Promise::with_config(&config.for_combinator(), move |resolver: Resolver| {
        let scan = Scan::new(&entries, interval);
        body(resolver, entries, scan)
    })
}

/// Fulfills with every entry's value in input order, or rejects with the
/// first rejection observed.
pub fn all<I>(config: &Config, entries: I) -> Result<Promise, Error>
where
    I: IntoIterator,
    I::Item: Into<Entry>,
{
    spawn_scan(config, collect(entries), |resolver, entries, mut scan| loop {
        let seen = scan.begin();
        let mut values = Vec::with_capacity(entries.len());
        for entry in &entries {
            match scan.observe(entry) {
                Some(Outcome::Fulfilled(args)) => values.push(args.into_first()),
                Some(Outcome::Rejected(args)) => return resolver.reject_with(args),
                None => {}
            }
        }
        if values.len() == entries.len() {
            return resolver.resolve(Value::Array(values));
        }
        scan.park(seen, values.len(), entries.len());
    })
}

/// Fulfills, once every entry settled, with one [`SettledResult`] record per
/// entry. Never rejects.
pub fn all_settled<I>(config: &Config, entries: I) -> Result<Promise, Error>
where
    I: IntoIterator,
    I::Item: Into<Entry>,
{
    spawn_scan(config, collect(entries), |resolver, entries, mut scan| {
        let mut records: Vec<Option<SettledResult>> = vec![None; entries.len()];
        loop {
            let seen = scan.begin();
            for (entry, record) in entries.iter().zip(records.iter_mut()) {
                if record.is_none() {
                    *record = scan.observe(entry).map(SettledResult::from_outcome);
                }
            }
            let settled = records.iter().filter(|r| r.is_some()).count();
            if settled == entries.len() {
                let values = records
                    .into_iter()
                    .flatten()
                    .map(SettledResult::into_value)
                    .collect();
                return resolver.resolve(Value::Array(values));
            }
            scan.park(seen, settled, entries.len());
        }
    })
}

/// Adopts the outcome of the first entry found settled, in scan order.
pub fn race<I>(config: &Config, entries: I) -> Result<Promise, Error>
where
    I: IntoIterator,
    I::Item: Into<Entry>,
{
    spawn_scan(config, collect(entries), |resolver, entries, mut scan| {
        if entries.is_empty() {
            return resolver.reject(Value::String("no entries to race".into()));
        }
        loop {
            let seen = scan.begin();
            if let Some(outcome) = entries.iter().find_map(|entry| scan.observe(entry)) {
                return resolver.settle(outcome);
            }
            scan.park(seen, 0, entries.len());
        }
    })
}

/// Fulfills with the first fulfillment observed. Rejects only once every
/// entry rejected, with the array of reasons in input order.
pub fn any<I>(config: &Config, entries: I) -> Result<Promise, Error>
where
    I: IntoIterator,
    I::Item: Into<Entry>,
{
    spawn_scan(config, collect(entries), |resolver, entries, mut scan| {
        let mut reasons: Vec<Option<Value>> = vec![None; entries.len()];
        loop {
            let seen = scan.begin();
            for (entry, reason) in entries.iter().zip(reasons.iter_mut()) {
                if reason.is_some() {
                    continue;
                }
                match scan.observe(entry) {
                    Some(Outcome::Fulfilled(args)) => return resolver.resolve_with(args),
                    Some(Outcome::Rejected(args)) => *reason = Some(args.into_first()),
                    None => {}
                }
            }
            let rejected = reasons.iter().filter(|r| r.is_some()).count();
            if rejected == entries.len() {
                let reasons = reasons.into_iter().flatten().collect();
                return resolver.reject_with(Args::from(Value::Array(reasons)));
            }
            scan.park(seen, rejected, entries.len());
        }
    })
}

/// The combinators on the process-wide default configuration.
impl Promise {
    pub fn all<I>(entries: I) -> Result<Promise, Error>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        all(&Config::global(), entries)
    }

    pub fn all_settled<I>(entries: I) -> Result<Promise, Error>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        all_settled(&Config::global(), entries)
    }

    pub fn race<I>(entries: I) -> Result<Promise, Error>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        race(&Config::global(), entries)
    }

    pub fn any<I>(entries: I) -> Result<Promise, Error>
    where
        I: IntoIterator,
        I::Item: Into<Entry>,
    {
        any(&Config::global(), entries)
    }
}
