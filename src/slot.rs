//! Captured settle arguments.
//!
//! A settle may carry several positional values (`reject(code, message)`),
//! so every slot stores an [`Args`] list rather than a single value.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Deref;

use crate::Status;

static NULL: Value = Value::Null;

/// Ordered arguments captured by a fulfill or reject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Args(values)
    }

    /// An empty argument list, the "no value" settle.
    pub fn none() -> Self {
        Args(Vec::new())
    }

    /// The first argument, or `Null` when nothing was passed.
    pub fn first(&self) -> &Value {
        self.0.first().unwrap_or(&NULL)
    }

    pub fn into_first(self) -> Value {
        self.0.into_iter().next().unwrap_or(Value::Null)
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl Deref for Args {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl From<Value> for Args {
    fn from(value: Value) -> Self {
        Args(vec![value])
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Args(values)
    }
}

impl IntoIterator for Args {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::fmt::Display for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "<no value>"),
            [Value::String(s)] => write!(f, "{}", s),
            [single] => write!(f, "{}", single),
            many => {
                for (i, value) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                Ok(())
            }
        }
    }
}

/// A write-once cell for one outcome channel of a promise.
#[derive(Debug, Clone, Default)]
pub struct ResultSlot {
    args: Option<Args>,
}

impl ResultSlot {
    /// Stores `args` unless the slot already holds a value. Returns whether
    /// the write happened.
    pub(crate) fn fill(&mut self, args: Args) -> bool {
        if self.args.is_some() {
            return false;
        }
        self.args = Some(args);
        true
    }

    pub fn get(&self) -> Option<&Args> {
        self.args.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.args.is_some()
    }
}

/// The final result of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "args", rename_all = "lowercase")]
pub enum Outcome {
    Fulfilled(Args),
    Rejected(Args),
}

impl Outcome {
    pub fn fulfilled(value: Value) -> Self {
        Outcome::Fulfilled(Args::from(value))
    }

    pub fn rejected(reason: Value) -> Self {
        Outcome::Rejected(Args::from(reason))
    }

    pub fn status(&self) -> Status {
        match self {
            Outcome::Fulfilled(_) => Status::Fulfilled,
            Outcome::Rejected(_) => Status::Rejected,
        }
    }

    pub fn args(&self) -> &Args {
        match self {
            Outcome::Fulfilled(args) | Outcome::Rejected(args) => args,
        }
    }

    pub fn into_args(self) -> Args {
        match self {
            Outcome::Fulfilled(args) | Outcome::Rejected(args) => args,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }
}
