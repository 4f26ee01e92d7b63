//! Named-method tables that calls are resolved against.
//!
//! A [`Universe`] maps a method name plus JSON arguments to a result. The same
//! universe backs both a [`LocalWorker`](crate::worker::LocalWorker) in this
//! process and a [`WireRunner`](crate::wire::WireRunner) in a server process,
//! which is what lets a call be shipped across the wire by name.
//!
//! [`MethodTable`] is the stock implementation:
//!
//! ```
//! use serde_json::json;
//! use taskwire::universe::{arg_i64, MethodTable, Returned, Universe};
//!
//! let table = MethodTable::new()
//!     .method("double", |args| Ok(json!(arg_i64(args, 0)? * 2)))
//!     .iterator("range", |args| {
//!         let n = arg_i64(args, 0)?;
//!         Ok((0..n).map(|i| json!(i)))
//!     });
//!
//! match table.invoke("double", &[json!(21)]).unwrap() {
//!     Returned::Value(v) => assert_eq!(v, json!(42)),
//!     Returned::Iter(_) => unreachable!(),
//! }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Error raised by a method while running a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallError {
    message: String,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Lazy sequence produced by an iterator method.
///
/// An `Err` item reports a failure for that item and ends the sequence.
pub type ItemIter = Box<dyn Iterator<Item = Result<Value, CallError>> + Send>;

/// What a method produced.
pub enum Returned {
    /// A single value. `Value::Null` counts as "no result".
    Value(Value),
    /// A lazy sequence, pulled one item at a time by the consumer.
    Iter(ItemIter),
}

impl Returned {
    /// Wraps any sendable iterator of plain values.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Returned::Iter(Box::new(items.into_iter().map(Ok)))
    }

    /// Wraps an iterator whose items can fail.
    pub fn try_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Result<Value, CallError>>,
        I::IntoIter: Send + 'static,
    {
        Returned::Iter(Box::new(items.into_iter()))
    }
}

impl From<Value> for Returned {
    fn from(value: Value) -> Self {
        Returned::Value(value)
    }
}

impl fmt::Debug for Returned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returned::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Returned::Iter(_) => f.write_str("Iter(..)"),
        }
    }
}

/// Resolves method names to results.
///
/// Implementations are called from blocking threads as well as async tasks,
/// so `invoke` must not assume a runtime context.
pub trait Universe: Send + Sync + 'static {
    fn invoke(&self, method: &str, args: &[Value]) -> Result<Returned, CallError>;
}

type Method = Box<dyn Fn(&[Value]) -> Result<Returned, CallError> + Send + Sync>;

/// A [`Universe`] built from closures.
///
/// Names starting with `_` are private: they can be registered but never
/// invoked by name.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method returning a single value.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.methods.insert(
            name.into(),
            Box::new(move |args: &[Value]| f(args).map(Returned::Value)),
        );
        self
    }

    /// Registers a method returning a lazy sequence.
    pub fn iterator<F, I>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<I, CallError> + Send + Sync + 'static,
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.methods.insert(
            name.into(),
            Box::new(move |args: &[Value]| f(args).map(Returned::iter)),
        );
        self
    }

    /// Registers a method returning a lazy sequence whose items can fail.
    pub fn try_iterator<F, I>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<I, CallError> + Send + Sync + 'static,
        I: IntoIterator<Item = Result<Value, CallError>>,
        I::IntoIter: Send + 'static,
    {
        self.methods.insert(
            name.into(),
            Box::new(move |args: &[Value]| f(args).map(Returned::try_iter)),
        );
        self
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Universe for MethodTable {
    fn invoke(&self, method: &str, args: &[Value]) -> Result<Returned, CallError> {
        if method.starts_with('_') {
            return Err(CallError::new(format!(
                "Couldn't run call '{method}': private method"
            )));
        }
        match self.methods.get(method) {
            Some(f) => f(args),
            None => Err(CallError::new(format!(
                "Couldn't run call '{method}': no such method"
            ))),
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

// =============================================================================
// Argument helpers
// =============================================================================

/// Positional argument `index`, or an error naming the missing position.
pub fn arg(args: &[Value], index: usize) -> Result<&Value, CallError> {
    args.get(index)
        .ok_or_else(|| CallError::new(format!("missing argument {index}")))
}

/// Positional integer argument.
pub fn arg_i64(args: &[Value], index: usize) -> Result<i64, CallError> {
    let value = arg(args, index)?;
    value
        .as_i64()
        .ok_or_else(|| CallError::new(format!("argument {index} is not an integer: {value}")))
}

/// Positional string argument.
pub fn arg_str(args: &[Value], index: usize) -> Result<&str, CallError> {
    let value = arg(args, index)?;
    value
        .as_str()
        .ok_or_else(|| CallError::new(format!("argument {index} is not a string: {value}")))
}
