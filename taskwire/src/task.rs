//! Calls and the priorities they are queued under.
//!
//! A [`Call`] names a method and carries its arguments. [`CallOptions`] tune
//! how the call is queued: its niceness, the series it belongs to, and
//! whether it jumps to the front or back of the queue.
//!
//! # Priority scheme
//!
//! Every series keeps its own serial counter. A call's priority is
//!
//! ```text
//! serial(series) * (100 + (niceness + 20)^2)
//! ```
//!
//! so calls within a series stay FIFO while nicer calls drift back relative to
//! other series. A niceness of -20 weighs 100 per serial, 0 weighs 500 and
//! +20 weighs 1700. `do_next` and `do_last` bypass the formula entirely.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Lowest (most urgent) accepted niceness.
pub const NICENESS_MIN: i32 = -20;

/// Highest (least urgent) accepted niceness.
pub const NICENESS_MAX: i32 = 20;

// =============================================================================
// Call
// =============================================================================

/// A method invocation: name plus positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// A call with no arguments.
    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, Vec::new())
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

// =============================================================================
// Options
// =============================================================================

/// Queueing options for a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Scheduling niceness in `-20..=20`; higher runs later.
    pub niceness: i32,
    /// Series whose serial counter this call advances.
    pub series: Option<String>,
    /// Run ahead of everything already queued.
    pub do_next: bool,
    /// Run after everything already queued.
    pub do_last: bool,
    /// Resolve failures as [`Outcome::Failure`](crate::dispatch::Outcome::Failure)
    /// instead of a text summary.
    pub wants_failure_as_value: bool,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn niceness(mut self, niceness: i32) -> Self {
        self.niceness = niceness;
        self
    }

    pub fn series(mut self, series: impl Into<String>) -> Self {
        self.series = Some(series.into());
        self
    }

    pub fn do_next(mut self) -> Self {
        self.do_next = true;
        self
    }

    pub fn do_last(mut self) -> Self {
        self.do_last = true;
        self
    }

    pub fn failure_as_value(mut self) -> Self {
        self.wants_failure_as_value = true;
        self
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Queue key; lower runs sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i64);

impl Priority {
    /// Key used by `do_next`.
    pub const FIRST: Priority = Priority(i64::MIN);
    /// Key used by `do_last`.
    pub const LAST: Priority = Priority(i64::MAX);
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Priority::FIRST => f.write_str("first"),
            Priority::LAST => f.write_str("last"),
            Priority(p) => write!(f, "{p}"),
        }
    }
}

/// Mints priorities, tracking one serial counter per series.
#[derive(Debug, Default)]
pub struct PriorityFactory {
    serials: HashMap<Option<String>, i64>,
}

impl PriorityFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Priority for the next call queued with `options`.
    ///
    /// Returns `None` when the niceness is out of range. `do_next` and
    /// `do_last` do not advance any serial counter.
    pub fn next(&mut self, options: &CallOptions) -> Option<Priority> {
        if !(NICENESS_MIN..=NICENESS_MAX).contains(&options.niceness) {
            return None;
        }
        if options.do_next {
            return Some(Priority::FIRST);
        }
        if options.do_last {
            return Some(Priority::LAST);
        }

        let serial = self.advance(&options.series);
        let positivized = i64::from(options.niceness - NICENESS_MIN);
        let weight = 100 + positivized * positivized;
        Some(Priority(serial.saturating_mul(weight)))
    }

    fn advance(&mut self, series: &Option<String>) -> i64 {
        if let Some(serial) = self.serials.get_mut(series) {
            *serial += 1;
            return *serial;
        }
        // A new series starts level with the busiest existing one.
        let start = self.serials.values().copied().max().unwrap_or(0) + 1;
        self.serials.insert(series.clone(), start);
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_display() {
        let call = Call::new("add", vec![json!(1), json!("two")]);
        assert_eq!(call.to_string(), r#"add(1, "two")"#);
        assert_eq!(Call::bare("tick").to_string(), "tick()");
    }

    #[test]
    fn test_priorities_increase_within_series() {
        let mut factory = PriorityFactory::new();
        let opts = CallOptions::new();
        let a = factory.next(&opts).unwrap();
        let b = factory.next(&opts).unwrap();
        let c = factory.next(&opts).unwrap();
        assert!(a < b && b < c);
        assert_eq!(a, Priority(500));
    }

    #[test]
    fn test_niceness_weights() {
        let mut factory = PriorityFactory::new();
        let urgent = factory.next(&CallOptions::new().niceness(-20)).unwrap();
        assert_eq!(urgent, Priority(100));

        let mut factory = PriorityFactory::new();
        let lazy = factory.next(&CallOptions::new().niceness(20)).unwrap();
        assert_eq!(lazy, Priority(1700));
    }

    #[test]
    fn test_nicer_call_runs_later() {
        let mut factory = PriorityFactory::new();
        let nice = factory.next(&CallOptions::new().niceness(10)).unwrap();
        let mean = factory.next(&CallOptions::new().niceness(-10)).unwrap();
        assert!(mean < nice);
    }

    #[test]
    fn test_new_series_starts_level() {
        let mut factory = PriorityFactory::new();
        for _ in 0..5 {
            factory.next(&CallOptions::new());
        }
        let other = factory.next(&CallOptions::new().series("other")).unwrap();
        let main = factory.next(&CallOptions::new()).unwrap();
        assert_eq!(other, Priority(6 * 500));
        assert_eq!(main, Priority(6 * 500));
    }

    #[test]
    fn test_do_next_and_do_last() {
        let mut factory = PriorityFactory::new();
        assert_eq!(factory.next(&CallOptions::new().do_next()), Some(Priority::FIRST));
        assert_eq!(factory.next(&CallOptions::new().do_last()), Some(Priority::LAST));
        // Neither advanced the default series.
        assert_eq!(factory.next(&CallOptions::new()), Some(Priority(500)));
    }

    #[test]
    fn test_niceness_out_of_range() {
        let mut factory = PriorityFactory::new();
        assert_eq!(factory.next(&CallOptions::new().niceness(21)), None);
        assert_eq!(factory.next(&CallOptions::new().niceness(-21)), None);
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::FIRST.to_string(), "first");
        assert_eq!(Priority::LAST.to_string(), "last");
        assert_eq!(Priority(42).to_string(), "42");
    }
}
