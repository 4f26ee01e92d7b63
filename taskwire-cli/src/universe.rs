//! Methods served by `taskwire serve` and used by the demo.

use serde_json::{json, Value};
use std::time::Duration;
use taskwire::universe::{arg, arg_i64, CallError, MethodTable};

/// The demo method table.
pub fn demo_universe() -> MethodTable {
    MethodTable::new()
        .method("echo", |args| Ok(arg(args, 0)?.clone()))
        .method("double", |args| Ok(json!(arg_i64(args, 0)? * 2)))
        .method("whoami", |_| Ok(json!(std::process::id())))
        .method("sleep_ms", |args| {
            let ms = arg_i64(args, 0)?;
            if ms < 0 {
                return Err(CallError::new("sleep_ms needs a non-negative duration"));
            }
            std::thread::sleep(Duration::from_millis(ms as u64));
            Ok(json!(ms))
        })
        .method("blob", |args| {
            let len = usize::try_from(arg_i64(args, 0)?)
                .map_err(|_| CallError::new("blob needs a non-negative length"))?;
            Ok(Value::String("x".repeat(len)))
        })
        .method("fail", |args| {
            let reason = args.first().and_then(Value::as_str).unwrap_or("requested failure");
            Err(CallError::new(reason))
        })
        .iterator("range", |args| {
            let n = arg_i64(args, 0)?;
            Ok((0..n).map(|i| json!(i)))
        })
}
