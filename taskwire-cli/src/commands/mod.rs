//! CLI command implementations.
//!
//! - [`serve`] - Host the demo methods on a unix socket
//! - [`demo`] - Dispatch calls over local or remote workers

pub mod demo;
pub mod serve;
