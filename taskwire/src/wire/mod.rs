//! Cross-process execution.
//!
//! ```text
//!   client process                         server process
//!  ┌────────────────┐   unix socket    ┌──────────────────────┐
//!  │ WireWorker     │  ──────────────▶ │ WireServer           │
//!  │   └ WireLink   │  length-delimited│   └ WireRunner       │
//!  │     (reconnect)│  ◀────────────── │       ├ Universe     │
//!  └────────────────┘      frames      │       └ StreamRegistry│
//!                                      └──────────────────────┘
//! ```
//!
//! A [`WireWorker`] is attached to a dispatcher like any other worker. Its
//! calls are framed by [`protocol`], served by a [`WireServer`] and executed
//! by that server's [`WireRunner`]. Large results are split by the
//! [`chunker`] and iterators stay on the server, pulled one item per request.
//!
//! The client only ever knows the server by its [`Descriptor`], so a server
//! can be replaced under a running worker: the next request reconnects.

pub mod chunker;
mod codec;
mod descriptor;
mod link;
pub mod protocol;
mod registry;
mod runner;
mod server;
mod worker;

pub use chunker::{split, ChunkStream, DEFAULT_CHUNK_SIZE};
pub use codec::{Codec, CodecError, JsonCodec};
pub use descriptor::{Descriptor, DescriptorError};
pub use link::{
    ReconnectPolicy, WireError, WireLink, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_RESEND_ATTEMPTS,
};
pub use protocol::{
    CallResponse, NextResponse, ProtocolError, Request, Response, Status, MAX_FRAME_LENGTH,
};
pub use registry::{ConnectionId, Stream, StreamId, StreamRegistry, Taken};
pub use runner::{Finished, Job, RunnerError, WireRunner, MAX_CHUNK_SIZE};
pub use server::WireServer;
pub use worker::WireWorker;
