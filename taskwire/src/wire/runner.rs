//! Server-side executor for wire calls.
//!
//! [`WireRunner`] resolves each call against its [`Universe`] and classifies
//! the result:
//!
//! | method returned               | status | result            |
//! |-------------------------------|--------|-------------------|
//! | `Value::Null`                 | `n`    | empty             |
//! | value, encoding ≤ chunk size  | `r`    | encoded value     |
//! | value, encoding > chunk size  | `c`    | chunk stream id   |
//! | iterator                      | `i`    | item stream id    |
//! | error                         | `e`    | error text        |
//!
//! Stream ids are then served one element per `GetNext` request.
//!
//! Requests are handled in three steps so the owner of the runner never
//! waits on user code: [`start`](WireRunner::start) hands the method or the
//! iterator to the blocking pool, [`Job::wait`] awaits it anywhere, and
//! [`finish`](WireRunner::finish) records the result and builds the
//! response. Panics in user code end up as `e` responses or failed items.
//! [`call`](WireRunner::call) and [`get_next`](WireRunner::get_next) run all
//! three steps in one await.

use super::chunker::{split, DEFAULT_CHUNK_SIZE};
use super::codec::{Codec, CodecError, JsonCodec};
use super::protocol::{CallResponse, NextResponse, Request, Response, Status, MAX_FRAME_LENGTH};
use super::registry::{ConnectionId, Stream, StreamId, StreamRegistry, Taken};
use crate::universe::{CallError, ItemIter, Returned, Universe};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

/// Largest chunk that still fits in one frame next to the response header.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_LENGTH - 2;

/// A follow-up request the runner refuses to serve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// The id was never issued, was already exhausted, or belonged to a
    /// closed connection.
    #[error("unknown stream id '{0}'")]
    UnknownStream(String),

    #[error("stream '{0}' is already being read")]
    StreamBusy(String),
}

type Pulled = (ItemIter, Option<Result<Value, CallError>>);

enum Work {
    Ready(Response),
    Call {
        method: String,
        task: JoinHandle<Result<Returned, CallError>>,
    },
    Pull {
        id: StreamId,
        task: JoinHandle<Pulled>,
    },
}

/// What serving a follow-up request needs after the stream is checked out.
enum Step {
    Ready(NextResponse),
    Pull(StreamId, JoinHandle<Pulled>),
}

/// A request the runner has started.
pub struct Job {
    owner: ConnectionId,
    work: Work,
}

enum Outcome {
    Ready(Response),
    Call {
        method: String,
        invoked: Result<Result<Returned, CallError>, JoinError>,
    },
    Pull {
        id: StreamId,
        pulled: Result<Pulled, JoinError>,
    },
}

/// A [`Job`] whose user code has finished.
pub struct Finished {
    owner: ConnectionId,
    outcome: Outcome,
}

impl Job {
    /// Waits for the blocking part of the request. Does not touch the runner.
    pub async fn wait(self) -> Finished {
        let outcome = match self.work {
            Work::Ready(response) => Outcome::Ready(response),
            Work::Call { method, task } => Outcome::Call {
                method,
                invoked: task.await,
            },
            Work::Pull { id, task } => Outcome::Pull {
                id,
                pulled: task.await,
            },
        };
        Finished {
            owner: self.owner,
            outcome,
        }
    }
}

/// Executes calls and serves their follow-up streams.
pub struct WireRunner {
    universe: Arc<dyn Universe>,
    codec: Arc<dyn Codec>,
    chunk_size: usize,
    registry: StreamRegistry,
    accepting: bool,
}

impl WireRunner {
    pub fn new(universe: Arc<dyn Universe>) -> Self {
        Self {
            universe,
            codec: Arc::new(JsonCodec),
            chunk_size: DEFAULT_CHUNK_SIZE,
            registry: StreamRegistry::new(),
            accepting: true,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the chunking threshold, clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Begins serving one request for `owner`.
    ///
    /// Calls and iterator pulls are moved to the blocking pool; everything
    /// else is answered on the spot.
    pub fn start(&mut self, owner: ConnectionId, request: Request) -> Job {
        let work = match request {
            Request::Call { method, args } => self.start_call(method, &args),
            Request::GetNext { id } => self.start_next(owner, &id),
        };
        Job { owner, work }
    }

    /// Records what a job produced and builds the response to send.
    pub fn finish(&mut self, finished: Finished) -> Response {
        let Finished { owner, outcome } = finished;
        match outcome {
            Outcome::Ready(response) => response,
            Outcome::Call { method, invoked } => {
                Response::Call(self.classify(owner, &method, invoked))
            }
            Outcome::Pull { id, pulled } => Response::Next(self.record_pull(id, pulled)),
        }
    }

    /// Runs one call to completion.
    ///
    /// The caller waits on the method; owners serving many clients use
    /// [`start`](WireRunner::start) instead.
    pub async fn call(&mut self, owner: ConnectionId, method: &str, args: &[u8]) -> CallResponse {
        match self.spawn_call(method, args) {
            Ok(task) => {
                let invoked = task.await;
                self.classify(owner, method, invoked)
            }
            Err(response) => response,
        }
    }

    /// Serves the next element of stream `id`.
    pub async fn get_next(&mut self, id: &str) -> Result<NextResponse, RunnerError> {
        match self.begin_next(id)? {
            Step::Ready(next) => Ok(next),
            Step::Pull(stream_id, task) => {
                let pulled = task.await;
                Ok(self.record_pull(stream_id, pulled))
            }
        }
    }

    fn start_call(&self, method: String, args: &[u8]) -> Work {
        match self.spawn_call(&method, args) {
            Ok(task) => Work::Call { method, task },
            Err(response) => Work::Ready(Response::Call(response)),
        }
    }

    fn spawn_call(
        &self,
        method: &str,
        args: &[u8],
    ) -> Result<JoinHandle<Result<Returned, CallError>>, CallResponse> {
        if !self.accepting {
            return Err(CallResponse::error(format!(
                "runner is shutting down; '{method}' refused"
            )));
        }

        let args = match self.codec.decode(args) {
            Ok(Value::Array(args)) => args,
            Ok(other) => {
                return Err(CallResponse::error(format!(
                    "arguments must be a list, got {other}"
                )));
            }
            Err(err) => return Err(CallResponse::error(err)),
        };

        let universe = Arc::clone(&self.universe);
        let name = method.to_string();
        Ok(tokio::task::spawn_blocking(move || {
            universe.invoke(&name, &args)
        }))
    }

    fn start_next(&mut self, owner: ConnectionId, id: &str) -> Work {
        match self.begin_next(id) {
            Ok(Step::Ready(next)) => Work::Ready(Response::Next(next)),
            Ok(Step::Pull(id, task)) => Work::Pull { id, task },
            Err(err) => reject(owner, err),
        }
    }

    /// Checks out stream `id`. Chunks are served on the spot; iterator
    /// items are pulled on the blocking pool.
    fn begin_next(&mut self, id: &str) -> Result<Step, RunnerError> {
        let stream_id = id
            .parse::<StreamId>()
            .map_err(|_| RunnerError::UnknownStream(id.to_string()))?;

        match self.registry.take(stream_id) {
            Taken::Unknown => Err(RunnerError::UnknownStream(id.to_string())),
            Taken::Busy => Err(RunnerError::StreamBusy(id.to_string())),
            Taken::Stream(Stream::Chunks(mut chunks)) => {
                let next = match chunks.next() {
                    Some(chunk) => {
                        self.registry.restore(stream_id, Stream::Chunks(chunks));
                        NextResponse {
                            is_valid: true,
                            is_raw: true,
                            value: chunk,
                        }
                    }
                    None => {
                        self.registry.remove(stream_id);
                        NextResponse::exhausted()
                    }
                };
                Ok(Step::Ready(next))
            }
            Taken::Stream(Stream::Items(mut items)) => Ok(Step::Pull(
                stream_id,
                tokio::task::spawn_blocking(move || {
                    let item = items.next();
                    (items, item)
                }),
            )),
        }
    }

    fn classify(
        &mut self,
        owner: ConnectionId,
        method: &str,
        invoked: Result<Result<Returned, CallError>, JoinError>,
    ) -> CallResponse {
        let returned = match invoked {
            Ok(Ok(returned)) => returned,
            Ok(Err(err)) => {
                debug!(method = %method, error = %err, "Call raised");
                return CallResponse::error(err);
            }
            Err(_) => {
                warn!(method = %method, "Call panicked");
                return CallResponse::error(format!("'{method}' panicked"));
            }
        };

        match returned {
            Returned::Value(Value::Null) => CallResponse::new(Status::Null, Bytes::new()),
            Returned::Value(value) => match self.codec.encode(&value) {
                Ok(encoded) if encoded.len() > self.chunk_size => {
                    let chunks = split(encoded, self.chunk_size);
                    debug!(method = %method, chunks = chunks.len(), "Result chunked");
                    let id = self.registry.register(owner, Stream::Chunks(chunks));
                    CallResponse::new(Status::Chunked, id.to_string())
                }
                Ok(encoded) => CallResponse::new(Status::Plain, encoded),
                Err(err) => CallResponse::error(err),
            },
            Returned::Iter(items) => {
                let id = self.registry.register(owner, Stream::Items(items));
                CallResponse::new(Status::Iterator, id.to_string())
            }
        }
    }

    /// String items are sent raw; other items are encoded. A stream that
    /// ends, raises, or panics answers once with `is_valid = false` and is
    /// then forgotten.
    fn record_pull(&mut self, id: StreamId, pulled: Result<Pulled, JoinError>) -> NextResponse {
        let (items, item) = match pulled {
            Ok(pulled) => pulled,
            Err(_) => {
                self.registry.remove(id);
                warn!(stream = %id, "Iterator panicked");
                return NextResponse::failed("iterator panicked");
            }
        };

        match item {
            Some(Ok(value)) => match self.encode_item(value) {
                Ok(next) => {
                    self.registry.restore(id, Stream::Items(items));
                    next
                }
                Err(err) => {
                    self.registry.remove(id);
                    NextResponse::failed(err)
                }
            },
            Some(Err(err)) => {
                self.registry.remove(id);
                debug!(stream = %id, error = %err, "Iterator raised");
                NextResponse::failed(err)
            }
            None => {
                self.registry.remove(id);
                NextResponse::exhausted()
            }
        }
    }

    fn encode_item(&self, value: Value) -> Result<NextResponse, CodecError> {
        Ok(match value {
            Value::String(text) => NextResponse {
                is_valid: true,
                is_raw: true,
                value: Bytes::from(text),
            },
            value => NextResponse {
                is_valid: true,
                is_raw: false,
                value: self.codec.encode(&value)?,
            },
        })
    }

    /// Forgets every stream a closed connection left behind.
    pub fn release(&mut self, owner: ConnectionId) {
        let dropped = self.registry.release_owner(owner);
        if dropped > 0 {
            debug!(connection = %owner, streams = dropped, "Released abandoned streams");
        }
    }

    /// Refuses further calls. Streams stay readable.
    pub fn shutdown(&mut self) {
        self.accepting = false;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Number of live streams.
    pub fn open_streams(&self) -> usize {
        self.registry.len()
    }
}

fn reject(owner: ConnectionId, err: RunnerError) -> Work {
    warn!(connection = %owner, error = %err, "Rejected follow-up request");
    Work::Ready(Response::Fault(err.to_string()))
}

impl std::fmt::Debug for WireRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireRunner")
            .field("chunk_size", &self.chunk_size)
            .field("registry", &self.registry)
            .field("accepting", &self.accepting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::{arg_i64, MethodTable};
    use bytes::BytesMut;
    use serde_json::json;

    const CONN: ConnectionId = ConnectionId(1);

    fn runner() -> WireRunner {
        let table = MethodTable::new()
            .method("double", |args| Ok(json!(arg_i64(args, 0)? * 2)))
            .method("nothing", |_| Ok(Value::Null))
            .method("fail", |_| Err(CallError::new("kaput")))
            .method("blob", |args| {
                Ok(json!("x".repeat(arg_i64(args, 0)? as usize)))
            })
            .iterator("range", |args| {
                let n = arg_i64(args, 0)?;
                Ok((0..n).map(|i| json!(i)))
            })
            .iterator("words", |_| Ok(vec![json!("alpha"), json!("beta")]))
            .try_iterator("checked", |_| {
                Ok(vec![Ok(json!(1)), Err(CallError::new("bad item"))])
            })
            .iterator("unstable", |_| {
                Ok((0..3).map(|i| {
                    if i == 1 {
                        panic!("generator blew up");
                    }
                    json!(i)
                }))
            });
        WireRunner::new(Arc::new(table)).with_chunk_size(16)
    }

    async fn serve(runner: &mut WireRunner, owner: ConnectionId, request: Request) -> Response {
        let finished = runner.start(owner, request).wait().await;
        runner.finish(finished)
    }

    async fn call(runner: &mut WireRunner, method: &str, args: Value) -> CallResponse {
        let request = Request::Call {
            method: method.to_string(),
            args: Bytes::from(serde_json::to_vec(&args).unwrap()),
        };
        match serve(runner, CONN, request).await {
            Response::Call(response) => response,
            other => panic!("expected a call response, got {other:?}"),
        }
    }

    async fn next(runner: &mut WireRunner, id: &str) -> Result<NextResponse, String> {
        match serve(runner, CONN, Request::GetNext { id: id.to_string() }).await {
            Response::Next(next) => Ok(next),
            Response::Fault(message) => Err(message),
            other => panic!("expected an item response, got {other:?}"),
        }
    }

    fn stream_id(response: &CallResponse) -> String {
        String::from_utf8(response.result.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_plain_and_null() {
        let mut runner = runner();
        let response = call(&mut runner, "double", json!([4])).await;
        assert_eq!(response, CallResponse::new(Status::Plain, "8"));

        let response = call(&mut runner, "nothing", json!([])).await;
        assert_eq!(response.status, Status::Null);
        assert!(response.result.is_empty());
    }

    #[tokio::test]
    async fn test_error_status() {
        let mut runner = runner();
        let response = call(&mut runner, "fail", json!([])).await;
        assert_eq!(response, CallResponse::new(Status::Error, "kaput"));

        let response = call(&mut runner, "_hidden", json!([])).await;
        assert_eq!(response.status, Status::Error);
        assert!(String::from_utf8_lossy(&response.result).contains("Couldn't run call"));

        let request = Request::Call {
            method: "double".into(),
            args: Bytes::from_static(b"not json"),
        };
        let response = serve(&mut runner, CONN, request).await;
        assert!(matches!(response, Response::Call(r) if r.status == Status::Error));
    }

    #[tokio::test]
    async fn test_iterator_yields_k_valid_then_one_invalid() {
        let mut runner = runner();
        for k in [0usize, 1, 5] {
            let response = call(&mut runner, "range", json!([k])).await;
            assert_eq!(response.status, Status::Iterator);
            let id = stream_id(&response);

            let mut valid = 0;
            loop {
                let item = next(&mut runner, &id).await.unwrap();
                if !item.is_valid {
                    assert_eq!(item.failure(), None);
                    break;
                }
                assert!(!item.is_raw);
                assert_eq!(item.value, serde_json::to_vec(&json!(valid)).unwrap());
                valid += 1;
            }
            assert_eq!(valid, k);
            let fault = next(&mut runner, &id).await.unwrap_err();
            assert!(fault.contains("unknown stream id"));
        }
        assert_eq!(runner.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_string_items_are_raw() {
        let mut runner = runner();
        let response = call(&mut runner, "words", json!([])).await;
        let id = stream_id(&response);

        let first = next(&mut runner, &id).await.unwrap();
        assert!(first.is_valid && first.is_raw);
        assert_eq!(first.value, "alpha");
    }

    #[tokio::test]
    async fn test_item_error_fails_and_forgets_stream() {
        let mut runner = runner();
        let id = stream_id(&call(&mut runner, "checked", json!([])).await);

        assert!(next(&mut runner, &id).await.unwrap().is_valid);
        let failed = next(&mut runner, &id).await.unwrap();
        assert!(!failed.is_valid);
        assert_eq!(failed.failure().as_deref(), Some("bad item"));
        assert_eq!(runner.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_item_panic_fails_and_forgets_stream() {
        let mut runner = runner();
        let id = stream_id(&call(&mut runner, "unstable", json!([])).await);

        assert!(next(&mut runner, &id).await.unwrap().is_valid);
        let failed = next(&mut runner, &id).await.unwrap();
        assert_eq!(failed.failure().as_deref(), Some("iterator panicked"));
        assert_eq!(runner.open_streams(), 0);

        // The runner keeps serving.
        let response = call(&mut runner, "double", json!([2])).await;
        assert_eq!(response, CallResponse::new(Status::Plain, "4"));
    }

    #[tokio::test]
    async fn test_busy_stream_is_refused() {
        let mut runner = runner();
        let id = stream_id(&call(&mut runner, "range", json!([3])).await);

        let first = runner.start(CONN, Request::GetNext { id: id.clone() });
        let fault = next(&mut runner, &id).await.unwrap_err();
        assert!(fault.contains("already being read"));

        let finished = first.wait().await;
        assert!(matches!(runner.finish(finished), Response::Next(n) if n.is_valid));
        assert!(next(&mut runner, &id).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_large_value_is_chunked() {
        let mut runner = runner();
        let response = call(&mut runner, "blob", json!([100])).await;
        assert_eq!(response.status, Status::Chunked);
        let id = stream_id(&response);

        let mut buf = BytesMut::new();
        loop {
            let chunk = next(&mut runner, &id).await.unwrap();
            if !chunk.is_valid {
                break;
            }
            assert!(chunk.is_raw);
            assert!(chunk.value.len() <= 16);
            buf.extend_from_slice(&chunk.value);
        }
        let value: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value, json!("x".repeat(100)));
    }

    #[tokio::test]
    async fn test_small_value_not_chunked() {
        let mut runner = runner();
        // 14 bytes of JSON fits in one 16 byte chunk.
        let response = call(&mut runner, "blob", json!([12])).await;
        assert_eq!(response.status, Status::Plain);
    }

    #[test]
    fn test_chunk_size_is_clamped() {
        let table = Arc::new(MethodTable::new());
        assert_eq!(WireRunner::new(table.clone()).with_chunk_size(0).chunk_size(), 1);
        assert_eq!(
            WireRunner::new(table).with_chunk_size(usize::MAX).chunk_size(),
            MAX_CHUNK_SIZE
        );
    }

    #[tokio::test]
    async fn test_unknown_id_fails_loudly() {
        let mut runner = runner();
        let fault = next(&mut runner, "42").await.unwrap_err();
        assert_eq!(fault, RunnerError::UnknownStream("42".into()).to_string());
        assert!(next(&mut runner, "bogus").await.is_err());
    }

    #[tokio::test]
    async fn test_direct_call_and_get_next() {
        let mut runner = runner();

        let response = runner.call(CONN, "double", b"[4]").await;
        assert_eq!(response, CallResponse::new(Status::Plain, "8"));

        let response = runner.call(CONN, "checked", b"[]").await;
        let id = stream_id(&response);
        let first = runner.get_next(&id).await.unwrap();
        assert!(first.is_valid);
        assert_eq!(&first.value[..], b"1");
        let failed = runner.get_next(&id).await.unwrap();
        assert_eq!(failed.failure().as_deref(), Some("bad item"));

        assert_eq!(
            runner.get_next(&id).await,
            Err(RunnerError::UnknownStream(id.clone()))
        );

        runner.shutdown();
        let refused = runner.call(CONN, "double", b"[4]").await;
        assert_eq!(refused.status, Status::Error);
    }

    #[tokio::test]
    async fn test_release_drops_connection_streams() {
        let mut runner = runner();
        call(&mut runner, "range", json!([3])).await;
        let request = Request::Call {
            method: "range".into(),
            args: Bytes::from_static(b"[3]"),
        };
        serve(&mut runner, ConnectionId(2), request).await;
        assert_eq!(runner.open_streams(), 2);

        runner.release(CONN);
        assert_eq!(runner.open_streams(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_calls() {
        let mut runner = runner();
        runner.shutdown();
        assert!(!runner.is_accepting());
        let response = call(&mut runner, "double", json!([1])).await;
        assert_eq!(response.status, Status::Error);
    }
}
