//! [`Worker`] that runs calls in another process.

use super::codec::{Codec, JsonCodec};
use super::descriptor::Descriptor;
use super::link::{ReconnectPolicy, WireError, WireLink};
use super::protocol::{CallResponse, NextResponse, ProtocolError, Request, Response, Status};
use crate::task::Call;
use crate::worker::{ItemSource, Items, PullFuture, Reply, Worker, WorkerError, WorkerFuture};
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Sends calls to a [`WireServer`](super::WireServer) over its descriptor.
///
/// Chunked results are reassembled before `run` returns. Iterator results
/// come back as [`Items`] that fetch one element per pull, sharing this
/// worker's connection.
pub struct WireWorker {
    name: String,
    link: Arc<WireLink>,
    codec: Arc<dyn Codec>,
}

impl WireWorker {
    pub fn new(descriptor: Descriptor) -> Self {
        Self::with_policy(descriptor, ReconnectPolicy::default())
    }

    pub fn with_policy(descriptor: Descriptor, policy: ReconnectPolicy) -> Self {
        Self {
            name: format!("wire({descriptor})"),
            link: Arc::new(WireLink::new(descriptor, policy)),
            codec: Arc::new(JsonCodec),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn descriptor(&self) -> &Descriptor {
        self.link.descriptor()
    }

    async fn execute(&self, call: Call) -> Result<Reply, WorkerError> {
        let Call { method, args } = call;
        if method.len() > usize::from(u16::MAX) {
            return Err(protocol_error(
                &method,
                ProtocolError::MethodTooLong(method.len()),
            ));
        }

        let args = self
            .codec
            .encode(&Value::Array(args))
            .map_err(|err| protocol_error(&method, err))?;
        let response = self
            .link
            .round_trip(&Request::Call {
                method: method.clone(),
                args,
            })
            .await
            .map_err(|err| link_error(&method, err))?;

        let CallResponse { status, result } = match response {
            Response::Call(response) => response,
            Response::Fault(message) => {
                return Err(WorkerError::Connection {
                    method,
                    reason: message,
                })
            }
            Response::Next(_) => {
                return Err(protocol_error(&method, "item response to a call"));
            }
        };

        match status {
            Status::Plain => {
                let value = self
                    .codec
                    .decode(&result)
                    .map_err(|err| protocol_error(&method, err))?;
                Ok(Reply::Value(value))
            }
            Status::Null => Ok(Reply::Value(Value::Null)),
            Status::Error => Err(WorkerError::Raised {
                method,
                message: String::from_utf8_lossy(&result).into_owned(),
            }),
            Status::Chunked => {
                let id = stream_id(&method, result)?;
                let encoded = self.assemble(&method, id).await?;
                let value = self
                    .codec
                    .decode(&encoded)
                    .map_err(|err| protocol_error(&method, err))?;
                Ok(Reply::Value(value))
            }
            Status::Iterator => {
                let id = stream_id(&method, result)?;
                Ok(Reply::Items(Items::new(RemoteItems {
                    link: Arc::clone(&self.link),
                    codec: Arc::clone(&self.codec),
                    id,
                    method,
                })))
            }
        }
    }

    /// Pulls every chunk of a chunked result and concatenates them.
    async fn assemble(&self, method: &str, id: String) -> Result<Bytes, WorkerError> {
        let mut buf = BytesMut::new();
        let mut chunks = 0usize;
        loop {
            let next = fetch_next(&self.link, method, &id).await?;
            if let Some(message) = next.failure() {
                return Err(WorkerError::Raised {
                    method: method.to_string(),
                    message,
                });
            }
            if !next.is_valid {
                break;
            }
            chunks += 1;
            buf.extend_from_slice(&next.value);
        }
        debug!(method = %method, chunks = chunks, bytes = buf.len(), "Chunked result assembled");
        Ok(buf.freeze())
    }
}

impl Worker for WireWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, call: Call) -> WorkerFuture<'_> {
        Box::pin(self.execute(call))
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.link.close())
    }
}

impl std::fmt::Debug for WireWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireWorker")
            .field("name", &self.name)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

/// Item stream that lives on the server.
///
/// An item the server reports as failed ends the sequence with
/// [`WorkerError::Raised`].
struct RemoteItems {
    link: Arc<WireLink>,
    codec: Arc<dyn Codec>,
    id: String,
    method: String,
}

impl ItemSource for RemoteItems {
    fn pull(&mut self) -> PullFuture<'_> {
        Box::pin(async move {
            let next = fetch_next(&self.link, &self.method, &self.id).await?;
            if let Some(message) = next.failure() {
                return Err(WorkerError::Raised {
                    method: self.method.clone(),
                    message,
                });
            }
            if !next.is_valid {
                return Ok(None);
            }
            if next.is_raw {
                let text = String::from_utf8(next.value.to_vec())
                    .map_err(|_| protocol_error(&self.method, ProtocolError::InvalidUtf8))?;
                return Ok(Some(Value::String(text)));
            }
            self.codec
                .decode(&next.value)
                .map(Some)
                .map_err(|err| protocol_error(&self.method, err))
        })
    }
}

async fn fetch_next(link: &WireLink, method: &str, id: &str) -> Result<NextResponse, WorkerError> {
    let response = link
        .round_trip(&Request::GetNext { id: id.to_string() })
        .await
        .map_err(|err| link_error(method, err))?;
    match response {
        Response::Next(next) => Ok(next),
        Response::Fault(message) => Err(protocol_error(method, message)),
        Response::Call(_) => Err(protocol_error(method, "call response to an item request")),
    }
}

fn stream_id(method: &str, result: Bytes) -> Result<String, WorkerError> {
    String::from_utf8(result.to_vec())
        .map_err(|_| protocol_error(method, ProtocolError::InvalidUtf8))
}

fn protocol_error(method: &str, reason: impl std::fmt::Display) -> WorkerError {
    WorkerError::Protocol {
        method: method.to_string(),
        reason: reason.to_string(),
    }
}

fn link_error(method: &str, err: WireError) -> WorkerError {
    match err {
        WireError::Protocol(err) => protocol_error(method, err),
        other => WorkerError::Connection {
            method: method.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_worker(dir: &tempfile::TempDir) -> WireWorker {
        WireWorker::with_policy(
            Descriptor::unix(dir.path().join("absent.sock")),
            ReconnectPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 2,
                max_resends: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let worker = unreachable_worker(&dir);

        let err = worker.run(Call::bare("ping")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Connection { ref method, .. } if method == "ping"));
    }

    #[tokio::test]
    async fn test_overlong_method_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let worker = unreachable_worker(&dir);

        let method = "m".repeat(usize::from(u16::MAX) + 1);
        let err = worker.run(Call::bare(method)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Protocol { .. }));
    }

    #[test]
    fn test_default_name_mentions_descriptor() {
        let worker = WireWorker::new(Descriptor::unix("/tmp/w.sock"));
        assert_eq!(worker.name(), "wire(unix:/tmp/w.sock)");
        assert_eq!(worker.with_name("w1").name(), "w1");
    }
}
