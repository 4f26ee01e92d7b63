//! Client side of one wire connection, with reconnection.
//!
//! A [`WireLink`] owns at most one open connection to a [`Descriptor`]. Each
//! [`round_trip`](WireLink::round_trip) holds the connection exclusively, so
//! requests from a call and from item pulls never interleave.
//!
//! When the connection breaks mid-request the link reconnects to the same
//! descriptor and resends the request. Both steps are bounded by a
//! [`ReconnectPolicy`]; running out of either budget is a [`WireError`].

use super::descriptor::Descriptor;
use super::protocol::{frame_codec, ProtocolError, Request, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Default pause between connection attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Default connection attempts before giving up (about ten seconds).
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 100;

/// Default resends of one request after lost connections.
pub const DEFAULT_RESEND_ATTEMPTS: u32 = 3;

/// Bounds on reconnecting and resending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Pause between connection attempts.
    pub interval: Duration,
    /// Connection attempts per reconnect, at least one.
    pub max_attempts: u32,
    /// How often one request may be resent after a lost connection.
    pub max_resends: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            max_resends: DEFAULT_RESEND_ATTEMPTS,
        }
    }
}

impl From<&crate::config::WireSettings> for ReconnectPolicy {
    fn from(settings: &crate::config::WireSettings) -> Self {
        Self {
            interval: settings.reconnect_interval,
            max_attempts: settings.reconnect_attempts,
            max_resends: settings.resend_attempts,
        }
    }
}

/// Client-side wire failure.
#[derive(Debug, Error)]
pub enum WireError {
    /// Every connection attempt failed.
    #[error("gave up connecting to {descriptor} after {attempts} attempts: {source}")]
    GaveUp {
        descriptor: Descriptor,
        attempts: u32,
        source: io::Error,
    },

    /// The connection kept breaking before a response arrived.
    #[error("connection to {descriptor} lost {resends} times; request abandoned")]
    Unreachable { descriptor: Descriptor, resends: u32 },

    #[error("undecodable response: {0}")]
    Protocol(#[from] ProtocolError),
}

type Connection = Framed<UnixStream, LengthDelimitedCodec>;

/// One reconnecting client connection.
pub struct WireLink {
    descriptor: Descriptor,
    policy: ReconnectPolicy,
    connection: Mutex<Option<Connection>>,
}

impl WireLink {
    /// Creates a link; nothing connects until the first request.
    pub fn new(descriptor: Descriptor, policy: ReconnectPolicy) -> Self {
        Self {
            descriptor,
            policy,
            connection: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Sends `request` and waits for its response, reconnecting and
    /// resending as the policy allows.
    pub async fn round_trip(&self, request: &Request) -> Result<Response, WireError> {
        let frame = request.encode();
        let mut slot = self.connection.lock().await;
        let mut resends = 0;

        loop {
            let mut connection = match slot.take() {
                Some(connection) => connection,
                None => self.connect().await?,
            };

            match exchange(&mut connection, frame.clone()).await {
                Ok(response) => {
                    *slot = Some(connection);
                    return Ok(Response::decode(response)?);
                }
                Err(err) if resends < self.policy.max_resends => {
                    resends += 1;
                    warn!(
                        descriptor = %self.descriptor,
                        error = %err,
                        resend = resends,
                        "Connection lost; reconnecting to resend"
                    );
                }
                Err(err) => {
                    warn!(
                        descriptor = %self.descriptor,
                        error = %err,
                        "Connection lost; giving up"
                    );
                    return Err(WireError::Unreachable {
                        descriptor: self.descriptor.clone(),
                        resends,
                    });
                }
            }
        }
    }

    /// Closes the connection, if open.
    pub async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            debug!(descriptor = %self.descriptor, "Connection closed");
        }
    }

    async fn connect(&self) -> Result<Connection, WireError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match UnixStream::connect(self.descriptor.path()).await {
                Ok(stream) => {
                    if attempts > 1 {
                        info!(descriptor = %self.descriptor, attempts = attempts, "Reconnected");
                    } else {
                        debug!(descriptor = %self.descriptor, "Connected");
                    }
                    return Ok(Framed::new(stream, frame_codec()));
                }
                Err(err) if attempts >= max_attempts => {
                    return Err(WireError::GaveUp {
                        descriptor: self.descriptor.clone(),
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    debug!(
                        descriptor = %self.descriptor,
                        attempt = attempts,
                        error = %err,
                        "Connect failed"
                    );
                    tokio::time::sleep(self.policy.interval).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for WireLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireLink")
            .field("descriptor", &self.descriptor)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

async fn exchange(connection: &mut Connection, frame: Bytes) -> io::Result<Bytes> {
    connection.send(frame).await?;
    match connection.next().await {
        Some(Ok(response)) => Ok(response.freeze()),
        Some(Err(err)) => Err(err),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.interval, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(policy.max_attempts, DEFAULT_RECONNECT_ATTEMPTS);
        assert_eq!(policy.max_resends, DEFAULT_RESEND_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_gives_up_without_server() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = Descriptor::unix(dir.path().join("nobody.sock"));
        let link = WireLink::new(
            descriptor,
            ReconnectPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 3,
                max_resends: 0,
            },
        );

        let err = link
            .round_trip(&Request::GetNext { id: "1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::GaveUp { attempts: 3, .. }));
    }
}
