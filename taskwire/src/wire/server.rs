//! Socket front end for a [`WireRunner`].
//!
//! ```text
//!  client ─┐                         ┌──────────────┐
//!  client ─┼─▶ connection tasks ───▶ │ runner loop  │ ──▶ blocking pool
//!  client ─┘   (frame I/O)    mpsc   └──────────────┘     (user code)
//! ```
//!
//! Connection tasks only decode and encode frames; the runner loop owns the
//! [`WireRunner`] and its stream registry and never runs user code itself.
//! When shutdown is signalled the server stops accepting, started calls and
//! pulls finish, their responses are still written, and then everything
//! closes.

use super::descriptor::Descriptor;
use super::protocol::{frame_codec, Request, Response};
use super::registry::ConnectionId;
use super::runner::WireRunner;
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message from a connection task to the runner loop.
enum RunnerMessage {
    Request {
        conn: ConnectionId,
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Disconnected(ConnectionId),
}

/// A bound wire server.
pub struct WireServer {
    listener: UnixListener,
    descriptor: Descriptor,
    runner: WireRunner,
}

impl WireServer {
    /// Binds the descriptor's socket, replacing a stale socket file left by a
    /// previous server.
    pub fn bind(descriptor: &Descriptor, runner: WireRunner) -> io::Result<Self> {
        let path = descriptor.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(descriptor = %descriptor, "Wire server bound");
        Ok(Self {
            listener,
            descriptor: descriptor.clone(),
            runner,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Serves connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            listener,
            descriptor,
            runner,
        } = self;

        let (tx, rx) = mpsc::unbounded_channel();
        let runner_loop = drive_runner(runner, rx, shutdown.clone());
        tokio::pin!(runner_loop);

        let mut connections = JoinSet::new();
        let mut next_conn = 0u64;
        let mut runner_done = false;
        info!(descriptor = %descriptor, "Wire server listening");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_conn += 1;
                        let conn = ConnectionId(next_conn);
                        debug!(connection = %conn, "Connection accepted");
                        connections.spawn(serve_connection(
                            conn,
                            stream,
                            tx.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => warn!(error = %err, "Accept failed"),
                },

                Some(joined) = connections.join_next() => log_connection_exit(joined),

                _ = &mut runner_loop, if !runner_done => {
                    runner_done = true;
                    break;
                }
            }
        }

        info!(descriptor = %descriptor, "Wire server shutting down");
        drop(listener);
        drop(tx);

        let close_connections = async {
            while let Some(joined) = connections.join_next().await {
                log_connection_exit(joined);
            }
        };
        if runner_done {
            close_connections.await;
        } else {
            tokio::join!(&mut runner_loop, close_connections);
        }

        if let Err(err) = std::fs::remove_file(descriptor.path()) {
            debug!(error = %err, "Socket file already gone");
        }
        info!(descriptor = %descriptor, "Wire server stopped");
    }
}

impl std::fmt::Debug for WireServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireServer")
            .field("descriptor", &self.descriptor)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

fn log_connection_exit(joined: Result<io::Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "Connection closed with error"),
        Err(err) => warn!(error = %err, "Connection task failed"),
    }
}

/// Owns the runner until shutdown.
///
/// User code runs on the blocking pool while this loop keeps serving other
/// connections. Requests already started when shutdown fires run to
/// completion and their responses are still delivered.
async fn drive_runner(
    mut runner: WireRunner,
    mut rx: mpsc::UnboundedReceiver<RunnerMessage>,
    shutdown: CancellationToken,
) {
    let mut pending = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                runner.shutdown();
                break;
            }

            Some((finished, reply)) = pending.next() => {
                let _ = oneshot::Sender::<Response>::send(reply, runner.finish(finished));
            }

            message = rx.recv() => match message {
                Some(RunnerMessage::Request { conn, request, reply }) => {
                    let job = runner.start(conn, request);
                    pending.push(async move { (job.wait().await, reply) });
                }
                Some(RunnerMessage::Disconnected(conn)) => runner.release(conn),
                None => break,
            },
        }
    }

    if !pending.is_empty() {
        debug!(in_flight = pending.len(), "Finishing started requests");
    }
    while let Some((finished, reply)) = pending.next().await {
        let _ = reply.send(runner.finish(finished));
    }
}

/// Reads requests from one client and writes back the runner's responses.
async fn serve_connection(
    conn: ConnectionId,
    stream: UnixStream,
    tx: mpsc::UnboundedSender<RunnerMessage>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut framed = Framed::new(stream, frame_codec());

    let result = async {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = framed.next() => frame,
            };
            let Some(frame) = frame else {
                break;
            };

            let response = match Request::decode(frame?.freeze()) {
                Ok(request) => {
                    let (reply, response) = oneshot::channel();
                    let sent = tx.send(RunnerMessage::Request {
                        conn,
                        request,
                        reply,
                    });
                    match sent {
                        // A dropped reply means the runner stopped first.
                        Ok(()) => response
                            .await
                            .unwrap_or_else(|_| Response::Fault("server is shutting down".into())),
                        Err(_) => Response::Fault("server is shutting down".into()),
                    }
                }
                Err(err) => Response::Fault(err.to_string()),
            };
            framed.send(response.encode()).await?;
        }
        Ok::<(), io::Error>(())
    }
    .await;

    let _ = tx.send(RunnerMessage::Disconnected(conn));
    debug!(connection = %conn, "Connection closed");
    result
}
