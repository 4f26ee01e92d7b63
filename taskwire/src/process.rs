//! Spawning and supervising wire server processes.
//!
//! [`ServerManager`] starts a server program once per [`Descriptor`], waits
//! until it is ready to accept connections, and kills it on request. Socket
//! files live in a private temporary directory removed with the manager.

use crate::wire::Descriptor;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default time a server gets to become ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Line fragment a server prints to stdout once it is listening.
pub const READY_MARKER: &str = "listening";

const POLL_INITIAL: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(200);

/// Server process failure.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("server for {descriptor} exited before it was ready: {status}")]
    ExitedEarly {
        descriptor: Descriptor,
        status: String,
    },

    #[error("server for {descriptor} not ready after {waited:?}")]
    NotReady {
        descriptor: Descriptor,
        waited: Duration,
    },

    #[error("no managed server with pid {0}")]
    UnknownPid(u32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

struct Managed {
    child: Child,
    descriptor: Descriptor,
}

/// Owns a set of server processes.
///
/// Each server is started as `program args... <descriptor>`. Children are
/// killed when terminated, on [`done`](ServerManager::done), and when the
/// manager is dropped.
pub struct ServerManager {
    program: OsString,
    args: Vec<OsString>,
    sockets: TempDir,
    next_socket: u32,
    startup_timeout: Duration,
    children: HashMap<u32, Managed>,
}

impl ServerManager {
    pub fn new<I, S>(program: impl Into<OsString>, args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            sockets: tempfile::Builder::new().prefix("taskwire-").tempdir()?,
            next_socket: 0,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            children: HashMap::new(),
        })
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// A fresh socket address inside the manager's private directory.
    pub fn new_descriptor(&mut self) -> Descriptor {
        self.next_socket += 1;
        Descriptor::unix(
            self.sockets
                .path()
                .join(format!("worker-{:03}.sock", self.next_socket)),
        )
    }

    /// Starts a server for `descriptor` and waits until it is ready.
    ///
    /// With `attach_stdio` the server's stdout is read until it prints
    /// [`READY_MARKER`]; otherwise readiness is the socket file appearing.
    pub async fn spawn(
        &mut self,
        descriptor: &Descriptor,
        attach_stdio: bool,
    ) -> Result<u32, ProcessError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(descriptor.to_string())
            .stdin(Stdio::null())
            .stdout(if attach_stdio {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        })?;

        let ready = if attach_stdio {
            self.await_marker(&mut child, descriptor).await
        } else {
            self.await_socket(&mut child, descriptor).await
        };
        if let Err(err) = ready {
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "Kill after failed start");
            }
            return Err(err);
        }

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                let status = child.wait().await?;
                return Err(ProcessError::ExitedEarly {
                    descriptor: descriptor.clone(),
                    status: status.to_string(),
                });
            }
        };
        info!(pid = pid, descriptor = %descriptor, "Server started");
        self.children.insert(
            pid,
            Managed {
                child,
                descriptor: descriptor.clone(),
            },
        );
        Ok(pid)
    }

    /// Kills one server and removes its socket file.
    pub async fn terminate(&mut self, pid: u32) -> Result<(), ProcessError> {
        let mut managed = self
            .children
            .remove(&pid)
            .ok_or(ProcessError::UnknownPid(pid))?;
        managed.child.kill().await?;
        if let Err(err) = std::fs::remove_file(managed.descriptor.path()) {
            debug!(pid = pid, error = %err, "Socket file already gone");
        }
        info!(pid = pid, descriptor = %managed.descriptor, "Server terminated");
        Ok(())
    }

    /// Kills every server still running.
    pub async fn done(&mut self) {
        let pids: Vec<u32> = self.children.keys().copied().collect();
        for pid in pids {
            if let Err(err) = self.terminate(pid).await {
                warn!(pid = pid, error = %err, "Failed to terminate server");
            }
        }
    }

    /// Pids of the servers currently managed.
    pub fn pids(&self) -> Vec<u32> {
        self.children.keys().copied().collect()
    }

    async fn await_marker(
        &self,
        child: &mut Child,
        descriptor: &Descriptor,
    ) -> Result<(), ProcessError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let seen = tokio::time::timeout(self.startup_timeout, async {
            while let Some(line) = lines.next_line().await? {
                debug!(line = %line, "Server output");
                if line.contains(READY_MARKER) {
                    return Ok(true);
                }
            }
            Ok::<bool, io::Error>(false)
        })
        .await;

        match seen {
            Ok(Ok(true)) => {
                // Keep draining so the server never blocks on a full pipe.
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(line = %line, "Server output");
                    }
                });
                Ok(())
            }
            Ok(Ok(false)) => {
                let status = child.wait().await?;
                Err(ProcessError::ExitedEarly {
                    descriptor: descriptor.clone(),
                    status: status.to_string(),
                })
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ProcessError::NotReady {
                descriptor: descriptor.clone(),
                waited: self.startup_timeout,
            }),
        }
    }

    async fn await_socket(
        &self,
        child: &mut Child,
        descriptor: &Descriptor,
    ) -> Result<(), ProcessError> {
        let deadline = Instant::now() + self.startup_timeout;
        let mut pause = POLL_INITIAL;
        loop {
            if descriptor.path().exists() {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                return Err(ProcessError::ExitedEarly {
                    descriptor: descriptor.clone(),
                    status: status.to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::NotReady {
                    descriptor: descriptor.clone(),
                    waited: self.startup_timeout,
                });
            }
            tokio::time::sleep(pause).await;
            pause = (pause * 2).min(POLL_MAX);
        }
    }
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("program", &self.program)
            .field("sockets", &self.sockets.path())
            .field("running", &self.children.len())
            .finish_non_exhaustive()
    }
}
