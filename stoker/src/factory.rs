use crate::error::Error;
use crate::relay::{parse_pid_frame, pid_frame, Relay, RelayStream};
use crate::worker::{spawn_stderr_reader, Worker};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variable telling the child where to dial back.
pub const RELAY_ADDRESS_ENV: &str = "STOKER_RELAY";

/// Pre-bound endpoint workers connect back to. The parent never guesses
/// where the child listens; the child always dials us.
pub enum RelayListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: String },
}

impl RelayListener {
    pub fn from_tcp(listener: TcpListener) -> Self {
        RelayListener::Tcp(listener)
    }

    pub fn from_unix(listener: UnixListener, path: impl Into<String>) -> Self {
        RelayListener::Unix {
            listener,
            path: path.into(),
        }
    }

    /// Address string advertised to children via [`RELAY_ADDRESS_ENV`].
    pub fn relay_address(&self) -> String {
        match self {
            RelayListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{addr}"),
                Err(_) => "tcp://".to_string(),
            },
            RelayListener::Unix { path, .. } => format!("unix://{path}"),
        }
    }

    async fn accept(&self) -> std::io::Result<RelayStream> {
        match self {
            RelayListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(RelayStream::Tcp(stream))
            }
            RelayListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(RelayStream::Unix(stream))
            }
        }
    }
}

/// Turns a command into a live, handshaked [`Worker`]. The seam pools are
/// built against, so tests can substitute allocation strategies.
#[async_trait]
pub trait Factory: Send + Sync {
    async fn spawn_worker(&self, cmd: Command) -> Result<Worker, Error>;
}

/// Spawns a child, waits for it to dial back on the listener within a
/// bounded time and verifies its identity before handing it out.
pub struct SocketFactory {
    listener: RelayListener,
    relay_timeout: Duration,
    // spawns are serialized so concurrent replacements cannot steal each
    // other's dial-backs off the shared listener
    spawn_lock: tokio::sync::Mutex<()>,
}

impl SocketFactory {
    pub fn new(listener: RelayListener, relay_timeout: Duration) -> Self {
        Self {
            listener,
            relay_timeout,
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }
}

enum SpawnOutcome {
    Handshaked(Result<(Relay, u32), Error>),
    TimedOut,
    Exited(std::io::Result<ExitStatus>),
}

#[async_trait]
impl Factory for SocketFactory {
    async fn spawn_worker(&self, mut cmd: Command) -> Result<Worker, Error> {
        let _spawning = self.spawn_lock.lock().await;

        cmd.env(RELAY_ADDRESS_ENV, self.listener.relay_address())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| Error::SpawnFailed {
            stderr: err.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| Error::SpawnFailed {
            stderr: "child exited before it could be observed".to_string(),
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| Error::SpawnFailed {
            stderr: "child stderr was not piped".to_string(),
        })?;
        let (stderr, stderr_task) = spawn_stderr_reader(pid, stderr_pipe);

        debug!(worker.pid = pid, "waiting for worker to dial back");

        let handshake = async {
            let stream = self.listener.accept().await?;
            let mut relay = Relay::new(stream);
            relay.send(pid_frame(std::process::id())).await?;
            let frame = relay.receive().await?;
            let announced = parse_pid_frame(&frame)?;
            Ok((relay, announced))
        };

        // biased: a handshake outcome (good or bad) classifies better than
        // the bare observation that the child is gone
        let outcome = tokio::select! {
            biased;
            result = tokio::time::timeout(self.relay_timeout, handshake) => match result {
                Ok(handshaked) => SpawnOutcome::Handshaked(handshaked),
                Err(_) => SpawnOutcome::TimedOut,
            },
            status = child.wait() => SpawnOutcome::Exited(status),
        };

        match outcome {
            SpawnOutcome::Handshaked(Ok((relay, announced))) if announced == pid => {
                Ok(Worker::start(pid, relay, child, stderr, stderr_task))
            }
            SpawnOutcome::Handshaked(Ok((_, announced))) => {
                reap(&mut child).await;
                Err(Error::HandshakeMismatch {
                    expected: pid,
                    actual: announced,
                })
            }
            SpawnOutcome::Handshaked(Err(err)) => {
                reap(&mut child).await;
                Err(err)
            }
            SpawnOutcome::TimedOut => {
                reap(&mut child).await;
                Err(Error::RelayTimeout)
            }
            SpawnOutcome::Exited(_) => {
                // the child died before connecting; its stderr is the story
                let _ = stderr_task.await;
                let stderr = stderr.lock().unwrap().clone();
                Err(Error::SpawnFailed { stderr })
            }
        }
    }
}

async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
