use crate::error::Error;
use crate::pool::STOP_REQUEST;
use crate::relay::{Frame, Relay};
use crate::state::{Status, WorkerState};
use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How the child process ended.
#[derive(Debug, Clone)]
pub(crate) struct ExitOutcome {
    pub success: bool,
    pub stderr: String,
}

/// One supervised child process: its relay, its state record and a monitor
/// task that owns the OS handle and reaps the exit.
pub struct Worker {
    pid: u32,
    created: Instant,
    state: Arc<WorkerState>,
    relay: Mutex<Relay>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    kill: mpsc::Sender<()>,
}

impl Worker {
    /// Takes ownership of a freshly handshaked child. The monitor task
    /// drives `wait()`, drains the stderr reader and publishes the exit
    /// outcome; nothing else ever touches the `Child` again.
    pub(crate) fn start(
        pid: u32,
        relay: Relay,
        mut child: Child,
        stderr: Arc<StdMutex<String>>,
        stderr_task: JoinHandle<()>,
    ) -> Self {
        let state = Arc::new(WorkerState::new());
        state.set(Status::Ready);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    result = child.wait() => break result,
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            };
            // the pipe is closed by now; make sure every line landed
            let _ = stderr_task.await;
            let stderr = stderr.lock().unwrap().clone();
            let outcome = match status {
                Ok(status) => {
                    debug!(worker.pid = pid, "worker exited: {status}");
                    ExitOutcome {
                        success: status.success(),
                        stderr,
                    }
                }
                Err(err) => {
                    debug!(worker.pid = pid, "failed to reap worker: {err}");
                    ExitOutcome {
                        success: false,
                        stderr,
                    }
                }
            };
            let _ = exit_tx.send(Some(outcome));
        });

        Self {
            pid,
            created: Instant::now(),
            state,
            relay: Mutex::new(relay),
            exit: exit_rx,
            kill: kill_tx,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created
    }

    pub(crate) fn relay(&self) -> &Mutex<Relay> {
        &self.relay
    }

    /// Blocks until the child exits. A deliberate stop resolves to `Ok`;
    /// an abnormal exit marks the worker errored and surfaces the child's
    /// stderr verbatim.
    pub async fn wait(&self) -> Result<(), Error> {
        let outcome = self.exit_outcome().await?;
        if outcome.success || self.state.status() == Status::Stopped {
            self.state.set(Status::Stopped);
            Ok(())
        } else {
            self.state.set(Status::Errored);
            Err(Error::Terminated {
                stderr: outcome.stderr,
            })
        }
    }

    /// Asks the child to retire by sending the stop control frame, then
    /// waits up to `timeout` before falling back to a kill.
    pub async fn stop(&self, timeout: Duration) -> Result<(), Error> {
        if self.state.status().is_terminal() {
            return Ok(());
        }
        // mark first so every observer treats the exit as deliberate
        self.state.set(Status::Stopped);

        let graceful = async {
            let mut relay = self.relay.lock().await;
            if let Err(err) = relay.send(Frame::control(STOP_REQUEST)).await {
                debug!(worker.pid = self.pid, "stop frame not delivered: {err}");
            }
            drop(relay);
            let _ = self.exit_outcome().await;
        };

        match tokio::time::timeout(timeout, graceful).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(worker.pid = self.pid, "worker ignored stop request, killing");
                self.kill().await;
                Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("worker {} did not stop in {timeout:?}; killed", self.pid),
                )))
            }
        }
    }

    /// Unconditional termination.
    pub async fn kill(&self) {
        self.state.set(Status::Stopped);
        let _ = self.kill.try_send(());
        let _ = self.exit_outcome().await;
    }

    async fn exit_outcome(&self) -> Result<ExitOutcome, Error> {
        let mut rx = self.exit.clone();
        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| {
                Error::Transport(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "worker monitor went away",
                ))
            })?
            .clone();
        match outcome {
            Some(outcome) => Ok(outcome),
            None => Err(Error::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker monitor went away",
            ))),
        }
    }

    /// If the child is already dead (or dies within `grace`), returns the
    /// terminal error describing it. Used to fold the child's stderr into
    /// transport failures observed mid-exec.
    pub(crate) async fn terminated_error(&self, grace: Duration) -> Option<Error> {
        let mut rx = self.exit.clone();
        let result = match tokio::time::timeout(grace, rx.wait_for(|outcome| outcome.is_some())).await {
            Ok(Ok(outcome)) => match outcome.clone() {
                Some(outcome) if !outcome.success => Some(Error::Terminated {
                    stderr: outcome.stderr,
                }),
                _ => None,
            },
            _ => None,
        };
        result
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("status", &self.state.status())
            .field("num_execs", &self.state.num_execs())
            .finish()
    }
}

/// Streams the child's stderr into a shared buffer while re-logging each
/// line, so boot failures and crashes keep their original text.
pub(crate) fn spawn_stderr_reader(
    pid: u32,
    stderr: ChildStderr,
) -> (Arc<StdMutex<String>>, JoinHandle<()>) {
    let buffer = Arc::new(StdMutex::new(String::new()));
    let sink = buffer.clone();
    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(worker.pid = pid, "{line}");
            let mut buffer = sink.lock().unwrap();
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(&line);
        }
    });
    (buffer, task)
}
