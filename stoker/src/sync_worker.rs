use crate::error::Error;
use crate::payload::Payload;
use crate::relay::Frame;
use crate::state::{Status, WorkerState};
use crate::worker::Worker;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// How long to wait for the exit outcome when a transport failure smells
// like a dead child, before giving up on enriching the error.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Strict request/response wrapper around a [`Worker`]: at most one exec is
/// ever in flight, enforced by the ready→working admission gate.
pub struct SyncWorker {
    worker: Worker,
}

impl SyncWorker {
    pub fn new(worker: Worker) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn pid(&self) -> u32 {
        self.worker.pid()
    }

    pub fn state(&self) -> &WorkerState {
        self.worker.state()
    }

    pub async fn wait(&self) -> Result<(), Error> {
        self.worker.wait().await
    }

    pub async fn stop(&self, timeout: Duration) -> Result<(), Error> {
        self.worker.stop(timeout).await
    }

    pub async fn kill(&self) {
        self.worker.kill().await
    }

    /// One request/response round-trip. The worker must be ready; a soft
    /// (child-reported) failure leaves it ready for the next request, any
    /// transport failure invalidates it.
    pub async fn exec(&self, request: Payload) -> Result<Payload, Error> {
        self.exec_impl(request).await
    }

    /// Like [`exec`](Self::exec), but aborts when `token` fires. After a
    /// cancellation the relay framing is out of sync with the child, so
    /// the worker is forced invalid and must be retired by the caller.
    pub async fn exec_with_cancellation(
        &self,
        token: &CancellationToken,
        request: Payload,
    ) -> Result<Payload, Error> {
        tokio::select! {
            result = self.exec_impl(request) => result,
            _ = token.cancelled() => {
                self.worker.state().set(Status::Invalid);
                Err(Error::Cancelled)
            }
        }
    }

    async fn exec_impl(&self, request: Payload) -> Result<Payload, Error> {
        let state = self.worker.state();
        if !state.transition(Status::Ready, Status::Working) {
            return Err(Error::NotReady(state.status()));
        }
        state.touch();

        match self.exchange(request).await {
            Ok(frame) if frame.is_job_error() => {
                // the child answered, just with a failure: a complete exec
                state.set(Status::Ready);
                state.register_exec();
                Err(Error::Exec(
                    String::from_utf8_lossy(&frame.body).into_owned(),
                ))
            }
            Ok(frame) => {
                state.set(Status::Ready);
                state.register_exec();
                Ok(frame.into_payload())
            }
            Err(err) => {
                state.set(Status::Invalid);
                Err(self.enrich_transport_error(err).await)
            }
        }
    }

    async fn exchange(&self, request: Payload) -> Result<Frame, Error> {
        let mut relay = self.worker.relay().lock().await;
        relay.send(Frame::from_payload(&request)).await?;
        relay.receive().await
    }

    /// A mid-exec transport failure usually means the child died; fold its
    /// stderr into the error so callers see what the process printed.
    async fn enrich_transport_error(&self, err: Error) -> Error {
        match err {
            Error::Transport(_) => match self.worker.terminated_error(EXIT_GRACE).await {
                Some(terminated) => terminated,
                None => err,
            },
            other => other,
        }
    }
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.worker.fmt(f)
    }
}
