use crate::state::Status;

/// Everything that can go wrong between accepting a request and handing
/// back a response. Callers match on the variant; the only kind that
/// leaves the worker reusable is [`Error::Exec`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The child never became a worker: it could not be started, or it
    /// exited before completing the handshake. Carries the child's stderr
    /// verbatim.
    #[error("unable to start worker: {stderr}")]
    SpawnFailed { stderr: String },

    /// The child did not dial back and complete the handshake in time.
    #[error("relay timeout")]
    RelayTimeout,

    /// The handshake carried a pid other than the spawned child's. Either
    /// an unrelated process connected to the listener or the child is
    /// misbehaving; both are fatal.
    #[error("pid mismatch: spawned {expected}, handshake answered {actual}")]
    HandshakeMismatch { expected: u32, actual: u32 },

    /// A frame violated the relay protocol.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The child reported a job-level error in its response. The worker
    /// stays usable.
    #[error("{0}")]
    Exec(String),

    /// Relay read/write failed mid-exchange.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// The child died while we were talking to it. Carries its stderr.
    #[error("worker terminated abnormally: {stderr}")]
    Terminated { stderr: String },

    /// The worker was reserved while not in the ready state.
    #[error("worker is not ready ({0})")]
    NotReady(Status),

    /// Reservation gave up: the caller cancelled while waiting.
    #[error("no free workers")]
    NoFreeWorkers,

    /// The pool has been destroyed.
    #[error("pool is closed")]
    PoolClosed,

    /// The in-flight exec was cancelled; the worker's framing is no longer
    /// synchronised and it has been retired.
    #[error("exec cancelled")]
    Cancelled,

    /// An exec failed and retiring the worker afterwards failed too.
    #[error("{error}; stop failed: {stop_error}")]
    StopFailed {
        error: Box<Error>,
        stop_error: Box<Error>,
    },
}

impl Error {
    /// Soft errors were reported by the child itself as part of a complete
    /// response; the worker may serve further requests. Everything else
    /// retires the worker.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::Exec(_))
    }
}
