use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle position of a single worker.
///
/// `Stopped` and `Errored` are terminal; once a worker reaches either,
/// its status never moves back to a live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Created but not yet registered with a watcher.
    Inactive = 0,
    /// Registered and eligible for reservation.
    Ready = 1,
    /// Serving exactly one request.
    Working = 2,
    /// No longer usable, pending stop.
    Invalid = 3,
    /// Deliberately stopped.
    Stopped = 4,
    /// Died abnormally.
    Errored = 5,
}

impl Status {
    fn from_u32(value: u32) -> Status {
        match value {
            0 => Status::Inactive,
            1 => Status::Ready,
            2 => Status::Working,
            3 => Status::Invalid,
            4 => Status::Stopped,
            _ => Status::Errored,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Errored)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Inactive => "inactive",
            Status::Ready => "ready",
            Status::Working => "working",
            Status::Invalid => "invalid",
            Status::Stopped => "stopped",
            Status::Errored => "errored",
        };
        write!(f, "{name}")
    }
}

/// Mutable per-worker record shared between the watcher, the pool and the
/// worker's own monitor task. All fields are atomics so status reads stay
/// cheap on the hot path.
#[derive(Debug)]
pub struct WorkerState {
    status: AtomicU32,
    num_execs: AtomicU64,
    last_used: AtomicU64,
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(Status::Inactive as u32),
            num_execs: AtomicU64::new(0),
            last_used: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u32(self.status.load(Ordering::SeqCst))
    }

    /// Sets the status. A terminal status is sticky: further writes are
    /// ignored so a stop racing a crash cannot resurrect the worker.
    pub fn set(&self, status: Status) {
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if Status::from_u32(current).is_terminal() {
                return;
            }
            match self.status.compare_exchange(
                current,
                status as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Atomically moves `from` to `to`; the admission gate that keeps a
    /// worker serving at most one request at a time.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.status
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::SeqCst)
    }

    /// Counts one completed request/response round-trip. The counter only
    /// ever grows; replacements start over from zero.
    pub fn register_exec(&self) {
        self.num_execs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_used.store(now, Ordering::SeqCst);
    }

    /// Unix timestamp (seconds) of the last exec, 0 if never used.
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::SeqCst)
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}
