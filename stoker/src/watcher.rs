use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::state::Status;
use crate::sync_worker::SyncWorker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::Allocator;

// Drain poll cadence while waiting for reserved workers to come home.
const DRAIN_TICK: Duration = Duration::from_millis(50);

/// Owns the live set of workers: hands them out one at a time, takes them
/// back, replaces the dead and tears everything down on destroy.
pub struct WorkerWatcher {
    allocator: Arc<dyn Allocator>,
    events: Arc<dyn EventBus>,
    free_tx: mpsc::Sender<Arc<SyncWorker>>,
    free_rx: Mutex<mpsc::Receiver<Arc<SyncWorker>>>,
    workers: StdMutex<HashMap<u32, Arc<SyncWorker>>>,
    /// Reservations currently in callers' hands.
    reserved: AtomicUsize,
    closed: AtomicBool,
    /// Fired when destroy begins, so reservations and handoffs already
    /// parked on the free channel wake up instead of waiting forever.
    shutdown: CancellationToken,
    destroy_timeout: Duration,
}

impl WorkerWatcher {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        num_workers: usize,
        destroy_timeout: Duration,
        events: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let (free_tx, free_rx) = mpsc::channel(num_workers.max(1));
        Arc::new(Self {
            allocator,
            events,
            free_tx,
            free_rx: Mutex::new(free_rx),
            workers: StdMutex::new(HashMap::new()),
            reserved: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            destroy_timeout,
        })
    }

    /// Registers an initial batch of workers and makes them reservable.
    pub fn add_to_watch(self: &Arc<Self>, workers: Vec<Arc<SyncWorker>>) {
        for worker in workers {
            self.register(worker.clone());
            self.enqueue(worker);
        }
    }

    /// Blocks until a ready worker is available. Every dequeued worker is
    /// revalidated: a parallel stop may have landed while it sat in the
    /// free set, and such corpses must never reach a caller.
    pub async fn get_free_worker(
        &self,
        token: &CancellationToken,
    ) -> Result<Arc<SyncWorker>, Error> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::PoolClosed);
            }

            let mut free_rx = self.free_rx.lock().await;
            let worker = tokio::select! {
                received = free_rx.recv() => match received {
                    Some(worker) => worker,
                    None => return Err(Error::PoolClosed),
                },
                _ = self.shutdown.cancelled() => return Err(Error::PoolClosed),
                _ = token.cancelled() => return Err(Error::NoFreeWorkers),
            };
            drop(free_rx);

            if worker.state().status() != Status::Ready {
                debug!(
                    worker.pid = worker.pid(),
                    "discarding stale worker from the free set ({})",
                    worker.state().status()
                );
                continue;
            }

            self.reserved.fetch_add(1, Ordering::SeqCst);
            return Ok(worker);
        }
    }

    /// Returns a reserved worker to the free set. Anything not ready is
    /// dropped on the floor: the caller was supposed to have retired it,
    /// and the death watch owns the rest.
    pub fn push_worker(&self, worker: Arc<SyncWorker>) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        if worker.state().status() != Status::Ready {
            return;
        }
        self.enqueue(worker);
    }

    /// Ends a reservation whose worker was retired in place (the pid stays
    /// in the live set so the death watch replaces it once the process is
    /// gone).
    pub fn release_worker(&self, _worker: &Arc<SyncWorker>) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }

    /// Spawns one replacement, registers it and makes it reservable.
    pub async fn allocate_new(self: &Arc<Self>) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        match self.allocator.allocate().await {
            Ok(worker) => {
                if self.closed.load(Ordering::SeqCst) {
                    // destroy won the race while we were spawning
                    worker.kill().await;
                    return Err(Error::PoolClosed);
                }
                info!(worker.pid = worker.pid(), "allocated replacement worker");
                self.register(worker.clone());
                self.enqueue(worker);
                Ok(())
            }
            Err(err) => {
                self.events.push(Event::PoolError {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Deliberate removal: the worker leaves the live set first (so the
    /// death watch stays quiet), then is invalidated and stopped. No
    /// replacement is made; that is the caller's decision.
    pub async fn remove_worker(&self, worker: &Arc<SyncWorker>) -> Result<(), Error> {
        self.workers.lock().unwrap().remove(&worker.pid());
        worker.state().set(Status::Invalid);
        worker.stop(self.destroy_timeout).await
    }

    /// Drains and tears down. Safe to call more than once; later calls are
    /// no-ops.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // wake everything parked on the free channel before draining
        self.shutdown.cancel();

        let drained = tokio::time::timeout(self.destroy_timeout, async {
            while self.reserved.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(DRAIN_TICK).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("destroy timed out waiting for in-flight execs; stopping anyway");
        }

        let workers: Vec<Arc<SyncWorker>> = {
            let mut map = self.workers.lock().unwrap();
            map.drain().map(|(_, worker)| worker).collect()
        };

        let timeout = self.destroy_timeout;
        futures::future::join_all(workers.iter().map(|worker| async move {
            if let Err(err) = worker.stop(timeout).await {
                debug!(worker.pid = worker.pid(), "stop during destroy: {err}");
            }
        }))
        .await;

        // a replacement may have slipped into the live set while the fleet
        // was being stopped; sweep until nothing is left
        loop {
            let stragglers: Vec<Arc<SyncWorker>> = {
                let mut map = self.workers.lock().unwrap();
                map.drain().map(|(_, worker)| worker).collect()
            };
            if stragglers.is_empty() {
                break;
            }
            for worker in stragglers {
                worker.kill().await;
            }
        }

        info!("worker watcher destroyed");
    }

    /// Snapshot of the live set, free and busy alike.
    pub fn workers_list(&self) -> Vec<Arc<SyncWorker>> {
        self.workers.lock().unwrap().values().cloned().collect()
    }

    fn register(self: &Arc<Self>, worker: Arc<SyncWorker>) {
        self.workers
            .lock()
            .unwrap()
            .insert(worker.pid(), worker.clone());
        self.spawn_death_watch(worker);
    }

    fn enqueue(&self, worker: Arc<SyncWorker>) {
        if let Err(mpsc::error::TrySendError::Full(worker)) = self.free_tx.try_send(worker) {
            // a stopped worker can occupy its slot until a reservation
            // drains and discards it; hand the replacement over as soon as
            // capacity frees up instead of blocking the caller. Once
            // destroy begins nothing drains the channel anymore, so the
            // handoff gives up and puts the worker down instead.
            let free_tx = self.free_tx.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = free_tx.send(worker.clone()) => {}
                    _ = shutdown.cancelled() => {
                        worker.kill().await;
                    }
                }
            });
        }
    }

    /// Watches one worker until its process exits. An exit while the pid
    /// is still in the live set was not a deliberate removal, so the
    /// watcher reaps the corpse and allocates its replacement on the
    /// long-lived background path, out of any caller's cancellation scope.
    fn spawn_death_watch(self: &Arc<Self>, worker: Arc<SyncWorker>) {
        let watcher: Weak<Self> = Arc::downgrade(self);
        let events = self.events.clone();
        tokio::spawn(async move {
            let pid = worker.pid();
            if let Err(err) = worker.wait().await {
                events.push(Event::WorkerError {
                    pid,
                    error: err.to_string(),
                });
            }

            let Some(watcher) = watcher.upgrade() else {
                return;
            };
            if watcher.closed.load(Ordering::SeqCst) {
                return;
            }
            if watcher.workers.lock().unwrap().remove(&pid).is_none() {
                // removed deliberately; nothing to replace
                return;
            }

            debug!(worker.pid = pid, "worker left the live set, replacing");
            if let Err(err) = watcher.allocate_new().await {
                warn!("failed to replace worker {pid}: {err}");
            }
        });
    }
}
