use crate::config::PoolConfig;
use crate::error::Error;
use crate::events::{Event, EventBus, EventListener, EventsHandler};
use crate::factory::Factory;
use crate::payload::Payload;
use crate::state::Status;
use crate::sync_worker::SyncWorker;
use crate::watcher::WorkerWatcher;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Response a worker sends when it wants to retire after the current
/// request: empty body, this exact context.
pub const STOP_REQUEST: &str = "{\"stop\":true}";

/// Builds the command a new worker is started from.
pub type CommandFactory = Arc<dyn Fn() -> Command + Send + Sync>;

/// Rewrites a request before it is dispatched.
pub type BeforeHook = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;

/// Rewrites a response after dispatch; receives the original request too.
pub type AfterHook = Arc<dyn Fn(&Payload, Payload) -> Payload + Send + Sync>;

/// Produces registered-and-ready workers for the watcher.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn allocate(&self) -> Result<Arc<SyncWorker>, Error>;
}

struct PoolAllocator {
    factory: Arc<dyn Factory>,
    cmd: CommandFactory,
    allocate_timeout: std::time::Duration,
}

#[async_trait]
impl Allocator for PoolAllocator {
    async fn allocate(&self) -> Result<Arc<SyncWorker>, Error> {
        let cmd = (self.cmd)();
        let worker = tokio::time::timeout(self.allocate_timeout, self.factory.spawn_worker(cmd))
            .await
            .map_err(|_| Error::RelayTimeout)??;
        Ok(Arc::new(SyncWorker::new(worker)))
    }
}

/// The pool surface the rest of a host links against. Supervisors and
/// other observers hold this trait, never the concrete pool, so they can
/// be layered on through the event bus alone.
#[async_trait]
pub trait Pool: Send + Sync {
    async fn exec(&self, request: Payload) -> Result<Payload, Error>;

    async fn exec_with_cancellation(
        &self,
        token: &CancellationToken,
        request: Payload,
    ) -> Result<Payload, Error>;

    fn workers(&self) -> Vec<Arc<SyncWorker>>;

    async fn remove_worker(&self, worker: &Arc<SyncWorker>) -> Result<(), Error>;

    fn add_listener(&self, listener: EventListener);

    fn config(&self) -> &PoolConfig;

    async fn destroy(&self);
}

/// Fixed-size pool: allocates its whole fleet up front and keeps it at
/// target size through retirement and replacement.
pub struct StaticPool {
    config: PoolConfig,
    allocator: Arc<dyn Allocator>,
    events: Arc<dyn EventBus>,
    watcher: Arc<WorkerWatcher>,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
}

impl StaticPool {
    /// Spawns and registers `num_workers` workers; any allocation failure
    /// aborts construction. Hooks are appended afterwards with
    /// [`with_before`](Self::with_before) / [`with_after`](Self::with_after)
    /// and are immutable once the pool is shared.
    pub async fn new(
        cmd: CommandFactory,
        factory: Arc<dyn Factory>,
        config: PoolConfig,
    ) -> Result<Self, Error> {
        let config = config.normalized();
        let events: Arc<dyn EventBus> = Arc::new(EventsHandler::new());
        let allocator: Arc<dyn Allocator> = Arc::new(PoolAllocator {
            factory,
            cmd,
            allocate_timeout: config.allocate_timeout,
        });
        let watcher = WorkerWatcher::new(
            allocator.clone(),
            config.num_workers,
            config.destroy_timeout,
            events.clone(),
        );

        let mut workers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            match allocator.allocate().await {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    // a half-built fleet must not outlive the failed pool
                    for worker in workers {
                        worker.kill().await;
                    }
                    return Err(err);
                }
            }
        }
        watcher.add_to_watch(workers);

        info!(
            num_workers = config.num_workers,
            max_jobs = config.max_jobs,
            debug = config.debug,
            "worker pool started"
        );

        Ok(Self {
            config,
            allocator,
            events,
            watcher,
            before: Vec::new(),
            after: Vec::new(),
        })
    }

    pub fn with_before(mut self, hook: BeforeHook) -> Self {
        self.before.push(hook);
        self
    }

    pub fn with_after(mut self, hook: AfterHook) -> Self {
        self.after.push(hook);
        self
    }

    async fn exec_inner(
        &self,
        token: Option<&CancellationToken>,
        mut request: Payload,
    ) -> Result<Payload, Error> {
        if self.config.debug {
            return self.exec_debug(token, request).await;
        }

        for hook in &self.before {
            request = hook(request);
        }

        let reservation_token = token.cloned().unwrap_or_default();
        loop {
            let worker = self.watcher.get_free_worker(&reservation_token).await?;

            let result = match token {
                Some(token) => worker.exec_with_cancellation(token, request.clone()).await,
                None => worker.exec(request.clone()).await,
            };

            match result {
                Ok(response) if is_stop_request(&response) => {
                    // the child asked to retire after this request; swap it
                    // out and transparently retry against a fresh worker
                    debug!(worker.pid = worker.pid(), "worker requested retirement");
                    self.retire_in_place(&worker).await;
                    continue;
                }
                Ok(mut response) => {
                    if self.max_jobs_reached(&worker) {
                        self.retire_and_replace(&worker).await?;
                    } else {
                        self.watcher.push_worker(worker);
                    }
                    for hook in &self.after {
                        response = hook(&request, response);
                    }
                    return Ok(response);
                }
                Err(err) if err.is_soft() => {
                    if self.max_jobs_reached(&worker) {
                        // the job failure still goes to the caller; the
                        // replacement failure only makes it onto the bus
                        if let Err(alloc_err) = self.retire_and_replace(&worker).await {
                            debug!("replacement after soft failure failed: {alloc_err}");
                        }
                    } else {
                        self.watcher.push_worker(worker);
                    }
                    return Err(err);
                }
                Err(err) => {
                    worker.state().set(Status::Invalid);
                    self.events.push(Event::WorkerDestruct { pid: worker.pid() });
                    let stop_result = worker.stop(self.config.destroy_timeout).await;
                    self.watcher.release_worker(&worker);
                    return Err(match stop_result {
                        Err(stop_error) => Error::StopFailed {
                            error: Box::new(err),
                            stop_error: Box::new(stop_error),
                        },
                        Ok(()) => err,
                    });
                }
            }
        }
    }

    /// Retirement that leaves the pid in the live set: the watcher's death
    /// watch replaces the worker once the process is gone. Used for
    /// voluntary (stop-request) retirement.
    async fn retire_in_place(&self, worker: &Arc<SyncWorker>) {
        worker.state().set(Status::Invalid);
        if let Err(err) = worker.stop(self.config.destroy_timeout).await {
            self.events.push(Event::WorkerError {
                pid: worker.pid(),
                error: err.to_string(),
            });
        }
        self.watcher.release_worker(worker);
    }

    /// Max-jobs retirement: deliberate removal plus a synchronous
    /// replacement, so the fleet is back at target size before the
    /// response is returned.
    async fn retire_and_replace(&self, worker: &Arc<SyncWorker>) -> Result<(), Error> {
        debug!(
            worker.pid = worker.pid(),
            num_execs = worker.state().num_execs(),
            "worker reached its job limit, rotating"
        );
        if let Err(err) = self.watcher.remove_worker(worker).await {
            self.events.push(Event::WorkerError {
                pid: worker.pid(),
                error: err.to_string(),
            });
        }
        self.watcher.release_worker(worker);
        self.watcher.allocate_new().await
    }

    fn max_jobs_reached(&self, worker: &Arc<SyncWorker>) -> bool {
        self.config.max_jobs != 0 && worker.state().num_execs() >= self.config.max_jobs
    }

    /// Debug configuration degenerates into allocate-per-exec: a one-shot
    /// worker serves the request and is stopped regardless of outcome.
    async fn exec_debug(
        &self,
        token: Option<&CancellationToken>,
        request: Payload,
    ) -> Result<Payload, Error> {
        let worker = self.allocator.allocate().await?;
        let result = match token {
            Some(token) => worker.exec_with_cancellation(token, request).await,
            None => worker.exec(request).await,
        };
        if let Err(stop_error) = worker.stop(self.config.destroy_timeout).await {
            self.events.push(Event::WorkerError {
                pid: worker.pid(),
                error: stop_error.to_string(),
            });
        }
        result
    }
}

#[async_trait]
impl Pool for StaticPool {
    async fn exec(&self, request: Payload) -> Result<Payload, Error> {
        self.exec_inner(None, request).await
    }

    async fn exec_with_cancellation(
        &self,
        token: &CancellationToken,
        request: Payload,
    ) -> Result<Payload, Error> {
        self.exec_inner(Some(token), request).await
    }

    fn workers(&self) -> Vec<Arc<SyncWorker>> {
        self.watcher.workers_list()
    }

    async fn remove_worker(&self, worker: &Arc<SyncWorker>) -> Result<(), Error> {
        self.watcher.remove_worker(worker).await
    }

    fn add_listener(&self, listener: EventListener) {
        self.events.add_listener(listener);
    }

    fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn destroy(&self) {
        self.watcher.destroy().await;
    }
}

fn is_stop_request(response: &Payload) -> bool {
    response.body.is_empty() && response.context.as_ref() == STOP_REQUEST.as_bytes()
}
