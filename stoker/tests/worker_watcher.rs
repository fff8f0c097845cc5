use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stoker::events::EventsHandler;
use stoker::factory::{Factory, SocketFactory};
use stoker::pool::Allocator;
use stoker::sync_worker::SyncWorker;
use stoker::watcher::WorkerWatcher;
use stoker::Error;
use test_r::{test, test_dep};
use tokio_util::sync::CancellationToken;

test_r::enable!();

mod common;
use common::{tcp_factory, worker_cmd, Tracing};

#[test_dep]
fn tracing() -> Tracing {
    Tracing::init()
}

struct EchoAllocator {
    factory: SocketFactory,
}

impl EchoAllocator {
    async fn new() -> Self {
        Self {
            factory: tcp_factory(Duration::from_secs(60)).await,
        }
    }
}

#[async_trait]
impl Allocator for EchoAllocator {
    async fn allocate(&self) -> Result<Arc<SyncWorker>, Error> {
        let worker = self.factory.spawn_worker(worker_cmd(&["echo"])).await?;
        Ok(Arc::new(SyncWorker::new(worker)))
    }
}

async fn watcher_with_workers(count: usize) -> Arc<WorkerWatcher> {
    let allocator = Arc::new(EchoAllocator::new().await);
    let watcher = WorkerWatcher::new(
        allocator.clone(),
        count,
        Duration::from_secs(5),
        Arc::new(EventsHandler::new()),
    );
    let mut workers = Vec::with_capacity(count);
    for _ in 0..count {
        workers.push(allocator.allocate().await.unwrap());
    }
    watcher.add_to_watch(workers);
    watcher
}

#[test]
async fn workers_are_handed_out_one_at_a_time(_tracing: &Tracing) {
    let watcher = watcher_with_workers(2).await;
    let token = CancellationToken::new();

    let first = watcher.get_free_worker(&token).await.unwrap();
    let second = watcher.get_free_worker(&token).await.unwrap();
    assert_ne!(first.pid(), second.pid());
    assert_eq!(watcher.workers_list().len(), 2);

    watcher.push_worker(first);
    watcher.push_worker(second);
    let again = watcher.get_free_worker(&token).await.unwrap();
    watcher.push_worker(again);

    watcher.destroy().await;
}

#[test]
async fn stale_free_workers_are_replaced_not_handed_out(_tracing: &Tracing) {
    let watcher = watcher_with_workers(1).await;
    let token = CancellationToken::new();

    let original_pid = {
        let workers = watcher.workers_list();
        workers[0].stop(Duration::from_secs(5)).await.unwrap();
        workers[0].pid()
    };

    // the stopped worker still sits in the free set; the next reservation
    // must skip it and get the replacement the death watch allocates
    let worker = watcher.get_free_worker(&token).await.unwrap();
    assert_ne!(worker.pid(), original_pid);
    watcher.push_worker(worker);

    watcher.destroy().await;
}

#[test]
async fn cancelled_reservation_reports_no_free_workers(_tracing: &Tracing) {
    let watcher = watcher_with_workers(1).await;
    let token = CancellationToken::new();

    // drain the only worker, then cancel while a reservation is pending
    let busy = watcher.get_free_worker(&token).await.unwrap();

    let waiting_token = CancellationToken::new();
    waiting_token.cancel();
    let err = watcher.get_free_worker(&waiting_token).await.unwrap_err();
    assert!(matches!(err, Error::NoFreeWorkers));

    watcher.push_worker(busy);
    watcher.destroy().await;
}

#[test]
async fn removed_workers_are_not_replaced(_tracing: &Tracing) {
    let watcher = watcher_with_workers(1).await;

    let worker = watcher.workers_list().into_iter().next().unwrap();
    watcher.remove_worker(&worker).await.unwrap();
    assert!(watcher.workers_list().is_empty());

    // give a would-be replacement plenty of time to (wrongly) appear
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(watcher.workers_list().is_empty());

    watcher.destroy().await;
}

#[test]
async fn allocate_new_grows_the_live_set(_tracing: &Tracing) {
    let watcher = watcher_with_workers(1).await;

    watcher.allocate_new().await.unwrap();
    assert_eq!(watcher.workers_list().len(), 2);

    watcher.destroy().await;
}

#[test]
async fn destroy_wakes_parked_reservations(_tracing: &Tracing) {
    let watcher = watcher_with_workers(1).await;
    let token = CancellationToken::new();

    // take the only worker, then park a second reservation whose token
    // never fires, exactly what a plain exec does
    let busy = watcher.get_free_worker(&token).await.unwrap();
    let parked = {
        let watcher = watcher.clone();
        tokio::spawn(async move {
            let token = CancellationToken::new();
            watcher.get_free_worker(&token).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let destroyer = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.destroy().await })
    };

    // the parked reservation must resolve as soon as shutdown begins,
    // even though destroy itself is still draining the busy worker
    let err = parked.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::PoolClosed));

    watcher.push_worker(busy);
    destroyer.await.unwrap();
}

#[test]
async fn destroy_is_idempotent_and_closes_reservations(_tracing: &Tracing) {
    let watcher = watcher_with_workers(2).await;

    watcher.destroy().await;
    watcher.destroy().await;

    let token = CancellationToken::new();
    let err = watcher.get_free_worker(&token).await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed));
    assert!(watcher.workers_list().is_empty());
}
