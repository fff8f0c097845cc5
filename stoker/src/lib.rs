//! Supervised pool of out-of-process workers.
//!
//! A pool spawns a fixed fleet of child processes, each of which dials
//! back to the parent on a pre-bound socket and speaks a framed relay
//! protocol. Requests are routed to one worker at a time; workers are
//! retired and replaced on job limits, voluntary stop requests and hard
//! failures, without the caller ever noticing.

#[cfg(test)]
test_r::enable!();

pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod observability;
pub mod payload;
pub mod pool;
pub mod relay;
pub mod state;
pub mod sync_worker;
pub mod watcher;
pub mod worker;

pub use config::{load_config, PoolConfig, SupervisorConfig};
pub use error::Error;
pub use events::{Event, EventBus, EventListener, EventsHandler};
pub use factory::{Factory, RelayListener, SocketFactory, RELAY_ADDRESS_ENV};
pub use payload::Payload;
pub use pool::{Allocator, CommandFactory, Pool, StaticPool, STOP_REQUEST};
pub use state::{Status, WorkerState};
pub use sync_worker::SyncWorker;
pub use watcher::WorkerWatcher;
pub use worker::Worker;
