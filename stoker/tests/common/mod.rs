#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use stoker::factory::{RelayListener, SocketFactory};
use stoker::pool::CommandFactory;
use tokio::net::TcpListener;
use tokio::process::Command;

/// Shared tracing bootstrap, initialized once per test binary.
#[derive(Debug)]
pub struct Tracing;

impl Tracing {
    pub fn init() -> Self {
        stoker::observability::init_tracing("stoker-tests");
        Self
    }
}

/// Command running the child-side test client in the given mode.
pub fn worker_cmd(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_test-worker"));
    cmd.args(args);
    cmd
}

pub fn worker_cmd_factory(args: &'static [&'static str]) -> CommandFactory {
    Arc::new(move || worker_cmd(args))
}

/// Factory listening on an ephemeral local TCP port.
pub async fn tcp_factory(relay_timeout: Duration) -> SocketFactory {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding an ephemeral port");
    SocketFactory::new(RelayListener::from_tcp(listener), relay_timeout)
}
