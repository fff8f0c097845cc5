use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool construction options. Everything is fixed once the pool is built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Target fleet size; 0 means one worker per available core.
    pub num_workers: usize,

    /// Retire a worker after this many completed execs; 0 disables the
    /// limit.
    pub max_jobs: u64,

    /// Bound on spawning a worker, dial-back and handshake included.
    #[serde(with = "humantime_serde")]
    pub allocate_timeout: Duration,

    /// Bound on a graceful stop before falling back to a kill.
    #[serde(with = "humantime_serde")]
    pub destroy_timeout: Duration,

    /// Allocate-per-exec mode: no standing fleet, every request gets a
    /// one-shot worker.
    pub debug: bool,

    /// Present when the TTL/memory supervisor should watch this pool.
    pub supervisor: Option<SupervisorConfig>,
}

/// Limits enforced by the supervisor that periodically inspects workers.
/// The supervisor reports violations through the pool's event bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Inspection cadence.
    #[serde(with = "humantime_serde")]
    pub watch_tick: Duration,

    /// Total lifetime allowed per worker; zero disables.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Time a worker may sit idle; zero disables.
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,

    /// Time a single exec may run; zero disables.
    #[serde(with = "humantime_serde")]
    pub exec_ttl: Duration,

    /// Resident memory cap per worker in megabytes; zero disables.
    pub max_worker_memory_mb: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_jobs: 0,
            allocate_timeout: DEFAULT_TIMEOUT,
            destroy_timeout: DEFAULT_TIMEOUT,
            debug: false,
            supervisor: None,
        }
    }
}

impl PoolConfig {
    /// Applies defaults and the debug override. The pool normalizes its
    /// config exactly once, at construction.
    pub fn normalized(mut self) -> Self {
        if self.debug {
            self.num_workers = 0;
            self.max_jobs = 1;
        } else if self.num_workers == 0 {
            self.num_workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.allocate_timeout.is_zero() {
            self.allocate_timeout = DEFAULT_TIMEOUT;
        }
        if self.destroy_timeout.is_zero() {
            self.destroy_timeout = DEFAULT_TIMEOUT;
        }
        self
    }
}

/// Loads a [`PoolConfig`] from a TOML file with `STOKER__`-prefixed
/// environment overrides, e.g. `STOKER__NUM_WORKERS=4`.
pub fn load_config(path: &Path) -> Result<PoolConfig, figment::Error> {
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("STOKER__"))
        .extract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn defaults_fill_in_fleet_size_and_timeouts() {
        let config = PoolConfig::default().normalized();
        assert!(config.num_workers >= 1);
        assert_eq!(config.max_jobs, 0);
        assert_eq!(config.allocate_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.destroy_timeout, DEFAULT_TIMEOUT);
        assert!(config.supervisor.is_none());
    }

    #[test]
    fn debug_mode_forces_one_shot_workers() {
        let config = PoolConfig {
            num_workers: 8,
            max_jobs: 100,
            debug: true,
            ..PoolConfig::default()
        }
        .normalized();
        assert_eq!(config.num_workers, 0);
        assert_eq!(config.max_jobs, 1);
    }

    #[test]
    fn config_parses_from_toml_with_humantime_durations() {
        let config: PoolConfig = Figment::new()
            .merge(Toml::string(
                r#"
                num_workers = 4
                max_jobs = 50
                allocate_timeout = "1m 30s"
                destroy_timeout = "10s"

                [supervisor]
                watch_tick = "1s"
                ttl = "1h"
                idle_ttl = "10m"
                exec_ttl = "30s"
                max_worker_memory_mb = 256
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.max_jobs, 50);
        assert_eq!(config.allocate_timeout, Duration::from_secs(90));
        assert_eq!(config.destroy_timeout, Duration::from_secs(10));
        let supervisor = config.supervisor.unwrap();
        assert_eq!(supervisor.watch_tick, Duration::from_secs(1));
        assert_eq!(supervisor.ttl, Duration::from_secs(3600));
        assert_eq!(supervisor.max_worker_memory_mb, 256);
    }
}
