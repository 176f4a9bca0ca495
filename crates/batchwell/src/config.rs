//! Runtime configuration for the indexer.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WORKER_THREADS: usize = 4;
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;
const DEFAULT_GC_PRUNE_MAX_SECS: u64 = 3600;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Knobs for the worker pool and GC loop.
#[derive(Clone, Copy, Debug)]
pub struct IndexerConfig {
    /// Number of collection-affine worker threads; also the shard count.
    pub worker_threads: usize,
    /// Minimum time between GC sweeps over the in-flight table.
    pub gc_interval: Duration,
    /// Age after which an unfinished batch is pruned together with its
    /// persisted chunks. Must be sized well above handler latency.
    pub gc_prune_max: Duration,
    /// Sleep used by polled waits (idle workers, the legacy drain wait).
    pub poll_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            gc_prune_max: Duration::from_secs(DEFAULT_GC_PRUNE_MAX_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl IndexerConfig {
    /// Defaults with `BATCHWELL_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            worker_threads: read_env_usize("BATCHWELL_WORKER_THREADS", DEFAULT_WORKER_THREADS)
                .max(1),
            gc_interval: Duration::from_secs(read_env_u64(
                "BATCHWELL_GC_INTERVAL_SECS",
                DEFAULT_GC_INTERVAL_SECS,
            )),
            gc_prune_max: Duration::from_secs(read_env_u64(
                "BATCHWELL_GC_PRUNE_MAX_SECS",
                DEFAULT_GC_PRUNE_MAX_SECS,
            )),
            poll_interval: Duration::from_millis(read_env_u64(
                "BATCHWELL_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )),
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}
