use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Read a profiled env var: `{PROFILE}_{KEY}` first, then `{KEY}`.
/// Empty values count as unset.
fn profiled_var(profile: &str, key: &str) -> Option<String> {
    let lookup = |k: &str| env::var(k).ok().filter(|v| !v.is_empty());
    if !profile.is_empty() {
        if let Some(v) = lookup(&format!("{profile}_{key}")) {
            return Some(v);
        }
    }
    lookup(key)
}

/// Parse a profiled env var, keeping `default` when unset or malformed.
fn profiled_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_var(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_flag(profile: &str, key: &str) -> bool {
    profiled_var(profile, key)
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub compute: ComputeConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DATAFLOW_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        Self::for_profile(&env::var("DATAFLOW_PROFILE").unwrap_or_default())
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            compute: ComputeConfig::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  compute:  lock_poll={}ms, lock_max_wait={}s, parallel={}, sequential={}",
            self.compute.lock_poll_interval_ms,
            self.compute.lock_max_wait_secs,
            self.compute.max_parallel_processes,
            self.compute.sequential
        );
        tracing::info!(
            "  storage:  backend={}, database={}",
            self.storage.default_backend,
            self.storage.default_database
        );
    }
}

// ── Compute ───────────────────────────────────────────────────

/// Orchestration settings shared by every node of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Interval between polls of a node held by another execution.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// How long past the holder's last heartbeat an awaiter keeps waiting.
    #[serde(default = "default_lock_max_wait_secs")]
    pub lock_max_wait_secs: u64,
    /// Worker count used when a node does not set its own. 0 = available cores.
    #[serde(default)]
    pub max_parallel_processes: usize,
    /// Run every fan-out on the calling thread (debugging).
    #[serde(default)]
    pub sequential: bool,
}

fn default_lock_poll_interval_ms() -> u64 { 2_000 }
fn default_lock_max_wait_secs() -> u64 { 15 * 60 }

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            lock_max_wait_secs: default_lock_max_wait_secs(),
            max_parallel_processes: 0,
            sequential: false,
        }
    }
}

impl ComputeConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            lock_poll_interval_ms: profiled_parse(
                p,
                "LOCK_POLL_INTERVAL_MS",
                default_lock_poll_interval_ms(),
            ),
            lock_max_wait_secs: profiled_parse(p, "LOCK_MAX_WAIT_SECS", default_lock_max_wait_secs()),
            max_parallel_processes: profiled_parse(p, "MAX_PARALLEL_PROCESSES", 0),
            sequential: profiled_flag(p, "COMPUTE_SEQUENTIAL"),
        }
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_max_wait(&self) -> Duration {
        Duration::from_secs(self.lock_max_wait_secs)
    }

    /// Resolve worker count for a node: its own setting wins, then this
    /// config, then available parallelism. Sequential mode always yields 0.
    pub fn resolved_workers(&self, node_setting: Option<usize>) -> usize {
        if self.sequential {
            return 0;
        }
        self.resolved_processors(node_setting)
    }

    /// Processors work is split across, regardless of sequential mode.
    pub fn resolved_processors(&self, node_setting: Option<usize>) -> usize {
        match node_setting.filter(|n| *n > 0) {
            Some(n) => n,
            None if self.max_parallel_processes > 0 => self.max_parallel_processes,
            None => available_processors(),
        }
    }
}

/// Number of cores available to this process (at least 1).
pub fn available_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend id used by data nodes that do not name one.
    pub default_backend: String,
    /// Database used by data nodes that do not name one.
    pub default_database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_backend: "memory".to_string(),
            default_database: "dataflow".to_string(),
        }
    }
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            default_backend: profiled_var(p, "STORAGE_BACKEND").unwrap_or_else(|| "memory".into()),
            default_database: profiled_var(p, "STORAGE_DATABASE")
                .unwrap_or_else(|| "dataflow".into()),
        }
    }
}
