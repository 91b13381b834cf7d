//! Engine Configuration
//!
//! A plain value injected at construction (see `Engine::open`). Nothing here
//! is reloaded from global state — tests build a fresh `Config` rather than
//! mutating a process-wide singleton.

use std::path::PathBuf;

/// Configuration recognized by the engine. Every field has the default
/// documented in the project README; construct with `Config::default()` and
/// override only the fields a caller cares about.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file. Defaults to `<home>/.cortex/store.db`.
    pub db_path: PathBuf,
    /// Whether `store`/`update` attempt to generate an embedding.
    pub auto_embed: bool,
    /// Bounded connection pool size.
    pub pool_size: usize,
    /// Number of ledger entries between automatic Merkle checkpoints.
    pub merkle_batch_size: u64,
    /// Bounded LRU size for the search/recall result cache.
    pub cache_size_search: usize,
    /// Bounded LRU size for the query-embedding cache.
    pub cache_size_embed: usize,
    /// Batching window for coalescing contiguous writes.
    pub batch_flush_ms: u64,
    /// Maximum operations folded into a single batched commit.
    pub batch_max_ops: usize,
    /// Consecutive external-collaborator failures before the circuit opens.
    pub circuit_failure_threshold: u32,
    /// Timeout applied to embedder/extractor calls.
    pub circuit_timeout_s: u64,
    /// Cooldown before the circuit half-opens for a probe.
    pub circuit_cooldown_s: u64,
    /// Consensus score at/above which a fact's confidence becomes `verified`.
    pub consensus_verified_threshold: f64,
    /// Consensus score at/below which a fact's confidence becomes `disputed`.
    pub consensus_disputed_threshold: f64,
    /// Exponential-moving-average rate for reputation updates.
    pub reputation_learning_rate: f64,
    /// Connection-acquisition timeout.
    pub pool_acquire_timeout_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            auto_embed: true,
            pool_size: 5,
            merkle_batch_size: 1000,
            cache_size_search: 1000,
            cache_size_embed: 100,
            batch_flush_ms: 10,
            batch_max_ops: 100,
            circuit_failure_threshold: 5,
            circuit_timeout_s: 30,
            circuit_cooldown_s: 5,
            consensus_verified_threshold: 1.6,
            consensus_disputed_threshold: 0.4,
            reputation_learning_rate: 0.1,
            pool_acquire_timeout_s: 5,
        }
    }
}

impl Config {
    /// Config pointed at an on-disk path, everything else default. Handy for
    /// CLI-style callers; tests generally prefer `Config::in_memory`.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    /// Config for a private in-memory database — every `Engine::open` call
    /// gets an isolated store. Used by tests and short-lived tooling.
    pub fn in_memory() -> Self {
        Self {
            db_path: PathBuf::from(":memory:"),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }
}

fn default_db_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "cortex") {
        return proj_dirs.data_dir().join("store.db");
    }
    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join(".cortex").join("store.db");
    }
    PathBuf::from(".cortex/store.db")
}
