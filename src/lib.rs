//! # Cortex Memory
//!
//! A local-first, cryptographically verifiable fact store for autonomous
//! agents: bi-temporal facts, a hash-chained ledger with Merkle checkpoints,
//! reputation-weighted multi-agent consensus, hybrid semantic/lexical
//! search, and a lightweight entity/relation graph, all behind one
//! [`Engine`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cortex_memory::{Config, Engine, fact::StoreInput};
//!
//! # async fn run() -> cortex_memory::error::Result<()> {
//! let engine = Engine::open(Config::in_memory())?;
//! engine.init_db().await?;
//!
//! let fact_id = engine.store(StoreInput {
//!     project: "api".into(),
//!     content: "Rate limit is 100/min".into(),
//!     ..Default::default()
//! }).await?;
//!
//! let facts = engine.recall("api", None, 0).await?;
//! assert_eq!(facts.len(), 1);
//! # let _ = fact_id;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`canonical`] — deterministic JSON encoding backing every hash.
//! - [`temporal`] — bi-temporal validity windows and point-in-time queries.
//! - [`storage`] — schema migrations and the bounded async connection pool.
//! - [`fact`] — the fact repository: store/update/deprecate/recall/history.
//! - [`ledger`] — the hash-chained, Merkle-checkpointed audit log.
//! - [`consensus`] — agent registration and reputation-weighted voting.
//! - [`embeddings`] — the embedder collaborator and vector byte storage.
//! - [`search`] — hybrid lexical/semantic search.
//! - [`graph`] — entity/relation extraction and lookup.
//! - [`circuit`] — circuit breaker wrapping embedder/extractor calls.
//! - [`batch`] — write coalescing for contiguous mutations.
//! - [`coordinator`] — [`Engine`], the public operation surface.

pub mod batch;
pub mod canonical;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod embeddings;
pub mod error;
pub mod fact;
pub mod graph;
pub mod ledger;
pub mod search;
pub mod storage;
pub mod temporal;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use coordinator::{Engine, EngineStats};
pub use error::{EngineError, Result};
pub use fact::Fact;
pub use search::{SearchFilters, SearchResult};
