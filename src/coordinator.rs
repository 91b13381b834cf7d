//! Engine (C12)
//!
//! The public surface: composes storage, facts, the ledger, consensus,
//! search, the graph index, and embeddings behind one handle. Writes go
//! through a single `WriteBatcher` (serialized, one ledger entry per
//! mutation); embedder/extractor calls run outside that path behind their
//! own `CircuitBreaker` so a misbehaving collaborator degrades `store`
//! rather than blocking it. Bounded LRU caches sit in front of `search` and
//! `recall`, invalidated per-project on any mutation to that project.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::embeddings::{Embedder, NullEmbedder};
use crate::error::Result;
use crate::fact::{self, Fact};
use crate::graph::{self, NullExtractor};
use crate::ledger;
use crate::consensus;
use crate::search::{self, SearchFilters, SearchResult};
use crate::storage::Pool;
use crate::batch::WriteBatcher;

#[cfg(feature = "embeddings")]
use crate::embeddings::local::LocalEmbedder;
use crate::graph::Extractor;

#[cfg(feature = "vector-search")]
use crate::search::vector::VectorIndex;

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub active_facts: i64,
    pub total_facts: i64,
    pub ledger_entries: i64,
    pub agents: i64,
    pub entities: i64,
}

struct Caches {
    search: Mutex<HashMap<String, LruCache<String, Vec<SearchResult>>>>,
    recall: Mutex<HashMap<String, LruCache<String, Vec<Fact>>>>,
    embed: Mutex<LruCache<String, Vec<f32>>>,
    search_cap: NonZeroUsize,
    recall_cap: NonZeroUsize,
}

fn search_key(filters: &SearchFilters, query: &str, top_k: usize) -> String {
    format!("{query}|{top_k}|{:?}|{:?}|{:?}", filters.fact_type, filters.tags, filters.as_of)
}

fn recall_key(limit: Option<i64>, offset: i64) -> String {
    format!("{limit:?}|{offset}")
}

impl Caches {
    fn new(search_cap: usize, recall_cap: usize, embed_cap: usize) -> Self {
        Self {
            search: Mutex::new(HashMap::new()),
            recall: Mutex::new(HashMap::new()),
            embed: Mutex::new(LruCache::new(NonZeroUsize::new(embed_cap.max(1)).unwrap())),
            search_cap: NonZeroUsize::new(search_cap.max(1)).unwrap(),
            recall_cap: NonZeroUsize::new(recall_cap.max(1)).unwrap(),
        }
    }

    /// Only project-scoped searches are cached: an unscoped query spans
    /// every project, and invalidating it correctly on a single project's
    /// mutation would mean tracking cross-project membership this cache
    /// isn't built to do.
    fn get_search(&self, filters: &SearchFilters, query: &str, top_k: usize) -> Option<Vec<SearchResult>> {
        let project = filters.project.as_ref()?;
        let key = search_key(filters, query, top_k);
        let mut guard = self.search.lock().expect("cache mutex poisoned");
        guard.get_mut(project).and_then(|bucket| bucket.get(&key).cloned())
    }

    fn put_search(&self, filters: &SearchFilters, query: &str, top_k: usize, results: Vec<SearchResult>) {
        let Some(project) = filters.project.clone() else { return };
        let key = search_key(filters, query, top_k);
        let mut guard = self.search.lock().expect("cache mutex poisoned");
        let bucket = guard.entry(project).or_insert_with(|| LruCache::new(self.search_cap));
        bucket.put(key, results);
    }

    fn get_recall(&self, project: &str, key: &str) -> Option<Vec<Fact>> {
        let mut guard = self.recall.lock().expect("cache mutex poisoned");
        guard.get_mut(project).and_then(|bucket| bucket.get(key).cloned())
    }

    fn put_recall(&self, project: &str, key: String, facts: Vec<Fact>) {
        let mut guard = self.recall.lock().expect("cache mutex poisoned");
        let bucket = guard.entry(project.to_string()).or_insert_with(|| LruCache::new(self.recall_cap));
        bucket.put(key, facts);
    }

    fn get_embed(&self, query: &str) -> Option<Vec<f32>> {
        self.embed.lock().expect("cache mutex poisoned").get(query).cloned()
    }

    fn put_embed(&self, query: &str, vector: Vec<f32>) {
        self.embed.lock().expect("cache mutex poisoned").put(query.to_string(), vector);
    }

    fn invalidate_project(&self, project: &str) {
        self.search.lock().expect("cache mutex poisoned").remove(project);
        self.recall.lock().expect("cache mutex poisoned").remove(project);
    }
}

#[cfg(feature = "embeddings")]
fn default_embedder() -> Arc<dyn Embedder> {
    Arc::new(LocalEmbedder)
}

#[cfg(not(feature = "embeddings"))]
fn default_embedder() -> Arc<dyn Embedder> {
    Arc::new(NullEmbedder)
}

/// The engine. Cheap to clone the handle types it hands out (`Pool`,
/// `WriteBatcher`) but `Engine` itself is meant to be wrapped in one `Arc`
/// per process and shared.
pub struct Engine {
    pool: Arc<Pool>,
    config: Config,
    clock: Arc<dyn Clock>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn Extractor>,
    embed_circuit: CircuitBreaker,
    extract_circuit: CircuitBreaker,
    batcher: WriteBatcher,
    #[cfg(feature = "vector-search")]
    vector_index: tokio::sync::RwLock<Option<VectorIndex>>,
    caches: Caches,
}

impl Engine {
    /// Open with the system clock and the default embedder/extractor for
    /// whichever features are compiled in (`LocalEmbedder`/`NullEmbedder`,
    /// always `NullExtractor` until a real extractor ships).
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(SystemClock), default_embedder(), Arc::new(NullExtractor))
    }

    /// Open with explicit collaborators. Tests inject a `FixedClock` and,
    /// where relevant, a scripted `Embedder`/`Extractor`.
    pub fn open_with(
        config: Config,
        clock: Arc<dyn Clock>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        let pool = Arc::new(Pool::open(
            &config.db_path,
            config.pool_size,
            Duration::from_secs(config.pool_acquire_timeout_s),
        )?);
        let batcher = WriteBatcher::spawn(
            Arc::clone(&pool),
            Duration::from_millis(config.batch_flush_ms),
            config.batch_max_ops,
        );
        let caches = Caches::new(config.cache_size_search, config.cache_size_search, config.cache_size_embed);
        let embed_circuit = CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_cooldown_s);
        let extract_circuit = CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_cooldown_s);

        Ok(Self {
            pool,
            config,
            clock,
            embedder,
            extractor,
            embed_circuit,
            extract_circuit,
            batcher,
            #[cfg(feature = "vector-search")]
            vector_index: tokio::sync::RwLock::new(None),
            caches,
        })
    }

    /// Run pending migrations (a no-op past the first call, already applied
    /// at `Pool::open` time) and rebuild the in-memory vector index from
    /// `fact_embeddings`. Call once after construction, before the first
    /// `search`.
    pub async fn init_db(&self) -> Result<()> {
        self.pool.with_connection(|conn| crate::storage::migrations::apply_migrations(conn)).await?;

        #[cfg(feature = "vector-search")]
        {
            let rows = self.pool.with_connection(|conn| crate::embeddings::load_all_embeddings(conn)).await?;
            let index = VectorIndex::new()?;
            index.reserve(rows.len().max(16))?;
            for (fact_id, vector) in rows {
                index.add(fact_id, &vector)?;
            }
            *self.vector_index.write().await = Some(index);
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `embedder.embed` off the async executor, behind its circuit
    /// breaker. Any failure (disabled, circuit open, embedder error, panic)
    /// is logged and folded into `None` — never propagated to the caller.
    async fn embed_if_enabled(&self, text: &str, now: DateTime<Utc>) -> Option<Vec<f32>> {
        if !self.config.auto_embed {
            return None;
        }
        if !self.embed_circuit.allow(now) {
            tracing::warn!("embedder circuit open, storing fact without an embedding");
            return None;
        }
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
        let timeout = Duration::from_secs(self.config.circuit_timeout_s);
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || embedder.embed(&text))).await {
            Ok(Ok(Ok(vector))) => {
                self.embed_circuit.record_success();
                Some(vector)
            }
            Ok(Ok(Err(e))) => {
                self.embed_circuit.record_failure(now);
                tracing::warn!(error = %e, "embedding generation failed");
                None
            }
            Ok(Err(e)) => {
                self.embed_circuit.record_failure(now);
                tracing::warn!(error = %e, "embedding task panicked");
                None
            }
            Err(_) => {
                self.embed_circuit.record_failure(now);
                tracing::warn!("embedding call timed out");
                None
            }
        }
    }

    async fn extract_if_enabled(&self, content: &str, project: &str, now: DateTime<Utc>) -> Option<graph::Extraction> {
        if !self.extract_circuit.allow(now) {
            tracing::warn!("extractor circuit open, storing fact without graph extraction");
            return None;
        }
        let extractor = Arc::clone(&self.extractor);
        let content = content.to_string();
        let project = project.to_string();
        let timeout = Duration::from_secs(self.config.circuit_timeout_s);
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || extractor.extract(&content, &project, now))).await {
            Ok(Ok(Ok(extraction))) => {
                self.extract_circuit.record_success();
                Some(extraction)
            }
            Ok(Ok(Err(e))) => {
                self.extract_circuit.record_failure(now);
                tracing::warn!(error = %e, "entity extraction failed");
                None
            }
            Ok(Err(e)) => {
                self.extract_circuit.record_failure(now);
                tracing::warn!(error = %e, "extraction task panicked");
                None
            }
            Err(_) => {
                self.extract_circuit.record_failure(now);
                tracing::warn!("extraction call timed out");
                None
            }
        }
    }

    /// Store a new fact. Embedding and extraction are best-effort collaborators:
    /// their failure never blocks the fact row or its ledger entry from committing.
    pub async fn store(&self, input: fact::StoreInput) -> Result<i64> {
        let now = self.now();
        let project = input.project.clone();
        let embedding = self.embed_if_enabled(&input.content, now).await;
        let extraction = self.extract_if_enabled(&input.content, &project, now).await;
        let embedding_for_index = embedding.clone();
        let merkle_batch_size = self.config.merkle_batch_size;
        let project_for_ledger = project.clone();

        let value = self
            .batcher
            .submit(move |tx| {
                let fact_id = fact::store(tx, input, now)?;
                fact::record_store_ledger_entry(tx, fact_id, &project_for_ledger, now, merkle_batch_size)?;
                if let Some(vector) = &embedding {
                    crate::embeddings::store_embedding(tx, fact_id, vector, now)?;
                }
                if let Some(extraction) = &extraction {
                    graph::apply_extraction(tx, extraction, &project_for_ledger, fact_id, now)?;
                }
                Ok(serde_json::json!(fact_id))
            })
            .await?;
        let fact_id: i64 = serde_json::from_value(value)?;

        #[cfg(feature = "vector-search")]
        if let Some(vector) = &embedding_for_index {
            if let Some(index) = self.vector_index.read().await.as_ref() {
                index.add(fact_id, vector)?;
            }
        }
        #[cfg(not(feature = "vector-search"))]
        let _ = embedding_for_index;

        self.caches.invalidate_project(&project);
        Ok(fact_id)
    }

    /// Store many facts as a single atomic unit: all commit together inside
    /// one savepoint, or none do. The ledger still receives exactly one
    /// entry per fact, in insertion order.
    pub async fn store_many(&self, inputs: Vec<fact::StoreInput>) -> Result<Vec<i64>> {
        let now = self.now();
        let merkle_batch_size = self.config.merkle_batch_size;

        let mut projects = Vec::with_capacity(inputs.len());
        let mut embeddings = Vec::with_capacity(inputs.len());
        let mut extractions = Vec::with_capacity(inputs.len());
        for input in &inputs {
            projects.push(input.project.clone());
            embeddings.push(self.embed_if_enabled(&input.content, now).await);
            extractions.push(self.extract_if_enabled(&input.content, &input.project, now).await);
        }
        let embeddings_for_index = embeddings.clone();
        let projects_for_cache = projects.clone();

        let value = self
            .batcher
            .submit(move |tx| {
                let mut ids = Vec::with_capacity(inputs.len());
                for (i, input) in inputs.into_iter().enumerate() {
                    let project = projects[i].clone();
                    let fact_id = fact::store(tx, input, now)?;
                    fact::record_store_ledger_entry(tx, fact_id, &project, now, merkle_batch_size)?;
                    if let Some(vector) = &embeddings[i] {
                        crate::embeddings::store_embedding(tx, fact_id, vector, now)?;
                    }
                    if let Some(extraction) = &extractions[i] {
                        graph::apply_extraction(tx, extraction, &project, fact_id, now)?;
                    }
                    ids.push(fact_id);
                }
                Ok(serde_json::json!(ids))
            })
            .await?;
        let ids: Vec<i64> = serde_json::from_value(value)?;

        #[cfg(feature = "vector-search")]
        {
            let guard = self.vector_index.read().await;
            if let Some(index) = guard.as_ref() {
                for (id, vector) in ids.iter().zip(embeddings_for_index.iter()) {
                    if let Some(vector) = vector {
                        index.add(*id, vector)?;
                    }
                }
            }
        }
        #[cfg(not(feature = "vector-search"))]
        let _ = embeddings_for_index;

        for project in projects_for_cache.iter().collect::<std::collections::HashSet<_>>() {
            self.caches.invalidate_project(project);
        }
        Ok(ids)
    }

    /// Replace an active fact with a new row carrying merged fields,
    /// deprecating the old one. Re-embeds/re-extracts against the merged
    /// content, same best-effort contract as `store`.
    pub async fn update(&self, fact_id: i64, input: fact::UpdateInput) -> Result<i64> {
        let now = self.now();
        let merkle_batch_size = self.config.merkle_batch_size;

        let prior = self.pool.with_connection(move |conn| fact::get(conn, fact_id)).await?;
        let merged_content = input.content.clone().unwrap_or_else(|| prior.content.clone());
        let embedding = self.embed_if_enabled(&merged_content, now).await;
        let extraction = self.extract_if_enabled(&merged_content, &prior.project, now).await;
        let embedding_for_index = embedding.clone();
        let project = prior.project.clone();
        let project_for_graph = project.clone();

        let value = self
            .batcher
            .submit(move |tx| {
                let new_id = fact::update(tx, fact_id, input, now, merkle_batch_size)?;
                if let Some(vector) = &embedding {
                    crate::embeddings::store_embedding(tx, new_id, vector, now)?;
                }
                if let Some(extraction) = &extraction {
                    graph::apply_extraction(tx, extraction, &project_for_graph, new_id, now)?;
                }
                Ok(serde_json::json!(new_id))
            })
            .await?;
        let new_id: i64 = serde_json::from_value(value)?;

        #[cfg(feature = "vector-search")]
        if let Some(vector) = &embedding_for_index {
            if let Some(index) = self.vector_index.read().await.as_ref() {
                index.add(new_id, vector)?;
            }
        }
        #[cfg(not(feature = "vector-search"))]
        let _ = embedding_for_index;

        self.caches.invalidate_project(&project);
        Ok(new_id)
    }

    pub async fn deprecate(&self, fact_id: i64, reason: Option<String>) -> Result<bool> {
        let now = self.now();
        let merkle_batch_size = self.config.merkle_batch_size;
        let project = self.pool.with_connection(move |conn| fact::get(conn, fact_id).map(|f| f.project)).await?;

        let value = self
            .batcher
            .submit(move |tx| {
                let removed = fact::deprecate(tx, fact_id, reason.as_deref(), now, merkle_batch_size)?;
                Ok(serde_json::json!(removed))
            })
            .await?;
        let removed: bool = serde_json::from_value(value)?;

        #[cfg(feature = "vector-search")]
        if let Some(index) = self.vector_index.read().await.as_ref() {
            index.remove(fact_id)?;
        }

        self.caches.invalidate_project(&project);
        Ok(removed)
    }

    pub async fn recall(&self, project: &str, limit: Option<i64>, offset: i64) -> Result<Vec<Fact>> {
        let key = recall_key(limit, offset);
        if let Some(cached) = self.caches.get_recall(project, &key) {
            return Ok(cached);
        }
        let now = self.now();
        let project_owned = project.to_string();
        let facts = self.pool.with_connection(move |conn| fact::recall(conn, &project_owned, limit, offset, now)).await?;
        self.caches.put_recall(project, key, facts.clone());
        Ok(facts)
    }

    pub async fn history(&self, project: &str, as_of: Option<DateTime<Utc>>) -> Result<Vec<Fact>> {
        let project = project.to_string();
        self.pool.with_connection(move |conn| fact::history(conn, &project, as_of)).await
    }

    pub async fn register_agent(
        &self,
        name: String,
        agent_type: String,
        public_key: Option<String>,
        tenant: String,
    ) -> Result<String> {
        let now = self.now();
        let value = self
            .batcher
            .submit(move |tx| {
                let id = consensus::register_agent(tx, &name, &agent_type, public_key.as_deref(), &tenant, now)?;
                Ok(serde_json::json!(id))
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn vote(
        &self,
        fact_id: i64,
        agent_id: String,
        value: i32,
        reason: Option<String>,
    ) -> Result<consensus::VoteOutcome> {
        let now = self.now();
        let merkle_batch_size = self.config.merkle_batch_size;
        let tuning = self.consensus_tuning();
        let project = self.pool.with_connection(move |conn| fact::get(conn, fact_id).map(|f| f.project)).await?;

        let raw = self
            .batcher
            .submit(move |tx| {
                let outcome = consensus::vote(tx, fact_id, &agent_id, value, reason.as_deref(), now, merkle_batch_size, tuning)?;
                Ok(serde_json::to_value(outcome)?)
            })
            .await?;
        let outcome: consensus::VoteOutcome = serde_json::from_value(raw)?;
        self.caches.invalidate_project(&project);
        Ok(outcome)
    }

    fn consensus_tuning(&self) -> consensus::ConsensusTuning {
        consensus::ConsensusTuning {
            verified_threshold: self.config.consensus_verified_threshold,
            disputed_threshold: self.config.consensus_disputed_threshold,
            reputation_learning_rate: self.config.reputation_learning_rate,
        }
    }

    /// Legacy unweighted vote path, kept for callers that haven't
    /// registered an agent (see `consensus::vote_legacy`).
    pub async fn vote_legacy(
        &self,
        fact_id: i64,
        agent_name: String,
        value: i32,
        reason: Option<String>,
    ) -> Result<consensus::VoteOutcome> {
        let now = self.now();
        let merkle_batch_size = self.config.merkle_batch_size;
        let tuning = self.consensus_tuning();
        let project = self.pool.with_connection(move |conn| fact::get(conn, fact_id).map(|f| f.project)).await?;

        let raw = self
            .batcher
            .submit(move |tx| {
                let outcome = consensus::vote_legacy(tx, fact_id, &agent_name, value, reason.as_deref(), now, merkle_batch_size, tuning)?;
                Ok(serde_json::to_value(outcome)?)
            })
            .await?;
        let outcome: consensus::VoteOutcome = serde_json::from_value(raw)?;
        self.caches.invalidate_project(&project);
        Ok(outcome)
    }

    pub async fn set_trust_edge(&self, source_agent: String, target_agent: String, weight: f64) -> Result<()> {
        self.batcher
            .submit(move |tx| {
                consensus::set_trust_edge(tx, &source_agent, &target_agent, weight)?;
                Ok(serde_json::Value::Null)
            })
            .await?;
        Ok(())
    }

    #[cfg(feature = "vector-search")]
    async fn semantic_candidates(&self, query: &str, top_k: usize, now: DateTime<Utc>) -> Option<Vec<(i64, f32)>> {
        let vector = self.cached_query_embedding(query, now).await?;
        let guard = self.vector_index.read().await;
        let Some(index) = guard.as_ref() else {
            tracing::debug!("semantic search unavailable: vector index not built yet");
            return None;
        };
        if index.is_empty() {
            tracing::debug!("semantic search unavailable: vector index has no embeddings yet");
            return None;
        }
        match index.search(&vector, top_k.max(20)) {
            Ok(results) => {
                if results.is_empty() {
                    tracing::debug!("semantic search ran but matched nothing");
                }
                Some(results)
            }
            Err(e) => {
                tracing::warn!(error = %e, "semantic search failed, falling back to lexical-only search");
                None
            }
        }
    }

    /// Brute-force nearest-neighbor fallback used when the `vector-search`
    /// (HNSW) feature is compiled out — same candidate shape as the
    /// feature-gated path above, just sublinear vs. exact.
    #[cfg(not(feature = "vector-search"))]
    async fn semantic_candidates(&self, query: &str, top_k: usize, now: DateTime<Utc>) -> Option<Vec<(i64, f32)>> {
        let vector = self.cached_query_embedding(query, now).await?;
        let top_k = top_k.max(20);
        match self.pool.with_connection(move |conn| crate::embeddings::nearest_brute_force(conn, &vector, top_k)).await {
            Ok(results) => {
                if results.is_empty() {
                    tracing::debug!("brute-force semantic search ran but matched nothing");
                }
                Some(results)
            }
            Err(e) => {
                tracing::warn!(error = %e, "brute-force semantic search failed, falling back to lexical-only search");
                None
            }
        }
    }

    async fn cached_query_embedding(&self, query: &str, now: DateTime<Utc>) -> Option<Vec<f32>> {
        if let Some(vector) = self.caches.get_embed(query) {
            return Some(vector);
        }
        let vector = self.embed_if_enabled(query, now).await?;
        self.caches.put_embed(query, vector.clone());
        Some(vector)
    }

    /// Hybrid search: semantic candidates (if the vector index is
    /// populated and the query embeds successfully) blended with lexical
    /// FTS5 results; lexical-only otherwise.
    pub async fn search(&self, query: &str, filters: SearchFilters, top_k: usize) -> Result<Vec<SearchResult>> {
        if let Some(cached) = self.caches.get_search(&filters, query, top_k) {
            return Ok(cached);
        }
        let now = self.now();
        let semantic = self.semantic_candidates(query, top_k, now).await;

        let query_owned = query.to_string();
        let filters_for_conn = filters.clone();
        let results = self
            .pool
            .with_connection(move |conn| search::search(conn, &query_owned, &filters_for_conn, top_k, now, semantic.as_deref()))
            .await?;

        self.caches.put_search(&filters, query, top_k, results.clone());
        Ok(results)
    }

    pub async fn subgraph(&self, project: &str, limit: i64) -> Result<(Vec<graph::Entity>, Vec<graph::Relation>)> {
        let project = project.to_string();
        self.pool.with_connection(move |conn| graph::subgraph(conn, &project, limit)).await
    }

    pub async fn entity(&self, name: &str, project: &str) -> Result<Option<graph::Entity>> {
        let name = name.to_string();
        let project = project.to_string();
        self.pool.with_connection(move |conn| graph::entity(conn, &name, &project)).await
    }

    pub async fn verify_ledger(&self) -> Result<ledger::VerifyReport> {
        self.pool.with_connection(|conn| ledger::verify(conn)).await
    }

    /// Merkle inclusion proof for a single ledger entry, if it falls within
    /// a checkpointed range. `None` if the entry hasn't been checkpointed yet.
    pub async fn inclusion_proof(&self, entry_id: i64) -> Result<Option<Vec<ledger::ProofStep>>> {
        self.pool.with_connection(move |conn| ledger::inclusion_proof(conn, entry_id)).await
    }

    pub async fn export_ledger(&self, path: PathBuf, start: Option<i64>, exporter: Option<String>) -> Result<ledger::ExportResult> {
        let now = self.now();
        self.pool.with_connection(move |conn| ledger::export(conn, &path, start, now, exporter.as_deref())).await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        self.pool
            .with_connection(|conn| {
                Ok(EngineStats {
                    active_facts: conn.query_row("SELECT COUNT(*) FROM facts WHERE valid_until IS NULL", [], |r| r.get(0))?,
                    total_facts: conn.query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))?,
                    ledger_entries: conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |r| r.get(0))?,
                    agents: conn.query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))?,
                    entities: conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?,
                })
            })
            .await
    }

    /// Wait for every write queued before this call to finish committing.
    /// `WriteBatcher` preserves submission order, so a trivial no-op unit
    /// only completes once its predecessors have.
    pub async fn close(&self) -> Result<()> {
        self.batcher.submit(|_tx| Ok(serde_json::Value::Null)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_input(project: &str, content: &str) -> fact::StoreInput {
        fact::StoreInput {
            project: project.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    async fn engine() -> Engine {
        let config = Config::in_memory();
        let clock = Arc::new(FixedClock::new(t(0)));
        let engine = Engine::open_with(config, clock, Arc::new(NullEmbedder), Arc::new(NullExtractor)).unwrap();
        engine.init_db().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn store_then_recall_scenario_s1() {
        let engine = engine().await;
        let id1 = engine.store(store_input("api", "Rate=100/min")).await.unwrap();
        let id2 = engine.store(store_input("api", "Rate=500/min")).await.unwrap();
        engine.deprecate(id1, Some("superseded".into())).await.unwrap();

        let recalled = engine.recall("api", None, 0).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].id, id2);
    }

    #[tokio::test]
    async fn recall_cache_is_invalidated_on_store() {
        let engine = engine().await;
        engine.store(store_input("p", "first")).await.unwrap();
        let first = engine.recall("p", None, 0).await.unwrap();
        assert_eq!(first.len(), 1);

        engine.store(store_input("p", "second")).await.unwrap();
        let second = engine.recall("p", None, 0).await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn vote_resolves_and_updates_fact_confidence_s2() {
        let engine = engine().await;
        let fact_id = engine.store(store_input("p", "a fact")).await.unwrap();
        let a1 = engine.register_agent("alice".into(), "ai".into(), None, "default".into()).await.unwrap();
        let a2 = engine.register_agent("bob".into(), "ai".into(), None, "default".into()).await.unwrap();

        engine.vote(fact_id, a1, 1, None).await.unwrap();
        let outcome = engine.vote(fact_id, a2, 1, None).await.unwrap();
        assert_eq!(outcome.confidence, "verified");
    }

    #[tokio::test]
    async fn search_falls_back_to_lexical_without_vector_results_s6() {
        let engine = engine().await;
        engine.store(store_input("p", "the quick brown fox")).await.unwrap();
        let results = engine.search("quick", SearchFilters::default(), 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn ledger_verifies_after_a_sequence_of_mutations_s4() {
        let engine = engine().await;
        let fact_id = engine.store(store_input("p", "x")).await.unwrap();
        engine.update(fact_id, fact::UpdateInput { content: Some("y".into()), ..Default::default() }).await.unwrap();

        let report = engine.verify_ledger().await.unwrap();
        assert!(report.valid);
    }

    #[tokio::test]
    async fn update_produces_new_fact_with_lineage_link_s5() {
        let engine = engine().await;
        let old_id = engine.store(store_input("p", "X")).await.unwrap();
        let new_id = engine
            .update(old_id, fact::UpdateInput { content: Some("Y".into()), ..Default::default() })
            .await
            .unwrap();

        assert_ne!(new_id, old_id);
        let recalled = engine.recall("p", None, 0).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].id, new_id);
        assert_eq!(recalled[0].meta["previous_fact_id"], serde_json::json!(old_id));
    }

    #[tokio::test]
    async fn store_many_commits_atomically_in_insertion_order() {
        let engine = engine().await;
        let ids = engine
            .store_many(vec![
                store_input("p", "first"),
                store_input("p", "second"),
                store_input("p", "third"),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_facts, 3);
        assert_eq!(stats.ledger_entries, 3);
    }

    #[tokio::test]
    async fn stats_reflects_stored_facts() {
        let engine = engine().await;
        engine.store(store_input("p", "x")).await.unwrap();
        engine.store(store_input("p", "y")).await.unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_facts, 2);
        assert_eq!(stats.active_facts, 2);
    }

    #[tokio::test]
    async fn close_drains_pending_writes() {
        let engine = engine().await;
        engine.store(store_input("p", "x")).await.unwrap();
        engine.close().await.unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_facts, 1);
    }
}
