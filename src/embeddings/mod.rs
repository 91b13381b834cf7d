//! Embedding Index (C5)
//!
//! A pluggable `Embedder` collaborator (`text -> [f32; 384]`) plus a fixed
//! 384-dimension vector store. The engine tolerates an embedder that isn't
//! configured at all, and tolerates the vector extension not being
//! available: both degrade `search` to lexical-only rather than failing.

pub mod local;

use rusqlite::{params, Connection};

use crate::error::Result;

pub const EMBEDDING_DIMENSIONS: usize = 384;

/// `text -> vector`. May fail; failure is always non-fatal to `store`.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// The absence of an embedder. Matches the documented "engine MUST tolerate
/// absence entirely" contract: `store` just skips the embedding step.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmbedder;

impl Embedder for NullEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(crate::error::EngineError::ExternalUnavailable("no embedder configured".into()))
    }
}

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Persist a fact's embedding. Called only after the embedder has already
/// succeeded; lifetime is coupled to the fact row via `ON DELETE CASCADE`.
pub fn store_embedding(conn: &Connection, fact_id: i64, vector: &[f32], now: chrono::DateTime<chrono::Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO fact_embeddings (fact_id, vector, dims, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(fact_id) DO UPDATE SET vector = excluded.vector, dims = excluded.dims, created_at = excluded.created_at",
        params![fact_id, vector_to_bytes(vector), vector.len() as i64, crate::temporal::format_timestamp(now)],
    )?;
    Ok(())
}

pub fn load_embedding(conn: &Connection, fact_id: i64) -> Result<Option<Vec<f32>>> {
    use rusqlite::OptionalExtension;
    let bytes: Option<Vec<u8>> = conn
        .query_row("SELECT vector FROM fact_embeddings WHERE fact_id = ?1", params![fact_id], |r| r.get(0))
        .optional()?;
    Ok(bytes.map(|b| bytes_to_vector(&b)))
}

/// Every stored embedding, for rebuilding the in-memory HNSW index on
/// startup (the index itself is never persisted, this table is the source
/// of truth).
pub fn load_all_embeddings(conn: &Connection) -> Result<Vec<(i64, Vec<f32>)>> {
    let mut stmt = conn.prepare("SELECT fact_id, vector FROM fact_embeddings")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        let (fact_id, bytes) = row?;
        out.push((fact_id, bytes_to_vector(&bytes)));
    }
    Ok(out)
}

/// Remove embeddings whose `fact_id` no longer has a corresponding fact row.
/// A dedicated pruner rather than relying solely on `ON DELETE CASCADE`
/// since facts are never deleted in the normal lifecycle — this only
/// matters after manual/administrative row removal.
pub fn prune_orphaned(conn: &Connection) -> Result<u64> {
    let removed = conn.execute(
        "DELETE FROM fact_embeddings WHERE fact_id NOT IN (SELECT id FROM facts)",
        [],
    )?;
    Ok(removed as u64)
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

/// Brute-force nearest-neighbor fallback used when the `vector-search`
/// feature (usearch/HNSW) is compiled out. Exact, just not sublinear.
pub fn nearest_brute_force(conn: &Connection, query: &[f32], top_k: usize) -> Result<Vec<(i64, f32)>> {
    let mut stmt = conn.prepare("SELECT fact_id, vector FROM fact_embeddings")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?)))?;

    let mut scored = Vec::new();
    for row in rows {
        let (fact_id, bytes) = row?;
        let vector = bytes_to_vector(&bytes);
        scored.push((fact_id, cosine_distance(query, &vector)));
    }
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    scored.truncate(top_k);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::apply_migrations;
    use chrono::{TimeZone, Utc};

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO facts (project, content, fact_type, valid_from, created_at, updated_at)
             VALUES ('p', 'x', 'knowledge', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn
    }

    fn t(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn vector_byte_roundtrip() {
        let v = vec![0.1_f32, -0.2, 3.5];
        assert_eq!(bytes_to_vector(&vector_to_bytes(&v)), v);
    }

    #[test]
    fn store_and_load_embedding() {
        let conn = db();
        store_embedding(&conn, 1, &[1.0, 0.0, 0.0], t(0)).unwrap();
        let loaded = load_embedding(&conn, 1).unwrap().unwrap();
        assert_eq!(loaded, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn identical_vectors_have_zero_distance() {
        let v = vec![0.3, 0.4, 0.5];
        assert!(cosine_distance(&v, &v) < 1e-6);
    }

    #[test]
    fn load_all_embeddings_returns_every_row() {
        let conn = db();
        store_embedding(&conn, 1, &[1.0, 0.0], t(0)).unwrap();
        let all = load_all_embeddings(&conn).unwrap();
        assert_eq!(all, vec![(1, vec![1.0, 0.0])]);
    }

    #[test]
    fn prune_removes_orphaned_vectors() {
        let conn = db();
        store_embedding(&conn, 1, &[1.0, 0.0], t(0)).unwrap();
        conn.execute("PRAGMA foreign_keys = OFF", []).unwrap();
        conn.execute("DELETE FROM facts WHERE id = 1", []).unwrap();
        let removed = prune_orphaned(&conn).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn brute_force_ranks_closest_first() {
        let conn = db();
        store_embedding(&conn, 1, &[1.0, 0.0], t(0)).unwrap();
        conn.execute(
            "INSERT INTO facts (project, content, fact_type, valid_from, created_at, updated_at)
             VALUES ('p', 'y', 'knowledge', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        store_embedding(&conn, 2, &[0.0, 1.0], t(0)).unwrap();

        let results = nearest_brute_force(&conn, &[1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, 1);
    }
}
