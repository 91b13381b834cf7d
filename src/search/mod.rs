//! Search Engine (C10): hybrid semantic + lexical retrieval with temporal
//! filtering. Lexical search (C6) and the vector index (C5, feature-gated)
//! are each usable standalone; `search` blends them when both are
//! available and falls back to lexical-only otherwise.

pub mod hybrid;
#[cfg(feature = "vector-search")]
pub mod vector;

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::fact::Fact;
use crate::temporal::{predicate_for, PointInTime};

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub fact_id: i64,
    pub project: String,
    pub content: String,
    pub score: f32,
    pub fact_type: String,
    pub consensus_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub project: Option<String>,
    pub as_of: Option<DateTime<Utc>>,
    pub fact_type: Option<String>,
    pub tags: Vec<String>,
}

/// Quote an FTS5 query as a single phrase and escape embedded quotes,
/// rather than passing user text straight into `MATCH`: FTS5's query
/// syntax has its own operators (`AND`, `NEAR`, `-`, `*`) that untrusted
/// input could otherwise trigger.
pub fn sanitize_fts5_query(raw: &str) -> String {
    let escaped = raw.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

/// Lexical (FTS5) search over fact content/project/tags/fact_type.
pub fn lexical_search(conn: &Connection, query: &str, filters: &SearchFilters, top_k: usize, now: DateTime<Utc>) -> Result<Vec<(i64, f32)>> {
    if top_k == 0 {
        return Ok(Vec::new());
    }
    let sanitized = sanitize_fts5_query(query);

    let mut sql = String::from(
        "SELECT f.id, bm25(facts_fts) FROM facts f
         JOIN facts_fts ON f.id = facts_fts.rowid
         WHERE facts_fts MATCH ?1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(sanitized)];
    push_filters(&mut sql, &mut args, filters, now);
    sql.push_str(" ORDER BY bm25(facts_fts) ASC, f.id ASC LIMIT ?");
    args.push(Box::new(top_k as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter().map(|b| b.as_ref())), |r| {
        let bm25: f64 = r.get(1)?;
        // bm25() returns lower-is-better; invert so higher score == better,
        // matching the vector path's "higher is better" convention.
        Ok((r.get::<_, i64>(0)?, -(bm25 as f32)))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn push_filters(sql: &mut String, args: &mut Vec<Box<dyn rusqlite::ToSql>>, filters: &SearchFilters, now: DateTime<Utc>) {
    if let Some(project) = &filters.project {
        sql.push_str(&format!(" AND f.project = ?{}", args.len() + 1));
        args.push(Box::new(project.clone()));
    }
    if let Some(fact_type) = &filters.fact_type {
        sql.push_str(&format!(" AND f.fact_type = ?{}", args.len() + 1));
        args.push(Box::new(fact_type.clone()));
    }
    for tag in &filters.tags {
        sql.push_str(&format!(" AND f.tags LIKE ?{}", args.len() + 1));
        args.push(Box::new(format!("%{}%", serde_json::to_string(tag).unwrap_or_default().trim_matches('"'))));
    }
    let point = match filters.as_of {
        Some(at) => PointInTime::At(at),
        None => PointInTime::Latest,
    };
    let predicate = predicate_for(point, now);
    sql.push_str(&format!(" AND f.{}", predicate.sql.replace("?1", &format!("?{}", args.len() + 1))));
    args.push(Box::new(crate::temporal::format_timestamp(predicate.at)));
}

fn fetch_facts_by_id(conn: &Connection, ids: &[i64]) -> Result<std::collections::HashMap<i64, Fact>> {
    let mut out = std::collections::HashMap::new();
    for &id in ids {
        if let Ok(fact) = crate::fact::get(conn, id) {
            out.insert(id, fact);
        }
    }
    Ok(out)
}

/// `search(query, ...)`: semantic path ranked by cosine distance when the
/// vector index is available and non-empty, else lexical-only. When both
/// paths produce results they're blended 0.7 semantic / 0.3 lexical.
#[allow(clippy::too_many_arguments)]
pub fn search(
    conn: &Connection,
    query: &str,
    filters: &SearchFilters,
    top_k: usize,
    now: DateTime<Utc>,
    semantic: Option<&[(i64, f32)]>,
) -> Result<Vec<SearchResult>> {
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let lexical = lexical_search(conn, query, filters, top_k.max(20), now)?;

    let fused_ids: Vec<(i64, f32)> = match semantic {
        Some(sem) if !sem.is_empty() => hybrid::linear_combination(sem, &lexical, 0.7, 0.3),
        _ => lexical.clone(),
    };

    let ids: Vec<i64> = fused_ids.iter().map(|(id, _)| *id).take(top_k).collect();
    let facts = fetch_facts_by_id(conn, &ids)?;

    let mut results = Vec::new();
    for (id, score) in fused_ids.into_iter().take(top_k) {
        if let Some(fact) = facts.get(&id) {
            results.push(SearchResult {
                fact_id: fact.id,
                project: fact.project.clone(),
                content: fact.content.clone(),
                score,
                fact_type: fact.fact_type.clone(),
                consensus_score: fact.consensus_score,
            });
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::apply_migrations;
    use chrono::TimeZone;

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        conn
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn insert(conn: &Connection, content: &str) -> i64 {
        crate::fact::store(
            conn,
            crate::fact::StoreInput {
                project: "p".into(),
                content: content.into(),
                ..Default::default()
            },
            t(0),
        )
        .unwrap()
    }

    #[test]
    fn lexical_search_matches_content_s6() {
        let conn = db();
        insert(&conn, "the quick brown foo");
        insert(&conn, "something unrelated");

        let filters = SearchFilters::default();
        let results = lexical_search(&conn, "foo", &filters, 10, t(10)).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn search_top_k_zero_returns_empty() {
        let conn = db();
        insert(&conn, "content");
        let results = search(&conn, "content", &SearchFilters::default(), 0, t(0), None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn search_falls_back_to_lexical_when_no_semantic_results() {
        let conn = db();
        insert(&conn, "lexical only match");
        let results = search(&conn, "lexical", &SearchFilters::default(), 5, t(10), None).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn search_excludes_deprecated_facts_by_default() {
        let conn = db();
        let id = insert(&conn, "stale content");
        crate::fact::deprecate(&conn, id, None, t(5), 1000).unwrap();
        let results = search(&conn, "stale", &SearchFilters::default(), 5, t(10), None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn sanitize_wraps_in_quotes() {
        assert_eq!(sanitize_fts5_query("hello world"), "\"hello world\"");
        assert_eq!(sanitize_fts5_query("a\"b"), "\"a\"\"b\"");
    }
}
