//! Fact Repository (C7)
//!
//! Facts are immutable by convention: `store` inserts, `deprecate` closes a
//! validity window, `update` inserts a new row and deprecates the old one in
//! the same transaction. Nothing here ever deletes a fact row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::error::{EngineError, Result};
use crate::ledger;
use crate::temporal::{format_timestamp, parse_timestamp, PointInTime};

/// Open enumeration of fact kinds. Unknown values round-trip through
/// `Other` rather than being rejected — the repository stores whatever
/// string it's given and flags it, it doesn't validate against a closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactType {
    Knowledge,
    Decision,
    Error,
    Ghost,
    Config,
    Bridge,
    Axiom,
    Rule,
    Other(String),
}

impl Serialize for FactType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FactType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FactType::parse(&s))
    }
}

impl FactType {
    pub fn as_str(&self) -> &str {
        match self {
            FactType::Knowledge => "knowledge",
            FactType::Decision => "decision",
            FactType::Error => "error",
            FactType::Ghost => "ghost",
            FactType::Config => "config",
            FactType::Bridge => "bridge",
            FactType::Axiom => "axiom",
            FactType::Rule => "rule",
            FactType::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> FactType {
        match s {
            "knowledge" => FactType::Knowledge,
            "decision" => FactType::Decision,
            "error" => FactType::Error,
            "ghost" => FactType::Ghost,
            "config" => FactType::Config,
            "bridge" => FactType::Bridge,
            "axiom" => FactType::Axiom,
            "rule" => FactType::Rule,
            other => FactType::Other(other.to_string()),
        }
    }

    /// Whether this type is part of the recognized enumeration (vs. an
    /// unrecognized value stored verbatim-but-flagged per §4.7).
    pub fn is_recognized(&self) -> bool {
        !matches!(self, FactType::Other(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Stated,
    Inferred,
    Observed,
    Verified,
    Disputed,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Stated => "stated",
            Confidence::Inferred => "inferred",
            Confidence::Observed => "observed",
            Confidence::Verified => "verified",
            Confidence::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Result<Confidence> {
        Ok(match s {
            "stated" => Confidence::Stated,
            "inferred" => Confidence::Inferred,
            "observed" => Confidence::Observed,
            "verified" => Confidence::Verified,
            "disputed" => Confidence::Disputed,
            other => return Err(EngineError::invalid_input(format!("unknown confidence '{other}'"))),
        })
    }
}

/// A stored fact row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Fact {
    pub id: i64,
    pub project: String,
    pub content: String,
    pub fact_type: String,
    pub tags: Vec<String>,
    pub confidence: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub meta: Value,
    pub consensus_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.valid_until.is_none()
    }
}

/// Input to `store`. `valid_from` defaults to `now` when absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreInput {
    pub project: String,
    pub content: String,
    #[serde(default)]
    pub fact_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
}

fn validate_non_empty(label: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid_input(format!("{label} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Decode a `facts` row shape shared by `store`, `recall`, and `history`.
/// Malformed `tags`/`meta` JSON decodes as empty rather than failing the
/// whole query, matching the "duck-typed row conversion" pattern's intended
/// replacement: one typed decoder, with logged fallbacks.
fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let tags_raw: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw).unwrap_or_else(|_| {
        tracing::warn!(tags_raw, "fact row has malformed tags JSON, treating as empty");
        Vec::new()
    });

    let meta_raw: String = row.get("meta")?;
    let meta: Value = serde_json::from_str(&meta_raw).unwrap_or_else(|_| {
        tracing::warn!(meta_raw, "fact row has malformed meta JSON, treating as empty object");
        json!({})
    });

    let valid_from_raw: String = row.get("valid_from")?;
    let valid_until_raw: Option<String> = row.get("valid_until")?;
    let created_at_raw: String = row.get("created_at")?;
    let updated_at_raw: String = row.get("updated_at")?;

    Ok(Fact {
        id: row.get("id")?,
        project: row.get("project")?,
        content: row.get("content")?,
        fact_type: row.get("fact_type")?,
        tags,
        confidence: row.get("confidence")?,
        valid_from: parse_timestamp(&valid_from_raw).unwrap_or_else(|_| Utc::now()),
        valid_until: valid_until_raw.and_then(|s| parse_timestamp(&s).ok()),
        source: row.get("source")?,
        meta,
        consensus_score: row.get("consensus_score")?,
        created_at: parse_timestamp(&created_at_raw).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_timestamp(&updated_at_raw).unwrap_or_else(|_| Utc::now()),
    })
}

const FACT_COLUMNS: &str =
    "id, project, content, fact_type, tags, confidence, valid_from, valid_until, source, meta, consensus_score, created_at, updated_at";

/// Insert a single fact row, returning the new id. Does not touch the
/// ledger, embedding index, or graph index — callers (the coordinator)
/// compose those around this.
pub fn store(conn: &Connection, input: StoreInput, now: DateTime<Utc>) -> Result<i64> {
    let project = validate_non_empty("project", &input.project)?;
    let content = validate_non_empty("content", &input.content)?;
    let fact_type = input.fact_type.as_deref().map(FactType::parse).unwrap_or(FactType::Knowledge);
    if !fact_type.is_recognized() {
        tracing::warn!(fact_type = fact_type.as_str(), "storing fact with unrecognized fact_type");
    }
    let confidence = match &input.confidence {
        Some(c) => Confidence::parse(c)?,
        None => Confidence::Stated,
    };
    let tags: BTreeSet<String> = input.tags.into_iter().collect();
    let valid_from = input.valid_from.unwrap_or(now);
    let meta = input.meta.unwrap_or_else(|| json!({}));

    conn.execute(
        "INSERT INTO facts (project, content, fact_type, tags, confidence, valid_from, valid_until,
                             source, meta, consensus_score, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, 1.0, ?9, ?9)",
        params![
            project,
            content,
            fact_type.as_str(),
            serde_json::to_string(&tags)?,
            confidence.as_str(),
            format_timestamp(valid_from),
            input.source,
            meta.to_string(),
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Append a `store` ledger entry for a fact just inserted in the same
/// transaction.
pub fn record_store_ledger_entry(
    conn: &Connection,
    fact_id: i64,
    project: &str,
    now: DateTime<Utc>,
    merkle_batch_size: u64,
) -> Result<()> {
    ledger::append(conn, project, "store", json!({ "fact_id": fact_id }), now, merkle_batch_size)?;
    Ok(())
}

pub fn get(conn: &Connection, fact_id: i64) -> Result<Fact> {
    conn.query_row(&format!("SELECT {FACT_COLUMNS} FROM facts WHERE id = ?1"), params![fact_id], row_to_fact)
        .optional()?
        .ok_or_else(|| EngineError::not_found(format!("fact {fact_id}")))
}

/// Deprecate an active fact. Idempotent: deprecating an already-deprecated
/// fact returns `false` and writes nothing.
pub fn deprecate(
    conn: &Connection,
    fact_id: i64,
    reason: Option<&str>,
    now: DateTime<Utc>,
    merkle_batch_size: u64,
) -> Result<bool> {
    let fact = get(conn, fact_id)?;
    if !fact.is_active() {
        return Ok(false);
    }

    conn.execute(
        "UPDATE facts SET valid_until = ?1, updated_at = ?1 WHERE id = ?2",
        params![format_timestamp(now), fact_id],
    )?;

    ledger::append(
        conn,
        &fact.project,
        "deprecate",
        json!({ "fact_id": fact_id, "reason": reason }),
        now,
        merkle_batch_size,
    )?;
    Ok(true)
}

/// Content/tags/meta to merge into a new fact during `update`. Omitted
/// fields carry over from the prior fact unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateInput {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub meta: Option<Value>,
}

/// Create a new active fact with merged fields and deprecate the prior one,
/// atomically. `meta.previous_fact_id` links the new row back to the old.
pub fn update(
    conn: &Connection,
    fact_id: i64,
    input: UpdateInput,
    now: DateTime<Utc>,
    merkle_batch_size: u64,
) -> Result<i64> {
    let prior = get(conn, fact_id)?;
    if !prior.is_active() {
        return Err(EngineError::not_found(format!("fact {fact_id} is not active")));
    }

    let content = input.content.unwrap_or(prior.content.clone());
    let content = validate_non_empty("content", &content)?;
    let tags = input.tags.unwrap_or(prior.tags.clone());

    let mut meta = input.meta.unwrap_or(prior.meta.clone());
    if let Value::Object(map) = &mut meta {
        map.insert("previous_fact_id".to_string(), json!(fact_id));
    } else {
        meta = json!({ "previous_fact_id": fact_id });
    }

    let new_id = store(
        conn,
        StoreInput {
            project: prior.project.clone(),
            content,
            fact_type: Some(prior.fact_type.clone()),
            tags,
            confidence: Some(prior.confidence.clone()),
            source: prior.source.clone(),
            meta: Some(meta),
            valid_from: Some(now),
        },
        now,
    )?;

    conn.execute(
        "UPDATE facts SET valid_until = ?1, updated_at = ?1 WHERE id = ?2",
        params![format_timestamp(now), fact_id],
    )?;

    ledger::append(
        conn,
        &prior.project,
        "deprecate",
        json!({ "fact_id": fact_id, "reason": format!("updated_by_{new_id}") }),
        now,
        merkle_batch_size,
    )?;
    ledger::append(conn, &prior.project, "store", json!({ "fact_id": new_id }), now, merkle_batch_size)?;

    Ok(new_id)
}

/// Active facts for `project`, ordered by the composite relevance key:
/// `0.8*consensus_score + 0.2*(1 / (1 + days_since_created))`, then
/// `fact_type`, then `created_at desc`, then `id asc` as a final
/// deterministic tie-break.
pub fn recall(conn: &Connection, project: &str, limit: Option<i64>, offset: i64, now: DateTime<Utc>) -> Result<Vec<Fact>> {
    let limit = limit.unwrap_or(i64::MAX);
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS} FROM facts WHERE project = ?1 AND valid_until IS NULL"
    ))?;
    let rows = stmt.query_map(params![project], row_to_fact)?;
    let mut facts = Vec::new();
    for row in rows {
        facts.push(row?);
    }

    facts.sort_by(|a, b| {
        let key_a = relevance_key(a, now);
        let key_b = relevance_key(b, now);
        key_b
            .0
            .partial_cmp(&key_a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| key_a.1.cmp(&key_b.1))
            .then_with(|| key_b.2.cmp(&key_a.2))
            .then_with(|| a.id.cmp(&b.id))
    });

    Ok(facts
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect())
}

fn relevance_key(fact: &Fact, now: DateTime<Utc>) -> (f64, String, DateTime<Utc>) {
    let days = (now - fact.created_at).num_seconds() as f64 / 86_400.0;
    let days = days.max(0.0);
    let score = 0.8 * fact.consensus_score + 0.2 * (1.0 / (1.0 + days));
    (score, fact.fact_type.clone(), fact.created_at)
}

/// Without `as_of`: all facts for `project` ordered by `valid_from desc`.
/// With `as_of`: facts satisfying the point-in-time predicate at that
/// instant.
pub fn history(conn: &Connection, project: &str, as_of: Option<DateTime<Utc>>) -> Result<Vec<Fact>> {
    let mut facts = match as_of {
        None => {
            let mut stmt = conn.prepare(&format!("SELECT {FACT_COLUMNS} FROM facts WHERE project = ?1"))?;
            let rows = stmt.query_map(params![project], row_to_fact)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        }
        Some(at) => {
            let point = PointInTime::At(at);
            let predicate = crate::temporal::predicate_for(point, at);
            let mut stmt = conn.prepare(&format!(
                "SELECT {FACT_COLUMNS} FROM facts WHERE project = ?1 AND {}",
                predicate.sql
            ))?;
            let rows = stmt.query_map(params![project, format_timestamp(predicate.at)], row_to_fact)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        }
    };

    facts.sort_by(|a, b| b.valid_from.cmp(&a.valid_from).then_with(|| a.id.cmp(&b.id)));
    Ok(facts)
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

    fn input(project: &str, content: &str, fact_type: &str) -> StoreInput {
        StoreInput {
            project: project.to_string(),
            content: content.to_string(),
            fact_type: Some(fact_type.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn store_rejects_empty_project_or_content() {
        let conn = db();
        assert!(matches!(
            store(&conn, input("", "x", "config"), t(0)),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            store(&conn, input("p", "  ", "config"), t(0)),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn store_deprecate_recall_scenario_s1() {
        let conn = db();
        let f1 = store(&conn, input("api", "Rate=100/min", "config"), t(0)).unwrap();
        let f2 = store(&conn, input("api", "Rate=500/min", "config"), t(10)).unwrap();

        assert!(deprecate(&conn, f1, Some("superseded"), t(20), 1000).unwrap());

        let recalled = recall(&conn, "api", None, 0, t(30)).unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].id, f2);
    }

    #[test]
    fn deprecate_is_idempotent() {
        let conn = db();
        let f1 = store(&conn, input("p", "x", "config"), t(0)).unwrap();
        assert!(deprecate(&conn, f1, None, t(1), 1000).unwrap());
        assert!(!deprecate(&conn, f1, None, t(2), 1000).unwrap());
    }

    #[test]
    fn update_creates_new_fact_and_deprecates_old_s5() {
        let conn = db();
        let old = store(&conn, input("p", "X", "knowledge"), t(0)).unwrap();
        let new = update(
            &conn,
            old,
            UpdateInput {
                content: Some("Y".to_string()),
                ..Default::default()
            },
            t(10),
            1000,
        )
        .unwrap();

        let new_fact = get(&conn, new).unwrap();
        assert_eq!(new_fact.meta["previous_fact_id"], json!(old));
        let old_fact = get(&conn, old).unwrap();
        assert!(!old_fact.is_active());
    }

    #[test]
    fn update_on_inactive_fact_is_not_found() {
        let conn = db();
        let f1 = store(&conn, input("p", "x", "config"), t(0)).unwrap();
        deprecate(&conn, f1, None, t(1), 1000).unwrap();
        assert!(matches!(
            update(&conn, f1, UpdateInput::default(), t(2), 1000),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn history_as_of_includes_deprecated_fact_before_cutoff() {
        let conn = db();
        let f1 = store(&conn, input("api", "v1", "config"), t(0)).unwrap();
        deprecate(&conn, f1, None, t(100), 1000).unwrap();

        let before = history(&conn, "api", Some(t(50))).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, f1);

        let after = history(&conn, "api", Some(t(150))).unwrap();
        assert!(after.is_empty());
    }

    #[test]
    fn recall_top_k_zero_returns_empty_without_error() {
        let conn = db();
        store(&conn, input("p", "x", "config"), t(0)).unwrap();
        let result = recall(&conn, "p", Some(0), 0, t(1)).unwrap();
        assert!(result.is_empty());
    }
}
