//! Graph Index (C11)
//!
//! Entities mentioned in fact content are upserted here and co-mentions are
//! recorded as weighted relations. Extraction is a pluggable collaborator
//! (`Extractor`); failures are logged and never block `store`/`update`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::temporal::{format_timestamp, parse_timestamp};

/// An extracted entity mention, as produced by an `Extractor`.
#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
}

/// A co-mention relation between two extracted entities.
#[derive(Debug, Clone)]
pub struct ExtractedRelation {
    pub source_name: String,
    pub target_name: String,
    pub relation_type: String,
}

/// The output of one extraction pass over a fact's content.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

/// Entity/relation extraction over fact content. Implementations may call
/// out to an NLP model or a simple heuristic; `extract` may fail, and
/// failure is always non-fatal to the caller.
pub trait Extractor: Send + Sync {
    fn extract(&self, content: &str, project: &str, ts: DateTime<Utc>) -> Result<Extraction>;
}

/// An extractor that finds nothing. The default when no extractor is
/// configured — matches the embedder's "engine tolerates absence entirely"
/// contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExtractor;

impl Extractor for NullExtractor {
    fn extract(&self, _content: &str, _project: &str, _ts: DateTime<Utc>) -> Result<Extraction> {
        Ok(Extraction::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub entity_id: i64,
    pub name: String,
    pub entity_type: String,
    pub project: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mention_count: i64,
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Relation {
    pub source_entity_id: i64,
    pub target_entity_id: i64,
    pub relation_type: String,
    pub weight: f64,
    pub first_seen: DateTime<Utc>,
    pub source_fact_id: Option<i64>,
}

fn upsert_entity(conn: &Connection, name: &str, entity_type: &str, project: &str, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO entities (name, entity_type, project, first_seen, last_seen, mention_count, meta)
         VALUES (?1, ?2, ?3, ?4, ?4, 1, '{}')
         ON CONFLICT(name, project) DO UPDATE SET
            last_seen = excluded.last_seen,
            mention_count = mention_count + 1",
        params![name, entity_type, project, format_timestamp(now)],
    )?;
    Ok(conn.query_row(
        "SELECT entity_id FROM entities WHERE name = ?1 AND project = ?2",
        params![name, project],
        |r| r.get(0),
    )?)
}

fn upsert_relation(
    conn: &Connection,
    source_entity_id: i64,
    target_entity_id: i64,
    relation_type: &str,
    source_fact_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_relations (source_entity_id, target_entity_id, relation_type, weight, first_seen, source_fact_id)
         VALUES (?1, ?2, ?3, 1.0, ?4, ?5)
         ON CONFLICT(source_entity_id, target_entity_id, relation_type) DO UPDATE SET
            weight = weight + 1.0",
        params![source_entity_id, target_entity_id, relation_type, format_timestamp(now), source_fact_id],
    )?;
    Ok(())
}

/// Apply an extraction's entities and relations to the graph, scoped to
/// `project` and attributed to `fact_id`. Logged and swallowed by the
/// caller if extraction itself failed; this function only runs once
/// extraction has already succeeded.
pub fn apply_extraction(conn: &Connection, extraction: &Extraction, project: &str, fact_id: i64, now: DateTime<Utc>) -> Result<()> {
    let mut ids = std::collections::HashMap::new();
    for entity in &extraction.entities {
        let id = upsert_entity(conn, &entity.name, &entity.entity_type, project, now)?;
        ids.insert(entity.name.clone(), id);
    }
    for relation in &extraction.relations {
        let (Some(&source_id), Some(&target_id)) = (ids.get(&relation.source_name), ids.get(&relation.target_name))
        else {
            tracing::warn!(
                source = relation.source_name,
                target = relation.target_name,
                "relation references an entity not present in this extraction's entity list, skipping"
            );
            continue;
        };
        upsert_relation(conn, source_id, target_id, &relation.relation_type, fact_id, now)?;
    }
    Ok(())
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let first_seen: String = row.get("first_seen")?;
    let last_seen: String = row.get("last_seen")?;
    let meta_raw: String = row.get("meta")?;
    Ok(Entity {
        entity_id: row.get("entity_id")?,
        name: row.get("name")?,
        entity_type: row.get("entity_type")?,
        project: row.get("project")?,
        first_seen: parse_timestamp(&first_seen).unwrap_or_else(|_| Utc::now()),
        last_seen: parse_timestamp(&last_seen).unwrap_or_else(|_| Utc::now()),
        mention_count: row.get("mention_count")?,
        meta: serde_json::from_str(&meta_raw).unwrap_or_else(|_| serde_json::json!({})),
    })
}

pub fn entity(conn: &Connection, name: &str, project: &str) -> Result<Option<Entity>> {
    use rusqlite::OptionalExtension;
    Ok(conn
        .query_row(
            "SELECT entity_id, name, entity_type, project, first_seen, last_seen, mention_count, meta
             FROM entities WHERE name = ?1 AND project = ?2",
            params![name, project],
            row_to_entity,
        )
        .optional()?)
}

/// The `limit` most-mentioned entities for `project`, plus relations
/// between any pair of them.
pub fn subgraph(conn: &Connection, project: &str, limit: i64) -> Result<(Vec<Entity>, Vec<Relation>)> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, name, entity_type, project, first_seen, last_seen, mention_count, meta
         FROM entities WHERE project = ?1 ORDER BY mention_count DESC, entity_id ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![project, limit], row_to_entity)?;
    let mut entities = Vec::new();
    for row in rows {
        entities.push(row?);
    }

    let ids: Vec<i64> = entities.iter().map(|e| e.entity_id).collect();
    if ids.is_empty() {
        return Ok((entities, Vec::new()));
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT source_entity_id, target_entity_id, relation_type, weight, first_seen, source_fact_id
         FROM entity_relations
         WHERE source_entity_id IN ({placeholders}) AND target_entity_id IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_doubled: Vec<&dyn rusqlite::ToSql> =
        ids.iter().chain(ids.iter()).map(|i| i as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(params_doubled.as_slice(), |r| {
        let first_seen: String = r.get(4)?;
        Ok(Relation {
            source_entity_id: r.get(0)?,
            target_entity_id: r.get(1)?,
            relation_type: r.get(2)?,
            weight: r.get(3)?,
            first_seen: parse_timestamp(&first_seen).unwrap_or_else(|_| Utc::now()),
            source_fact_id: r.get(5)?,
        })
    })?;
    let mut relations = Vec::new();
    for row in rows {
        relations.push(row?);
    }

    Ok((entities, relations))
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

    #[test]
    fn upserting_same_entity_increments_mention_count() {
        let conn = db();
        let extraction = Extraction {
            entities: vec![ExtractedEntity {
                name: "Alice".into(),
                entity_type: "person".into(),
            }],
            relations: vec![],
        };
        apply_extraction(&conn, &extraction, "p", 1, t(0)).unwrap();
        apply_extraction(&conn, &extraction, "p", 2, t(1)).unwrap();

        let e = entity(&conn, "Alice", "p").unwrap().unwrap();
        assert_eq!(e.mention_count, 2);
    }

    #[test]
    fn relation_weight_increments_on_repeat_co_mention() {
        let conn = db();
        let extraction = Extraction {
            entities: vec![
                ExtractedEntity {
                    name: "Alice".into(),
                    entity_type: "person".into(),
                },
                ExtractedEntity {
                    name: "Acme".into(),
                    entity_type: "org".into(),
                },
            ],
            relations: vec![ExtractedRelation {
                source_name: "Alice".into(),
                target_name: "Acme".into(),
                relation_type: "works_at".into(),
            }],
        };
        apply_extraction(&conn, &extraction, "p", 1, t(0)).unwrap();
        apply_extraction(&conn, &extraction, "p", 2, t(1)).unwrap();

        let (_, relations) = subgraph(&conn, "p", 10).unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].weight, 2.0);
    }

    #[test]
    fn null_extractor_produces_no_entities() {
        let extraction = NullExtractor.extract("anything", "p", t(0)).unwrap();
        assert!(extraction.entities.is_empty());
    }
}
