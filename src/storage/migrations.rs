//! Schema & Migrations (C3)
//!
//! Forward-only, idempotent migrations. `apply_migrations` runs every
//! migration whose version is greater than the current maximum found in
//! `schema_version`, each inside its own transaction; a failure rolls that
//! migration back and aborts `open()` before any later migration runs.

use rusqlite::Connection;

use crate::error::{EngineError, Result};

/// A single forward migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "facts table",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "fact embeddings table",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "FTS5 lexical index over facts, kept in sync via triggers",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "hash-chained ledger and merkle checkpoints",
        up: MIGRATION_V4_UP,
    },
    Migration {
        version: 5,
        description: "agents table",
        up: MIGRATION_V5_UP,
    },
    Migration {
        version: 6,
        description: "legacy unweighted consensus votes",
        up: MIGRATION_V6_UP,
    },
    Migration {
        version: 7,
        description: "entity/relation graph index",
        up: MIGRATION_V7_UP,
    },
    Migration {
        version: 8,
        description: "ledger export audit trail",
        up: MIGRATION_V8_UP,
    },
    Migration {
        version: 9,
        description: "reputation-weighted consensus votes, outcomes, trust edges; \
                       backfills legacy votes onto synthetic agents at reputation 0.5",
        up: MIGRATION_V9_UP,
    },
];

/// Run every migration with version greater than the current maximum, in
/// ascending order, each in its own transaction. Takes `&Connection` (via
/// `unchecked_transaction`) rather than `&mut Connection` so it can run
/// through the pool's scoped-acquisition closures as well as at startup.
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up).map_err(|e| {
            EngineError::internal(format!(
                "migration {} ({}) failed: {e}",
                migration.version, migration.description
            ))
        })?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        tx.commit()?;
    }
    Ok(())
}

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    content TEXT NOT NULL,
    fact_type TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    confidence TEXT NOT NULL DEFAULT 'stated',
    valid_from TEXT NOT NULL,
    valid_until TEXT,
    source TEXT,
    meta TEXT NOT NULL DEFAULT '{}',
    consensus_score REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_facts_project ON facts(project);
CREATE INDEX IF NOT EXISTS idx_facts_project_active ON facts(project, valid_until);
CREATE INDEX IF NOT EXISTS idx_facts_valid_from ON facts(valid_from);
CREATE INDEX IF NOT EXISTS idx_facts_fact_type ON facts(fact_type);
"#;

const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS fact_embeddings (
    fact_id INTEGER PRIMARY KEY REFERENCES facts(id) ON DELETE CASCADE,
    vector BLOB NOT NULL,
    dims INTEGER NOT NULL DEFAULT 384,
    created_at TEXT NOT NULL
);
"#;

const MIGRATION_V3_UP: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    content,
    project,
    tags,
    fact_type,
    content='facts',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO facts_fts(rowid, content, project, tags, fact_type)
    VALUES (NEW.id, NEW.content, NEW.project, NEW.tags, NEW.fact_type);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, content, project, tags, fact_type)
    VALUES ('delete', OLD.id, OLD.content, OLD.project, OLD.tags, OLD.fact_type);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, content, project, tags, fact_type)
    VALUES ('delete', OLD.id, OLD.content, OLD.project, OLD.tags, OLD.fact_type);
    INSERT INTO facts_fts(rowid, content, project, tags, fact_type)
    VALUES (NEW.id, NEW.content, NEW.project, NEW.tags, NEW.fact_type);
END;
"#;

const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_project ON ledger_entries(project);

CREATE TABLE IF NOT EXISTS merkle_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_hash TEXT NOT NULL,
    start_tx_id INTEGER NOT NULL,
    end_tx_id INTEGER NOT NULL,
    tx_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_range ON merkle_checkpoints(start_tx_id, end_tx_id);
"#;

const MIGRATION_V5_UP: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    public_key TEXT,
    tenant TEXT NOT NULL DEFAULT 'default',
    reputation_score REAL NOT NULL DEFAULT 0.5,
    total_votes INTEGER NOT NULL DEFAULT 0,
    successful_votes INTEGER NOT NULL DEFAULT 0,
    disputed_votes INTEGER NOT NULL DEFAULT 0,
    last_active_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_verified INTEGER NOT NULL DEFAULT 0,
    meta TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_agents_tenant ON agents(tenant);
CREATE INDEX IF NOT EXISTS idx_agents_name ON agents(name);
"#;

const MIGRATION_V6_UP: &str = r#"
CREATE TABLE IF NOT EXISTS consensus_votes (
    fact_id INTEGER NOT NULL,
    agent_name TEXT NOT NULL,
    value INTEGER NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (fact_id, agent_name)
);
"#;

const MIGRATION_V7_UP: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    project TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    mention_count INTEGER NOT NULL DEFAULT 0,
    meta TEXT NOT NULL DEFAULT '{}',
    UNIQUE (name, project)
);

CREATE INDEX IF NOT EXISTS idx_entities_project ON entities(project);

CREATE TABLE IF NOT EXISTS entity_relations (
    source_entity_id INTEGER NOT NULL REFERENCES entities(entity_id) ON DELETE CASCADE,
    target_entity_id INTEGER NOT NULL REFERENCES entities(entity_id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    first_seen TEXT NOT NULL,
    source_fact_id INTEGER,
    PRIMARY KEY (source_entity_id, target_entity_id, relation_type)
);
"#;

const MIGRATION_V8_UP: &str = r#"
CREATE TABLE IF NOT EXISTS audit_exports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    start_id INTEGER NOT NULL,
    end_id INTEGER NOT NULL,
    exporter TEXT,
    created_at TEXT NOT NULL
);
"#;

const MIGRATION_V9_UP: &str = r#"
CREATE TABLE IF NOT EXISTS consensus_votes_v2 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fact_id INTEGER NOT NULL,
    agent_id TEXT NOT NULL,
    value INTEGER NOT NULL,
    weight REAL NOT NULL,
    rep_at_vote REAL NOT NULL,
    decay_factor REAL NOT NULL DEFAULT 1.0,
    reason TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (fact_id, agent_id)
);

CREATE INDEX IF NOT EXISTS idx_votes_v2_fact ON consensus_votes_v2(fact_id);

CREATE TABLE IF NOT EXISTS consensus_outcomes (
    fact_id INTEGER PRIMARY KEY,
    final_state TEXT NOT NULL,
    final_score REAL NOT NULL,
    resolved_at TEXT NOT NULL,
    total_votes INTEGER NOT NULL,
    unique_agents INTEGER NOT NULL,
    reputation_sum REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS trust_edges (
    source_agent TEXT NOT NULL,
    target_agent TEXT NOT NULL,
    weight REAL NOT NULL,
    PRIMARY KEY (source_agent, target_agent)
);

-- Backfill: every distinct legacy voter gets a synthetic agent at reputation
-- 0.5, and their legacy vote is mirrored into the weighted table so existing
-- stores gain a single canonical vote table going forward.
INSERT OR IGNORE INTO agents (id, name, agent_type, tenant, reputation_score, is_active, meta)
SELECT DISTINCT 'legacy:' || agent_name, agent_name, 'legacy', 'default', 0.5, 1, '{}'
FROM consensus_votes;

INSERT OR IGNORE INTO consensus_votes_v2
    (fact_id, agent_id, value, weight, rep_at_vote, decay_factor, reason, created_at)
SELECT fact_id, 'legacy:' || agent_name, value, 0.5, 0.5, 1.0, reason, created_at
FROM consensus_votes;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_cleanly_to_fresh_db() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[test]
    fn migrations_are_idempotent_across_opens() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        apply_migrations(&mut conn).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[test]
    fn legacy_votes_backfill_into_weighted_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Apply only migrations 1..=6, insert a legacy vote, then continue.
        let current = 0;
        for m in MIGRATIONS.iter().filter(|m| m.version > current && m.version <= 6) {
            conn.execute_batch(m.up).unwrap();
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);
             INSERT INTO facts (project, content, fact_type, valid_from, created_at, updated_at)
             VALUES ('p', 'c', 'knowledge', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO consensus_votes (fact_id, agent_name, value, created_at)
             VALUES (1, 'alice', 1, '2026-01-01T00:00:00Z');",
        )
        .unwrap();
        for m in MIGRATIONS.iter().filter(|m| m.version > 6) {
            conn.execute_batch(m.up).unwrap();
        }
        let agent_id: String = conn
            .query_row("SELECT id FROM agents WHERE name = 'alice'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(agent_id, "legacy:alice");
        let weight: f64 = conn
            .query_row(
                "SELECT weight FROM consensus_votes_v2 WHERE fact_id = 1 AND agent_id = ?1",
                [&agent_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(weight, 0.5);
    }
}
