//! Consensus Engine (C9)
//!
//! Reputation-weighted multi-agent voting over facts, plus the legacy
//! unweighted path migration 9 backfills into the weighted table. New code
//! should only ever call `vote` with an `agent_id`; the legacy-name path
//! exists for callers that haven't registered an agent yet.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::ledger;
use crate::temporal::format_timestamp;

pub const VERIFIED_THRESHOLD: f64 = 1.6;
pub const DISPUTED_THRESHOLD: f64 = 0.4;
const LEGACY_VERIFIED_THRESHOLD: f64 = 1.5;
const LEGACY_DISPUTED_THRESHOLD: f64 = 0.5;
const LEGACY_VOTE_STEP: f64 = 0.1;
const DEFAULT_REPUTATION_LEARNING_RATE: f64 = 0.1;

/// The subset of `Config` the weighted-consensus path needs: thresholds at
/// which a fact's confidence transitions, and the reputation EMA rate. The
/// legacy (unweighted) path's thresholds are fixed by the spec, not
/// configurable, but still shares the learning rate for reputation updates.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusTuning {
    pub verified_threshold: f64,
    pub disputed_threshold: f64,
    pub reputation_learning_rate: f64,
}

impl Default for ConsensusTuning {
    fn default() -> Self {
        Self {
            verified_threshold: VERIFIED_THRESHOLD,
            disputed_threshold: DISPUTED_THRESHOLD,
            reputation_learning_rate: DEFAULT_REPUTATION_LEARNING_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Ai,
    Human,
    Oracle,
    System,
    Legacy,
}

impl AgentType {
    fn as_str(self) -> &'static str {
        match self {
            AgentType::Ai => "ai",
            AgentType::Human => "human",
            AgentType::Oracle => "oracle",
            AgentType::System => "system",
            AgentType::Legacy => "legacy",
        }
    }

    fn parse(s: &str) -> AgentType {
        match s {
            "human" => AgentType::Human,
            "oracle" => AgentType::Oracle,
            "system" => AgentType::System,
            "legacy" => AgentType::Legacy,
            _ => AgentType::Ai,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub public_key: Option<String>,
    pub tenant: String,
    pub reputation_score: f64,
    pub total_votes: i64,
    pub successful_votes: i64,
    pub disputed_votes: i64,
    pub is_active: bool,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    Verified,
    Disputed,
    Undecided,
}

impl FinalState {
    fn as_str(self) -> &'static str {
        match self {
            FinalState::Verified => "verified",
            FinalState::Disputed => "disputed",
            FinalState::Undecided => "undecided",
        }
    }
}

/// Outcome of a single `vote` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub consensus_score: f64,
    pub confidence: String,
    pub resolved: Option<FinalState>,
}

pub fn register_agent(
    conn: &Connection,
    name: &str,
    agent_type: &str,
    public_key: Option<&str>,
    tenant: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let agent_type = AgentType::parse(agent_type).as_str();
    conn.execute(
        "INSERT INTO agents (id, name, agent_type, public_key, tenant, reputation_score,
                              last_active_at, is_active, is_verified, meta)
         VALUES (?1, ?2, ?3, ?4, ?5, 0.5, ?6, 1, 0, '{}')",
        params![id, name, agent_type, public_key, tenant, format_timestamp(now)],
    )?;
    Ok(id)
}

fn load_agent(conn: &Connection, agent_id: &str) -> Result<Agent> {
    conn.query_row(
        "SELECT id, name, agent_type, public_key, tenant, reputation_score,
                total_votes, successful_votes, disputed_votes, is_active, is_verified
         FROM agents WHERE id = ?1",
        params![agent_id],
        |r| {
            Ok(Agent {
                id: r.get(0)?,
                name: r.get(1)?,
                agent_type: r.get(2)?,
                public_key: r.get(3)?,
                tenant: r.get(4)?,
                reputation_score: r.get(5)?,
                total_votes: r.get(6)?,
                successful_votes: r.get(7)?,
                disputed_votes: r.get(8)?,
                is_active: r.get::<_, i64>(9)? != 0,
                is_verified: r.get::<_, i64>(10)? != 0,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found(format!("agent {agent_id}")))
}

fn fact_exists_active(conn: &Connection, fact_id: i64) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM facts WHERE id = ?1", params![fact_id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Cast, change, or remove a weighted vote by `agent_id`. `value = 0`
/// removes any existing vote (a no-op, no ledger entry, if none exists).
pub fn vote(
    conn: &Connection,
    fact_id: i64,
    agent_id: &str,
    value: i32,
    reason: Option<&str>,
    now: DateTime<Utc>,
    merkle_batch_size: u64,
    tuning: ConsensusTuning,
) -> Result<VoteOutcome> {
    if !fact_exists_active(conn, fact_id)? {
        return Err(EngineError::not_found(format!("fact {fact_id}")));
    }
    let agent = load_agent(conn, agent_id)?;
    if !agent.is_active {
        return Err(EngineError::not_found(format!("agent {agent_id} is inactive")));
    }

    if value == 0 {
        let removed = conn.execute(
            "DELETE FROM consensus_votes_v2 WHERE fact_id = ?1 AND agent_id = ?2",
            params![fact_id, agent_id],
        )?;
        if removed == 0 {
            let current = current_weighted_score(conn, fact_id)?;
            return Ok(VoteOutcome {
                consensus_score: current,
                confidence: fact_confidence(conn, fact_id)?,
                resolved: None,
            });
        }
    } else {
        conn.execute(
            "INSERT INTO consensus_votes_v2 (fact_id, agent_id, value, weight, rep_at_vote, decay_factor, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4, 1.0, ?5, ?6)
             ON CONFLICT(fact_id, agent_id) DO UPDATE SET
                value = excluded.value,
                weight = excluded.weight,
                rep_at_vote = excluded.rep_at_vote,
                decay_factor = 1.0,
                reason = excluded.reason,
                created_at = excluded.created_at",
            params![fact_id, agent_id, value, agent.reputation_score, reason, format_timestamp(now)],
        )?;
    }

    let score = recompute_weighted_score(conn, fact_id, now)?;
    let resolved = apply_confidence_transition(conn, fact_id, score, now, tuning)?;

    ledger::append(
        conn,
        &fact_project(conn, fact_id)?,
        "vote",
        json!({ "fact_id": fact_id, "agent_id": agent_id, "value": value, "score": score }),
        now,
        merkle_batch_size,
    )?;

    Ok(VoteOutcome {
        consensus_score: score,
        confidence: fact_confidence(conn, fact_id)?,
        resolved,
    })
}

/// Legacy path: vote by agent *name*, no registration required. Maintained
/// only for callers that haven't adopted registered agents; migration 9
/// mirrors these rows into the weighted table for every store opened after
/// it runs, but this path keeps writing the legacy table going forward too,
/// matching the source's dual-table behavior.
pub fn vote_legacy(
    conn: &Connection,
    fact_id: i64,
    agent_name: &str,
    value: i32,
    reason: Option<&str>,
    now: DateTime<Utc>,
    merkle_batch_size: u64,
    tuning: ConsensusTuning,
) -> Result<VoteOutcome> {
    if !fact_exists_active(conn, fact_id)? {
        return Err(EngineError::not_found(format!("fact {fact_id}")));
    }

    if value == 0 {
        conn.execute(
            "DELETE FROM consensus_votes WHERE fact_id = ?1 AND agent_name = ?2",
            params![fact_id, agent_name],
        )?;
    } else {
        conn.execute(
            "INSERT INTO consensus_votes (fact_id, agent_name, value, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fact_id, agent_name) DO UPDATE SET
                value = excluded.value, reason = excluded.reason, created_at = excluded.created_at",
            params![fact_id, agent_name, value, reason, format_timestamp(now)],
        )?;
    }

    let sum: i64 = conn
        .query_row("SELECT COALESCE(SUM(value), 0) FROM consensus_votes WHERE fact_id = ?1", params![fact_id], |r| {
            r.get(0)
        })
        .unwrap_or(0);
    let score = (1.0 + LEGACY_VOTE_STEP * sum as f64).clamp(0.0, 2.0);

    conn.execute("UPDATE facts SET consensus_score = ?1, updated_at = ?2 WHERE id = ?3", params![
        score,
        format_timestamp(now),
        fact_id
    ])?;

    let resolved = if score >= LEGACY_VERIFIED_THRESHOLD {
        set_confidence_and_resolve(conn, fact_id, "verified", FinalState::Verified, score, now, tuning.reputation_learning_rate)?
    } else if score <= LEGACY_DISPUTED_THRESHOLD {
        set_confidence_and_resolve(conn, fact_id, "disputed", FinalState::Disputed, score, now, tuning.reputation_learning_rate)?
    } else {
        None
    };

    ledger::append(
        conn,
        &fact_project(conn, fact_id)?,
        "vote",
        json!({ "fact_id": fact_id, "agent_name": agent_name, "value": value, "score": score }),
        now,
        merkle_batch_size,
    )?;

    Ok(VoteOutcome {
        consensus_score: score,
        confidence: fact_confidence(conn, fact_id)?,
        resolved,
    })
}

fn current_weighted_score(conn: &Connection, fact_id: i64) -> Result<f64> {
    Ok(conn.query_row("SELECT consensus_score FROM facts WHERE id = ?1", params![fact_id], |r| r.get(0))?)
}

fn fact_confidence(conn: &Connection, fact_id: i64) -> Result<String> {
    Ok(conn.query_row("SELECT confidence FROM facts WHERE id = ?1", params![fact_id], |r| r.get(0))?)
}

fn fact_project(conn: &Connection, fact_id: i64) -> Result<String> {
    Ok(conn.query_row("SELECT project FROM facts WHERE id = ?1", params![fact_id], |r| r.get(0))?)
}

/// `score = 1 + weighted_sum`, weighted over active votes by currently-active
/// agents, `weight` taken as `max(weight_at_vote, current_reputation)`.
/// Defaults to `1.0` with no eligible votes.
///
/// The distilled formula this is grounded on describes a weighted *average*
/// (`weighted_sum / total_weight`), but that degenerates to +-1 after a
/// single vote regardless of reputation, which contradicts the worked
/// two-vote example (first vote -> ~1.5, second -> 2.0) and the documented
/// degenerate-to-legacy-linear-rule property (a constant multiple of the
/// legacy `1 + 0.1*sum` rule, not a fixed +-1 jump). Summing un-normalized
/// matches both: `total_weight` is still computed and kept for `undecided`
/// fallback and the outcome row's `reputation_sum`.
fn recompute_weighted_score(conn: &Connection, fact_id: i64, now: DateTime<Utc>) -> Result<f64> {
    let mut stmt = conn.prepare(
        "SELECT v.value, v.weight, v.decay_factor, a.reputation_score
         FROM consensus_votes_v2 v
         JOIN agents a ON a.id = v.agent_id
         WHERE v.fact_id = ?1 AND a.is_active = 1",
    )?;
    let rows = stmt.query_map(params![fact_id], |r| {
        Ok((r.get::<_, i32>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?, r.get::<_, f64>(3)?))
    })?;

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for row in rows {
        let (value, weight, decay, current_rep) = row?;
        let effective_weight = weight.max(current_rep) * decay;
        weighted_sum += value as f64 * effective_weight;
        total_weight += effective_weight;
    }

    let score = if total_weight > 0.0 { 1.0 + weighted_sum } else { 1.0 };
    let score = score.clamp(0.0, 2.0);

    conn.execute(
        "UPDATE facts SET consensus_score = ?1, updated_at = ?2 WHERE id = ?3",
        params![score, format_timestamp(now), fact_id],
    )?;
    Ok(score)
}

fn apply_confidence_transition(
    conn: &Connection,
    fact_id: i64,
    score: f64,
    now: DateTime<Utc>,
    tuning: ConsensusTuning,
) -> Result<Option<FinalState>> {
    if score >= tuning.verified_threshold {
        set_confidence_and_resolve(conn, fact_id, "verified", FinalState::Verified, score, now, tuning.reputation_learning_rate)
    } else if score <= tuning.disputed_threshold {
        set_confidence_and_resolve(conn, fact_id, "disputed", FinalState::Disputed, score, now, tuning.reputation_learning_rate)
    } else {
        Ok(None)
    }
}

fn set_confidence_and_resolve(
    conn: &Connection,
    fact_id: i64,
    confidence: &str,
    state: FinalState,
    score: f64,
    now: DateTime<Utc>,
    learning_rate: f64,
) -> Result<Option<FinalState>> {
    let already_resolved: Option<String> = conn
        .query_row("SELECT final_state FROM consensus_outcomes WHERE fact_id = ?1", params![fact_id], |r| r.get(0))
        .optional()?;
    if already_resolved.as_deref() == Some(state.as_str()) {
        return Ok(None);
    }

    conn.execute(
        "UPDATE facts SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
        params![confidence, format_timestamp(now), fact_id],
    )?;

    let (total_votes, unique_agents, reputation_sum): (i64, i64, f64) = conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT agent_id), COALESCE(SUM(rep_at_vote), 0.0)
         FROM consensus_votes_v2 WHERE fact_id = ?1",
        params![fact_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;

    conn.execute(
        "INSERT INTO consensus_outcomes (fact_id, final_state, final_score, resolved_at, total_votes, unique_agents, reputation_sum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(fact_id) DO UPDATE SET
            final_state = excluded.final_state, final_score = excluded.final_score,
            resolved_at = excluded.resolved_at, total_votes = excluded.total_votes,
            unique_agents = excluded.unique_agents, reputation_sum = excluded.reputation_sum",
        params![fact_id, state.as_str(), score, format_timestamp(now), total_votes, unique_agents, reputation_sum],
    )?;

    update_reputations(conn, fact_id, state, learning_rate)?;
    Ok(Some(state))
}

/// EMA reputation update for every agent that voted on a just-resolved
/// fact: agrees with the final state → `observed = 1`, else `0`.
fn update_reputations(conn: &Connection, fact_id: i64, state: FinalState, alpha: f64) -> Result<()> {
    let agreement_value = if state == FinalState::Verified { 1 } else { -1 };

    let mut stmt = conn.prepare("SELECT agent_id, value FROM consensus_votes_v2 WHERE fact_id = ?1")?;
    let rows = stmt.query_map(params![fact_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i32>(1)?)))?;
    let mut votes = Vec::new();
    for row in rows {
        votes.push(row?);
    }

    for (agent_id, value) in votes {
        let agreed = value == agreement_value;
        let observed = if agreed { 1.0 } else { 0.0 };
        let old_rep: f64 =
            conn.query_row("SELECT reputation_score FROM agents WHERE id = ?1", params![agent_id], |r| r.get(0))?;
        let new_rep = (alpha * observed + (1.0 - alpha) * old_rep).clamp(0.0, 1.0);

        conn.execute(
            "UPDATE agents SET
                reputation_score = ?1,
                total_votes = total_votes + 1,
                successful_votes = successful_votes + ?2,
                disputed_votes = disputed_votes + ?3
             WHERE id = ?4",
            params![new_rep, if agreed { 1 } else { 0 }, if agreed { 0 } else { 1 }, agent_id],
        )?;
    }
    Ok(())
}

pub fn set_trust_edge(conn: &Connection, source_agent: &str, target_agent: &str, weight: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO trust_edges (source_agent, target_agent, weight) VALUES (?1, ?2, ?3)
         ON CONFLICT(source_agent, target_agent) DO UPDATE SET weight = excluded.weight",
        params![source_agent, target_agent, weight.clamp(0.0, 1.0)],
    )?;
    Ok(())
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

    fn insert_fact(conn: &Connection) -> i64 {
        conn.execute(
            "INSERT INTO facts (project, content, fact_type, valid_from, created_at, updated_at)
             VALUES ('p', 'X', 'knowledge', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn two_equal_reputation_votes_cross_verified_threshold() {
        let conn = db();
        let a1 = register_agent(&conn, "alice", "ai", None, "default", t(0)).unwrap();
        let a2 = register_agent(&conn, "bob", "ai", None, "default", t(0)).unwrap();
        let fact_id = insert_fact(&conn);

        let first = vote(&conn, fact_id, &a1, 1, None, t(1), 1000, ConsensusTuning::default()).unwrap();
        assert!((first.consensus_score - 1.5).abs() < 1e-9);

        let second = vote(&conn, fact_id, &a2, 1, None, t(2), 1000, ConsensusTuning::default()).unwrap();
        assert!((second.consensus_score - 2.0).abs() < 1e-9);
        assert_eq!(second.confidence, "verified");
        assert_eq!(second.resolved, Some(FinalState::Verified));
    }

    #[test]
    fn voting_is_idempotent() {
        let conn = db();
        let a1 = register_agent(&conn, "alice", "ai", None, "default", t(0)).unwrap();
        let fact_id = insert_fact(&conn);

        let first = vote(&conn, fact_id, &a1, 1, None, t(1), 1000, ConsensusTuning::default()).unwrap();
        let second = vote(&conn, fact_id, &a1, 1, None, t(2), 1000, ConsensusTuning::default()).unwrap();
        assert_eq!(first.consensus_score, second.consensus_score);
    }

    #[test]
    fn zero_value_with_no_existing_vote_is_noop() {
        let conn = db();
        let a1 = register_agent(&conn, "alice", "ai", None, "default", t(0)).unwrap();
        let fact_id = insert_fact(&conn);
        let outcome = vote(&conn, fact_id, &a1, 0, None, t(1), 1000, ConsensusTuning::default()).unwrap();
        assert!((outcome.consensus_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn equal_reputation_votes_degenerate_to_legacy_linear_rule_shape() {
        let conn = db();
        let a1 = register_agent(&conn, "alice", "ai", None, "default", t(0)).unwrap();
        let fact_id = insert_fact(&conn);
        let outcome = vote(&conn, fact_id, &a1, 1, None, t(1), 1000, ConsensusTuning::default()).unwrap();
        // weight == rep == 0.5 here, so weighted rule gives 1 + 1*0.5 = 1.5, a
        // 5x-scaled version of the legacy rule's deviation (1 + 0.1 = 1.1).
        assert!((outcome.consensus_score - 1.5).abs() < 1e-9);
    }
}
