//! Round registry: persisted round windows, the active-round query, and the
//! cumulative cap chain.
//!
//! Nothing here is cached.  "The" active round and every cumulative cap are
//! answered from the `rounds` table on each call, so separate processes never
//! disagree about them.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::errors::{EngineError, Result};
use crate::types::{CumulativeCaps, NewRound, QfTerms, Round, RoundKind};

/// Raw `rounds` row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RoundRow {
    id: i64,
    kind: String,
    round_number: i64,
    name: String,
    start_date: i64,
    end_date: i64,
    is_active: bool,
    token_price: Option<f64>,
    cap_per_project_usd: Option<f64>,
    cap_per_user_per_project_usd: Option<f64>,
    reputation_cap_per_user_usd: Option<f64>,
    eligible_networks: String,
    close_cap_per_project_usd: Option<f64>,
    priority: i64,
    matching_pool: f64,
    matching_pool_usd: f64,
    minimum_valid_usd: Option<f64>,
}

impl TryFrom<RoundRow> for Round {
    type Error = EngineError;

    fn try_from(row: RoundRow) -> Result<Self> {
        let kind = match row.kind.as_str() {
            "early_access" => RoundKind::EarlyAccess {
                reputation_cap_per_user_usd: row.reputation_cap_per_user_usd,
            },
            "qf" => RoundKind::Qf(QfTerms {
                eligible_networks: serde_json::from_str(&row.eligible_networks)?,
                close_cap_per_project_usd: row.close_cap_per_project_usd,
                priority: row.priority,
                matching_pool: row.matching_pool,
                matching_pool_usd: row.matching_pool_usd,
                minimum_valid_usd: row.minimum_valid_usd,
            }),
            other => {
                return Err(EngineError::Decode(format!(
                    "round {} has unknown kind {other:?}",
                    row.id
                )))
            }
        };
        Ok(Round {
            id: row.id,
            round_number: row.round_number,
            name: row.name,
            start_date: row.start_date,
            end_date: row.end_date,
            is_active: row.is_active,
            token_price: row.token_price,
            cap_per_project_usd: row.cap_per_project_usd,
            cap_per_user_per_project_usd: row.cap_per_user_per_project_usd,
            kind,
        })
    }
}

const ROUND_COLUMNS: &str = r#"
    id, kind, round_number, name, start_date, end_date, is_active, token_price,
    cap_per_project_usd, cap_per_user_per_project_usd, reputation_cap_per_user_usd,
    eligible_networks, close_cap_per_project_usd, priority, matching_pool,
    matching_pool_usd, minimum_valid_usd
"#;

/// Sum the caps of `target` and every round before it in chain order.
///
/// Rounds with an undefined cap contribute 0 without breaking the chain.
/// `rounds` may or may not contain `target`; the result is the same either
/// way and does not depend on the slice's order.
pub fn cumulative_caps(rounds: &[Round], target: &Round) -> CumulativeCaps {
    let key = target.chain_key();
    let mut chain: Vec<&Round> = rounds
        .iter()
        .filter(|r| r.id != target.id && r.chain_key() < key)
        .collect();
    chain.push(target);
    chain.sort_by_key(|r| r.chain_key());

    chain
        .into_iter()
        .fold(CumulativeCaps::default(), |acc, r| CumulativeCaps {
            per_project_usd: acc.per_project_usd + r.cap_per_project_usd.unwrap_or(0.0),
            per_user_per_project_usd: acc.per_user_per_project_usd
                + r.cap_per_user_per_project_usd.unwrap_or(0.0),
        })
}

/// Pick the active round from a set of candidates: early access wins over QF,
/// QF additionally requires `is_active`.
pub fn resolve_active(rounds: &[Round], timestamp: i64) -> Option<Round> {
    let early_access = rounds
        .iter()
        .filter(|r| matches!(r.kind, RoundKind::EarlyAccess { .. }) && r.contains(timestamp))
        .min_by_key(|r| r.chain_key());
    if let Some(round) = early_access {
        return Some(round.clone());
    }
    rounds
        .iter()
        .filter(|r| matches!(r.kind, RoundKind::Qf(_)) && r.is_active && r.contains(timestamp))
        .min_by_key(|r| r.chain_key())
        .cloned()
}

/// A round flagged for operator review.
#[derive(Debug, Clone, Serialize)]
pub struct UndefinedCaps {
    pub round_id: i64,
    pub kind: &'static str,
    pub round_number: i64,
    pub missing_project_cap: bool,
    pub missing_user_cap: bool,
}

#[derive(Clone)]
pub struct RoundRegistry {
    pool: SqlitePool,
}

impl RoundRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new round.  Rounds start active; undefined caps are accepted but
    /// logged for review.
    pub async fn create_round(&self, new: NewRound) -> Result<Round> {
        new.validate()?;

        let (reputation_cap, networks, close_cap, priority, pool_amount, pool_usd, min_usd) =
            match &new.kind {
                RoundKind::EarlyAccess {
                    reputation_cap_per_user_usd,
                } => (*reputation_cap_per_user_usd, Vec::new(), None, 0, 0.0, 0.0, None),
                RoundKind::Qf(terms) => (
                    None,
                    terms.eligible_networks.clone(),
                    terms.close_cap_per_project_usd,
                    terms.priority,
                    terms.matching_pool,
                    terms.matching_pool_usd,
                    terms.minimum_valid_usd,
                ),
            };

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO rounds
                (kind, round_number, name, start_date, end_date, is_active, token_price,
                 cap_per_project_usd, cap_per_user_per_project_usd, reputation_cap_per_user_usd,
                 eligible_networks, close_cap_per_project_usd, priority, matching_pool,
                 matching_pool_usd, minimum_valid_usd)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            RETURNING id
            "#,
        )
        .bind(new.kind.as_str())
        .bind(new.round_number)
        .bind(&new.name)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(new.token_price)
        .bind(new.cap_per_project_usd)
        .bind(new.cap_per_user_per_project_usd)
        .bind(reputation_cap)
        .bind(serde_json::to_string(&networks)?)
        .bind(close_cap)
        .bind(priority)
        .bind(pool_amount)
        .bind(pool_usd)
        .bind(min_usd)
        .fetch_one(&self.pool)
        .await?;

        let round = self.get_round(id).await?;
        info!(
            "Created {} round {} (#{}) window [{}, {}]",
            round.kind.as_str(),
            round.id,
            round.round_number,
            round.start_date,
            round.end_date
        );
        if round.has_undefined_caps() {
            warn!(
                "Round {} has an undefined cap; it contributes 0 to the cumulative chain",
                round.id
            );
        }
        Ok(round)
    }

    pub async fn get_round(&self, id: i64) -> Result<Round> {
        let row = sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::RoundNotFound(id))?;
        Round::try_from(row)
    }

    /// Every round, in chain order.
    pub async fn all_rounds(&self) -> Result<Vec<Round>> {
        let rows = sqlx::query_as::<_, RoundRow>(&format!(
            "SELECT {ROUND_COLUMNS} FROM rounds ORDER BY start_date ASC, round_number ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut rounds = rows
            .into_iter()
            .map(Round::try_from)
            .collect::<Result<Vec<_>>>()?;
        rounds.sort_by_key(|r| r.chain_key());
        Ok(rounds)
    }

    /// The single round active at `timestamp`, if any.
    pub async fn active_round_at(&self, timestamp: i64) -> Result<Option<Round>> {
        let rows = sqlx::query_as::<_, RoundRow>(&format!(
            r#"
            SELECT {ROUND_COLUMNS} FROM rounds
            WHERE  start_date <= ?1 AND end_date >= ?1
              AND  (kind = 'early_access' OR is_active = 1)
            "#
        ))
        .bind(timestamp)
        .fetch_all(&self.pool)
        .await?;
        let candidates = rows
            .into_iter()
            .map(Round::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(resolve_active(&candidates, timestamp))
    }

    /// Cumulative caps of `round`, recomputed from the stored chain.
    pub async fn cumulative_caps(&self, round: &Round) -> Result<CumulativeCaps> {
        let rounds = self.all_rounds().await?;
        Ok(cumulative_caps(&rounds, round))
    }

    /// Ids of every round strictly before `round` in chain order.
    pub async fn earlier_round_ids(&self, round: &Round) -> Result<Vec<i64>> {
        let key = round.chain_key();
        Ok(self
            .all_rounds()
            .await?
            .into_iter()
            .filter(|r| r.chain_key() < key)
            .map(|r| r.id)
            .collect())
    }

    /// Flip `is_active` off for every round whose end date has passed.
    ///
    /// The conditional update makes repeated or concurrent calls harmless:
    /// each round is returned by exactly one call.
    pub async fn deactivate_expired(&self, now: i64) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "UPDATE rounds SET is_active = 0 WHERE is_active = 1 AND end_date < ?1 RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();
        if !ids.is_empty() {
            info!("Deactivated {} expired round(s): {:?}", ids.len(), ids);
        }
        Ok(ids)
    }

    /// Record that `project_id` may receive donations through a QF round.
    pub async fn enroll_project(&self, project_id: i64, qf_round_id: i64) -> Result<()> {
        let round = self.get_round(qf_round_id).await?;
        if round.qf_terms().is_none() {
            return Err(EngineError::InvalidRound(format!(
                "round {qf_round_id} is not a QF round"
            )));
        }
        sqlx::query("INSERT OR IGNORE INTO project_qf_rounds (project_id, qf_round_id) VALUES (?1, ?2)")
            .bind(project_id)
            .bind(qf_round_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// QF rounds a project is enrolled in.
    pub async fn project_qf_rounds(&self, project_id: i64) -> Result<Vec<Round>> {
        let rows = sqlx::query_as::<_, RoundRow>(&format!(
            r#"
            SELECT {ROUND_COLUMNS} FROM rounds
            WHERE  kind = 'qf'
              AND  id IN (SELECT qf_round_id FROM project_qf_rounds WHERE project_id = ?1)
            "#
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Round::try_from).collect()
    }

    pub async fn enrolled_projects(&self, qf_round_id: i64) -> Result<Vec<i64>> {
        enrolled_projects(&self.pool, qf_round_id).await
    }

    /// Active QF rounds, used by the scheduler's matching refresh.
    pub async fn active_qf_rounds(&self) -> Result<Vec<Round>> {
        Ok(self
            .all_rounds()
            .await?
            .into_iter()
            .filter(|r| r.is_active && r.qf_terms().is_some())
            .collect())
    }

    /// Rounds with an undefined primary cap.
    pub async fn rounds_missing_caps(&self) -> Result<Vec<UndefinedCaps>> {
        Ok(self
            .all_rounds()
            .await?
            .into_iter()
            .filter(Round::has_undefined_caps)
            .map(|r| UndefinedCaps {
                round_id: r.id,
                kind: r.kind.as_str(),
                round_number: r.round_number,
                missing_project_cap: r.cap_per_project_usd.is_none(),
                missing_user_cap: r.cap_per_user_per_project_usd.is_none(),
            })
            .collect())
    }
}

/// Projects enrolled in a QF round, ordered by id.
pub(crate) async fn enrolled_projects<'e, E>(executor: E, qf_round_id: i64) -> Result<Vec<i64>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT project_id FROM project_qf_rounds WHERE qf_round_id = ?1 ORDER BY project_id",
    )
    .bind(qf_round_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
