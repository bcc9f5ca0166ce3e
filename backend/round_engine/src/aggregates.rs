//! Aggregate store: per (project, round), per (project, user) and reporting
//! summaries derived from the donation ledger.
//!
//! ## Write policy
//!
//! `project_round_records` and `project_user_records` are never incremented.
//! Every write re-sums the verified donations sharing the row's key, so a
//! donation moving pending → verified → failed in any order leaves the row
//! equal to what the ledger says.  A write to one round also re-sums the
//! existing records of every later round, whose carry-over depends on it.
//! `project_donation_summaries` is the exception: it is an additive audit
//! trail and only ever receives deltas.
//!
//! Ledger writes made on the engine's behalf (the capped insert and status
//! transitions) share the aggregate transaction, so the ledger, the records
//! and the summary commit or roll back together.
//!
//! ## Concurrency
//!
//! Writers for the same key are serialized twice: by an in-process
//! [`KeyedLocks`] and by a `BEGIN IMMEDIATE` transaction that wraps the whole
//! read-sum-write.  A busy database surfaces as
//! [`EngineError::AggregateWriteConflict`], which this module retries with
//! back-off before giving up.

use std::time::Duration;

use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::db;
use crate::errors::{EngineError, Result};
use crate::ledger;
use crate::locks::KeyedLocks;
use crate::registry::RoundRegistry;
use crate::types::{
    Donation, DonationStatus, NewDonation, ProjectDonationSummary, ProjectRoundRecord,
    ProjectUserRecord, RoundRef,
};

const INITIAL_RETRY_BACKOFF_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AggregateKey {
    ProjectUser(i64, i64),
    ProjectRound(i64, i64),
}

/// Signed additive change applied to a reporting summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryDelta {
    pub amount: f64,
    pub usd_amount: f64,
    pub count: i64,
}

impl SummaryDelta {
    pub fn credit(amount: f64, usd_amount: f64) -> Self {
        Self {
            amount,
            usd_amount,
            count: 1,
        }
    }

    pub fn reversal(amount: f64, usd_amount: f64) -> Self {
        Self {
            amount: -amount,
            usd_amount: -usd_amount,
            count: -1,
        }
    }
}

pub struct AggregateStore {
    pool: SqlitePool,
    registry: RoundRegistry,
    locks: KeyedLocks<AggregateKey>,
    max_attempts: u32,
}

impl AggregateStore {
    pub fn new(pool: SqlitePool, registry: RoundRegistry, max_attempts: u32) -> Self {
        Self {
            pool,
            registry,
            locks: KeyedLocks::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Re-derive the aggregates touched by a newly verified donation and add
    /// it to the reporting summary.
    pub async fn record_donation(
        &self,
        project_id: i64,
        user_id: i64,
        round: Option<RoundRef>,
        amount: f64,
        usd_amount: f64,
    ) -> Result<()> {
        self.recompute(
            project_id,
            user_id,
            round,
            Some(SummaryDelta::credit(amount, usd_amount)),
        )
        .await
    }

    /// Re-derive aggregates after a status change.  `summary` carries the
    /// audit-trail delta, if any.
    pub async fn recompute(
        &self,
        project_id: i64,
        user_id: i64,
        round: Option<RoundRef>,
        summary: Option<SummaryDelta>,
    ) -> Result<()> {
        let plan = self.refresh_plan(round).await?;
        let _guards = self.lock(project_id, user_id, round).await;

        let key = format!("project {project_id} user {user_id} round {round:?}");
        let key_ref = key.as_str();
        let plan = plan.as_slice();
        let pool = &self.pool;
        self.with_retry(key_ref, move || async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| EngineError::from_write(e, key_ref))?;
            db::begin_immediate(&mut conn, key_ref).await?;
            let result = refresh(&mut conn, project_id, user_id, plan, summary).await;
            db::finish(&mut conn, key_ref, result).await
        })
        .await?;

        debug!("Aggregates recomputed for {key}");
        Ok(())
    }

    /// Append a verified donation to the ledger and credit it, all in one
    /// transaction.  Returns the new donation id.
    pub async fn insert_verified_donation(&self, donation: &NewDonation) -> Result<i64> {
        let (project_id, user_id) = (donation.project_id, donation.user_id);
        let plan = self.refresh_plan(donation.round).await?;
        let _guards = self.lock(project_id, user_id, donation.round).await;

        let key = format!(
            "project {project_id} user {user_id} round {:?}",
            donation.round
        );
        let key_ref = key.as_str();
        let plan = plan.as_slice();
        let pool = &self.pool;
        let credit = SummaryDelta::credit(donation.amount, donation.usd_amount);
        self.with_retry(key_ref, move || async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| EngineError::from_write(e, key_ref))?;
            db::begin_immediate(&mut conn, key_ref).await?;
            let result: Result<i64> = async {
                let id = ledger::insert_row(&mut *conn, donation, DonationStatus::Verified).await?;
                refresh(&mut conn, project_id, user_id, plan, Some(credit)).await?;
                Ok(id)
            }
            .await;
            db::finish(&mut conn, key_ref, result).await
        })
        .await
    }

    /// Move `donation` from its current status to `to` and re-derive its
    /// aggregates in the same transaction.
    ///
    /// Returns `false`, writing nothing, when the stored status is no longer
    /// `donation.status`.
    pub async fn transition_donation(
        &self,
        donation: &Donation,
        to: DonationStatus,
    ) -> Result<bool> {
        let (project_id, user_id, from) =
            (donation.project_id, donation.user_id, donation.status);
        let summary = match (from, to) {
            (_, DonationStatus::Verified) => {
                Some(SummaryDelta::credit(donation.amount, donation.usd_amount))
            }
            (DonationStatus::Verified, _) => {
                Some(SummaryDelta::reversal(donation.amount, donation.usd_amount))
            }
            _ => None,
        };
        let plan = self.refresh_plan(donation.round).await?;
        let _guards = self.lock(project_id, user_id, donation.round).await;

        let key = format!("donation {} {} -> {}", donation.id, from.as_str(), to.as_str());
        let key_ref = key.as_str();
        let plan = plan.as_slice();
        let pool = &self.pool;
        let id = donation.id;
        self.with_retry(key_ref, move || async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| EngineError::from_write(e, key_ref))?;
            db::begin_immediate(&mut conn, key_ref).await?;
            let result: Result<bool> = async {
                if !ledger::transition_row(&mut *conn, id, from, to).await? {
                    return Ok(false);
                }
                refresh(&mut conn, project_id, user_id, plan, summary).await?;
                Ok(true)
            }
            .await;
            db::finish(&mut conn, key_ref, result).await
        })
        .await
    }

    /// Return the (project, round) record, re-derived from the ledger.
    pub async fn get_or_create_project_round(
        &self,
        project_id: i64,
        round_id: i64,
    ) -> Result<ProjectRoundRecord> {
        let round = self.registry.get_round(round_id).await?;
        let earlier_ids = self.registry.earlier_round_ids(&round).await?;
        let key = format!("project {project_id} round {round_id}");
        let key_ref = key.as_str();
        let earlier_ids = earlier_ids.as_slice();
        let pool = &self.pool;

        self.with_retry(key_ref, move || async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| EngineError::from_write(e, key_ref))?;
            db::begin_immediate(&mut conn, key_ref).await?;
            let result: Result<ProjectRoundRecord> = async {
                ensure_project_round(&mut conn, project_id, round_id).await?;
                resum_project_round(&mut conn, project_id, round_id, earlier_ids).await?;
                read_project_round(&mut conn, project_id, round_id).await
            }
            .await;
            db::finish(&mut conn, key_ref, result).await
        })
        .await
    }

    /// Return the (project, user) record, re-derived from the ledger.
    pub async fn get_or_create_project_user(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<ProjectUserRecord> {
        let key = format!("project {project_id} user {user_id}");
        let key_ref = key.as_str();
        let pool = &self.pool;

        self.with_retry(key_ref, move || async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| EngineError::from_write(e, key_ref))?;
            db::begin_immediate(&mut conn, key_ref).await?;
            let result: Result<ProjectUserRecord> = async {
                ensure_project_user(&mut conn, project_id, user_id).await?;
                resum_project_user(&mut conn, project_id, user_id).await?;
                read_project_user(&mut conn, project_id, user_id).await
            }
            .await;
            db::finish(&mut conn, key_ref, result).await
        })
        .await
    }

    /// Return the reporting summary, inserting a zeroed row if absent.
    pub async fn get_or_create_summary(
        &self,
        project_id: i64,
        round_id: i64,
    ) -> Result<ProjectDonationSummary> {
        let row = sqlx::query_as::<_, ProjectDonationSummary>(
            r#"
            INSERT INTO project_donation_summaries (project_id, round_id)
            VALUES (?1, ?2)
            ON CONFLICT (project_id, round_id) DO UPDATE SET project_id = project_id
            RETURNING project_id, round_id, total_donation_amount,
                      total_donation_usd_amount, donation_count
            "#,
        )
        .bind(project_id)
        .bind(round_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Sum of a user's QF totals across every project, in token units.
    pub async fn user_qf_total_all_projects(&self, user_id: i64) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(qf_total_donation_amount), 0.0) FROM project_user_records WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// Every stored (project, round) record of a round.
    pub async fn project_round_records(&self, round_id: i64) -> Result<Vec<ProjectRoundRecord>> {
        let rows = sqlx::query_as::<_, ProjectRoundRecord>(
            r#"
            SELECT project_id, round_id, total_donation_amount, total_donation_usd_amount,
                   cumulative_past_rounds_donation_amounts
            FROM   project_round_records
            WHERE  round_id = ?1
            ORDER  BY project_id ASC
            "#,
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// `(round id, earlier round ids)` for `round` and every round after it
    /// in chain order.  A donation in one round shifts the carry-over of all
    /// later rounds.
    async fn refresh_plan(&self, round: Option<RoundRef>) -> Result<Vec<(i64, Vec<i64>)>> {
        let Some(round) = round else {
            return Ok(Vec::new());
        };
        let chain: Vec<i64> = self.registry.all_rounds().await?.iter().map(|r| r.id).collect();
        let position = chain
            .iter()
            .position(|id| *id == round.id())
            .ok_or(EngineError::RoundNotFound(round.id()))?;
        Ok((position..chain.len())
            .map(|i| (chain[i], chain[..i].to_vec()))
            .collect())
    }

    async fn lock(
        &self,
        project_id: i64,
        user_id: i64,
        round: Option<RoundRef>,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        let user_guard = self
            .locks
            .lock(AggregateKey::ProjectUser(project_id, user_id))
            .await;
        let round_guard = match round {
            Some(r) => Some(
                self.locks
                    .lock(AggregateKey::ProjectRound(project_id, r.id()))
                    .await,
            ),
            None => None,
        };
        (user_guard, round_guard)
    }

    async fn with_retry<T, F, Fut>(&self, key: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = INITIAL_RETRY_BACKOFF_MS;
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Err(e) if e.is_transient() && tries < self.max_attempts => {
                    warn!(
                        "Aggregate write conflict on {key} (attempt {tries}/{}), retrying in {backoff}ms",
                        self.max_attempts
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Row helpers (all run inside an open transaction)
// ─────────────────────────────────────────────────────────

/// Re-sum the (project, user) record and every planned (project, round)
/// record, then apply the summary delta to the donation's own round.
///
/// Only the first planned round's record is created; later rounds are
/// refreshed when a record already exists.
async fn refresh(
    conn: &mut SqliteConnection,
    project_id: i64,
    user_id: i64,
    plan: &[(i64, Vec<i64>)],
    summary: Option<SummaryDelta>,
) -> Result<()> {
    ensure_project_user(conn, project_id, user_id).await?;
    resum_project_user(conn, project_id, user_id).await?;
    for (i, (round_id, earlier_ids)) in plan.iter().enumerate() {
        if i == 0 {
            ensure_project_round(conn, project_id, *round_id).await?;
        }
        resum_project_round(conn, project_id, *round_id, earlier_ids).await?;
    }
    if let (Some((round_id, _)), Some(delta)) = (plan.first(), summary) {
        bump_summary(conn, project_id, *round_id, delta).await?;
    }
    Ok(())
}

/// Returns `true` when the row was created by this call.
async fn ensure_project_round(
    conn: &mut SqliteConnection,
    project_id: i64,
    round_id: i64,
) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO project_round_records (project_id, round_id) VALUES (?1, ?2)",
    )
    .bind(project_id)
    .bind(round_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted == 1)
}

async fn ensure_project_user(
    conn: &mut SqliteConnection,
    project_id: i64,
    user_id: i64,
) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO project_user_records (project_id, user_id) VALUES (?1, ?2)",
    )
    .bind(project_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted == 1)
}

async fn resum_project_round(
    conn: &mut SqliteConnection,
    project_id: i64,
    round_id: i64,
    earlier_round_ids: &[i64],
) -> Result<()> {
    let (total, total_usd): (f64, f64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0.0), COALESCE(SUM(usd_amount), 0.0)
        FROM   donations
        WHERE  project_id = ?1
          AND  status = 'verified'
          AND  COALESCE(early_access_round_id, qf_round_id) = ?2
        "#,
    )
    .bind(project_id)
    .bind(round_id)
    .fetch_one(&mut *conn)
    .await?;

    let (past,): (f64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0.0)
        FROM   donations
        WHERE  project_id = ?1
          AND  status = 'verified'
          AND  COALESCE(early_access_round_id, qf_round_id) IN (SELECT value FROM json_each(?2))
        "#,
    )
    .bind(project_id)
    .bind(serde_json::to_string(earlier_round_ids)?)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE project_round_records
        SET    total_donation_amount = ?3,
               total_donation_usd_amount = ?4,
               cumulative_past_rounds_donation_amounts = ?5,
               updated_at = strftime('%s', 'now')
        WHERE  project_id = ?1 AND round_id = ?2
        "#,
    )
    .bind(project_id)
    .bind(round_id)
    .bind(total)
    .bind(total_usd)
    .bind(past)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn resum_project_user(
    conn: &mut SqliteConnection,
    project_id: i64,
    user_id: i64,
) -> Result<()> {
    let (total, ea_total, qf_total): (f64, f64, f64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0.0),
               COALESCE(SUM(CASE WHEN early_access_round_id IS NOT NULL THEN amount END), 0.0),
               COALESCE(SUM(CASE WHEN qf_round_id IS NOT NULL THEN amount END), 0.0)
        FROM   donations
        WHERE  project_id = ?1 AND user_id = ?2 AND status = 'verified'
        "#,
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE project_user_records
        SET    total_donation_amount = ?3,
               ea_total_donation_amount = ?4,
               qf_total_donation_amount = ?5,
               updated_at = strftime('%s', 'now')
        WHERE  project_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(project_id)
    .bind(user_id)
    .bind(total)
    .bind(ea_total)
    .bind(qf_total)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn bump_summary(
    conn: &mut SqliteConnection,
    project_id: i64,
    round_id: i64,
    delta: SummaryDelta,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO project_donation_summaries
            (project_id, round_id, total_donation_amount, total_donation_usd_amount, donation_count)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (project_id, round_id) DO UPDATE SET
            total_donation_amount     = total_donation_amount + excluded.total_donation_amount,
            total_donation_usd_amount = total_donation_usd_amount + excluded.total_donation_usd_amount,
            donation_count            = donation_count + excluded.donation_count,
            updated_at                = strftime('%s', 'now')
        "#,
    )
    .bind(project_id)
    .bind(round_id)
    .bind(delta.amount)
    .bind(delta.usd_amount)
    .bind(delta.count)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_project_round(
    conn: &mut SqliteConnection,
    project_id: i64,
    round_id: i64,
) -> Result<ProjectRoundRecord> {
    let row = sqlx::query_as::<_, ProjectRoundRecord>(
        r#"
        SELECT project_id, round_id, total_donation_amount, total_donation_usd_amount,
               cumulative_past_rounds_donation_amounts
        FROM   project_round_records
        WHERE  project_id = ?1 AND round_id = ?2
        "#,
    )
    .bind(project_id)
    .bind(round_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

async fn read_project_user(
    conn: &mut SqliteConnection,
    project_id: i64,
    user_id: i64,
) -> Result<ProjectUserRecord> {
    let row = sqlx::query_as::<_, ProjectUserRecord>(
        r#"
        SELECT project_id, user_id, total_donation_amount, ea_total_donation_amount,
               qf_total_donation_amount
        FROM   project_user_records
        WHERE  project_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}
