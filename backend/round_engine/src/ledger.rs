//! Donation ledger reads and writes.
//!
//! The ledger is owned by the surrounding platform; the engine only needs to
//! append donations on its capped path, flip statuses, and read verified rows.

use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::types::{Donation, DonationStatus, NewDonation, RoundRef};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DonationRow {
    id: i64,
    project_id: i64,
    user_id: i64,
    amount: f64,
    usd_amount: f64,
    status: String,
    early_access_round_id: Option<i64>,
    qf_round_id: Option<i64>,
    created_at: i64,
}

impl TryFrom<DonationRow> for Donation {
    type Error = EngineError;

    fn try_from(row: DonationRow) -> Result<Self> {
        let status = DonationStatus::parse(&row.status).ok_or_else(|| {
            EngineError::Decode(format!(
                "donation {} has unknown status {:?}",
                row.id, row.status
            ))
        })?;
        Ok(Donation {
            id: row.id,
            project_id: row.project_id,
            user_id: row.user_id,
            amount: row.amount,
            usd_amount: row.usd_amount,
            status,
            round: RoundRef::from_columns(row.early_access_round_id, row.qf_round_id),
            created_at: row.created_at,
        })
    }
}

const DONATION_COLUMNS: &str = r#"
    id, project_id, user_id, amount, usd_amount, status,
    early_access_round_id, qf_round_id, created_at
"#;

#[derive(Clone)]
pub struct DonationLedger {
    pool: SqlitePool,
}

impl DonationLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, donation: &NewDonation, status: DonationStatus) -> Result<Donation> {
        let id = insert_row(&self.pool, donation, status).await?;
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Donation> {
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::DonationNotFound(id))?;
        Donation::try_from(row)
    }

    /// Verified donations of a project, optionally narrowed to one user.
    pub async fn verified_for_project(
        &self,
        project_id: i64,
        user_id: Option<i64>,
    ) -> Result<Vec<Donation>> {
        let rows = sqlx::query_as::<_, DonationRow>(&format!(
            r#"
            SELECT {DONATION_COLUMNS} FROM donations
            WHERE  project_id = ?1 AND (?2 IS NULL OR user_id = ?2) AND status = 'verified'
            ORDER  BY id ASC
            "#
        ))
        .bind(project_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Donation::try_from).collect()
    }
}

// ─────────────────────────────────────────────────────────
// Row helpers, usable on the pool or inside an open transaction
// ─────────────────────────────────────────────────────────

pub(crate) async fn insert_row<'e, E>(
    executor: E,
    donation: &NewDonation,
    status: DonationStatus,
) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (early_access, qf) = donation
        .round
        .map(|r| r.columns())
        .unwrap_or((None, None));
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO donations
            (project_id, user_id, amount, usd_amount, status,
             early_access_round_id, qf_round_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING id
        "#,
    )
    .bind(donation.project_id)
    .bind(donation.user_id)
    .bind(donation.amount)
    .bind(donation.usd_amount)
    .bind(status.as_str())
    .bind(early_access)
    .bind(qf)
    .bind(donation.created_at)
    .fetch_one(executor)
    .await?;
    debug!(
        "Ledger: donation {id} ({}) project={} user={} amount={}",
        status.as_str(),
        donation.project_id,
        donation.user_id,
        donation.amount
    );
    Ok(id)
}

/// Conditional status flip; `false` when the row was not in `from`.
pub(crate) async fn transition_row<'e, E>(
    executor: E,
    id: i64,
    from: DonationStatus,
    to: DonationStatus,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let moved = sqlx::query_as::<_, (i64,)>(
        "UPDATE donations SET status = ?1 WHERE id = ?2 AND status = ?3 RETURNING id",
    )
    .bind(to.as_str())
    .bind(id)
    .bind(from.as_str())
    .fetch_optional(executor)
    .await?;
    Ok(moved.is_some())
}

/// Verified donations of a QF round, ordered by id.
pub(crate) async fn verified_for_qf_round<'e, E>(
    executor: E,
    qf_round_id: i64,
) -> Result<Vec<Donation>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        r#"
        SELECT {DONATION_COLUMNS} FROM donations
        WHERE  qf_round_id = ?1 AND status = 'verified'
        ORDER  BY id ASC
        "#
    ))
    .bind(qf_round_id)
    .fetch_all(executor)
    .await?;
    rows.into_iter().map(Donation::try_from).collect()
}
