//! Quadratic-funding matching for a QF round.
//!
//! For each project the verified donations are grouped by donor and summed
//! in USD.  The project's weight is the square of the sum of the square roots
//! of those donor totals, and the round's matching pool is split in proportion
//! to weight.
//!
//! Two views are produced side by side:
//!
//! * **estimated**: every verified donation;
//! * **actual**: the same pipeline after dropping donations by excluded
//!   (sybil) donors and individually excluded (fraudulent) donations.  The
//!   actual view keeps the donation and donor id sets from before and after
//!   exclusion so the effect of the analysis can be audited.
//!
//! Computation is a pure function of the ledger snapshot
//! ([`compute_round_matching`]); iteration runs over sorted maps so repeated
//! runs produce bit-identical floats.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::db;
use crate::errors::{EngineError, Result};
use crate::ledger;
use crate::registry::{self, RoundRegistry};
use crate::types::{Donation, QfTerms};

/// Figures shared by both matching views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingFigures {
    pub total_usd: f64,
    pub donations_sqrt_root_sum: f64,
    /// The project's QF weight.
    pub sqrt_root_sum_squared: f64,
    pub unique_donors_count: i64,
    pub qualified_donors_count: i64,
    pub matching: f64,
}

/// The fraud-adjusted view plus what was there before exclusion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActualMatching {
    #[serde(flatten)]
    pub figures: MatchingFigures,
    pub total_usd_before: f64,
    pub donation_ids_before: Vec<i64>,
    pub donation_ids_after: Vec<i64>,
    pub donor_ids_before: Vec<i64>,
    pub donor_ids_after: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMatching {
    pub project_id: i64,
    pub estimated: MatchingFigures,
    pub actual: ActualMatching,
}

/// Donors and donations removed from the actual view.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub sybil_users: HashSet<i64>,
    pub fraudulent_donations: HashSet<i64>,
}

impl Exclusions {
    fn excludes(&self, donation: &Donation) -> bool {
        self.sybil_users.contains(&donation.user_id)
            || self.fraudulent_donations.contains(&donation.id)
    }
}

/// Per-project intermediate: donor → summed USD, plus the ids seen.
#[derive(Default)]
struct ProjectTally {
    donor_totals: BTreeMap<i64, f64>,
    donation_ids: BTreeSet<i64>,
}

impl ProjectTally {
    fn add(&mut self, donation: &Donation) {
        *self.donor_totals.entry(donation.user_id).or_insert(0.0) += donation.usd_amount;
        self.donation_ids.insert(donation.id);
    }

    /// Figures without `matching`, which needs the round-wide weight.
    fn figures(&self, minimum_valid_usd: f64) -> MatchingFigures {
        let total_usd = self.donor_totals.values().sum();
        let qualified: Vec<f64> = self
            .donor_totals
            .values()
            .copied()
            .filter(|t| *t > 0.0 && *t >= minimum_valid_usd)
            .collect();
        let donations_sqrt_root_sum: f64 = qualified.iter().map(|t| t.sqrt()).sum();
        MatchingFigures {
            total_usd,
            donations_sqrt_root_sum,
            sqrt_root_sum_squared: donations_sqrt_root_sum * donations_sqrt_root_sum,
            unique_donors_count: self.donor_totals.len() as i64,
            qualified_donors_count: qualified.len() as i64,
            matching: 0.0,
        }
    }

    fn donor_ids(&self) -> Vec<i64> {
        self.donor_totals.keys().copied().collect()
    }
}

/// Split `pool` across `figures` in proportion to weight.
fn distribute(pool: f64, figures: &mut [&mut MatchingFigures]) {
    let total_weight: f64 = figures.iter().map(|f| f.sqrt_root_sum_squared).sum();
    for f in figures.iter_mut() {
        f.matching = if total_weight > 0.0 {
            pool * f.sqrt_root_sum_squared / total_weight
        } else {
            0.0
        };
    }
}

/// Compute estimated and actual matching for every project of a round.
///
/// `projects` are the round's enrolled projects; each gets a row even with
/// no donations.  Projects that received donations without being enrolled
/// get a row too.  Only verified donations should be passed in.
pub fn compute_round_matching(
    terms: &QfTerms,
    projects: &[i64],
    donations: &[Donation],
    exclusions: &Exclusions,
) -> Vec<ProjectMatching> {
    let minimum_valid_usd = terms.minimum_valid_usd.unwrap_or(0.0);

    let mut before: BTreeMap<i64, ProjectTally> = projects
        .iter()
        .map(|id| (*id, ProjectTally::default()))
        .collect();
    let mut after: BTreeMap<i64, ProjectTally> = projects
        .iter()
        .map(|id| (*id, ProjectTally::default()))
        .collect();

    let mut ordered: Vec<&Donation> = donations.iter().collect();
    ordered.sort_by_key(|d| d.id);
    for donation in ordered {
        before.entry(donation.project_id).or_default().add(donation);
        let tally = after.entry(donation.project_id).or_default();
        if !exclusions.excludes(donation) {
            tally.add(donation);
        }
    }

    let mut rows: Vec<ProjectMatching> = before
        .iter()
        .map(|(project_id, tally_before)| {
            let tally_after = &after[project_id];
            let before_figures = tally_before.figures(minimum_valid_usd);
            ProjectMatching {
                project_id: *project_id,
                estimated: before_figures.clone(),
                actual: ActualMatching {
                    figures: tally_after.figures(minimum_valid_usd),
                    total_usd_before: before_figures.total_usd,
                    donation_ids_before: tally_before.donation_ids.iter().copied().collect(),
                    donation_ids_after: tally_after.donation_ids.iter().copied().collect(),
                    donor_ids_before: tally_before.donor_ids(),
                    donor_ids_after: tally_after.donor_ids(),
                },
            }
        })
        .collect();

    distribute(
        terms.matching_pool,
        &mut rows.iter_mut().map(|r| &mut r.estimated).collect::<Vec<_>>(),
    );
    distribute(
        terms.matching_pool,
        &mut rows
            .iter_mut()
            .map(|r| &mut r.actual.figures)
            .collect::<Vec<_>>(),
    );
    rows
}

#[derive(Debug, sqlx::FromRow)]
struct EstimatedRow {
    project_id: i64,
    total_usd: f64,
    donations_sqrt_root_sum: f64,
    sqrt_root_sum_squared: f64,
    unique_donors_count: i64,
    qualified_donors_count: i64,
    matching: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct ActualRow {
    project_id: i64,
    total_usd: f64,
    donations_sqrt_root_sum: f64,
    sqrt_root_sum_squared: f64,
    unique_donors_count: i64,
    qualified_donors_count: i64,
    matching: f64,
    total_usd_before: f64,
    donation_ids_before: String,
    donation_ids_after: String,
    donor_ids_before: String,
    donor_ids_after: String,
}

pub struct MatchingCalculator {
    pool: SqlitePool,
    registry: RoundRegistry,
}

impl MatchingCalculator {
    pub fn new(pool: SqlitePool, registry: RoundRegistry) -> Self {
        Self { pool, registry }
    }

    /// Recompute a round's matching from the ledger and replace its stored
    /// rows.
    ///
    /// Enrollment, donations and exclusions are read inside the same write
    /// transaction that replaces the rows, so the stored figures always
    /// describe a single ledger state.
    pub async fn recompute(&self, qf_round_id: i64) -> Result<Vec<ProjectMatching>> {
        let round = self.registry.get_round(qf_round_id).await?;
        let terms = round.qf_terms().ok_or_else(|| {
            EngineError::InvalidRound(format!("round {qf_round_id} is not a QF round"))
        })?;

        let key = format!("matching of round {qf_round_id}");
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::from_write(e, &key))?;
        db::begin_immediate(&mut conn, &key).await?;
        let result: Result<(Vec<ProjectMatching>, usize)> = async {
            let projects = registry::enrolled_projects(&mut *conn, qf_round_id).await?;
            let donations = ledger::verified_for_qf_round(&mut *conn, qf_round_id).await?;
            let exclusions = read_exclusions(&mut conn, qf_round_id).await?;
            let rows = compute_round_matching(terms, &projects, &donations, &exclusions);
            replace_rows(&mut conn, qf_round_id, &rows).await?;
            Ok((rows, donations.len()))
        }
        .await;
        let (rows, donation_count) = db::finish(&mut conn, &key, result).await?;

        let estimated_total: f64 = rows.iter().map(|r| r.estimated.matching).sum();
        info!(
            "Recomputed matching for round {qf_round_id}: {} projects, {} donations, pool {} (distributed {estimated_total:.2})",
            rows.len(),
            donation_count,
            terms.matching_pool
        );
        Ok(rows)
    }

    /// Stored matching figures of a round, ordered by project id.
    pub async fn matching_for(&self, qf_round_id: i64) -> Result<Vec<ProjectMatching>> {
        let estimated = sqlx::query_as::<_, EstimatedRow>(
            r#"
            SELECT project_id, total_usd, donations_sqrt_root_sum, sqrt_root_sum_squared,
                   unique_donors_count, qualified_donors_count, matching
            FROM   matching_estimated
            WHERE  qf_round_id = ?1
            ORDER  BY project_id ASC
            "#,
        )
        .bind(qf_round_id)
        .fetch_all(&self.pool)
        .await?;

        let actual = sqlx::query_as::<_, ActualRow>(
            r#"
            SELECT project_id, total_usd, donations_sqrt_root_sum, sqrt_root_sum_squared,
                   unique_donors_count, qualified_donors_count, matching, total_usd_before,
                   donation_ids_before, donation_ids_after, donor_ids_before, donor_ids_after
            FROM   matching_actual
            WHERE  qf_round_id = ?1
            "#,
        )
        .bind(qf_round_id)
        .fetch_all(&self.pool)
        .await?;
        let mut actual: BTreeMap<i64, ActualRow> =
            actual.into_iter().map(|r| (r.project_id, r)).collect();

        estimated
            .into_iter()
            .map(|e| -> Result<ProjectMatching> {
                let a = actual.remove(&e.project_id).ok_or_else(|| {
                    EngineError::Decode(format!(
                        "round {qf_round_id} project {} has no actual matching row",
                        e.project_id
                    ))
                })?;
                Ok(ProjectMatching {
                    project_id: e.project_id,
                    estimated: MatchingFigures {
                        total_usd: e.total_usd,
                        donations_sqrt_root_sum: e.donations_sqrt_root_sum,
                        sqrt_root_sum_squared: e.sqrt_root_sum_squared,
                        unique_donors_count: e.unique_donors_count,
                        qualified_donors_count: e.qualified_donors_count,
                        matching: e.matching,
                    },
                    actual: ActualMatching {
                        figures: MatchingFigures {
                            total_usd: a.total_usd,
                            donations_sqrt_root_sum: a.donations_sqrt_root_sum,
                            sqrt_root_sum_squared: a.sqrt_root_sum_squared,
                            unique_donors_count: a.unique_donors_count,
                            qualified_donors_count: a.qualified_donors_count,
                            matching: a.matching,
                        },
                        total_usd_before: a.total_usd_before,
                        donation_ids_before: serde_json::from_str(&a.donation_ids_before)?,
                        donation_ids_after: serde_json::from_str(&a.donation_ids_after)?,
                        donor_ids_before: serde_json::from_str(&a.donor_ids_before)?,
                        donor_ids_after: serde_json::from_str(&a.donor_ids_after)?,
                    },
                })
            })
            .collect()
    }

    /// Exclude every donation of `user_id` from the round's actual view.
    pub async fn exclude_sybil(&self, qf_round_id: i64, user_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO sybil_exclusions (qf_round_id, user_id) VALUES (?1, ?2)")
            .bind(qf_round_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        info!("User {user_id} excluded as sybil from round {qf_round_id}");
        Ok(())
    }

    /// Exclude a single donation from the round's actual view.
    pub async fn exclude_donation(&self, qf_round_id: i64, donation_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO fraud_exclusions (qf_round_id, donation_id) VALUES (?1, ?2)",
        )
        .bind(qf_round_id)
        .bind(donation_id)
        .execute(&self.pool)
        .await?;
        info!("Donation {donation_id} excluded as fraudulent from round {qf_round_id}");
        Ok(())
    }
}

async fn read_exclusions(conn: &mut SqliteConnection, qf_round_id: i64) -> Result<Exclusions> {
    let users: Vec<(i64,)> =
        sqlx::query_as("SELECT user_id FROM sybil_exclusions WHERE qf_round_id = ?1")
            .bind(qf_round_id)
            .fetch_all(&mut *conn)
            .await?;
    let donations: Vec<(i64,)> =
        sqlx::query_as("SELECT donation_id FROM fraud_exclusions WHERE qf_round_id = ?1")
            .bind(qf_round_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(Exclusions {
        sybil_users: users.into_iter().map(|(id,)| id).collect(),
        fraudulent_donations: donations.into_iter().map(|(id,)| id).collect(),
    })
}

async fn replace_rows(
    conn: &mut SqliteConnection,
    qf_round_id: i64,
    rows: &[ProjectMatching],
) -> Result<()> {
    sqlx::query("DELETE FROM matching_estimated WHERE qf_round_id = ?1")
        .bind(qf_round_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM matching_actual WHERE qf_round_id = ?1")
        .bind(qf_round_id)
        .execute(&mut *conn)
        .await?;

    for row in rows {
        let e = &row.estimated;
        sqlx::query(
            r#"
            INSERT INTO matching_estimated
                (qf_round_id, project_id, total_usd, donations_sqrt_root_sum,
                 sqrt_root_sum_squared, unique_donors_count, qualified_donors_count, matching)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(qf_round_id)
        .bind(row.project_id)
        .bind(e.total_usd)
        .bind(e.donations_sqrt_root_sum)
        .bind(e.sqrt_root_sum_squared)
        .bind(e.unique_donors_count)
        .bind(e.qualified_donors_count)
        .bind(e.matching)
        .execute(&mut *conn)
        .await?;

        let a = &row.actual;
        sqlx::query(
            r#"
            INSERT INTO matching_actual
                (qf_round_id, project_id, total_usd, donations_sqrt_root_sum,
                 sqrt_root_sum_squared, unique_donors_count, qualified_donors_count, matching,
                 total_usd_before, donation_ids_before, donation_ids_after,
                 donor_ids_before, donor_ids_after)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(qf_round_id)
        .bind(row.project_id)
        .bind(a.figures.total_usd)
        .bind(a.figures.donations_sqrt_root_sum)
        .bind(a.figures.sqrt_root_sum_squared)
        .bind(a.figures.unique_donors_count)
        .bind(a.figures.qualified_donors_count)
        .bind(a.figures.matching)
        .bind(a.total_usd_before)
        .bind(serde_json::to_string(&a.donation_ids_before)?)
        .bind(serde_json::to_string(&a.donation_ids_after)?)
        .bind(serde_json::to_string(&a.donor_ids_before)?)
        .bind(serde_json::to_string(&a.donor_ids_after)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
