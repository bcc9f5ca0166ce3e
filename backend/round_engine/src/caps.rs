//! Cap engine: remaining donation capacity per (project, user, timestamp).
//!
//! All caps are configured in USD and converted to token units with the
//! active round's token price.  The arithmetic lives in [`compute_capacity`],
//! a pure function of the round, its cumulative caps, and the aggregate
//! totals; [`CapEngine`] only gathers those inputs from storage.
//!
//! Exhaustion policy depends on the round kind:
//!
//! * early access: hard cutoff once the project's round total passes the
//!   cumulative project ceiling;
//! * QF: after the primary ceiling is spent, a grace band of at most
//!   `grace_band_usd` per check remains open up to the close-cap ceiling.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::aggregates::AggregateStore;
use crate::config::EngineSettings;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::registry::RoundRegistry;
use crate::reputation::ReputationProvider;
use crate::types::{CumulativeCaps, Round, RoundKind};

/// Tolerance for comparing token amounts derived from float division.
const AMOUNT_EPSILON: f64 = 1e-9;

/// How a user proved their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityLevel {
    /// Full identity verification.
    Verified,
    /// Only a reputation score vouches for the user.
    ReputationOnly,
}

/// Aggregate totals the cap formula consumes, in token units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CapTotals {
    /// Verified donations to the project within the active round.
    pub project_round_total: f64,
    /// Donations to the project in earlier rounds of the chain.
    pub carried_over_total: f64,
    /// All-time verified donations by the user to the project.
    pub user_all_time_total: f64,
    /// The user's verified QF donations to the project.
    pub user_qf_total: f64,
}

/// Remaining capacity, in token units, of `round` given `totals`.
pub fn compute_capacity(
    round: &Round,
    caps: &CumulativeCaps,
    totals: &CapTotals,
    identity: IdentityLevel,
    grace_band_usd: f64,
) -> f64 {
    let price = round.price_divisor();
    let project_ceiling = caps.per_project_usd / price;
    let user_ceiling = caps.per_user_per_project_usd / price;

    match &round.kind {
        RoundKind::EarlyAccess {
            reputation_cap_per_user_usd,
        } => {
            if totals.project_round_total > project_ceiling {
                return 0.0;
            }
            let user_ceiling = match (identity, reputation_cap_per_user_usd) {
                (IdentityLevel::ReputationOnly, Some(cap)) => cap / price,
                _ => user_ceiling,
            };
            let project_room =
                project_ceiling - totals.project_round_total - totals.carried_over_total;
            let user_room = user_ceiling - totals.user_all_time_total;
            project_room.min(user_room).max(0.0)
        }
        RoundKind::Qf(terms) => {
            let collected = totals.project_round_total + totals.carried_over_total;
            let close_ceiling = match terms.close_cap_per_project_usd {
                Some(close) => {
                    (caps.per_project_usd - round.cap_per_project_usd.unwrap_or(0.0) + close)
                        / price
                }
                None => project_ceiling,
            };
            let grace = (grace_band_usd / price).min(close_ceiling - collected);
            let effective_project = (project_ceiling - collected).max(grace).max(0.0);
            (effective_project.min(user_ceiling) - totals.user_qf_total).max(0.0)
        }
    }
}

/// Highest total a project may collect in `round` (primary or close ceiling).
pub fn project_limit(round: &Round, caps: &CumulativeCaps) -> f64 {
    let price = round.price_divisor();
    let primary = caps.per_project_usd / price;
    match round.qf_terms().and_then(|t| t.close_cap_per_project_usd) {
        Some(close) => {
            let close_ceiling =
                (caps.per_project_usd - round.cap_per_project_usd.unwrap_or(0.0) + close) / price;
            primary.max(close_ceiling)
        }
        None => primary,
    }
}

/// Outcome of the reputation-only gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReputationCheck {
    /// The user is fully verified; the reputation allowance does not apply.
    FullyVerified,
    /// The active round is not a QF round.
    NotApplicable,
    /// Allowed; `remaining` is the allowance left before this donation.
    Allowed { score: f64, remaining: f64 },
}

/// A project whose collected total exceeds what its caps allow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapOverrun {
    pub project_id: i64,
    pub round_id: i64,
    pub collected: f64,
    pub limit: f64,
    pub excess: f64,
}

pub struct CapEngine {
    pool: SqlitePool,
    registry: RoundRegistry,
    aggregates: Arc<AggregateStore>,
    reputation: Arc<dyn ReputationProvider>,
    settings: EngineSettings,
}

impl CapEngine {
    pub fn new(
        pool: SqlitePool,
        registry: RoundRegistry,
        aggregates: Arc<AggregateStore>,
        reputation: Arc<dyn ReputationProvider>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pool,
            registry,
            aggregates,
            reputation,
            settings,
        }
    }

    /// Remaining capacity at `timestamp`; 0 when no round is active.
    pub async fn remaining_capacity(
        &self,
        project_id: i64,
        user_id: i64,
        timestamp: i64,
    ) -> Result<f64> {
        match self.registry.active_round_at(timestamp).await? {
            Some(round) => self.capacity_in_round(&round, project_id, user_id).await,
            None => {
                debug!("No active round at {timestamp}; capacity is 0");
                Ok(0.0)
            }
        }
    }

    /// Remaining capacity of a specific round.
    pub async fn capacity_in_round(
        &self,
        round: &Round,
        project_id: i64,
        user_id: i64,
    ) -> Result<f64> {
        let caps = self.registry.cumulative_caps(round).await?;
        let project = self
            .aggregates
            .get_or_create_project_round(project_id, round.id)
            .await?;
        let user = self
            .aggregates
            .get_or_create_project_user(project_id, user_id)
            .await?;
        let identity = if db::get_user(&self.pool, user_id).await?.kyc_verified {
            IdentityLevel::Verified
        } else {
            IdentityLevel::ReputationOnly
        };

        let totals = CapTotals {
            project_round_total: project.total_donation_amount,
            carried_over_total: project.cumulative_past_rounds_donation_amounts,
            user_all_time_total: user.total_donation_amount,
            user_qf_total: user.qf_total_donation_amount,
        };
        let capacity =
            compute_capacity(round, &caps, &totals, identity, self.settings.grace_band_usd);
        debug!(
            "Capacity project={project_id} user={user_id} round={}: {capacity} ({totals:?})",
            round.id
        );
        Ok(capacity)
    }

    /// Gate a QF contribution by a user without full identity verification.
    ///
    /// A stale score is refreshed first; the refresh runs with no aggregate
    /// lock held and a failed refresh is an error, never a pass.
    pub async fn validate_contribution_with_reputation_only(
        &self,
        project_id: i64,
        user_id: i64,
        amount: f64,
        now: i64,
    ) -> Result<ReputationCheck> {
        let user = db::get_user(&self.pool, user_id).await?;
        if user.kyc_verified {
            return Ok(ReputationCheck::FullyVerified);
        }
        let round = self
            .registry
            .active_round_at(now)
            .await?
            .ok_or(EngineError::NoActiveRound(now))?;
        if round.qf_terms().is_none() {
            return Ok(ReputationCheck::NotApplicable);
        }

        let ttl = self.settings.reputation_score_ttl.as_secs() as i64;
        let fresh = match (user.reputation_score, user.reputation_refreshed_at) {
            (Some(score), Some(at)) if now - at <= ttl => Some(score),
            _ => None,
        };
        let score = match fresh {
            Some(score) => score,
            None => {
                let address = user.wallet_address.as_deref().ok_or_else(|| {
                    EngineError::StaleReputationScoreRefreshFailed(format!(
                        "user {user_id} has no wallet address to score"
                    ))
                })?;
                let score = self.reputation.fetch_score(address).await?;
                db::save_reputation_score(&self.pool, user_id, score, now).await?;
                info!("Refreshed reputation score of user {user_id}: {score}");
                score
            }
        };

        if score < self.settings.reputation_min_score {
            return Err(EngineError::ReputationScoreTooLow {
                score,
                minimum: self.settings.reputation_min_score,
            });
        }

        let remaining = self.check_reputation_allowance(&round, user_id, amount).await?;
        debug!(
            "Reputation-only contribution of {amount} by user {user_id} to project {project_id} allowed ({remaining} left)"
        );
        Ok(ReputationCheck::Allowed { score, remaining })
    }

    /// Remaining reputation-only allowance of `user_id` in `round`, or
    /// `ReputationCapExceeded` when `amount` does not fit.
    ///
    /// The allowance is shared across projects, so callers accepting a
    /// donation must run this under the user's lock.
    pub async fn check_reputation_allowance(
        &self,
        round: &Round,
        user_id: i64,
        amount: f64,
    ) -> Result<f64> {
        let ceiling = self.settings.reputation_only_qf_cap_usd / round.price_divisor();
        let used = self.aggregates.user_qf_total_all_projects(user_id).await?;
        let remaining = (ceiling - used).max(0.0);
        if amount > remaining + AMOUNT_EPSILON {
            return Err(EngineError::ReputationCapExceeded {
                requested: amount,
                remaining,
            });
        }
        Ok(remaining)
    }

    /// Projects in `round_id` whose collected total exceeds their limit.
    ///
    /// Capacity checks are serialized per user inside one process only;
    /// concurrent donors to one project or writers in other processes can
    /// overrun a project cap, and this pass is where such overruns are caught.
    pub async fn find_overruns(&self, round_id: i64) -> Result<Vec<CapOverrun>> {
        let round = self.registry.get_round(round_id).await?;
        let caps = self.registry.cumulative_caps(&round).await?;
        let limit = project_limit(&round, &caps);

        let overruns: Vec<CapOverrun> = self
            .aggregates
            .project_round_records(round_id)
            .await?
            .into_iter()
            .filter_map(|record| {
                let collected = record.total_donation_amount
                    + record.cumulative_past_rounds_donation_amounts;
                (collected > limit + AMOUNT_EPSILON).then(|| CapOverrun {
                    project_id: record.project_id,
                    round_id,
                    collected,
                    limit,
                    excess: collected - limit,
                })
            })
            .collect();

        for overrun in &overruns {
            warn!(
                "Cap overrun: project {} in round {} collected {} over limit {}",
                overrun.project_id, overrun.round_id, overrun.collected, overrun.limit
            );
        }
        Ok(overruns)
    }
}

/// Current unix time, the default timestamp for service-level calls.
pub fn now() -> i64 {
    Utc::now().timestamp()
}
