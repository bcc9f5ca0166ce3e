//! In-process entry point wiring the registry, ledger, aggregates, cap engine,
//! matching calculator and round selector together.
//!
//! ## Capped donation path
//!
//! [`Engine::donate`] checks capacity and writes the donation while holding a
//! per-user lock.  Two donations by one user cannot both consume the last
//! unit of a user cap, nor of the reputation-only allowance that user shares
//! across every project.  Donations by *different* users to one project are
//! not serialized against each other; a project cap can therefore be overrun
//! by concurrent donors (or by other processes).
//! [`Engine::find_cap_overruns`] is the reconciliation pass that reports such
//! overruns.
//!
//! The reputation gate, which may wait on the external scorer, runs before
//! the lock is taken.  Its allowance arithmetic is repeated under the lock.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::aggregates::AggregateStore;
use crate::caps::{CapEngine, CapOverrun, ReputationCheck};
use crate::config::EngineSettings;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::ledger::DonationLedger;
use crate::locks::KeyedLocks;
use crate::matching::{MatchingCalculator, ProjectMatching};
use crate::registry::{RoundRegistry, UndefinedCaps};
use crate::reputation::ReputationProvider;
use crate::selector::RoundSelector;
use crate::types::{
    CumulativeCaps, Donation, DonationStatus, NewDonation, NewRound, Round, RoundRef,
};

/// Slack allowed when comparing a donation amount against capacity.
const CAPACITY_EPSILON: f64 = 1e-9;

pub struct Engine {
    pool: SqlitePool,
    registry: RoundRegistry,
    ledger: DonationLedger,
    aggregates: Arc<AggregateStore>,
    caps: CapEngine,
    matching: MatchingCalculator,
    selector: RoundSelector,
    user_locks: KeyedLocks<i64>,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        reputation: Arc<dyn ReputationProvider>,
        settings: EngineSettings,
    ) -> Self {
        let registry = RoundRegistry::new(pool.clone());
        let ledger = DonationLedger::new(pool.clone());
        let aggregates = Arc::new(AggregateStore::new(
            pool.clone(),
            registry.clone(),
            settings.aggregate_max_retries,
        ));
        let caps = CapEngine::new(
            pool.clone(),
            registry.clone(),
            aggregates.clone(),
            reputation,
            settings,
        );
        let matching = MatchingCalculator::new(pool.clone(), registry.clone());
        let selector = RoundSelector::new(registry.clone());
        Self {
            pool,
            registry,
            ledger,
            aggregates,
            caps,
            matching,
            selector,
            user_locks: KeyedLocks::new(),
        }
    }

    pub fn registry(&self) -> &RoundRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &DonationLedger {
        &self.ledger
    }

    pub fn aggregates(&self) -> &AggregateStore {
        &self.aggregates
    }

    // ─────────────────────────────────────────────────────
    // Rounds
    // ─────────────────────────────────────────────────────

    pub async fn create_round(&self, new: NewRound) -> Result<Round> {
        self.registry.create_round(new).await
    }

    pub async fn enroll_project(&self, project_id: i64, qf_round_id: i64) -> Result<()> {
        self.registry.enroll_project(project_id, qf_round_id).await
    }

    pub async fn active_round(&self, timestamp: i64) -> Result<Option<Round>> {
        self.registry.active_round_at(timestamp).await
    }

    pub async fn cumulative_caps(&self, round_id: i64) -> Result<CumulativeCaps> {
        let round = self.registry.get_round(round_id).await?;
        self.registry.cumulative_caps(&round).await
    }

    pub async fn deactivate_expired_rounds(&self, now: i64) -> Result<Vec<i64>> {
        self.registry.deactivate_expired(now).await
    }

    pub async fn rounds_missing_caps(&self) -> Result<Vec<UndefinedCaps>> {
        self.registry.rounds_missing_caps().await
    }

    pub async fn select_round(&self, network_id: i64, project_id: i64, now: i64) -> Result<Round> {
        self.selector.select_round(network_id, project_id, now).await
    }

    // ─────────────────────────────────────────────────────
    // Caps
    // ─────────────────────────────────────────────────────

    pub async fn remaining_capacity(
        &self,
        project_id: i64,
        user_id: i64,
        timestamp: i64,
    ) -> Result<f64> {
        self.caps
            .remaining_capacity(project_id, user_id, timestamp)
            .await
    }

    pub async fn validate_contribution_with_reputation_only(
        &self,
        project_id: i64,
        user_id: i64,
        amount: f64,
        now: i64,
    ) -> Result<ReputationCheck> {
        self.caps
            .validate_contribution_with_reputation_only(project_id, user_id, amount, now)
            .await
    }

    pub async fn find_cap_overruns(&self, round_id: i64) -> Result<Vec<CapOverrun>> {
        self.caps.find_overruns(round_id).await
    }

    pub async fn upsert_user(
        &self,
        user_id: i64,
        wallet_address: Option<&str>,
        kyc_verified: bool,
    ) -> Result<()> {
        db::upsert_user(&self.pool, user_id, wallet_address, kyc_verified).await
    }

    // ─────────────────────────────────────────────────────
    // Donations
    // ─────────────────────────────────────────────────────

    /// Accept a donation if the active round at `created_at` has capacity for
    /// it, storing it as verified and updating every aggregate.
    ///
    /// The donation is attributed to the active round regardless of
    /// `donation.round`.
    pub async fn donate(&self, donation: NewDonation) -> Result<Donation> {
        let round = self
            .registry
            .active_round_at(donation.created_at)
            .await?
            .ok_or(EngineError::NoActiveRound(donation.created_at))?;

        let reputation = if round.qf_terms().is_some() {
            self.caps
                .validate_contribution_with_reputation_only(
                    donation.project_id,
                    donation.user_id,
                    donation.amount,
                    donation.created_at,
                )
                .await?
        } else {
            ReputationCheck::NotApplicable
        };

        let _guard = self.user_locks.lock(donation.user_id).await;

        if let ReputationCheck::Allowed { .. } = reputation {
            self.caps
                .check_reputation_allowance(&round, donation.user_id, donation.amount)
                .await?;
        }

        let remaining = self
            .caps
            .capacity_in_round(&round, donation.project_id, donation.user_id)
            .await?;
        if donation.amount > remaining + CAPACITY_EPSILON {
            warn!(
                "Donation of {} by user {} to project {} rejected: {remaining} left in round {}",
                donation.amount, donation.user_id, donation.project_id, round.id
            );
            return Err(EngineError::CapExceeded {
                requested: donation.amount,
                remaining,
            });
        }

        let donation = NewDonation {
            round: Some(round.round_ref()),
            ..donation
        };
        let id = self.aggregates.insert_verified_donation(&donation).await?;
        let stored = self.ledger.get(id).await?;
        info!(
            "Donation {} accepted: {} to project {} in round {}",
            stored.id, stored.amount, stored.project_id, round.id
        );
        Ok(stored)
    }

    /// Refresh aggregates for a donation already verified in the ledger.
    pub async fn record_verified_donation(
        &self,
        project_id: i64,
        user_id: i64,
        round: Option<RoundRef>,
        amount: f64,
        usd_amount: f64,
    ) -> Result<()> {
        self.aggregates
            .record_donation(project_id, user_id, round, amount, usd_amount)
            .await
    }

    /// Move a donation to `status` and re-derive its aggregates.
    ///
    /// Entering `Verified` credits the reporting summary; leaving it reverses
    /// the credit.  Other transitions only re-sum.  The status flip is
    /// conditional on the status read here; when a concurrent caller moved
    /// the donation first, the donation is re-read and the move retried.
    pub async fn update_donation_status(
        &self,
        donation_id: i64,
        status: DonationStatus,
    ) -> Result<Donation> {
        loop {
            let before = self.ledger.get(donation_id).await?;
            if before.status == status {
                return Ok(before);
            }
            let _guard = self.user_locks.lock(before.user_id).await;
            if self.aggregates.transition_donation(&before, status).await? {
                info!(
                    "Donation {donation_id} moved {} -> {}",
                    before.status.as_str(),
                    status.as_str()
                );
                return self.ledger.get(donation_id).await;
            }
            debug!(
                "Donation {donation_id} left {} concurrently; re-reading",
                before.status.as_str()
            );
        }
    }

    // ─────────────────────────────────────────────────────
    // Matching
    // ─────────────────────────────────────────────────────

    pub async fn recompute_matching(&self, qf_round_id: i64) -> Result<Vec<ProjectMatching>> {
        self.matching.recompute(qf_round_id).await
    }

    pub async fn matching_for(&self, qf_round_id: i64) -> Result<Vec<ProjectMatching>> {
        self.matching.matching_for(qf_round_id).await
    }

    pub async fn exclude_sybil(&self, qf_round_id: i64, user_id: i64) -> Result<()> {
        self.matching.exclude_sybil(qf_round_id, user_id).await
    }

    pub async fn exclude_donation(&self, qf_round_id: i64, donation_id: i64) -> Result<()> {
        self.matching.exclude_donation(qf_round_id, donation_id).await
    }

    /// Active QF rounds, for the periodic matching refresh.
    pub async fn active_qf_rounds(&self) -> Result<Vec<Round>> {
        self.registry.active_qf_rounds().await
    }
}
