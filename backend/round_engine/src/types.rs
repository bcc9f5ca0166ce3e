//! Domain types shared by the registry, aggregates, cap and matching modules.
//!
//! ## Round kinds
//!
//! A [`Round`] carries the capability every round shares (window, price,
//! primary caps) and a [`RoundKind`] tag for what differs:
//!
//! | Kind          | Extra terms                                    | Cap exhaustion |
//! |---------------|------------------------------------------------|----------------|
//! | `EarlyAccess` | reputation-only per-user cap                   | hard cutoff    |
//! | `Qf`          | networks, close cap, priority, matching pool   | grace band     |
//!
//! ## Chain order
//!
//! Cumulative caps chain rounds chronologically: by start date, then
//! early access before QF, then round number, then id.  [`Round::chain_key`]
//! is the single definition of that order.

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

/// Kind-specific terms of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoundKind {
    EarlyAccess {
        /// Per-user cap for users verified only by a reputation score.
        reputation_cap_per_user_usd: Option<f64>,
    },
    Qf(QfTerms),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QfTerms {
    /// Empty means every network is eligible.
    pub eligible_networks: Vec<i64>,
    pub close_cap_per_project_usd: Option<f64>,
    /// Lower number wins ties.
    pub priority: i64,
    pub matching_pool: f64,
    pub matching_pool_usd: f64,
    /// Donor-project totals below this do not count toward matching.
    pub minimum_valid_usd: Option<f64>,
}

impl RoundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EarlyAccess { .. } => "early_access",
            Self::Qf(_) => "qf",
        }
    }

    fn chain_rank(&self) -> u8 {
        match self {
            Self::EarlyAccess { .. } => 0,
            Self::Qf(_) => 1,
        }
    }
}

/// A funding round as persisted by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub round_number: i64,
    pub name: String,
    pub start_date: i64,
    pub end_date: i64,
    pub is_active: bool,
    /// Round-local token price in USD; `None` means amounts are not converted.
    pub token_price: Option<f64>,
    pub cap_per_project_usd: Option<f64>,
    pub cap_per_user_per_project_usd: Option<f64>,
    pub kind: RoundKind,
}

impl Round {
    /// Inclusive window check.
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start_date <= timestamp && timestamp <= self.end_date
    }

    pub fn chain_key(&self) -> (i64, u8, i64, i64) {
        (
            self.start_date,
            self.kind.chain_rank(),
            self.round_number,
            self.id,
        )
    }

    pub fn qf_terms(&self) -> Option<&QfTerms> {
        match &self.kind {
            RoundKind::Qf(terms) => Some(terms),
            RoundKind::EarlyAccess { .. } => None,
        }
    }

    pub fn round_ref(&self) -> RoundRef {
        match self.kind {
            RoundKind::EarlyAccess { .. } => RoundRef::EarlyAccess(self.id),
            RoundKind::Qf(_) => RoundRef::Qf(self.id),
        }
    }

    /// Divisor converting USD caps into token units.
    pub fn price_divisor(&self) -> f64 {
        match self.token_price {
            Some(price) if price > 0.0 => price,
            _ => 1.0,
        }
    }

    pub fn has_undefined_caps(&self) -> bool {
        self.cap_per_project_usd.is_none() || self.cap_per_user_per_project_usd.is_none()
    }
}

/// Operator input for a new round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRound {
    pub round_number: i64,
    #[serde(default)]
    pub name: String,
    pub start_date: i64,
    pub end_date: i64,
    pub token_price: Option<f64>,
    pub cap_per_project_usd: Option<f64>,
    pub cap_per_user_per_project_usd: Option<f64>,
    pub kind: RoundKind,
}

impl NewRound {
    pub fn validate(&self) -> Result<()> {
        if self.start_date >= self.end_date {
            return Err(EngineError::InvalidRound(format!(
                "round {} starts at {} but ends at {}",
                self.round_number, self.start_date, self.end_date
            )));
        }
        let mut amounts = vec![
            ("token_price", self.token_price),
            ("cap_per_project_usd", self.cap_per_project_usd),
            ("cap_per_user_per_project_usd", self.cap_per_user_per_project_usd),
        ];
        match &self.kind {
            RoundKind::EarlyAccess {
                reputation_cap_per_user_usd,
            } => amounts.push(("reputation_cap_per_user_usd", *reputation_cap_per_user_usd)),
            RoundKind::Qf(terms) => {
                amounts.push(("close_cap_per_project_usd", terms.close_cap_per_project_usd));
                amounts.push(("matching_pool", Some(terms.matching_pool)));
                amounts.push(("matching_pool_usd", Some(terms.matching_pool_usd)));
                amounts.push(("minimum_valid_usd", terms.minimum_valid_usd));
            }
        }
        for (field, value) in amounts {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(EngineError::InvalidRound(format!(
                        "{field} must be a non-negative number, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Cap totals derived by chaining a round to its predecessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeCaps {
    pub per_project_usd: f64,
    pub per_user_per_project_usd: f64,
}

/// Which round a donation (or aggregate) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RoundRef {
    EarlyAccess(i64),
    Qf(i64),
}

impl RoundRef {
    pub fn id(&self) -> i64 {
        match self {
            Self::EarlyAccess(id) | Self::Qf(id) => *id,
        }
    }

    /// Split into the ledger's `(early_access_round_id, qf_round_id)` columns.
    pub fn columns(&self) -> (Option<i64>, Option<i64>) {
        match self {
            Self::EarlyAccess(id) => (Some(*id), None),
            Self::Qf(id) => (None, Some(*id)),
        }
    }

    pub fn from_columns(early_access: Option<i64>, qf: Option<i64>) -> Option<Self> {
        match (early_access, qf) {
            (Some(id), None) => Some(Self::EarlyAccess(id)),
            (None, Some(id)) => Some(Self::Qf(id)),
            _ => None,
        }
    }
}

/// Ledger status of a donation.  Only `Verified` counts toward caps and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Verified,
    Failed,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A donation as read from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub usd_amount: f64,
    pub status: DonationStatus,
    pub round: Option<RoundRef>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDonation {
    pub project_id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub usd_amount: f64,
    pub round: Option<RoundRef>,
    pub created_at: i64,
}

/// Running totals of a project within one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectRoundRecord {
    pub project_id: i64,
    pub round_id: i64,
    pub total_donation_amount: f64,
    pub total_donation_usd_amount: f64,
    pub cumulative_past_rounds_donation_amounts: f64,
}

/// All-time verified totals of one user toward one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectUserRecord {
    pub project_id: i64,
    pub user_id: i64,
    pub total_donation_amount: f64,
    pub ea_total_donation_amount: f64,
    pub qf_total_donation_amount: f64,
}

/// Additive reporting totals, only ever changed by signed deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectDonationSummary {
    pub project_id: i64,
    pub round_id: i64,
    pub total_donation_amount: f64,
    pub total_donation_usd_amount: f64,
    pub donation_count: i64,
}

/// Identity metadata consulted by the cap engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserIdentity {
    pub id: i64,
    pub wallet_address: Option<String>,
    pub kyc_verified: bool,
    pub reputation_score: Option<f64>,
    pub reputation_refreshed_at: Option<i64>,
}
