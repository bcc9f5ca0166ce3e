//! Picks exactly one QF round for a donation when a project is enrolled in
//! several concurrently active rounds.

use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::registry::RoundRegistry;
use crate::types::{QfTerms, Round};

/// Select among `rounds` (the project's QF rounds) for `network_id` at `now`.
///
/// Candidates are active rounds that have not ended and whose network set is
/// empty or contains `network_id`.  Ties are broken by larger USD matching
/// pool, then earlier end date, then lower priority number, then lower id.
pub fn select_round(rounds: &[Round], network_id: i64, project_id: i64, now: i64) -> Result<Round> {
    let active: Vec<(&Round, &QfTerms)> = rounds
        .iter()
        .filter(|r| r.is_active)
        .filter_map(|r| r.qf_terms().map(|t| (r, t)))
        .collect();
    if active.is_empty() {
        return Err(EngineError::NoActiveRoundForProject { project_id });
    }

    active
        .into_iter()
        .filter(|(r, t)| {
            r.end_date > now
                && (t.eligible_networks.is_empty() || t.eligible_networks.contains(&network_id))
        })
        .min_by(|(a, ta), (b, tb)| {
            tb.matching_pool_usd
                .total_cmp(&ta.matching_pool_usd)
                .then(a.end_date.cmp(&b.end_date))
                .then(ta.priority.cmp(&tb.priority))
                .then(a.id.cmp(&b.id))
        })
        .map(|(r, _)| r.clone())
        .ok_or(EngineError::NoEligibleRoundForNetwork {
            project_id,
            network_id,
        })
}

#[derive(Clone)]
pub struct RoundSelector {
    registry: RoundRegistry,
}

impl RoundSelector {
    pub fn new(registry: RoundRegistry) -> Self {
        Self { registry }
    }

    pub async fn select_round(&self, network_id: i64, project_id: i64, now: i64) -> Result<Round> {
        let rounds = self.registry.project_qf_rounds(project_id).await?;
        let round = select_round(&rounds, network_id, project_id, now)?;
        debug!(
            "Selected QF round {} for project {project_id} on network {network_id} out of {} enrolled",
            round.id,
            rounds.len()
        );
        Ok(round)
    }
}
