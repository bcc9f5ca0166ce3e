//! Engine tests against an in-memory SQLite database with the real migrations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::caps::ReputationCheck;
use crate::config::EngineSettings;
use crate::db;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::reputation::ReputationProvider;
use crate::scheduler;
use crate::types::{DonationStatus, NewDonation, NewRound, QfTerms, Round, RoundKind, RoundRef};

/// Scorer returning a fixed score, or failing when `score` is `None`.
struct StubScorer {
    score: Option<f64>,
    calls: AtomicUsize,
}

impl StubScorer {
    fn new(score: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            score,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ReputationProvider for StubScorer {
    async fn fetch_score(&self, _wallet_address: &str) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.score.ok_or_else(|| {
            EngineError::StaleReputationScoreRefreshFailed("scorer unreachable".into())
        })
    }
}

async fn setup(scorer: Arc<StubScorer>) -> (Engine, SqlitePool) {
    let pool = db::memory_pool().await;
    let engine = Engine::new(pool.clone(), scorer, EngineSettings::default());
    (engine, pool)
}

fn early_access(number: i64, start: i64, end: i64, project_cap: f64, user_cap: f64) -> NewRound {
    NewRound {
        round_number: number,
        name: format!("ea-{number}"),
        start_date: start,
        end_date: end,
        token_price: Some(1.0),
        cap_per_project_usd: Some(project_cap),
        cap_per_user_per_project_usd: Some(user_cap),
        kind: RoundKind::EarlyAccess {
            reputation_cap_per_user_usd: None,
        },
    }
}

fn qf(number: i64, start: i64, end: i64, project_cap: f64, user_cap: f64) -> NewRound {
    NewRound {
        round_number: number,
        name: format!("qf-{number}"),
        start_date: start,
        end_date: end,
        token_price: Some(1.0),
        cap_per_project_usd: Some(project_cap),
        cap_per_user_per_project_usd: Some(user_cap),
        kind: RoundKind::Qf(QfTerms {
            eligible_networks: vec![],
            close_cap_per_project_usd: None,
            priority: 0,
            matching_pool: 1_000.0,
            matching_pool_usd: 1_000.0,
            minimum_valid_usd: None,
        }),
    }
}

fn with_terms(mut round: NewRound, edit: impl FnOnce(&mut QfTerms)) -> NewRound {
    if let RoundKind::Qf(terms) = &mut round.kind {
        edit(terms);
    }
    round
}

fn donation(project_id: i64, user_id: i64, amount: f64, at: i64) -> NewDonation {
    NewDonation {
        project_id,
        user_id,
        amount,
        usd_amount: amount,
        round: None,
        created_at: at,
    }
}

async fn verified_user(engine: &Engine, user_id: i64) {
    engine
        .upsert_user(user_id, Some(format!("0x{user_id:04x}").as_str()), true)
        .await
        .unwrap();
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

// ─────────────────────────────────────────────────────────
// Rounds
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn early_access_takes_precedence_over_overlapping_qf() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let ea = engine
        .create_round(early_access(1, 0, 100, 1_000.0, 100.0))
        .await
        .unwrap();
    let qf = engine
        .create_round(qf(1, 50, 150, 1_000.0, 100.0))
        .await
        .unwrap();

    assert_eq!(engine.active_round(75).await.unwrap().unwrap().id, ea.id);
    assert_eq!(engine.active_round(120).await.unwrap().unwrap().id, qf.id);
    assert!(engine.active_round(200).await.unwrap().is_none());
    assert_eq!(engine.remaining_capacity(1, 1, 200).await.unwrap(), 0.0);
}

#[tokio::test]
async fn deactivate_expired_is_idempotent() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let old = engine.create_round(qf(1, 0, 100, 1.0, 1.0)).await.unwrap();
    let current = engine.create_round(qf(2, 0, 1_000, 1.0, 1.0)).await.unwrap();

    assert_eq!(engine.deactivate_expired_rounds(500).await.unwrap(), vec![old.id]);
    assert!(engine.deactivate_expired_rounds(500).await.unwrap().is_empty());

    let rounds = engine.registry().all_rounds().await.unwrap();
    let flags: Vec<(i64, bool)> = rounds.iter().map(|r| (r.id, r.is_active)).collect();
    assert!(flags.contains(&(old.id, false)));
    assert!(flags.contains(&(current.id, true)));

    // a deactivated QF round no longer answers for its window
    assert_eq!(engine.active_round(50).await.unwrap().unwrap().id, current.id);
}

#[tokio::test]
async fn cumulative_caps_chain_and_missing_caps_report() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    engine
        .create_round(early_access(1, 0, 100, 1_000.0, 100.0))
        .await
        .unwrap();
    let middle = engine
        .create_round(NewRound {
            cap_per_project_usd: None,
            ..early_access(2, 200, 300, 0.0, 50.0)
        })
        .await
        .unwrap();
    let last = engine
        .create_round(qf(1, 400, 500, 3_000.0, 200.0))
        .await
        .unwrap();

    let caps = engine.cumulative_caps(last.id).await.unwrap();
    assert_eq!(caps.per_project_usd, 4_000.0);
    assert_eq!(caps.per_user_per_project_usd, 350.0);
    // repeated reads are stable
    assert_eq!(engine.cumulative_caps(last.id).await.unwrap(), caps);

    let missing = engine.rounds_missing_caps().await.unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].round_id, middle.id);
    assert!(missing[0].missing_project_cap);
    assert!(!missing[0].missing_user_cap);
}

#[tokio::test]
async fn invalid_round_is_rejected() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let err = engine
        .create_round(early_access(1, 100, 100, 1.0, 1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRound(_)));

    let ea = engine
        .create_round(early_access(1, 0, 100, 1.0, 1.0))
        .await
        .unwrap();
    assert!(matches!(
        engine.enroll_project(1, ea.id).await,
        Err(EngineError::InvalidRound(_))
    ));
    assert!(matches!(
        engine.cumulative_caps(999).await,
        Err(EngineError::RoundNotFound(999))
    ));
}

// ─────────────────────────────────────────────────────────
// Capacity and aggregates
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn capacity_shrinks_with_donations_and_recovers_on_reversal() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = engine
        .create_round(early_access(1, 0, 1_000, 1_000.0, 100.0))
        .await
        .unwrap();
    verified_user(&engine, 1).await;

    assert_eq!(engine.remaining_capacity(10, 1, 500).await.unwrap(), 100.0);

    let first = engine.donate(donation(10, 1, 30.0, 500)).await.unwrap();
    assert_eq!(first.round, Some(RoundRef::EarlyAccess(round.id)));
    assert_eq!(first.status, DonationStatus::Verified);
    assert_eq!(engine.remaining_capacity(10, 1, 500).await.unwrap(), 70.0);

    let err = engine.donate(donation(10, 1, 80.0, 501)).await.unwrap_err();
    match err {
        EngineError::CapExceeded {
            requested,
            remaining,
        } => {
            assert_eq!(requested, 80.0);
            assert_eq!(remaining, 70.0);
        }
        other => panic!("expected CapExceeded, got {other:?}"),
    }

    engine
        .update_donation_status(first.id, DonationStatus::Failed)
        .await
        .unwrap();
    assert_eq!(engine.remaining_capacity(10, 1, 502).await.unwrap(), 100.0);

    let summary = engine
        .aggregates()
        .get_or_create_summary(10, round.id)
        .await
        .unwrap();
    assert_eq!(summary.donation_count, 0);
    assert_eq!(summary.total_donation_amount, 0.0);
}

#[tokio::test]
async fn early_access_project_cap_limits_everyone() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    engine
        .create_round(early_access(1, 0, 1_000, 1_000.0, 100.0))
        .await
        .unwrap();
    for user in 1..=10 {
        verified_user(&engine, user).await;
        engine.donate(donation(5, user, 95.0, 10)).await.unwrap();
    }
    // 950 collected: room for 50 more at the project level
    verified_user(&engine, 11).await;
    assert_eq!(engine.remaining_capacity(5, 11, 10).await.unwrap(), 50.0);
    // an existing donor is limited by their own cap
    assert_eq!(engine.remaining_capacity(5, 3, 10).await.unwrap(), 5.0);
}

#[tokio::test]
async fn status_transitions_resum_aggregates() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = engine
        .create_round(early_access(1, 0, 1_000, 1_000.0, 100.0))
        .await
        .unwrap();
    let pending = engine
        .ledger()
        .insert(
            &NewDonation {
                round: Some(round.round_ref()),
                ..donation(7, 2, 25.0, 10)
            },
            DonationStatus::Pending,
        )
        .await
        .unwrap();

    let record = engine
        .aggregates()
        .get_or_create_project_round(7, round.id)
        .await
        .unwrap();
    assert_eq!(record.total_donation_amount, 0.0);

    engine
        .update_donation_status(pending.id, DonationStatus::Verified)
        .await
        .unwrap();
    // same status twice is a no-op
    engine
        .update_donation_status(pending.id, DonationStatus::Verified)
        .await
        .unwrap();
    let record = engine
        .aggregates()
        .get_or_create_project_round(7, round.id)
        .await
        .unwrap();
    assert_eq!(record.total_donation_amount, 25.0);
    let user = engine
        .aggregates()
        .get_or_create_project_user(7, 2)
        .await
        .unwrap();
    assert_eq!(user.total_donation_amount, 25.0);
    assert_eq!(user.ea_total_donation_amount, 25.0);
    assert_eq!(user.qf_total_donation_amount, 0.0);
    let verified = engine.ledger().verified_for_project(7, Some(2)).await.unwrap();
    assert_eq!(verified.len(), 1);
    assert!(engine
        .ledger()
        .verified_for_project(7, Some(3))
        .await
        .unwrap()
        .is_empty());

    engine
        .update_donation_status(pending.id, DonationStatus::Failed)
        .await
        .unwrap();
    let record = engine
        .aggregates()
        .get_or_create_project_round(7, round.id)
        .await
        .unwrap();
    assert_eq!(record.total_donation_amount, 0.0);
    assert!(engine
        .ledger()
        .verified_for_project(7, None)
        .await
        .unwrap()
        .is_empty());

    let summary = engine
        .aggregates()
        .get_or_create_summary(7, round.id)
        .await
        .unwrap();
    assert_eq!(summary.donation_count, 0);

    assert!(matches!(
        engine
            .update_donation_status(999, DonationStatus::Failed)
            .await,
        Err(EngineError::DonationNotFound(999))
    ));
}

#[tokio::test]
async fn donation_and_its_aggregates_commit_together() {
    let (engine, pool) = setup(StubScorer::new(None)).await;
    let round = engine
        .create_round(early_access(1, 0, 1_000, 1_000.0, 100.0))
        .await
        .unwrap();
    verified_user(&engine, 1).await;

    let stored = engine.donate(donation(8, 1, 20.0, 10)).await.unwrap();
    let summary = engine
        .aggregates()
        .get_or_create_summary(8, round.id)
        .await
        .unwrap();
    assert_eq!(summary.donation_count, 1);
    assert_eq!(
        engine.ledger().verified_for_project(8, None).await.unwrap(),
        vec![stored]
    );

    // a failure after the ledger insert leaves neither the row nor any aggregate behind
    sqlx::query("DROP TABLE project_donation_summaries")
        .execute(&pool)
        .await
        .unwrap();
    let err = engine
        .aggregates()
        .insert_verified_donation(&NewDonation {
            round: Some(round.round_ref()),
            ..donation(8, 2, 30.0, 11)
        })
        .await;
    assert!(matches!(err, Err(EngineError::Database(_))), "{err:?}");

    let (donations,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM donations")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(donations, 1);
    let (records,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM project_user_records WHERE user_id = 2")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(records, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_verifications_credit_the_summary_once() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = engine
        .create_round(early_access(1, 0, 1_000, 1_000.0, 100.0))
        .await
        .unwrap();
    let pending = engine
        .ledger()
        .insert(
            &NewDonation {
                round: Some(round.round_ref()),
                ..donation(11, 4, 40.0, 10)
            },
            DonationStatus::Pending,
        )
        .await
        .unwrap();
    let engine = Arc::new(engine);
    let id = pending.id;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .update_donation_status(id, DonationStatus::Verified)
                    .await
            })
        })
        .collect();
    for handle in handles {
        let moved = handle.await.unwrap().unwrap();
        assert_eq!(moved.status, DonationStatus::Verified);
    }

    let summary = engine
        .aggregates()
        .get_or_create_summary(11, round.id)
        .await
        .unwrap();
    assert_eq!(summary.donation_count, 1);
    assert_eq!(summary.total_donation_amount, 40.0);

    // a transition from a status the donation already left writes nothing
    let moved = engine
        .aggregates()
        .transition_donation(&pending, DonationStatus::Verified)
        .await
        .unwrap();
    assert!(!moved);
    let summary = engine
        .aggregates()
        .get_or_create_summary(11, round.id)
        .await
        .unwrap();
    assert_eq!(summary.donation_count, 1);
}

#[tokio::test]
async fn earlier_round_donations_carry_over() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    engine
        .create_round(early_access(1, 0, 100, 1_000.0, 100.0))
        .await
        .unwrap();
    let qf_round = engine
        .create_round(qf(1, 200, 300, 1_000.0, 100.0))
        .await
        .unwrap();
    verified_user(&engine, 1).await;

    engine.donate(donation(3, 1, 40.0, 50)).await.unwrap();
    assert_eq!(engine.remaining_capacity(3, 1, 50).await.unwrap(), 60.0);

    // QF ceilings are cumulative: 2000 per project, 200 per user
    assert_eq!(engine.remaining_capacity(3, 1, 250).await.unwrap(), 200.0);
    let record = engine
        .aggregates()
        .get_or_create_project_round(3, qf_round.id)
        .await
        .unwrap();
    assert_eq!(record.cumulative_past_rounds_donation_amounts, 40.0);
    assert_eq!(record.total_donation_amount, 0.0);
}

#[tokio::test]
async fn reversing_an_earlier_round_donation_refreshes_later_carry_over() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let ea = engine
        .create_round(early_access(1, 0, 100, 1_000.0, 1_000.0))
        .await
        .unwrap();
    let qf_round = engine
        .create_round(qf(1, 200, 300, 100.0, 100.0))
        .await
        .unwrap();
    verified_user(&engine, 1).await;
    verified_user(&engine, 2).await;

    let early = engine.donate(donation(6, 1, 1_000.0, 50)).await.unwrap();
    assert_eq!(early.round, Some(RoundRef::EarlyAccess(ea.id)));
    // the QF record now exists with 1000 carried over
    assert_eq!(engine.remaining_capacity(6, 2, 250).await.unwrap(), 100.0);

    engine
        .update_donation_status(early.id, DonationStatus::Failed)
        .await
        .unwrap();

    let stored = engine
        .aggregates()
        .project_round_records(qf_round.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].cumulative_past_rounds_donation_amounts, 0.0);
    assert_eq!(engine.remaining_capacity(6, 2, 250).await.unwrap(), 1_100.0);
}

#[tokio::test]
async fn qf_grace_band_and_overrun_reconciliation() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = engine
        .create_round(with_terms(qf(1, 0, 1_000, 1_000.0, 5_000.0), |t| {
            t.close_cap_per_project_usd = Some(1_050.0);
            t.matching_pool = 1_000_000.0;
            t.matching_pool_usd = 1_000_000.0;
        }))
        .await
        .unwrap();
    for user in 1..=3 {
        verified_user(&engine, user).await;
    }

    engine.donate(donation(9, 1, 1_000.0, 10)).await.unwrap();
    assert_eq!(engine.remaining_capacity(9, 2, 10).await.unwrap(), 50.0);
    assert!(matches!(
        engine.donate(donation(9, 2, 60.0, 11)).await,
        Err(EngineError::CapExceeded { .. })
    ));
    engine.donate(donation(9, 2, 50.0, 12)).await.unwrap();
    assert_eq!(engine.remaining_capacity(9, 3, 13).await.unwrap(), 0.0);
    assert!(engine.find_cap_overruns(round.id).await.unwrap().is_empty());

    // a write that bypassed the capped path shows up as an overrun
    let stray = engine
        .ledger()
        .insert(
            &NewDonation {
                round: Some(round.round_ref()),
                ..donation(9, 3, 100.0, 14)
            },
            DonationStatus::Verified,
        )
        .await
        .unwrap();
    engine
        .record_verified_donation(9, 3, stray.round, stray.amount, stray.usd_amount)
        .await
        .unwrap();
    let overruns = engine.find_cap_overruns(round.id).await.unwrap();
    assert_eq!(overruns.len(), 1);
    assert_eq!(overruns[0].project_id, 9);
    assert!(approx(overruns[0].excess, 100.0));
}

#[tokio::test]
async fn concurrent_donations_by_one_user_respect_the_cap() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    engine
        .create_round(early_access(1, 0, 1_000, 10_000.0, 100.0))
        .await
        .unwrap();
    verified_user(&engine, 1).await;
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.donate(donation(4, 1, 15.0, 100 + i)).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::CapExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(accepted, 6);
    assert_eq!(engine.remaining_capacity(4, 1, 200).await.unwrap(), 10.0);
}

// ─────────────────────────────────────────────────────────
// Reputation-only contributors
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn reputation_score_is_refreshed_once_and_caps_qf_total() {
    let scorer = StubScorer::new(Some(20.0));
    let (engine, _) = setup(scorer.clone()).await;
    engine
        .create_round(qf(1, 0, 1_000, 100_000.0, 5_000.0))
        .await
        .unwrap();
    engine.upsert_user(2, Some("0xbeef"), false).await.unwrap();

    let check = engine
        .validate_contribution_with_reputation_only(1, 2, 100.0, 500)
        .await
        .unwrap();
    assert_eq!(
        check,
        ReputationCheck::Allowed {
            score: 20.0,
            remaining: 1_000.0
        }
    );
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

    engine.donate(donation(1, 2, 900.0, 600)).await.unwrap();
    // the stored score is still fresh
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

    match engine
        .validate_contribution_with_reputation_only(1, 2, 200.0, 700)
        .await
    {
        Err(EngineError::ReputationCapExceeded { remaining, .. }) => {
            assert!(approx(remaining, 100.0))
        }
        other => panic!("expected ReputationCapExceeded, got {other:?}"),
    }
    // the allowance spans every project
    assert!(matches!(
        engine.donate(donation(2, 2, 150.0, 800)).await,
        Err(EngineError::ReputationCapExceeded { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reputation_only_donations_share_one_allowance() {
    let (engine, _) = setup(StubScorer::new(Some(20.0))).await;
    engine
        .create_round(qf(1, 0, 1_000, 100_000.0, 5_000.0))
        .await
        .unwrap();
    engine.upsert_user(2, Some("0xbeef"), false).await.unwrap();
    let engine = Arc::new(engine);

    // 4 x 600 against a 1000 allowance, each to a different project
    let handles: Vec<_> = (1..=4)
        .map(|project| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.donate(donation(project, 2, 600.0, 100)).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::ReputationCapExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert!(approx(
        engine
            .aggregates()
            .user_qf_total_all_projects(2)
            .await
            .unwrap(),
        600.0
    ));
}

#[tokio::test]
async fn low_reputation_score_is_rejected() {
    let (engine, _) = setup(StubScorer::new(Some(10.0))).await;
    engine
        .create_round(qf(1, 0, 1_000, 100_000.0, 5_000.0))
        .await
        .unwrap();
    engine.upsert_user(2, Some("0xbeef"), false).await.unwrap();

    assert!(matches!(
        engine.donate(donation(1, 2, 5.0, 10)).await,
        Err(EngineError::ReputationScoreTooLow { .. })
    ));
}

#[tokio::test]
async fn stale_score_with_failed_refresh_is_never_a_pass() {
    let (engine, pool) = setup(StubScorer::new(None)).await;
    engine
        .create_round(qf(1, 0, 1_000_000, 100_000.0, 5_000.0))
        .await
        .unwrap();
    engine.upsert_user(2, Some("0xbeef"), false).await.unwrap();
    db::save_reputation_score(&pool, 2, 50.0, 0).await.unwrap();

    // fresh stored score: no refresh needed
    assert!(engine
        .validate_contribution_with_reputation_only(1, 2, 5.0, 1_000)
        .await
        .is_ok());

    // past the TTL the refresh fails, and so does the check
    assert!(matches!(
        engine
            .validate_contribution_with_reputation_only(1, 2, 5.0, 100_000)
            .await,
        Err(EngineError::StaleReputationScoreRefreshFailed(_))
    ));

    // no wallet to score
    engine.upsert_user(3, None, false).await.unwrap();
    assert!(matches!(
        engine.donate(donation(1, 3, 5.0, 100)).await,
        Err(EngineError::StaleReputationScoreRefreshFailed(_))
    ));
}

#[tokio::test]
async fn verified_users_skip_the_reputation_gate() {
    let scorer = StubScorer::new(None);
    let (engine, _) = setup(scorer.clone()).await;
    engine
        .create_round(qf(1, 0, 1_000, 100_000.0, 5_000.0))
        .await
        .unwrap();
    verified_user(&engine, 1).await;

    assert_eq!(
        engine
            .validate_contribution_with_reputation_only(1, 1, 4_000.0, 10)
            .await
            .unwrap(),
        ReputationCheck::FullyVerified
    );
    engine.donate(donation(1, 1, 4_000.0, 10)).await.unwrap();
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
}

// ─────────────────────────────────────────────────────────
// Matching
// ─────────────────────────────────────────────────────────

async fn matching_round(engine: &Engine) -> Round {
    let round = engine
        .create_round(qf(1, 0, 1_000, 100_000.0, 100_000.0))
        .await
        .unwrap();
    for project in 1..=3 {
        engine.enroll_project(project, round.id).await.unwrap();
    }
    for user in 1..=3 {
        verified_user(engine, user).await;
    }
    round
}

#[tokio::test]
async fn matching_is_persisted_and_idempotent() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = matching_round(&engine).await;
    engine.donate(donation(1, 1, 2.0, 10)).await.unwrap();
    engine.donate(donation(1, 2, 2.0, 11)).await.unwrap();
    engine.donate(donation(2, 3, 4.0, 12)).await.unwrap();

    let computed = engine.recompute_matching(round.id).await.unwrap();
    assert_eq!(computed.len(), 3);
    assert!(approx(computed[0].estimated.matching, 1_000.0 * 8.0 / 12.0));
    assert!(approx(computed[1].estimated.matching, 1_000.0 * 4.0 / 12.0));
    assert_eq!(computed[2].project_id, 3);
    assert_eq!(computed[2].estimated.matching, 0.0);
    let total: f64 = computed.iter().map(|p| p.estimated.matching).sum();
    assert!(approx(total, 1_000.0));

    let stored = engine.matching_for(round.id).await.unwrap();
    assert_eq!(stored, computed);

    let again = engine.recompute_matching(round.id).await.unwrap();
    assert_eq!(again, computed);
    assert_eq!(engine.matching_for(round.id).await.unwrap(), computed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_stored_alongside_concurrent_donations_matches_the_ledger() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = matching_round(&engine).await;
    for user in 4..=9 {
        verified_user(&engine, user).await;
    }
    let engine = Arc::new(engine);
    let round_id = round.id;

    let donors: Vec<_> = (4..=9)
        .map(|user| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.donate(donation(1 + user % 3, user, 1.0, 20)).await })
        })
        .collect();
    let refreshes: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.recompute_matching(round_id).await })
        })
        .collect();
    for handle in donors {
        handle.await.unwrap().unwrap();
    }
    for handle in refreshes {
        // every intermediate run describes one consistent ledger state
        for project in handle.await.unwrap().unwrap() {
            assert!(approx(
                project.estimated.total_usd,
                project.estimated.unique_donors_count as f64
            ));
        }
    }

    let last = engine.recompute_matching(round_id).await.unwrap();
    let enrolled = engine.registry().enrolled_projects(round_id).await.unwrap();
    assert_eq!(
        last.iter().map(|p| p.project_id).collect::<Vec<_>>(),
        enrolled
    );
    for project in &last {
        let verified = engine
            .ledger()
            .verified_for_project(project.project_id, None)
            .await
            .unwrap();
        assert_eq!(project.estimated.unique_donors_count, verified.len() as i64);
    }
    assert_eq!(engine.matching_for(round_id).await.unwrap(), last);
}

#[tokio::test]
async fn exclusions_only_change_actual_figures() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let round = matching_round(&engine).await;
    let first = engine.donate(donation(1, 1, 2.0, 10)).await.unwrap();
    engine.donate(donation(1, 2, 2.0, 11)).await.unwrap();
    engine.donate(donation(2, 3, 4.0, 12)).await.unwrap();

    engine.exclude_sybil(round.id, 3).await.unwrap();
    let rows = engine.recompute_matching(round.id).await.unwrap();
    assert!(approx(rows[1].estimated.matching, 1_000.0 * 4.0 / 12.0));
    assert_eq!(rows[1].actual.figures.matching, 0.0);
    assert_eq!(rows[1].actual.donor_ids_before, vec![3]);
    assert!(rows[1].actual.donor_ids_after.is_empty());
    assert!(approx(rows[1].actual.total_usd_before, 4.0));
    assert!(approx(rows[0].actual.figures.matching, 1_000.0));

    engine.exclude_donation(round.id, first.id).await.unwrap();
    let rows = engine.matching_for(round.id).await.unwrap();
    // stored figures change only on recompute
    assert!(approx(rows[0].actual.figures.sqrt_root_sum_squared, 8.0));
    let rows = engine.recompute_matching(round.id).await.unwrap();
    assert!(approx(rows[0].actual.figures.sqrt_root_sum_squared, 2.0));
    assert_eq!(rows[0].actual.donation_ids_after.len(), 1);
    assert_eq!(rows[0].actual.donation_ids_before.len(), 2);
}

#[tokio::test]
async fn matching_requires_a_qf_round() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let ea = engine
        .create_round(early_access(1, 0, 100, 1.0, 1.0))
        .await
        .unwrap();
    assert!(matches!(
        engine.recompute_matching(ea.id).await,
        Err(EngineError::InvalidRound(_))
    ));
}

// ─────────────────────────────────────────────────────────
// Round selection and scheduling
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn selector_prefers_lower_priority_number_on_full_tie() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let second = engine
        .create_round(with_terms(qf(1, 0, 1_000, 1.0, 1.0), |t| t.priority = 2))
        .await
        .unwrap();
    let first = engine
        .create_round(with_terms(qf(2, 0, 1_000, 1.0, 1.0), |t| t.priority = 1))
        .await
        .unwrap();
    let other_network = engine
        .create_round(with_terms(qf(3, 0, 1_000, 1.0, 1.0), |t| {
            t.eligible_networks = vec![10];
            t.matching_pool_usd = 1_000_000.0;
        }))
        .await
        .unwrap();
    for round in [&second, &first, &other_network] {
        engine.enroll_project(42, round.id).await.unwrap();
    }

    assert_eq!(engine.select_round(137, 42, 100).await.unwrap().id, first.id);
    assert_eq!(
        engine.select_round(10, 42, 100).await.unwrap().id,
        other_network.id
    );
    assert!(matches!(
        engine.select_round(137, 7, 100).await,
        Err(EngineError::NoActiveRoundForProject { project_id: 7 })
    ));
    assert!(matches!(
        engine.select_round(137, 42, 5_000).await,
        Err(EngineError::NoEligibleRoundForNetwork { .. })
    ));
}

#[tokio::test]
async fn scheduler_tick_deactivates_and_refreshes() {
    let (engine, _) = setup(StubScorer::new(None)).await;
    let expired = engine.create_round(qf(1, 0, 100, 1.0, 1.0)).await.unwrap();
    let live = engine.create_round(qf(2, 0, 1_000, 1.0, 1.0)).await.unwrap();
    engine.enroll_project(1, live.id).await.unwrap();

    let (deactivated, refreshed) = scheduler::tick(&engine, 500).await.unwrap();
    assert_eq!(deactivated, vec![expired.id]);
    assert_eq!(refreshed, 1);
    assert_eq!(engine.matching_for(live.id).await.unwrap().len(), 1);
    assert!(engine.matching_for(expired.id).await.unwrap().is_empty());
}
