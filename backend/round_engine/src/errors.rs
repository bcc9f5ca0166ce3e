//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Row decode error: {0}")]
    Decode(String),

    #[error("Invalid round: {0}")]
    InvalidRound(String),

    #[error("Round {0} not found")]
    RoundNotFound(i64),

    #[error("Donation {0} not found")]
    DonationNotFound(i64),

    #[error("No active round at timestamp {0}")]
    NoActiveRound(i64),

    #[error("No active QF round for project {project_id}")]
    NoActiveRoundForProject { project_id: i64 },

    #[error("No active QF round of project {project_id} is eligible for network {network_id}")]
    NoEligibleRoundForNetwork { project_id: i64, network_id: i64 },

    /// Advisory: the caller decides whether to reject or clamp to `remaining`.
    #[error("Donation of {requested} exceeds remaining capacity {remaining}")]
    CapExceeded { requested: f64, remaining: f64 },

    #[error("Reputation score {score} is below the minimum of {minimum}")]
    ReputationScoreTooLow { score: f64, minimum: f64 },

    #[error("Donation of {requested} exceeds the reputation-only allowance {remaining}")]
    ReputationCapExceeded { requested: f64, remaining: f64 },

    #[error("Aggregate write conflict on {0}")]
    AggregateWriteConflict(String),

    #[error("Reputation score is stale and could not be refreshed: {0}")]
    StaleReputationScoreRefreshFailed(String),
}

impl EngineError {
    /// Only write conflicts are worth retrying without caller involvement.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AggregateWriteConflict(_))
    }

    /// Map SQLite lock contention onto [`EngineError::AggregateWriteConflict`].
    pub fn from_write(err: sqlx::Error, key: &str) -> Self {
        if is_lock_contention(&err) {
            Self::AggregateWriteConflict(key.to_string())
        } else {
            Self::Database(err)
        }
    }
}

// SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes.
fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().and_then(|c| c.parse::<i64>().ok()).unwrap_or(0);
            matches!(code & 0xff, 5 | 6) || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
