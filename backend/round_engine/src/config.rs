//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the scheduler deactivates rounds and refreshes matching
    pub scheduler_interval_secs: u64,
    /// Base URL of the reputation scorer (disabled when unset)
    pub reputation_api_url: Option<String>,
    /// Optional API key sent to the reputation scorer
    pub reputation_api_key: Option<String>,
    pub engine: EngineSettings,
}

/// Tunables consumed by the engine itself.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// USD width of the QF grace band once a project's primary cap is spent.
    pub grace_band_usd: f64,
    /// Lowest reputation score accepted for reputation-only contributors.
    pub reputation_min_score: f64,
    /// Global QF ceiling (USD) for users without full identity verification.
    pub reputation_only_qf_cap_usd: f64,
    /// Age after which a stored reputation score must be refreshed.
    pub reputation_score_ttl: Duration,
    pub reputation_timeout: Duration,
    /// Attempts made on an aggregate write before surfacing a conflict.
    pub aggregate_max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            grace_band_usd: 250.0,
            reputation_min_score: 15.0,
            reputation_only_qf_cap_usd: 1_000.0,
            reputation_score_ttl: Duration::from_secs(86_400),
            reputation_timeout: Duration::from_secs(5),
            aggregate_max_retries: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = EngineSettings::default();
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./round_engine.db".to_string()),
            api_port: parse_var("API_PORT", 3001)?,
            scheduler_interval_secs: parse_var("SCHEDULER_INTERVAL_SECS", 60)?,
            reputation_api_url: env_var("REPUTATION_API_URL").ok(),
            reputation_api_key: env_var("REPUTATION_API_KEY").ok(),
            engine: EngineSettings {
                grace_band_usd: parse_var("GRACE_BAND_USD", defaults.grace_band_usd)?,
                reputation_min_score: parse_var(
                    "REPUTATION_MIN_SCORE",
                    defaults.reputation_min_score,
                )?,
                reputation_only_qf_cap_usd: parse_var(
                    "REPUTATION_ONLY_QF_CAP_USD",
                    defaults.reputation_only_qf_cap_usd,
                )?,
                reputation_score_ttl: Duration::from_secs(parse_var(
                    "REPUTATION_SCORE_TTL_SECS",
                    defaults.reputation_score_ttl.as_secs(),
                )?),
                reputation_timeout: Duration::from_secs(parse_var(
                    "REPUTATION_TIMEOUT_SECS",
                    defaults.reputation_timeout.as_secs(),
                )?),
                aggregate_max_retries: parse_var(
                    "AGGREGATE_MAX_RETRIES",
                    defaults.aggregate_max_retries,
                )?,
            },
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
