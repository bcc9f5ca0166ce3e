//! Reputation scorer client, fetching a user's identity score.
//!
//! ## Resilience
//!
//! * Every request runs under the configured timeout, both on the
//!   [`reqwest::Client`] and as an outer [`tokio::time::timeout`].
//! * Any failure (transport, non-2xx, unparseable body, timeout) becomes
//!   [`EngineError::StaleReputationScoreRefreshFailed`]; a stale score is never
//!   treated as a pass.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};

/// Source of fresh reputation scores.
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    async fn fetch_score(&self, wallet_address: &str) -> Result<f64>;
}

/// HTTP scorer (`GET {base_url}/{address}`), answering `{"score": ...}`.
pub struct HttpReputationProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpReputationProvider {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        }
    }

    async fn request(&self, wallet_address: &str) -> Result<f64> {
        let mut request = self
            .client
            .get(format!("{}/{wallet_address}", self.base_url))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }
        let body: Value = request.send().await?.error_for_status()?.json().await?;
        extract_score(&body).ok_or_else(|| {
            EngineError::StaleReputationScoreRefreshFailed(format!(
                "scorer response for {wallet_address} has no score"
            ))
        })
    }
}

#[async_trait]
impl ReputationProvider for HttpReputationProvider {
    async fn fetch_score(&self, wallet_address: &str) -> Result<f64> {
        match tokio::time::timeout(self.timeout, self.request(wallet_address)).await {
            Ok(Ok(score)) => {
                debug!("Fetched reputation score {score} for {wallet_address}");
                Ok(score)
            }
            Ok(Err(e)) => {
                warn!("Reputation refresh failed for {wallet_address}: {e}");
                Err(match e {
                    EngineError::StaleReputationScoreRefreshFailed(_) => e,
                    other => EngineError::StaleReputationScoreRefreshFailed(other.to_string()),
                })
            }
            Err(_) => {
                warn!(
                    "Reputation refresh for {wallet_address} timed out after {:?}",
                    self.timeout
                );
                Err(EngineError::StaleReputationScoreRefreshFailed(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

/// Provider used when no scorer is configured: every refresh fails, so only
/// users with a fresh stored score can pass.
pub struct DisabledReputationProvider;

#[async_trait]
impl ReputationProvider for DisabledReputationProvider {
    async fn fetch_score(&self, _wallet_address: &str) -> Result<f64> {
        Err(EngineError::StaleReputationScoreRefreshFailed(
            "no reputation scorer configured".to_string(),
        ))
    }
}

/// Scorers return the score as a number or a decimal string, sometimes nested
/// under `evidence` or `data`.
fn extract_score(value: &Value) -> Option<f64> {
    for key in ["score", "rawScore", "raw_score"] {
        if let Some(v) = value.get(key) {
            let parsed = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            if parsed.is_some() {
                return parsed;
            }
        }
    }
    ["evidence", "data"]
        .iter()
        .filter_map(|k| value.get(*k))
        .find_map(extract_score)
}
