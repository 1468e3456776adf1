use crate::chain::ChainReader;
use crate::errors::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DeadlineStatus {
    pub expired: bool,
    pub deadline: u64,
    pub now: u64,
}

/// Permanent per-token cache of `deploymentDeadline()`. The deadline is
/// immutable once a token is deployed, so the chain is consulted at most
/// once per token and the check itself is a clock comparison.
pub struct TokenDeadlineCache {
    inner: RwLock<HashMap<String, u64>>,
    chain: Arc<dyn ChainReader>,
}

impl TokenDeadlineCache {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            chain,
        }
    }

    pub async fn deadline(&self, token: &str) -> Result<u64> {
        if let Some(value) = self.inner.read().await.get(token) {
            return Ok(*value);
        }
        let value = self.chain.deployment_deadline(token).await?;
        self.inner.write().await.insert(token.to_string(), value);
        debug!("Cached deploymentDeadline for {}: {}", token, value);
        Ok(value)
    }

    pub async fn check(&self, token: &str) -> Result<DeadlineStatus> {
        let deadline = self.deadline(token).await?;
        let now = unix_now();
        Ok(DeadlineStatus {
            expired: now > deadline,
            deadline,
            now,
        })
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
