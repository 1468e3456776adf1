use crate::errors::Result;
use crate::kv::RedisPool;
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Key prefixes for the abuse namespaces.
pub mod keys {
    pub const COUNT: &str = "abuse:count";
    pub const BAN: &str = "abuse:ban";
    pub const WHITELIST: &str = "abuse:whitelist";
}

/// Canonical identifier forms. Addresses are lowercased so the same payer
/// maps to the same counters regardless of checksum casing.
pub fn ip_identifier(ip: &str) -> String {
    format!("ip:{}", ip)
}

pub fn addr_identifier(addr: &str) -> String {
    format!("addr:{}", addr.to_lowercase())
}

pub fn addr_ip_identifier(addr: &str, ip: &str) -> String {
    format!("addr:{}_ip:{}", addr.to_lowercase(), ip)
}

/// Sub-counter for repeated hits against already-expired tokens.
pub fn expired_identifier(ip: &str) -> String {
    format!("ip:{}:expired", ip)
}

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    pub window_secs: u64,
    pub max_requests_per_window: u64,
    pub ban_secs: u64,
}

impl AbuseConfig {
    pub fn from_config(cfg: &crate::config::AbuseConfig) -> Self {
        Self {
            window_secs: cfg.window_secs,
            max_requests_per_window: cfg.max_requests_per_window,
            ban_secs: cfg.ban_secs,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AbuseDecision {
    pub allowed: bool,
    pub banned: bool,
    pub count: u64,
    pub retry_after_secs: u64,
}

impl AbuseDecision {
    fn allow(count: u64) -> Self {
        Self {
            allowed: true,
            banned: false,
            count,
            retry_after_secs: 0,
        }
    }

    fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            banned: true,
            count: 0,
            retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseStats {
    pub identifier: String,
    pub count: u64,
    pub banned: bool,
    pub ban_ttl_secs: u64,
    pub whitelisted: bool,
}

/// Sliding-window request counter with ban and whitelist sets, keyed by
/// caller identity. The record path fails open when Redis is unreachable;
/// administrative operations propagate their errors.
pub struct AbuseDetector {
    pool: Arc<RedisPool>,
    cfg: AbuseConfig,
}

impl AbuseDetector {
    pub fn new(pool: Arc<RedisPool>, cfg: AbuseConfig) -> Self {
        AbuseDetector { pool, cfg }
    }

    /// Record one request against an identifier and decide admission.
    /// Availability beats enforcement here: any Redis failure allows.
    pub async fn record_request(&self, id: &str) -> AbuseDecision {
        match self.try_record(id).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Abuse check failed open for {}: {}", id, e);
                AbuseDecision::allow(0)
            }
        }
    }

    async fn try_record(&self, id: &str) -> Result<AbuseDecision> {
        if self.is_whitelisted(id).await? {
            return Ok(AbuseDecision::allow(0));
        }

        let ban_ttl: i64 = self
            .pool
            .execute(ttl_cmd(&format!("{}:{}", keys::BAN, id)))
            .await?;
        if ban_ttl > 0 {
            return Ok(AbuseDecision::deny(ban_ttl as u64));
        }

        let count_key = format!("{}:{}", keys::COUNT, id);
        let count: i64 = {
            let mut cmd = redis::cmd("INCR");
            cmd.arg(&count_key);
            self.pool.execute(cmd).await?
        };
        if count == 1 {
            let mut cmd = redis::cmd("EXPIRE");
            cmd.arg(&count_key).arg(self.cfg.window_secs);
            let _: i64 = self.pool.execute(cmd).await?;
        }

        if count as u64 > self.cfg.max_requests_per_window {
            let mut cmd = redis::cmd("SET");
            cmd.arg(format!("{}:{}", keys::BAN, id))
                .arg("1")
                .arg("EX")
                .arg(self.cfg.ban_secs);
            let _: () = self.pool.execute(cmd).await?;
            metrics::ABUSE_BANS.inc();
            info!(
                "Banned {} for {}s after {} requests in window",
                id, self.cfg.ban_secs, count
            );
            return Ok(AbuseDecision::deny(self.cfg.ban_secs));
        }

        Ok(AbuseDecision::allow(count as u64))
    }

    pub async fn is_whitelisted(&self, id: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(format!("{}:{}", keys::WHITELIST, id));
        let exists: i64 = self.pool.execute(cmd).await?;
        Ok(exists > 0)
    }

    /// Remaining ban TTL in seconds, if the identifier is banned.
    pub async fn is_banned(&self, id: &str) -> Result<Option<u64>> {
        let ttl: i64 = self
            .pool
            .execute(ttl_cmd(&format!("{}:{}", keys::BAN, id)))
            .await?;
        Ok((ttl > 0).then_some(ttl as u64))
    }

    pub async fn stats(&self, id: &str) -> Result<AbuseStats> {
        let count: Option<i64> = {
            let mut cmd = redis::cmd("GET");
            cmd.arg(format!("{}:{}", keys::COUNT, id));
            self.pool.execute(cmd).await?
        };
        let ban_ttl = self.is_banned(id).await?;
        let whitelisted = self.is_whitelisted(id).await?;

        Ok(AbuseStats {
            identifier: id.to_string(),
            count: count.unwrap_or(0).max(0) as u64,
            banned: ban_ttl.is_some(),
            ban_ttl_secs: ban_ttl.unwrap_or(0),
            whitelisted,
        })
    }

    pub async fn manual_ban(&self, id: &str, duration_secs: Option<u64>) -> Result<()> {
        let secs = duration_secs.unwrap_or(self.cfg.ban_secs);
        let mut cmd = redis::cmd("SET");
        cmd.arg(format!("{}:{}", keys::BAN, id))
            .arg("1")
            .arg("EX")
            .arg(secs);
        let _: () = self.pool.execute(cmd).await?;
        metrics::ABUSE_BANS.inc();
        info!("Manually banned {} for {}s", id, secs);
        Ok(())
    }

    pub async fn unban(&self, id: &str) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(format!("{}:{}", keys::BAN, id))
            .arg(format!("{}:{}", keys::COUNT, id));
        let _: i64 = self.pool.execute(cmd).await?;
        info!("Unbanned {}", id);
        Ok(())
    }

    pub async fn whitelist_add(&self, id: &str) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(format!("{}:{}", keys::WHITELIST, id)).arg("1");
        let _: () = self.pool.execute(cmd).await?;
        info!("Whitelisted {}", id);
        Ok(())
    }

    pub async fn whitelist_remove(&self, id: &str) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(format!("{}:{}", keys::WHITELIST, id));
        let _: i64 = self.pool.execute(cmd).await?;
        info!("Removed {} from whitelist", id);
        Ok(())
    }
}

fn ttl_cmd(key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("TTL");
    cmd.arg(key);
    cmd
}
