use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub kv: KvConfig,
    pub abuse: AbuseConfig,
    pub batch: BatchConfig,
    pub facilitator: FacilitatorConfig,
    pub chain: ChainConfig,
    pub payment: PaymentConfig,
    pub internal: InternalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KvConfig {
    pub url: String,
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
    pub command_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AbuseConfig {
    pub window_secs: u64,
    pub max_requests_per_window: u64,
    pub ban_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BatchConfig {
    pub size: usize,
    pub timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub stale_age_secs: u64,
    pub flush_retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FacilitatorConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub settle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PaymentConfig {
    pub network: String,
    pub asset_address: String,
    pub asset_name: String,
    pub asset_version: String,
    pub asset_decimals: u32,
    /// Price per mint request in the asset's minor units.
    pub price_minor_units: String,
    pub max_timeout_secs: u64,
    /// Bound on how long a caller waits for its batch to settle.
    pub settle_wait_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InternalConfig {
    /// Path secret for `POST /internal/mint/{secret}`. Empty disables
    /// the internal endpoint entirely.
    pub mint_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("kv.url", "redis://127.0.0.1:6379")?
            .set_default("kv.min_connections", 2)?
            .set_default("kv.max_connections", 10)?
            .set_default("kv.acquire_timeout_ms", 5000)?
            .set_default("kv.connect_timeout_ms", 5000)?
            .set_default("kv.connect_attempts", 5)?
            .set_default("kv.command_timeout_secs", 30)?
            .set_default("kv.idle_timeout_secs", 300)?
            .set_default("kv.health_interval_secs", 30)?
            .set_default("kv.ping_timeout_ms", 500)?
            .set_default("abuse.window_secs", 60)?
            .set_default("abuse.max_requests_per_window", 10)?
            .set_default("abuse.ban_secs", 3600)?
            .set_default("batch.size", 10)?
            .set_default("batch.timeout_ms", 2000)?
            .set_default("batch.sweep_interval_secs", 30)?
            .set_default("batch.stale_age_secs", 120)?
            .set_default("batch.flush_retry_delay_ms", 50)?
            .set_default("facilitator.url", "http://127.0.0.1:4022")?
            .set_default("facilitator.timeout_secs", 30)?
            .set_default("facilitator.verify_timeout_secs", 60)?
            .set_default("facilitator.settle_timeout_secs", 180)?
            .set_default("chain.rpc_urls", vec!["https://bsc-dataseed.binance.org"])?
            .set_default("chain.chain_id", 56)?
            .set_default("chain.rpc_timeout_secs", 15)?
            .set_default("payment.network", "bsc")?
            .set_default(
                "payment.asset_address",
                "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d",
            )?
            .set_default("payment.asset_name", "USD Coin")?
            .set_default("payment.asset_version", "2")?
            .set_default("payment.asset_decimals", 6)?
            .set_default("payment.price_minor_units", "10000000")?
            .set_default("payment.max_timeout_secs", 300)?
            .set_default("payment.settle_wait_secs", 180)?
            .set_default("internal.mint_secret", "")?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder
                .add_source(File::with_name(&format!("config/{}", environment)).required(false));
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("MINT_GATEWAY")
                .separator("__")
                .list_separator(","),
        );

        // Special handling for common env vars
        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("kv.url", redis_url)?;
        }

        if let Ok(facilitator_url) = env::var("FACILITATOR_URL") {
            builder = builder.set_override("facilitator.url", facilitator_url)?;
        }

        if let Ok(rpc_urls) = env::var("CHAIN_RPC_URLS") {
            let urls: Vec<String> = rpc_urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            builder = builder.set_override("chain.rpc_urls", urls)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.kv.url.is_empty() {
            return Err("KV URL is required".to_string());
        }

        if self.kv.min_connections > self.kv.max_connections {
            return Err("kv.min_connections cannot exceed kv.max_connections".to_string());
        }

        if self.kv.max_connections == 0 {
            return Err("kv.max_connections must be at least 1".to_string());
        }

        if self.batch.size == 0 {
            return Err("batch.size must be at least 1".to_string());
        }

        if self.facilitator.url.is_empty() {
            return Err("Facilitator URL is required".to_string());
        }

        if self.chain.rpc_urls.is_empty() {
            return Err("At least one chain RPC URL is required".to_string());
        }

        if self.payment.price_minor_units.parse::<u128>().is_err() {
            return Err("payment.price_minor_units must be a decimal integer".to_string());
        }

        Ok(())
    }
}
