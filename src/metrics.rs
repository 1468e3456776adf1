use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"]
    ).expect("metric can be created");

    // Payment lifecycle
    pub static ref PAYMENT_CHALLENGES: IntCounter = IntCounter::new(
        "payment_challenges_total",
        "402 challenges issued"
    ).expect("metric can be created");

    pub static ref PAYMENTS_VERIFIED: IntCounterVec = IntCounterVec::new(
        Opts::new("payments_verified_total", "Facilitator verify outcomes"),
        &["result"]
    ).expect("metric can be created");

    pub static ref SETTLEMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("settlements_total", "Per-item settlement outcomes"),
        &["result"]
    ).expect("metric can be created");

    pub static ref SETTLE_BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("settle_batch_size", "Items per settlement flush")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0])
    ).expect("metric can be created");

    // Admission control
    pub static ref CAPACITY_REJECTIONS: IntCounter = IntCounter::new(
        "capacity_rejections_total",
        "Mint requests rejected for capacity"
    ).expect("metric can be created");

    pub static ref ABUSE_BANS: IntCounter = IntCounter::new(
        "abuse_bans_total",
        "Identifiers banned by the abuse detector"
    ).expect("metric can be created");

    // KV pool
    pub static ref KV_POOL_TOTAL: IntGauge = IntGauge::new(
        "kv_pool_connections",
        "Connections currently owned by the KV pool"
    ).expect("metric can be created");

    pub static ref KV_POOL_IDLE: IntGauge = IntGauge::new(
        "kv_pool_idle_connections",
        "Idle connections in the KV pool free list"
    ).expect("metric can be created");
}

/// Register all metrics. Call once at boot; duplicate registration is
/// reported as an error by prometheus and ignored here so tests can
/// initialize freely.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(PAYMENT_CHALLENGES.clone()),
        Box::new(PAYMENTS_VERIFIED.clone()),
        Box::new(SETTLEMENTS_TOTAL.clone()),
        Box::new(SETTLE_BATCH_SIZE.clone()),
        Box::new(CAPACITY_REJECTIONS.clone()),
        Box::new(ABUSE_BANS.clone()),
        Box::new(KV_POOL_TOTAL.clone()),
        Box::new(KV_POOL_IDLE.clone()),
    ];
    for collector in collectors {
        let _ = REGISTRY.register(collector);
    }
}

/// Encode the registry for the `/metrics` endpoint.
pub fn metrics_handler() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics encoding failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        register_metrics();
        register_metrics(); // idempotent

        PAYMENT_CHALLENGES.inc();
        SETTLE_BATCH_SIZE.observe(3.0);

        let body = metrics_handler().unwrap();
        assert!(body.contains("payment_challenges_total"));
        assert!(body.contains("settle_batch_size"));
    }
}
