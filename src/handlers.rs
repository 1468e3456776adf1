use crate::config::Config;
use crate::errors::GatewayError;
use crate::kv::RedisPool;
use crate::metrics;
use crate::models::MintRequest;
use crate::payment;
use crate::services::{MintMode, MintOutcome, MintService};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

fn payment_header(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(payment::PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn respond(outcome: MintOutcome) -> HttpResponse {
    match outcome {
        MintOutcome::Challenge {
            body,
            options_header,
        } => HttpResponse::PaymentRequired()
            .insert_header((payment::PAYMENT_OPTIONS_HEADER, options_header))
            .json(body),
        MintOutcome::Settled {
            body,
            receipt_header,
        } => HttpResponse::Ok()
            .insert_header((payment::PAYMENT_RESPONSE_HEADER, receipt_header))
            .json(body),
    }
}

fn track(path: &str, result: &Result<MintOutcome, GatewayError>) {
    let status = match result {
        Ok(MintOutcome::Challenge { .. }) => "402".to_string(),
        Ok(MintOutcome::Settled { .. }) => "200".to_string(),
        Err(e) => {
            use actix_web::error::ResponseError;
            e.status_code().as_u16().to_string()
        }
    };
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", path, &status])
        .inc();
}

/// Public mint endpoint
pub async fn mint(
    req: HttpRequest,
    service: web::Data<Arc<MintService>>,
    body: web::Json<MintRequest>,
) -> Result<HttpResponse, GatewayError> {
    let ip = client_ip(&req);
    let header = payment_header(&req);
    let result = service
        .process(body.into_inner(), &ip, header, MintMode::Public)
        .await;
    track("/mint", &result);
    Ok(respond(result?))
}

/// Hidden mint endpoint: path secrecy plus IP whitelist, no rate limit.
/// A wrong secret is indistinguishable from an unknown path.
pub async fn internal_mint(
    req: HttpRequest,
    service: web::Data<Arc<MintService>>,
    config: web::Data<Config>,
    secret: web::Path<String>,
    body: web::Json<MintRequest>,
) -> Result<HttpResponse, GatewayError> {
    if config.internal.mint_secret.is_empty() || *secret != config.internal.mint_secret {
        return Ok(HttpResponse::NotFound().json(json!({ "error": "not found" })));
    }
    let ip = client_ip(&req);
    let header = payment_header(&req);
    let result = service
        .process(body.into_inner(), &ip, header, MintMode::Internal)
        .await;
    track("/internal/mint", &result);
    Ok(respond(result?))
}

/// Capacity snapshot for a token
pub async fn capacity(
    service: web::Data<Arc<MintService>>,
    token: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let token = token.trim().to_lowercase();
    if !is_hex_address(&token) {
        return Err(GatewayError::MalformedRequest(
            "tokenAddress must be a 0x-prefixed 20-byte hex address".to_string(),
        ));
    }
    let snapshot = service.capacity_snapshot(&token).await?;
    Ok(HttpResponse::Ok().json(json!({ "capacity": snapshot })))
}

fn is_hex_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseTarget {
    pub identifier: String,
    pub duration_secs: Option<u64>,
}

pub async fn abuse_stats(
    abuse: web::Data<Arc<crate::abuse::AbuseDetector>>,
    identifier: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let stats = abuse.stats(&identifier).await?;
    Ok(HttpResponse::Ok().json(stats))
}

pub async fn abuse_ban(
    abuse: web::Data<Arc<crate::abuse::AbuseDetector>>,
    body: web::Json<AbuseTarget>,
) -> Result<HttpResponse, GatewayError> {
    abuse.manual_ban(&body.identifier, body.duration_secs).await?;
    Ok(HttpResponse::Ok().json(json!({ "banned": body.identifier })))
}

pub async fn abuse_unban(
    abuse: web::Data<Arc<crate::abuse::AbuseDetector>>,
    body: web::Json<AbuseTarget>,
) -> Result<HttpResponse, GatewayError> {
    abuse.unban(&body.identifier).await?;
    Ok(HttpResponse::Ok().json(json!({ "unbanned": body.identifier })))
}

pub async fn whitelist_add(
    abuse: web::Data<Arc<crate::abuse::AbuseDetector>>,
    body: web::Json<AbuseTarget>,
) -> Result<HttpResponse, GatewayError> {
    abuse.whitelist_add(&body.identifier).await?;
    Ok(HttpResponse::Ok().json(json!({ "whitelisted": body.identifier })))
}

pub async fn whitelist_remove(
    abuse: web::Data<Arc<crate::abuse::AbuseDetector>>,
    body: web::Json<AbuseTarget>,
) -> Result<HttpResponse, GatewayError> {
    abuse.whitelist_remove(&body.identifier).await?;
    Ok(HttpResponse::Ok().json(json!({ "removed": body.identifier })))
}

/// Service health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "mint-gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Facilitator reach-through health
pub async fn payment_health(service: web::Data<Arc<MintService>>) -> HttpResponse {
    if service.facilitator_healthy().await {
        HttpResponse::Ok().json(json!({ "status": "healthy", "facilitator": "reachable" }))
    } else {
        HttpResponse::ServiceUnavailable()
            .json(json!({ "status": "unhealthy", "facilitator": "unreachable" }))
    }
}

/// KV pool health: live status plus a bounded ping
pub async fn kv_health(pool: web::Data<Arc<RedisPool>>) -> HttpResponse {
    let status = pool.status().await;
    match pool.ping().await {
        Ok(latency) => HttpResponse::Ok().json(json!({
            "status": "healthy",
            "pool": status,
            "pingMs": latency.as_millis() as u64
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(json!({
            "status": "unhealthy",
            "pool": status,
            "error": e.to_string()
        })),
    }
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/mint", web::post().to(mint))
        .route("/internal/mint/{secret}", web::post().to(internal_mint))
        .route("/capacity/{token_address}", web::get().to(capacity))
        .service(
            web::scope("/abuse")
                .route("/stats/{identifier}", web::get().to(abuse_stats))
                .route("/ban", web::post().to(abuse_ban))
                .route("/unban", web::post().to(abuse_unban))
                .route("/whitelist/add", web::post().to(whitelist_add))
                .route("/whitelist/remove", web::post().to(whitelist_remove)),
        )
        .route("/health", web::get().to(health_check))
        .route("/payment/health", web::get().to(payment_health))
        .route("/kv/health", web::get().to(kv_health))
        .route("/metrics", web::get().to(metrics_endpoint));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_address_validation() {
        assert!(is_hex_address(
            "0xaa00000000000000000000000000000000000001"
        ));
        assert!(!is_hex_address("0xaa"));
        assert!(!is_hex_address(
            "aa00000000000000000000000000000000000001xx"
        ));
        assert!(!is_hex_address(
            "0xzz00000000000000000000000000000000000001"
        ));
    }
}
