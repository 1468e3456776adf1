use crate::errors::{GatewayError, Result};
use crate::models::{PaymentEnvelope, PaymentRequirements};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    payment_payload: &'a PaymentEnvelope,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub active_transactions: Option<u64>,
    pub max_capacity: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchSettleItem<'a> {
    payment_payload: &'a PaymentEnvelope,
    payment_requirements: &'a PaymentRequirements,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchSettleRequest<'a> {
    items: Vec<BatchSettleItem<'a>>,
    wait_for_confirmation: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettleResult {
    pub index: usize,
    pub success: bool,
    pub transaction: Option<String>,
    pub nonce: Option<String>,
    pub payer: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettleResponse {
    pub success: bool,
    pub results: Vec<BatchSettleResult>,
    pub total_submitted: usize,
    pub total_success: usize,
    pub total_failed: usize,
}

/// Error body the facilitator attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
struct FacilitatorErrorBody {
    reason: Option<String>,
    #[allow(dead_code)]
    message: Option<String>,
}

/// The downstream settlement facilitator: verifies transfer
/// authorizations and relays them on-chain. The gateway never signs or
/// broadcasts anything itself.
#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn verify(
        &self,
        payment: &PaymentEnvelope,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse>;

    /// Settle a batch with `waitForConfirmation = true`; results come
    /// back positionally.
    async fn settle_batch(
        &self,
        items: &[(PaymentEnvelope, PaymentRequirements)],
    ) -> Result<BatchSettleResponse>;

    async fn health(&self) -> Result<bool>;
}

pub struct HttpFacilitator {
    base_url: String,
    client: Client,
    verify_timeout: Duration,
    settle_timeout: Duration,
}

impl HttpFacilitator {
    pub fn new(cfg: &crate::config::FacilitatorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Internal(format!("HTTP client build failed: {}", e)))?;

        Ok(HttpFacilitator {
            base_url: cfg.url.trim_end_matches('/').to_string(),
            client,
            verify_timeout: Duration::from_secs(cfg.verify_timeout_secs),
            settle_timeout: Duration::from_secs(cfg.settle_timeout_secs),
        })
    }

    /// A non-2xx with a recognized capacity reason becomes a payment
    /// rejection the client can act on; everything else is transport.
    fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> GatewayError {
        if let Ok(parsed) = serde_json::from_str::<FacilitatorErrorBody>(body) {
            if let Some(reason) = parsed.reason {
                if reason == "mempool_capacity_exceeded" {
                    return GatewayError::PaymentInvalid { reason };
                }
            }
        }
        GatewayError::FacilitatorTransport(format!("HTTP {}: {}", status, body))
    }
}

#[async_trait]
impl Facilitator for HttpFacilitator {
    async fn verify(
        &self,
        payment: &PaymentEnvelope,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse> {
        let url = format!("{}/verify", self.base_url);
        let request = VerifyRequest {
            payment_payload: payment,
            payment_requirements: requirements,
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.verify_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Facilitator verify failed: {}", e);
                GatewayError::FacilitatorTransport(format!("verify request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_http_failure(status, &body));
        }

        response.json::<VerifyResponse>().await.map_err(|e| {
            GatewayError::FacilitatorTransport(format!("verify response parse failed: {}", e))
        })
    }

    async fn settle_batch(
        &self,
        items: &[(PaymentEnvelope, PaymentRequirements)],
    ) -> Result<BatchSettleResponse> {
        let url = format!("{}/settle/batch", self.base_url);
        let request = BatchSettleRequest {
            items: items
                .iter()
                .map(|(payment, requirements)| BatchSettleItem {
                    payment_payload: payment,
                    payment_requirements: requirements,
                })
                .collect(),
            wait_for_confirmation: true,
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.settle_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Facilitator settle/batch failed: {}", e);
                GatewayError::FacilitatorTransport(format!("settle request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_http_failure(status, &body));
        }

        let settled = response.json::<BatchSettleResponse>().await.map_err(|e| {
            GatewayError::FacilitatorTransport(format!("settle response parse failed: {}", e))
        })?;

        info!(
            "Facilitator settled batch: {} submitted, {} ok, {} failed",
            settled.total_submitted, settled.total_success, settled.total_failed
        );

        Ok(settled)
    }

    async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// Scripted facilitator for local development and tests: verification
/// fails for nonces listed in `reject_nonces`, settlement succeeds with
/// synthetic transaction hashes unless `fail_settle` is set.
pub struct MockFacilitator {
    pub latency_ms: u64,
    pub reject_nonces: Vec<String>,
    pub reject_reason: String,
    pub fail_settle: bool,
    pub verify_calls: std::sync::atomic::AtomicU64,
    pub settle_calls: std::sync::atomic::AtomicU64,
    pub last_batch_len: std::sync::atomic::AtomicU64,
}

impl MockFacilitator {
    pub fn new() -> Self {
        Self {
            latency_ms: 0,
            reject_nonces: Vec::new(),
            reject_reason: "signature_invalid".to_string(),
            fail_settle: false,
            verify_calls: std::sync::atomic::AtomicU64::new(0),
            settle_calls: std::sync::atomic::AtomicU64::new(0),
            last_batch_len: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Default for MockFacilitator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Facilitator for MockFacilitator {
    async fn verify(
        &self,
        payment: &PaymentEnvelope,
        _requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse> {
        use std::sync::atomic::Ordering;
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
        let nonce = &payment.payload.authorization.nonce;
        if self.reject_nonces.contains(nonce) {
            return Ok(VerifyResponse {
                is_valid: false,
                reason: Some(self.reject_reason.clone()),
                message: None,
                active_transactions: None,
                max_capacity: None,
            });
        }
        Ok(VerifyResponse {
            is_valid: true,
            reason: None,
            message: None,
            active_transactions: None,
            max_capacity: None,
        })
    }

    async fn settle_batch(
        &self,
        items: &[(PaymentEnvelope, PaymentRequirements)],
    ) -> Result<BatchSettleResponse> {
        use std::sync::atomic::Ordering;
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        self.last_batch_len.store(items.len() as u64, Ordering::SeqCst);
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
        if self.fail_settle {
            return Err(GatewayError::FacilitatorTransport(
                "settle request failed: simulated outage".to_string(),
            ));
        }
        let results: Vec<BatchSettleResult> = items
            .iter()
            .enumerate()
            .map(|(index, (payment, _))| BatchSettleResult {
                index,
                success: true,
                transaction: Some(format!(
                    "0xmock{}{}",
                    index, payment.payload.authorization.nonce
                )),
                nonce: Some(payment.payload.authorization.nonce.clone()),
                payer: Some(payment.payload.authorization.from.clone()),
                error: None,
            })
            .collect();
        let total = results.len();
        Ok(BatchSettleResponse {
            success: true,
            results,
            total_submitted: total,
            total_success: total,
            total_failed: 0,
        })
    }

    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}
