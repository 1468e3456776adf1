use crate::abuse::{self, AbuseDetector};
use crate::capacity::CapacityManager;
use crate::coalescer::SettlementCoalescer;
use crate::config::PaymentConfig;
use crate::deadline::TokenDeadlineCache;
use crate::errors::{GatewayError, Result};
use crate::facilitator::Facilitator;
use crate::metrics;
use crate::models::{CapacitySnapshot, MintRequest, MintResponse, SettleReceipt};
use crate::payment;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const MAX_RECIPIENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintMode {
    /// `POST /mint`: rate-limited.
    Public,
    /// `POST /internal/mint/{secret}`: IP-whitelisted, no rate limit.
    Internal,
}

pub enum MintOutcome {
    /// No payment header was presented; the caller gets the 402 terms.
    Challenge {
        body: serde_json::Value,
        options_header: String,
    },
    /// Payment settled; the mint follows downstream.
    Settled {
        body: MintResponse,
        receipt_header: String,
    },
}

/// Orchestrates one mint request through the strictly ordered admission
/// pipeline. Every failure after the capacity reservation releases the
/// same count before the response leaves.
pub struct MintService {
    capacity: Arc<CapacityManager>,
    deadlines: Arc<TokenDeadlineCache>,
    abuse: Arc<AbuseDetector>,
    facilitator: Arc<dyn Facilitator>,
    coalescer: Arc<SettlementCoalescer>,
    payment_cfg: PaymentConfig,
}

impl MintService {
    pub fn new(
        capacity: Arc<CapacityManager>,
        deadlines: Arc<TokenDeadlineCache>,
        abuse: Arc<AbuseDetector>,
        facilitator: Arc<dyn Facilitator>,
        coalescer: Arc<SettlementCoalescer>,
        payment_cfg: PaymentConfig,
    ) -> Self {
        MintService {
            capacity,
            deadlines,
            abuse,
            facilitator,
            coalescer,
            payment_cfg,
        }
    }

    pub async fn process(
        &self,
        request: MintRequest,
        ip: &str,
        payment_header: Option<String>,
        mode: MintMode,
    ) -> Result<MintOutcome> {
        // 1. Validate.
        let token = request.token_key();
        if token.is_empty() {
            return Err(GatewayError::MalformedRequest(
                "tokenAddress is required".to_string(),
            ));
        }
        if request.recipients.is_empty() || request.recipients.len() > MAX_RECIPIENTS {
            return Err(GatewayError::MalformedRequest(format!(
                "recipients must contain between 1 and {} entries",
                MAX_RECIPIENTS
            )));
        }
        let recipient_count = request.recipients.len() as u64;

        // 2. The internal path trusts nobody but the whitelist.
        if mode == MintMode::Internal
            && !self
                .abuse
                .is_whitelisted(&abuse::ip_identifier(ip))
                .await
                .unwrap_or(false)
        {
            return Err(GatewayError::Unauthorized);
        }

        // 3. Deadline gate, with its own abuse sub-counter so expired
        // tokens cannot be hammered for free chain reads.
        let status = self.deadlines.check(&token).await?;
        if status.expired {
            let decision = self
                .abuse
                .record_request(&abuse::expired_identifier(ip))
                .await;
            return Err(GatewayError::TokenExpired {
                deadline: status.deadline,
                expired_ago_secs: status.now.saturating_sub(status.deadline),
                minimal: !decision.allowed,
            });
        }

        // 4. Challenge or proceed.
        let requirements = payment::build_requirements(&self.payment_cfg, &token);
        let Some(header) = payment_header else {
            metrics::PAYMENT_CHALLENGES.inc();
            let body = payment::challenge_body(&requirements, self.payment_cfg.asset_decimals);
            let options_header = payment::payment_options_header(&requirements);
            return Ok(MintOutcome::Challenge {
                body,
                options_header,
            });
        };

        // 5. Decode the authorization envelope.
        let envelope = payment::decode_payment_header(&header)?;

        // 6. Verify against the facilitator. Failures feed the abuse
        // counter so invalid-signature floods earn a ban.
        match self.facilitator.verify(&envelope, &requirements).await {
            Ok(v) if v.is_valid => {
                metrics::PAYMENTS_VERIFIED.with_label_values(&["valid"]).inc();
            }
            Ok(v) => {
                metrics::PAYMENTS_VERIFIED.with_label_values(&["invalid"]).inc();
                self.abuse.record_request(&abuse::ip_identifier(ip)).await;
                let reason = v
                    .reason
                    .or(v.message)
                    .unwrap_or_else(|| "invalid_payment".to_string());
                return Err(GatewayError::PaymentInvalid { reason });
            }
            Err(e) => {
                metrics::PAYMENTS_VERIFIED.with_label_values(&["error"]).inc();
                self.abuse.record_request(&abuse::ip_identifier(ip)).await;
                return Err(e);
            }
        }

        // 7. Rate-limit valid payments on the public path.
        if mode == MintMode::Public {
            let decision = self.abuse.record_request(&abuse::ip_identifier(ip)).await;
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    retry_after_secs: decision.retry_after_secs.max(1),
                });
            }
        }

        // 8. Capacity check.
        let info = match self.capacity.check(&token, recipient_count).await {
            Ok(info) => info,
            Err(e) => {
                if matches!(e, GatewayError::CapacityExceeded { .. }) {
                    metrics::CAPACITY_REJECTIONS.inc();
                }
                return Err(e);
            }
        };
        info!(
            "Admitting {} recipients for {} ({} slots available)",
            recipient_count, token, info.available
        );

        // 9. Reserve. From here on, every exit path releases.
        self.capacity.reserve(&token, recipient_count).await?;

        // 10. Settle through the coalescer, bounded.
        let settled = tokio::time::timeout(
            Duration::from_secs(self.payment_cfg.settle_wait_secs),
            self.coalescer.enqueue(envelope, requirements),
        )
        .await;

        let receipt: SettleReceipt = match settled {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                self.release_quietly(&token, recipient_count).await;
                return Err(e);
            }
            Err(_) => {
                self.release_quietly(&token, recipient_count).await;
                return Err(GatewayError::CoalescerTimeout);
            }
        };

        // 11. Release after settlement: the mint itself is a downstream
        // follow-up, and a held reservation would inflate the pending
        // counter until its TTL.
        self.release_quietly(&token, recipient_count).await;

        // 12. Respond with the receipt.
        let receipt_header = payment::encode_payment_response(&receipt);
        Ok(MintOutcome::Settled {
            body: MintResponse {
                success: true,
                payment_tx_hash: receipt.transaction,
                recipients: request.recipients.len(),
                message: "Payment settled; mint scheduled".to_string(),
            },
            receipt_header,
        })
    }

    async fn release_quietly(&self, token: &str, n: u64) {
        if let Err(e) = self.capacity.release(token, n).await {
            error!(
                "Failed to release {} reserved mints for {}: {}",
                n, token, e
            );
        }
    }

    pub async fn capacity_snapshot(&self, token: &str) -> Result<CapacitySnapshot> {
        let status = self.deadlines.check(token).await?;
        if status.expired {
            return Err(GatewayError::TokenExpired {
                deadline: status.deadline,
                expired_ago_secs: status.now.saturating_sub(status.deadline),
                minimal: false,
            });
        }
        self.capacity.snapshot(token).await
    }

    pub async fn facilitator_healthy(&self) -> bool {
        self.facilitator.health().await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::AbuseConfig;
    use crate::chain::ChainReader;
    use crate::coalescer::CoalescerConfig;
    use crate::deadline::unix_now;
    use crate::facilitator::MockFacilitator;
    use crate::kv::{KvPoolConfig, RedisPool};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    struct MockChain {
        deadline: u64,
    }

    #[async_trait]
    impl ChainReader for MockChain {
        async fn max_mint_count(&self, _token: &str) -> Result<u64> {
            Ok(100)
        }

        async fn mint_count(&self, _token: &str) -> Result<u64> {
            Ok(0)
        }

        async fn deployment_deadline(&self, _token: &str) -> Result<u64> {
            Ok(self.deadline)
        }
    }

    fn payment_cfg() -> PaymentConfig {
        PaymentConfig {
            network: "bsc".to_string(),
            asset_address: "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d".to_string(),
            asset_name: "USD Coin".to_string(),
            asset_version: "2".to_string(),
            asset_decimals: 6,
            price_minor_units: "10000000".to_string(),
            max_timeout_secs: 300,
            settle_wait_secs: 5,
        }
    }

    /// Pool against a closed port with a zero floor: nothing connects at
    /// startup, and commands fail fast. Exercises the fail-open and
    /// typed-failure paths without a live Redis.
    async fn unreachable_pool() -> Arc<RedisPool> {
        RedisPool::connect(KvPoolConfig {
            url: "redis://127.0.0.1:1".to_string(),
            min_connections: 0,
            max_connections: 2,
            acquire_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(50),
            connect_attempts: 1,
            command_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(300),
            health_interval: Duration::from_secs(300),
            ping_timeout: Duration::from_millis(50),
        })
        .await
        .expect("pool construction is lazy")
    }

    async fn service_with(
        facilitator: Arc<MockFacilitator>,
        deadline: u64,
    ) -> MintService {
        let chain: Arc<dyn ChainReader> = Arc::new(MockChain { deadline });
        let pool = unreachable_pool().await;
        let capacity = Arc::new(CapacityManager::new(chain.clone(), pool.clone()));
        let deadlines = Arc::new(TokenDeadlineCache::new(chain));
        let abuse = Arc::new(AbuseDetector::new(
            pool,
            AbuseConfig {
                window_secs: 60,
                max_requests_per_window: 10,
                ban_secs: 3600,
            },
        ));
        let fac: Arc<dyn Facilitator> = facilitator;
        let coalescer = SettlementCoalescer::new(
            fac.clone(),
            CoalescerConfig {
                batch_size: 10,
                batch_timeout: Duration::from_millis(20),
                sweep_interval: Duration::from_secs(60),
                stale_age: Duration::from_secs(120),
                flush_retry_delay: Duration::from_millis(10),
            },
        );
        MintService::new(capacity, deadlines, abuse, fac, coalescer, payment_cfg())
    }

    fn mint_request() -> MintRequest {
        MintRequest {
            token_address: "0xAA00000000000000000000000000000000000001".to_string(),
            recipients: vec!["0x01".to_string()],
        }
    }

    fn encoded_payment(nonce: &str) -> String {
        let envelope = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "bsc",
            "payload": {
                "signature": "0xsig",
                "authorization": {
                    "from": "0xpayer", "to": "0xtoken", "value": "10000000",
                    "validAfter": "0", "validBefore": "9999999999", "nonce": nonce
                }
            }
        });
        BASE64.encode(serde_json::to_vec(&envelope).unwrap())
    }

    #[tokio::test]
    async fn test_malformed_requests_rejected() {
        let service = service_with(Arc::new(MockFacilitator::new()), unix_now() + 600).await;

        let empty_token = MintRequest {
            token_address: "   ".to_string(),
            recipients: vec!["0x01".to_string()],
        };
        assert!(matches!(
            service.process(empty_token, "1.2.3.4", None, MintMode::Public).await,
            Err(GatewayError::MalformedRequest(_))
        ));

        let no_recipients = MintRequest {
            token_address: "0xaa".to_string(),
            recipients: vec![],
        };
        assert!(matches!(
            service.process(no_recipients, "1.2.3.4", None, MintMode::Public).await,
            Err(GatewayError::MalformedRequest(_))
        ));

        let too_many = MintRequest {
            token_address: "0xaa".to_string(),
            recipients: vec!["0x01".to_string(); 101],
        };
        assert!(matches!(
            service.process(too_many, "1.2.3.4", None, MintMode::Public).await,
            Err(GatewayError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_challenge_is_deterministic() {
        let service = service_with(Arc::new(MockFacilitator::new()), unix_now() + 600).await;

        let first = service
            .process(mint_request(), "1.2.3.4", None, MintMode::Public)
            .await
            .unwrap();
        let second = service
            .process(mint_request(), "1.2.3.4", None, MintMode::Public)
            .await
            .unwrap();

        match (first, second) {
            (
                MintOutcome::Challenge { body: a, options_header: ha },
                MintOutcome::Challenge { body: b, options_header: hb },
            ) => {
                assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
                assert_eq!(ha, hb);
                assert!(ha.starts_with("scheme=\"exact\", network=\"bsc\""));
                assert_eq!(a["paymentRequired"]["amount"], "10000000");
            }
            _ => panic!("expected challenges"),
        }
    }

    #[tokio::test]
    async fn test_expired_token_gets_410() {
        let service = service_with(Arc::new(MockFacilitator::new()), unix_now() - 100).await;

        match service
            .process(mint_request(), "1.2.3.4", None, MintMode::Public)
            .await
        {
            Err(GatewayError::TokenExpired {
                expired_ago_secs, minimal, ..
            }) => {
                assert!(expired_ago_secs >= 100);
                // Abuse storage is down, so the sub-counter fails open
                // and the remaining-time body is served.
                assert!(!minimal);
            }
            other => panic!("expected TokenExpired, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_invalid_payment_header_is_400() {
        let service = service_with(Arc::new(MockFacilitator::new()), unix_now() + 600).await;

        let result = service
            .process(
                mint_request(),
                "1.2.3.4",
                Some("!!garbage!!".to_string()),
                MintMode::Public,
            )
            .await;
        assert!(matches!(result, Err(GatewayError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_failed_verification_is_402_with_reason() {
        let mut facilitator = MockFacilitator::new();
        facilitator.reject_nonces = vec!["0xbad".to_string()];
        facilitator.reject_reason = "nonce_used".to_string();
        let service = service_with(Arc::new(facilitator), unix_now() + 600).await;

        match service
            .process(
                mint_request(),
                "1.2.3.4",
                Some(encoded_payment("0xbad")),
                MintMode::Public,
            )
            .await
        {
            Err(GatewayError::PaymentInvalid { reason }) => assert_eq!(reason, "nonce_used"),
            other => panic!("expected PaymentInvalid, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_internal_mode_requires_whitelist() {
        let service = service_with(Arc::new(MockFacilitator::new()), unix_now() + 600).await;

        // Whitelist lookups fail (Redis down) and the gate fails closed.
        let result = service
            .process(mint_request(), "1.2.3.4", None, MintMode::Internal)
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_capacity_read_failure_is_503() {
        // Verification passes, but the pending counter is unreachable:
        // the capacity check must surface as a 503, not admit blindly.
        let service = service_with(Arc::new(MockFacilitator::new()), unix_now() + 600).await;

        match service
            .process(
                mint_request(),
                "1.2.3.4",
                Some(encoded_payment("0xok")),
                MintMode::Public,
            )
            .await
        {
            Err(GatewayError::CapacityCheckFailed(_)) => {}
            other => panic!("expected CapacityCheckFailed, got {:?}", other.map(|_| ())),
        }
    }
}
