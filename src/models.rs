use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Body of `POST /mint`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintRequest {
    pub token_address: String,
    pub recipients: Vec<String>,
}

impl MintRequest {
    /// Lowercased lookup key. The raw address is echoed back to clients
    /// untouched; every cache and Redis key uses this form.
    pub fn token_key(&self) -> String {
        self.token_address.trim().to_lowercase()
    }
}

/// Body of a successful `POST /mint`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintResponse {
    pub success: bool,
    pub payment_tx_hash: String,
    pub recipients: usize,
    pub message: String,
}

/// EIP-712 domain of the payment asset, forwarded to the facilitator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetDomain {
    pub name: String,
    pub version: String,
}

/// The payment terms: what the 402 challenge encodes and what the
/// facilitator verifies and settles against. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Stablecoin contract the transfer authorization is drawn on.
    pub asset: String,
    /// The mint target: payments for a token are paid to that token.
    pub pay_to: String,
    /// Minor units, decimal string to avoid precision loss.
    pub max_amount_required: String,
    pub extra: AssetDomain,
    pub max_timeout_seconds: u64,
}

/// A signed transfer authorization as carried inside the `X-Payment`
/// header. Opaque beyond these fields; forwarded verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    pub signature: String,
    pub authorization: TransferAuthorization,
}

/// Decoded `X-Payment` header envelope (x402 exact scheme).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPayload,
}

/// Result of one capacity admission check. Computed per request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapacityInfo {
    pub max: u64,
    pub current: u64,
    pub pending: u64,
    pub available: u64,
}

/// Body of `GET /capacity/{token}`.
#[derive(Debug, Clone, Serialize)]
pub struct CapacitySnapshot {
    pub max: u64,
    pub current: u64,
    pub pending: u64,
    pub available: u64,
    pub percentage: f64,
}

/// One settlement waiting in the coalescer.
#[derive(Debug, Clone)]
pub struct SettleItem {
    pub request_id: Uuid,
    pub payment: PaymentEnvelope,
    pub requirements: PaymentRequirements,
    pub enqueued_at: Instant,
}

/// What a settled item resolves to: the facilitator's receipt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleReceipt {
    pub success: bool,
    pub transaction: String,
    pub network: String,
    pub nonce: Option<String>,
    pub payer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_key_normalization() {
        let req = MintRequest {
            token_address: "  0xAbCdEF0123  ".to_string(),
            recipients: vec!["0x01".to_string()],
        };
        assert_eq!(req.token_key(), "0xabcdef0123");
    }

    #[test]
    fn test_envelope_wire_format() {
        let json = r#"{
            "x402Version": 1,
            "scheme": "exact",
            "network": "bsc",
            "payload": {
                "signature": "0xsig",
                "authorization": {
                    "from": "0xpayer",
                    "to": "0xtoken",
                    "value": "10000000",
                    "validAfter": "0",
                    "validBefore": "99999999999",
                    "nonce": "0xabcd"
                }
            }
        }"#;
        let env: PaymentEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.scheme, "exact");
        assert_eq!(env.payload.authorization.value, "10000000");

        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["payload"]["authorization"]["validBefore"], "99999999999");
        assert_eq!(back["x402Version"], 1);
    }
}
