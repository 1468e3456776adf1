use crate::config::PaymentConfig;
use crate::errors::{GatewayError, Result};
use crate::models::{AssetDomain, PaymentEnvelope, PaymentRequirements, SettleReceipt};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};

/// Header carrying the signed transfer authorization.
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Header on 402 responses describing what to sign.
pub const PAYMENT_OPTIONS_HEADER: &str = "X-Payment-Options";
/// Header on 200 responses carrying the settlement receipt.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

/// The payment terms for minting one token. `pay_to` is the mint target
/// itself; the stablecoin being transferred is the configured asset.
pub fn build_requirements(cfg: &PaymentConfig, token: &str) -> PaymentRequirements {
    PaymentRequirements {
        scheme: "exact".to_string(),
        network: cfg.network.clone(),
        asset: cfg.asset_address.clone(),
        pay_to: token.to_string(),
        max_amount_required: cfg.price_minor_units.clone(),
        extra: AssetDomain {
            name: cfg.asset_name.clone(),
            version: cfg.asset_version.clone(),
        },
        max_timeout_seconds: cfg.max_timeout_secs,
    }
}

/// JSON body of the 402 challenge. Deterministic for a given token and
/// configuration, so repeated unpaid requests get byte-equal challenges.
pub fn challenge_body(requirements: &PaymentRequirements, asset_decimals: u32) -> Value {
    let minor = requirements
        .max_amount_required
        .parse::<u128>()
        .unwrap_or(0);
    json!({
        "paymentRequired": {
            "price": format_display_amount(minor, asset_decimals),
            "amount": requirements.max_amount_required,
            "payTo": requirements.pay_to,
            "token": requirements.asset,
            "tokenName": requirements.extra.name,
            "tokenVersion": requirements.extra.version,
            "network": requirements.network,
        }
    })
}

/// `X-Payment-Options` value, a flat comma-separated quoted-pair list.
pub fn payment_options_header(requirements: &PaymentRequirements) -> String {
    format!(
        "scheme=\"{}\", network=\"{}\", token=\"{}\", payee=\"{}\", amount=\"{}\"",
        requirements.scheme,
        requirements.network,
        requirements.asset,
        requirements.pay_to,
        requirements.max_amount_required,
    )
}

/// Decode the `X-Payment` header: base64 over a JSON envelope.
pub fn decode_payment_header(raw: &str) -> Result<PaymentEnvelope> {
    let bytes = BASE64
        .decode(raw.trim())
        .map_err(|e| GatewayError::MalformedRequest(format!("invalid payment header: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::MalformedRequest(format!("invalid payment payload: {}", e)))
}

/// Encode the settlement receipt for the `X-Payment-Response` header.
pub fn encode_payment_response(receipt: &SettleReceipt) -> String {
    let body = serde_json::to_vec(receipt).unwrap_or_default();
    BASE64.encode(body)
}

/// Render minor units as a display amount, trimming trailing zeros:
/// 10_000_000 at 6 decimals is "10", 10_500_000 is "10.5".
pub fn format_display_amount(minor: u128, decimals: u32) -> String {
    let scale = 10u128.pow(decimals);
    let whole = minor / scale;
    let frac = minor % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac_str = format!("{:0width$}", frac, width = decimals as usize);
    let trimmed = frac_str.trim_end_matches('0');
    format!("{}.{}", whole, trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PaymentConfig {
        PaymentConfig {
            network: "bsc".to_string(),
            asset_address: "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d".to_string(),
            asset_name: "USD Coin".to_string(),
            asset_version: "2".to_string(),
            asset_decimals: 6,
            price_minor_units: "10000000".to_string(),
            max_timeout_secs: 300,
            settle_wait_secs: 180,
        }
    }

    #[test]
    fn test_display_amount() {
        assert_eq!(format_display_amount(10_000_000, 6), "10");
        assert_eq!(format_display_amount(10_500_000, 6), "10.5");
        assert_eq!(format_display_amount(1, 6), "0.000001");
        assert_eq!(format_display_amount(0, 6), "0");
    }

    #[test]
    fn test_challenge_body_shape() {
        let cfg = test_config();
        let requirements = build_requirements(&cfg, "0xaa00");
        let body = challenge_body(&requirements, cfg.asset_decimals);

        assert_eq!(body["paymentRequired"]["amount"], "10000000");
        assert_eq!(body["paymentRequired"]["price"], "10");
        assert_eq!(body["paymentRequired"]["payTo"], "0xaa00");
        assert_eq!(body["paymentRequired"]["tokenName"], "USD Coin");
        assert_eq!(body["paymentRequired"]["network"], "bsc");
    }

    #[test]
    fn test_challenge_idempotence() {
        let cfg = test_config();
        let first = build_requirements(&cfg, "0xaa00");
        let second = build_requirements(&cfg, "0xaa00");
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&challenge_body(&first, 6)).unwrap(),
            serde_json::to_string(&challenge_body(&second, 6)).unwrap()
        );
        assert_eq!(
            payment_options_header(&first),
            payment_options_header(&second)
        );
    }

    #[test]
    fn test_options_header_format() {
        let requirements = build_requirements(&test_config(), "0xaa00");
        let header = payment_options_header(&requirements);
        assert!(header.starts_with("scheme=\"exact\", network=\"bsc\""));
        assert!(header.contains("payee=\"0xaa00\""));
        assert!(header.contains("amount=\"10000000\""));
    }

    #[test]
    fn test_payment_header_roundtrip() {
        let envelope = json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "bsc",
            "payload": {
                "signature": "0xsig",
                "authorization": {
                    "from": "0xpayer", "to": "0xtoken", "value": "10000000",
                    "validAfter": "0", "validBefore": "9999999999", "nonce": "0xn1"
                }
            }
        });
        let encoded = BASE64.encode(serde_json::to_vec(&envelope).unwrap());
        let decoded = decode_payment_header(&encoded).unwrap();
        assert_eq!(decoded.payload.authorization.nonce, "0xn1");
        assert_eq!(decoded.network, "bsc");
    }

    #[test]
    fn test_malformed_payment_header() {
        assert!(matches!(
            decode_payment_header("!!not-base64!!"),
            Err(GatewayError::MalformedRequest(_))
        ));
        // Valid base64 but not a payment envelope.
        let garbage = BASE64.encode(b"{\"hello\":1}");
        assert!(matches!(
            decode_payment_header(&garbage),
            Err(GatewayError::MalformedRequest(_))
        ));
    }
}
