//! Signed, rate-limited REST transport for the Bitget USDT-futures API.
//!
//! Exchange-native failures are normalized into the core's typed
//! [`ExchangeError`] set here so the engine never branches on venue
//! error codes.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use perp_core::{ExchangeError, ExchangeResult};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Bitget allows 20 req/s per endpoint group; stay under it globally.
const REQUESTS_PER_SECOND: u32 = 15;

/// Exchange success marker in response envelopes.
const OK_CODE: &str = "00000";

pub struct BitgetClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl BitgetClient {
    /// Builds a signed client.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(
        base_url: String,
        api_key: String,
        api_secret: String,
        passphrase: String,
    ) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Other(format!("http client: {e}")))?;
        let quota = Quota::per_second(NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(nonzero_ext::nonzero!(1u32)));
        Ok(Self {
            http,
            base_url,
            api_key,
            api_secret,
            passphrase,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// GET with query string, signed.
    pub async fn get(&self, path: &str, query: &str) -> ExchangeResult<serde_json::Value> {
        self.request(reqwest::Method::GET, path, query, None).await
    }

    /// POST with a JSON body, signed.
    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> ExchangeResult<serde_json::Value> {
        self.request(reqwest::Method::POST, path, "", Some(body)).await
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<&serde_json::Value>,
    ) -> ExchangeResult<serde_json::Value> {
        self.limiter.until_ready().await;

        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let body_text = body.map(serde_json::Value::to_string).unwrap_or_default();
        let request_path = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let signature = self.sign(&timestamp, method.as_str(), &request_path, &body_text)?;

        let url = format!("{}{request_path}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimit { retry_after_secs: 1 });
        }
        if !status.is_success() {
            return Err(ExchangeError::Api {
                status_code: status.as_u16(),
                message: truncate(&text),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Other(format!("malformed response: {e}")))?;
        check_envelope(&value)?;
        debug!(path, "exchange request ok");
        Ok(value)
    }

    fn sign(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> ExchangeResult<String> {
        let payload = format!("{timestamp}{method}{request_path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Other(format!("hmac init: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

fn map_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Timeout(err.to_string())
    } else {
        ExchangeError::Network(err.to_string())
    }
}

/// Maps the `{code, msg}` envelope into the typed error set.
fn check_envelope(value: &serde_json::Value) -> ExchangeResult<()> {
    let code = value.get("code").and_then(|c| c.as_str()).unwrap_or(OK_CODE);
    if code == OK_CODE {
        return Ok(());
    }
    let msg = value
        .get("msg")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string();
    Err(classify(code, msg))
}

fn classify(code: &str, msg: String) -> ExchangeError {
    let lowered = msg.to_lowercase();
    match code {
        // Balance / margin family.
        "40754" | "43012" | "43013" => ExchangeError::InsufficientBalance(msg),
        // Unknown order family.
        "40768" | "43025" | "43001" => ExchangeError::OrderNotFound { order_id: msg },
        // Size / precision / min-notional family.
        "45110" | "40808" | "43010" => ExchangeError::InvalidOrder(msg),
        "429" | "30007" => ExchangeError::RateLimit { retry_after_secs: 1 },
        _ if lowered.contains("insufficient") => ExchangeError::InsufficientBalance(msg),
        _ if lowered.contains("not exist") || lowered.contains("not found") => {
            ExchangeError::OrderNotFound { order_id: msg }
        }
        _ if lowered.contains("minimum") || lowered.contains("precision") => {
            ExchangeError::InvalidOrder(msg)
        }
        _ => ExchangeError::Other(format!("code {code}: {msg}")),
    }
}

fn truncate(text: &str) -> String {
    const MAX: usize = 300;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_envelope_passes() {
        assert!(check_envelope(&json!({"code": "00000", "data": []})).is_ok());
        // Public endpoints sometimes omit the envelope entirely.
        assert!(check_envelope(&json!({"data": []})).is_ok());
    }

    #[test]
    fn insufficient_balance_codes_map() {
        let err = check_envelope(&json!({"code": "43012", "msg": "margin is not enough"}));
        assert!(matches!(err, Err(ExchangeError::InsufficientBalance(_))));
    }

    #[test]
    fn unknown_order_codes_map() {
        let err = check_envelope(&json!({"code": "43025", "msg": "order does not exist"}));
        assert!(matches!(err, Err(ExchangeError::OrderNotFound { .. })));
    }

    #[test]
    fn keyword_fallback_classifies_unlisted_codes() {
        let err = check_envelope(&json!({"code": "99999", "msg": "Amount below the minimum"}));
        assert!(matches!(err, Err(ExchangeError::InvalidOrder(_))));

        let err = check_envelope(&json!({"code": "99998", "msg": "weird failure"}));
        assert!(matches!(err, Err(ExchangeError::Other(_))));
    }
}
