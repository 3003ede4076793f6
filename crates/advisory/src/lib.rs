//! LLM advisory client.
//!
//! Sends a structured market snapshot to a remote scoring service and
//! parses the JSON verdict. Failures of any kind (timeout, HTTP error,
//! unparseable body, out-of-range fields) degrade to the IDLE sentinel:
//! the advisory is an extra gate, never a point of failure.
//!
//! Responses are cached per `(symbol, time bucket)` to respect the
//! service's rate limits; the bucket width follows `cache_minutes`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use perp_core::{AdvisoryAdapter, AdvisoryOpinion, AdvisorySnapshot};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CACHE_MINUTES: i64 = 10;

/// Raw wire shape of the service verdict. Range checks happen after
/// deserialization.
#[derive(Debug, Deserialize)]
struct WireOpinion {
    direction: String,
    confidence: Decimal,
    #[serde(default)]
    score: Decimal,
    risk_level: String,
    #[serde(default)]
    reasoning: String,
}

/// HTTP advisory client with a per-symbol time-bucket cache.
pub struct HttpAdvisory {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache_minutes: i64,
    cache: RwLock<HashMap<(String, i64), AdvisoryOpinion>>,
}

impl HttpAdvisory {
    /// Builds a client for the given service endpoint.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: String, api_key: String, cache_minutes: u32) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        let cache_minutes = if cache_minutes == 0 {
            DEFAULT_CACHE_MINUTES
        } else {
            i64::from(cache_minutes)
        };
        Ok(Self {
            client,
            base_url,
            api_key,
            cache_minutes,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn bucket(&self, now_ms: i64) -> i64 {
        now_ms / (self.cache_minutes * 60 * 1000)
    }

    async fn query(&self, snapshot: &AdvisorySnapshot) -> Result<AdvisoryOpinion, String> {
        let payload = json!({
            "task": "score_perp_entry",
            "symbol": snapshot.symbol,
            "proposed_direction": snapshot.proposed_direction,
            "price": snapshot.price,
            "indicators": {
                "ema_20": snapshot.ema_20,
                "ema_30": snapshot.ema_30,
                "ema_60": snapshot.ema_60,
                "rsi": snapshot.rsi,
                "atr": snapshot.atr,
                "adx_15m": snapshot.adx_15m,
                "adx_1h": snapshot.adx_1h,
                "adx_4h": snapshot.adx_4h,
            },
        });

        let response = self
            .client
            .post(format!("{}/v1/analyze", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("http {status}"));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;
        parse_opinion(&body)
    }
}

/// Parses and range-checks a verdict body. Tolerates a JSON object
/// embedded in surrounding prose, which LLM backends occasionally emit.
fn parse_opinion(body: &str) -> Result<AdvisoryOpinion, String> {
    let start = body.find('{').ok_or("no JSON object in body")?;
    let end = body.rfind('}').ok_or("no JSON object in body")? + 1;
    let wire: WireOpinion =
        serde_json::from_str(&body[start..end]).map_err(|e| e.to_string())?;

    let direction = match wire.direction.to_uppercase().as_str() {
        "LONG" => perp_core::AdvisoryDirection::Long,
        "SHORT" => perp_core::AdvisoryDirection::Short,
        "IDLE" | "NONE" | "NEUTRAL" => perp_core::AdvisoryDirection::Idle,
        other => return Err(format!("unknown direction {other:?}")),
    };
    let risk_level = match wire.risk_level.to_uppercase().as_str() {
        "LOW" => perp_core::RiskLevel::Low,
        "MEDIUM" => perp_core::RiskLevel::Medium,
        "HIGH" => perp_core::RiskLevel::High,
        other => return Err(format!("unknown risk level {other:?}")),
    };
    if wire.confidence < Decimal::ZERO || wire.confidence > Decimal::ONE_HUNDRED {
        return Err(format!("confidence {} out of range", wire.confidence));
    }

    Ok(AdvisoryOpinion {
        direction,
        confidence: wire.confidence,
        score: wire.score.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED),
        risk_level,
        reasoning: wire.reasoning,
    })
}

#[async_trait]
impl AdvisoryAdapter for HttpAdvisory {
    async fn analyze(&self, snapshot: &AdvisorySnapshot) -> AdvisoryOpinion {
        let key = (snapshot.symbol.clone(), self.bucket(Utc::now().timestamp_millis()));
        if let Some(cached) = self.cache.read().get(&key) {
            debug!(symbol = %snapshot.symbol, "advisory cache hit");
            return cached.clone();
        }

        match self.query(snapshot).await {
            Ok(opinion) => {
                self.cache.write().insert(key, opinion.clone());
                opinion
            }
            Err(err) => {
                warn!(symbol = %snapshot.symbol, error = %err, "advisory unavailable, returning sentinel");
                AdvisoryOpinion::sentinel()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_core::{AdvisoryDirection, RiskLevel};
    use rust_decimal_macros::dec;

    #[test]
    fn parses_a_clean_verdict() {
        let body = r#"{"direction":"LONG","confidence":72,"score":64,"risk_level":"MEDIUM","reasoning":"trend intact"}"#;
        let opinion = parse_opinion(body).unwrap();
        assert_eq!(opinion.direction, AdvisoryDirection::Long);
        assert_eq!(opinion.confidence, dec!(72));
        assert_eq!(opinion.score, dec!(64));
        assert_eq!(opinion.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn tolerates_prose_around_the_json() {
        let body = "Here is my verdict:\n{\"direction\":\"SHORT\",\"confidence\":55,\"risk_level\":\"LOW\"}\nGood luck.";
        let opinion = parse_opinion(body).unwrap();
        assert_eq!(opinion.direction, AdvisoryDirection::Short);
        assert_eq!(opinion.confidence, dec!(55));
    }

    #[test]
    fn lowercase_and_neutral_aliases_map() {
        let body = r#"{"direction":"neutral","confidence":0,"risk_level":"high"}"#;
        let opinion = parse_opinion(body).unwrap();
        assert_eq!(opinion.direction, AdvisoryDirection::Idle);
        assert_eq!(opinion.risk_level, RiskLevel::High);
    }

    #[test]
    fn garbage_bodies_are_rejected() {
        assert!(parse_opinion("not json at all").is_err());
        assert!(parse_opinion(r#"{"direction":"UP","confidence":50,"risk_level":"LOW"}"#).is_err());
        assert!(parse_opinion(r#"{"direction":"LONG","confidence":150,"risk_level":"LOW"}"#).is_err());
    }

    #[test]
    fn score_is_clamped_not_rejected() {
        let body = r#"{"direction":"LONG","confidence":70,"score":400,"risk_level":"LOW"}"#;
        let opinion = parse_opinion(body).unwrap();
        assert_eq!(opinion.score, dec!(100));
    }

    #[tokio::test]
    async fn unreachable_service_returns_sentinel() {
        // Port 1 refuses connections immediately.
        let advisory = HttpAdvisory::new(
            "http://127.0.0.1:1".to_string(),
            "test-key".to_string(),
            10,
        )
        .unwrap();
        let snapshot = AdvisorySnapshot {
            symbol: "BTC/USDT".to_string(),
            price: dec!(50000),
            proposed_direction: perp_core::Direction::Long,
            ema_20: dec!(49950),
            ema_30: dec!(49900),
            ema_60: dec!(49500),
            rsi: dec!(52),
            atr: dec!(200),
            adx_15m: dec!(24),
            adx_1h: dec!(28),
            adx_4h: dec!(30),
        };
        let opinion = advisory.analyze(&snapshot).await;
        assert_eq!(opinion.direction, AdvisoryDirection::Idle);
        assert_eq!(opinion.confidence, Decimal::ZERO);
        assert_eq!(opinion.risk_level, RiskLevel::High);
    }
}
