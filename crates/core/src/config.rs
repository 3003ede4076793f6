use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RiskLevel;

/// Errors produced when validating or patching the bot configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("malformed config patch: {0}")]
    Patch(#[from] serde_json::Error),
}

/// Dynamic leverage selection driven by advisory confidence and risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicLeverageConfig {
    pub enabled: bool,
    pub min: u32,
    pub max: u32,
    pub base: u32,
    pub risk_multiplier: RiskMultiplier,
}

impl Default for DynamicLeverageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min: 3,
            max: 20,
            base: 10,
            risk_multiplier: RiskMultiplier::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskMultiplier {
    pub low: Decimal,
    pub medium: Decimal,
    pub high: Decimal,
}

impl Default for RiskMultiplier {
    fn default() -> Self {
        Self {
            low: Decimal::new(12, 1),  // 1.2
            medium: Decimal::ONE,
            high: Decimal::new(7, 1),  // 0.7
        }
    }
}

impl RiskMultiplier {
    #[must_use]
    pub const fn for_level(&self, level: RiskLevel) -> Decimal {
        match level {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Daily loss as a percentage of equity that trips the breaker.
    pub daily_loss_threshold_pct: Decimal,
    pub consecutive_losses_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            daily_loss_threshold_pct: Decimal::new(5, 0),
            consecutive_losses_threshold: 3,
        }
    }
}

/// Local-time window start for the end-of-day forced close. The window runs
/// from `hour:minute` to the end of that hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceLiquidateConfig {
    pub hour: u32,
    pub minute: u32,
}

impl Default for ForceLiquidateConfig {
    fn default() -> Self {
        Self { hour: 23, minute: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitConfig {
    pub tp1_rr: Decimal,
    pub tp2_rr: Decimal,
    pub rsi_extreme_long: Decimal,
    pub rsi_extreme_short: Decimal,
    pub adx_decrease_threshold: Decimal,
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            tp1_rr: Decimal::ONE,
            tp2_rr: Decimal::TWO,
            rsi_extreme_long: Decimal::new(78, 0),
            rsi_extreme_short: Decimal::new(22, 0),
            adx_decrease_threshold: Decimal::new(5, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub force_liquidate: ForceLiquidateConfig,
    pub take_profit: TakeProfitConfig,
    pub daily_trade_limit: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            force_liquidate: ForceLiquidateConfig::default(),
            take_profit: TakeProfitConfig::default(),
            daily_trade_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub enabled: bool,
    /// Minimum confidence (0-100) required to act on an opinion.
    pub min_confidence: Decimal,
    pub max_risk_level: RiskLevel,
    pub use_for_entry: bool,
    pub use_for_exit: bool,
    pub cache_minutes: u32,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: Decimal::new(60, 0),
            max_risk_level: RiskLevel::Medium,
            use_for_entry: true,
            use_for_exit: false,
            cache_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Profit, in multiples of initial risk, required before trailing starts.
    pub activation_ratio: Decimal,
    pub distance_atr_multiplier: Decimal,
    pub update_interval_secs: u64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_ratio: Decimal::new(5, 1), // 0.5 R
            distance_atr_multiplier: Decimal::TWO,
            update_interval_secs: 60,
        }
    }
}

/// Direction-specific entry gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryGateConfig {
    /// Maximum relative distance from EMA20/EMA30 for an entry.
    pub ema_deviation_threshold: Decimal,
    pub rsi_min: Decimal,
    pub rsi_max: Decimal,
    /// Minimum candle shadow as a fraction of the open price.
    pub candle_shadow_threshold: Decimal,
    pub volume_confirmation: bool,
    pub volume_ema_period: usize,
    pub volume_ema_multiplier: Decimal,
}

impl EntryGateConfig {
    fn default_long() -> Self {
        Self {
            ema_deviation_threshold: Decimal::new(5, 3), // 0.5%
            rsi_min: Decimal::new(40, 0),
            rsi_max: Decimal::new(70, 0),
            candle_shadow_threshold: Decimal::new(1, 3), // 0.1% of open
            volume_confirmation: false,
            volume_ema_period: 20,
            volume_ema_multiplier: Decimal::new(12, 1), // 1.2
        }
    }

    fn default_short() -> Self {
        Self {
            rsi_min: Decimal::new(30, 0),
            rsi_max: Decimal::new(60, 0),
            ..Self::default_long()
        }
    }
}

impl Default for EntryGateConfig {
    fn default() -> Self {
        Self::default_long()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorsConfig {
    pub adx_1h_threshold: Decimal,
    pub adx_4h_threshold: Decimal,
    pub long: EntryGateConfig,
    pub short: EntryGateConfig,
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        Self {
            adx_1h_threshold: Decimal::new(25, 0),
            adx_4h_threshold: Decimal::new(25, 0),
            long: EntryGateConfig::default_long(),
            short: EntryGateConfig::default_short(),
        }
    }
}

/// The full operator-patchable bot configuration, persisted as
/// `config.json` and deep-merged by `PATCH /bot/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub symbols: Vec<String>,
    /// Static fallback leverage when the dynamic path is unavailable.
    pub leverage: u32,
    pub dynamic_leverage: DynamicLeverageConfig,
    /// Percent of equity risked per trade.
    pub max_risk_percentage: Decimal,
    pub stop_loss_atr_multiplier: Decimal,
    /// Hard cap on stop distance as a percent of entry.
    pub max_stop_loss_percentage: Decimal,
    pub position_timeout_hours: i64,
    pub scan_interval_secs: u64,
    pub position_scan_interval_secs: u64,
    pub trade_cooldown_secs: u64,
    /// Absolute equity floor below which no entry is attempted.
    pub min_equity: Decimal,
    /// IANA timezone for daily reset and the forced-close window.
    pub timezone: String,
    pub risk: RiskConfig,
    pub advisory: AdvisoryConfig,
    pub trailing_stop: TrailingStopConfig,
    pub indicators: IndicatorsConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            leverage: 10,
            dynamic_leverage: DynamicLeverageConfig::default(),
            max_risk_percentage: Decimal::ONE,
            stop_loss_atr_multiplier: Decimal::new(15, 1), // 1.5
            max_stop_loss_percentage: Decimal::TWO,
            position_timeout_hours: 8,
            scan_interval_secs: 60,
            position_scan_interval_secs: 15,
            trade_cooldown_secs: 300,
            min_equity: Decimal::new(120, 0),
            timezone: "UTC".to_string(),
            risk: RiskConfig::default(),
            advisory: AdvisoryConfig::default(),
            trailing_stop: TrailingStopConfig::default(),
            indicators: IndicatorsConfig::default(),
        }
    }
}

impl BotConfig {
    /// Parses the configured timezone.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for unknown IANA names.
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone: {}", self.timezone)))
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbols must not be empty".into()));
        }
        if self.leverage == 0 {
            return Err(ConfigError::Invalid("leverage must be >= 1".into()));
        }
        if self.dynamic_leverage.min == 0 || self.dynamic_leverage.min > self.dynamic_leverage.max {
            return Err(ConfigError::Invalid(
                "dynamic_leverage bounds must satisfy 1 <= min <= max".into(),
            ));
        }
        if self.max_risk_percentage <= Decimal::ZERO {
            return Err(ConfigError::Invalid("max_risk_percentage must be positive".into()));
        }
        if self.stop_loss_atr_multiplier <= Decimal::ZERO
            || self.max_stop_loss_percentage <= Decimal::ZERO
        {
            return Err(ConfigError::Invalid("stop-loss parameters must be positive".into()));
        }
        if self.scan_interval_secs == 0 || self.position_scan_interval_secs == 0 {
            return Err(ConfigError::Invalid("scan intervals must be positive".into()));
        }
        if self.position_timeout_hours <= 0 {
            return Err(ConfigError::Invalid("position_timeout_hours must be positive".into()));
        }
        for (name, gate) in [("long", &self.indicators.long), ("short", &self.indicators.short)] {
            if gate.rsi_min >= gate.rsi_max {
                return Err(ConfigError::Invalid(format!(
                    "indicators.{name}: rsi_min must be below rsi_max"
                )));
            }
            if gate.volume_ema_period == 0 {
                return Err(ConfigError::Invalid(format!(
                    "indicators.{name}: volume_ema_period must be positive"
                )));
            }
        }
        if self.risk.force_liquidate.hour > 23 || self.risk.force_liquidate.minute > 59 {
            return Err(ConfigError::Invalid("force_liquidate time out of range".into()));
        }
        if self.risk.take_profit.tp1_rr <= Decimal::ZERO
            || self.risk.take_profit.tp2_rr < self.risk.take_profit.tp1_rr
        {
            return Err(ConfigError::Invalid(
                "take_profit requires 0 < tp1_rr <= tp2_rr".into(),
            ));
        }
        self.tz()?;
        Ok(())
    }

    /// Deep-merges a partial JSON document over this configuration and
    /// validates the result. On any error the current config is unchanged.
    ///
    /// # Errors
    /// Returns `ConfigError::Patch` for malformed JSON shapes and
    /// `ConfigError::Invalid` when the merged config fails validation.
    pub fn apply_patch(&self, patch: &serde_json::Value) -> Result<Self, ConfigError> {
        let mut tree = serde_json::to_value(self)?;
        merge_json(&mut tree, patch);
        let merged: Self = serde_json::from_value(tree)?;
        merged.validate()?;
        Ok(merged)
    }
}

/// Recursively merges `patch` into `base`. Objects merge key-by-key; any
/// other value (including arrays) replaces the base value wholesale.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn default_config_is_valid() {
        BotConfig::default().validate().unwrap();
    }

    #[test]
    fn patch_merges_nested_fields_only() {
        let cfg = BotConfig::default();
        let patched = cfg
            .apply_patch(&json!({
                "max_risk_percentage": "2",
                "risk": { "daily_trade_limit": 5 }
            }))
            .unwrap();

        assert_eq!(patched.max_risk_percentage, dec!(2));
        assert_eq!(patched.risk.daily_trade_limit, 5);
        // Untouched siblings survive the merge.
        assert_eq!(patched.risk.circuit_breaker, cfg.risk.circuit_breaker);
        assert_eq!(patched.leverage, cfg.leverage);
    }

    #[test]
    fn patch_replaces_arrays_wholesale() {
        let cfg = BotConfig::default();
        let patched = cfg
            .apply_patch(&json!({ "symbols": ["SOL/USDT"] }))
            .unwrap();
        assert_eq!(patched.symbols, vec!["SOL/USDT".to_string()]);
    }

    #[test]
    fn invalid_patch_is_rejected_and_leaves_config_untouched() {
        let cfg = BotConfig::default();
        let err = cfg.apply_patch(&json!({ "scan_interval_secs": 0 }));
        assert!(err.is_err());
        assert_eq!(cfg, BotConfig::default());
    }

    #[test]
    fn unknown_timezone_fails_validation() {
        let cfg = BotConfig::default();
        let err = cfg.apply_patch(&json!({ "timezone": "Mars/Olympus" }));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_rsi_band_fails_validation() {
        let cfg = BotConfig::default();
        let err = cfg.apply_patch(&json!({
            "indicators": { "long": { "rsi_min": 80, "rsi_max": 40 } }
        }));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = BotConfig::default();
        let text = serde_json::to_string_pretty(&cfg).unwrap();
        let back: BotConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_document_fills_missing_fields_with_defaults() {
        let cfg: BotConfig = serde_json::from_str(r#"{"leverage": 7}"#).unwrap();
        assert_eq!(cfg.leverage, 7);
        assert_eq!(cfg.scan_interval_secs, BotConfig::default().scan_interval_secs);
    }
}
