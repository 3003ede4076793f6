use perp_core::{AdvisoryOpinion, Candle, Direction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Minimum closed candles required per timeframe before evaluating.
pub const MIN_CANDLES: usize = 96;

/// Everything the evaluator reads about a symbol. Fetched by the engine,
/// consumed immutably here.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub candles_15m: Vec<Candle>,
    pub candles_1h: Vec<Candle>,
    pub candles_4h: Vec<Candle>,
}

/// Last-closed-bar indicator values backing a signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ema_20: Decimal,
    pub ema_30: Decimal,
    pub ema_60: Decimal,
    pub rsi: Decimal,
    pub atr: Decimal,
    pub adx_15m: Decimal,
    pub adx_1h: Decimal,
    pub adx_4h: Decimal,
}

/// A fully gated entry signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub price: Decimal,
    pub indicators: IndicatorSet,
    pub advisory: Option<AdvisoryOpinion>,
}

/// Why the evaluator declined to signal. A closed set so every rejection
/// logs the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    InsufficientCandles,
    AdxGate,
    NoDirection,
    EmaDeviation,
    RsiOutOfBand,
    CandleNotConfirming,
    VolumeUnconfirmed,
    AdvisoryIdle,
    AdvisoryDisagrees,
    AdvisoryLowConfidence,
    AdvisoryRiskTooHigh,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InsufficientCandles => "insufficient candles",
            Self::AdxGate => "ADX gate",
            Self::NoDirection => "no directional alignment",
            Self::EmaDeviation => "price too far from EMA",
            Self::RsiOutOfBand => "RSI out of band",
            Self::CandleNotConfirming => "candle not confirming",
            Self::VolumeUnconfirmed => "volume unconfirmed",
            Self::AdvisoryIdle => "advisory idle",
            Self::AdvisoryDisagrees => "advisory disagrees",
            Self::AdvisoryLowConfidence => "advisory confidence too low",
            Self::AdvisoryRiskTooHigh => "advisory risk too high",
        };
        write!(f, "{s}")
    }
}

/// A typed rejection with a human-readable detail for the log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into() }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}
