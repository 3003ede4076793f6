use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trade direction for a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Sign applied to price deltas when computing PnL (+1 long, -1 short).
    #[must_use]
    pub const fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// The order side that opens a position in this direction.
    #[must_use]
    pub const fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// The order side that closes a position in this direction.
    #[must_use]
    pub const fn exit_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Engine state machine. `Position` iff a position is held; `Halted` is the
/// only state that requires an operator start to leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineStatus {
    Idle,
    Monitoring,
    Opening,
    Position,
    Closing,
    Halted,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Monitoring => "MONITORING",
            Self::Opening => "OPENING",
            Self::Position => "POSITION",
            Self::Closing => "CLOSING",
            Self::Halted => "HALTED",
        };
        write!(f, "{s}")
    }
}

/// A closed OHLCV candle. Timestamp is the bar open in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Candle timeframes the strategy consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M15,
    H1,
    H4,
}

impl Timeframe {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptive snapshot of the live protective stop order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrderSnapshot {
    pub order_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub stop_price: Decimal,
    pub status: String,
    pub placed_at: DateTime<Utc>,
}

/// An open position. Created on confirmed entry, mutated only by the order
/// lifecycle, archived to history on close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    /// Current protective stop. Moves only in the profitable direction.
    pub stop_loss: Decimal,
    /// Stop as placed at entry; fixed for the lifetime of the position.
    pub initial_stop_loss: Decimal,
    pub take_profit_1: Decimal,
    pub take_profit_2: Decimal,
    pub open_time: DateTime<Utc>,
    pub order_id: String,
    pub stop_order: Option<StopOrderSnapshot>,
    pub last_stop_update: Option<DateTime<Utc>>,
    /// ATR observed at entry, kept for trailing-stop distance.
    pub entry_atr: Decimal,
}

impl Position {
    /// Initial risk in quote units: |entry - initial stop| * quantity.
    #[must_use]
    pub fn initial_risk(&self) -> Decimal {
        (self.entry_price - self.initial_stop_loss).abs() * self.quantity
    }

    /// Unleveraged PnL in quote units at `price`.
    #[must_use]
    pub fn pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity * self.direction.sign()
    }

    /// PnL as a percentage of margin (leveraged).
    #[must_use]
    pub fn pnl_percentage(&self, price: Decimal) -> Decimal {
        let notional = self.entry_price * self.quantity;
        if notional.is_zero() {
            return Decimal::ZERO;
        }
        self.pnl(price) / notional * Decimal::ONE_HUNDRED * Decimal::from(self.leverage)
    }

    /// Hours this position has been held at `now`.
    #[must_use]
    pub fn holding_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.open_time).num_hours()
    }
}

/// Why a position was closed. Serialized into the trade history with a
/// stable wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "TP1")]
    Tp1,
    #[serde(rename = "TP2")]
    Tp2,
    #[serde(rename = "trailing-stop-hit")]
    TrailingStop,
    #[serde(rename = "stop-hit-observed")]
    StopHitObserved,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "forced-close")]
    ForcedClose,
    #[serde(rename = "compensated-close-unknown")]
    CompensatedUnknown,
    #[serde(rename = "operator-close")]
    Operator,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::TrailingStop => "trailing-stop-hit",
            Self::StopHitObserved => "stop-hit-observed",
            Self::Timeout => "timeout",
            Self::ForcedClose => "forced-close",
            Self::CompensatedUnknown => "compensated-close-unknown",
            Self::Operator => "operator-close",
        };
        write!(f, "{s}")
    }
}

/// One row of the append-only trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub pnl: Decimal,
    pub pnl_percentage: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub reason: CloseReason,
}

/// Latched circuit-breaker state. Once triggered it stays set until an
/// operator start clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub is_triggered: bool,
    pub reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub daily_loss: Decimal,
    pub consecutive_losses: u32,
}

/// Why the scheduler stopped itself. Used by the daily reset to decide
/// whether `is_running` should be restored automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopCause {
    Operator,
    CircuitBreaker,
    TradeCap,
}

/// The single persisted runtime state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub status: EngineStatus,
    /// Operator intent: whether the scheduler should tick.
    pub is_running: bool,
    /// Risk latch: false when the trade cap, cooldown, or breaker forbids entries.
    pub allow_new_trades: bool,
    pub current_position: Option<Position>,
    pub circuit_breaker: CircuitBreakerState,
    #[serde(default)]
    pub stop_cause: Option<StopCause>,
    pub today_trades: u32,
    pub daily_pnl: Decimal,
    pub last_reset_date: NaiveDate,
    pub last_trade_time: Option<DateTime<Utc>>,
    // Live fields, populated only while holding.
    pub current_price: Option<Decimal>,
    pub current_pnl: Option<Decimal>,
    pub current_pnl_percentage: Option<Decimal>,
    // Aggregates, recomputed from history at boot.
    pub total_trades: u64,
    pub total_pnl: Decimal,
    pub win_rate: f64,
}

impl Default for BotState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            is_running: false,
            allow_new_trades: true,
            current_position: None,
            circuit_breaker: CircuitBreakerState::default(),
            stop_cause: None,
            today_trades: 0,
            daily_pnl: Decimal::ZERO,
            last_reset_date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default(),
            last_trade_time: None,
            current_price: None,
            current_pnl: None,
            current_pnl_percentage: None,
            total_trades: 0,
            total_pnl: Decimal::ZERO,
            win_rate: 0.0,
        }
    }
}

impl BotState {
    /// Clears the live price/PnL fields after a close.
    pub fn clear_live_fields(&mut self) {
        self.current_price = None;
        self.current_pnl = None;
        self.current_pnl_percentage = None;
    }
}

/// Account balance as reported by the exchange (quote currency).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available: Decimal,
    pub total: Decimal,
}

/// A position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Direction,
    pub contracts: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

/// Acknowledgement returned for a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_quantity: Option<Decimal>,
    pub average_price: Option<Decimal>,
}

/// Normalized order status. Exchange-native strings are mapped inside the
/// adapter; the core only sees this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Filled,
    Canceled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// True when the order has executed (fully or as a triggered stop).
    #[must_use]
    pub const fn is_executed(self) -> bool {
        matches!(self, Self::Closed | Self::Filled)
    }
}

/// Result of fetching a single order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub status: OrderStatus,
    pub average: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub filled: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositionMode {
    OneWay,
    Hedge,
}

/// A cached last-trade price from the stream adapter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedPrice {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Advisory verdict direction. `Idle` is the sentinel for "no opinion".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdvisoryDirection {
    Long,
    Short,
    Idle,
}

impl AdvisoryDirection {
    /// True when the advisory agrees with a technical direction.
    #[must_use]
    pub const fn agrees_with(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Long, Direction::Long) | (Self::Short, Direction::Short)
        )
    }
}

/// Risk bucket reported by the advisory. Ordered: Low < Medium < High.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Scored opinion returned by the advisory service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryOpinion {
    pub direction: AdvisoryDirection,
    /// 0-100.
    pub confidence: Decimal,
    /// 0-100.
    pub score: Decimal,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub reasoning: String,
}

impl AdvisoryOpinion {
    /// The sentinel returned when the advisory is unreachable or returns
    /// garbage: no direction, zero confidence, maximum risk.
    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            direction: AdvisoryDirection::Idle,
            confidence: Decimal::ZERO,
            score: Decimal::ZERO,
            risk_level: RiskLevel::High,
            reasoning: String::new(),
        }
    }
}
