//! Adapter contracts the engine consumes. Implementations live in the
//! adapter crates (and in test fixtures); the engine never sees an
//! exchange-native payload.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ExchangeResult;
use crate::types::{
    AccountBalance, AdvisoryOpinion, CachedPrice, Candle, Direction, ExchangePosition,
    MarginMode, OrderAck, OrderInfo, OrderSide, PositionMode, Timeframe,
};

/// Order, market-data, and account endpoints of the exchange.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn load_markets(&self) -> ExchangeResult<()>;

    async fn fetch_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Closed candles, oldest first.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn fetch_balance(&self) -> ExchangeResult<AccountBalance>;

    async fn fetch_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> ExchangeResult<()>;

    async fn set_position_mode(&self, mode: PositionMode) -> ExchangeResult<()>;

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<OrderAck>;

    /// Reduce-only stop-market order.
    async fn stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<OrderAck>;

    /// `trigger` selects the conditional-order book (stop orders live there
    /// on most venues).
    async fn cancel_order(&self, order_id: &str, symbol: &str, trigger: bool)
        -> ExchangeResult<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
        trigger: bool,
    ) -> ExchangeResult<OrderInfo>;

    /// Decimal places for order quantities on this symbol.
    async fn lot_precision(&self, symbol: &str) -> ExchangeResult<u32>;

    /// Minimum order notional in quote units.
    async fn min_notional(&self, symbol: &str) -> ExchangeResult<Decimal>;
}

/// Last-trade price stream with a short-TTL cache.
#[async_trait]
pub trait PriceStream: Send + Sync {
    async fn connect(&self) -> ExchangeResult<()>;

    async fn subscribe(&self, symbols: &[String]) -> ExchangeResult<()>;

    async fn disconnect(&self);

    /// Most recent streamed price, if any. Callers decide how much
    /// staleness they accept.
    fn cached_price(&self, symbol: &str) -> Option<CachedPrice>;
}

/// Market snapshot handed to the advisory service.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdvisorySnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub proposed_direction: Direction,
    pub ema_20: Decimal,
    pub ema_30: Decimal,
    pub ema_60: Decimal,
    pub rsi: Decimal,
    pub atr: Decimal,
    pub adx_15m: Decimal,
    pub adx_1h: Decimal,
    pub adx_4h: Decimal,
}

/// Remote scoring of a market snapshot. Implementations must return the
/// sentinel opinion instead of erroring on timeouts or malformed bodies.
#[async_trait]
pub trait AdvisoryAdapter: Send + Sync {
    async fn analyze(&self, snapshot: &AdvisorySnapshot) -> AdvisoryOpinion;
}
