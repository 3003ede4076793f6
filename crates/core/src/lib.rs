pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{BotConfig, ConfigError};
pub use error::{ExchangeError, ExchangeResult};
pub use traits::{AdvisoryAdapter, AdvisorySnapshot, ExchangeAdapter, PriceStream};
pub use types::{
    AccountBalance, AdvisoryDirection, AdvisoryOpinion, BotState, CachedPrice, Candle,
    CircuitBreakerState, CloseReason, Direction, EngineStatus, ExchangePosition, MarginMode,
    OrderAck, OrderInfo, OrderSide, OrderStatus, Position, PositionMode, RiskLevel,
    StopCause, StopOrderSnapshot, Timeframe, TradeRecord,
};
