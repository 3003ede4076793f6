pub mod advisory_gate;
pub mod evaluator;
pub mod types;

pub use advisory_gate::{adjust_opinion, gate_advisory};
pub use evaluator::evaluate;
pub use types::{IndicatorSet, MarketSnapshot, RejectReason, Rejection, Signal, MIN_CANDLES};
