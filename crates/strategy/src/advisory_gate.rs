//! Advisory gating and the deterministic post-adjustment.
//!
//! The adjustment runs after the advisory returns and before the gate
//! compares against the configured thresholds. It is a pure function so a
//! pinned advisory response always yields the same verdict.

use perp_core::config::AdvisoryConfig;
use perp_core::{AdvisoryDirection, AdvisoryOpinion, Direction, RiskLevel};
use rust_decimal::Decimal;

use crate::types::{IndicatorSet, RejectReason, Rejection};

const STRONG_ADX: Decimal = Decimal::from_parts(30, 0, 0, false, 0);
const CONFIDENCE_BUMP: Decimal = Decimal::from_parts(5, 0, 0, false, 0);
const RSI_OVERBOUGHT: Decimal = Decimal::from_parts(75, 0, 0, false, 0);
const RSI_OVERSOLD: Decimal = Decimal::from_parts(25, 0, 0, false, 0);
/// ATR above 2% of price counts as a hot market.
const HOT_ATR_RATIO: Decimal = Decimal::from_parts(2, 0, 0, false, 2);

/// Re-weights an advisory opinion against the locally observed regime:
/// a strong 15m trend earns a confidence bump, an RSI extreme escalates
/// the risk bucket, and elevated ATR shaves the score.
#[must_use]
pub fn adjust_opinion(
    opinion: &AdvisoryOpinion,
    indicators: &IndicatorSet,
    price: Decimal,
) -> AdvisoryOpinion {
    let mut adjusted = opinion.clone();

    if indicators.adx_15m >= STRONG_ADX {
        adjusted.confidence = (adjusted.confidence + CONFIDENCE_BUMP).min(Decimal::ONE_HUNDRED);
    }

    if indicators.rsi >= RSI_OVERBOUGHT || indicators.rsi <= RSI_OVERSOLD {
        adjusted.risk_level = match adjusted.risk_level {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium | RiskLevel::High => RiskLevel::High,
        };
    }

    if !price.is_zero() && indicators.atr / price >= HOT_ATR_RATIO {
        adjusted.score = (adjusted.score - CONFIDENCE_BUMP).max(Decimal::ZERO);
    }

    adjusted
}

/// Applies the advisory entry gate to a technically approved direction.
///
/// # Errors
/// Returns a typed rejection when the opinion is idle, contradicts the
/// technical direction, or misses the confidence/risk thresholds.
pub fn gate_advisory(
    direction: Direction,
    opinion: &AdvisoryOpinion,
    cfg: &AdvisoryConfig,
) -> Result<(), Rejection> {
    if opinion.direction == AdvisoryDirection::Idle {
        return Err(Rejection::new(RejectReason::AdvisoryIdle, opinion.reasoning.clone()));
    }
    if !opinion.direction.agrees_with(direction) {
        return Err(Rejection::new(
            RejectReason::AdvisoryDisagrees,
            format!("technical={direction} advisory={:?}", opinion.direction),
        ));
    }
    if opinion.confidence < cfg.min_confidence {
        return Err(Rejection::new(
            RejectReason::AdvisoryLowConfidence,
            format!("confidence={} min={}", opinion.confidence, cfg.min_confidence),
        ));
    }
    if opinion.risk_level > cfg.max_risk_level {
        return Err(Rejection::new(
            RejectReason::AdvisoryRiskTooHigh,
            format!("risk={} max={}", opinion.risk_level, cfg.max_risk_level),
        ));
    }
    Ok(())
}
