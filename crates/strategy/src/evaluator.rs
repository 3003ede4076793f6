//! Technical entry evaluation: a pure function of the market snapshot and
//! the indicator configuration. The advisory gate is applied separately so
//! the technical verdict stays reproducible with the advisory pinned.

use perp_core::config::{EntryGateConfig, IndicatorsConfig};
use perp_core::{Candle, Direction};
use rust_decimal::Decimal;

use crate::types::{IndicatorSet, MarketSnapshot, RejectReason, Rejection, Signal, MIN_CANDLES};

const EMA_FAST: usize = 20;
const EMA_MID: usize = 30;
const EMA_SLOW: usize = 60;
const RSI_PERIOD: usize = 14;
const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;

/// Evaluates the technical gates for one symbol. Returns a signal without
/// an advisory attached; the engine layers the advisory gate on top.
pub fn evaluate(snapshot: &MarketSnapshot, cfg: &IndicatorsConfig) -> Result<Signal, Rejection> {
    let indicators = compute_indicators(snapshot)?;

    // ADX regime filter: 1h OR 4h must show trend. Logged on pass so the
    // OR semantics stay auditable.
    if indicators.adx_1h < cfg.adx_1h_threshold && indicators.adx_4h < cfg.adx_4h_threshold {
        return Err(Rejection::new(
            RejectReason::AdxGate,
            format!(
                "adx_1h={} < {} and adx_4h={} < {}",
                indicators.adx_1h, cfg.adx_1h_threshold, indicators.adx_4h, cfg.adx_4h_threshold
            ),
        ));
    }
    tracing::info!(
        symbol = %snapshot.symbol,
        adx_1h = %indicators.adx_1h,
        adx_4h = %indicators.adx_4h,
        "adx gate passed"
    );

    let direction = detect_direction(snapshot.price, &indicators).ok_or_else(|| {
        Rejection::new(
            RejectReason::NoDirection,
            format!(
                "price={} ema20={} ema60={}",
                snapshot.price, indicators.ema_20, indicators.ema_60
            ),
        )
    })?;

    let gate = match direction {
        Direction::Long => &cfg.long,
        Direction::Short => &cfg.short,
    };

    check_ema_proximity(snapshot.price, &indicators, gate)?;
    check_rsi_band(indicators.rsi, gate)?;

    let Some(last) = snapshot.candles_15m.last() else {
        return Err(Rejection::new(RejectReason::InsufficientCandles, "15m"));
    };
    check_candle_confirmation(last, direction, gate)?;

    if gate.volume_confirmation {
        check_volume(&snapshot.candles_15m, gate)?;
    }

    Ok(Signal {
        symbol: snapshot.symbol.clone(),
        direction,
        price: snapshot.price,
        indicators,
        advisory: None,
    })
}

/// Computes the last-closed-bar indicator set, rejecting short series.
fn compute_indicators(snapshot: &MarketSnapshot) -> Result<IndicatorSet, Rejection> {
    for (timeframe, series) in [
        ("15m", &snapshot.candles_15m),
        ("1h", &snapshot.candles_1h),
        ("4h", &snapshot.candles_4h),
    ] {
        if series.len() < MIN_CANDLES {
            return Err(Rejection::new(
                RejectReason::InsufficientCandles,
                format!("{timeframe}: {} of {MIN_CANDLES}", series.len()),
            ));
        }
    }

    let closes_15m: Vec<Decimal> = snapshot.candles_15m.iter().map(|c| c.close).collect();

    let short = |reason: &str| {
        Rejection::new(RejectReason::InsufficientCandles, reason.to_string())
    };

    Ok(IndicatorSet {
        ema_20: perp_indicators::ema(&closes_15m, EMA_FAST).ok_or_else(|| short("ema20"))?,
        ema_30: perp_indicators::ema(&closes_15m, EMA_MID).ok_or_else(|| short("ema30"))?,
        ema_60: perp_indicators::ema(&closes_15m, EMA_SLOW).ok_or_else(|| short("ema60"))?,
        rsi: perp_indicators::rsi(&closes_15m, RSI_PERIOD).ok_or_else(|| short("rsi"))?,
        atr: perp_indicators::atr(&snapshot.candles_15m, ATR_PERIOD)
            .ok_or_else(|| short("atr"))?,
        adx_15m: perp_indicators::adx(&snapshot.candles_15m, ADX_PERIOD)
            .ok_or_else(|| short("adx 15m"))?,
        adx_1h: perp_indicators::adx(&snapshot.candles_1h, ADX_PERIOD)
            .ok_or_else(|| short("adx 1h"))?,
        adx_4h: perp_indicators::adx(&snapshot.candles_4h, ADX_PERIOD)
            .ok_or_else(|| short("adx 4h"))?,
    })
}

/// LONG iff EMA20 > EMA60 and price above EMA20; SHORT symmetric.
fn detect_direction(price: Decimal, ind: &IndicatorSet) -> Option<Direction> {
    if ind.ema_20 > ind.ema_60 && price > ind.ema_20 {
        Some(Direction::Long)
    } else if ind.ema_20 < ind.ema_60 && price < ind.ema_20 {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Entry must sit within the configured relative distance of EMA20 or EMA30.
fn check_ema_proximity(
    price: Decimal,
    ind: &IndicatorSet,
    gate: &EntryGateConfig,
) -> Result<(), Rejection> {
    let near = |ema: Decimal| {
        !ema.is_zero() && ((price - ema).abs() / ema) <= gate.ema_deviation_threshold
    };
    if near(ind.ema_20) || near(ind.ema_30) {
        Ok(())
    } else {
        Err(Rejection::new(
            RejectReason::EmaDeviation,
            format!(
                "price={price} ema20={} ema30={} threshold={}",
                ind.ema_20, ind.ema_30, gate.ema_deviation_threshold
            ),
        ))
    }
}

fn check_rsi_band(rsi: Decimal, gate: &EntryGateConfig) -> Result<(), Rejection> {
    if rsi >= gate.rsi_min && rsi <= gate.rsi_max {
        Ok(())
    } else {
        Err(Rejection::new(
            RejectReason::RsiOutOfBand,
            format!("rsi={rsi} band=[{}, {}]", gate.rsi_min, gate.rsi_max),
        ))
    }
}

/// The last closed 15m candle must support the entry: a body in the trade
/// direction, or a rejection shadow at least `candle_shadow_threshold` of
/// the open on the entry side.
fn check_candle_confirmation(
    candle: &Candle,
    direction: Direction,
    gate: &EntryGateConfig,
) -> Result<(), Rejection> {
    let min_shadow = candle.open * gate.candle_shadow_threshold;
    let confirmed = match direction {
        Direction::Long => {
            let lower_shadow = candle.open.min(candle.close) - candle.low;
            candle.close > candle.open || lower_shadow >= min_shadow
        }
        Direction::Short => {
            let upper_shadow = candle.high - candle.open.max(candle.close);
            candle.close < candle.open || upper_shadow >= min_shadow
        }
    };
    if confirmed {
        Ok(())
    } else {
        Err(Rejection::new(
            RejectReason::CandleNotConfirming,
            format!(
                "open={} high={} low={} close={} direction={direction}",
                candle.open, candle.high, candle.low, candle.close
            ),
        ))
    }
}

/// Opt-in volume filter: the last bar's volume must clear a multiple of
/// its EMA.
fn check_volume(candles: &[Candle], gate: &EntryGateConfig) -> Result<(), Rejection> {
    let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();
    let volume_ema = perp_indicators::ema(&volumes, gate.volume_ema_period).ok_or_else(|| {
        Rejection::new(RejectReason::InsufficientCandles, "volume ema".to_string())
    })?;
    let current = volumes.last().copied().unwrap_or_default();
    let floor = volume_ema * gate.volume_ema_multiplier;
    if current >= floor {
        Ok(())
    } else {
        Err(Rejection::new(
            RejectReason::VolumeUnconfirmed,
            format!("volume={current} needed {floor}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_core::config::IndicatorsConfig;
    use rust_decimal_macros::dec;

    /// Builds a snapshot whose 15m series trends up into `last_close` so
    /// that EMA20 > EMA60, with the price given separately.
    fn bullish_snapshot(price: Decimal) -> MarketSnapshot {
        let mut candles_15m = Vec::new();
        // Long flat base, then a steady climb. Keeps EMAs ordered and the
        // last close near the recent EMAs.
        for i in 0..60 {
            candles_15m.push(candle(i, dec!(49000), dec!(49000)));
        }
        for i in 60..96 {
            let base = dec!(49000) + Decimal::from((i - 60) as u64) * dec!(28);
            candles_15m.push(candle(i, base, base + dec!(20)));
        }

        let trend = |step: Decimal| -> Vec<perp_core::Candle> {
            (0..96)
                .map(|i| {
                    let base = dec!(40000) + Decimal::from(i as u64) * step;
                    candle(i, base, base + step / dec!(2))
                })
                .collect()
        };

        MarketSnapshot {
            symbol: "BTC/USDT".to_string(),
            price,
            candles_15m,
            candles_1h: trend(dec!(50)),
            candles_4h: trend(dec!(120)),
        }
    }

    fn candle(i: usize, open: Decimal, close: Decimal) -> perp_core::Candle {
        let high = open.max(close) + dec!(10);
        let low = open.min(close) - dec!(10);
        perp_core::Candle {
            timestamp: i as i64 * 900_000,
            open,
            high,
            low,
            close,
            volume: dec!(500),
        }
    }

    fn cfg() -> IndicatorsConfig {
        let mut cfg = IndicatorsConfig::default();
        // Wide bands so individual tests can isolate one gate. The synthetic
        // series never prints a down close, so its RSI sits at 100.
        cfg.long.ema_deviation_threshold = dec!(0.05);
        cfg.short.ema_deviation_threshold = dec!(0.05);
        cfg.long.rsi_min = dec!(0);
        cfg.long.rsi_max = dec!(100);
        cfg.short.rsi_min = dec!(0);
        cfg.short.rsi_max = dec!(100);
        cfg
    }

    #[test]
    fn trending_bullish_market_signals_long() {
        let snapshot = bullish_snapshot(dec!(50050));
        let signal = evaluate(&snapshot, &cfg()).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.price, dec!(50050));
        assert!(signal.advisory.is_none());
        assert!(signal.indicators.ema_20 > signal.indicators.ema_60);
    }

    #[test]
    fn weak_adx_rejects_with_adx_gate() {
        let mut snapshot = bullish_snapshot(dec!(50050));
        // Flat 1h/4h series: ADX collapses to zero on both gates.
        let flat: Vec<perp_core::Candle> =
            (0..96).map(|i| candle(i, dec!(40000), dec!(40000))).collect();
        snapshot.candles_1h = flat.clone();
        snapshot.candles_4h = flat;

        let rejection = evaluate(&snapshot, &cfg()).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::AdxGate);
    }

    #[test]
    fn price_below_fast_ema_has_no_direction() {
        let snapshot = bullish_snapshot(dec!(49500));
        let rejection = evaluate(&snapshot, &cfg()).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::NoDirection);
    }

    #[test]
    fn price_far_from_emas_rejects_on_deviation() {
        let mut config = cfg();
        config.long.ema_deviation_threshold = dec!(0.001);
        let snapshot = bullish_snapshot(dec!(50600));
        let rejection = evaluate(&snapshot, &config).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::EmaDeviation);
    }

    #[test]
    fn rsi_band_violation_rejects() {
        let mut config = cfg();
        // The climbing series produces a high RSI; shrink the band under it.
        config.long.rsi_min = dec!(1);
        config.long.rsi_max = dec!(20);
        let snapshot = bullish_snapshot(dec!(50050));
        let rejection = evaluate(&snapshot, &config).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::RsiOutOfBand);
    }

    #[test]
    fn bearish_last_candle_without_shadow_rejects_long() {
        let mut snapshot = bullish_snapshot(dec!(50050));
        let last = snapshot.candles_15m.last_mut().unwrap();
        // Bearish body, no lower shadow at all.
        last.open = dec!(50030);
        last.close = dec!(50000);
        last.low = dec!(50000);
        last.high = dec!(50035);

        let rejection = evaluate(&snapshot, &cfg()).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::CandleNotConfirming);
    }

    #[test]
    fn bearish_candle_with_long_lower_shadow_confirms_long() {
        let mut snapshot = bullish_snapshot(dec!(50050));
        let last = snapshot.candles_15m.last_mut().unwrap();
        last.open = dec!(50030);
        last.close = dec!(50000);
        last.high = dec!(50035);
        // Lower shadow of 100 on a ~50000 open clears the 0.1% threshold.
        last.low = dec!(49900);

        assert!(evaluate(&snapshot, &cfg()).is_ok());
    }

    #[test]
    fn volume_confirmation_rejects_thin_tape() {
        let mut config = cfg();
        config.long.volume_confirmation = true;
        config.long.volume_ema_multiplier = dec!(1.5);
        // All volumes equal, so current = EMA < 1.5 * EMA.
        let snapshot = bullish_snapshot(dec!(50050));
        let rejection = evaluate(&snapshot, &config).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::VolumeUnconfirmed);
    }

    #[test]
    fn volume_confirmation_passes_on_expansion() {
        let mut config = cfg();
        config.long.volume_confirmation = true;
        config.long.volume_ema_multiplier = dec!(1.5);
        let mut snapshot = bullish_snapshot(dec!(50050));
        snapshot.candles_15m.last_mut().unwrap().volume = dec!(5000);
        assert!(evaluate(&snapshot, &config).is_ok());
    }

    #[test]
    fn short_series_rejects_before_any_math() {
        let mut snapshot = bullish_snapshot(dec!(50050));
        snapshot.candles_4h.truncate(40);
        let rejection = evaluate(&snapshot, &cfg()).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::InsufficientCandles);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let snapshot = bullish_snapshot(dec!(50050));
        let config = cfg();
        let first = evaluate(&snapshot, &config).unwrap();
        let second = evaluate(&snapshot, &config).unwrap();
        assert_eq!(first.indicators, second.indicators);
        assert_eq!(first.direction, second.direction);
    }
}
