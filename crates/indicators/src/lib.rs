//! Pure technical indicators over closed candles.
//!
//! All arithmetic is `Decimal`; every function returns `None` when the
//! input series is too short instead of guessing. Inputs are oldest-first.

use perp_core::Candle;
use rust_decimal::Decimal;

/// Exponential moving average of `values`, seeded with the SMA of the
/// first `period` values. Returns the EMA at the last value.
#[must_use]
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let period_dec = Decimal::from(period as u64);
    let alpha = Decimal::TWO / (period_dec + Decimal::ONE);

    let seed: Decimal = values[..period].iter().copied().sum::<Decimal>() / period_dec;
    let mut current = seed;
    for value in &values[period..] {
        current += alpha * (*value - current);
    }
    Some(current)
}

/// Wilder RSI over closing prices. Needs `period + 1` closes.
#[must_use]
pub fn rsi(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let period_dec = Decimal::from(period as u64);

    let mut avg_gain = Decimal::ZERO;
    let mut avg_loss = Decimal::ZERO;
    for window in closes[..=period].windows(2) {
        let delta = window[1] - window[0];
        if delta >= Decimal::ZERO {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period_dec;
    avg_loss /= period_dec;

    for window in closes[period..].windows(2) {
        let delta = window[1] - window[0];
        let (gain, loss) = if delta >= Decimal::ZERO {
            (delta, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -delta)
        };
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
    }

    if avg_loss.is_zero() {
        return Some(Decimal::ONE_HUNDRED);
    }
    let rs = avg_gain / avg_loss;
    Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
}

/// True range of a candle given the previous close.
fn true_range(candle: &Candle, prev_close: Decimal) -> Decimal {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Wilder ATR. Needs `period + 1` candles.
#[must_use]
pub fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let period_dec = Decimal::from(period as u64);

    let trs: Vec<Decimal> = candles
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect();

    let mut current: Decimal = trs[..period].iter().copied().sum::<Decimal>() / period_dec;
    for tr in &trs[period..] {
        current = (current * (period_dec - Decimal::ONE) + *tr) / period_dec;
    }
    Some(current)
}

/// Wilder ADX. Needs at least `2 * period + 1` candles.
#[must_use]
pub fn adx(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }
    let period_dec = Decimal::from(period as u64);

    // Directional movement and true range per bar transition.
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    let mut trs = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dm.push(if up > down && up > Decimal::ZERO { up } else { Decimal::ZERO });
        minus_dm.push(if down > up && down > Decimal::ZERO { down } else { Decimal::ZERO });
        trs.push(true_range(cur, prev.close));
    }

    let wilder = |series: &[Decimal]| -> Vec<Decimal> {
        // Smoothed running sums, one output per bar from index `period - 1`.
        let mut out = Vec::with_capacity(series.len() - period + 1);
        let mut current: Decimal = series[..period].iter().copied().sum();
        out.push(current);
        for value in &series[period..] {
            current = current - current / period_dec + *value;
            out.push(current);
        }
        out
    };

    let sm_plus = wilder(&plus_dm);
    let sm_minus = wilder(&minus_dm);
    let sm_tr = wilder(&trs);

    let mut dxs = Vec::with_capacity(sm_tr.len());
    for i in 0..sm_tr.len() {
        if sm_tr[i].is_zero() {
            dxs.push(Decimal::ZERO);
            continue;
        }
        let plus_di = Decimal::ONE_HUNDRED * sm_plus[i] / sm_tr[i];
        let minus_di = Decimal::ONE_HUNDRED * sm_minus[i] / sm_tr[i];
        let di_sum = plus_di + minus_di;
        if di_sum.is_zero() {
            dxs.push(Decimal::ZERO);
        } else {
            dxs.push(Decimal::ONE_HUNDRED * (plus_di - minus_di).abs() / di_sum);
        }
    }

    if dxs.len() < period {
        return None;
    }
    let mut adx_value: Decimal = dxs[..period].iter().copied().sum::<Decimal>() / period_dec;
    for dx in &dxs[period..] {
        adx_value = (adx_value * (period_dec - Decimal::ONE) + *dx) / period_dec;
    }
    Some(adx_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat_candle(ts: i64, price: Decimal, range: Decimal) -> Candle {
        Candle {
            timestamp: ts,
            open: price,
            high: price + range,
            low: price - range,
            close: price,
            volume: dec!(100),
        }
    }

    fn trending_candles(n: usize, start: Decimal, step: Decimal) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = start + step * Decimal::from(i as u64);
                Candle {
                    timestamp: i as i64 * 900_000,
                    open: base,
                    high: base + dec!(5),
                    low: base - dec!(5),
                    close: base + dec!(2),
                    volume: dec!(100),
                }
            })
            .collect()
    }

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let values = vec![dec!(50); 40];
        assert_eq!(ema(&values, 20), Some(dec!(50)));
    }

    #[test]
    fn ema_tracks_rising_series_from_below() {
        let values: Vec<Decimal> = (1..=60).map(Decimal::from).collect();
        let result = ema(&values, 20).unwrap();
        assert!(result < dec!(60));
        assert!(result > dec!(40));
    }

    #[test]
    fn ema_requires_full_period() {
        let values = vec![dec!(1); 19];
        assert_eq!(ema(&values, 20), None);
    }

    #[test]
    fn rsi_of_straight_rally_is_100() {
        let closes: Vec<Decimal> = (1..=30).map(Decimal::from).collect();
        assert_eq!(rsi(&closes, 14), Some(dec!(100)));
    }

    #[test]
    fn rsi_of_straight_selloff_is_0() {
        let closes: Vec<Decimal> = (1..=30).rev().map(Decimal::from).collect();
        assert_eq!(rsi(&closes, 14), Some(dec!(0)));
    }

    #[test]
    fn rsi_of_chop_is_strictly_inside_the_band() {
        let closes: Vec<Decimal> = (0..30)
            .map(|i| if i % 2 == 0 { dec!(100) } else { dec!(101) })
            .collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value > dec!(0) && value < dec!(100));
    }

    #[test]
    fn atr_of_constant_range_candles_is_the_range() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| flat_candle(i * 900_000, dec!(100), dec!(1)))
            .collect();
        // TR = high - low = 2 on every bar.
        assert_eq!(atr(&candles, 14), Some(dec!(2)));
    }

    #[test]
    fn atr_requires_period_plus_one_candles() {
        let candles: Vec<Candle> = (0..14)
            .map(|i| flat_candle(i * 900_000, dec!(100), dec!(1)))
            .collect();
        assert_eq!(atr(&candles, 14), None);
    }

    #[test]
    fn adx_of_relentless_uptrend_is_100() {
        let candles = trending_candles(60, dec!(1000), dec!(10));
        assert_eq!(adx(&candles, 14), Some(dec!(100)));
    }

    #[test]
    fn adx_of_flat_market_is_0() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| flat_candle(i * 900_000, dec!(100), dec!(1)))
            .collect();
        assert_eq!(adx(&candles, 14), Some(dec!(0)));
    }

    #[test]
    fn adx_needs_two_periods_of_history() {
        let candles = trending_candles(28, dec!(1000), dec!(10));
        assert_eq!(adx(&candles, 14), None);
    }
}
