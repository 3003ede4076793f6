//! Order lifecycle: entry with post-trade confirmation, protective stop
//! management, exits, and the compensated close that reconciles state with
//! the exchange after an out-of-band fill.

use anyhow::Result;
use chrono::{DateTime, Utc};
use perp_core::{
    AdvisoryOpinion, BotConfig, CloseReason, Direction, EngineStatus, Position,
    StopOrderSnapshot, TradeRecord,
};
use perp_strategy::Signal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actor::{EngineActor, MonitorIndicators};

/// Polls after an entry order before declaring the entry unconfirmed.
const CONFIRM_ATTEMPTS: u32 = 3;
const CONFIRM_SPACING_MS: u64 = 500;
/// Bounds for the risk-derived leverage term.
const SAFE_LEVERAGE_MIN: u32 = 1;
const SAFE_LEVERAGE_MAX: u32 = 20;
/// Monitor indicator refresh policy.
const INDICATOR_REFRESH_SECS: i64 = 300;
const INDICATOR_REFRESH_MOVE_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 1%
/// PnL log throttle.
const PNL_LOG_INTERVAL_SECS: i64 = 30;
const PNL_LOG_DELTA_PCT: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5%

/// Entry/exit failures with operator-meaningful variants.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("equity {equity} below safety floor {floor}")]
    EquityBelowFloor { equity: Decimal, floor: Decimal },

    #[error("no position appeared on the exchange after {attempts} polls")]
    EntryNotConfirmed { attempts: u32 },

    #[error("order notional {notional} below exchange minimum {minimum} and bumping would exceed the leverage cap")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },

    #[error("computed order quantity rounded to zero")]
    ZeroQuantity,
}

/// Protective stop placement: the smaller of the ATR distance and the
/// hard percentage cap, on the losing side of the entry.
pub(crate) fn compute_stop(
    direction: Direction,
    entry: Decimal,
    atr: Decimal,
    cfg: &BotConfig,
) -> (Decimal, Decimal) {
    let atr_distance = atr * cfg.stop_loss_atr_multiplier;
    let pct_distance = entry * cfg.max_stop_loss_percentage / Decimal::ONE_HUNDRED;
    let distance = atr_distance.min(pct_distance);
    let stop = match direction {
        Direction::Long => entry - distance,
        Direction::Short => entry + distance,
    };
    (stop, distance)
}

/// Final leverage: the dynamic (advisory-weighted) term capped by the
/// risk-derived safe term, clamped to the configured band. Falls back to
/// the static configured leverage when the dynamic path is unavailable.
pub(crate) fn select_leverage(
    cfg: &BotConfig,
    advisory: Option<&AdvisoryOpinion>,
    stop_fraction: Decimal,
) -> u32 {
    let dynamic = if cfg.dynamic_leverage.enabled {
        advisory.and_then(|opinion| {
            let confidence_weight =
                Decimal::new(8, 1) + opinion.confidence / Decimal::ONE_HUNDRED;
            let multiplier = cfg.dynamic_leverage.risk_multiplier.for_level(opinion.risk_level);
            let raw = Decimal::from(cfg.dynamic_leverage.base) * confidence_weight * multiplier;
            raw.round().to_u32()
        })
    } else {
        None
    };

    let Some(dynamic) = dynamic else {
        return cfg.leverage;
    };
    let dynamic = dynamic.clamp(cfg.dynamic_leverage.min, cfg.dynamic_leverage.max);

    let safe = if stop_fraction > Decimal::ZERO {
        (cfg.max_risk_percentage / Decimal::ONE_HUNDRED / stop_fraction)
            .round()
            .to_u32()
            .unwrap_or(SAFE_LEVERAGE_MIN)
            .clamp(SAFE_LEVERAGE_MIN, SAFE_LEVERAGE_MAX)
    } else {
        SAFE_LEVERAGE_MIN
    };

    dynamic
        .min(safe)
        .clamp(cfg.dynamic_leverage.min, cfg.dynamic_leverage.max)
}

impl EngineActor {
    // ==================== Entry ====================

    /// Opens a position from a fully gated signal. On any failure the
    /// engine reverts to MONITORING with no partial state.
    ///
    /// # Errors
    /// Returns the underlying entry failure after reverting.
    pub async fn open_position(&mut self, signal: &Signal) -> Result<()> {
        {
            let state = self.store.state();
            if state.status != EngineStatus::Monitoring
                || state.current_position.is_some()
                || !state.allow_new_trades
            {
                return Ok(());
            }
        }

        self.store.begin_opening()?;
        match self.try_open(signal).await {
            Ok(position) => {
                self.note_info(format!(
                    "opened {} {} qty {} at {} (stop {}, tp1 {}, tp2 {}, {}x)",
                    position.direction,
                    position.symbol,
                    position.quantity,
                    position.entry_price,
                    position.stop_loss,
                    position.take_profit_1,
                    position.take_profit_2,
                    position.leverage,
                ));
                self.store.commit_position(position, Utc::now())?;
                Ok(())
            }
            Err(err) => {
                self.note_warn(format!("{}: entry aborted: {err:#}", signal.symbol));
                self.store.abort_opening();
                Err(err)
            }
        }
    }

    async fn try_open(&mut self, signal: &Signal) -> Result<Position> {
        let cfg = self.store.config().clone();
        let symbol = signal.symbol.as_str();

        // Safety floor before anything touches the exchange.
        let balance = self.exchange.fetch_balance().await?;
        let equity = balance.available;
        if equity < cfg.min_equity {
            return Err(LifecycleError::EquityBelowFloor { equity, floor: cfg.min_equity }.into());
        }

        let entry = signal.price;
        let (stop_price, stop_distance) =
            compute_stop(signal.direction, entry, signal.indicators.atr, &cfg);
        let stop_fraction = stop_distance / entry;

        let leverage = select_leverage(&cfg, signal.advisory.as_ref(), stop_fraction);

        // Leverage/margin/mode setup is idempotent on the venue; "no change
        // needed" style errors must not kill the entry.
        if let Err(err) = self.exchange.set_leverage(symbol, leverage).await {
            warn!(symbol, leverage, error = %err, "set_leverage failed, continuing");
        }
        if let Err(err) = self
            .exchange
            .set_margin_mode(symbol, perp_core::MarginMode::Cross)
            .await
        {
            warn!(symbol, error = %err, "set_margin_mode failed, continuing");
        }
        if let Err(err) = self
            .exchange
            .set_position_mode(perp_core::PositionMode::OneWay)
            .await
        {
            warn!(error = %err, "set_position_mode failed, continuing");
        }

        // Sizing: risk-based notional capped by buying power.
        let risk_amount = equity * cfg.max_risk_percentage / Decimal::ONE_HUNDRED;
        let cap = equity * Decimal::from(leverage);
        let mut notional = (risk_amount / stop_fraction).min(cap);
        let minimum = self.exchange.min_notional(symbol).await?;
        if notional < minimum {
            if minimum <= cap {
                notional = minimum;
            } else {
                return Err(LifecycleError::BelowMinNotional { notional, minimum }.into());
            }
        }

        let precision = self.exchange.lot_precision(symbol).await?;
        let quantity =
            (notional / entry).round_dp_with_strategy(precision, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return Err(LifecycleError::ZeroQuantity.into());
        }

        let ack = self
            .exchange
            .market_order(symbol, signal.direction.entry_side(), quantity)
            .await?;

        // Post-entry confirmation: trust only what the exchange reports.
        let confirmed_quantity = self.confirm_entry(symbol).await?;
        let entry_price = ack.average_price.unwrap_or(entry);

        // Protective stop. If it cannot be placed we are holding an
        // unprotected position: flatten immediately, then report.
        let stop_side = signal.direction.exit_side();
        let stop_ack = match self
            .exchange
            .stop_market_order(symbol, stop_side, confirmed_quantity, stop_price)
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                warn!(symbol, error = %err, "stop placement failed, flattening entry");
                if let Err(close_err) = self
                    .exchange
                    .market_order(symbol, stop_side, confirmed_quantity)
                    .await
                {
                    warn!(symbol, error = %close_err, "emergency flatten also failed");
                }
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let take_profit = |rr: Decimal| match signal.direction {
            Direction::Long => entry_price + stop_distance * rr,
            Direction::Short => entry_price - stop_distance * rr,
        };

        Ok(Position {
            symbol: symbol.to_string(),
            direction: signal.direction,
            entry_price,
            quantity: confirmed_quantity,
            leverage,
            stop_loss: stop_price,
            initial_stop_loss: stop_price,
            take_profit_1: take_profit(cfg.risk.take_profit.tp1_rr),
            take_profit_2: take_profit(cfg.risk.take_profit.tp2_rr),
            open_time: now,
            order_id: ack.order_id,
            stop_order: Some(StopOrderSnapshot {
                order_id: stop_ack.order_id,
                side: stop_side,
                quantity: confirmed_quantity,
                stop_price,
                status: "open".to_string(),
                placed_at: now,
            }),
            last_stop_update: None,
            entry_atr: signal.indicators.atr,
        })
    }

    /// Polls `fetch_positions` until the entry shows up; returns the
    /// exchange-reported size, which overrides the submitted quantity.
    async fn confirm_entry(&self, symbol: &str) -> Result<Decimal> {
        for attempt in 0..CONFIRM_ATTEMPTS {
            match self.exchange.fetch_positions(Some(symbol)).await {
                Ok(positions) => {
                    if let Some(open) = positions
                        .iter()
                        .find(|p| p.symbol == symbol && !p.contracts.is_zero())
                    {
                        return Ok(open.contracts.abs());
                    }
                }
                Err(err) => {
                    warn!(symbol, attempt, error = %err, "confirmation poll failed");
                }
            }
            if attempt + 1 < CONFIRM_ATTEMPTS {
                tokio::time::sleep(std::time::Duration::from_millis(CONFIRM_SPACING_MS)).await;
            }
        }
        Err(LifecycleError::EntryNotConfirmed { attempts: CONFIRM_ATTEMPTS }.into())
    }

    // ==================== Exit ====================

    /// Closes the open position at market and runs the post-close
    /// accounting (history row, daily PnL, loss streak, breaker check).
    ///
    /// # Errors
    /// Returns an error if the closing order cannot be submitted; the
    /// position remains held and the next tick retries.
    pub async fn close_position(&mut self, reason: CloseReason) -> Result<()> {
        let Some(position) = self.store.state().current_position.clone() else {
            return Ok(());
        };
        self.store.begin_closing()?;

        if let Some(stop) = &position.stop_order {
            if let Err(err) = self
                .exchange
                .cancel_order(&stop.order_id, &position.symbol, true)
                .await
            {
                // Already-gone stops are normal here: the compensated-close
                // path covers the case where the stop actually filled.
                if !err.is_order_missing() {
                    warn!(symbol = %position.symbol, error = %err, "stop cancel failed");
                }
            }
        }
        if let Err(err) = self.exchange.cancel_all_orders(&position.symbol).await {
            warn!(symbol = %position.symbol, error = %err, "cancel-all failed");
        }

        let ack = match self
            .exchange
            .market_order(
                &position.symbol,
                position.direction.exit_side(),
                position.quantity,
            )
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                // Still holding; re-enter POSITION and retry next tick.
                let _ = self.store.set_status(EngineStatus::Position);
                return Err(err.into());
            }
        };

        let exit_price = match ack.average_price {
            Some(price) => price,
            None => self
                .exchange
                .fetch_price(&position.symbol)
                .await
                .unwrap_or(position.entry_price),
        };

        self.finalize_trade(&position, exit_price, reason, Utc::now())
            .await
    }

    /// Books a finished trade and evaluates the circuit breaker.
    async fn finalize_trade(
        &mut self,
        position: &Position,
        exit_price: Decimal,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pnl = position.pnl(exit_price);
        let record = TradeRecord {
            id: Uuid::new_v4(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl,
            pnl_percentage: position.pnl_percentage(exit_price),
            open_time: position.open_time,
            close_time: now,
            reason,
        };
        self.store.finalize_close(record)?;
        self.note_info(format!(
            "closed {} {} at {}: pnl {} ({})",
            position.direction, position.symbol, exit_price, pnl, reason
        ));

        let equity = self
            .exchange
            .fetch_balance()
            .await
            .map(|b| b.total)
            .unwrap_or(Decimal::ZERO);
        let verdict = {
            let state = self.store.state();
            perp_risk::check_circuit_breaker(
                state.daily_pnl,
                state.circuit_breaker.consecutive_losses,
                equity,
                &self.store.config().risk.circuit_breaker,
            )
        };
        if verdict.tripped {
            let why = verdict.reason.unwrap_or_else(|| "circuit breaker".to_string());
            self.note_warn(format!("circuit breaker tripped: {why}"));
            self.store.trip_breaker(why, now);
        }

        self.monitor_indicators = None;
        self.last_pnl_log = None;
        Ok(())
    }

    // ==================== Monitor ====================

    /// Per-tick management of the open position. Every step is defensive:
    /// an exchange error logs and returns, and the next tick re-enters.
    pub async fn monitor_position(&mut self) {
        let Some(position) = self.store.state().current_position.clone() else {
            return;
        };
        let now = Utc::now();

        // 1. Consistency: the exchange is the source of truth. A missing
        // position means something closed it behind our back.
        match self.exchange.fetch_positions(Some(&position.symbol)).await {
            Ok(positions) => {
                let live = positions
                    .iter()
                    .any(|p| p.symbol == position.symbol && !p.contracts.is_zero());
                if !live {
                    self.compensated_close(&position, now).await;
                    return;
                }
            }
            Err(err) => {
                warn!(symbol = %position.symbol, error = %err, "position check failed, deferring");
                return;
            }
        }

        // 2. Live PnL.
        let price = match self.current_price(&position.symbol).await {
            Ok(price) => price,
            Err(err) => {
                warn!(symbol = %position.symbol, error = %err, "price unavailable, deferring");
                return;
            }
        };
        let pnl = position.pnl(price);
        let pnl_pct = position.pnl_percentage(price);
        self.store.set_live_metrics(price, pnl, pnl_pct);
        self.log_pnl_throttled(&position.symbol, price, pnl, pnl_pct, now);

        // 3. Refresh 15m indicators when stale or after a sharp move.
        self.refresh_monitor_indicators(&position.symbol, price, now).await;
        let indicators = self.monitor_indicators;

        let cfg = self.store.config().clone();
        let initial_risk = position.initial_risk();
        let adx_prev = self.adx_baseline.get(&position.symbol).copied();
        let adx_now = indicators.map(|i| i.adx_15m);

        // 4. Timeout, only once the trend is actually fading.
        if position.holding_hours(now) >= cfg.position_timeout_hours {
            if let (Some(prev), Some(current)) = (adx_prev, adx_now) {
                if current < prev {
                    self.close_logged(CloseReason::Timeout).await;
                    return;
                }
            }
        }

        // 5. TP2: full profit target, RSI exhaustion, or trend decay.
        let tp2_by_pnl = pnl >= initial_risk * cfg.risk.take_profit.tp2_rr;
        let tp2_by_rsi = indicators.is_some_and(|i| match position.direction {
            Direction::Long => i.rsi >= cfg.risk.take_profit.rsi_extreme_long,
            Direction::Short => i.rsi <= cfg.risk.take_profit.rsi_extreme_short,
        });
        let tp2_by_adx = matches!(
            (adx_prev, adx_now),
            (Some(prev), Some(current)) if prev - current >= cfg.risk.take_profit.adx_decrease_threshold
        );
        if tp2_by_pnl || tp2_by_rsi || tp2_by_adx {
            self.close_logged(CloseReason::Tp2).await;
            return;
        }

        // 6. TP1 takes the whole position.
        // TODO: scale out 50% and move the stop to entry once the adapter
        // exposes partial reduce-only orders.
        if pnl >= initial_risk * cfg.risk.take_profit.tp1_rr {
            self.close_logged(CloseReason::Tp1).await;
            return;
        }

        // 7. Trailing stop.
        if cfg.trailing_stop.enabled {
            self.maybe_trail_stop(&position, price, pnl, initial_risk, now)
                .await;
        }
    }

    async fn close_logged(&mut self, reason: CloseReason) {
        if let Err(err) = self.close_position(reason).await {
            self.note_warn(format!("close ({reason}) failed: {err:#}"));
        }
    }

    async fn refresh_monitor_indicators(
        &mut self,
        symbol: &str,
        price: Decimal,
        now: DateTime<Utc>,
    ) {
        let stale = match &self.monitor_indicators {
            None => true,
            Some(cache) => {
                let aged = (now - cache.computed_at).num_seconds() >= INDICATOR_REFRESH_SECS;
                let moved = !cache.price_at_compute.is_zero()
                    && ((price - cache.price_at_compute).abs() / cache.price_at_compute)
                        > INDICATOR_REFRESH_MOVE_PCT;
                aged || moved
            }
        };
        if !stale {
            return;
        }

        match self
            .exchange
            .fetch_ohlcv(symbol, perp_core::Timeframe::M15, crate::actor::CANDLE_FETCH)
            .await
        {
            Ok(candles) => {
                let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
                let rsi = perp_indicators::rsi(&closes, 14);
                let atr = perp_indicators::atr(&candles, 14);
                let adx = perp_indicators::adx(&candles, 14);
                if let (Some(rsi), Some(atr), Some(adx)) = (rsi, atr, adx) {
                    self.monitor_indicators = Some(MonitorIndicators {
                        computed_at: now,
                        price_at_compute: price,
                        rsi,
                        atr,
                        adx_15m: adx,
                    });
                }
            }
            Err(err) => {
                warn!(symbol, error = %err, "indicator refresh failed, keeping previous values");
            }
        }
    }

    /// Moves the stop behind price once the trade has earned its keep.
    /// Only improvements pass; the store enforces monotonicity again.
    async fn maybe_trail_stop(
        &mut self,
        position: &Position,
        price: Decimal,
        pnl: Decimal,
        initial_risk: Decimal,
        now: DateTime<Utc>,
    ) {
        let cfg = self.store.config().trailing_stop.clone();

        if let Some(last) = position.last_stop_update {
            if (now - last).num_seconds() < cfg.update_interval_secs as i64 {
                return;
            }
        }
        if initial_risk <= Decimal::ZERO {
            return;
        }
        let profit_rr = pnl / initial_risk;
        if profit_rr < cfg.activation_ratio {
            return;
        }

        let atr = self
            .monitor_indicators
            .map_or(position.entry_atr, |i| i.atr);
        let distance = atr * cfg.distance_atr_multiplier;
        let candidate = match position.direction {
            Direction::Long => price - distance,
            Direction::Short => price + distance,
        };
        let improves = match position.direction {
            Direction::Long => candidate > position.stop_loss,
            Direction::Short => candidate < position.stop_loss,
        };
        if !improves {
            return;
        }

        if let Some(stop) = &position.stop_order {
            if let Err(err) = self
                .exchange
                .cancel_order(&stop.order_id, &position.symbol, true)
                .await
            {
                if !err.is_order_missing() {
                    warn!(symbol = %position.symbol, error = %err, "old stop cancel failed, skipping trail");
                    return;
                }
            }
        }

        let side = position.direction.exit_side();
        match self
            .exchange
            .stop_market_order(&position.symbol, side, position.quantity, candidate)
            .await
        {
            Ok(ack) => {
                let snapshot = StopOrderSnapshot {
                    order_id: ack.order_id,
                    side,
                    quantity: position.quantity,
                    stop_price: candidate,
                    status: "open".to_string(),
                    placed_at: now,
                };
                match self.store.update_stop(candidate, snapshot, now) {
                    Ok(()) => {
                        info!(
                            symbol = %position.symbol,
                            stop = %candidate,
                            profit_rr = %profit_rr,
                            "trailing stop advanced"
                        );
                    }
                    Err(err) => {
                        warn!(symbol = %position.symbol, error = %err, "stop update rejected");
                    }
                }
            }
            Err(err) => {
                warn!(symbol = %position.symbol, error = %err, "replacement stop failed; retrying next tick");
            }
        }
    }

    // ==================== Compensated close ====================

    /// The exchange no longer shows our position: reconstruct the exit
    /// from the recorded stop order if possible, otherwise book at market
    /// with an explicit unknown marker.
    pub(crate) async fn compensated_close(&mut self, position: &Position, now: DateTime<Utc>) {
        let (exit_price, reason) = match &position.stop_order {
            Some(stop) => {
                let exit = match self
                    .exchange
                    .fetch_order(&stop.order_id, &position.symbol, true)
                    .await
                {
                    Ok(order) if order.status.is_executed() => order
                        .average
                        .or(order.price)
                        .unwrap_or(position.stop_loss),
                    Ok(_) => {
                        // The stop is still resting, so something else
                        // closed us. Take it down and book at market.
                        if let Err(err) = self
                            .exchange
                            .cancel_order(&stop.order_id, &position.symbol, true)
                            .await
                        {
                            if !err.is_order_missing() {
                                warn!(symbol = %position.symbol, error = %err, "orphan stop cancel failed");
                            }
                        }
                        self.market_or_stop_price(position).await
                    }
                    Err(err) => {
                        if !err.is_order_missing() {
                            warn!(symbol = %position.symbol, error = %err, "stop lookup failed");
                        }
                        self.market_or_stop_price(position).await
                    }
                };
                (exit, CloseReason::StopHitObserved)
            }
            None => (
                self.market_or_stop_price(position).await,
                CloseReason::CompensatedUnknown,
            ),
        };

        self.note_warn(format!(
            "{} position missing on exchange; compensating close at {exit_price} ({reason})",
            position.symbol
        ));
        if let Err(err) = self.finalize_trade(position, exit_price, reason, now).await {
            warn!(symbol = %position.symbol, error = %err, "compensated close bookkeeping failed");
        }
    }

    async fn market_or_stop_price(&self, position: &Position) -> Decimal {
        self.current_price(&position.symbol)
            .await
            .unwrap_or(position.stop_loss)
    }

    fn log_pnl_throttled(
        &mut self,
        symbol: &str,
        price: Decimal,
        pnl: Decimal,
        pnl_pct: Decimal,
        now: DateTime<Utc>,
    ) {
        let emit = match self.last_pnl_log {
            None => true,
            Some((at, last_pct)) => {
                (now - at).num_seconds() >= PNL_LOG_INTERVAL_SECS
                    || (pnl_pct - last_pct).abs() > PNL_LOG_DELTA_PCT
            }
        };
        if emit {
            info!(symbol, price = %price, pnl = %pnl, pnl_pct = %pnl_pct, "position update");
            self.last_pnl_log = Some((now, pnl_pct));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_core::{AdvisoryDirection, RiskLevel};
    use rust_decimal_macros::dec;

    fn opinion(confidence: Decimal, risk: RiskLevel) -> AdvisoryOpinion {
        AdvisoryOpinion {
            direction: AdvisoryDirection::Long,
            confidence,
            score: dec!(70),
            risk_level: risk,
            reasoning: String::new(),
        }
    }

    // ==================== Stop computation ====================

    #[test]
    fn atr_stop_wins_when_tighter_than_percent_cap() {
        let cfg = BotConfig::default(); // 1.5 ATR, 2% cap
        let (stop, distance) = compute_stop(Direction::Long, dec!(50000), dec!(200), &cfg);
        // 1.5 * 200 = 300 vs 50000 * 2% = 1000
        assert_eq!(distance, dec!(300));
        assert_eq!(stop, dec!(49700));
    }

    #[test]
    fn percent_cap_wins_on_wide_atr() {
        let cfg = BotConfig::default();
        let (stop, distance) = compute_stop(Direction::Long, dec!(50000), dec!(1000), &cfg);
        // 1.5 * 1000 = 1500 vs 1000 cap
        assert_eq!(distance, dec!(1000.00));
        assert_eq!(stop, dec!(49000.00));
    }

    #[test]
    fn short_stop_sits_above_entry() {
        let cfg = BotConfig::default();
        let (stop, _) = compute_stop(Direction::Short, dec!(50000), dec!(200), &cfg);
        assert_eq!(stop, dec!(50300));
    }

    // ==================== Leverage selection ====================

    #[test]
    fn static_leverage_without_advisory() {
        let cfg = BotConfig::default();
        assert_eq!(select_leverage(&cfg, None, dec!(0.006)), cfg.leverage);
    }

    #[test]
    fn static_leverage_when_dynamic_disabled() {
        let mut cfg = BotConfig::default();
        cfg.dynamic_leverage.enabled = false;
        let op = opinion(dec!(90), RiskLevel::Low);
        assert_eq!(select_leverage(&cfg, Some(&op), dec!(0.006)), cfg.leverage);
    }

    #[test]
    fn dynamic_leverage_is_capped_by_the_safe_term() {
        let cfg = BotConfig::default(); // base 10, band [3, 20], 1% risk
        let op = opinion(dec!(90), RiskLevel::Low);
        // dynamic = round(10 * (0.8 + 0.9) * 1.2) = round(20.4) = 20
        // safe = round(0.01 / 0.006) = round(1.67) = 2 -> clamped into [3, 20] = 3
        assert_eq!(select_leverage(&cfg, Some(&op), dec!(0.006)), 3);
    }

    #[test]
    fn dynamic_leverage_with_loose_stop_keeps_dynamic_term() {
        let mut cfg = BotConfig::default();
        cfg.max_risk_percentage = dec!(10);
        let op = opinion(dec!(50), RiskLevel::Medium);
        // dynamic = round(10 * (0.8 + 0.5) * 1.0) = 13
        // safe = round(0.10 / 0.01) = 10
        // min(13, 10) = 10, inside [3, 20]
        assert_eq!(select_leverage(&cfg, Some(&op), dec!(0.01)), 10);
    }

    #[test]
    fn high_risk_opinion_drags_leverage_down() {
        let mut cfg = BotConfig::default();
        cfg.max_risk_percentage = dec!(10);
        let op = opinion(dec!(50), RiskLevel::High);
        // dynamic = round(10 * 1.3 * 0.7) = round(9.1) = 9
        assert_eq!(select_leverage(&cfg, Some(&op), dec!(0.01)), 9);
    }
}
