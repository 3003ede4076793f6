//! Circuit-breaker, cooldown, and session-window predicates.
//!
//! Everything here is a pure function of its arguments so the scheduler can
//! be tested without a clock or an exchange. The engine applies the
//! side effects.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use perp_core::config::{CircuitBreakerConfig, ForceLiquidateConfig};
use rust_decimal::Decimal;

/// Outcome of a circuit-breaker evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerVerdict {
    pub tripped: bool,
    pub reason: Option<String>,
}

impl BreakerVerdict {
    const fn clear() -> Self {
        Self { tripped: false, reason: None }
    }
}

/// Trips when the day's realized loss reaches the configured percentage of
/// equity, or when consecutive losses reach their threshold.
#[must_use]
pub fn check_circuit_breaker(
    daily_pnl: Decimal,
    consecutive_losses: u32,
    equity: Decimal,
    cfg: &CircuitBreakerConfig,
) -> BreakerVerdict {
    if consecutive_losses >= cfg.consecutive_losses_threshold {
        return BreakerVerdict {
            tripped: true,
            reason: Some(format!(
                "{consecutive_losses} consecutive losses (threshold {})",
                cfg.consecutive_losses_threshold
            )),
        };
    }

    if daily_pnl < Decimal::ZERO && equity > Decimal::ZERO {
        let loss_pct = daily_pnl.abs() / equity * Decimal::ONE_HUNDRED;
        if loss_pct >= cfg.daily_loss_threshold_pct {
            return BreakerVerdict {
                tripped: true,
                reason: Some(format!(
                    "daily loss {loss_pct:.2}% of equity (threshold {}%)",
                    cfg.daily_loss_threshold_pct
                )),
            };
        }
    }

    BreakerVerdict::clear()
}

/// True inside the forced-close window: from the configured `hour:minute`
/// to the end of that hour, in the engine timezone.
#[must_use]
pub fn should_force_liquidate(now: DateTime<Utc>, tz: Tz, cfg: &ForceLiquidateConfig) -> bool {
    let local = now.with_timezone(&tz);
    local.hour() == cfg.hour && local.minute() >= cfg.minute
}

/// True when the local calendar day has rolled over since the last reset.
#[must_use]
pub fn should_reset_daily(last_reset: NaiveDate, now: DateTime<Utc>, tz: Tz) -> bool {
    local_today(now, tz) != last_reset
}

/// The current calendar date in the engine timezone.
#[must_use]
pub fn local_today(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let local = now.with_timezone(&tz);
    NaiveDate::from_ymd_opt(local.year(), local.month(), local.day())
        .unwrap_or_else(|| now.date_naive())
}

/// True while today's confirmed entries are below the daily cap.
#[must_use]
pub const fn within_daily_trade_limit(today_trades: u32, daily_trade_limit: u32) -> bool {
    today_trades < daily_trade_limit
}

/// True once `cooldown_secs` have elapsed since the last trade (or when no
/// trade has happened yet).
#[must_use]
pub fn cooldown_elapsed(
    last_trade_time: Option<DateTime<Utc>>,
    cooldown_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    match last_trade_time {
        None => true,
        Some(last) => (now - last).num_milliseconds() >= (cooldown_secs as i64) * 1000,
    }
}
