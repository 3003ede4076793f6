//! The per-tick decision ladder: daily reset, breaker halt, forced-close
//! window, position monitoring, then opportunity scanning.

use chrono::Utc;
use perp_core::{CloseReason, EngineStatus, StopCause};
use tracing::{debug, info};

use crate::actor::EngineActor;

impl EngineActor {
    /// One scheduler tick. Runs to completion before the next tick can
    /// fire; every early return hands control back to the timer.
    pub async fn tick(&mut self) {
        let now = Utc::now();
        let tz = self.store.config().tz().unwrap_or(chrono_tz::UTC);

        // 1. Calendar rollover.
        if perp_risk::should_reset_daily(self.store.state().last_reset_date, now, tz) {
            let today = perp_risk::local_today(now, tz);
            if self.store.apply_daily_reset(today) {
                self.note_info(format!("daily reset applied for {today}"));
            }
        }

        // 2. A latched breaker halts everything until an operator start.
        if self.store.state().circuit_breaker.is_triggered {
            if self.store.state().status != EngineStatus::Halted {
                self.store
                    .set_running(false, Some(StopCause::CircuitBreaker));
                let _ = self.store.set_status(EngineStatus::Halted);
            }
            info!(
                reason = self.store.state().circuit_breaker.reason.as_deref().unwrap_or("unknown"),
                "skipped: circuit breaker tripped"
            );
            return;
        }

        // 3. End-of-session forced close.
        if self.store.state().current_position.is_some()
            && perp_risk::should_force_liquidate(now, tz, &self.store.config().risk.force_liquidate)
        {
            self.note_info("forced-close window reached".to_string());
            if let Err(err) = self.close_position(CloseReason::ForcedClose).await {
                self.note_warn(format!("forced close failed: {err:#}"));
            }
            return;
        }

        // 4. Holding: manage the position, nothing else.
        if self.store.state().current_position.is_some() {
            self.monitor_position().await;
            return;
        }

        // 5. Flat: gate a new scan.
        if !self.store.state().is_running {
            debug!("skipped: not running");
            return;
        }

        self.refresh_allow_new_trades(now);

        let state = self.store.state();
        let cfg = self.store.config();
        if !perp_risk::within_daily_trade_limit(state.today_trades, cfg.risk.daily_trade_limit) {
            // Nothing left to do today; stop ticking until the reset
            // restores us.
            self.store.set_running(false, Some(StopCause::TradeCap));
            self.note_info("skipped: daily trade cap reached, scheduler parked".to_string());
            return;
        }
        if !perp_risk::cooldown_elapsed(state.last_trade_time, cfg.trade_cooldown_secs, now) {
            debug!("skipped: cooldown active");
            return;
        }
        if !self.store.state().allow_new_trades {
            info!("skipped: new trades disallowed");
            return;
        }

        self.scan_for_opportunity().await;
    }
}
