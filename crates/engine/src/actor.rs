use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use perp_core::{
    AdvisoryAdapter, BotConfig, ConfigError, EngineStatus, ExchangeAdapter, PriceStream,
    StopCause, Timeframe,
};
use perp_store::StateStore;
use perp_strategy::{MarketSnapshot, Signal};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::commands::{EngineCommand, LogEntry, StatusReport};

/// Candles fetched per timeframe; comfortably above the evaluator minimum.
pub(crate) const CANDLE_FETCH: usize = 120;
/// Streamed prices older than this fall back to REST.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(5);
/// Lines kept for the status endpoint.
const LOG_RING_CAPACITY: usize = 50;

/// Indicator values the monitor recomputes while holding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorIndicators {
    pub computed_at: DateTime<Utc>,
    pub price_at_compute: Decimal,
    pub rsi: Decimal,
    pub atr: Decimal,
    pub adx_15m: Decimal,
}

/// The single logical worker. Owns all mutable state; everything else
/// talks to it through [`EngineCommand`]s. One tick body runs at a time by
/// construction, so the scheduler needs no reentrancy latch.
pub struct EngineActor {
    pub(crate) store: StateStore,
    pub(crate) exchange: Arc<dyn ExchangeAdapter>,
    pub(crate) prices: Arc<dyn PriceStream>,
    pub(crate) advisory: Option<Arc<dyn AdvisoryAdapter>>,
    /// ADX(15m) recorded at the most recent full evaluation per symbol;
    /// the monitor's weakening baseline.
    pub(crate) adx_baseline: HashMap<String, Decimal>,
    pub(crate) monitor_indicators: Option<MonitorIndicators>,
    pub(crate) last_pnl_log: Option<(DateTime<Utc>, Decimal)>,
    recent_logs: VecDeque<LogEntry>,
}

impl EngineActor {
    #[must_use]
    pub fn new(
        store: StateStore,
        exchange: Arc<dyn ExchangeAdapter>,
        prices: Arc<dyn PriceStream>,
        advisory: Option<Arc<dyn AdvisoryAdapter>>,
    ) -> Self {
        Self {
            store,
            exchange,
            prices,
            advisory,
            adx_baseline: HashMap::new(),
            monitor_indicators: None,
            last_pnl_log: None,
            recent_logs: VecDeque::with_capacity(LOG_RING_CAPACITY),
        }
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Runs the actor loop: commands preempt the timer, ticks run to
    /// completion, and config patches land between ticks.
    ///
    /// # Errors
    /// Propagates nothing from trading paths; only a closed command
    /// channel ends the loop.
    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>) -> Result<()> {
        info!("engine actor started");
        loop {
            if self.store.state().is_running {
                let delay = self.tick_interval();
                tokio::select! {
                    maybe_cmd = rx.recv() => {
                        match maybe_cmd {
                            None => break,
                            Some(cmd) => {
                                if self.handle_command(cmd).await.is_break() {
                                    break;
                                }
                            }
                        }
                    }
                    () = tokio::time::sleep(delay) => {
                        self.tick().await;
                    }
                }
            } else {
                match rx.recv().await {
                    None => break,
                    Some(cmd) => {
                        if self.handle_command(cmd).await.is_break() {
                            break;
                        }
                    }
                }
            }
        }
        self.prices.disconnect().await;
        info!("engine actor stopped");
        Ok(())
    }

    pub(crate) fn tick_interval(&self) -> Duration {
        let cfg = self.store.config();
        if self.store.state().current_position.is_some() {
            Duration::from_secs(cfg.position_scan_interval_secs)
        } else {
            Duration::from_secs(cfg.scan_interval_secs)
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand) -> ControlFlow<()> {
        match cmd {
            EngineCommand::Start(reply) => {
                self.start();
                let _ = reply.send(());
            }
            EngineCommand::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            EngineCommand::PatchConfig(patch, reply) => {
                let _ = reply.send(self.apply_patch(&patch));
            }
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.status_report().await);
            }
            EngineCommand::History { page, page_size, reply } => {
                let _ = reply.send(self.store.history_page(page, page_size));
            }
            EngineCommand::ClosePosition(reason, reply) => {
                let had_position = self.store.state().current_position.is_some();
                if had_position {
                    if let Err(err) = self.close_position(reason).await {
                        self.note_warn(format!("operator close failed: {err:#}"));
                    }
                }
                let _ = reply.send(had_position);
            }
            EngineCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Starts (or restarts) the scheduler. Clears a tripped breaker so a
    /// HALTED engine resumes, per the operator contract.
    pub fn start(&mut self) {
        if self.store.state().circuit_breaker.is_triggered {
            self.store.clear_breaker();
            self.note_info("circuit breaker cleared by operator start".to_string());
        }
        self.store.set_running(true, None);
        let target = if self.store.state().current_position.is_some() {
            EngineStatus::Position
        } else {
            EngineStatus::Monitoring
        };
        if let Err(err) = self.store.set_status(target) {
            warn!(error = %err, "status transition rejected on start");
        }
        self.refresh_allow_new_trades(Utc::now());
        self.note_info("engine started".to_string());
    }

    /// Stops scheduling. Leaves any open position untouched.
    pub fn stop(&mut self) {
        self.store.set_running(false, Some(StopCause::Operator));
        self.note_info("engine stopped".to_string());
    }

    /// Validates and applies a config patch. Takes effect from the next
    /// tick; the in-flight tick (if any) already finished because the
    /// actor processes commands between ticks.
    pub fn apply_patch(&mut self, patch: &serde_json::Value) -> Result<BotConfig, ConfigError> {
        let merged = self.store.config().apply_patch(patch)?;
        self.store.set_config(merged.clone());
        self.refresh_allow_new_trades(Utc::now());
        self.note_info("config patched".to_string());
        Ok(merged)
    }

    pub(crate) async fn status_report(&mut self) -> StatusReport {
        let balances = match self.exchange.fetch_balance().await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!(error = %err, "balance unavailable for status");
                None
            }
        };
        StatusReport {
            state: self.store.state().clone(),
            config: self.store.config().clone(),
            logs: self.recent_logs.iter().cloned().collect(),
            balances,
            state_dirty: self.store.is_dirty(),
        }
    }

    /// Recomputes the entry latch from the breaker, daily cap, and
    /// cooldown predicates.
    pub(crate) fn refresh_allow_new_trades(&mut self, now: DateTime<Utc>) {
        let state = self.store.state();
        let cfg = self.store.config();
        let allow = !state.circuit_breaker.is_triggered
            && perp_risk::within_daily_trade_limit(state.today_trades, cfg.risk.daily_trade_limit)
            && perp_risk::cooldown_elapsed(state.last_trade_time, cfg.trade_cooldown_secs, now);
        if allow != state.allow_new_trades {
            self.store.set_allow_new_trades(allow);
        }
    }

    /// Last streamed price if fresh, otherwise REST.
    pub(crate) async fn current_price(&self, symbol: &str) -> perp_core::ExchangeResult<Decimal> {
        if let Some(cached) = self.prices.cached_price(symbol) {
            let age = Utc::now() - cached.timestamp;
            if age.num_milliseconds() >= 0
                && age.num_milliseconds() as u128 <= PRICE_CACHE_TTL.as_millis()
            {
                return Ok(cached.price);
            }
        }
        self.exchange.fetch_price(symbol).await
    }

    /// Scans configured symbols in order and opens on the first full pass.
    pub(crate) async fn scan_for_opportunity(&mut self) {
        let symbols = self.store.config().symbols.clone();
        for symbol in symbols {
            match self.evaluate_symbol(&symbol).await {
                Ok(Some(signal)) => {
                    // Failures are logged (and state reverted) inside
                    // open_position; the next tick rescans.
                    let _ = self.open_position(&signal).await;
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "scan failed, retrying next tick");
                }
            }
        }
    }

    /// Runs the technical evaluation and, when configured, the advisory
    /// gate for one symbol.
    async fn evaluate_symbol(&mut self, symbol: &str) -> Result<Option<Signal>> {
        let price = self.current_price(symbol).await?;
        let candles_15m = self.exchange.fetch_ohlcv(symbol, Timeframe::M15, CANDLE_FETCH).await?;
        let candles_1h = self.exchange.fetch_ohlcv(symbol, Timeframe::H1, CANDLE_FETCH).await?;
        let candles_4h = self.exchange.fetch_ohlcv(symbol, Timeframe::H4, CANDLE_FETCH).await?;

        let snapshot = MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            candles_15m,
            candles_1h,
            candles_4h,
        };

        let cfg = self.store.config();
        let mut signal = match perp_strategy::evaluate(&snapshot, &cfg.indicators) {
            Ok(signal) => signal,
            Err(rejection) => {
                info!(symbol = %symbol, reason = %rejection.reason, detail = %rejection.detail, "signal rejected");
                return Ok(None);
            }
        };

        self.adx_baseline
            .insert(symbol.to_string(), signal.indicators.adx_15m);

        let advisory_cfg = self.store.config().advisory.clone();
        if advisory_cfg.enabled && advisory_cfg.use_for_entry {
            if let Some(advisory) = self.advisory.clone() {
                let brief = perp_core::AdvisorySnapshot {
                    symbol: signal.symbol.clone(),
                    price: signal.price,
                    proposed_direction: signal.direction,
                    ema_20: signal.indicators.ema_20,
                    ema_30: signal.indicators.ema_30,
                    ema_60: signal.indicators.ema_60,
                    rsi: signal.indicators.rsi,
                    atr: signal.indicators.atr,
                    adx_15m: signal.indicators.adx_15m,
                    adx_1h: signal.indicators.adx_1h,
                    adx_4h: signal.indicators.adx_4h,
                };
                let opinion = advisory.analyze(&brief).await;
                let adjusted =
                    perp_strategy::adjust_opinion(&opinion, &signal.indicators, signal.price);
                if let Err(rejection) =
                    perp_strategy::gate_advisory(signal.direction, &adjusted, &advisory_cfg)
                {
                    info!(symbol = %symbol, reason = %rejection.reason, detail = %rejection.detail, "advisory rejected signal");
                    return Ok(None);
                }
                signal.advisory = Some(adjusted);
            }
        }

        Ok(Some(signal))
    }

    // ==================== Log ring ====================

    pub(crate) fn note_info(&mut self, message: String) {
        info!("{message}");
        self.push_log("INFO", message);
    }

    pub(crate) fn note_warn(&mut self, message: String) {
        warn!("{message}");
        self.push_log("WARN", message);
    }

    fn push_log(&mut self, level: &str, message: String) {
        if self.recent_logs.len() == LOG_RING_CAPACITY {
            self.recent_logs.pop_front();
        }
        self.recent_logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message,
        });
    }
}
