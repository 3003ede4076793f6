use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use perp_core::{
    BotConfig, BotState, CloseReason, Direction, EngineStatus, Position, StopCause,
    StopOrderSnapshot, TradeRecord,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";
const HISTORY_FILE: &str = "history.json";

/// Errors from the state store. I/O failures during routine persists are
/// absorbed into the dirty flag instead; these surface only for startup
/// problems and rejected mutations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data directory unusable: {0}")]
    DataDir(#[from] std::io::Error),

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
}

/// One page of trade history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub trades: Vec<TradeRecord>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pnl: Decimal,
    pub win_rate: f64,
}

/// Owner of the persisted configuration, runtime state, and trade history.
pub struct StateStore {
    dir: PathBuf,
    config: BotConfig,
    state: BotState,
    history: Vec<TradeRecord>,
    dirty: bool,
}

impl StateStore {
    /// Opens (or initializes) the store under `dir`.
    ///
    /// # Errors
    /// Only an unusable data directory is fatal; unreadable files degrade
    /// to defaults.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let config: BotConfig = load_or_default(&dir.join(CONFIG_FILE));
        let mut state: BotState = load_or_default(&dir.join(STATE_FILE));
        let history = load_history(&dir.join(HISTORY_FILE));

        recompute_aggregates(&mut state, &history);

        let mut store = Self { dir, config, state, history, dirty: false };
        // First boot writes the defaults so the operator has files to edit.
        store.persist_config();
        store.persist_state();
        Ok(store)
    }

    #[must_use]
    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &BotState {
        &self.state
    }

    #[must_use]
    pub fn history(&self) -> &[TradeRecord] {
        &self.history
    }

    /// True when an earlier persist failed twice and the on-disk copy may
    /// be stale.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ==================== Config ====================

    /// Replaces the configuration (already validated by the caller) and
    /// persists it.
    pub fn set_config(&mut self, config: BotConfig) {
        self.config = config;
        self.persist_config();
    }

    // ==================== Status & run flags ====================

    /// Transitions the engine status, enforcing `POSITION <=> held`.
    ///
    /// # Errors
    /// Rejects transitions that would break the position/status
    /// equivalence.
    pub fn set_status(&mut self, status: EngineStatus) -> Result<(), StoreError> {
        let holding = self.state.current_position.is_some();
        if status == EngineStatus::Position && !holding {
            return Err(StoreError::InvalidMutation(
                "status POSITION without a position".into(),
            ));
        }
        if holding && !matches!(status, EngineStatus::Position | EngineStatus::Closing) {
            return Err(StoreError::InvalidMutation(format!(
                "status {status} while a position is held"
            )));
        }
        self.state.status = status;
        self.persist_state();
        Ok(())
    }

    pub fn set_running(&mut self, running: bool, cause: Option<StopCause>) {
        self.state.is_running = running;
        self.state.stop_cause = if running { None } else { cause };
        self.persist_state();
    }

    pub fn set_allow_new_trades(&mut self, allow: bool) {
        self.state.allow_new_trades = allow;
        self.persist_state();
    }

    // ==================== Position lifecycle ====================

    /// Enters the OPENING state.
    ///
    /// # Errors
    /// Rejected while a position is already held.
    pub fn begin_opening(&mut self) -> Result<(), StoreError> {
        if self.state.current_position.is_some() {
            return Err(StoreError::InvalidMutation("already holding a position".into()));
        }
        self.state.status = EngineStatus::Opening;
        self.persist_state();
        Ok(())
    }

    /// Reverts a failed entry attempt to MONITORING, clearing partial state.
    pub fn abort_opening(&mut self) {
        self.state.status = EngineStatus::Monitoring;
        self.state.current_position = None;
        self.state.clear_live_fields();
        self.persist_state();
    }

    /// Commits a confirmed entry: stores the position, bumps the daily
    /// trade counter, stamps the cooldown clock.
    ///
    /// # Errors
    /// Rejected if a position is already held (single-position invariant).
    pub fn commit_position(&mut self, position: Position, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.state.current_position.is_some() {
            return Err(StoreError::InvalidMutation("already holding a position".into()));
        }
        self.state.current_position = Some(position);
        self.state.status = EngineStatus::Position;
        self.state.today_trades += 1;
        self.state.last_trade_time = Some(now);
        self.persist_state();
        Ok(())
    }

    /// Enters the CLOSING state.
    ///
    /// # Errors
    /// Rejected without a position.
    pub fn begin_closing(&mut self) -> Result<(), StoreError> {
        if self.state.current_position.is_none() {
            return Err(StoreError::InvalidMutation("no position to close".into()));
        }
        self.state.status = EngineStatus::Closing;
        self.persist_state();
        Ok(())
    }

    /// Moves the protective stop. The only legal mutation of `stop_loss`,
    /// and only in the profitable direction.
    ///
    /// # Errors
    /// Rejected without a position or when the new stop regresses.
    pub fn update_stop(
        &mut self,
        new_stop: Decimal,
        snapshot: StopOrderSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let position = self
            .state
            .current_position
            .as_mut()
            .ok_or_else(|| StoreError::InvalidMutation("no position for stop update".into()))?;

        let regresses = match position.direction {
            Direction::Long => new_stop < position.stop_loss,
            Direction::Short => new_stop > position.stop_loss,
        };
        if regresses {
            return Err(StoreError::InvalidMutation(format!(
                "stop {new_stop} regresses from {} for {}",
                position.stop_loss, position.direction
            )));
        }

        position.stop_loss = new_stop;
        position.stop_order = Some(snapshot);
        position.last_stop_update = Some(now);
        self.persist_state();
        Ok(())
    }

    /// Updates the live price/PnL fields while holding.
    pub fn set_live_metrics(&mut self, price: Decimal, pnl: Decimal, pnl_pct: Decimal) {
        self.state.current_price = Some(price);
        self.state.current_pnl = Some(pnl);
        self.state.current_pnl_percentage = Some(pnl_pct);
        self.persist_state();
    }

    /// Archives a closed trade: appends the history row, applies daily
    /// PnL and loss-streak bookkeeping, clears the position, and returns
    /// to MONITORING. History and the state that references it are
    /// persisted together.
    ///
    /// # Errors
    /// Rejected without a position.
    pub fn finalize_close(&mut self, record: TradeRecord) -> Result<(), StoreError> {
        if self.state.current_position.is_none() {
            return Err(StoreError::InvalidMutation("no position to finalize".into()));
        }

        self.state.daily_pnl += record.pnl;
        if record.pnl < Decimal::ZERO {
            self.state.circuit_breaker.consecutive_losses += 1;
        } else {
            self.state.circuit_breaker.consecutive_losses = 0;
        }
        self.state.circuit_breaker.daily_loss = self.state.daily_pnl.min(Decimal::ZERO).abs();

        // Compensated closes also arm the cooldown (the exchange traded
        // for us; pacing still applies).
        if matches!(
            record.reason,
            CloseReason::StopHitObserved | CloseReason::CompensatedUnknown
        ) {
            self.state.last_trade_time = Some(record.close_time);
        }

        self.history.push(record);
        recompute_aggregates(&mut self.state, &self.history);

        self.state.current_position = None;
        self.state.clear_live_fields();
        self.state.status = EngineStatus::Monitoring;

        self.persist_history();
        self.persist_state();
        Ok(())
    }

    // ==================== Risk bookkeeping ====================

    /// Latches the circuit breaker and halts the engine.
    pub fn trip_breaker(&mut self, reason: String, now: DateTime<Utc>) {
        self.state.circuit_breaker.is_triggered = true;
        self.state.circuit_breaker.reason = Some(reason);
        self.state.circuit_breaker.triggered_at = Some(now);
        self.state.allow_new_trades = false;
        self.state.is_running = false;
        self.state.stop_cause = Some(StopCause::CircuitBreaker);
        self.state.status = EngineStatus::Halted;
        self.persist_state();
    }

    /// Clears the breaker latch (operator start).
    pub fn clear_breaker(&mut self) {
        self.state.circuit_breaker = Default::default();
        self.persist_state();
    }

    /// Applies the daily reset exactly once per local day. Re-running on
    /// the same date is a no-op; returns whether anything changed.
    pub fn apply_daily_reset(&mut self, today: NaiveDate) -> bool {
        if self.state.last_reset_date == today {
            return false;
        }
        self.state.today_trades = 0;
        self.state.daily_pnl = Decimal::ZERO;
        self.state.circuit_breaker = Default::default();
        self.state.last_reset_date = today;
        self.state.allow_new_trades = true;

        // A stop caused by yesterday's breaker or trade cap does not
        // outlive the day; an operator stop does.
        if !self.state.is_running
            && matches!(
                self.state.stop_cause,
                Some(StopCause::CircuitBreaker | StopCause::TradeCap)
            )
        {
            self.state.is_running = true;
            self.state.stop_cause = None;
            if self.state.status == EngineStatus::Halted {
                self.state.status = EngineStatus::Monitoring;
            }
        }
        self.persist_state();
        true
    }

    // ==================== History queries ====================

    /// Pages through history, newest close first.
    #[must_use]
    pub fn history_page(&self, page: usize, page_size: usize) -> HistoryPage {
        let page_size = page_size.clamp(1, 500);
        let page = page.max(1);
        let mut sorted: Vec<TradeRecord> = self.history.clone();
        sorted.sort_by(|a, b| b.close_time.cmp(&a.close_time));
        let start = (page - 1).saturating_mul(page_size);
        let trades: Vec<TradeRecord> = sorted.into_iter().skip(start).take(page_size).collect();
        HistoryPage {
            trades,
            page,
            page_size,
            total: self.history.len(),
            total_pnl: self.state.total_pnl,
            win_rate: self.state.win_rate,
        }
    }

    // ==================== Persistence ====================

    fn persist_config(&mut self) {
        let path = self.dir.join(CONFIG_FILE);
        self.dirty = !write_atomic_with_retry(&path, &self.config) || self.dirty;
    }

    fn persist_state(&mut self) {
        let path = self.dir.join(STATE_FILE);
        self.dirty = !write_atomic_with_retry(&path, &self.state) || self.dirty;
    }

    fn persist_history(&mut self) {
        let path = self.dir.join(HISTORY_FILE);
        self.dirty = !write_atomic_with_retry(&path, &self.history) || self.dirty;
    }
}

/// Recomputes the aggregate fields from history. Pure with respect to the
/// rows: aggregates are always derivable.
fn recompute_aggregates(state: &mut BotState, history: &[TradeRecord]) {
    state.total_trades = history.len() as u64;
    state.total_pnl = history.iter().map(|t| t.pnl).sum();
    let wins = history.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    state.win_rate = if history.is_empty() {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        {
            wins as f64 / history.len() as f64
        }
    };
}

/// Loads a JSON file, falling back to `Default` on absence or corruption.
fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable file, using defaults");
            T::default()
        }
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "malformed file, using defaults");
                T::default()
            }
        },
    }
}

/// Loads the trade history, salvaging every row that still parses. A
/// corrupt file (or corrupt rows) must never keep the engine from booting.
fn load_history(path: &Path) -> Vec<TradeRecord> {
    let text = match fs::read_to_string(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable history, starting empty");
            return Vec::new();
        }
        Ok(text) => text,
    };
    let rows: Vec<serde_json::Value> = match serde_json::from_str(&text) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed history, starting empty");
            return Vec::new();
        }
    };
    let total = rows.len();
    let parsed: Vec<TradeRecord> = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect();
    if parsed.len() < total {
        warn!(
            path = %path.display(),
            dropped = total - parsed.len(),
            kept = parsed.len(),
            "history rows dropped during load"
        );
    }
    parsed
}

/// Serializes and writes atomically, retrying once. Returns whether the
/// write landed.
fn write_atomic_with_retry<T: Serialize>(path: &Path, value: &T) -> bool {
    for attempt in 0..2 {
        match write_atomic(path, value) {
            Ok(()) => {
                debug!(path = %path.display(), "persisted");
                return true;
            }
            Err(err) => {
                warn!(path = %path.display(), attempt, error = %err, "persist failed");
            }
        }
    }
    false
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}
