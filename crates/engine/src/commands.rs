use chrono::{DateTime, Utc};
use perp_core::{AccountBalance, BotConfig, BotState, CloseReason, ConfigError};
use perp_store::HistoryPage;
use serde::Serialize;
use tokio::sync::oneshot;

/// Commands accepted by the engine actor. Replies travel back over
/// oneshot channels so HTTP handlers never share state with the worker.
#[derive(Debug)]
pub enum EngineCommand {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    PatchConfig(serde_json::Value, oneshot::Sender<Result<BotConfig, ConfigError>>),
    Status(oneshot::Sender<StatusReport>),
    History {
        page: usize,
        page_size: usize,
        reply: oneshot::Sender<HistoryPage>,
    },
    ClosePosition(CloseReason, oneshot::Sender<bool>),
    Shutdown,
}

/// One line of the in-memory log ring surfaced by `GET /bot/status`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Snapshot of the engine for the operator UI.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: BotState,
    pub config: BotConfig,
    pub logs: Vec<LogEntry>,
    /// None when the exchange is unreachable; the status endpoint still
    /// answers.
    pub balances: Option<AccountBalance>,
    /// True when a persist failed and the on-disk state may lag.
    pub state_dirty: bool,
}
