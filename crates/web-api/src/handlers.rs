use axum::extract::{Query, State};
use axum::Json;
use perp_engine::EngineHandle;
use serde::{Deserialize, Serialize};

/// Shared response envelope. The transport never errors: failures ride in
/// `success: false` with a message.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { success: true, message: None, data: Some(data) })
    }

    fn ok_message(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self { success: true, message: Some(message.into()), data: Some(data) })
    }

    fn fail(message: impl Into<String>) -> Json<Self> {
        Json(Self { success: false, message: Some(message.into()), data: None })
    }
}

/// `GET /bot/status`. Never 500s: a dead engine or unreachable exchange
/// degrades to a failure envelope or empty balances.
pub async fn status(
    State(engine): State<EngineHandle>,
) -> Json<ApiResponse<perp_engine::StatusReport>> {
    match engine.status().await {
        Ok(report) => ApiResponse::ok(report),
        Err(err) => ApiResponse::fail(format!("engine unavailable: {err:#}")),
    }
}

/// `POST /bot/start`. Idempotent; clears a tripped circuit breaker.
pub async fn start(State(engine): State<EngineHandle>) -> Json<ApiResponse<()>> {
    match engine.start().await {
        Ok(()) => ApiResponse::ok_message("bot started", ()),
        Err(err) => ApiResponse::fail(format!("start failed: {err:#}")),
    }
}

/// `POST /bot/stop`. Idempotent; open positions are left alone.
pub async fn stop(State(engine): State<EngineHandle>) -> Json<ApiResponse<()>> {
    match engine.stop().await {
        Ok(()) => ApiResponse::ok_message("bot stopped", ()),
        Err(err) => ApiResponse::fail(format!("stop failed: {err:#}")),
    }
}

/// `PATCH /bot/config`: deep-merges the partial document and returns the
/// full effective config. Validation failures leave the engine untouched.
pub async fn patch_config(
    State(engine): State<EngineHandle>,
    Json(patch): Json<serde_json::Value>,
) -> Json<ApiResponse<perp_core::BotConfig>> {
    match engine.patch_config(patch).await {
        Ok(Ok(config)) => ApiResponse::ok(config),
        Ok(Err(err)) => ApiResponse::fail(format!("config rejected: {err}")),
        Err(err) => ApiResponse::fail(format!("engine unavailable: {err:#}")),
    }
}

/// `POST /bot/close`: operator-initiated close of the open position.
pub async fn close(State(engine): State<EngineHandle>) -> Json<ApiResponse<()>> {
    match engine.close_position(perp_core::CloseReason::Operator).await {
        Ok(true) => ApiResponse::ok_message("position close requested", ()),
        Ok(false) => ApiResponse::fail("no open position"),
        Err(err) => ApiResponse::fail(format!("engine unavailable: {err:#}")),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size", alias = "pageSize")]
    pub page_size: usize,
}

const fn default_page() -> usize {
    1
}

const fn default_page_size() -> usize {
    20
}

/// `GET /bot/history?page&page_size`: newest first, with aggregates.
pub async fn history(
    State(engine): State<EngineHandle>,
    Query(query): Query<HistoryQuery>,
) -> Json<ApiResponse<perp_store::HistoryPage>> {
    match engine.history(query.page, query.page_size).await {
        Ok(page) => ApiResponse::ok(page),
        Err(err) => ApiResponse::fail(format!("engine unavailable: {err:#}")),
    }
}
