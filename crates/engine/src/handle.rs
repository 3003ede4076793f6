use anyhow::Result;
use perp_core::{BotConfig, CloseReason, ConfigError};
use perp_store::HistoryPage;
use tokio::sync::{mpsc, oneshot};

use crate::commands::{EngineCommand, StatusReport};

/// Clonable handle to the engine actor. The HTTP layer owns one of these
/// and nothing else; all engine access funnels through the command channel.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    /// Creates a command channel pair for the actor and its handle.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Starts the scheduler, clearing a tripped circuit breaker. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Start(tx)).await?;
        rx.await?;
        Ok(())
    }

    /// Stops the scheduler without touching an open position. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Stop(tx)).await?;
        rx.await?;
        Ok(())
    }

    /// Deep-merges a partial config document; applied at the next tick
    /// boundary. Returns the full effective config.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone; the inner result
    /// carries validation failures.
    pub async fn patch_config(
        &self,
        patch: serde_json::Value,
    ) -> Result<Result<BotConfig, ConfigError>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(EngineCommand::PatchConfig(patch, tx)).await?;
        Ok(rx.await?)
    }

    /// Fetches the status snapshot.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone.
    pub async fn status(&self) -> Result<StatusReport> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Status(tx)).await?;
        Ok(rx.await?)
    }

    /// Pages through trade history, newest first.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone.
    pub async fn history(&self, page: usize, page_size: usize) -> Result<HistoryPage> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::History { page, page_size, reply: tx })
            .await?;
        Ok(rx.await?)
    }

    /// Requests an operator close of the open position. Returns whether a
    /// close was initiated.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone.
    pub async fn close_position(&self, reason: CloseReason) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(EngineCommand::ClosePosition(reason, tx)).await?;
        Ok(rx.await?)
    }

    /// Shuts the actor down after the in-flight tick completes.
    ///
    /// # Errors
    /// Returns an error if the engine actor is gone.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(EngineCommand::Shutdown).await?;
        Ok(())
    }
}
