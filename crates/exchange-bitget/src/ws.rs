//! Websocket price stream with a shared last-trade cache.
//!
//! A background task owns the socket: it subscribes to ticker channels,
//! pushes prices into the cache, and reconnects with bounded exponential
//! backoff. Readers only touch the cache, so consumers never block on the
//! network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use perp_core::{CachedPrice, ExchangeError, ExchangeResult, PriceStream};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

enum StreamCommand {
    Subscribe(Vec<String>),
    Disconnect,
}

pub struct BitgetPriceStream {
    ws_url: String,
    cache: Arc<RwLock<HashMap<String, CachedPrice>>>,
    symbols: Arc<RwLock<Vec<String>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<StreamCommand>>>,
}

impl BitgetPriceStream {
    #[must_use]
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url,
            cache: Arc::new(RwLock::new(HashMap::new())),
            symbols: Arc::new(RwLock::new(Vec::new())),
            commands: Mutex::new(None),
        }
    }

    fn instrument(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    fn subscribe_frame(symbols: &[String]) -> Message {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .map(|s| {
                json!({
                    "instType": "USDT-FUTURES",
                    "channel": "ticker",
                    "instId": Self::instrument(s),
                })
            })
            .collect();
        Message::Text(json!({"op": "subscribe", "args": args}).to_string())
    }

    /// Applies one pushed frame to the cache. Returns whether it was a
    /// ticker update.
    fn apply_frame(
        cache: &RwLock<HashMap<String, CachedPrice>>,
        symbols: &RwLock<Vec<String>>,
        text: &str,
    ) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return false;
        };
        let channel = value
            .pointer("/arg/channel")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if channel != "ticker" {
            return false;
        }
        let Some(inst_id) = value.pointer("/arg/instId").and_then(|v| v.as_str()) else {
            return false;
        };
        let Some(price) = value
            .pointer("/data/0/lastPr")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
        else {
            return false;
        };

        // Map the native instrument id back to the configured symbol form.
        let symbol = symbols
            .read()
            .iter()
            .find(|s| Self::instrument(s) == inst_id)
            .cloned()
            .unwrap_or_else(|| inst_id.to_string());
        cache
            .write()
            .insert(symbol, CachedPrice { price, timestamp: Utc::now() });
        true
    }

    async fn run_stream(
        ws_url: String,
        cache: Arc<RwLock<HashMap<String, CachedPrice>>>,
        symbols: Arc<RwLock<Vec<String>>>,
        mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    ) {
        let mut backoff = BACKOFF_INITIAL;
        'reconnect: loop {
            let mut socket = match connect_async(&ws_url).await {
                Ok((socket, _)) => {
                    info!(url = %ws_url, "price stream connected");
                    backoff = BACKOFF_INITIAL;
                    socket
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "price stream connect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };

            let current = symbols.read().clone();
            if !current.is_empty() {
                if let Err(err) = socket.send(Self::subscribe_frame(&current)).await {
                    warn!(error = %err, "subscribe failed, reconnecting");
                    continue;
                }
            }

            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(StreamCommand::Subscribe(new_symbols)) => {
                            if let Err(err) = socket.send(Self::subscribe_frame(&new_symbols)).await {
                                warn!(error = %err, "subscribe failed, reconnecting");
                                continue 'reconnect;
                            }
                        }
                        Some(StreamCommand::Disconnect) | None => {
                            let _ = socket.close(None).await;
                            info!("price stream disconnected");
                            return;
                        }
                    },
                    frame = socket.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if Self::apply_frame(&cache, &symbols, &text) {
                                debug!("ticker applied");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = socket.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("price stream closed by peer, reconnecting");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                            continue 'reconnect;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "price stream read error, reconnecting");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(BACKOFF_MAX);
                            continue 'reconnect;
                        }
                    },
                }
            }
        }
    }
}

#[async_trait]
impl PriceStream for BitgetPriceStream {
    async fn connect(&self) -> ExchangeResult<()> {
        let mut slot = self.commands.lock();
        if slot.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        tokio::spawn(Self::run_stream(
            self.ws_url.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.symbols),
            rx,
        ));
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> ExchangeResult<()> {
        {
            let mut known = self.symbols.write();
            for symbol in symbols {
                if !known.contains(symbol) {
                    known.push(symbol.clone());
                }
            }
        }
        let sender = self.commands.lock().clone();
        if let Some(sender) = sender {
            sender
                .send(StreamCommand::Subscribe(symbols.to_vec()))
                .map_err(|_| ExchangeError::Network("price stream task gone".to_string()))?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(sender) = self.commands.lock().take() {
            let _ = sender.send(StreamCommand::Disconnect);
        }
    }

    fn cached_price(&self, symbol: &str) -> Option<CachedPrice> {
        self.cache.read().get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ticker_frames_update_the_cache() {
        let cache = RwLock::new(HashMap::new());
        let symbols = RwLock::new(vec!["BTC/USDT".to_string()]);
        let frame = r#"{"arg":{"instType":"USDT-FUTURES","channel":"ticker","instId":"BTCUSDT"},"data":[{"lastPr":"50123.5","ts":"1700000000000"}]}"#;

        assert!(BitgetPriceStream::apply_frame(&cache, &symbols, frame));
        let cached = cache.read().get("BTC/USDT").copied().unwrap();
        assert_eq!(cached.price, dec!(50123.5));
    }

    #[test]
    fn non_ticker_frames_are_ignored() {
        let cache = RwLock::new(HashMap::new());
        let symbols = RwLock::new(vec![]);
        assert!(!BitgetPriceStream::apply_frame(&cache, &symbols, r#"{"event":"subscribe"}"#));
        assert!(!BitgetPriceStream::apply_frame(&cache, &symbols, "not json"));
        assert!(cache.read().is_empty());
    }
}
