//! End-to-end scheduler/lifecycle scenarios against scripted adapters.
//!
//! Each test drives the actor tick-by-tick with a deterministic exchange:
//! no network, no timers beyond the paused tokio clock.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;
use perp_core::{
    AccountBalance, BotConfig, BotState, CachedPrice, Candle, CloseReason, Direction,
    EngineStatus, ExchangeAdapter, ExchangePosition, ExchangeResult, MarginMode, OrderAck,
    OrderInfo, OrderSide, OrderStatus, Position, PositionMode, PriceStream, StopCause,
    StopOrderSnapshot, Timeframe,
};
use perp_engine::EngineActor;
use perp_store::StateStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

// =============================================================================
// Scripted exchange
// =============================================================================

#[derive(Default)]
struct ExchangeScript {
    prices: VecDeque<Decimal>,
    current_price: Decimal,
    candles: HashMap<Timeframe, Vec<Candle>>,
    balance: AccountBalance,
    net_contracts: Decimal,
    /// When set, market orders are acknowledged but never show up in
    /// `fetch_positions` (entry-not-confirmed scenario).
    suppress_fills: bool,
    orders: HashMap<String, OrderInfo>,
    market_orders: Vec<(String, OrderSide, Decimal)>,
    stop_orders: Vec<(String, OrderSide, Decimal, Decimal)>,
    canceled: Vec<String>,
    next_stop_id: u32,
}

struct MockExchange {
    script: Mutex<ExchangeScript>,
}

impl MockExchange {
    fn new(script: ExchangeScript) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script) })
    }

    fn market_order_count(&self) -> usize {
        self.script.lock().market_orders.len()
    }

    fn stop_order_count(&self) -> usize {
        self.script.lock().stop_orders.len()
    }

    fn last_market_order(&self) -> Option<(String, OrderSide, Decimal)> {
        self.script.lock().market_orders.last().cloned()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn load_markets(&self) -> ExchangeResult<()> {
        Ok(())
    }

    async fn fetch_price(&self, _symbol: &str) -> ExchangeResult<Decimal> {
        let mut script = self.script.lock();
        if script.prices.len() > 1 {
            let price = script.prices.pop_front().unwrap();
            script.current_price = price;
        } else if let Some(&price) = script.prices.front() {
            script.current_price = price;
        }
        Ok(script.current_price)
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        _limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        Ok(self.script.lock().candles.get(&timeframe).cloned().unwrap_or_default())
    }

    async fn fetch_balance(&self) -> ExchangeResult<AccountBalance> {
        Ok(self.script.lock().balance.clone())
    }

    async fn fetch_positions(
        &self,
        symbol: Option<&str>,
    ) -> ExchangeResult<Vec<ExchangePosition>> {
        let script = self.script.lock();
        if script.net_contracts.is_zero() {
            return Ok(vec![]);
        }
        let side = if script.net_contracts > Decimal::ZERO {
            Direction::Long
        } else {
            Direction::Short
        };
        Ok(vec![ExchangePosition {
            symbol: symbol.unwrap_or("BTC/USDT").to_string(),
            side,
            contracts: script.net_contracts,
            entry_price: None,
            unrealized_pnl: None,
        }])
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: MarginMode) -> ExchangeResult<()> {
        Ok(())
    }

    async fn set_position_mode(&self, _mode: PositionMode) -> ExchangeResult<()> {
        Ok(())
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<OrderAck> {
        let mut script = self.script.lock();
        script.market_orders.push((symbol.to_string(), side, quantity));
        if !script.suppress_fills {
            let signed = match side {
                OrderSide::Buy => quantity,
                OrderSide::Sell => -quantity,
            };
            script.net_contracts += signed;
        }
        let id = format!("mkt-{}", script.market_orders.len());
        Ok(OrderAck {
            order_id: id,
            filled_quantity: Some(quantity),
            average_price: Some(script.current_price),
        })
    }

    async fn stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<OrderAck> {
        let mut script = self.script.lock();
        script.next_stop_id += 1;
        let id = format!("stop-{}", script.next_stop_id);
        script
            .stop_orders
            .push((symbol.to_string(), side, quantity, stop_price));
        Ok(OrderAck {
            order_id: id,
            filled_quantity: None,
            average_price: None,
        })
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _symbol: &str,
        _trigger: bool,
    ) -> ExchangeResult<()> {
        self.script.lock().canceled.push(order_id.to_string());
        Ok(())
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> ExchangeResult<()> {
        Ok(())
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        _symbol: &str,
        _trigger: bool,
    ) -> ExchangeResult<OrderInfo> {
        self.script
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| perp_core::ExchangeError::order_not_found(order_id))
    }

    async fn lot_precision(&self, _symbol: &str) -> ExchangeResult<u32> {
        Ok(3)
    }

    async fn min_notional(&self, _symbol: &str) -> ExchangeResult<Decimal> {
        Ok(dec!(20))
    }
}

struct SilentPrices;

#[async_trait]
impl PriceStream for SilentPrices {
    async fn connect(&self) -> ExchangeResult<()> {
        Ok(())
    }
    async fn subscribe(&self, _symbols: &[String]) -> ExchangeResult<()> {
        Ok(())
    }
    async fn disconnect(&self) {}
    fn cached_price(&self, _symbol: &str) -> Option<CachedPrice> {
        None
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// 15m candles with constant true range 200 (ATR = 200 exactly) climbing
/// 10 per bar into ~49990, so a 50000 print sits just above EMA20.
fn bullish_15m_candles() -> Vec<Candle> {
    let mut candles = Vec::with_capacity(120);
    let mut open = dec!(48800);
    for i in 0i64..120 {
        let close = open + dec!(10);
        candles.push(Candle {
            timestamp: i * 900_000,
            open,
            high: close + dec!(95),
            low: open - dec!(95),
            close,
            volume: dec!(500),
        });
        open = close;
    }
    candles
}

/// Monotonic trend: ADX pins at 100, comfortably past any gate.
fn trending_candles(step: Decimal) -> Vec<Candle> {
    (0..120)
        .map(|i| {
            let base = dec!(40000) + step * Decimal::from(i as u32);
            Candle {
                timestamp: i64::from(i) * 3_600_000,
                open: base,
                high: base + step,
                low: base - step,
                close: base + step / dec!(2),
                volume: dec!(500),
            }
        })
        .collect()
}

/// Dead-flat candles: ADX collapses to zero.
fn flat_candles() -> Vec<Candle> {
    (0..120)
        .map(|i| Candle {
            timestamp: i * 3_600_000,
            open: dec!(40000),
            high: dec!(40010),
            low: dec!(39990),
            close: dec!(40000),
            volume: dec!(500),
        })
        .collect()
}

fn market_candles(bullish: bool) -> HashMap<Timeframe, Vec<Candle>> {
    let mut candles = HashMap::new();
    candles.insert(Timeframe::M15, bullish_15m_candles());
    if bullish {
        candles.insert(Timeframe::H1, trending_candles(dec!(50)));
        candles.insert(Timeframe::H4, trending_candles(dec!(120)));
    } else {
        candles.insert(Timeframe::H1, flat_candles());
        candles.insert(Timeframe::H4, flat_candles());
    }
    candles
}

/// Scenario base config: 10x static leverage, 1% risk, 1.5 ATR stop with a
/// 2% cap, TP1 at 1R. Momentum exits and trailing are parked out of the way
/// so each test exercises exactly one path.
fn base_config() -> BotConfig {
    let mut cfg = BotConfig::default();
    cfg.symbols = vec!["BTC/USDT".to_string()];
    cfg.leverage = 10;
    cfg.dynamic_leverage.enabled = false;
    cfg.max_risk_percentage = dec!(1);
    cfg.stop_loss_atr_multiplier = dec!(1.5);
    cfg.max_stop_loss_percentage = dec!(2);
    cfg.risk.take_profit.tp1_rr = dec!(1);
    cfg.risk.take_profit.tp2_rr = dec!(2);
    cfg.risk.take_profit.rsi_extreme_long = dec!(150);
    cfg.risk.take_profit.rsi_extreme_short = dec!(-1);
    cfg.risk.take_profit.adx_decrease_threshold = dec!(1000);
    cfg.trailing_stop.enabled = false;
    cfg.advisory.enabled = false;
    cfg.indicators.long.ema_deviation_threshold = dec!(0.02);
    cfg.indicators.long.rsi_min = dec!(0);
    cfg.indicators.long.rsi_max = dec!(100);
    cfg.indicators.short.rsi_min = dec!(0);
    cfg.indicators.short.rsi_max = dec!(100);
    // Keep today's wall clock out of the forced-close window.
    cfg.risk.force_liquidate.hour = (Utc::now().hour() + 12) % 24;
    cfg.risk.force_liquidate.minute = 59;
    cfg
}

fn open_store_with(dir: &TempDir, cfg: BotConfig) -> StateStore {
    let mut store = StateStore::open(dir.path()).unwrap();
    store.set_config(cfg);
    store
}

fn held_position(stop_order_id: Option<&str>) -> Position {
    let now = Utc::now();
    Position {
        symbol: "BTC/USDT".to_string(),
        direction: Direction::Long,
        entry_price: dec!(50000),
        quantity: dec!(0.01),
        leverage: 10,
        stop_loss: dec!(49700),
        initial_stop_loss: dec!(49700),
        take_profit_1: dec!(50300),
        take_profit_2: dec!(50600),
        open_time: now,
        order_id: "mkt-0".to_string(),
        stop_order: stop_order_id.map(|id| StopOrderSnapshot {
            order_id: id.to_string(),
            side: OrderSide::Sell,
            quantity: dec!(0.01),
            stop_price: dec!(49700),
            status: "open".to_string(),
            placed_at: now,
        }),
        last_stop_update: None,
        entry_atr: dec!(200),
    }
}

fn actor_with(store: StateStore, exchange: Arc<MockExchange>) -> EngineActor {
    EngineActor::new(store, exchange, Arc::new(SilentPrices), None)
}

// =============================================================================
// Scenario 1: happy long, TP1 exit
// =============================================================================

#[tokio::test]
async fn happy_long_enters_and_exits_at_tp1() {
    let dir = TempDir::new().unwrap();
    let store = open_store_with(&dir, base_config());

    let exchange = MockExchange::new(ExchangeScript {
        prices: VecDeque::from([dec!(50000), dec!(50400), dec!(50600)]),
        current_price: dec!(50000),
        candles: market_candles(true),
        balance: AccountBalance { available: dec!(1000), total: dec!(1000) },
        ..Default::default()
    });

    let mut actor = actor_with(store, exchange.clone());
    actor.start();

    // Tick 1: scan finds the long and opens it.
    actor.tick().await;
    {
        let state = actor.store().state();
        assert_eq!(state.status, EngineStatus::Position);
        let position = state.current_position.as_ref().expect("position open");
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.entry_price, dec!(50000));
        // 1.5 * ATR(200) = 300 beats the 2% (1000) cap.
        assert_eq!(position.stop_loss, dec!(49700));
        assert_eq!(position.initial_stop_loss, dec!(49700));
        assert_eq!(position.take_profit_1, dec!(50300));
        assert_eq!(position.take_profit_2, dec!(50600));
        assert_eq!(position.leverage, 10);
        // notional = min(10 / 0.006, 10_000) = 1666.66..; lot-floored at 3dp.
        assert_eq!(position.quantity, dec!(0.033));
        assert_eq!(state.today_trades, 1);
        assert!(state.last_trade_time.is_some());
    }
    assert_eq!(exchange.stop_order_count(), 1);

    // Tick 2: 50400 >= TP1 (50300); the whole position comes off.
    actor.tick().await;
    {
        let state = actor.store().state();
        assert!(state.current_position.is_none());
        assert_eq!(state.status, EngineStatus::Monitoring);

        let history = actor.store().history();
        assert_eq!(history.len(), 1);
        let trade = &history[0];
        assert_eq!(trade.reason, CloseReason::Tp1);
        assert_eq!(trade.entry_price, dec!(50000));
        assert_eq!(trade.exit_price, dec!(50400));
        assert_eq!(trade.pnl, dec!(400) * dec!(0.033));
        assert_eq!(state.daily_pnl, trade.pnl);
        assert_eq!(state.circuit_breaker.consecutive_losses, 0);
    }
    // Entry + exit market orders, nothing else.
    assert_eq!(exchange.market_order_count(), 2);
    let (_, side, qty) = exchange.last_market_order().unwrap();
    assert_eq!(side, OrderSide::Sell);
    assert_eq!(qty, dec!(0.033));
}

// =============================================================================
// Scenario 2: rejected by the ADX gate
// =============================================================================

#[tokio::test]
async fn weak_adx_rejects_without_touching_state() {
    let dir = TempDir::new().unwrap();
    let store = open_store_with(&dir, base_config());

    let exchange = MockExchange::new(ExchangeScript {
        prices: VecDeque::from([dec!(50000)]),
        current_price: dec!(50000),
        candles: market_candles(false),
        balance: AccountBalance { available: dec!(1000), total: dec!(1000) },
        ..Default::default()
    });

    let mut actor = actor_with(store, exchange.clone());
    actor.start();
    actor.tick().await;

    let state = actor.store().state();
    assert_eq!(state.status, EngineStatus::Monitoring);
    assert!(state.current_position.is_none());
    assert_eq!(state.today_trades, 0);
    assert!(actor.store().history().is_empty());
    assert_eq!(exchange.market_order_count(), 0);
    assert_eq!(exchange.stop_order_count(), 0);
}

// =============================================================================
// Scenario 3: entry never confirmed
// =============================================================================

#[tokio::test(start_paused = true)]
async fn unconfirmed_entry_reverts_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = open_store_with(&dir, base_config());

    let exchange = MockExchange::new(ExchangeScript {
        prices: VecDeque::from([dec!(50000)]),
        current_price: dec!(50000),
        candles: market_candles(true),
        balance: AccountBalance { available: dec!(1000), total: dec!(1000) },
        suppress_fills: true,
        ..Default::default()
    });

    let mut actor = actor_with(store, exchange.clone());
    actor.start();
    actor.tick().await;

    let state = actor.store().state();
    assert_eq!(state.status, EngineStatus::Monitoring);
    assert!(state.current_position.is_none());
    // No trade recorded, no counter bump, no protective stop placed.
    assert_eq!(state.today_trades, 0);
    assert!(actor.store().history().is_empty());
    assert_eq!(exchange.market_order_count(), 1);
    assert_eq!(exchange.stop_order_count(), 0);
}

// =============================================================================
// Scenario 4: compensated close after an out-of-band stop fill
// =============================================================================

#[tokio::test]
async fn out_of_band_stop_fill_is_compensated() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store_with(&dir, base_config());
    store.commit_position(held_position(Some("X")), Utc::now()).unwrap();

    let mut script = ExchangeScript {
        prices: VecDeque::from([dec!(49650)]),
        current_price: dec!(49650),
        candles: market_candles(true),
        balance: AccountBalance { available: dec!(997), total: dec!(997) },
        ..Default::default()
    };
    // The exchange already filled the stop: no live position, order closed.
    script.orders.insert(
        "X".to_string(),
        OrderInfo {
            order_id: "X".to_string(),
            status: OrderStatus::Closed,
            average: Some(dec!(49690)),
            price: Some(dec!(49700)),
            stop_price: Some(dec!(49700)),
            filled: Some(dec!(0.01)),
        },
    );
    let exchange = MockExchange::new(script);

    let mut actor = actor_with(store, exchange.clone());
    actor.start();
    actor.tick().await;

    let state = actor.store().state();
    assert!(state.current_position.is_none());
    assert_eq!(state.status, EngineStatus::Monitoring);
    assert_eq!(state.circuit_breaker.consecutive_losses, 1);

    let history = actor.store().history();
    assert_eq!(history.len(), 1);
    let trade = &history[0];
    assert_eq!(trade.reason, CloseReason::StopHitObserved);
    assert_eq!(trade.exit_price, dec!(49690));
    assert_eq!(trade.pnl, dec!(-310) * dec!(0.01));
    // The compensated close re-arms the cooldown clock.
    assert_eq!(state.last_trade_time, Some(trade.close_time));
    // No closing market order was needed: the exchange already flattened us.
    assert_eq!(exchange.market_order_count(), 0);
}

// =============================================================================
// Scenario 5: circuit breaker on the third consecutive loss
// =============================================================================

#[tokio::test]
async fn third_loss_trips_breaker_and_start_clears_it() {
    let dir = TempDir::new().unwrap();

    // Seed persisted state: two losses already today, position still open.
    let mut seeded = BotState::default();
    seeded.status = EngineStatus::Position;
    seeded.is_running = true;
    seeded.circuit_breaker.consecutive_losses = 2;
    seeded.current_position = Some(held_position(Some("X")));
    seeded.last_reset_date = Utc::now().date_naive();
    std::fs::write(
        dir.path().join("state.json"),
        serde_json::to_string_pretty(&seeded).unwrap(),
    )
    .unwrap();

    let store = open_store_with(&dir, base_config());

    let mut script = ExchangeScript {
        prices: VecDeque::from([dec!(49650)]),
        current_price: dec!(49650),
        candles: market_candles(true),
        balance: AccountBalance { available: dec!(990), total: dec!(990) },
        ..Default::default()
    };
    script.orders.insert(
        "X".to_string(),
        OrderInfo {
            order_id: "X".to_string(),
            status: OrderStatus::Filled,
            average: Some(dec!(49690)),
            price: None,
            stop_price: Some(dec!(49700)),
            filled: Some(dec!(0.01)),
        },
    );
    let exchange = MockExchange::new(script);

    let mut actor = actor_with(store, exchange.clone());
    actor.tick().await;

    {
        let state = actor.store().state();
        assert_eq!(state.circuit_breaker.consecutive_losses, 3);
        assert!(state.circuit_breaker.is_triggered);
        assert_eq!(state.status, EngineStatus::Halted);
        assert!(!state.is_running);
        assert!(!state.allow_new_trades);
    }

    // A further tick is a no-op while halted.
    let orders_before = exchange.market_order_count();
    actor.tick().await;
    assert_eq!(exchange.market_order_count(), orders_before);
    assert_eq!(actor.store().state().status, EngineStatus::Halted);

    // Operator start clears the latch and resumes monitoring.
    actor.start();
    let state = actor.store().state();
    assert!(!state.circuit_breaker.is_triggered);
    assert!(state.is_running);
    assert_eq!(state.status, EngineStatus::Monitoring);
}

// =============================================================================
// Scenario 6: daily rollover restores an auto-stopped engine
// =============================================================================

#[tokio::test]
async fn daily_rollover_restores_trade_capped_engine() {
    let dir = TempDir::new().unwrap();

    let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
    let mut seeded = BotState::default();
    seeded.status = EngineStatus::Monitoring;
    seeded.is_running = false;
    seeded.stop_cause = Some(StopCause::TradeCap);
    seeded.allow_new_trades = false;
    seeded.today_trades = 3;
    seeded.daily_pnl = dec!(-12);
    seeded.last_reset_date = yesterday;
    seeded.last_trade_time = Some(Utc::now() - ChronoDuration::hours(20));
    std::fs::write(
        dir.path().join("state.json"),
        serde_json::to_string_pretty(&seeded).unwrap(),
    )
    .unwrap();

    let store = open_store_with(&dir, base_config());

    // Flat higher timeframes: the post-reset scan runs but rejects.
    let exchange = MockExchange::new(ExchangeScript {
        prices: VecDeque::from([dec!(50000)]),
        current_price: dec!(50000),
        candles: market_candles(false),
        balance: AccountBalance { available: dec!(1000), total: dec!(1000) },
        ..Default::default()
    });

    let mut actor = actor_with(store, exchange.clone());
    actor.tick().await;

    let state = actor.store().state();
    assert_eq!(state.today_trades, 0);
    assert_eq!(state.daily_pnl, dec!(0));
    assert!(state.allow_new_trades);
    assert!(state.is_running, "trade-cap stop must not survive the day");
    assert_eq!(state.last_reset_date, Utc::now().date_naive());
    // The scan ran and was rejected; no orders.
    assert_eq!(exchange.market_order_count(), 0);
}

// =============================================================================
// Trailing stop behavior (P2)
// =============================================================================

#[tokio::test]
async fn trailing_stop_advances_but_never_regresses() {
    let dir = TempDir::new().unwrap();
    let mut cfg = base_config();
    cfg.trailing_stop.enabled = true;
    cfg.trailing_stop.activation_ratio = dec!(0.5);
    cfg.trailing_stop.distance_atr_multiplier = dec!(1);
    cfg.trailing_stop.update_interval_secs = 0;
    // Park the profit targets far away so trailing is the only actor.
    cfg.risk.take_profit.tp1_rr = dec!(50);
    cfg.risk.take_profit.tp2_rr = dec!(100);

    let mut store = open_store_with(&dir, cfg);
    store.commit_position(held_position(Some("X")), Utc::now()).unwrap();

    let mut script = ExchangeScript {
        // First monitor sees 50200 (profit 2 = 0.67R), then a pullback.
        prices: VecDeque::from([dec!(50200), dec!(50050), dec!(50050)]),
        current_price: dec!(50200),
        candles: market_candles(true),
        balance: AccountBalance { available: dec!(1000), total: dec!(1000) },
        ..Default::default()
    };
    script.net_contracts = dec!(0.01);
    let exchange = MockExchange::new(script);

    let mut actor = actor_with(store, exchange.clone());
    actor.start();

    // Monitor at 50200: candidate = 50200 - ATR(200) = 50000 > 49700.
    actor.tick().await;
    let stop_after_first = {
        let state = actor.store().state();
        let position = state.current_position.as_ref().unwrap();
        assert_eq!(position.stop_loss, dec!(50000));
        assert!(position.last_stop_update.is_some());
        position.stop_loss
    };
    assert_eq!(exchange.stop_order_count(), 1);

    // Monitor at 50050: candidate 49850 would regress; stop must hold.
    actor.tick().await;
    let state = actor.store().state();
    let position = state.current_position.as_ref().unwrap();
    assert_eq!(position.stop_loss, stop_after_first);
    assert_eq!(exchange.stop_order_count(), 1, "no replacement order for a worse stop");
}
