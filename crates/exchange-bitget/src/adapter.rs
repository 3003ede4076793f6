//! [`ExchangeAdapter`] implementation over the signed REST transport.
//!
//! All exchange-native payloads are parsed and typed here; the engine
//! sees only the core vocabulary.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use perp_core::{
    AccountBalance, Candle, Direction, ExchangeAdapter, ExchangeError, ExchangePosition,
    ExchangeResult, MarginMode, OrderAck, OrderInfo, OrderSide, OrderStatus, PositionMode,
    Timeframe,
};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;

use crate::client::BitgetClient;

const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const DEFAULT_MIN_NOTIONAL: &str = "20";

#[derive(Debug, Clone)]
struct MarketMeta {
    lot_precision: u32,
    min_notional: Decimal,
}

pub struct BitgetAdapter {
    client: BitgetClient,
    markets: RwLock<HashMap<String, MarketMeta>>,
}

impl BitgetAdapter {
    #[must_use]
    pub fn new(client: BitgetClient) -> Self {
        Self {
            client,
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// `BTC/USDT` -> `BTCUSDT` (exchange-native instrument id).
    fn instrument(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    fn granularity(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1H",
            Timeframe::H4 => "4H",
        }
    }

    fn market_meta(&self, symbol: &str) -> MarketMeta {
        self.markets
            .read()
            .get(&Self::instrument(symbol))
            .cloned()
            .unwrap_or(MarketMeta {
                lot_precision: 3,
                min_notional: dec_str(DEFAULT_MIN_NOTIONAL),
            })
    }
}

fn dec_str(text: &str) -> Decimal {
    text.parse().unwrap_or_default()
}

fn field_decimal(value: &serde_json::Value, key: &str) -> Option<Decimal> {
    match value.get(key)? {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn field_str<'v>(value: &'v serde_json::Value, key: &str) -> Option<&'v str> {
    value.get(key).and_then(|v| v.as_str())
}

fn data_array(value: &serde_json::Value) -> ExchangeResult<&Vec<serde_json::Value>> {
    value
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ExchangeError::Other("missing data array".to_string()))
}

fn map_order_status(raw: &str) -> OrderStatus {
    match raw {
        "live" | "new" | "partially_filled" | "not_trigger" | "open" => OrderStatus::Open,
        "filled" | "triggered" | "executed" => OrderStatus::Filled,
        "closed" | "full_fill" => OrderStatus::Closed,
        "canceled" | "cancelled" | "fail_trigger" => OrderStatus::Canceled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Unknown,
    }
}

#[async_trait]
impl ExchangeAdapter for BitgetAdapter {
    async fn load_markets(&self) -> ExchangeResult<()> {
        let query = format!("productType={PRODUCT_TYPE}");
        let response = self.client.get("/api/v2/mix/market/contracts", &query).await?;
        let mut markets = HashMap::new();
        for contract in data_array(&response)? {
            let Some(instrument) = field_str(contract, "symbol") else {
                continue;
            };
            let lot_precision = field_str(contract, "volumePlace")
                .and_then(|p| p.parse().ok())
                .unwrap_or(3);
            let min_notional = field_decimal(contract, "minTradeUSDT")
                .unwrap_or_else(|| dec_str(DEFAULT_MIN_NOTIONAL));
            markets.insert(instrument.to_string(), MarketMeta { lot_precision, min_notional });
        }
        info!(count = markets.len(), "markets loaded");
        *self.markets.write() = markets;
        Ok(())
    }

    async fn fetch_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let query = format!(
            "symbol={}&productType={PRODUCT_TYPE}",
            Self::instrument(symbol)
        );
        let response = self.client.get("/api/v2/mix/market/ticker", &query).await?;
        data_array(&response)?
            .first()
            .and_then(|t| field_decimal(t, "lastPr"))
            .ok_or_else(|| ExchangeError::Other(format!("no ticker for {symbol}")))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let query = format!(
            "symbol={}&productType={PRODUCT_TYPE}&granularity={}&limit={limit}",
            Self::instrument(symbol),
            Self::granularity(timeframe),
        );
        let response = self.client.get("/api/v2/mix/market/candles", &query).await?;
        let mut candles = Vec::new();
        for row in data_array(&response)? {
            let Some(cells) = row.as_array() else { continue };
            if cells.len() < 6 {
                continue;
            }
            let cell = |i: usize| -> Option<Decimal> {
                match &cells[i] {
                    serde_json::Value::String(s) => s.parse().ok(),
                    serde_json::Value::Number(n) => n.to_string().parse().ok(),
                    _ => None,
                }
            };
            let timestamp = match &cells[0] {
                serde_json::Value::String(s) => s.parse().ok(),
                serde_json::Value::Number(n) => n.as_i64(),
                _ => None,
            };
            if let (Some(timestamp), Some(open), Some(high), Some(low), Some(close), Some(volume)) =
                (timestamp, cell(1), cell(2), cell(3), cell(4), cell(5))
            {
                candles.push(Candle { timestamp, open, high, low, close, volume });
            }
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn fetch_balance(&self) -> ExchangeResult<AccountBalance> {
        let query = format!("productType={PRODUCT_TYPE}");
        let response = self.client.get("/api/v2/mix/account/accounts", &query).await?;
        let account = data_array(&response)?
            .iter()
            .find(|a| field_str(a, "marginCoin") == Some(MARGIN_COIN))
            .ok_or_else(|| ExchangeError::Other("no USDT account".to_string()))?;
        Ok(AccountBalance {
            available: field_decimal(account, "available").unwrap_or_default(),
            total: field_decimal(account, "accountEquity").unwrap_or_default(),
        })
    }

    async fn fetch_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangePosition>> {
        let query = format!("productType={PRODUCT_TYPE}&marginCoin={MARGIN_COIN}");
        let response = self.client.get("/api/v2/mix/position/all-position", &query).await?;
        let wanted = symbol.map(Self::instrument);
        let mut positions = Vec::new();
        for raw in data_array(&response)? {
            let Some(instrument) = field_str(raw, "symbol") else { continue };
            if let Some(wanted) = &wanted {
                if instrument != wanted {
                    continue;
                }
            }
            let contracts = field_decimal(raw, "total").unwrap_or_default();
            if contracts.is_zero() {
                continue;
            }
            let side = match field_str(raw, "holdSide") {
                Some("short") => Direction::Short,
                _ => Direction::Long,
            };
            positions.push(ExchangePosition {
                symbol: symbol.map_or_else(|| instrument.to_string(), ToString::to_string),
                side,
                contracts,
                entry_price: field_decimal(raw, "openPriceAvg"),
                unrealized_pnl: field_decimal(raw, "unrealizedPL"),
            });
        }
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = json!({
            "symbol": Self::instrument(symbol),
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
        });
        self.client.post("/api/v2/mix/account/set-leverage", &body).await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> ExchangeResult<()> {
        let mode_name = match mode {
            MarginMode::Cross => "crossed",
            MarginMode::Isolated => "isolated",
        };
        let body = json!({
            "symbol": Self::instrument(symbol),
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "marginMode": mode_name,
        });
        self.client.post("/api/v2/mix/account/set-margin-mode", &body).await?;
        Ok(())
    }

    async fn set_position_mode(&self, mode: PositionMode) -> ExchangeResult<()> {
        let mode_name = match mode {
            PositionMode::OneWay => "one_way_mode",
            PositionMode::Hedge => "hedge_mode",
        };
        let body = json!({
            "productType": PRODUCT_TYPE,
            "posMode": mode_name,
        });
        self.client.post("/api/v2/mix/account/set-position-mode", &body).await?;
        Ok(())
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<OrderAck> {
        let body = json!({
            "symbol": Self::instrument(symbol),
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "marginMode": "crossed",
            "side": side.to_string(),
            "orderType": "market",
            "size": quantity.to_string(),
        });
        let response = self.client.post("/api/v2/mix/order/place-order", &body).await?;
        let order_id = response
            .get("data")
            .and_then(|d| field_str(d, "orderId"))
            .ok_or_else(|| ExchangeError::Other("order ack missing orderId".to_string()))?
            .to_string();

        // Fill details arrive via the order detail endpoint; fetch once so
        // callers get the executed average when it is already available.
        let detail = self.fetch_order(&order_id, symbol, false).await.ok();
        Ok(OrderAck {
            order_id,
            filled_quantity: detail.as_ref().and_then(|d| d.filled),
            average_price: detail.and_then(|d| d.average),
        })
    }

    async fn stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<OrderAck> {
        let body = json!({
            "symbol": Self::instrument(symbol),
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "marginMode": "crossed",
            "planType": "normal_plan",
            "triggerPrice": stop_price.to_string(),
            "triggerType": "mark_price",
            "side": side.to_string(),
            "orderType": "market",
            "size": quantity.to_string(),
            "reduceOnly": "YES",
        });
        let response = self.client.post("/api/v2/mix/order/place-plan-order", &body).await?;
        let order_id = response
            .get("data")
            .and_then(|d| field_str(d, "orderId"))
            .ok_or_else(|| ExchangeError::Other("plan ack missing orderId".to_string()))?
            .to_string();
        Ok(OrderAck {
            order_id,
            filled_quantity: None,
            average_price: None,
        })
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        trigger: bool,
    ) -> ExchangeResult<()> {
        let path = if trigger {
            "/api/v2/mix/order/cancel-plan-order"
        } else {
            "/api/v2/mix/order/cancel-order"
        };
        let body = json!({
            "symbol": Self::instrument(symbol),
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "orderId": order_id,
        });
        self.client.post(path, &body).await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let body = json!({
            "symbol": Self::instrument(symbol),
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
        });
        self.client.post("/api/v2/mix/order/cancel-all-orders", &body).await?;
        Ok(())
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        symbol: &str,
        trigger: bool,
    ) -> ExchangeResult<OrderInfo> {
        let path = if trigger {
            "/api/v2/mix/order/plan-order-detail"
        } else {
            "/api/v2/mix/order/detail"
        };
        let query = format!(
            "symbol={}&productType={PRODUCT_TYPE}&orderId={order_id}",
            Self::instrument(symbol)
        );
        let response = self.client.get(path, &query).await?;
        let detail = response
            .get("data")
            .ok_or_else(|| ExchangeError::order_not_found(order_id))?;
        Ok(OrderInfo {
            order_id: order_id.to_string(),
            status: map_order_status(field_str(detail, "status").unwrap_or("unknown")),
            average: field_decimal(detail, "priceAvg"),
            price: field_decimal(detail, "price"),
            stop_price: field_decimal(detail, "triggerPrice"),
            filled: field_decimal(detail, "baseVolume"),
        })
    }

    async fn lot_precision(&self, symbol: &str) -> ExchangeResult<u32> {
        Ok(self.market_meta(symbol).lot_precision)
    }

    async fn min_notional(&self, symbol: &str) -> ExchangeResult<Decimal> {
        Ok(self.market_meta(symbol).min_notional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_strips_the_slash() {
        assert_eq!(BitgetAdapter::instrument("BTC/USDT"), "BTCUSDT");
        assert_eq!(BitgetAdapter::instrument("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn order_status_mapping_is_total() {
        assert_eq!(map_order_status("live"), OrderStatus::Open);
        assert_eq!(map_order_status("filled"), OrderStatus::Filled);
        assert_eq!(map_order_status("full_fill"), OrderStatus::Closed);
        assert_eq!(map_order_status("canceled"), OrderStatus::Canceled);
        assert_eq!(map_order_status("whatever-new-state"), OrderStatus::Unknown);
    }

    #[test]
    fn decimal_fields_accept_strings_and_numbers() {
        let value = serde_json::json!({"a": "1.5", "b": 2, "c": true});
        assert_eq!(field_decimal(&value, "a"), Some("1.5".parse().unwrap()));
        assert_eq!(field_decimal(&value, "b"), Some("2".parse().unwrap()));
        assert_eq!(field_decimal(&value, "c"), None);
        assert_eq!(field_decimal(&value, "missing"), None);
    }
}
