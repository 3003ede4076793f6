//! Bitget USDT-margined futures adapter: signed REST endpoints mapped to
//! the core's typed contracts, plus the websocket last-trade stream.

mod adapter;
mod client;
mod ws;

pub use adapter::BitgetAdapter;
pub use client::BitgetClient;
pub use ws::BitgetPriceStream;
