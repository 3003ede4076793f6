use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use perp_core::{ExchangeAdapter as _, PriceStream as _};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "perp-bot")]
#[command(about = "Intraday USDT-perpetual trading engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine with the operator API
    Run {
        /// Data directory for config/state/history and logs
        #[arg(long, default_value = "./data")]
        data_dir: String,
        /// Operator API bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
        /// Start the scheduler immediately instead of waiting for
        /// POST /bot/start
        #[arg(long)]
        start: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { data_dir, addr, start } => run(&data_dir, &addr, start).await,
    }
}

async fn run(data_dir: &str, addr: &str, autostart: bool) -> anyhow::Result<()> {
    // Console plus one append-only file per local date.
    let file_appender = tracing_appender::rolling::daily(format!("{data_dir}/logs"), "perp-bot.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    // Credentials come from the environment only.
    let api_key = std::env::var("BITGET_API_KEY").context("BITGET_API_KEY not set")?;
    let api_secret = std::env::var("BITGET_API_SECRET").context("BITGET_API_SECRET not set")?;
    let passphrase = std::env::var("BITGET_API_PASSPHRASE").context("BITGET_API_PASSPHRASE not set")?;
    let rest_url = std::env::var("BITGET_API_URL")
        .unwrap_or_else(|_| "https://api.bitget.com".to_string());
    let ws_url = std::env::var("BITGET_WS_URL")
        .unwrap_or_else(|_| "wss://ws.bitget.com/v2/ws/public".to_string());

    let store = perp_store::StateStore::open(data_dir).context("data directory unusable")?;
    let symbols = store.config().symbols.clone();
    let cache_minutes = store.config().advisory.cache_minutes;

    let client = perp_exchange_bitget::BitgetClient::new(rest_url, api_key, api_secret, passphrase)
        .context("exchange client")?;
    let exchange = Arc::new(perp_exchange_bitget::BitgetAdapter::new(client));
    if let Err(err) = exchange.load_markets().await {
        // Market metadata has defaults; a cold exchange should not stop boot.
        tracing::warn!(error = %err, "market metadata unavailable at startup");
    }

    let prices = Arc::new(perp_exchange_bitget::BitgetPriceStream::new(ws_url));
    prices.connect().await.ok();
    prices.subscribe(&symbols).await.ok();

    let advisory: Option<Arc<dyn perp_core::AdvisoryAdapter>> =
        match std::env::var("ADVISORY_BASE_URL") {
            Ok(base_url) => {
                let advisory_key = std::env::var("ADVISORY_API_KEY").unwrap_or_default();
                let client = perp_advisory::HttpAdvisory::new(base_url, advisory_key, cache_minutes)
                    .context("advisory client")?;
                Some(Arc::new(client))
            }
            Err(_) => None,
        };

    let (handle, rx) = perp_engine::EngineHandle::channel(64);
    let actor = perp_engine::EngineActor::new(store, exchange, prices, advisory);
    let actor_task = tokio::spawn(actor.run(rx));

    if autostart {
        handle.start().await?;
    }

    let server = perp_web_api::ApiServer::new(handle.clone());
    let serve_result = server.serve(addr).await;

    handle.shutdown().await.ok();
    actor_task.await.ok();
    serve_result
}
