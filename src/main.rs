use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trendbot::api::{
    BinanceFuturesClient, ExchangeClient, NoopSink, SignalSink, TelegramNotifier,
};
use trendbot::config::BotConfig;
use trendbot::execution::PositionController;
use trendbot::session::Session;
use trendbot::strategy::SignalEngine;
use trendbot::stream::{ConnectionManager, StreamConfig, WsTransportFactory};

const REST_URL: &str = "https://fapi.binance.com";
const STREAM_URL: &str = "wss://fstream.binance.com/ws";

#[derive(Parser, Debug)]
#[command(name = "trendbot")]
#[command(about = "EMA trend-reversal trading agent for USD-M futures")]
struct Cli {
    /// Trading pair, e.g. BTCUSDT. Overrides the SYMBOL environment variable.
    #[arg(long)]
    symbol: Option<String>,

    /// Kline interval, e.g. 15m. Overrides INTERVAL.
    #[arg(long)]
    interval: Option<String>,

    /// Overrides LEVERAGE.
    #[arg(long)]
    leverage: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BotConfig::from_env()?;
    if let Some(symbol) = cli.symbol {
        config.symbol = symbol.to_uppercase();
    }
    if let Some(interval) = cli.interval {
        config.interval = interval;
    }
    if let Some(leverage) = cli.leverage {
        config.leverage = leverage;
    }
    config.validate()?;

    let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
    let api_secret =
        std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is not set")?;
    let rest_url = std::env::var("REST_URL").unwrap_or_else(|_| REST_URL.to_string());
    let stream_url = std::env::var("STREAM_URL").unwrap_or_else(|_| STREAM_URL.to_string());

    let exchange: Arc<dyn ExchangeClient> =
        Arc::new(BinanceFuturesClient::new(rest_url, api_key, api_secret));
    let sink: Arc<dyn SignalSink> = match (
        std::env::var("TELEGRAM_BOT_TOKEN"),
        std::env::var("TELEGRAM_CHAT_ID"),
    ) {
        (Ok(token), Ok(chat_id)) => {
            info!("📣 telegram notifications enabled");
            Arc::new(TelegramNotifier::new(token, chat_id))
        }
        _ => Arc::new(NoopSink),
    };

    info!(
        "🚀 starting {} {} session at {}x leverage",
        config.symbol, config.interval, config.leverage
    );

    // Account preparation: one-way position mode, target leverage,
    // instrument rules. Already-satisfied responses are normalized by the
    // client, so these are idempotent.
    exchange.set_position_mode(false).await?;
    exchange
        .set_leverage(&config.symbol, config.leverage)
        .await?;
    let rules = exchange.instrument_rules(&config.symbol).await?;
    info!(
        precision = rules.quantity_precision,
        min_qty = rules.min_qty,
        "instrument rules loaded"
    );

    let mut controller =
        PositionController::new(config.clone(), rules, exchange.clone(), sink);
    // A position left behind by a previous run is adopted, not abandoned.
    if let Some(existing) = exchange.current_position(&config.symbol).await? {
        controller.adopt(existing);
    }

    let stream_config = StreamConfig {
        url: stream_url,
        symbol: config.symbol.clone(),
        interval: config.interval.clone(),
        ping_interval: config.ping_interval,
        pong_timeout: config.pong_timeout,
        idle_threshold: config.idle_threshold,
        watchdog_interval: config.idle_threshold / 2,
        base_delay: config.base_delay,
        max_delay: config.max_delay,
        max_reconnect_attempts: config.max_reconnect_attempts,
        backfill_limit: config.closing_price_window as u32,
    };

    let (events_tx, events_rx) = mpsc::channel(256);
    let (manager, handle) = ConnectionManager::new(
        stream_config,
        Arc::new(WsTransportFactory),
        exchange.clone(),
        events_tx,
    );

    let session = Session::new(SignalEngine::new(&config), controller, events_rx);
    let session_task = tokio::spawn(session.run());
    let connection = tokio::spawn(manager.run());

    tokio::select! {
        result = connection => {
            match result {
                Ok(Ok(())) => info!("stream session ended"),
                Ok(Err(e)) => error!("💥 stream connection failed: {e}"),
                Err(e) => error!("connection task panicked: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 shutdown requested, closing stream");
            handle.close().await;
        }
    }

    // The event queue closes once the connection task stops; the session
    // drains what is buffered and exits.
    session_task.await?;
    info!("👋 session closed");
    Ok(())
}
