use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Result};

/// Trading and connection parameters for one symbol session.
///
/// Loaded from environment variables (with `.env` support via `dotenvy` in
/// `main`); every field has a default so a bare environment still yields a
/// runnable configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub symbol: String,
    /// Kline interval in exchange notation, e.g. "1m", "15m", "1h".
    pub interval: String,
    pub leverage: u32,
    /// Fraction of available balance committed per entry.
    pub position_size_fraction: f64,
    /// Minimum |EMA5 - EMA50| at the arc middle point; smaller arcs are noise.
    pub min_ema_diff: f64,
    /// Stop-loss threshold as a positive fraction of margin (0.05 = -5%).
    pub stop_loss: f64,
    /// Take-profit threshold as a positive fraction of margin.
    pub take_profit: f64,
    /// Arc staleness guard: max distance from the crossing reference price.
    pub max_price_diff: f64,
    /// Arc staleness guard: max distance from the window's second extreme.
    pub max_extreme_diff: f64,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub idle_threshold: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub closing_price_window: usize,
    pub ema_history_window: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            leverage: 10,
            position_size_fraction: 0.2,
            min_ema_diff: 2.0,
            stop_loss: 0.05,
            take_profit: 0.10,
            max_price_diff: 50.0,
            max_extreme_diff: 50.0,
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(10),
            idle_threshold: Duration::from_secs(120),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            closing_price_window: 200,
            ema_history_window: 20,
        }
    }
}

impl BotConfig {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            symbol: env_or("SYMBOL", defaults.symbol),
            interval: env_or("INTERVAL", defaults.interval),
            leverage: env_parse("LEVERAGE", defaults.leverage),
            position_size_fraction: env_parse(
                "POSITION_SIZE_FRACTION",
                defaults.position_size_fraction,
            ),
            min_ema_diff: env_parse("MIN_EMA_DIFF", defaults.min_ema_diff),
            stop_loss: env_parse("STOP_LOSS", defaults.stop_loss),
            take_profit: env_parse("TAKE_PROFIT", defaults.take_profit),
            max_price_diff: env_parse("MAX_PRICE_DIFF", defaults.max_price_diff),
            max_extreme_diff: env_parse("MAX_EXTREME_DIFF", defaults.max_extreme_diff),
            ping_interval: secs_env("PING_INTERVAL_SECS", defaults.ping_interval),
            pong_timeout: secs_env("PONG_TIMEOUT_SECS", defaults.pong_timeout),
            idle_threshold: secs_env("IDLE_THRESHOLD_SECS", defaults.idle_threshold),
            base_delay: millis_env("BASE_DELAY_MS", defaults.base_delay),
            max_delay: secs_env("MAX_DELAY_SECS", defaults.max_delay),
            max_reconnect_attempts: env_parse(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            closing_price_window: env_parse("CLOSING_PRICE_WINDOW", defaults.closing_price_window),
            ema_history_window: env_parse("EMA_HISTORY_WINDOW", defaults.ema_history_window),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbol.is_empty(), "symbol must not be empty");
        ensure!(!self.interval.is_empty(), "interval must not be empty");
        ensure!(self.leverage >= 1, "leverage must be at least 1");
        ensure!(
            self.position_size_fraction > 0.0 && self.position_size_fraction <= 1.0,
            "position size fraction must be in (0, 1]"
        );
        ensure!(self.stop_loss > 0.0, "stop loss must be positive");
        ensure!(self.take_profit > 0.0, "take profit must be positive");
        ensure!(
            self.closing_price_window >= 50,
            "closing price window must cover the slow EMA period (50)"
        );
        ensure!(
            self.ema_history_window >= 5,
            "ema history window must cover the arc detection window (5)"
        );
        ensure!(
            self.base_delay <= self.max_delay,
            "base delay must not exceed max delay"
        );
        ensure!(
            !self.pong_timeout.is_zero() && !self.ping_interval.is_zero(),
            "heartbeat intervals must be non-zero"
        );
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn millis_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
