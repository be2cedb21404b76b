pub mod binance;
pub mod telegram;

pub use binance::BinanceFuturesClient;
pub use telegram::{NoopSink, TelegramNotifier};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{AccountBalance, Candle, InstrumentRules, OrderAck, OrderSide, Position};

/// Errors from the exchange REST surface.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The exchange answered with a structured error body.
    #[error("exchange rejected request (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("unexpected exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Responses that merely report the requested state already holds.
    ///
    /// -4046: no need to change margin type; -4059: no need to change
    /// position side. Callers normalize these to success.
    pub fn is_already_satisfied(&self) -> bool {
        matches!(self, ExchangeError::Api { code: -4046 | -4059, .. })
    }
}

/// Signed request/response access to account, instrument and order
/// operations. Object-safe so state machines can be tested against fakes.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Most recent candles for the symbol/interval, oldest first. The final
    /// entry may be the still-forming candle, flagged `is_closed = false`.
    async fn historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn account_balance(&self) -> Result<AccountBalance, ExchangeError>;

    /// Current position snapshot, or `None` when flat.
    async fn current_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Enable or disable hedge (dual-side) position mode.
    async fn set_position_mode(&self, hedge_enabled: bool) -> Result<(), ExchangeError>;

    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;
}

/// Best-effort notification target for trade events. Failures are the
/// caller's to log and swallow; they never become trading failures.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn notify(&self, text: &str) -> anyhow::Result<()>;
}
