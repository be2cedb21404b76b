pub mod connection;
pub mod transport;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionPhase, StreamConfig};
pub use transport::{StreamTransport, TransportEvent, TransportFactory, WsTransportFactory};

use chrono::DateTime;
use serde::Deserialize;
use thiserror::Error;

use crate::models::Candle;

/// Errors from the streaming-connection layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Terminal: the reconnect budget is spent and the session cannot
    /// self-heal further.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectsExhausted { attempts: u32 },
}

/// Decoded market event forwarded to the session's ordered queue.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Candle(Candle),
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Decode one stream frame into a market event.
///
/// Handles both bare (`/ws`) and combined (`/stream`, `{"stream":..,
/// "data":..}`) payload shapes. Returns `None` for subscribe acks, unknown
/// event types and frames that fail to decode; the connection layer skips
/// those rather than dying.
pub fn decode_frame(payload: &str) -> Option<MarketEvent> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let data = value.get("data").unwrap_or(&value);

    if data.get("e")?.as_str()? != "kline" {
        return None;
    }
    let kline: KlinePayload = serde_json::from_value(data.get("k")?.clone()).ok()?;

    Some(MarketEvent::Candle(Candle {
        open_time: DateTime::from_timestamp_millis(kline.open_time)?,
        close_time: DateTime::from_timestamp_millis(kline.close_time)?,
        open: kline.open.parse().ok()?,
        high: kline.high.parse().ok()?,
        low: kline.low.parse().ok()?,
        close: kline.close.parse().ok()?,
        volume: kline.volume.parse().ok()?,
        is_closed: kline.is_closed,
    }))
}
