use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use super::{ExchangeClient, ExchangeError};
use crate::models::{
    AccountBalance, Candle, Direction, InstrumentRules, OrderAck, OrderSide, Position,
    PositionPhase,
};

type HmacSha256 = Hmac<Sha256>;

const MARGIN_ASSET: &str = "USDT";

/// Signed REST client for the USD-M futures API.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalance {
    asset: String,
    balance: String,
    available_balance: String,
    cross_un_pnl: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    position_amt: String,
    entry_price: String,
    leverage: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    quantity_precision: u32,
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
}

impl BinanceFuturesClient {
    pub fn new(base_url: impl Into<String>, api_key: String, api_secret: String) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    /// Append a timestamp and HMAC-SHA256 signature to the query string.
    fn sign(&self, mut params: Vec<(String, String)>) -> Result<String, ExchangeError> {
        params.push((
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        ));
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Malformed(format!("query encoding failed: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| ExchangeError::Malformed("invalid api secret".to_string()))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{query}&signature={signature}"))
    }

    async fn signed_get(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<reqwest::Response, ExchangeError> {
        let query = self.sign(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        check_status(response).await
    }

    async fn signed_post(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<reqwest::Response, ExchangeError> {
        let body = self.sign(params)?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Map non-2xx responses to the structured exchange error when the body
/// carries one.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => Err(ExchangeError::Api {
            code: err.code,
            message: err.msg,
        }),
        Err(_) => Err(ExchangeError::Malformed(format!("http {status}: {body}"))),
    }
}

/// Decode one kline row. Rows are heterogeneous JSON arrays:
/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`.
fn parse_kline_row(row: &serde_json::Value, now_ms: i64) -> Option<Candle> {
    let arr = row.as_array()?;

    let open_time_ms = arr.first()?.as_i64()?;
    let close_time_ms = arr.get(6)?.as_i64()?;
    let open = arr.get(1)?.as_str()?.parse().ok()?;
    let high = arr.get(2)?.as_str()?.parse().ok()?;
    let low = arr.get(3)?.as_str()?.parse().ok()?;
    let close = arr.get(4)?.as_str()?.parse().ok()?;
    let volume = arr.get(5)?.as_str()?.parse().ok()?;

    Some(Candle {
        open_time: DateTime::from_timestamp_millis(open_time_ms)?,
        close_time: DateTime::from_timestamp_millis(close_time_ms)?,
        open,
        high,
        low,
        close,
        volume,
        is_closed: close_time_ms <= now_ms,
    })
}

fn format_quantity(qty: f64) -> String {
    let formatted = format!("{qty:.8}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[async_trait::async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let response = check_status(self.http.get(&url).send().await?).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;

        let now_ms = Utc::now().timestamp_millis();
        let candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| parse_kline_row(row, now_ms))
            .collect();

        if candles.len() != rows.len() {
            return Err(ExchangeError::Malformed(
                "kline response contained undecodable rows".to_string(),
            ));
        }
        Ok(candles)
    }

    async fn account_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let response = self.signed_get("/fapi/v2/balance", Vec::new()).await?;
        let balances: Vec<FuturesBalance> = response.json().await?;

        let entry = balances
            .into_iter()
            .find(|b| b.asset == MARGIN_ASSET)
            .ok_or_else(|| {
                ExchangeError::Malformed(format!("no {MARGIN_ASSET} balance in response"))
            })?;

        Ok(AccountBalance {
            available: entry.available_balance.parse().unwrap_or(0.0),
            margin: entry.balance.parse().unwrap_or(0.0),
            unrealized_profit: entry.cross_un_pnl.parse().unwrap_or(0.0),
        })
    }

    async fn current_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let response = self.signed_get("/fapi/v2/positionRisk", params).await?;
        let entries: Vec<PositionRisk> = response.json().await?;

        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let amt: f64 = entry.position_amt.parse().unwrap_or(0.0);
        if amt == 0.0 {
            return Ok(None);
        }

        let direction = if amt > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        Ok(Some(Position {
            phase: PositionPhase::Open,
            direction: Some(direction),
            qty: amt.abs(),
            entry_price: entry.entry_price.parse().unwrap_or(0.0),
            leverage: entry.leverage.parse().unwrap_or(1),
        }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        match self.signed_post("/fapi/v1/leverage", params).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_satisfied() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_position_mode(&self, hedge_enabled: bool) -> Result<(), ExchangeError> {
        let params = vec![(
            "dualSidePosition".to_string(),
            hedge_enabled.to_string(),
        )];
        match self.signed_post("/fapi/v1/positionSide/dual", params).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_satisfied() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let response = check_status(self.http.get(&url).send().await?).await?;
        let info: ExchangeInfo = response.json().await?;

        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| {
                ExchangeError::Malformed(format!("symbol {symbol} not in exchange info"))
            })?;

        let min_qty = symbol_info
            .filters
            .iter()
            .find(|f| f.get("filterType").and_then(|v| v.as_str()) == Some("LOT_SIZE"))
            .and_then(|f| f.get("minQty").and_then(|v| v.as_str()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.001);

        Ok(InstrumentRules {
            quantity_precision: symbol_info.quantity_precision,
            min_qty,
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.as_str().to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), format_quantity(qty)),
            (
                "newClientOrderId".to_string(),
                format!("trendbot-{}", Uuid::new_v4().simple()),
            ),
        ];
        if reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let response = self.signed_post("/fapi/v1/order", params).await?;
        let ack: OrderResponse = response.json().await?;
        Ok(OrderAck {
            order_id: ack.order_id,
        })
    }
}
