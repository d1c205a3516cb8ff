use crate::config::BinanceCredentials;
use crate::error::ExchangeError;
use crate::ports::exchange::{Exchange, ExchangePosition, OrderAck, OrderSide, SymbolFilters};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

pub fn sign_query(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::MissingCredentials(format!("invalid api secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_opt_f64(raw: &Option<String>) -> Option<f64> {
    raw.as_deref()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    position_amt: String,
    #[serde(default)]
    entry_price: Option<String>,
    #[serde(default)]
    mark_price: Option<String>,
    #[serde(default)]
    un_realized_profit: Option<String>,
    #[serde(default)]
    leverage: Option<String>,
    #[serde(default)]
    initial_margin: Option<String>,
    #[serde(default)]
    isolated_margin: Option<String>,
    #[serde(default)]
    notional: Option<String>,
}

impl RawPosition {
    fn into_position(self) -> Option<ExchangePosition> {
        let signed_qty = self.position_amt.trim().parse::<f64>().ok()?;
        if signed_qty == 0.0 || !signed_qty.is_finite() {
            return None;
        }
        Some(ExchangePosition {
            entry_price: parse_opt_f64(&self.entry_price).unwrap_or(0.0),
            mark_price: parse_opt_f64(&self.mark_price),
            unrealized_pnl: parse_opt_f64(&self.un_realized_profit),
            leverage: parse_opt_f64(&self.leverage),
            margin: parse_opt_f64(&self.initial_margin),
            isolated_margin: parse_opt_f64(&self.isolated_margin),
            notional: parse_opt_f64(&self.notional),
            symbol: self.symbol,
            signed_qty,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFilter {
    filter_type: String,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    #[serde(default)]
    symbols: Vec<RawSymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderAck {
    order_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

pub struct BinanceFutures {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<BinanceCredentials>,
    recv_window_ms: u64,
    filters: Mutex<HashMap<String, SymbolFilters>>,
}

impl BinanceFutures {
    pub fn new(
        base_url: &str,
        credentials: Option<BinanceCredentials>,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::TransientNetwork(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            filters: Mutex::new(HashMap::new()),
        })
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&encode_query(params));
        }
        self.send(self.http.get(url), path).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::MissingCredentials(path.to_string()))?;
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("recvWindow", self.recv_window_ms.to_string()));
        all.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = encode_query(&all);
        let signature = sign_query(&creds.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        let request = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", creds.api_key.as_str());
        self.send(request, path).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, ExchangeError> {
        let response = request.send().await.map_err(|e| {
            ExchangeError::TransientNetwork(format!("{}: {}", path, e))
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::TransientNetwork(format!("{}: {}", path, e)))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimited(format!("{} {}: {}", path, status, body)));
        }
        if status.is_server_error() {
            return Err(ExchangeError::TransientNetwork(format!(
                "{} {}: {}",
                path, status, body
            )));
        }
        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiError>(&body) {
                Ok(api) => ExchangeError::Rejection {
                    code: api.code,
                    message: api.msg,
                },
                Err(_) => ExchangeError::Rejection {
                    code: i64::from(status.as_u16()),
                    message: body,
                },
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::DataUnavailable(format!("{}: bad payload: {}", path, e)))
    }

    async fn load_filters(&self) -> Result<(), ExchangeError> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let mut parsed = HashMap::new();
        for sym in info.symbols {
            let lot = sym.filters.iter().find(|f| f.filter_type == "LOT_SIZE");
            let Some(lot) = lot else {
                continue;
            };
            let step = lot.step_size.as_deref().and_then(|v| Decimal::from_str(v).ok());
            let min = lot.min_qty.as_deref().and_then(|v| Decimal::from_str(v).ok());
            if let (Some(step_size), Some(min_qty)) = (step, min) {
                parsed.insert(
                    sym.symbol,
                    SymbolFilters {
                        step_size: step_size.normalize(),
                        min_qty: min_qty.normalize(),
                    },
                );
            }
        }
        log::debug!("[EXCHANGE] cached lot filters for {} symbols", parsed.len());
        if let Ok(mut cache) = self.filters.lock() {
            cache.extend(parsed);
        }
        Ok(())
    }

    fn cached_filters(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters
            .lock()
            .ok()
            .and_then(|cache| cache.get(symbol).copied())
    }
}

#[async_trait]
impl Exchange for BinanceFutures {
    async fn list_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let raw: Vec<RawPosition> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;
        Ok(raw.into_iter().filter_map(RawPosition::into_position).collect())
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let index: PremiumIndex = self
            .public_get("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await?;
        index
            .mark_price
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| {
                ExchangeError::DataUnavailable(format!(
                    "no usable mark price for {}: {}",
                    symbol, index.mark_price
                ))
            })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.normalize().to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let ack: RawOrderAck = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        let order_id = match ack.order_id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            side,
            qty,
        })
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(filters) = self.cached_filters(symbol) {
            return Ok(filters);
        }
        self.load_filters().await?;
        self.cached_filters(symbol).ok_or_else(|| {
            ExchangeError::DataUnavailable(format!("no LOT_SIZE filter for {}", symbol))
        })
    }
}
