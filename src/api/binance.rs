//! Binance USDⓈ-M futures gateway.
//!
//! Reads leaderboard traders through the public `getOtherPosition` endpoint and
//! client accounts through signed `/fapi` calls. All requests pass through one
//! shared [`RateLimiter`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::models::{Credentials, Position, PositionSet};

use super::gateway::{Account, ExchangeError, ExchangeGateway, OrderAck};
use super::rate_limit::{RateLimitConfig, RateLimiter};
use super::types::*;

type HmacSha256 = Hmac<Sha256>;

pub const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
pub const LEADERBOARD_POSITION_URL: &str =
    "https://www.binance.com/bapi/futures/v1/public/future/leaderboard/getOtherPosition";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5000;

/// Binance futures session shared by all monitors and mirrors.
pub struct BinanceGateway {
    http: Client,
    base_url: String,
    leaderboard_url: String,
    master: Credentials,
    limiter: RateLimiter,
    lot_sizes: RwLock<HashMap<String, Decimal>>,
}

impl BinanceGateway {
    /// Open a session against `base_url` and load symbol lot sizes.
    pub async fn connect(master: Credentials, base_url: &str) -> Result<Self> {
        let gateway = Self::new(master, base_url, RateLimitConfig::default())?;
        let symbols = gateway
            .refresh_exchange_info()
            .await
            .context("Failed to load exchange info")?;
        info!(base_url = %gateway.base_url, symbols, "Connected to Binance futures");
        Ok(gateway)
    }

    /// Build a gateway without touching the network.
    pub fn new(master: Credentials, base_url: &str, limits: RateLimitConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            leaderboard_url: LEADERBOARD_POSITION_URL.to_string(),
            master,
            limiter: RateLimiter::new(limits),
            lot_sizes: RwLock::new(HashMap::new()),
        })
    }

    /// Reload LOT_SIZE steps from /fapi/v1/exchangeInfo. Returns the symbol count.
    pub async fn refresh_exchange_info(&self) -> Result<usize, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        debug!(url = %url, "Fetching exchange info");

        let _permit = self.limiter.acquire().await?;
        let response = self.http.get(&url).send().await?;
        let info: ExchangeInfoResponse = Self::parse(response).await?;

        let steps: HashMap<String, Decimal> = info
            .symbols
            .iter()
            .filter_map(|s| s.lot_size().map(|step| (s.symbol.clone(), step)))
            .collect();
        let count = steps.len();

        match self.lot_sizes.write() {
            Ok(mut guard) => *guard = steps,
            Err(poisoned) => *poisoned.into_inner() = steps,
        }
        Ok(count)
    }

    async fn fetch_trader_positions(&self, account_id: &str) -> Result<PositionSet, ExchangeError> {
        debug!(uid = %account_id, "Fetching leaderboard positions");

        let body = LeaderboardPositionRequest {
            encrypted_uid: account_id,
            trade_type: "PERPETUAL",
        };

        let _permit = self.limiter.acquire().await?;
        let response = self
            .http
            .post(&self.leaderboard_url)
            .header("X-MBX-APIKEY", &self.master.api_key)
            .json(&body)
            .send()
            .await?;
        let resp: LeaderboardPositionResponse = Self::parse(response).await?;

        if !resp.success {
            return Err(ExchangeError::Transient(format!(
                "leaderboard request failed: {}",
                resp.message.unwrap_or_default()
            )));
        }

        // A trader who hides positions returns a null list; treat as flat.
        let rows = resp
            .data
            .and_then(|d| d.other_position_ret_list)
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|p| Position::new(p.symbol, p.amount))
            .collect())
    }

    async fn fetch_client_positions(
        &self,
        credentials: &Credentials,
    ) -> Result<PositionSet, ExchangeError> {
        let rows: Vec<PositionRiskResponse> = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", credentials, vec![])
            .await?;

        Ok(rows
            .into_iter()
            .map(|p| Position::new(p.symbol, p.position_amt))
            .collect())
    }

    /// Send a signed request; `params` are sent in the query string.
    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        credentials: &Credentials,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", timestamp_ms().to_string()));

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign(credentials.secret(), &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        debug!(method = %method, path = %path, "Signed request");

        let _permit = self.limiter.acquire().await?;
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;

        Self::parse(response).await
    }

    /// Map a response to a body or a classified [`ExchangeError`].
    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(ExchangeError::from);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

/// Turn a non-2xx response into an [`ExchangeError`].
fn classify_failure(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited;
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ExchangeError::Transient(format!("{} - {}", status, body));
    }

    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(err) if matches!(err.code, -2014 | -2015 | -1022) => ExchangeError::Unauthorized(err.msg),
        // -1021: timestamp outside recvWindow; -1007: backend timeout, order state unknown
        Ok(err) if matches!(err.code, -1021 | -1007) => ExchangeError::Transient(err.msg),
        Ok(err) => ExchangeError::rejected(err.code, err.msg),
        Err(_) if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
            ExchangeError::Unauthorized(format!("{} - {}", status, body))
        }
        Err(_) => ExchangeError::rejected(i64::from(status.as_u16()), body.to_string()),
    }
}

/// HMAC-SHA256 of `query`, hex encoded.
fn sign(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Unauthorized(format!("invalid secret key: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    async fn fetch_positions(&self, account: &Account) -> Result<PositionSet, ExchangeError> {
        match account {
            Account::Trader { account_id } => self.fetch_trader_positions(account_id).await,
            Account::Client { credentials } => self.fetch_client_positions(credentials).await,
        }
    }

    async fn place_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        signed_delta: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        if signed_delta.is_zero() {
            return Err(ExchangeError::rejected(-4003, "quantity is zero"));
        }

        let side = if signed_delta > Decimal::ZERO { "BUY" } else { "SELL" };
        let quantity = signed_delta.abs().normalize();

        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newClientOrderId", client_order_id.to_string()),
        ];

        let resp: NewOrderResponse = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", credentials, params)
            .await?;

        if resp.status == "REJECTED" || resp.status == "EXPIRED" {
            warn!(symbol = %symbol, status = %resp.status, "Order not filled");
            return Err(ExchangeError::rejected(0, format!("order {}", resp.status)));
        }

        debug!(
            symbol = %resp.symbol,
            order_id = resp.order_id,
            orig_qty = %resp.orig_qty,
            "Order acknowledged"
        );

        Ok(OrderAck {
            order_id: resp.order_id.to_string(),
            client_order_id: resp.client_order_id,
            symbol: resp.symbol,
            quantity: signed_delta,
            status: resp.status,
            placed_at: Utc::now(),
        })
    }

    fn lot_size(&self, symbol: &str) -> Option<Decimal> {
        match self.lot_sizes.read() {
            Ok(guard) => guard.get(symbol).copied(),
            Err(poisoned) => poisoned.into_inner().get(symbol).copied(),
        }
    }

    fn name(&self) -> &str {
        "binance-futures"
    }
}
