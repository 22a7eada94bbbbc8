//! Exchange gateway abstraction shared by every trader monitor and client mirror.
//!
//! Implementations own their session and rate limiting, so every operation can
//! be invoked concurrently from many tasks without external locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Credentials, PositionSet};

/// Binance error code for a reused `newClientOrderId`.
pub const DUPLICATE_CLIENT_ORDER_ID: i64 = -4116;

/// Errors surfaced by an exchange gateway.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network failure, timeout, or venue-side 5xx
    #[error("transient network error: {0}")]
    Transient(String),

    /// Venue asked us to slow down
    #[error("rate limited by venue")]
    RateLimited,

    /// Venue refused the order (balance, lot size, ...)
    #[error("order rejected ({code}): {message}")]
    OrderRejected { code: i64, message: String },

    /// Bad or revoked API key
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unexpected response shape
    #[error("parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::RateLimited)
    }

    /// Venue refused a reused client order id, so an earlier attempt with the
    /// same id already reached the book.
    pub fn is_duplicate_order(&self) -> bool {
        matches!(self, ExchangeError::OrderRejected { code, .. } if *code == DUPLICATE_CLIENT_ORDER_ID)
    }

    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        ExchangeError::OrderRejected {
            code,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Parse(e.to_string())
        } else {
            ExchangeError::Transient(e.to_string())
        }
    }
}

/// Fresh `newClientOrderId` for one logical order.
pub fn new_client_order_id() -> String {
    format!("cp-{}", uuid::Uuid::new_v4().simple())
}

/// Account whose positions are read.
#[derive(Debug, Clone)]
pub enum Account {
    /// Public leaderboard account, read-only
    Trader { account_id: String },
    /// Client account, authenticated with its own keys
    Client { credentials: Credentials },
}

impl Account {
    pub fn trader(account_id: impl Into<String>) -> Self {
        Account::Trader {
            account_id: account_id.into(),
        }
    }

    pub fn client(credentials: Credentials) -> Self {
        Account::Client { credentials }
    }

    /// Stable key for logging and in-memory books.
    pub fn key(&self) -> &str {
        match self {
            Account::Trader { account_id } => account_id,
            Account::Client { credentials } => &credentials.api_key,
        }
    }
}

/// Venue acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    /// Signed quantity that was submitted
    pub quantity: Decimal,
    pub status: String,
    pub placed_at: DateTime<Utc>,
}

/// Shared, internally synchronized door to the trading venue.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current position snapshot of `account`.
    async fn fetch_positions(&self, account: &Account) -> Result<PositionSet, ExchangeError>;

    /// Submit a market order moving `credentials`' position in `symbol` by `signed_delta`.
    ///
    /// Retries of one order must reuse `client_order_id`; the venue refuses a
    /// second order with the same id.
    async fn place_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        signed_delta: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError>;

    /// Lot step of `symbol`, if the venue knows it.
    fn lot_size(&self, symbol: &str) -> Option<Decimal>;

    /// Venue name, for logs.
    fn name(&self) -> &str;
}
