//! In-memory paper venue used for dry runs.
//!
//! Client orders fill instantly against in-memory books. Trader positions are
//! read from an upstream gateway when one is attached, otherwise from the
//! books (seeded with [`PaperExchange::set_positions`]).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::models::{Credentials, PositionSet};

use super::gateway::{Account, ExchangeError, ExchangeGateway, OrderAck, DUPLICATE_CLIENT_ORDER_ID};

/// Simulated venue with instant fills.
pub struct PaperExchange {
    upstream: Option<Arc<dyn ExchangeGateway>>,
    books: Mutex<HashMap<String, PositionSet>>,
    lot_sizes: HashMap<String, Decimal>,
    client_order_ids: Mutex<HashSet<String>>,
    order_seq: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            upstream: None,
            books: Mutex::new(HashMap::new()),
            lot_sizes: HashMap::new(),
            client_order_ids: Mutex::new(HashSet::new()),
            order_seq: AtomicU64::new(1),
        }
    }

    /// Read trader positions and lot sizes from `upstream`.
    pub fn with_upstream(mut self, upstream: Arc<dyn ExchangeGateway>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_lot_size(mut self, symbol: impl Into<String>, lot: Decimal) -> Self {
        self.lot_sizes.insert(symbol.into(), lot);
        self
    }

    /// Replace the book of `account_key` (a trader uid or client api key).
    pub fn set_positions(&self, account_key: &str, positions: PositionSet) {
        self.books().insert(account_key.to_string(), positions);
    }

    /// Current book of `account_key`.
    pub fn positions_of(&self, account_key: &str) -> PositionSet {
        self.books().get(account_key).cloned().unwrap_or_default()
    }

    fn books(&self) -> MutexGuard<'_, HashMap<String, PositionSet>> {
        // A panic while holding the lock cannot leave a book half-written.
        self.books.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn fetch_positions(&self, account: &Account) -> Result<PositionSet, ExchangeError> {
        match (account, &self.upstream) {
            (Account::Trader { .. }, Some(upstream)) => upstream.fetch_positions(account).await,
            _ => Ok(self.positions_of(account.key())),
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
        if let Some(lot) = self.lot_size(symbol) {
            if !(signed_delta % lot).is_zero() {
                return Err(ExchangeError::rejected(
                    -1111,
                    format!("quantity {} is not a multiple of {}", signed_delta, lot),
                ));
            }
        }
        let fresh = self
            .client_order_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(client_order_id.to_string());
        if !fresh {
            return Err(ExchangeError::rejected(
                DUPLICATE_CLIENT_ORDER_ID,
                "ClientOrderId is duplicated.",
            ));
        }

        self.books()
            .entry(credentials.api_key.clone())
            .or_default()
            .apply(symbol, signed_delta);

        let order_id = self.order_seq.fetch_add(1, Ordering::Relaxed);
        info!(
            account = %credentials.api_key,
            symbol = %symbol,
            quantity = %signed_delta,
            order_id,
            "[DRY RUN] Paper order filled"
        );

        Ok(OrderAck {
            order_id: format!("paper-{}", order_id),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            quantity: signed_delta,
            status: "FILLED".to_string(),
            placed_at: Utc::now(),
        })
    }

    fn lot_size(&self, symbol: &str) -> Option<Decimal> {
        self.lot_sizes
            .get(symbol)
            .copied()
            .or_else(|| self.upstream.as_ref().and_then(|u| u.lot_size(symbol)))
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_orders_fill_against_book() {
        let paper = PaperExchange::new().with_lot_size("BTCUSDT", dec!(0.001));
        let creds = Credentials::new("client-1", "secret");

        assert_ok!(paper.place_order(&creds, "BTCUSDT", dec!(0.5), "cp-1").await);
        assert_ok!(paper.place_order(&creds, "BTCUSDT", dec!(-0.2), "cp-2").await);

        let book = paper.fetch_positions(&Account::client(creds)).await.unwrap();
        assert_eq!(book.size_of("BTCUSDT"), dec!(0.3));
    }

    #[tokio::test]
    async fn test_rejects_off_lot_quantity() {
        let paper = PaperExchange::new().with_lot_size("BTCUSDT", dec!(0.001));
        let creds = Credentials::new("client-1", "secret");

        let err = assert_err!(paper.place_order(&creds, "BTCUSDT", dec!(0.0005), "cp-1").await);
        assert!(matches!(err, ExchangeError::OrderRejected { code: -1111, .. }));
        assert!(paper.positions_of("client-1").is_empty());
    }

    #[tokio::test]
    async fn test_reused_client_order_id_is_refused() {
        let paper = PaperExchange::new();
        let creds = Credentials::new("client-1", "secret");

        let ack = assert_ok!(paper.place_order(&creds, "BTCUSDT", dec!(0.5), "cp-1").await);
        assert_eq!(ack.client_order_id, "cp-1");

        let err = assert_err!(paper.place_order(&creds, "BTCUSDT", dec!(0.5), "cp-1").await);
        assert!(err.is_duplicate_order());
        assert_eq!(paper.positions_of("client-1").size_of("BTCUSDT"), dec!(0.5));
    }

    #[tokio::test]
    async fn test_trader_reads_go_upstream() {
        let upstream = Arc::new(PaperExchange::new().with_lot_size("ETHUSDT", dec!(0.01)));
        upstream.set_positions("UID", [Position::new("ETHUSDT", dec!(2))].into_iter().collect());

        let paper = PaperExchange::new().with_upstream(upstream);
        let book = paper.fetch_positions(&Account::trader("UID")).await.unwrap();

        assert_eq!(book.size_of("ETHUSDT"), dec!(2));
        assert_eq!(paper.lot_size("ETHUSDT"), Some(dec!(0.01)));
    }
}
