//! Scripted gateway for engine tests: paper fills plus latency, failure
//! injection and concurrency bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Credentials, PositionSet};

use super::gateway::{Account, ExchangeError, ExchangeGateway, OrderAck};
use super::paper::PaperExchange;

/// One accepted order, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub account: String,
    pub symbol: String,
    pub delta: Decimal,
}

#[derive(Default)]
struct Script {
    order_failures: VecDeque<ExchangeError>,
    lost_acks: VecDeque<ExchangeError>,
    fetch_failures: VecDeque<ExchangeError>,
    orders: Vec<RecordedOrder>,
    in_flight: HashMap<(String, String), usize>,
    max_in_flight: HashMap<(String, String), usize>,
}

pub struct ScriptedExchange {
    paper: PaperExchange,
    latency: Duration,
    script: Mutex<Script>,
    fetch_calls: AtomicUsize,
    order_calls: AtomicUsize,
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self {
            paper: PaperExchange::new(),
            latency: Duration::ZERO,
            script: Mutex::new(Script::default()),
            fetch_calls: AtomicUsize::new(0),
            order_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_lot_size(mut self, symbol: &str, lot: Decimal) -> Self {
        self.paper = self.paper.with_lot_size(symbol, lot);
        self
    }

    /// Delay every order by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_positions(&self, account_key: &str, positions: &[(&str, Decimal)]) {
        let set = positions
            .iter()
            .map(|(s, q)| crate::models::Position::new(*s, *q))
            .collect();
        self.paper.set_positions(account_key, set);
    }

    pub fn positions_of(&self, account_key: &str) -> PositionSet {
        self.paper.positions_of(account_key)
    }

    pub fn fail_next_orders(&self, errors: impl IntoIterator<Item = ExchangeError>) {
        self.script().order_failures.extend(errors);
    }

    /// Fill the next orders on the book but answer them with `errors`, as a
    /// timeout after the venue accepted the request would.
    pub fn lose_next_acks(&self, errors: impl IntoIterator<Item = ExchangeError>) {
        self.script().lost_acks.extend(errors);
    }

    pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = ExchangeError>) {
        self.script().fetch_failures.extend(errors);
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.script().orders.clone()
    }

    pub fn orders_for(&self, account: &str, symbol: &str) -> Vec<Decimal> {
        self.orders()
            .into_iter()
            .filter(|o| o.account == account && o.symbol == symbol)
            .map(|o| o.delta)
            .collect()
    }

    /// Highest number of overlapping submissions seen for (account, symbol).
    pub fn max_in_flight(&self, account: &str, symbol: &str) -> usize {
        self.script()
            .max_in_flight
            .get(&(account.to_string(), symbol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn order_calls(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

#[async_trait]
impl ExchangeGateway for ScriptedExchange {
    async fn fetch_positions(&self, account: &Account) -> Result<PositionSet, ExchangeError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script().fetch_failures.pop_front() {
            return Err(err);
        }
        self.paper.fetch_positions(account).await
    }

    async fn place_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        signed_delta: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        self.order_calls.fetch_add(1, Ordering::SeqCst);
        let key = (credentials.api_key.clone(), symbol.to_string());
        {
            let mut script = self.script();
            let n = {
                let entry = script.in_flight.entry(key.clone()).or_default();
                *entry += 1;
                *entry
            };
            let max = script.max_in_flight.entry(key.clone()).or_default();
            *max = (*max).max(n);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let injected = self.script().order_failures.pop_front();
        let result = match injected {
            Some(err) => Err(err),
            None => {
                self.paper
                    .place_order(credentials, symbol, signed_delta, client_order_id)
                    .await
            }
        };

        let mut script = self.script();
        if let Some(n) = script.in_flight.get_mut(&key) {
            *n -= 1;
        }
        if result.is_err() {
            return result;
        }
        script.orders.push(RecordedOrder {
            account: key.0,
            symbol: key.1,
            delta: signed_delta,
        });
        match script.lost_acks.pop_front() {
            Some(err) => Err(err),
            None => result,
        }
    }

    fn lot_size(&self, symbol: &str) -> Option<Decimal> {
        self.paper.lot_size(symbol)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
