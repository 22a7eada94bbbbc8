//! Client mirror: keeps one client account at the ratio-weighted sum of the
//! positions of the traders it follows.
//!
//! Every delta updates a per-subscription copy of the trader's book and then
//! schedules a correction for the symbol. Corrections for one symbol run one
//! at a time behind a per-symbol lock and always recompute the target from the
//! latest books, so replays and bursts converge on the same final position.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::api::{new_client_order_id, Account, ExchangeError, ExchangeGateway};
use crate::error::CopyError;
use crate::models::{Credentials, PositionSet};

use super::config::EngineConfig;
use super::monitor::{PositionDelta, TraderMonitor};
use super::position_sizer::PositionSizer;
use super::retry::retry_with_policy;

/// Link from a client to one trader.
struct Subscription {
    trader_name: String,
    trader: Weak<TraderMonitor>,
    ratio: Decimal,
}

impl Subscription {
    fn monitor(&self) -> Result<Arc<TraderMonitor>, CopyError> {
        self.trader.upgrade().ok_or_else(|| CopyError::TraderGone {
            trader: self.trader_name.clone(),
        })
    }
}

/// Client-side state of one symbol.
#[derive(Debug, Default)]
struct SymbolBook {
    /// Size believed to be held on the venue
    live: Decimal,
    /// Set after an order failed; the next correction refetches `live`
    stale: bool,
}

type SymbolSlot = Arc<tokio::sync::Mutex<SymbolBook>>;

#[derive(Debug, Default)]
struct MirrorCounters {
    deltas: AtomicU64,
    orders_placed: AtomicU64,
    orders_failed: AtomicU64,
    resyncs: AtomicU64,
}

/// Point-in-time view of one symbol of a client.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolStatus {
    pub symbol: String,
    pub live: Decimal,
    pub target: Decimal,
    pub stale: bool,
}

/// Point-in-time view of a client mirror.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub name: String,
    pub subscriptions: Vec<(String, Decimal)>,
    pub symbols: Vec<SymbolStatus>,
    pub deltas: u64,
    pub orders_placed: u64,
    pub orders_failed: u64,
    pub resyncs: u64,
}

pub struct ClientMirror {
    name: String,
    credentials: Credentials,
    account: Account,
    gateway: Arc<dyn ExchangeGateway>,
    config: EngineConfig,
    sizer: PositionSizer,
    subscriptions: Vec<Subscription>,
    /// Latest known trader book per subscription, same order as `subscriptions`
    trader_books: Mutex<Vec<PositionSet>>,
    symbols: Mutex<HashMap<String, SymbolSlot>>,
    live: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    counters: MirrorCounters,
}

impl ClientMirror {
    /// Build a mirror wired to `subscriptions`. Trading starts with [`start`].
    ///
    /// [`start`]: ClientMirror::start
    pub fn new(
        name: impl Into<String>,
        credentials: Credentials,
        subscriptions: Vec<(Arc<TraderMonitor>, Decimal)>,
        gateway: Arc<dyn ExchangeGateway>,
        config: EngineConfig,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, CopyError> {
        let name = name.into();
        if subscriptions.is_empty() {
            return Err(CopyError::NoSubscriptions(name));
        }

        let mut links = Vec::with_capacity(subscriptions.len());
        for (monitor, ratio) in subscriptions {
            if ratio <= Decimal::ZERO {
                return Err(CopyError::InvalidRatio {
                    client: name,
                    trader: monitor.name().to_string(),
                    ratio,
                });
            }
            links.push(Subscription {
                trader_name: monitor.name().to_string(),
                trader: Arc::downgrade(&monitor),
                ratio,
            });
        }

        let books = vec![PositionSet::new(); links.len()];
        Ok(Arc::new(Self {
            name,
            account: Account::client(credentials.clone()),
            credentials,
            gateway,
            sizer: PositionSizer::new(config.default_lot_size),
            config,
            subscriptions: links,
            trader_books: Mutex::new(books),
            symbols: Mutex::new(HashMap::new()),
            live: AtomicBool::new(false),
            cancel: parent.child_token(),
            tasks: TaskTracker::new(),
            counters: MirrorCounters::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reconciled and not yet destroyed.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Subscribe to every trader, reconcile the account, then follow deltas.
    ///
    /// Receivers are taken before snapshots are read, so no change published
    /// during reconciliation is lost.
    pub async fn start(self: &Arc<Self>) -> Result<(), CopyError> {
        let mut receivers = Vec::with_capacity(self.subscriptions.len());
        for sub in &self.subscriptions {
            receivers.push(sub.monitor()?.subscribe()?);
        }

        self.reconcile().await?;
        if self.cancel.is_cancelled() {
            return Err(CopyError::ShuttingDown);
        }
        self.live.store(true, Ordering::SeqCst);

        for (idx, rx) in receivers.into_iter().enumerate() {
            self.tasks.spawn(Arc::clone(self).listen(idx, rx));
        }

        info!(
            client = %self.name,
            traders = self.subscriptions.len(),
            "Client mirror live"
        );
        Ok(())
    }

    /// Bring the account in line with the current trader snapshots, closing
    /// anything no trader holds.
    async fn reconcile(self: &Arc<Self>) -> Result<(), CopyError> {
        let mut symbols = BTreeSet::new();
        {
            let snapshots = self
                .subscriptions
                .iter()
                .map(|sub| sub.monitor().map(|m| m.snapshot()))
                .collect::<Result<Vec<_>, _>>()?;
            let mut books = self.trader_books();
            for (book, snapshot) in books.iter_mut().zip(snapshots) {
                symbols.extend(snapshot.symbols().map(str::to_string));
                *book = (*snapshot).clone();
            }
        }

        let held = self.fetch_live().await?;
        for (symbol, size) in held.iter() {
            symbols.insert(symbol.to_string());
            let slot = self.slot(symbol);
            let mut book = slot.lock().await;
            book.live = size;
            book.stale = false;
        }

        let placed_before = self.counters.orders_placed.load(Ordering::SeqCst);
        join_all(symbols.iter().map(|symbol| self.correct(symbol))).await;
        let placed = self.counters.orders_placed.load(Ordering::SeqCst) - placed_before;

        info!(
            client = %self.name,
            symbols = symbols.len(),
            held = held.len(),
            orders = placed,
            "Client reconciled"
        );
        Ok(())
    }

    /// Record a trader's new size and schedule a correction for `symbol`.
    ///
    /// Returns `false` when the mirror is not live or does not follow `trader`.
    pub fn on_delta(self: &Arc<Self>, trader: &str, symbol: &str, new_size: Decimal) -> bool {
        if !self.is_live() {
            debug!(client = %self.name, trader = %trader, symbol = %symbol, "Mirror not live, delta ignored");
            return false;
        }

        let matched = {
            let mut books = self.trader_books();
            let mut matched = false;
            for (sub, book) in self.subscriptions.iter().zip(books.iter_mut()) {
                if sub.trader_name == trader {
                    book.set(symbol, new_size);
                    matched = true;
                }
            }
            matched
        };
        if !matched {
            return false;
        }

        self.counters.deltas.fetch_add(1, Ordering::Relaxed);
        self.schedule(symbol.to_string());
        true
    }

    /// Replace subscription `idx`'s book with the trader's snapshot and
    /// correct every symbol that moved.
    fn resync(self: &Arc<Self>, idx: usize) -> Result<usize, CopyError> {
        let snapshot = self.subscriptions[idx].monitor()?.snapshot();
        let changes = {
            let mut books = self.trader_books();
            let changes = books[idx].diff(&snapshot);
            books[idx] = (*snapshot).clone();
            changes
        };

        self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
        let count = changes.len();
        for change in changes {
            self.schedule(change.symbol);
        }
        Ok(count)
    }

    fn schedule(self: &Arc<Self>, symbol: String) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.correct(&symbol).await;
        });
    }

    async fn listen(self: Arc<Self>, idx: usize, mut rx: broadcast::Receiver<PositionDelta>) {
        let trader = self.subscriptions[idx].trader_name.clone();

        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => received,
            };

            match received {
                Ok(delta) => {
                    self.on_delta(&delta.trader, &delta.symbol, delta.new_size);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(client = %self.name, trader = %trader, missed, "Delta stream lagged, resyncing from snapshot");
                    if let Err(e) = self.resync(idx) {
                        warn!(client = %self.name, error = %e, "Resync failed");
                        break;
                    }
                }
                Err(RecvError::Closed) => {
                    info!(client = %self.name, trader = %trader, "Trader stream closed");
                    break;
                }
            }
        }

        debug!(client = %self.name, trader = %trader, "Listener stopped");
    }

    /// Move the live position in `symbol` to its target, if it is at least
    /// one lot away.
    async fn correct(&self, symbol: &str) {
        let slot = self.slot(symbol);
        let mut book = slot.lock().await;

        if self.cancel.is_cancelled() {
            return;
        }

        if book.stale {
            match self.fetch_live().await {
                Ok(held) => {
                    book.live = held.size_of(symbol);
                    book.stale = false;
                }
                Err(e) => {
                    warn!(client = %self.name, symbol = %symbol, error = %e, "Could not refresh live position");
                    return;
                }
            }
        }

        let lot = self.sizer.lot_for(self.gateway.lot_size(symbol));
        let target = self.target_for(symbol, lot);
        let Some(delta) = self.sizer.correction(target, book.live, lot) else {
            debug!(client = %self.name, symbol = %symbol, size = %book.live, "In sync");
            return;
        };

        info!(
            client = %self.name,
            symbol = %symbol,
            live = %book.live,
            target = %target,
            quantity = %delta,
            "Placing corrective order"
        );

        // One id for every attempt, so the venue refuses a repeat of an order
        // whose acknowledgement was lost.
        let client_order_id = new_client_order_id();
        let unconfirmed = AtomicBool::new(false);

        let credentials = &self.credentials;
        let gateway = &*self.gateway;
        let order_id = client_order_id.as_str();
        let flag = &unconfirmed;
        let result = retry_with_policy(&self.config.order_retry, "place order", move || async move {
            let result = gateway.place_order(credentials, symbol, delta, order_id).await;
            if let Err(ExchangeError::Transient(_)) = &result {
                flag.store(true, Ordering::SeqCst);
            }
            result
        })
        .await;
        let unconfirmed = unconfirmed.load(Ordering::SeqCst);

        match result {
            Ok(ack) => {
                book.live += delta;
                // An earlier attempt may still have reached the book.
                book.stale = unconfirmed;
                self.counters.orders_placed.fetch_add(1, Ordering::Relaxed);
                info!(
                    client = %self.name,
                    symbol = %ack.symbol,
                    quantity = %ack.quantity,
                    order_id = %ack.order_id,
                    client_order_id = %ack.client_order_id,
                    status = %ack.status,
                    placed_at = %ack.placed_at,
                    "Order placed"
                );
            }
            Err(e) if unconfirmed && e.is_duplicate_order() => {
                book.stale = true;
                self.counters.orders_placed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    client = %self.name,
                    symbol = %symbol,
                    quantity = %delta,
                    client_order_id = %client_order_id,
                    "Order filled on an unacknowledged attempt, will refetch live position"
                );
            }
            Err(e) => {
                book.stale = true;
                self.counters.orders_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    client = %self.name,
                    symbol = %symbol,
                    quantity = %delta,
                    client_order_id = %client_order_id,
                    error = %e,
                    "Corrective order failed, will resync on next change"
                );
            }
        }
    }

    fn target_for(&self, symbol: &str, lot: Decimal) -> Decimal {
        let books = self.trader_books();
        let contributions = self
            .subscriptions
            .iter()
            .zip(books.iter())
            .map(|(sub, book)| (book.size_of(symbol), sub.ratio));
        self.sizer.aggregate_target(contributions, lot)
    }

    async fn fetch_live(&self) -> Result<PositionSet, ExchangeError> {
        let gateway = &*self.gateway;
        let account = &self.account;
        retry_with_policy(&self.config.fetch_retry, "fetch client positions", move || {
            gateway.fetch_positions(account)
        })
        .await
    }

    /// Stop listening and wait for in-flight corrections to finish.
    pub async fn destroy(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        info!(
            client = %self.name,
            orders_placed = self.counters.orders_placed.load(Ordering::Relaxed),
            orders_failed = self.counters.orders_failed.load(Ordering::Relaxed),
            "Client mirror stopped"
        );
    }

    pub async fn status(&self) -> ClientStatus {
        let slots: Vec<(String, SymbolSlot)> = self
            .symbols()
            .iter()
            .map(|(s, slot)| (s.clone(), Arc::clone(slot)))
            .collect();

        let mut symbols = Vec::with_capacity(slots.len());
        for (symbol, slot) in slots {
            let book = slot.lock().await;
            let lot = self.sizer.lot_for(self.gateway.lot_size(&symbol));
            let target = self.target_for(&symbol, lot);
            if book.live.is_zero() && target.is_zero() && !book.stale {
                continue;
            }
            symbols.push(SymbolStatus {
                symbol,
                live: book.live,
                target,
                stale: book.stale,
            });
        }
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        ClientStatus {
            name: self.name.clone(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|s| (s.trader_name.clone(), s.ratio))
                .collect(),
            symbols,
            deltas: self.counters.deltas.load(Ordering::Relaxed),
            orders_placed: self.counters.orders_placed.load(Ordering::Relaxed),
            orders_failed: self.counters.orders_failed.load(Ordering::Relaxed),
            resyncs: self.counters.resyncs.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, symbol: &str) -> SymbolSlot {
        Arc::clone(self.symbols().entry(symbol.to_string()).or_default())
    }

    fn symbols(&self) -> MutexGuard<'_, HashMap<String, SymbolSlot>> {
        self.symbols.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn trader_books(&self) -> MutexGuard<'_, Vec<PositionSet>> {
        self.trader_books.lock().unwrap_or_else(|p| p.into_inner())
    }
}
