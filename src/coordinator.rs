//! Coordinator: owns the registry of trader monitors and client mirrors and
//! sequences their startup and shutdown.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::api::{BinanceGateway, ExchangeGateway, PaperExchange};
use crate::error::CopyError;
use crate::models::{Credentials, SubscriptionSpec, TraderProfile};
use crate::trading::{ClientMirror, ClientStatus, EngineConfig, TraderMonitor};

/// Open the venue session shared by every monitor and mirror.
///
/// With `dry_run`, trader positions still come from the venue but client
/// orders fill against an in-memory paper book.
pub async fn initialize_exchange(
    master: Credentials,
    base_url: &str,
    dry_run: bool,
) -> Result<Arc<dyn ExchangeGateway>> {
    let live = BinanceGateway::connect(master, base_url)
        .await
        .with_context(|| format!("failed to connect to {}", base_url))?;
    let live: Arc<dyn ExchangeGateway> = Arc::new(live);

    if dry_run {
        warn!("[DRY RUN] Client orders are simulated, nothing is sent to the venue");
        return Ok(Arc::new(PaperExchange::new().with_upstream(live)));
    }
    Ok(live)
}

/// A client to register: keys plus the traders it copies.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub name: String,
    pub credentials: Credentials,
    pub subscriptions: Vec<SubscriptionSpec>,
}

#[derive(Default)]
struct Registry {
    traders: BTreeMap<String, Arc<TraderMonitor>>,
    clients: BTreeMap<String, Arc<ClientMirror>>,
    /// Names whose construction is in progress
    pending_traders: HashSet<String>,
    pending_clients: HashSet<String>,
}

pub struct Coordinator {
    gateway: Arc<dyn ExchangeGateway>,
    config: EngineConfig,
    registry: Mutex<Registry>,
    closing: AtomicBool,
    /// One token per `add_trader`/`add_client` call still running
    constructions: TaskTracker,
    /// Parent of every client mirror, cancelled first on shutdown
    client_cancel: CancellationToken,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: EngineConfig) -> Self {
        let cancel = CancellationToken::new();
        Self {
            gateway,
            config,
            registry: Mutex::new(Registry::default()),
            closing: AtomicBool::new(false),
            constructions: TaskTracker::new(),
            client_cancel: cancel.child_token(),
            cancel,
        }
    }

    /// Start watching a trader. Returns once its first snapshot is loaded.
    pub async fn add_trader(
        &self,
        name: &str,
        account_id: &str,
    ) -> Result<Arc<TraderMonitor>, CopyError> {
        let _construction = self.constructions.token();
        {
            let mut reg = self.registry();
            if self.closing.load(Ordering::SeqCst) {
                return Err(CopyError::ShuttingDown);
            }
            if reg.traders.contains_key(name) || !reg.pending_traders.insert(name.to_string()) {
                return Err(CopyError::DuplicateTrader(name.to_string()));
            }
        }

        let started = TraderMonitor::start(
            TraderProfile::new(name, account_id),
            Arc::clone(&self.gateway),
            self.config.clone(),
            &self.cancel,
        )
        .await;

        let registered = {
            let mut reg = self.registry();
            reg.pending_traders.remove(name);
            match &started {
                Ok(monitor) if !self.closing.load(Ordering::SeqCst) => {
                    reg.traders.insert(name.to_string(), Arc::clone(monitor));
                    true
                }
                _ => false,
            }
        };

        let monitor = started?;
        if !registered {
            monitor.destroy();
            monitor.wait().await;
            return Err(CopyError::ShuttingDown);
        }

        info!(trader = %monitor.profile().display_name(), "Trader added");
        Ok(monitor)
    }

    /// Register a client, wire its subscriptions and reconcile its account.
    /// Returns once reconciliation is complete.
    pub async fn add_client(
        &self,
        name: &str,
        credentials: Credentials,
        subscriptions: &[SubscriptionSpec],
    ) -> Result<Arc<ClientMirror>, CopyError> {
        let _construction = self.constructions.token();
        let links = {
            let mut reg = self.registry();
            if self.closing.load(Ordering::SeqCst) {
                return Err(CopyError::ShuttingDown);
            }
            if reg.clients.contains_key(name) || reg.pending_clients.contains(name) {
                return Err(CopyError::DuplicateClient(name.to_string()));
            }
            let links = subscriptions
                .iter()
                .map(|sub| {
                    reg.traders
                        .get(&sub.trader_name)
                        .map(|monitor| (Arc::clone(monitor), sub.ratio))
                        .ok_or_else(|| CopyError::UnknownTrader {
                            client: name.to_string(),
                            trader: sub.trader_name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            reg.pending_clients.insert(name.to_string());
            links
        };

        let started = self.start_client(name, credentials, links).await;

        let registered = {
            let mut reg = self.registry();
            reg.pending_clients.remove(name);
            match &started {
                Ok(mirror) if !self.closing.load(Ordering::SeqCst) => {
                    reg.clients.insert(name.to_string(), Arc::clone(mirror));
                    true
                }
                _ => false,
            }
        };

        let mirror = started?;
        if !registered {
            mirror.destroy().await;
            return Err(CopyError::ShuttingDown);
        }

        info!(client = %mirror.name(), "Client added");
        Ok(mirror)
    }

    async fn start_client(
        &self,
        name: &str,
        credentials: Credentials,
        links: Vec<(Arc<TraderMonitor>, rust_decimal::Decimal)>,
    ) -> Result<Arc<ClientMirror>, CopyError> {
        let mirror = ClientMirror::new(
            name,
            credentials,
            links,
            Arc::clone(&self.gateway),
            self.config.clone(),
            &self.client_cancel,
        )?;

        if let Err(e) = mirror.start().await {
            mirror.destroy().await;
            return Err(e);
        }
        Ok(mirror)
    }

    /// Add traders concurrently. One failure does not affect the others.
    pub async fn add_traders(
        &self,
        traders: &[TraderProfile],
    ) -> Vec<(String, Result<Arc<TraderMonitor>, CopyError>)> {
        join_all(traders.iter().map(|t| async move {
            let result = self.add_trader(&t.name, &t.account_id).await;
            if let Err(e) = &result {
                error!(trader = %t.name, error = %e, "Failed to add trader");
            }
            (t.name.clone(), result)
        }))
        .await
    }

    /// Add clients concurrently. One failure does not affect the others.
    pub async fn add_clients(
        &self,
        clients: &[ClientSpec],
    ) -> Vec<(String, Result<Arc<ClientMirror>, CopyError>)> {
        join_all(clients.iter().map(|c| async move {
            let result = self
                .add_client(&c.name, c.credentials.clone(), &c.subscriptions)
                .await;
            if let Err(e) = &result {
                error!(client = %c.name, error = %e, "Failed to add client");
            }
            (c.name.clone(), result)
        }))
        .await
    }

    /// Tear down every client, then stop every trader and wait for its loop.
    ///
    /// Additions still in progress are interrupted and awaited first, so no
    /// order is in flight once this returns.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.client_cancel.cancel();
        self.constructions.close();
        if !self.constructions.is_empty() {
            info!(pending = self.constructions.len(), "Waiting for additions in progress");
        }
        self.constructions.wait().await;

        let clients = std::mem::take(&mut self.registry().clients);

        info!(clients = clients.len(), "Stopping client mirrors");
        join_all(clients.values().map(|c| c.destroy())).await;

        let traders = std::mem::take(&mut self.registry().traders);
        info!(traders = traders.len(), "Stopping trader monitors");
        for monitor in traders.values() {
            monitor.destroy();
        }
        join_all(traders.values().map(|m| m.wait())).await;

        self.cancel.cancel();
        info!("Shutdown complete");
    }

    /// Run until `token` is cancelled, then shut down. Returns the status
    /// taken just before teardown.
    pub async fn run_until_cancelled(&self, token: CancellationToken) -> EngineStatus {
        token.cancelled().await;
        info!("Shutdown signal received");
        let status = self.status().await;
        self.shutdown().await;
        status
    }

    pub async fn status(&self) -> EngineStatus {
        let (traders, clients): (Vec<_>, Vec<_>) = {
            let reg = self.registry();
            (
                reg.traders.values().cloned().collect(),
                reg.clients.values().cloned().collect(),
            )
        };

        let traders = traders
            .iter()
            .map(|t| TraderStatus {
                name: t.name().to_string(),
                positions: t.snapshot().len(),
                subscribers: t.subscriber_count(),
                running: t.is_running(),
            })
            .collect();
        let clients = join_all(clients.iter().map(|c| c.status())).await;

        EngineStatus {
            venue: self.gateway.name().to_string(),
            shutting_down: self.closing.load(Ordering::SeqCst),
            traders,
            clients,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct TraderStatus {
    pub name: String,
    pub positions: usize,
    pub subscribers: usize,
    pub running: bool,
}

/// Engine summary printed on shutdown.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub venue: String,
    pub shutting_down: bool,
    pub traders: Vec<TraderStatus>,
    pub clients: Vec<ClientStatus>,
}

impl EngineStatus {
    pub fn orders_placed(&self) -> u64 {
        self.clients.iter().map(|c| c.orders_placed).sum()
    }

    pub fn orders_failed(&self) -> u64 {
        self.clients.iter().map(|c| c.orders_failed).sum()
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Copier Status ===")?;
        writeln!(f, "Venue:           {}", self.venue)?;
        writeln!(f, "Traders:         {}", self.traders.len())?;
        for t in &self.traders {
            writeln!(
                f,
                "  {:<20} {:>3} positions {:>3} subscribers {}",
                t.name,
                t.positions,
                t.subscribers,
                if t.running { "" } else { "(stopped)" }
            )?;
        }
        writeln!(f, "Clients:         {}", self.clients.len())?;
        for c in &self.clients {
            let subs: Vec<String> = c
                .subscriptions
                .iter()
                .map(|(trader, ratio)| format!("{} x{}", trader, ratio))
                .collect();
            writeln!(f, "  {} [{}]", c.name, subs.join(", "))?;
            writeln!(
                f,
                "    Orders: {} (Failed: {})  Deltas: {}  Resyncs: {}",
                c.orders_placed, c.orders_failed, c.deltas, c.resyncs
            )?;
            for s in &c.symbols {
                writeln!(
                    f,
                    "    {:<14} live {:>12} target {:>12} {}",
                    s.symbol,
                    s.live,
                    s.target,
                    if s.stale { "(stale)" } else { "" }
                )?;
            }
        }
        writeln!(
            f,
            "Status:          {}",
            if self.shutting_down { "Stopped" } else { "Running" }
        )?;
        Ok(())
    }
}
