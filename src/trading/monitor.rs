//! Trader monitor: polls one leaderboard account and publishes per-symbol
//! position changes to every subscribed client mirror.

use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Account, ExchangeError, ExchangeGateway};
use crate::error::CopyError;
use crate::models::{PositionSet, TraderProfile};

use super::config::EngineConfig;
use super::retry::retry_with_policy;

/// A trader's new absolute size in one symbol. Zero means closed.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionDelta {
    pub trader: String,
    pub symbol: String,
    pub new_size: Decimal,
}

/// Polling loop and latest snapshot of one trader.
pub struct TraderMonitor {
    profile: TraderProfile,
    account: Account,
    gateway: Arc<dyn ExchangeGateway>,
    config: EngineConfig,
    snapshot: RwLock<Arc<PositionSet>>,
    events: broadcast::Sender<PositionDelta>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TraderMonitor {
    /// Fetch the initial snapshot and start polling.
    ///
    /// Nothing is spawned when the initial fetch fails.
    pub async fn start(
        profile: TraderProfile,
        gateway: Arc<dyn ExchangeGateway>,
        config: EngineConfig,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, CopyError> {
        let account = Account::trader(profile.account_id.clone());
        let initial = fetch(&*gateway, &account, &config).await?;
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        info!(
            trader = %profile.display_name(),
            positions = initial.len(),
            "Trader snapshot loaded"
        );

        let monitor = Arc::new(Self {
            profile,
            account,
            gateway,
            config,
            snapshot: RwLock::new(Arc::new(initial)),
            events,
            cancel: parent.child_token(),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&monitor).run());
        *monitor.task.lock().await = Some(handle);

        Ok(monitor)
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &TraderProfile {
        &self.profile
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<PositionSet> {
        let guard = self.snapshot.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&*guard)
    }

    /// Receive every delta published from now on.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<PositionDelta>, CopyError> {
        if self.cancel.is_cancelled() {
            return Err(CopyError::TraderGone {
                trader: self.profile.name.clone(),
            });
        }
        Ok(self.events.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Ask the polling loop to stop after its current iteration.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    /// Wait for the polling loop to exit. Returns at once if it never ran.
    pub async fn wait(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(trader = %self.profile.name, error = %e, "Trader loop ended abnormally");
            }
        }
    }

    async fn run(self: Arc<Self>) {
        debug!(trader = %self.profile.name, "Trader loop started");

        while !self.cancel.is_cancelled() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }

            if let Err(e) = self.poll().await {
                warn!(trader = %self.profile.name, error = %e, "Position fetch failed, keeping last snapshot");
            }
        }

        info!(trader = %self.profile.name, "Trader monitor stopped");
    }

    /// One fetch-diff-publish cycle. Returns the number of published changes.
    async fn poll(&self) -> Result<usize, ExchangeError> {
        let next = fetch(&*self.gateway, &self.account, &self.config).await?;
        let changes = self.snapshot().diff(&next);

        // Mirrors that resync after lagging read the snapshot, so it must
        // already reflect every delta they may have missed.
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(next);

        for change in &changes {
            info!(
                trader = %self.profile.name,
                symbol = %change.symbol,
                size = %change.new_size,
                "Trader position changed"
            );
            let delta = PositionDelta {
                trader: self.profile.name.clone(),
                symbol: change.symbol.clone(),
                new_size: change.new_size,
            };
            if self.events.send(delta).is_err() {
                debug!(trader = %self.profile.name, "No subscribers for delta");
            }
        }

        Ok(changes.len())
    }
}

async fn fetch(
    gateway: &dyn ExchangeGateway,
    account: &Account,
    config: &EngineConfig,
) -> Result<PositionSet, ExchangeError> {
    retry_with_policy(&config.fetch_retry, "fetch trader positions", move || {
        gateway.fetch_positions(account)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scripted::ScriptedExchange;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const UID: &str = "TRADER-A";

    async fn next_delta(rx: &mut broadcast::Receiver<PositionDelta>) -> PositionDelta {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delta within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_start_loads_snapshot_and_publishes_changes() {
        let exchange = Arc::new(ScriptedExchange::new());
        exchange.set_positions(UID, &[("BTCUSDT", dec!(1.0))]);
        let root = CancellationToken::new();

        let monitor = TraderMonitor::start(
            TraderProfile::new("alpha", UID),
            exchange.clone(),
            EngineConfig::fast(),
            &root,
        )
        .await
        .unwrap();
        assert_eq!(monitor.snapshot().size_of("BTCUSDT"), dec!(1.0));

        let mut rx = monitor.subscribe().unwrap();
        exchange.set_positions(UID, &[("BTCUSDT", dec!(0.4)), ("ETHUSDT", dec!(-2))]);

        let mut seen = vec![next_delta(&mut rx).await, next_delta(&mut rx).await];
        seen.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(seen[0].symbol, "BTCUSDT");
        assert_eq!(seen[0].new_size, dec!(0.4));
        assert_eq!(seen[1].symbol, "ETHUSDT");
        assert_eq!(seen[1].new_size, dec!(-2));
        assert_eq!(monitor.snapshot().size_of("ETHUSDT"), dec!(-2));

        // Closing publishes size zero.
        exchange.set_positions(UID, &[("ETHUSDT", dec!(-2))]);
        let closed = next_delta(&mut rx).await;
        assert_eq!(closed.symbol, "BTCUSDT");
        assert!(closed.new_size.is_zero());

        monitor.destroy();
        monitor.wait().await;
    }

    #[tokio::test]
    async fn test_failed_initial_fetch_spawns_nothing() {
        let exchange = Arc::new(ScriptedExchange::new());
        exchange.fail_next_fetches([ExchangeError::Unauthorized("bad key".into())]);

        let result = TraderMonitor::start(
            TraderProfile::new("alpha", UID),
            exchange.clone(),
            EngineConfig::fast(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(CopyError::Exchange(ExchangeError::Unauthorized(_)))
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(exchange.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_fetch_failures_keep_loop_alive() {
        let exchange = Arc::new(ScriptedExchange::new());
        let monitor = TraderMonitor::start(
            TraderProfile::new("alpha", UID),
            exchange.clone(),
            EngineConfig::fast(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut rx = monitor.subscribe().unwrap();

        // More failures than one retry budget: one cycle gives up, the next succeeds.
        exchange.fail_next_fetches((0..4).map(|_| ExchangeError::Transient("reset".into())));
        exchange.set_positions(UID, &[("SOLUSDT", dec!(5))]);

        let delta = next_delta(&mut rx).await;
        assert_eq!(delta.symbol, "SOLUSDT");
        assert!(monitor.is_running());

        monitor.destroy();
        monitor.wait().await;
    }

    #[tokio::test]
    async fn test_destroy_stops_publication() {
        let exchange = Arc::new(ScriptedExchange::new());
        let monitor = TraderMonitor::start(
            TraderProfile::new("alpha", UID),
            exchange.clone(),
            EngineConfig::fast(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut rx = monitor.subscribe().unwrap();

        monitor.destroy();
        monitor.wait().await;
        let calls = exchange.fetch_calls();

        exchange.set_positions(UID, &[("BTCUSDT", dec!(1))]);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(exchange.fetch_calls(), calls);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(matches!(
            monitor.subscribe(),
            Err(CopyError::TraderGone { .. })
        ));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_monitor() {
        let exchange = Arc::new(ScriptedExchange::new());
        let root = CancellationToken::new();
        let monitor = TraderMonitor::start(
            TraderProfile::new("alpha", UID),
            exchange,
            EngineConfig::fast(),
            &root,
        )
        .await
        .unwrap();

        root.cancel();
        tokio::time::timeout(Duration::from_secs(1), monitor.wait())
            .await
            .unwrap();
        assert!(!monitor.is_running());
    }
}
