//! Provider contract and background lifecycle
//!
//! Every upstream — exchange socket or chain endpoint — sits behind the same
//! query contract; ingestion runs as one background task per provider, owned
//! by an explicit handle so tests can start and stop it deterministically.

pub mod bitfinex;
pub mod cache;
pub mod fin;
pub mod osmosis;
pub mod registry;
pub mod stream;

pub use bitfinex::BitfinexProvider;
pub use cache::TickerCache;
pub use fin::FinProvider;
pub use osmosis::OsmosisProvider;
pub use registry::PairRegistry;
pub use stream::StreamController;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::FeedError;
use crate::types::{CurrencyPair, Ticker};

/// The query contract exposed to the outer oracle aggregator.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Tickers for all requested pairs. Fails the whole call if any single
    /// pair is unavailable; callers needing partial tolerance request pairs
    /// individually.
    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Ticker>, FeedError>;

    /// Pairs this provider instance is configured and able to serve.
    async fn get_available_pairs(&self) -> Result<HashSet<String>, FeedError>;

    /// Streaming providers only. Idempotent; pairs already subscribed are
    /// silently skipped.
    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<(), FeedError> {
        let _ = pairs;
        Err(FeedError::Configuration(format!(
            "{} does not support streaming subscriptions",
            self.name()
        )))
    }
}

/// A provider driven by a fixed-interval poll cycle.
#[async_trait]
pub trait Polling: Send + Sync {
    fn name(&self) -> &str;

    /// One full cycle: refresh volumes, query prices, validate, publish.
    /// A cycle failure is logged and the next cycle runs regardless.
    async fn poll(&self) -> Result<(), FeedError>;
}

/// Cancellation signal handed to background tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested (or the handle is dropped).
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owns one provider's background ingestion task.
pub struct ProviderHandle {
    tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProviderHandle {
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(f(ShutdownSignal { rx }));
        Self { tx, task }
    }

    /// Request shutdown and wait for the task to stop. New iterations stop
    /// at their next suspension point; in-flight network calls complete or
    /// time out naturally.
    pub async fn shutdown(self) {
        let _ = self.tx.send(true);
        let _ = self.task.await;
    }
}

/// Run a provider's poll cycle at a fixed interval until shutdown. Cycles
/// run unconditionally regardless of the previous cycle's outcome.
pub fn start_polling(provider: Arc<dyn Polling>, interval: Duration) -> ProviderHandle {
    ProviderHandle::spawn(move |mut shutdown| async move {
        info!(provider = %provider.name(), ?interval, "starting poll loop");
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = provider.poll().await {
                        warn!(provider = %provider.name(), error = %e, "poll cycle failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(provider = %provider.name(), "poll loop stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPoller {
        cycles: AtomicUsize,
    }

    #[async_trait]
    impl Polling for CountingPoller {
        fn name(&self) -> &str {
            "counting"
        }

        async fn poll(&self) -> Result<(), FeedError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            // Failures must not stop the loop.
            Err(FeedError::Transport("down".into()))
        }
    }

    #[test]
    fn shutdown_signal_resolves_after_send() {
        let (tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal { rx };

        tx.send(true).unwrap();
        tokio_test::block_on(signal.cancelled());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn poll_loop_survives_cycle_failures_and_stops_on_shutdown() {
        let poller = Arc::new(CountingPoller {
            cycles: AtomicUsize::new(0),
        });
        let handle = start_polling(poller.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(55)).await;
        handle.shutdown().await;

        let seen = poller.cycles.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated cycles, got {seen}");

        let after = poller.cycles.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(after, poller.cycles.load(Ordering::SeqCst));
    }
}
