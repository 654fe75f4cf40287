//! Streaming subscription controller
//!
//! Owns one persistent multiplexed socket to an upstream. On connect it
//! replays every registered subscription message, then loops reading frames
//! until the connection fails or shutdown is requested. Reconnect retries
//! forever with bounded per-attempt backoff; callers reading the ticker
//! cache during an outage simply get the last observation.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{error, info, warn};

use super::ShutdownSignal;
use crate::error::FeedError;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn backoff_delay(attempt: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(1u32 << attempt.min(6))
        .min(MAX_BACKOFF)
}

/// Provider-supplied parser for inbound frames.
///
/// Implementations must check subscription acks before heartbeats before
/// data frames; ack shapes overlap with heartbeat/array framing. A frame
/// matching nothing is logged and dropped, never fatal.
pub trait MessageHandler: Send + Sync {
    fn message_received(&self, frame: &[u8]);
}

struct StreamState {
    subscriptions: Vec<Value>,
    connected: bool,
}

pub struct StreamController {
    name: String,
    url: String,
    ping_timeout: Duration,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<StreamState>,
    outbox_tx: mpsc::UnboundedSender<Value>,
    outbox_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl StreamController {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        subscriptions: Vec<Value>,
        handler: Arc<dyn MessageHandler>,
        ping_timeout: Duration,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            url: url.into(),
            ping_timeout,
            handler,
            state: Mutex::new(StreamState {
                subscriptions,
                connected: false,
            }),
            outbox_tx,
            outbox_rx: tokio::sync::Mutex::new(Some(outbox_rx)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Register additional subscription messages and, if currently
    /// connected, send them immediately. The full registered set is replayed
    /// on every reconnect; upstream treats duplicate subscribes as
    /// idempotent.
    pub fn add_subscription_msgs(&self, msgs: Vec<Value>) -> Result<(), FeedError> {
        let mut state = self.state.lock().unwrap();

        if state.connected {
            for msg in &msgs {
                self.outbox_tx
                    .send(msg.clone())
                    .map_err(|e| FeedError::Transport(e.to_string()))?;
            }
        }

        state.subscriptions.extend(msgs);
        Ok(())
    }

    /// Connect-read-reconnect loop. Runs until shutdown; returns early only
    /// if called twice on the same controller.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut outbox = match self.outbox_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!(provider = %self.name, "stream controller is already running");
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    info!(provider = %self.name, url = %self.url, "stream connected");

                    let reconnect = self.serve(ws, &mut outbox, &mut shutdown).await;
                    self.state.lock().unwrap().connected = false;

                    if !reconnect {
                        info!(provider = %self.name, "stream stopped");
                        return;
                    }
                }
                Err(e) => {
                    error!(provider = %self.name, error = %e, "stream connect failed");
                }
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(provider = %self.name, delay_secs = delay.as_secs(), "reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Drive one established connection. Returns true to reconnect, false on
    /// shutdown.
    async fn serve<S>(
        &self,
        ws: WebSocketStream<S>,
        outbox: &mut mpsc::UnboundedReceiver<Value>,
        shutdown: &mut ShutdownSignal,
    ) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        // Connecting -> Connected: replay of the registered set is a side
        // effect of the transition, not a separate task.
        let replay = {
            let mut state = self.state.lock().unwrap();
            state.connected = true;
            state.subscriptions.clone()
        };
        for msg in replay {
            if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                warn!(provider = %self.name, error = %e, "subscription replay failed");
                return true;
            }
        }

        let mut last_inbound = Instant::now();
        let ping_interval = (self.ping_timeout / 2).max(Duration::from_millis(10));
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_inbound = Instant::now();
                            self.handler.message_received(text.as_bytes());
                        }
                        Some(Ok(Message::Binary(data))) => {
                            last_inbound = Instant::now();
                            self.handler.message_received(&data);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_inbound = Instant::now();
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return true;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_inbound = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!(provider = %self.name, "connection closed by upstream");
                            return true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(provider = %self.name, error = %e, "stream read error");
                            return true;
                        }
                        None => {
                            warn!(provider = %self.name, "stream ended");
                            return true;
                        }
                    }
                }
                Some(msg) = outbox.recv() => {
                    if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                        warn!(provider = %self.name, error = %e, "subscription send failed");
                        return true;
                    }
                }
                _ = ping_timer.tick() => {
                    // Any inbound traffic, heartbeats included, counts as
                    // liveness; total silence past the deadline does not.
                    if last_inbound.elapsed() >= self.ping_timeout {
                        warn!(provider = %self.name, "liveness timeout");
                        return true;
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return true;
                    }
                }
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    impl MessageHandler for NoopHandler {
        fn message_received(&self, _frame: &[u8]) {}
    }

    #[test]
    fn subscriptions_register_while_disconnected() {
        let controller = StreamController::new(
            "test",
            "ws://127.0.0.1:9",
            vec![serde_json::json!({"event": "subscribe", "symbol": "tETHUSD"})],
            Arc::new(NoopHandler),
            Duration::from_secs(30),
        );

        assert!(!controller.is_connected());
        controller
            .add_subscription_msgs(vec![serde_json::json!({
                "event": "subscribe",
                "symbol": "tBTCUSD",
            })])
            .unwrap();

        let state = controller.state.lock().unwrap();
        assert_eq!(state.subscriptions.len(), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(40), Duration::from_secs(60));
    }
}
