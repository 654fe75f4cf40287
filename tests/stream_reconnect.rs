//! Reconnect behavior against a local socket server: subscription replay,
//! channel re-acknowledgement and liveness timeouts.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use marketfeed::config::Endpoint;
use marketfeed::provider::{BitfinexProvider, Provider};
use marketfeed::types::CurrencyPair;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn endpoint(ping_timeout_ms: u64) -> Endpoint {
    serde_json::from_value(serde_json::json!({
        "name": "bitfinex",
        "ping_timeout_ms": ping_timeout_ms,
    }))
    .unwrap()
}

fn ack_frame(channel: u64, pair: &str) -> String {
    serde_json::json!({
        "event": "subscribed",
        "channel": "ticker",
        "chanId": channel,
        "symbol": format!("t{pair}"),
        "pair": pair,
    })
    .to_string()
}

fn tick_frame(channel: u64, price: f64, volume: f64) -> String {
    serde_json::json!([
        channel,
        [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, price, volume, 1.0, 1.0]
    ])
    .to_string()
}

async fn wait_for_price(
    provider: &BitfinexProvider,
    pair: &CurrencyPair,
    price: Decimal,
) -> bool {
    for _ in 0..200 {
        if let Ok(tickers) = provider.get_ticker_prices(std::slice::from_ref(pair)).await {
            if tickers[&pair.symbol()].price == price {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn reconnect_replays_subscriptions_and_recovers_ticks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let subscriptions: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let server_subs = subscriptions.clone();

    let server = tokio::spawn(async move {
        // First connection: ack, one tick, then drop the socket.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut received = Vec::new();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            received.push(text);
        }
        server_subs.lock().unwrap().push(received);

        ws.send(Message::Text(ack_frame(7, "ETHUSD"))).await.unwrap();
        ws.send(Message::Text(tick_frame(7, 100.0, 10.0)))
            .await
            .unwrap();
        drop(ws);

        // Second connection: the full registered set must be replayed, and
        // the same channel id re-acknowledged.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut received = Vec::new();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            received.push(text);
        }
        server_subs.lock().unwrap().push(received);

        ws.send(Message::Text(ack_frame(7, "ETHUSD"))).await.unwrap();
        ws.send(Message::Text(tick_frame(7, 200.0, 20.0)))
            .await
            .unwrap();

        // Hold the connection open until the client goes away.
        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    });

    let pair = CurrencyPair::new("ETH", "USD");
    let provider = BitfinexProvider::with_url(
        &endpoint(30_000),
        std::slice::from_ref(&pair),
        format!("ws://127.0.0.1:{port}"),
    );
    let handle = provider.start();

    assert!(
        wait_for_price(&provider, &pair, dec!(100)).await,
        "tick on first connection never arrived"
    );
    assert!(
        wait_for_price(&provider, &pair, dec!(200)).await,
        "tick after reconnect never arrived"
    );

    {
        let subs = subscriptions.lock().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0], subs[1], "subscriptions were not replayed in full");
        assert!(subs[0][0].contains("tETHUSD"));
    }

    handle.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn silent_connection_triggers_liveness_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // First connection goes completely silent after the subscribe; the
        // client's watchdog has to give up on it.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.next().await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        ws.send(Message::Text(ack_frame(3, "ETHUSD"))).await.unwrap();
        ws.send(Message::Text(tick_frame(3, 300.0, 30.0)))
            .await
            .unwrap();

        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    });

    let pair = CurrencyPair::new("ETH", "USD");
    let provider = BitfinexProvider::with_url(
        &endpoint(200),
        std::slice::from_ref(&pair),
        format!("ws://127.0.0.1:{port}"),
    );
    let handle = provider.start();

    assert!(
        wait_for_price(&provider, &pair, dec!(300)).await,
        "silent connection was never abandoned"
    );

    handle.shutdown().await;
    server.abort();
}
