//! Binance WebSocket client for real-time reference prices.
//!
//! Streams bookTicker updates for the configured symbols and reduces them to
//! a single reference price per tick (best bid/ask mid). This is the
//! spot-venue transport behind the engine's reference-price interface.

use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::Asset;
use crate::reference::ReferenceTick;

/// Raw bookTicker event from Binance.
#[derive(Debug, Deserialize)]
struct BookTickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "a")]
    best_ask: String,
}

/// Combined stream wrapper message.
#[derive(Debug, Deserialize)]
struct CombinedStreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

/// Binance WebSocket client for streaming reference prices.
pub struct BinanceWsClient {
    ws_url: String,
    symbols: Vec<String>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl BinanceWsClient {
    /// Create a client for the given assets' spot symbols.
    pub fn new(ws_url: &str, assets: &[Asset]) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            symbols: assets.iter().map(|a| a.binance_symbol().to_string()).collect(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    /// Build the combined stream URL for all symbols.
    fn build_stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@bookTicker", s.to_lowercase()))
            .collect();

        format!("{}?streams={}", self.ws_url, streams.join("/"))
    }

    /// Connect to Binance WebSocket with retry logic.
    pub async fn connect_with_retry(&self, max_retries: u32) -> anyhow::Result<BinanceWsStream> {
        let url = self.build_stream_url();
        let mut delay = self.reconnect_delay;

        for attempt in 1..=max_retries {
            info!(
                "[BINANCE] Connecting to WebSocket (attempt {}/{}): {}",
                attempt, max_retries, url
            );

            match timeout(Duration::from_secs(10), connect_async(&url)).await {
                Ok(Ok((ws_stream, _))) => {
                    info!("[BINANCE] Connected successfully");
                    return Ok(BinanceWsStream::new(ws_stream));
                }
                Ok(Err(e)) => {
                    warn!("[BINANCE] Connection failed: {}", e);
                }
                Err(_) => {
                    warn!("[BINANCE] Connection timeout");
                }
            }

            if attempt < max_retries {
                info!("[BINANCE] Retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.max_reconnect_delay);
            }
        }

        Err(anyhow::anyhow!(
            "Failed to connect after {} attempts",
            max_retries
        ))
    }
}

/// Active WebSocket stream delivering reference ticks.
pub struct BinanceWsStream {
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    last_ping: std::time::Instant,
}

impl BinanceWsStream {
    fn new(
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Self {
        Self {
            ws_stream,
            last_ping: std::time::Instant::now(),
        }
    }

    /// Receive the next reference tick. Returns None when the connection is
    /// closed and the caller should reconnect.
    pub async fn next_tick(&mut self) -> Option<ReferenceTick> {
        loop {
            // Keepalive ping every 30 seconds
            if self.last_ping.elapsed() > Duration::from_secs(30) {
                if let Err(e) = self.ws_stream.send(Message::Ping(vec![].into())).await {
                    warn!("[BINANCE] Failed to send ping: {}", e);
                    return None;
                }
                self.last_ping = std::time::Instant::now();
            }

            match timeout(Duration::from_secs(30), self.ws_stream.next()).await {
                Ok(Some(Ok(msg))) => match msg {
                    Message::Text(text) => {
                        if let Some(tick) = parse_tick(&text) {
                            return Some(tick);
                        }
                    }
                    Message::Ping(data) => {
                        debug!("[BINANCE] Received ping, sending pong");
                        if let Err(e) = self.ws_stream.send(Message::Pong(data)).await {
                            warn!("[BINANCE] Failed to send pong: {}", e);
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        info!("[BINANCE] WebSocket closed by server");
                        return None;
                    }
                    _ => {}
                },
                Ok(Some(Err(e))) => {
                    error!("[BINANCE] WebSocket error: {}", e);
                    return None;
                }
                Ok(None) => {
                    info!("[BINANCE] WebSocket stream ended");
                    return None;
                }
                Err(_) => {
                    // No message for 30s: treat as a dead connection
                    warn!("[BINANCE] WebSocket receive timeout, reconnecting");
                    return None;
                }
            }
        }
    }

    /// Close the WebSocket connection.
    pub async fn close(mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}

/// Parse a WebSocket message into a reference tick.
fn parse_tick(text: &str) -> Option<ReferenceTick> {
    let data = if let Ok(combined) = serde_json::from_str::<CombinedStreamMessage>(text) {
        combined.data
    } else {
        serde_json::from_str::<serde_json::Value>(text).ok()?
    };

    let event: BookTickerEvent = serde_json::from_value(data).ok()?;
    let asset = Asset::from_binance_symbol(&event.symbol)?;

    let bid: Decimal = event.best_bid.parse().ok()?;
    let ask: Decimal = event.best_ask.parse().ok()?;
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
        return None;
    }

    Some(ReferenceTick {
        asset,
        price: (bid + ask) / Decimal::TWO,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_combined_book_ticker() {
        let json = r#"{
            "stream": "btcusdt@bookTicker",
            "data": {"u": 1, "s": "BTCUSDT", "b": "50000.00", "B": "1", "a": "50002.00", "A": "2"}
        }"#;

        let tick = parse_tick(json).unwrap();
        assert_eq!(tick.asset, Asset::Btc);
        assert_eq!(tick.price, dec!(50001.00));
    }

    #[test]
    fn test_parse_rejects_unknown_symbol() {
        let json = r#"{
            "stream": "xrpusdt@bookTicker",
            "data": {"u": 1, "s": "XRPUSDT", "b": "0.50", "B": "1", "a": "0.51", "A": "2"}
        }"#;

        assert!(parse_tick(json).is_none());
    }

    #[test]
    fn test_parse_rejects_zero_prices() {
        let json = r#"{
            "stream": "ethusdt@bookTicker",
            "data": {"u": 1, "s": "ETHUSDT", "b": "0", "B": "1", "a": "2600", "A": "2"}
        }"#;

        assert!(parse_tick(json).is_none());
    }
}
