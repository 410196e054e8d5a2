//! Order-book WebSocket transport.
//!
//! Subscriptions are by token id on the market channel. The stream is owned
//! by `OrderBookStream`, which keeps the subscribed-token set, answers pings,
//! sends its own keepalives, and reports staleness so the feed worker can
//! decide to reconnect. The engine only consumes best bid/ask mids, so
//! levels deserialize straight into `Decimal`.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClobWsError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionError(#[from] WsError),

    #[error("Failed to encode subscription: {0}")]
    EncodeError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("No message within the staleness horizon")]
    Stale,

    #[error("Channel closed")]
    ChannelClosed,
}

/// One order-book level. Prices on this venue are strings on the wire but
/// always decimal odds in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
}

/// Full book snapshot for one token.
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    pub asset_id: String,
    pub market: String,
    /// Bids (buy orders). May be named "buys" in some API versions.
    #[serde(alias = "buys")]
    pub bids: Vec<PriceLevel>,
    /// Asks (sell orders). May be named "sells" in some API versions.
    #[serde(alias = "sells")]
    pub asks: Vec<PriceLevel>,
}

impl BookMessage {
    /// Best bid (highest). Does not rely on API sort order.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().map(|l| l.price).max()
    }

    /// Best ask (lowest). Does not rely on API sort order.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().map(|l| l.price).min()
    }

    /// Mid of best bid/ask, the price the engine records for the token.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }
}

/// One entry of a price-change batch.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub side: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub best_bid: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub best_ask: Option<Decimal>,
}

impl PriceChange {
    /// Mid of the reported best bid/ask, falling back to the trade price.
    pub fn mid_price(&self) -> Decimal {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => (bid + ask) / Decimal::TWO,
            _ => self.price,
        }
    }
}

/// Price change batch from the market channel.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeMessage {
    pub market: String,
    pub price_changes: Vec<PriceChange>,
}

/// Single market-channel objects, dispatched on their `event_type` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum TaggedEvent {
    Book(BookMessage),
    PriceChange(PriceChangeMessage),
    #[serde(other)]
    Unsupported,
}

/// What the stream hands the feed worker.
#[derive(Debug, Clone)]
pub enum BookEvent {
    /// Snapshot for one token.
    Snapshot(BookMessage),
    /// Batch of snapshots (initial subscription response).
    Batch(Vec<BookMessage>),
    /// Incremental best-price changes.
    Changes(PriceChangeMessage),
    /// Ping, pong, empty ack: connection is alive, nothing to route.
    Keepalive,
    /// Parseable but not a message the engine consumes.
    Other(String),
}

/// Parse one text frame from the market channel.
pub fn parse_event(text: &str) -> BookEvent {
    if text == "ping" || text.contains("\"type\":\"ping\"") {
        return BookEvent::Keepalive;
    }

    // Initial subscription responses arrive as arrays of snapshots
    if text.trim_start().starts_with('[') {
        match serde_json::from_str::<Vec<TaggedEvent>>(text) {
            Ok(events) => {
                let books: Vec<BookMessage> = events
                    .into_iter()
                    .filter_map(|e| match e {
                        TaggedEvent::Book(book) => Some(book),
                        _ => None,
                    })
                    .collect();
                return if books.is_empty() {
                    BookEvent::Keepalive
                } else {
                    BookEvent::Batch(books)
                };
            }
            Err(_) => return BookEvent::Other(text.to_string()),
        }
    }

    match serde_json::from_str::<TaggedEvent>(text) {
        Ok(TaggedEvent::Book(book)) => BookEvent::Snapshot(book),
        Ok(TaggedEvent::PriceChange(changes)) => BookEvent::Changes(changes),
        Ok(TaggedEvent::Unsupported) | Err(_) => BookEvent::Other(text.to_string()),
    }
}

/// Subscription request to the market channel.
#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    assets_ids: &'a [String],
}

/// Tokens in `requested` not yet subscribed. Pure so the dedup rule is
/// testable without a socket.
fn subscription_additions(subscribed: &HashSet<String>, requested: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|t| !subscribed.contains(*t))
        .cloned()
        .collect()
}

/// Connector for the market channel.
pub struct OrderBookWs {
    url: String,
    connect_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl OrderBookWs {
    pub fn new(base_ws_url: &str) -> Self {
        Self {
            url: format!("{}/market", base_ws_url),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Connect, retrying with exponential backoff and full jitter until a
    /// connection succeeds or `max_attempts` is exhausted.
    pub async fn connect(&self, max_attempts: u32) -> Result<OrderBookStream, ClobWsError> {
        let mut backoff = self.initial_backoff;
        let mut last_error = ClobWsError::Timeout;

        for attempt in 1..=max_attempts {
            info!(
                "[BOOK] Connecting to market channel (attempt {}): {}",
                attempt, self.url
            );

            match timeout(self.connect_timeout, connect_async(&self.url)).await {
                Ok(Ok((ws, _))) => {
                    info!("[BOOK] Connected");
                    return Ok(OrderBookStream::new(ws));
                }
                Ok(Err(e)) => {
                    warn!("[BOOK] Connect failed: {}", e);
                    last_error = ClobWsError::ConnectionError(e);
                }
                Err(_) => {
                    warn!("[BOOK] Connect timed out");
                    last_error = ClobWsError::Timeout;
                }
            }

            if attempt < max_attempts {
                // Full jitter: anywhere from zero up to the current backoff
                let cap = backoff.as_millis() as u64;
                let pause = Duration::from_millis(rand::thread_rng().gen_range(0..=cap));
                debug!("[BOOK] Retrying in {:?}", pause);
                sleep(pause).await;
                backoff = (backoff * 2).min(self.max_backoff);
            }
        }

        Err(last_error)
    }
}

/// A connected market-channel stream. Owns the socket and the set of tokens
/// it is subscribed to.
pub struct OrderBookStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    subscribed: HashSet<String>,
    last_message: Instant,
    last_ping: Instant,
}

impl OrderBookStream {
    /// Keepalive ping cadence.
    const PING_EVERY: Duration = Duration::from_secs(10);
    /// A connection silent this long is treated as dead.
    const STALE_AFTER: Duration = Duration::from_secs(30);

    fn new(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            ws,
            subscribed: HashSet::new(),
            last_message: Instant::now(),
            last_ping: Instant::now(),
        }
    }

    /// Subscribe to any of `token_ids` not already subscribed. Returns how
    /// many new tokens were requested; zero means nothing was sent.
    pub async fn subscribe(&mut self, token_ids: &[String]) -> Result<usize, ClobWsError> {
        let additions = subscription_additions(&self.subscribed, token_ids);
        if additions.is_empty() {
            return Ok(0);
        }

        let request = SubscribeRequest {
            msg_type: "market",
            assets_ids: &additions,
        };
        let frame =
            serde_json::to_string(&request).map_err(|e| ClobWsError::EncodeError(e.to_string()))?;

        debug!("[BOOK] Subscribing to {} new tokens", additions.len());
        self.ws.send(Message::Text(frame.into())).await?;

        self.subscribed.extend(additions.iter().cloned());
        Ok(additions.len())
    }

    /// Number of tokens this connection is subscribed to.
    pub fn subscription_count(&self) -> usize {
        self.subscribed.len()
    }

    /// Read the next event. Pings are answered and keepalives sent
    /// internally; returns `Err(Stale)` when the connection has gone silent
    /// past the staleness horizon, at which point the caller reconnects.
    pub async fn next_event(&mut self) -> Result<BookEvent, ClobWsError> {
        loop {
            if self.last_ping.elapsed() >= Self::PING_EVERY {
                self.ws.send(Message::Ping(vec![].into())).await?;
                self.last_ping = Instant::now();
            }

            let frame = match timeout(Self::PING_EVERY, self.ws.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(ClobWsError::ConnectionError(e)),
                Ok(None) => return Err(ClobWsError::ChannelClosed),
                Err(_) => {
                    // No traffic this interval; dead or just quiet?
                    if self.last_message.elapsed() >= Self::STALE_AFTER {
                        return Err(ClobWsError::Stale);
                    }
                    continue;
                }
            };

            self.last_message = Instant::now();
            match frame {
                Message::Text(text) => return Ok(parse_event(&text)),
                Message::Ping(data) => {
                    self.ws.send(Message::Pong(data)).await?;
                    return Ok(BookEvent::Keepalive);
                }
                Message::Pong(_) => return Ok(BookEvent::Keepalive),
                Message::Close(_) => {
                    info!("[BOOK] Closed by server");
                    return Err(ClobWsError::ChannelClosed);
                }
                _ => continue, // Binary, raw frames: nothing for us
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_snapshot() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "123",
            "market": "condition-456",
            "bids": [{"price": "0.55", "size": "100"}],
            "asks": [{"price": "0.57", "size": "200"}],
            "timestamp": "1704067200000",
            "hash": "abc123"
        }"#;

        match parse_event(json) {
            BookEvent::Snapshot(book) => {
                assert_eq!(book.asset_id, "123");
                assert_eq!(book.best_bid(), Some(dec!(0.55)));
                assert_eq!(book.best_ask(), Some(dec!(0.57)));
                assert_eq!(book.mid_price(), Some(dec!(0.56)));
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_best_prices_ignore_sort_order() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "1",
            "market": "m",
            "bids": [{"price": "0.50", "size": "1"}, {"price": "0.54", "size": "1"}],
            "asks": [{"price": "0.60", "size": "1"}, {"price": "0.56", "size": "1"}]
        }"#;

        match parse_event(json) {
            BookEvent::Snapshot(book) => {
                assert_eq!(book.best_bid(), Some(dec!(0.54)));
                assert_eq!(book.best_ask(), Some(dec!(0.56)));
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_snapshot_batch() {
        let json = r#"[
            {"event_type": "book", "asset_id": "1", "market": "m", "bids": [], "asks": []},
            {"event_type": "book", "asset_id": "2", "market": "m", "bids": [], "asks": []}
        ]"#;

        match parse_event(json) {
            BookEvent::Batch(books) => assert_eq!(books.len(), 2),
            other => panic!("Expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_price_changes() {
        let json = r#"{
            "event_type": "price_change",
            "market": "condition-456",
            "price_changes": [
                {
                    "asset_id": "123",
                    "price": "0.55",
                    "size": "50",
                    "side": "BUY",
                    "best_bid": "0.54",
                    "best_ask": "0.56"
                }
            ],
            "timestamp": "1704067200000"
        }"#;

        match parse_event(json) {
            BookEvent::Changes(msg) => {
                assert_eq!(msg.price_changes.len(), 1);
                assert_eq!(msg.price_changes[0].mid_price(), dec!(0.55));
            }
            other => panic!("Expected changes, got {:?}", other),
        }
    }

    #[test]
    fn test_mid_falls_back_to_trade_price() {
        let change = PriceChange {
            asset_id: "1".to_string(),
            price: dec!(0.42),
            side: "SELL".to_string(),
            best_bid: None,
            best_ask: None,
        };
        assert_eq!(change.mid_price(), dec!(0.42));
    }

    #[test]
    fn test_parse_keepalives_and_noise() {
        assert!(matches!(parse_event("ping"), BookEvent::Keepalive));
        assert!(matches!(parse_event("[]"), BookEvent::Keepalive));
        assert!(matches!(
            parse_event(r#"{"event_type": "last_trade_price", "asset_id": "1"}"#),
            BookEvent::Other(_)
        ));
        assert!(matches!(parse_event("random garbage"), BookEvent::Other(_)));
    }

    #[test]
    fn test_subscription_dedup() {
        let mut subscribed = HashSet::new();
        subscribed.insert("a".to_string());

        let additions = subscription_additions(
            &subscribed,
            &["a".to_string(), "b".to_string(), "c".to_string()],
        );
        assert_eq!(additions, vec!["b".to_string(), "c".to_string()]);

        let none = subscription_additions(&subscribed, &["a".to_string()]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_subscribe_request_shape() {
        let tokens = vec!["token1".to_string(), "token2".to_string()];
        let request = SubscribeRequest {
            msg_type: "market",
            assets_ids: &tokens,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"market\""));
        assert!(json.contains("\"assets_ids\":[\"token1\",\"token2\"]"));
    }
}
