//! Feed router: supervised transport workers fanning ticks out to the
//! engine. Subscribers get lossy broadcast streams; a slow consumer drops
//! ticks rather than stalling the pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::models::Side;
use common::{
    Asset, BinanceWsClient, BookEvent, Config, OrderBookWs, ReferencePrices, ReferenceTick,
};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::history::PriceHistory;
use crate::metrics::Metrics;
use crate::windows::{WindowRegistry, WindowUpdate};

/// One odds tick routed from the order-book feed.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub struct PriceTickEvent {
    pub asset: Asset,
    pub side: Side,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast hub for feed subscribers.
pub struct FeedRouter {
    price_tx: broadcast::Sender<PriceTickEvent>,
    reference_tx: broadcast::Sender<ReferenceTick>,
}

impl FeedRouter {
    pub fn new() -> Self {
        let (price_tx, _) = broadcast::channel(1024);
        let (reference_tx, _) = broadcast::channel(1024);
        Self {
            price_tx,
            reference_tx,
        }
    }

    #[allow(dead_code)]
    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceTickEvent> {
        self.price_tx.subscribe()
    }

    #[allow(dead_code)]
    pub fn subscribe_reference(&self) -> broadcast::Receiver<ReferenceTick> {
        self.reference_tx.subscribe()
    }

    fn publish_price(&self, event: PriceTickEvent) {
        // Lossy by design: send fails only with zero receivers
        let _ = self.price_tx.send(event);
    }

    fn publish_reference(&self, tick: ReferenceTick) {
        let _ = self.reference_tx.send(tick);
    }
}

impl Default for FeedRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one order-book event: update window odds, append to the history
/// ring, and emit router events. Returns the number of ticks routed.
fn apply_book_event(
    event: &BookEvent,
    registry: &WindowRegistry,
    history: &PriceHistory,
    router: &FeedRouter,
    now: DateTime<Utc>,
) -> usize {
    let mut routed = 0;

    let mut route = |token_id: &str, price: Decimal| {
        if let Some((key, side)) = registry.update_token_price(token_id, price) {
            history.record(key.asset, side, price, now);
            router.publish_price(PriceTickEvent {
                asset: key.asset,
                side,
                price,
                timestamp: now,
            });
            routed += 1;
        }
    };

    match event {
        BookEvent::Snapshot(book) => {
            if let Some(mid) = book.mid_price() {
                route(&book.asset_id, mid);
            }
        }
        BookEvent::Batch(books) => {
            for book in books {
                if let Some(mid) = book.mid_price() {
                    route(&book.asset_id, mid);
                }
            }
        }
        BookEvent::Changes(msg) => {
            for change in &msg.price_changes {
                route(&change.asset_id, change.mid_price());
            }
        }
        BookEvent::Keepalive => {}
        BookEvent::Other(text) => {
            debug!("[FEED] Unhandled book message: {}", text);
        }
    }

    routed
}

/// Reconnect delay with full jitter on top of the client's backoff.
async fn jittered_pause() {
    let jitter = rand::thread_rng().gen_range(0..1000);
    tokio::time::sleep(Duration::from_millis(1000 + jitter)).await;
}

/// Order-book worker: connects, subscribes to every tracked token, routes
/// ticks, and re-subscribes after reconnects and on newly resolved windows.
/// Keepalives and staleness live inside the stream; this loop only decides
/// when to reconnect.
pub async fn run_orderbook_worker(
    config: Config,
    registry: Arc<WindowRegistry>,
    history: Arc<PriceHistory>,
    router: Arc<FeedRouter>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let connector = OrderBookWs::new(&config.clob_ws_url);
    let mut updates = registry.subscribe_updates();

    'reconnect: loop {
        let mut stream = tokio::select! {
            result = connector.connect(u32::MAX) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[FEED] Book connect failed: {}", e);
                    jittered_pause().await;
                    continue 'reconnect;
                }
            },
            _ = shutdown.recv() => return,
        };

        // Fresh connection starts with an empty subscription set
        if let Err(e) = stream.subscribe(&registry.tracked_tokens()).await {
            warn!("[FEED] Book subscribe failed: {}", e);
            jittered_pause().await;
            continue 'reconnect;
        }

        loop {
            tokio::select! {
                result = stream.next_event() => {
                    match result {
                        Ok(event) => {
                            let routed = apply_book_event(
                                &event, &registry, &history, &router, Utc::now(),
                            );
                            for _ in 0..routed {
                                metrics.record_price_tick();
                            }
                        }
                        Err(e) => {
                            warn!("[FEED] Book stream error: {}, reconnecting", e);
                            jittered_pause().await;
                            continue 'reconnect;
                        }
                    }
                }
                update = updates.recv() => {
                    match update {
                        // Newly resolved window: its tokens are additions
                        Ok(WindowUpdate::IdentityResolved(_)) => {
                            match stream.subscribe(&registry.tracked_tokens()).await {
                                Ok(added) if added > 0 => {
                                    debug!(
                                        "[FEED] Watching {} tokens",
                                        stream.subscription_count()
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("[FEED] Re-subscribe failed: {}", e);
                                    jittered_pause().await;
                                    continue 'reconnect;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("[FEED] Window updates lagged by {}", n);
                        }
                        Err(_) => return,
                    }
                }
                _ = shutdown.recv() => {
                    info!("[FEED] Order-book worker stopping");
                    return;
                }
            }
        }
    }
}

/// Reference-price worker: streams Binance ticks into the shared buffer.
/// While this worker is down the buffer goes stale and the sniper detector
/// suppresses itself via the health flag.
pub async fn run_reference_worker(
    config: Config,
    reference: Arc<ReferencePrices>,
    router: Arc<FeedRouter>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let client = BinanceWsClient::new(&config.binance_ws_url, &config.assets);

    'reconnect: loop {
        let mut stream = tokio::select! {
            result = client.connect_with_retry(5) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[FEED] Reference connect failed: {}", e);
                    jittered_pause().await;
                    continue 'reconnect;
                }
            },
            _ = shutdown.recv() => return,
        };

        loop {
            tokio::select! {
                tick = stream.next_tick() => {
                    match tick {
                        Some(tick) => {
                            reference.record(tick);
                            router.publish_reference(tick);
                            metrics.record_reference_tick();
                        }
                        None => {
                            warn!("[FEED] Reference stream closed, reconnecting");
                            jittered_pause().await;
                            continue 'reconnect;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("[FEED] Reference worker stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::clob_ws::parse_event;
    use common::models::Asset;
    use common::WindowMarket;
    use rust_decimal_macros::dec;

    use crate::windows::WindowKey;

    const START: i64 = 1_754_055_000;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(START + secs, 0).unwrap()
    }

    fn registry_with_window() -> Arc<WindowRegistry> {
        let registry = Arc::new(WindowRegistry::new(900));
        registry.capture(Asset::Btc, START, dec!(50000));
        registry.set_identity(
            WindowKey::new(Asset::Btc, START),
            &WindowMarket {
                condition_id: "0xc".to_string(),
                question: "q".to_string(),
                end_time: t(900),
                yes_token_id: "tok-yes".to_string(),
                no_token_id: "tok-no".to_string(),
                yes_price: None,
                no_price: None,
            },
        );
        registry
    }

    #[test]
    fn test_book_snapshot_routed_to_ring_and_registry() {
        let registry = registry_with_window();
        let history = PriceHistory::new(&Asset::ALL);
        let router = FeedRouter::new();
        let mut rx = router.subscribe_prices();

        let event = parse_event(
            r#"{
                "event_type": "book",
                "asset_id": "tok-yes",
                "market": "0xc",
                "bids": [{"price": "0.55", "size": "100"}],
                "asks": [{"price": "0.57", "size": "100"}]
            }"#,
        );

        let routed = apply_book_event(&event, &registry, &history, &router, t(10));
        assert_eq!(routed, 1);

        // Ring and registry both saw the mid
        assert_eq!(history.latest(Asset::Btc, Side::Yes).unwrap().price, dec!(0.56));
        let window = registry.get(&WindowKey::new(Asset::Btc, START)).unwrap();
        assert_eq!(window.yes_price, Some(dec!(0.56)));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.asset, Asset::Btc);
        assert_eq!(event.side, Side::Yes);
        assert_eq!(event.price, dec!(0.56));
    }

    #[test]
    fn test_price_change_batch_routed_per_side() {
        let registry = registry_with_window();
        let history = PriceHistory::new(&Asset::ALL);
        let router = FeedRouter::new();

        let event = parse_event(
            r#"{
                "event_type": "price_change",
                "market": "0xc",
                "price_changes": [
                    {"asset_id": "tok-yes", "price": "0.58", "size": "5", "side": "BUY",
                     "best_bid": "0.57", "best_ask": "0.59"},
                    {"asset_id": "tok-no", "price": "0.42", "size": "5", "side": "SELL",
                     "best_bid": "0.41", "best_ask": "0.43"}
                ],
                "timestamp": "0"
            }"#,
        );

        let routed = apply_book_event(&event, &registry, &history, &router, t(11));
        assert_eq!(routed, 2);
        assert_eq!(history.latest(Asset::Btc, Side::Yes).unwrap().price, dec!(0.58));
        assert_eq!(history.latest(Asset::Btc, Side::No).unwrap().price, dec!(0.42));
    }

    #[test]
    fn test_unknown_tokens_ignored() {
        let registry = registry_with_window();
        let history = PriceHistory::new(&Asset::ALL);
        let router = FeedRouter::new();

        let event = parse_event(
            r#"{
                "event_type": "book",
                "asset_id": "tok-other",
                "market": "0xz",
                "bids": [{"price": "0.30", "size": "1"}],
                "asks": [{"price": "0.32", "size": "1"}]
            }"#,
        );

        assert_eq!(apply_book_event(&event, &registry, &history, &router, t(12)), 0);
        assert!(history.latest(Asset::Btc, Side::Yes).is_none());
    }
}
