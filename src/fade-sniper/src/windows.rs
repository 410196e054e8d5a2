//! Window registry: tracks active windows, their price-to-beat and identity.
//!
//! A scheduler aligned to UTC interval boundaries captures each new window
//! exactly once. The captured price-to-beat is immutable for the life of the
//! window; re-capture attempts are no-ops.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::models::{Asset, Side};
use common::{window_slug, GammaClient, ReferencePrices, WindowMarket, WindowSnapshot};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::history::PriceHistory;
use crate::persist::PersistHandle;

/// Immutable window identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub asset: Asset,
    pub aligned_start_unix: i64,
}

impl WindowKey {
    pub fn new(asset: Asset, aligned_start_unix: i64) -> Self {
        Self {
            asset,
            aligned_start_unix,
        }
    }
}

/// One binary up/down window.
#[derive(Debug, Clone)]
pub struct Window {
    pub key: WindowKey,
    #[allow(dead_code)]
    pub interval_secs: i64,
    pub slug: String,
    /// Reference price captured at the aligned start; set exactly once.
    pub price_to_beat: Decimal,
    pub end_time: DateTime<Utc>,
    /// Venue identity; resolved from market metadata, possibly after capture.
    pub condition_id: Option<String>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
    /// Latest observed odds per side.
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
    pub active: bool,
    #[allow(dead_code)]
    pub closed: bool,
    last_identity_attempt: Option<DateTime<Utc>>,
}

impl Window {
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds()
    }

    pub fn has_identity(&self) -> bool {
        self.yes_token_id.is_some() && self.no_token_id.is_some()
    }

    pub fn price_of(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Yes => self.yes_price,
            Side::No => self.no_price,
        }
    }

    pub fn token_of(&self, side: Side) -> Option<&str> {
        match side {
            Side::Yes => self.yes_token_id.as_deref(),
            Side::No => self.no_token_id.as_deref(),
        }
    }

    /// YES and NO should sum to ~1; reject quotes outside the band.
    pub fn prices_consistent(&self) -> bool {
        match (self.yes_price, self.no_price) {
            (Some(yes), Some(no)) => {
                (yes + no - Decimal::ONE).abs() < Decimal::new(2, 2) // 0.02
            }
            _ => false,
        }
    }
}

/// Registry events for subscribers.
#[derive(Debug, Clone)]
pub enum WindowUpdate {
    /// New window captured with its price-to-beat.
    Captured(WindowKey),
    /// Venue identity (tokens) resolved.
    IdentityResolved(WindowKey),
    /// Window removed after resolution.
    Pruned(WindowKey),
}

/// Floor a timestamp to its interval boundary.
pub fn aligned_start_unix(now: DateTime<Utc>, interval_secs: i64) -> i64 {
    (now.timestamp() / interval_secs) * interval_secs
}

/// Outcome of a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Created,
    AlreadyCaptured,
}

/// Shared window store. Single writer (the scheduler), many readers.
pub struct WindowRegistry {
    windows: RwLock<HashMap<WindowKey, Window>>,
    /// token id -> (window, side) for order-book tick routing.
    token_index: RwLock<HashMap<String, (WindowKey, Side)>>,
    updates: broadcast::Sender<WindowUpdate>,
    interval_secs: i64,
}

impl WindowRegistry {
    /// Windows are pruned this long after their end time.
    const PRUNE_GRACE_SECS: i64 = 10;

    pub fn new(interval_secs: i64) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            windows: RwLock::new(HashMap::new()),
            token_index: RwLock::new(HashMap::new()),
            updates,
            interval_secs,
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<WindowUpdate> {
        self.updates.subscribe()
    }

    /// Capture a window. Idempotent: a second call for the same key leaves
    /// the original price-to-beat untouched.
    pub fn capture(
        &self,
        asset: Asset,
        aligned_start_unix: i64,
        price_to_beat: Decimal,
    ) -> CaptureOutcome {
        let key = WindowKey::new(asset, aligned_start_unix);
        let mut windows = self.windows.write().expect("window registry poisoned");

        if windows.contains_key(&key) {
            return CaptureOutcome::AlreadyCaptured;
        }

        let end_time = Utc
            .timestamp_opt(aligned_start_unix + self.interval_secs, 0)
            .single()
            .expect("valid window end timestamp");

        let window = Window {
            key,
            interval_secs: self.interval_secs,
            slug: window_slug(asset, self.interval_secs, aligned_start_unix),
            price_to_beat,
            end_time,
            condition_id: None,
            yes_token_id: None,
            no_token_id: None,
            yes_price: None,
            no_price: None,
            active: true,
            closed: false,
            last_identity_attempt: None,
        };

        info!(
            "[WINDOW] Captured {} price_to_beat={} end={}",
            window.slug,
            price_to_beat,
            end_time.format("%H:%M:%S")
        );

        windows.insert(key, window);
        drop(windows);

        let _ = self.updates.send(WindowUpdate::Captured(key));
        CaptureOutcome::Created
    }

    /// Attach venue identity to a captured window.
    pub fn set_identity(&self, key: WindowKey, market: &WindowMarket) {
        let mut windows = self.windows.write().expect("window registry poisoned");
        let Some(window) = windows.get_mut(&key) else {
            return;
        };
        if window.has_identity() {
            return;
        }

        window.condition_id = Some(market.condition_id.clone());
        window.yes_token_id = Some(market.yes_token_id.clone());
        window.no_token_id = Some(market.no_token_id.clone());
        if window.yes_price.is_none() {
            window.yes_price = market.yes_price;
        }
        if window.no_price.is_none() {
            window.no_price = market.no_price;
        }

        let mut index = self.token_index.write().expect("token index poisoned");
        index.insert(market.yes_token_id.clone(), (key, Side::Yes));
        index.insert(market.no_token_id.clone(), (key, Side::No));
        drop(index);
        drop(windows);

        info!("[WINDOW] Identity resolved for {:?}", key);
        let _ = self.updates.send(WindowUpdate::IdentityResolved(key));
    }

    /// Record the identity lookup attempt time for throttling.
    pub fn note_identity_attempt(&self, key: WindowKey, now: DateTime<Utc>) {
        let mut windows = self.windows.write().expect("window registry poisoned");
        if let Some(window) = windows.get_mut(&key) {
            window.last_identity_attempt = Some(now);
        }
    }

    /// Windows lacking identity whose last lookup is older than `min_gap`.
    pub fn identity_backlog(&self, now: DateTime<Utc>, min_gap: chrono::Duration) -> Vec<WindowKey> {
        self.windows
            .read()
            .expect("window registry poisoned")
            .values()
            .filter(|w| {
                !w.has_identity()
                    && w.seconds_remaining(now) > 0
                    && w.last_identity_attempt
                        .map(|t| now - t >= min_gap)
                        .unwrap_or(true)
            })
            .map(|w| w.key)
            .collect()
    }

    /// Update the odds of one side from an order-book tick. Returns the
    /// owning window/side when the token is tracked.
    pub fn update_token_price(&self, token_id: &str, price: Decimal) -> Option<(WindowKey, Side)> {
        let (key, side) = *self
            .token_index
            .read()
            .expect("token index poisoned")
            .get(token_id)?;

        let mut windows = self.windows.write().expect("window registry poisoned");
        let window = windows.get_mut(&key)?;
        match side {
            Side::Yes => window.yes_price = Some(price),
            Side::No => window.no_price = Some(price),
        }
        Some((key, side))
    }

    pub fn get(&self, key: &WindowKey) -> Option<Window> {
        self.windows
            .read()
            .expect("window registry poisoned")
            .get(key)
            .cloned()
    }

    /// Windows still inside their lifetime (plus grace), newest first.
    pub fn list_active(&self, now: DateTime<Utc>) -> Vec<Window> {
        let mut active: Vec<Window> = self
            .windows
            .read()
            .expect("window registry poisoned")
            .values()
            .filter(|w| w.active && w.seconds_remaining(now) > -Self::PRUNE_GRACE_SECS)
            .cloned()
            .collect();
        active.sort_by_key(|w| std::cmp::Reverse(w.key.aligned_start_unix));
        active
    }

    /// The window currently covering `now` for an asset.
    pub fn current(&self, asset: Asset, now: DateTime<Utc>) -> Option<Window> {
        let aligned = aligned_start_unix(now, self.interval_secs);
        self.get(&WindowKey::new(asset, aligned))
    }

    /// All tracked token ids, for order-book (re)subscription.
    pub fn tracked_tokens(&self) -> Vec<String> {
        self.token_index
            .read()
            .expect("token index poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Remove windows past end + grace. Returns the pruned keys.
    pub fn prune(&self, now: DateTime<Utc>) -> Vec<WindowKey> {
        let mut windows = self.windows.write().expect("window registry poisoned");
        let expired: Vec<WindowKey> = windows
            .values()
            .filter(|w| w.seconds_remaining(now) < -Self::PRUNE_GRACE_SECS)
            .map(|w| w.key)
            .collect();

        if expired.is_empty() {
            return expired;
        }

        let mut index = self.token_index.write().expect("token index poisoned");
        for key in &expired {
            if let Some(window) = windows.remove(key) {
                if let Some(tok) = window.yes_token_id {
                    index.remove(&tok);
                }
                if let Some(tok) = window.no_token_id {
                    index.remove(&tok);
                }
                debug!("[WINDOW] Pruned {}", window.slug);
            }
            let _ = self.updates.send(WindowUpdate::Pruned(*key));
        }

        expired
    }
}

/// Scheduler loop: captures windows at interval boundaries, resolves venue
/// identity, prunes expired windows and resets price history per asset.
pub async fn run_window_scheduler(
    registry: Arc<WindowRegistry>,
    reference: Arc<ReferencePrices>,
    gamma: Arc<GammaClient>,
    history: Arc<PriceHistory>,
    persist: PersistHandle,
    assets: Vec<Asset>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => {
                info!("[WINDOW] Scheduler stopping");
                return;
            }
        }

        let now = Utc::now();
        let interval = registry.interval_secs;
        let aligned = aligned_start_unix(now, interval);
        let boundary = Utc
            .timestamp_opt(aligned, 0)
            .single()
            .expect("valid boundary timestamp");

        for &asset in &assets {
            let key = WindowKey::new(asset, aligned);
            if registry.get(&key).is_some() {
                continue;
            }

            // Price-to-beat must be the reference price observed at (within
            // one second before) the boundary.
            let Some(price_to_beat) = reference.at(asset, boundary) else {
                debug!("[WINDOW] No reference price for {} at boundary yet", asset);
                continue;
            };

            if registry.capture(asset, aligned, price_to_beat) == CaptureOutcome::Created {
                history.reset(asset);

                let window = registry.get(&key).expect("window just captured");
                persist.window_snapshot(WindowSnapshot {
                    slug: window.slug.clone(),
                    asset: asset.as_str().to_string(),
                    price_to_beat,
                    yes_price: window.yes_price,
                    no_price: window.no_price,
                    end_time: window.end_time,
                    captured_at: now,
                });
            }
        }

        // Resolve venue identity for windows that still lack tokens,
        // throttled per window.
        for key in registry.identity_backlog(now, chrono::Duration::seconds(2)) {
            registry.note_identity_attempt(key, now);
            let slug = window_slug(key.asset, interval, key.aligned_start_unix);
            match gamma.fetch_market_by_slug(&slug).await {
                Ok(Some(market)) => registry.set_identity(key, &market),
                Ok(None) => debug!("[WINDOW] Venue has no market for {} yet", slug),
                Err(e) => warn!("[WINDOW] Identity lookup failed for {}: {}", slug, e),
            }
        }

        registry.prune(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn t(unix: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(unix, 0).unwrap()
    }

    #[test]
    fn test_aligned_start() {
        // 1754055000 is a 900-second boundary
        assert_eq!(aligned_start_unix(t(1_754_055_000), 900), 1_754_055_000);
        assert_eq!(aligned_start_unix(t(1_754_055_001), 900), 1_754_055_000);
        assert_eq!(aligned_start_unix(t(1_754_055_899), 900), 1_754_055_000);
        assert_eq!(aligned_start_unix(t(1_754_055_900), 900), 1_754_055_900);
    }

    #[test]
    fn test_capture_is_idempotent() {
        let registry = WindowRegistry::new(900);
        let start = 1_754_055_000;

        assert_eq!(
            registry.capture(Asset::Btc, start, dec!(50000)),
            CaptureOutcome::Created
        );
        // A second capture with a different price must not change anything
        assert_eq!(
            registry.capture(Asset::Btc, start, dec!(60000)),
            CaptureOutcome::AlreadyCaptured
        );

        let window = registry.get(&WindowKey::new(Asset::Btc, start)).unwrap();
        assert_eq!(window.price_to_beat, dec!(50000));
        assert_eq!(window.end_time, t(start + 900));
    }

    #[test]
    fn test_identity_and_token_routing() {
        let registry = WindowRegistry::new(900);
        let start = 1_754_055_000;
        registry.capture(Asset::Eth, start, dec!(2597));
        let key = WindowKey::new(Asset::Eth, start);

        let market = WindowMarket {
            condition_id: "0xc".to_string(),
            question: "Ethereum Up or Down?".to_string(),
            end_time: t(start + 900),
            yes_token_id: "tok-yes".to_string(),
            no_token_id: "tok-no".to_string(),
            yes_price: Some(dec!(0.50)),
            no_price: Some(dec!(0.50)),
        };
        registry.set_identity(key, &market);

        assert_eq!(
            registry.update_token_price("tok-yes", dec!(0.58)),
            Some((key, Side::Yes))
        );
        assert_eq!(registry.update_token_price("tok-unknown", dec!(0.5)), None);

        let window = registry.get(&key).unwrap();
        assert_eq!(window.yes_price, Some(dec!(0.58)));
        assert_eq!(window.no_price, Some(dec!(0.50)));
        assert!(window.has_identity());

        let mut tokens = registry.tracked_tokens();
        tokens.sort();
        assert_eq!(tokens, vec!["tok-no".to_string(), "tok-yes".to_string()]);
    }

    #[test]
    fn test_prices_consistent_band() {
        let registry = WindowRegistry::new(900);
        let start = 1_754_055_000;
        registry.capture(Asset::Btc, start, dec!(50000));
        let key = WindowKey::new(Asset::Btc, start);

        let market = WindowMarket {
            condition_id: "0xc".to_string(),
            question: "q".to_string(),
            end_time: t(start + 900),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            yes_price: Some(dec!(0.58)),
            no_price: Some(dec!(0.42)),
        };
        registry.set_identity(key, &market);
        assert!(registry.get(&key).unwrap().prices_consistent());

        registry.update_token_price("y", dec!(0.80));
        assert!(!registry.get(&key).unwrap().prices_consistent());
    }

    #[test]
    fn test_prune_after_grace() {
        let registry = WindowRegistry::new(900);
        let start = 1_754_055_000;
        registry.capture(Asset::Sol, start, dec!(150));
        let key = WindowKey::new(Asset::Sol, start);

        // Inside lifetime and inside grace: kept
        assert!(registry.prune(t(start + 900)).is_empty());
        assert!(registry.prune(t(start + 909)).is_empty());
        assert_eq!(registry.list_active(t(start + 100)).len(), 1);

        // Past end + 10s: removed
        let pruned = registry.prune(t(start + 911));
        assert_eq!(pruned, vec![key]);
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn test_current_window_lookup() {
        let registry = WindowRegistry::new(900);
        let start = 1_754_055_000;
        registry.capture(Asset::Btc, start, dec!(50000));

        assert!(registry.current(Asset::Btc, t(start + 450)).is_some());
        assert!(registry.current(Asset::Btc, t(start + 950)).is_none());
        assert!(registry.current(Asset::Eth, t(start + 450)).is_none());
    }
}
