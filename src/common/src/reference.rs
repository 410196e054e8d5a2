//! Rolling buffer of reference prices per asset.
//!
//! Backs the engine's reference-price interface: current price, price at a
//! past instant (1-second granularity), short-horizon velocity, and a
//! staleness-based health signal. Transport-agnostic; the Binance worker
//! feeds it, an oracle worker could equally.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::models::Asset;

/// One reference price observation.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceTick {
    pub asset: Asset,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Buffer capacity per asset; at ~1 sample/sec this covers 10 minutes.
const CAPACITY: usize = 600;

/// Feed is considered stale when no tick arrived within this horizon.
const MAX_STALENESS_SECS: i64 = 5;

struct AssetBuffer {
    samples: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl AssetBuffer {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(CAPACITY),
        }
    }

    fn record(&mut self, timestamp: DateTime<Utc>, price: Decimal) {
        // Monotonic writes only; late ticks are dropped
        if let Some(&(last_ts, _)) = self.samples.back() {
            if timestamp < last_ts {
                return;
            }
        }
        self.samples.push_back((timestamp, price));
        while self.samples.len() > CAPACITY {
            self.samples.pop_front();
        }
    }

    fn latest(&self) -> Option<(DateTime<Utc>, Decimal)> {
        self.samples.back().copied()
    }

    /// Most recent sample at or before `ts`, within 1 second of it.
    fn at(&self, ts: DateTime<Utc>) -> Option<Decimal> {
        self.samples
            .iter()
            .rev()
            .find(|(sample_ts, _)| *sample_ts <= ts)
            .filter(|(sample_ts, _)| ts - *sample_ts <= Duration::seconds(1))
            .map(|(_, price)| *price)
    }

    /// Price change per second over the trailing `span`.
    fn velocity(&self, span: Duration, now: DateTime<Utc>) -> Option<Decimal> {
        let cutoff = now - span;
        let oldest = self.samples.iter().find(|(ts, _)| *ts >= cutoff)?;
        let newest = self.samples.back()?;

        let elapsed = (newest.0 - oldest.0).num_milliseconds();
        if elapsed <= 0 {
            return Some(Decimal::ZERO);
        }

        let per_ms = (newest.1 - oldest.1) / Decimal::from(elapsed);
        Some(per_ms * Decimal::from(1000))
    }
}

/// Shared reference price store.
pub struct ReferencePrices {
    buffers: HashMap<Asset, Mutex<AssetBuffer>>,
}

impl ReferencePrices {
    pub fn new(assets: &[Asset]) -> Self {
        let buffers = assets
            .iter()
            .map(|&a| (a, Mutex::new(AssetBuffer::new())))
            .collect();
        Self { buffers }
    }

    /// Record an observation. Out-of-order ticks are dropped.
    pub fn record(&self, tick: ReferenceTick) {
        if let Some(buffer) = self.buffers.get(&tick.asset) {
            buffer
                .lock()
                .expect("reference buffer poisoned")
                .record(tick.timestamp, tick.price);
        }
    }

    /// Most recent reference price.
    pub fn latest(&self, asset: Asset) -> Option<Decimal> {
        self.buffers
            .get(&asset)?
            .lock()
            .expect("reference buffer poisoned")
            .latest()
            .map(|(_, price)| price)
    }

    /// Reference price observed at (or within 1 s before) `ts`.
    pub fn at(&self, asset: Asset, ts: DateTime<Utc>) -> Option<Decimal> {
        self.buffers
            .get(&asset)?
            .lock()
            .expect("reference buffer poisoned")
            .at(ts)
    }

    /// Price velocity (units per second) over the trailing window.
    pub fn velocity(&self, asset: Asset, span_secs: i64, now: DateTime<Utc>) -> Option<Decimal> {
        self.buffers
            .get(&asset)?
            .lock()
            .expect("reference buffer poisoned")
            .velocity(Duration::seconds(span_secs), now)
    }

    /// A feed is healthy while its latest tick is fresh.
    pub fn healthy(&self, asset: Asset, now: DateTime<Utc>) -> bool {
        self.buffers
            .get(&asset)
            .and_then(|b| b.lock().expect("reference buffer poisoned").latest())
            .map(|(ts, _)| now - ts <= Duration::seconds(MAX_STALENESS_SECS))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_754_000_000 + secs, 0).unwrap()
    }

    fn store() -> ReferencePrices {
        ReferencePrices::new(&Asset::ALL)
    }

    #[test]
    fn test_latest_and_at() {
        let prices = store();
        for i in 0..10 {
            prices.record(ReferenceTick {
                asset: Asset::Btc,
                price: Decimal::from(50_000 + i),
                timestamp: t(i),
            });
        }

        assert_eq!(prices.latest(Asset::Btc), Some(dec!(50009)));
        assert_eq!(prices.at(Asset::Btc, t(5)), Some(dec!(50005)));
        // Nothing within a second of the requested instant
        assert_eq!(prices.at(Asset::Btc, t(60)), None);
        assert_eq!(prices.latest(Asset::Eth), None);
    }

    #[test]
    fn test_out_of_order_ticks_dropped() {
        let prices = store();
        prices.record(ReferenceTick {
            asset: Asset::Eth,
            price: dec!(2600),
            timestamp: t(10),
        });
        prices.record(ReferenceTick {
            asset: Asset::Eth,
            price: dec!(1),
            timestamp: t(5),
        });

        assert_eq!(prices.latest(Asset::Eth), Some(dec!(2600)));
    }

    #[test]
    fn test_velocity_sign() {
        let prices = store();
        for i in 0..6 {
            prices.record(ReferenceTick {
                asset: Asset::Eth,
                price: Decimal::from(2600 + i),
                timestamp: t(i),
            });
        }

        let v = prices.velocity(Asset::Eth, 5, t(5)).unwrap();
        assert!(v > Decimal::ZERO);

        for i in 6..12 {
            prices.record(ReferenceTick {
                asset: Asset::Eth,
                price: Decimal::from(2620 - i),
                timestamp: t(i),
            });
        }
        let v = prices.velocity(Asset::Eth, 5, t(11)).unwrap();
        assert!(v < Decimal::ZERO);
    }

    #[test]
    fn test_health_tracks_staleness() {
        let prices = store();
        assert!(!prices.healthy(Asset::Sol, t(0)));

        prices.record(ReferenceTick {
            asset: Asset::Sol,
            price: dec!(150),
            timestamp: t(0),
        });
        assert!(prices.healthy(Asset::Sol, t(3)));
        assert!(!prices.healthy(Asset::Sol, t(30)));
    }
}
