//! Per-(asset, side) price history rings with impulse counters.
//!
//! Rings hold the recent odds stream for one side of one asset's current
//! window. Writes are monotonic in time; out-of-order ticks are dropped.
//! Impulse counters track consecutive same-direction changes and feed the
//! fade detector's quality filter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use common::models::{Asset, Direction, Side};
use rust_decimal::Decimal;

/// Ring capacity per (asset, side).
const RING_CAPACITY: usize = 600;

/// One odds observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceTick {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Consecutive same-direction move counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImpulseCounters {
    pub consecutive_moves: u32,
    pub last_direction: Option<Direction>,
}

struct Ring {
    ticks: VecDeque<PriceTick>,
    impulse: ImpulseCounters,
}

impl Ring {
    fn new() -> Self {
        Self {
            ticks: VecDeque::with_capacity(RING_CAPACITY),
            impulse: ImpulseCounters::default(),
        }
    }

    fn record(&mut self, price: Decimal, timestamp: DateTime<Utc>) {
        if let Some(last) = self.ticks.back() {
            if timestamp < last.timestamp {
                return;
            }

            // Unchanged price does not touch the impulse counters
            if price != last.price {
                let direction = if price > last.price {
                    Direction::Up
                } else {
                    Direction::Down
                };
                if self.impulse.last_direction == Some(direction) {
                    self.impulse.consecutive_moves += 1;
                } else {
                    self.impulse.last_direction = Some(direction);
                    self.impulse.consecutive_moves = 1;
                }
            }
        }

        self.ticks.push_back(PriceTick { price, timestamp });
        while self.ticks.len() > RING_CAPACITY {
            self.ticks.pop_front();
        }
    }

    fn latest(&self) -> Option<PriceTick> {
        self.ticks.back().copied()
    }

    /// Oldest tick with timestamp >= now - lookback.
    fn oldest_within(&self, lookback: Duration, now: DateTime<Utc>) -> Option<PriceTick> {
        let cutoff = now - lookback;
        self.ticks.iter().find(|t| t.timestamp >= cutoff).copied()
    }

    fn window(&self, lookback: Duration, now: DateTime<Utc>) -> Vec<PriceTick> {
        let cutoff = now - lookback;
        self.ticks
            .iter()
            .filter(|t| t.timestamp >= cutoff)
            .copied()
            .collect()
    }

    fn reset(&mut self) {
        self.ticks.clear();
        self.impulse = ImpulseCounters::default();
    }
}

/// Shared price history. One fine-grained lock per (asset, side); the key set
/// is fixed at construction so the outer map is never mutated.
pub struct PriceHistory {
    rings: HashMap<(Asset, Side), Mutex<Ring>>,
}

impl PriceHistory {
    pub fn new(assets: &[Asset]) -> Self {
        let mut rings = HashMap::new();
        for &asset in assets {
            for side in Side::BOTH {
                rings.insert((asset, side), Mutex::new(Ring::new()));
            }
        }
        Self { rings }
    }

    /// Append a tick. Out-of-order ticks are dropped.
    pub fn record(&self, asset: Asset, side: Side, price: Decimal, timestamp: DateTime<Utc>) {
        if let Some(ring) = self.rings.get(&(asset, side)) {
            ring.lock().expect("price ring poisoned").record(price, timestamp);
        }
    }

    /// Latest tick for one side.
    pub fn latest(&self, asset: Asset, side: Side) -> Option<PriceTick> {
        self.rings
            .get(&(asset, side))?
            .lock()
            .expect("price ring poisoned")
            .latest()
    }

    /// Oldest tick inside the lookback window.
    pub fn oldest_within(
        &self,
        asset: Asset,
        side: Side,
        lookback_secs: i64,
        now: DateTime<Utc>,
    ) -> Option<PriceTick> {
        self.rings
            .get(&(asset, side))?
            .lock()
            .expect("price ring poisoned")
            .oldest_within(Duration::seconds(lookback_secs), now)
    }

    /// Every tick inside the lookback window, oldest first.
    #[allow(dead_code)]
    pub fn history(
        &self,
        asset: Asset,
        side: Side,
        lookback_secs: i64,
        now: DateTime<Utc>,
    ) -> Vec<PriceTick> {
        self.rings
            .get(&(asset, side))
            .map(|r| {
                r.lock()
                    .expect("price ring poisoned")
                    .window(Duration::seconds(lookback_secs), now)
            })
            .unwrap_or_default()
    }

    /// Current impulse counters for one side.
    pub fn impulse(&self, asset: Asset, side: Side) -> ImpulseCounters {
        self.rings
            .get(&(asset, side))
            .map(|r| r.lock().expect("price ring poisoned").impulse)
            .unwrap_or_default()
    }

    /// Clear both sides for an asset. Called by the registry when the
    /// asset's window rolls over.
    pub fn reset(&self, asset: Asset) {
        for side in Side::BOTH {
            if let Some(ring) = self.rings.get(&(asset, side)) {
                ring.lock().expect("price ring poisoned").reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_754_055_000 + secs, 0).unwrap()
    }

    fn history() -> PriceHistory {
        PriceHistory::new(&Asset::ALL)
    }

    #[test]
    fn test_consecutive_up_moves_counted() {
        let h = history();
        let prices = [dec!(0.50), dec!(0.52), dec!(0.55), dec!(0.58)];
        for (i, p) in prices.iter().enumerate() {
            h.record(Asset::Btc, Side::Yes, *p, t(i as i64));
        }

        let impulse = h.impulse(Asset::Btc, Side::Yes);
        assert_eq!(impulse.consecutive_moves, 3);
        assert_eq!(impulse.last_direction, Some(Direction::Up));
    }

    #[test]
    fn test_direction_change_resets_to_one() {
        let h = history();
        for (i, p) in [dec!(0.50), dec!(0.52), dec!(0.54), dec!(0.53)]
            .iter()
            .enumerate()
        {
            h.record(Asset::Btc, Side::Yes, *p, t(i as i64));
        }

        let impulse = h.impulse(Asset::Btc, Side::Yes);
        assert_eq!(impulse.consecutive_moves, 1);
        assert_eq!(impulse.last_direction, Some(Direction::Down));
    }

    #[test]
    fn test_flat_ticks_do_not_touch_impulse() {
        let h = history();
        for (i, p) in [dec!(0.50), dec!(0.52), dec!(0.52), dec!(0.54)]
            .iter()
            .enumerate()
        {
            h.record(Asset::Eth, Side::No, *p, t(i as i64));
        }

        let impulse = h.impulse(Asset::Eth, Side::No);
        assert_eq!(impulse.consecutive_moves, 2);
        assert_eq!(impulse.last_direction, Some(Direction::Up));
    }

    #[test]
    fn test_out_of_order_ticks_dropped() {
        let h = history();
        h.record(Asset::Sol, Side::Yes, dec!(0.50), t(10));
        h.record(Asset::Sol, Side::Yes, dec!(0.90), t(5));

        assert_eq!(h.latest(Asset::Sol, Side::Yes).unwrap().price, dec!(0.50));
        // Timestamps in the ring stay non-decreasing
        let ticks = h.history(Asset::Sol, Side::Yes, 60, t(11));
        assert!(ticks.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_lookback_window() {
        let h = history();
        for i in 0..40 {
            h.record(Asset::Btc, Side::No, dec!(0.40) + Decimal::new(i, 3), t(i));
        }

        let oldest = h.oldest_within(Asset::Btc, Side::No, 10, t(39)).unwrap();
        assert_eq!(oldest.timestamp, t(29));

        let window = h.history(Asset::Btc, Side::No, 10, t(39));
        assert_eq!(window.len(), 11);
        assert_eq!(window.first().unwrap().timestamp, t(29));
    }

    #[test]
    fn test_ring_capacity_bounded() {
        let h = history();
        for i in 0..(RING_CAPACITY as i64 + 100) {
            h.record(Asset::Btc, Side::Yes, dec!(0.5), t(i));
        }

        let ticks = h.history(Asset::Btc, Side::Yes, 10_000, t(RING_CAPACITY as i64 + 100));
        assert_eq!(ticks.len(), RING_CAPACITY);
    }

    #[test]
    fn test_reset_clears_both_sides() {
        let h = history();
        h.record(Asset::Eth, Side::Yes, dec!(0.5), t(0));
        h.record(Asset::Eth, Side::Yes, dec!(0.6), t(1));
        h.record(Asset::Eth, Side::No, dec!(0.5), t(0));

        h.reset(Asset::Eth);
        assert!(h.latest(Asset::Eth, Side::Yes).is_none());
        assert!(h.latest(Asset::Eth, Side::No).is_none());
        assert_eq!(h.impulse(Asset::Eth, Side::Yes), ImpulseCounters::default());
    }
}
