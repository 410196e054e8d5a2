//! Engine counters and heartbeat summary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use common::models::Asset;
use rust_decimal::Decimal;
use tracing::info;

#[derive(Default)]
struct Counters {
    /// Signals per (asset, strategy tag)
    signals: HashMap<(Asset, &'static str), u32>,
    /// Entries filled per asset
    entries: HashMap<Asset, u32>,
    /// Exits by reason
    exits: HashMap<String, u32>,
    realized_pnl: Decimal,
    wins: u32,
    losses: u32,
    rejections: u32,
    errors: u32,
    price_ticks: u64,
    reference_ticks: u64,
}

/// Shared metrics; updated from every loop, printed at heartbeat.
pub struct Metrics {
    start_time: Instant,
    counters: Mutex<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn record_signal(&self, asset: Asset, strategy: &'static str) {
        let mut c = self.counters.lock().expect("metrics poisoned");
        *c.signals.entry((asset, strategy)).or_insert(0) += 1;
    }

    pub fn record_entry(&self, asset: Asset) {
        let mut c = self.counters.lock().expect("metrics poisoned");
        *c.entries.entry(asset).or_insert(0) += 1;
    }

    pub fn record_exit(&self, reason: &str, pnl: Decimal) {
        let mut c = self.counters.lock().expect("metrics poisoned");
        *c.exits.entry(reason.to_string()).or_insert(0) += 1;
        c.realized_pnl += pnl;
        if pnl >= Decimal::ZERO {
            c.wins += 1;
        } else {
            c.losses += 1;
        }
    }

    pub fn record_rejection(&self) {
        self.counters.lock().expect("metrics poisoned").rejections += 1;
    }

    pub fn record_error(&self) {
        self.counters.lock().expect("metrics poisoned").errors += 1;
    }

    pub fn record_price_tick(&self) {
        self.counters.lock().expect("metrics poisoned").price_ticks += 1;
    }

    pub fn record_reference_tick(&self) {
        self.counters.lock().expect("metrics poisoned").reference_ticks += 1;
    }

    #[allow(dead_code)]
    pub fn total_entries(&self) -> u32 {
        let c = self.counters.lock().expect("metrics poisoned");
        c.entries.values().sum()
    }

    #[allow(dead_code)]
    pub fn realized_pnl(&self) -> Decimal {
        self.counters.lock().expect("metrics poisoned").realized_pnl
    }

    /// Heartbeat summary in the boxed log format.
    pub fn print_summary(&self) {
        let c = self.counters.lock().expect("metrics poisoned");
        let elapsed = self.start_time.elapsed();
        let total_signals: u32 = c.signals.values().sum();
        let total_entries: u32 = c.entries.values().sum();
        let total_trades = c.wins + c.losses;
        let win_rate = if total_trades > 0 {
            (c.wins as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };

        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║              FADE-SNIPER ENGINE METRICS                    ║");
        info!("╠════════════════════════════════════════════════════════════╣");
        info!(
            "║  Uptime:            {:>8.1} minutes                       ║",
            elapsed.as_secs_f64() / 60.0
        );
        info!(
            "║  Signals:           {:>8}                                 ║",
            total_signals
        );
        info!(
            "║  Entries:           {:>8}                                 ║",
            total_entries
        );
        info!(
            "║  Wins / Losses:     {} / {}                                  ║",
            c.wins, c.losses
        );
        info!(
            "║  Win Rate:          {:<6.1}%                               ║",
            win_rate
        );
        info!(
            "║  Realized P&L:      ${:<10.2}                           ║",
            c.realized_pnl
        );
        info!(
            "║  Rejections:        {:>8}                                 ║",
            c.rejections
        );
        info!(
            "║  Errors:            {:>8}                                 ║",
            c.errors
        );
        info!(
            "║  Ticks (book/ref):  {} / {}                              ║",
            c.price_ticks, c.reference_ticks
        );
        info!("╠════════════════════════════════════════════════════════════╣");

        for asset in Asset::ALL {
            let fades = c.signals.get(&(asset, "fade")).copied().unwrap_or(0);
            let snipes = c.signals.get(&(asset, "snipe")).copied().unwrap_or(0);
            let entries = c.entries.get(&asset).copied().unwrap_or(0);
            info!(
                "║    {:<4}: {:>4} fades, {:>4} snipes, {:>4} entries            ║",
                asset.as_str(),
                fades,
                snipes,
                entries
            );
        }

        for (reason, count) in c.exits.iter() {
            info!(
                "║    exit {:<14}: {:>4}                                ║",
                reason, count
            );
        }

        info!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_signal(Asset::Btc, "fade");
        metrics.record_signal(Asset::Btc, "snipe");
        metrics.record_entry(Asset::Btc);
        metrics.record_exit("TP", dec!(0.125));
        metrics.record_exit("TIMEOUT", dec!(-0.05));

        assert_eq!(metrics.total_entries(), 1);
        assert_eq!(metrics.realized_pnl(), dec!(0.075));
    }
}
