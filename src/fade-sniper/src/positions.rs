//! Position manager: owns open positions and decides exits.
//!
//! Exit rules are evaluated in strict priority order: phase cutoff, take
//! profit, timeout, phase change. The evaluator reads positions under the
//! lock, then releases it before any order is submitted.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use common::models::{Asset, Direction, ExitReason, Side};
use common::TradeRecord;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::phase::{phase_at, Phase};
use crate::windows::{Window, WindowKey};
use common::PhaseConfig;

/// One open position, keyed by (asset, side).
#[derive(Debug, Clone)]
pub struct Position {
    pub id: uuid::Uuid,
    pub window: WindowKey,
    pub condition_id: String,
    pub token_id: String,
    pub asset: Asset,
    pub side: Side,
    /// The move being faded; None for snipes.
    pub faded_direction: Option<Direction>,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub shares: Decimal,
    pub target_price: Decimal,
    pub timeout_at: DateTime<Utc>,
    pub phase_at_entry: Phase,
    pub strategy: String,
    pub is_paper: bool,
}

/// A decided exit, ready for the executor.
#[derive(Debug, Clone)]
pub struct ExitIntent {
    pub position: Position,
    pub exit_price: Decimal,
    pub reason: ExitReason,
}

/// Owns all open positions behind one mutex.
#[derive(Default)]
pub struct PositionManager {
    positions: Mutex<HashMap<(Asset, Side), Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a filled position. Returns false if the (asset, side) slot is
    /// already occupied; at most one position exists per slot.
    pub fn open(&self, position: Position) -> bool {
        let mut positions = self.positions.lock().expect("positions poisoned");
        let key = (position.asset, position.side);
        if positions.contains_key(&key) {
            warn!(
                "[POS] Slot {} {} already occupied, dropping duplicate",
                position.asset, position.side
            );
            return false;
        }

        info!(
            "[POS] Open {} {} {} shares @ {} (target {}, strategy {})",
            position.asset,
            position.side,
            position.shares,
            position.entry_price,
            position.target_price,
            position.strategy
        );
        positions.insert(key, position);
        true
    }

    pub fn get(&self, asset: Asset, side: Side) -> Option<Position> {
        self.positions
            .lock()
            .expect("positions poisoned")
            .get(&(asset, side))
            .cloned()
    }

    pub fn any_for_asset(&self, asset: Asset) -> bool {
        self.positions
            .lock()
            .expect("positions poisoned")
            .keys()
            .any(|(a, _)| *a == asset)
    }

    pub fn count(&self) -> usize {
        self.positions.lock().expect("positions poisoned").len()
    }

    pub fn list(&self) -> Vec<Position> {
        self.positions
            .lock()
            .expect("positions poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Remove a position (exit filled or force-closed).
    pub fn remove(&self, asset: Asset, side: Side) -> Option<Position> {
        self.positions
            .lock()
            .expect("positions poisoned")
            .remove(&(asset, side))
    }

    /// Take every open position, for shutdown force-close.
    pub fn drain(&self) -> Vec<Position> {
        let mut positions = self.positions.lock().expect("positions poisoned");
        positions.drain().map(|(_, p)| p).collect()
    }

    /// Evaluate exit rules for all positions. `window_of` resolves the
    /// owning window; a missing window is a state violation and the
    /// position is cut at its last known price.
    pub fn evaluate_exits(
        &self,
        now: DateTime<Utc>,
        bounds: &PhaseConfig,
        window_of: impl Fn(WindowKey) -> Option<Window>,
    ) -> Vec<ExitIntent> {
        let positions: Vec<Position> = self.list();
        let mut intents = Vec::new();

        for position in positions {
            let Some(window) = window_of(position.window) else {
                warn!(
                    "[POS] No window for {} {} position, force-closing",
                    position.asset, position.side
                );
                intents.push(ExitIntent {
                    exit_price: position.entry_price,
                    position,
                    reason: ExitReason::PhaseCutoff,
                });
                continue;
            };

            let current_price = window
                .price_of(position.side)
                .unwrap_or(position.entry_price);
            let phase = phase_at(now, window.end_time, bounds);

            let reason = if phase.forces_exit() {
                Some(ExitReason::PhaseCutoff)
            } else if current_price >= position.target_price {
                Some(ExitReason::TakeProfit)
            } else if now >= position.timeout_at {
                Some(ExitReason::Timeout)
            } else if position.phase_at_entry == Phase::Opening && phase == Phase::DeadZone {
                Some(ExitReason::PhaseChange)
            } else {
                None
            };

            if let Some(reason) = reason {
                intents.push(ExitIntent {
                    position,
                    exit_price: current_price,
                    reason,
                });
            }
        }

        intents
    }
}

/// Build the trade record for a closed position.
pub fn close_record(
    position: &Position,
    exit_price: Decimal,
    reason: ExitReason,
    exit_time: DateTime<Utc>,
) -> TradeRecord {
    let pnl = (exit_price - position.entry_price) * position.shares;
    TradeRecord {
        id: uuid::Uuid::new_v4(),
        asset: position.asset.as_str().to_string(),
        side: position.side.as_str().to_string(),
        entry_price: position.entry_price,
        exit_price,
        shares: position.shares,
        pnl,
        exit_reason: reason.as_str().to_string(),
        entry_time: position.entry_time,
        exit_time,
        strategy: position.strategy.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const START: i64 = 1_754_055_000;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(START + secs, 0).unwrap()
    }

    fn window(yes: Decimal, no: Decimal) -> Window {
        let registry = crate::windows::WindowRegistry::new(900);
        registry.capture(Asset::Btc, START, dec!(50000));
        let key = WindowKey::new(Asset::Btc, START);
        registry.set_identity(
            key,
            &common::WindowMarket {
                condition_id: "0xc".to_string(),
                question: "q".to_string(),
                end_time: t(900),
                yes_token_id: "tok-yes".to_string(),
                no_token_id: "tok-no".to_string(),
                yes_price: Some(yes),
                no_price: Some(no),
            },
        );
        registry.get(&key).unwrap()
    }

    fn fade_position(entry_secs: i64) -> Position {
        Position {
            id: uuid::Uuid::new_v4(),
            window: WindowKey::new(Asset::Btc, START),
            condition_id: "0xc".to_string(),
            token_id: "tok-no".to_string(),
            asset: Asset::Btc,
            side: Side::No,
            faded_direction: Some(Direction::Up),
            entry_price: dec!(0.42),
            entry_time: t(entry_secs),
            shares: dec!(5),
            target_price: dec!(0.445),
            timeout_at: t(entry_secs + 15),
            phase_at_entry: Phase::Opening,
            strategy: "fade".to_string(),
            is_paper: true,
        }
    }

    #[test]
    fn test_one_position_per_slot() {
        let manager = PositionManager::new();
        assert!(manager.open(fade_position(20)));
        assert!(!manager.open(fade_position(21)));
        assert_eq!(manager.count(), 1);
        assert!(manager.any_for_asset(Asset::Btc));
        assert!(!manager.any_for_asset(Asset::Eth));
    }

    #[test]
    fn test_take_profit_exit() {
        // Fade entered at T=20s; at T=22s NO trades at 0.445
        let manager = PositionManager::new();
        manager.open(fade_position(20));
        let w = window(dec!(0.555), dec!(0.445));

        let intents = manager.evaluate_exits(t(22), &PhaseConfig::default(), |_| Some(w.clone()));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::TakeProfit);
        assert_eq!(intents[0].exit_price, dec!(0.445));

        let record = close_record(&intents[0].position, dec!(0.445), intents[0].reason, t(22));
        assert_eq!(record.pnl, dec!(0.125)); // +0.025/share * 5
    }

    #[test]
    fn test_timeout_exit_flat_pnl() {
        // NO never moves; 15 seconds after entry the timeout fires
        let manager = PositionManager::new();
        manager.open(fade_position(20));
        let w = window(dec!(0.58), dec!(0.42));

        let before = manager.evaluate_exits(t(30), &PhaseConfig::default(), |_| Some(w.clone()));
        assert!(before.is_empty());

        let intents = manager.evaluate_exits(t(35), &PhaseConfig::default(), |_| Some(w.clone()));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::Timeout);

        let record = close_record(&intents[0].position, dec!(0.42), intents[0].reason, t(35));
        assert_eq!(record.pnl, Decimal::ZERO);
    }

    #[test]
    fn test_phase_change_exit_at_deadzone_edge() {
        // Opening entry; pin a long timeout to isolate the phase-change rule
        let manager = PositionManager::new();
        let mut position = fade_position(120);
        position.timeout_at = t(10_000);
        manager.open(position);
        let w = window(dec!(0.58), dec!(0.42));

        let intents = manager.evaluate_exits(t(179), &PhaseConfig::default(), |_| Some(w.clone()));
        assert!(intents.is_empty(), "still Opening at 721s remaining");

        let intents = manager.evaluate_exits(t(180), &PhaseConfig::default(), |_| Some(w.clone()));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::PhaseChange);
    }

    #[test]
    fn test_phase_cutoff_beats_take_profit() {
        let manager = PositionManager::new();
        let mut position = fade_position(20);
        position.timeout_at = t(10_000);
        manager.open(position);
        // Price above target AND window in Flat: cutoff wins
        let w = window(dec!(0.50), dec!(0.50));

        let intents = manager.evaluate_exits(t(850), &PhaseConfig::default(), |_| Some(w.clone()));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::PhaseCutoff);
        assert_eq!(intents[0].exit_price, dec!(0.50));
    }

    #[test]
    fn test_missing_window_forces_close() {
        let manager = PositionManager::new();
        manager.open(fade_position(20));

        let intents = manager.evaluate_exits(t(25), &PhaseConfig::default(), |_| None);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].reason, ExitReason::PhaseCutoff);
        assert_eq!(intents[0].exit_price, dec!(0.42));
    }

    #[test]
    fn test_drain_for_shutdown() {
        let manager = PositionManager::new();
        manager.open(fade_position(20));
        let mut other = fade_position(20);
        other.asset = Asset::Eth;
        manager.open(other);

        let drained = manager.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(manager.count(), 0);
    }
}
