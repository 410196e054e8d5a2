//! Sniper detector: buy near-certain winners in the final seconds.
//!
//! A window qualifies when the reference price has moved decisively past the
//! price-to-beat, the winning side's odds sit inside the value band, and the
//! short-horizon reference velocity confirms the direction. Suppressed
//! entirely while the reference feed is unhealthy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::models::Side;
use common::{PhaseConfig, ReferencePrices, SniperConfig};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::info;

use crate::engine::{attempt_entry, EngineContext};
use crate::phase::phase_at;
use crate::signal::{Signal, SnipeSignal};
use crate::windows::{Window, WindowKey};

/// Sniper detector with per-window cooldown state.
pub struct SniperDetector {
    cfg: SniperConfig,
    bounds: PhaseConfig,
    /// Window -> last emission time.
    cooldowns: HashMap<WindowKey, DateTime<Utc>>,
}

impl SniperDetector {
    pub fn new(cfg: SniperConfig, bounds: PhaseConfig) -> Self {
        Self {
            cfg,
            bounds,
            cooldowns: HashMap::new(),
        }
    }

    /// Scan one window for a confirmed-lead snipe.
    pub fn scan_window(
        &mut self,
        window: &Window,
        reference: &ReferencePrices,
        now: DateTime<Utc>,
    ) -> Option<SnipeSignal> {
        let seconds_left = window.seconds_remaining(now);
        if seconds_left < self.cfg.min_time_sec || seconds_left > self.cfg.max_time_sec {
            return None;
        }

        let asset = window.key.asset;
        if !reference.healthy(asset, now) {
            return None;
        }
        if window.price_to_beat.is_zero() {
            return None;
        }
        if !window.has_identity() {
            return None;
        }

        // Per-window cooldown
        if let Some(&last) = self.cooldowns.get(&window.key) {
            if now - last < chrono::Duration::seconds(self.cfg.window_cooldown_sec) {
                return None;
            }
        }

        let current = reference.latest(asset)?;
        let move_pct = (current - window.price_to_beat) / window.price_to_beat * Decimal::ONE_HUNDRED;

        let side = if move_pct > Decimal::ZERO && move_pct.abs() >= self.cfg.min_move_pct(asset) {
            Side::Yes
        } else if move_pct < Decimal::ZERO && move_pct.abs() >= self.cfg.min_move_pct(asset) {
            Side::No
        } else {
            return None;
        };

        let odds = window.price_of(side)?;
        if odds < self.cfg.min_odds || odds > self.cfg.max_odds {
            return None;
        }

        // Momentum confirmation over the trailing velocity window
        let velocity = reference.velocity(asset, self.cfg.velocity_window_sec, now)?;
        let confirmed = match side {
            Side::Yes => velocity >= Decimal::ZERO,
            Side::No => velocity <= Decimal::ZERO,
        };
        if !confirmed {
            return None;
        }

        let token_id = window.token_of(side)?.to_string();
        self.cooldowns.insert(window.key, now);

        let magnitude = move_pct.abs().to_f64().unwrap_or(0.0);
        let time_bonus = (self.cfg.max_time_sec - seconds_left) as f64
            / self.cfg.max_time_sec as f64
            * 0.10;
        let confidence = (0.70 + magnitude * 0.5 + time_bonus).min(0.95);

        Some(SnipeSignal {
            window: window.key,
            condition_id: window.condition_id.clone().unwrap_or_default(),
            token_id,
            asset,
            side,
            entry_price: odds,
            target_price: self.cfg.take_profit,
            stop_loss: self.cfg.stop_loss,
            phase: phase_at(now, window.end_time, &self.bounds),
            move_pct,
            confidence,
            seconds_left,
            reason: format!(
                "reference {:.4}% past price-to-beat with {}s left",
                move_pct, seconds_left
            ),
        })
    }

    /// Drop cooldown slots for pruned windows.
    pub fn retain(&mut self, live: &[WindowKey]) {
        self.cooldowns.retain(|key, _| live.contains(key));
    }
}

/// Sniper scan loop (150 ms cadence).
pub async fn run_sniper_loop(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut detector = SniperDetector::new(ctx.config.sniper.clone(), ctx.config.phases.clone());
    let mut tick = tokio::time::interval(Duration::from_millis(150));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => {
                info!("[SNIPE] Detector stopping");
                return;
            }
        }

        let now = Utc::now();
        let active = ctx.registry.list_active(now);
        detector.retain(&active.iter().map(|w| w.key).collect::<Vec<_>>());

        for window in active {
            let asset = window.key.asset;

            if ctx.positions.any_for_asset(asset)
                || ctx.risk.has_open_position(asset)
                || ctx.risk.entry_locked(asset)
                || ctx.risk.in_cooldown(asset, now)
            {
                continue;
            }

            if let Some(signal) = detector.scan_window(&window, &ctx.reference, now) {
                info!(
                    "[SNIPE] {} buy {} @ {} tp {} sl {} (conf {:.2}, {})",
                    asset,
                    signal.side,
                    signal.entry_price,
                    signal.target_price,
                    signal.stop_loss,
                    signal.confidence,
                    signal.reason
                );
                attempt_entry(&ctx, &Signal::Snipe(signal), now).await;
            }
        }
    }
}
