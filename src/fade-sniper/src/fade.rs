//! Fade detector: buy the opposite of a sharp order-book move.
//!
//! Runs on a 50 ms cadence over the active windows. A sharp move is a
//! threshold-sized price change inside the phase lookback, confirmed by at
//! least two consecutive same-direction ticks. The engine buys the side
//! whose price just dropped and exits on target, timeout or phase cutoff;
//! there is no stop loss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::models::{Direction, Side};
use common::{FadeConfig, PhaseConfig};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::info;

use crate::engine::{attempt_entry, EngineContext};
use crate::history::PriceHistory;
use crate::phase::{phase_at, Phase};
use crate::signal::{FadeSignal, Signal};
use crate::windows::Window;

/// One qualifying sharp move.
#[derive(Debug, Clone, Copy)]
struct SharpMove {
    side: Side,
    magnitude: Decimal,
    direction: Direction,
}

/// Detect a sharp move on one side within the phase lookback.
fn sharp_move(
    history: &PriceHistory,
    window: &Window,
    side: Side,
    lookback_secs: i64,
    cfg: &FadeConfig,
    now: DateTime<Utc>,
) -> Option<SharpMove> {
    let asset = window.key.asset;
    let latest = history.latest(asset, side)?;
    let oldest = history.oldest_within(asset, side, lookback_secs, now)?;

    if latest.price == oldest.price {
        return None;
    }

    // Stale windows (sparse ticks) are not tradable moves
    let duration = (now - oldest.timestamp).num_seconds();
    if duration > lookback_secs + 5 {
        return None;
    }

    let impulse = history.impulse(asset, side);
    if impulse.consecutive_moves < cfg.min_impulse_moves {
        return None;
    }

    let direction = if latest.price > oldest.price {
        Direction::Up
    } else {
        Direction::Down
    };

    Some(SharpMove {
        side,
        magnitude: (latest.price - oldest.price).abs(),
        direction,
    })
}

/// Scan one window for a fade opportunity.
pub fn scan_window(
    cfg: &FadeConfig,
    bounds: &PhaseConfig,
    window: &Window,
    history: &PriceHistory,
    now: DateTime<Utc>,
) -> Option<FadeSignal> {
    let phase = phase_at(now, window.end_time, bounds);
    if !phase.allows_entries() {
        return None;
    }

    if !window.has_identity() {
        return None;
    }

    // YES + NO must sum to ~1 or the quotes are not trustworthy
    if !window.prices_consistent() {
        return None;
    }

    let (lookback, threshold) = match phase {
        Phase::Opening => (cfg.opening_lookback_sec, cfg.opening_fade),
        Phase::Closing => (cfg.closing_lookback_sec, cfg.closing_fade),
        _ => return None,
    };

    let mut candidates: Vec<SharpMove> = Side::BOTH
        .iter()
        .filter_map(|&side| sharp_move(history, window, side, lookback, cfg, now))
        .filter(|m| m.magnitude >= threshold)
        .collect();

    if candidates.is_empty() {
        return None;
    }

    // Largest magnitude wins; on ties prefer YES
    candidates.sort_by(|a, b| {
        b.magnitude
            .cmp(&a.magnitude)
            .then_with(|| match (a.side, b.side) {
                (Side::Yes, Side::No) => std::cmp::Ordering::Less,
                (Side::No, Side::Yes) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            })
    });
    let chosen = candidates[0];

    // Bet on reversion: buy the side whose price just dropped
    let buy_side = match chosen.direction {
        Direction::Up => chosen.side.opposite(),
        Direction::Down => chosen.side,
    };

    let entry_price = history
        .latest(window.key.asset, buy_side)
        .map(|t| t.price)
        .or_else(|| window.price_of(buy_side))?;

    if entry_price < cfg.min_entry_price || entry_price > cfg.max_entry_price {
        return None;
    }

    let token_id = window.token_of(buy_side)?.to_string();

    Some(FadeSignal {
        window: window.key,
        condition_id: window.condition_id.clone().unwrap_or_default(),
        token_id,
        asset: window.key.asset,
        side: buy_side,
        faded_direction: chosen.direction,
        entry_price,
        target_price: entry_price + cfg.take_profit_delta,
        phase,
        magnitude: chosen.magnitude,
        reason: format!(
            "fading {} move of {} on {}",
            chosen.direction, chosen.magnitude, chosen.side
        ),
    })
}

/// Fade scan loop (50 ms cadence).
pub async fn run_fade_loop(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => {
                info!("[FADE] Detector stopping");
                return;
            }
        }

        let now = Utc::now();
        for window in ctx.registry.list_active(now) {
            let asset = window.key.asset;

            // Skip assets that are busy or cooling down before scanning
            if ctx.positions.any_for_asset(asset)
                || ctx.risk.has_open_position(asset)
                || ctx.risk.entry_locked(asset)
                || ctx.risk.in_cooldown(asset, now)
            {
                continue;
            }

            if let Some(signal) =
                scan_window(&ctx.config.fade, &ctx.config.phases, &window, &ctx.history, now)
            {
                info!(
                    "[FADE] {} buy {} @ {} magnitude {} ({})",
                    asset, signal.side, signal.entry_price, signal.magnitude, signal.reason
                );
                attempt_entry(&ctx, &Signal::Fade(signal), now).await;
            }
        }
    }
}
