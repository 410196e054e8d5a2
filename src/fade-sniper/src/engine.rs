//! Shared engine context and the entry/exit flow every strategy funnels
//! through: risk gate, executor, position manager, persister, metrics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::models::ExitReason;
use common::{Config, ReferencePrices};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::executor::{EntryOrder, EntryOutcome, Executor, ExitOutcome};
use crate::metrics::Metrics;
use crate::persist::{position_row, PersistHandle};
use crate::positions::{close_record, ExitIntent, Position, PositionManager};
use crate::risk::{EntryRequest, RiskGate};
use crate::signal::Signal;
use crate::windows::WindowRegistry;
use crate::history::PriceHistory;

/// Everything the long-lived loops share.
pub struct EngineContext {
    pub config: Config,
    pub registry: Arc<WindowRegistry>,
    pub history: Arc<PriceHistory>,
    pub reference: Arc<ReferencePrices>,
    pub risk: Arc<RiskGate>,
    pub positions: Arc<PositionManager>,
    pub executor: Arc<Executor>,
    pub persist: PersistHandle,
    pub metrics: Arc<Metrics>,
}

impl EngineContext {
    /// Entry-price band the signal must stay inside for a resubmission.
    fn entry_band(&self, signal: &Signal) -> (Decimal, Decimal) {
        match signal {
            Signal::Fade(_) => (
                self.config.fade.min_entry_price,
                self.config.fade.max_entry_price,
            ),
            Signal::Snipe(_) => (self.config.sniper.min_odds, self.config.sniper.max_odds),
        }
    }
}

/// Run a signal through the risk gate and executor. Returns true when a
/// position was opened.
pub async fn attempt_entry(ctx: &EngineContext, signal: &Signal, now: DateTime<Utc>) -> bool {
    ctx.metrics.record_signal(signal.asset(), signal.strategy_tag());

    // At most one pending order per (asset, side)
    if ctx.executor.has_pending(signal.asset(), signal.side()) {
        debug!(
            "[GATE] {} {} already has an order in flight",
            signal.asset(),
            signal.side()
        );
        return false;
    }

    let request = EntryRequest {
        asset: signal.asset(),
        side: signal.side(),
        entry_price: signal.entry_price(),
        phase: signal.phase(),
        strategy: signal.strategy_tag(),
        requested_shares: ctx.config.sizing.limit_order_shares,
    };

    let approval = ctx.risk.can_enter(&request, now);
    if !approval.approved {
        debug!(
            "[GATE] {} {} {} rejected: {}",
            signal.strategy_tag(),
            signal.asset(),
            signal.side(),
            approval.reason
        );
        ctx.metrics.record_rejection();
        return false;
    }

    info!(
        "[GATE] {} {} {} approved: {} shares @ {} (score {:.2}): {}",
        signal.strategy_tag(),
        signal.asset(),
        signal.side(),
        approval.shares,
        signal.entry_price(),
        approval.risk_score,
        signal.reason()
    );

    let condition_id = signal.condition_id().to_string();

    let entry = EntryOrder {
        asset: signal.asset(),
        side: signal.side(),
        token_id: signal.token_id().to_string(),
        limit_price: signal.entry_price(),
        shares: approval.shares,
        phase: signal.phase(),
        market_id: condition_id.clone(),
        faded_direction: signal.faded_direction(),
    };

    let (band_lo, band_hi) = ctx.entry_band(signal);
    let registry = ctx.registry.clone();
    let window_key = signal.window();
    let side = signal.side();
    let still_in_range = move || {
        registry
            .get(&window_key)
            .and_then(|w| w.price_of(side))
            .map(|p| p >= band_lo && p <= band_hi)
            .unwrap_or(false)
    };

    match ctx.executor.submit_entry(&entry, still_in_range).await {
        EntryOutcome::Filled { price, .. } => {
            let fill_time = Utc::now();
            let position = Position {
                id: uuid::Uuid::new_v4(),
                window: signal.window(),
                condition_id,
                token_id: signal.token_id().to_string(),
                asset: signal.asset(),
                side: signal.side(),
                faded_direction: signal.faded_direction(),
                entry_price: price,
                entry_time: fill_time,
                shares: approval.shares,
                target_price: signal.target_price(),
                timeout_at: fill_time
                    + chrono::Duration::seconds(ctx.config.fade.max_hold_sec),
                phase_at_entry: signal.phase(),
                strategy: signal.strategy_tag().to_string(),
                is_paper: ctx.config.dry_run,
            };

            if ctx.positions.open(position.clone()) {
                ctx.risk.on_fill(signal.asset());
                ctx.persist.open_position(position_row(&position));
                ctx.metrics.record_entry(signal.asset());
                true
            } else {
                // Slot already occupied: a state violation, reconcile by
                // releasing the lock and leaving the existing position alone
                warn!(
                    "[GATE] Fill for occupied slot {} {}",
                    signal.asset(),
                    signal.side()
                );
                ctx.risk.release_entry_lock(signal.asset());
                false
            }
        }
        EntryOutcome::NotFilled => {
            ctx.risk.release_entry_lock(signal.asset());
            false
        }
    }
}

/// Execute one exit intent. On failure the position stays tracked and the
/// next evaluator tick retries.
pub async fn process_exit(ctx: &EngineContext, intent: &ExitIntent, now: DateTime<Utc>) {
    let position = &intent.position;

    match ctx
        .executor
        .submit_exit(
            position.asset,
            position.side,
            &position.token_id,
            intent.exit_price,
            position.shares,
        )
        .await
    {
        ExitOutcome::Filled { price } => {
            if ctx
                .positions
                .remove(position.asset, position.side)
                .is_none()
            {
                warn!(
                    "[POS] Exit fill for untracked position {} {}",
                    position.asset, position.side
                );
            }

            let record = close_record(position, price, intent.reason, now);
            info!(
                "[POS] Closed {} {} @ {} ({}) pnl {}",
                position.asset, position.side, price, intent.reason, record.pnl
            );

            ctx.risk.record_exit(position.asset, record.pnl, now);
            ctx.persist.close_position(position.id);
            ctx.metrics.record_exit(&record.exit_reason, record.pnl);
            ctx.persist.trade(record);
        }
        ExitOutcome::Failed => {
            warn!(
                "[POS] Exit failed for {} {} ({}), will retry",
                position.asset, position.side, intent.reason
            );
            ctx.metrics.record_error();
        }
    }
}

/// Position-exit loop (50 ms cadence). Also polls phase transitions so
/// edges show up in the log exactly once.
pub async fn run_exit_loop(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut phases = crate::phase::PhaseTracker::new();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => {
                info!("[POS] Exit loop stopping");
                return;
            }
        }

        let now = Utc::now();

        let active = ctx.registry.list_active(now);
        for window in &active {
            let phase = crate::phase::phase_at(now, window.end_time, &ctx.config.phases);
            if let Some((from, to)) = phases.observe(window.key, phase) {
                info!("[PHASE] {} {} -> {}", window.slug, from, to);
            }
        }
        phases.retain(&active.iter().map(|w| w.key).collect::<Vec<_>>());

        let registry = ctx.registry.clone();
        let intents =
            ctx.positions
                .evaluate_exits(now, &ctx.config.phases, move |key| registry.get(&key));

        for intent in intents {
            process_exit(&ctx, &intent, Utc::now()).await;
        }
    }
}

/// Shutdown path: stop entries upstream, cancel pending orders, then
/// force-close everything still open at its current market price.
pub async fn shutdown_close_all(ctx: &EngineContext) {
    ctx.executor.cancel_all().await;

    let open = ctx.positions.drain();
    if open.is_empty() {
        return;
    }

    info!("[POS] Force-closing {} positions on shutdown", open.len());
    let now = Utc::now();

    for position in open {
        let exit_price = ctx
            .registry
            .get(&position.window)
            .and_then(|w| w.price_of(position.side))
            .unwrap_or(position.entry_price);

        let intent = ExitIntent {
            position: position.clone(),
            exit_price,
            reason: ExitReason::ForceShutdown,
        };

        // The position was drained; put the close through the same path but
        // tolerate the missing slot.
        match ctx
            .executor
            .submit_exit(
                position.asset,
                position.side,
                &position.token_id,
                exit_price,
                position.shares,
            )
            .await
        {
            ExitOutcome::Filled { price } => {
                let record = close_record(&position, price, intent.reason, now);
                info!(
                    "[POS] Shutdown close {} {} @ {} pnl {}",
                    position.asset, position.side, price, record.pnl
                );
                ctx.risk.record_exit(position.asset, record.pnl, now);
                ctx.persist.close_position(position.id);
                ctx.metrics.record_exit(&record.exit_reason, record.pnl);
                ctx.persist.trade(record);
            }
            ExitOutcome::Failed => {
                warn!(
                    "[POS] Shutdown close failed for {} {}; position left persisted",
                    position.asset, position.side
                );
            }
        }
    }
}

/// Heartbeat loop: metrics and engine status every 60 s.
pub async fn run_heartbeat(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => return,
        }

        let now = Utc::now();
        info!(
            "[ALIVE] windows={} positions={} pending={} balance={}",
            ctx.registry.list_active(now).len(),
            ctx.positions.count(),
            ctx.executor.pending_count(),
            ctx.risk.balance()
        );
        ctx.metrics.print_summary();
    }
}

/// Live-mode balance refresh (60 s) feeding the risk gate's sizing balance.
pub async fn run_balance_sync(ctx: Arc<EngineContext>, mut shutdown: broadcast::Receiver<()>) {
    // Give transports a moment before the first fetch
    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => return,
        }

        match ctx.executor.balance().await {
            Ok(balance) => {
                debug!("[RISK] Balance synced: {}", balance);
                ctx.risk.sync_balance(balance);
            }
            Err(e) => debug!("[RISK] Balance fetch failed: {}", e),
        }
    }
}
