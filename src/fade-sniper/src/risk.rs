//! Central risk gate: every entry passes through here, every exit reports
//! back. Owns the process-wide risk state behind one mutex; decisions are
//! serialised and linearisable.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, Utc};
use common::models::{Asset, Side};
use common::RiskConfig;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::phase::Phase;

/// Entry request from a detector.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub asset: Asset,
    pub side: Side,
    pub entry_price: Decimal,
    pub phase: Phase,
    pub strategy: &'static str,
    pub requested_shares: Decimal,
}

/// Gate decision.
#[derive(Debug, Clone)]
pub struct Approval {
    pub approved: bool,
    pub shares: Decimal,
    pub reason: String,
    pub risk_score: f64,
}

impl Approval {
    fn rejected(reason: &str, risk_score: f64) -> Self {
        Self {
            approved: false,
            shares: Decimal::ZERO,
            reason: reason.to_string(),
            risk_score,
        }
    }
}

/// Process-wide risk state.
#[derive(Debug)]
struct RiskState {
    balance: Decimal,
    daily_pnl: Decimal,
    daily_start_balance: Decimal,
    /// (year, ordinal day) of the last daily reset.
    last_reset_day: (i32, u32),
    consecutive_losses: u32,
    circuit_tripped: bool,
    circuit_tripped_at: Option<DateTime<Utc>>,
    loss_count: HashMap<Asset, u32>,
    disabled: HashSet<Asset>,
    last_exit_time: HashMap<Asset, DateTime<Utc>>,
    open_assets: HashSet<Asset>,
    open_position_count: u32,
    /// Per-asset entry locks; held between approval and fill/rejection.
    entry_locks: HashSet<Asset>,
}

/// The gate. `can_enter` and `record_exit` are serialised on the inner lock.
pub struct RiskGate {
    state: Mutex<RiskState>,
    cfg: RiskConfig,
}

impl RiskGate {
    pub fn new(cfg: RiskConfig, initial_balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(RiskState {
                balance: initial_balance,
                daily_pnl: Decimal::ZERO,
                daily_start_balance: initial_balance,
                last_reset_day: (now.year(), now.ordinal()),
                consecutive_losses: 0,
                circuit_tripped: false,
                circuit_tripped_at: None,
                loss_count: HashMap::new(),
                disabled: HashSet::new(),
                last_exit_time: HashMap::new(),
                open_assets: HashSet::new(),
                open_position_count: 0,
                entry_locks: HashSet::new(),
            }),
            cfg,
        }
    }

    /// Ask for approval to open a position. On approval the per-asset entry
    /// lock is held and must be released by `on_fill` or
    /// `release_entry_lock`.
    pub fn can_enter(&self, req: &EntryRequest, now: DateTime<Utc>) -> Approval {
        let mut state = self.state.lock().expect("risk state poisoned");
        Self::maybe_daily_reset(&mut state, now);

        let risk_score = Self::risk_score(&state, &self.cfg);

        if state.circuit_tripped {
            let elapsed_ok = state
                .circuit_tripped_at
                .map(|t| now - t >= Duration::minutes(self.cfg.circuit_cooldown_min))
                .unwrap_or(true);
            if elapsed_ok {
                info!("[RISK] Circuit breaker cooldown elapsed, resetting");
                state.circuit_tripped = false;
                state.circuit_tripped_at = None;
                state.consecutive_losses = 0;
            } else {
                return Approval::rejected("circuit breaker active", risk_score);
            }
        }

        if Self::daily_limit_hit(&state, &self.cfg) {
            return Approval::rejected("daily loss limit hit", risk_score);
        }

        if state.disabled.contains(&req.asset) {
            return Approval::rejected("asset disabled after repeated losses", risk_score);
        }

        if state.open_assets.contains(&req.asset) {
            return Approval::rejected("open position exists on asset", risk_score);
        }

        if state.entry_locks.contains(&req.asset) {
            return Approval::rejected("entry already in flight", risk_score);
        }

        if let Some(&last_exit) = state.last_exit_time.get(&req.asset) {
            if now - last_exit < Duration::seconds(self.cfg.cooldown_sec) {
                return Approval::rejected("post-exit cooldown active", risk_score);
            }
        }

        if req.entry_price <= Decimal::ZERO {
            return Approval::rejected("entry price not positive", risk_score);
        }

        // Size adjustments, applied in order
        let mut shares = req.requested_shares;
        let cap = self.cfg.max_position_pct * state.balance / req.entry_price;
        if shares > cap {
            shares = cap;
        }
        if req.phase == Phase::Closing {
            shares *= self.cfg.closing_size_factor;
        }
        shares = shares.round_dp(2);

        if shares < self.cfg.min_size {
            return Approval::rejected("adjusted size below minimum", risk_score);
        }

        state.entry_locks.insert(req.asset);

        Approval {
            approved: true,
            shares,
            reason: "ok".to_string(),
            risk_score,
        }
    }

    /// Release the entry lock without a fill (rejection or order timeout).
    pub fn release_entry_lock(&self, asset: Asset) {
        let mut state = self.state.lock().expect("risk state poisoned");
        state.entry_locks.remove(&asset);
    }

    /// A fill confirmed: the asset now carries an open position and the
    /// entry lock is cleared.
    pub fn on_fill(&self, asset: Asset) {
        let mut state = self.state.lock().expect("risk state poisoned");
        state.entry_locks.remove(&asset);
        if state.open_assets.insert(asset) {
            state.open_position_count += 1;
        }
    }

    /// Report a closed position's realised PnL.
    pub fn record_exit(&self, asset: Asset, pnl: Decimal, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("risk state poisoned");
        Self::maybe_daily_reset(&mut state, now);

        state.balance += pnl;
        state.daily_pnl += pnl;
        if state.open_assets.remove(&asset) {
            state.open_position_count = state.open_position_count.saturating_sub(1);
        }
        state.entry_locks.remove(&asset);
        state.last_exit_time.insert(asset, now);

        if pnl < Decimal::ZERO {
            state.consecutive_losses += 1;
            let losses = state.loss_count.entry(asset).or_insert(0);
            *losses += 1;

            if *losses >= self.cfg.asset_loss_cap {
                warn!("[RISK] {} disabled for the day after {} losses", asset, losses);
                state.disabled.insert(asset);
            }

            if state.consecutive_losses >= self.cfg.max_consecutive_losses {
                warn!(
                    "[RISK] Circuit breaker tripped after {} consecutive losses",
                    state.consecutive_losses
                );
                state.circuit_tripped = true;
                state.circuit_tripped_at = Some(now);
            }
        } else {
            state.consecutive_losses = 0;
        }
    }

    #[allow(dead_code)]
    pub fn is_daily_limit_hit(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("risk state poisoned");
        Self::maybe_daily_reset(&mut state, now);
        Self::daily_limit_hit(&state, &self.cfg)
    }

    pub fn is_circuit_tripped(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().expect("risk state poisoned");
        if !state.circuit_tripped {
            return false;
        }
        state
            .circuit_tripped_at
            .map(|t| now - t < Duration::minutes(self.cfg.circuit_cooldown_min))
            .unwrap_or(false)
    }

    #[allow(dead_code)]
    pub fn is_asset_disabled(&self, asset: Asset) -> bool {
        self.state
            .lock()
            .expect("risk state poisoned")
            .disabled
            .contains(&asset)
    }

    /// Whether an asset currently holds an open position.
    pub fn has_open_position(&self, asset: Asset) -> bool {
        self.state
            .lock()
            .expect("risk state poisoned")
            .open_assets
            .contains(&asset)
    }

    /// Whether an entry is in flight for an asset.
    pub fn entry_locked(&self, asset: Asset) -> bool {
        self.state
            .lock()
            .expect("risk state poisoned")
            .entry_locks
            .contains(&asset)
    }

    /// Whether an asset sits inside its post-exit cooldown.
    pub fn in_cooldown(&self, asset: Asset, now: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .expect("risk state poisoned")
            .last_exit_time
            .get(&asset)
            .map(|&t| now - t < Duration::seconds(self.cfg.cooldown_sec))
            .unwrap_or(false)
    }

    pub fn balance(&self) -> Decimal {
        self.state.lock().expect("risk state poisoned").balance
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.state.lock().expect("risk state poisoned").daily_pnl
    }

    pub fn open_position_count(&self) -> u32 {
        self.state
            .lock()
            .expect("risk state poisoned")
            .open_position_count
    }

    /// Refresh the sizing balance from the exchange.
    pub fn sync_balance(&self, balance: Decimal) {
        let mut state = self.state.lock().expect("risk state poisoned");
        state.balance = balance;
    }

    /// Rehydrate after restart: today's realised PnL and the assets holding
    /// recovered open positions.
    pub fn rehydrate(&self, daily_pnl: Decimal, open_assets: &[Asset]) {
        let mut state = self.state.lock().expect("risk state poisoned");
        state.daily_pnl = daily_pnl;
        for &asset in open_assets {
            if state.open_assets.insert(asset) {
                state.open_position_count += 1;
            }
        }
    }

    fn daily_limit_hit(state: &RiskState, cfg: &RiskConfig) -> bool {
        state.daily_pnl < -(cfg.max_daily_loss_pct * state.daily_start_balance)
    }

    fn maybe_daily_reset(state: &mut RiskState, now: DateTime<Utc>) {
        let today = (now.year(), now.ordinal());
        if state.last_reset_day == today {
            return;
        }

        info!("[RISK] Daily reset");
        state.daily_pnl = Decimal::ZERO;
        state.daily_start_balance = state.balance;
        state.loss_count.clear();
        state.disabled.clear();
        state.circuit_tripped = false;
        state.circuit_tripped_at = None;
        state.consecutive_losses = 0;
        state.last_reset_day = today;
    }

    fn risk_score(state: &RiskState, cfg: &RiskConfig) -> f64 {
        let loss_part = if cfg.max_consecutive_losses > 0 {
            state.consecutive_losses as f64 / cfg.max_consecutive_losses as f64
        } else {
            0.0
        };

        let limit = cfg.max_daily_loss_pct * state.daily_start_balance;
        let drawdown_part = if limit > Decimal::ZERO && state.daily_pnl < Decimal::ZERO {
            ((-state.daily_pnl) / limit).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        (0.5 * loss_part + 0.5 * drawdown_part).min(1.0)
    }
}
