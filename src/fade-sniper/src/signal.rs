//! Entry signals emitted by the detectors.

use common::models::{Asset, Direction, Side};
use rust_decimal::Decimal;

use crate::phase::Phase;
use crate::windows::WindowKey;

/// Fade entry: buy against a sharp order-book move.
#[derive(Debug, Clone)]
pub struct FadeSignal {
    pub window: WindowKey,
    pub condition_id: String,
    pub token_id: String,
    pub asset: Asset,
    /// Side being bought (the one whose price just dropped).
    pub side: Side,
    /// Direction of the move being faded.
    pub faded_direction: Direction,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub phase: Phase,
    pub magnitude: Decimal,
    pub reason: String,
}

/// Snipe entry: buy a confirmed leader in the final seconds.
#[derive(Debug, Clone)]
pub struct SnipeSignal {
    pub window: WindowKey,
    pub condition_id: String,
    pub token_id: String,
    pub asset: Asset,
    pub side: Side,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_loss: Decimal,
    pub phase: Phase,
    /// Reference move from price-to-beat, percent.
    pub move_pct: Decimal,
    pub confidence: f64,
    pub seconds_left: i64,
    pub reason: String,
}

/// Closed set of strategies; dispatch is by variant, not open inheritance.
#[derive(Debug, Clone)]
pub enum Signal {
    Fade(FadeSignal),
    Snipe(SnipeSignal),
}

impl Signal {
    pub fn asset(&self) -> Asset {
        match self {
            Signal::Fade(s) => s.asset,
            Signal::Snipe(s) => s.asset,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            Signal::Fade(s) => s.side,
            Signal::Snipe(s) => s.side,
        }
    }

    pub fn window(&self) -> WindowKey {
        match self {
            Signal::Fade(s) => s.window,
            Signal::Snipe(s) => s.window,
        }
    }

    pub fn token_id(&self) -> &str {
        match self {
            Signal::Fade(s) => &s.token_id,
            Signal::Snipe(s) => &s.token_id,
        }
    }

    pub fn condition_id(&self) -> &str {
        match self {
            Signal::Fade(s) => &s.condition_id,
            Signal::Snipe(s) => &s.condition_id,
        }
    }

    pub fn entry_price(&self) -> Decimal {
        match self {
            Signal::Fade(s) => s.entry_price,
            Signal::Snipe(s) => s.entry_price,
        }
    }

    pub fn target_price(&self) -> Decimal {
        match self {
            Signal::Fade(s) => s.target_price,
            Signal::Snipe(s) => s.target_price,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Signal::Fade(s) => s.phase,
            Signal::Snipe(s) => s.phase,
        }
    }

    pub fn faded_direction(&self) -> Option<Direction> {
        match self {
            Signal::Fade(s) => Some(s.faded_direction),
            Signal::Snipe(_) => None,
        }
    }

    pub fn strategy_tag(&self) -> &'static str {
        match self {
            Signal::Fade(_) => "fade",
            Signal::Snipe(_) => "snipe",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Signal::Fade(s) => &s.reason,
            Signal::Snipe(s) => &s.reason,
        }
    }
}
