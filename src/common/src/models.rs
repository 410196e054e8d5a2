//! Shared data models for assets, market sides and persisted records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Tradeable underlying asset. Closed set; extending it means adding a
/// variant plus its symbol mappings below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Sol,
}

impl Asset {
    pub const ALL: [Asset; 3] = [Asset::Btc, Asset::Eth, Asset::Sol];

    /// Canonical uppercase ticker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
        }
    }

    /// Binance spot symbol used by the reference feed.
    pub fn binance_symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "BTCUSDT",
            Asset::Eth => "ETHUSDT",
            Asset::Sol => "SOLUSDT",
        }
    }

    /// Lowercase prefix used in market slugs (`btc-updown-900-...`).
    pub fn slug_prefix(&self) -> &'static str {
        match self {
            Asset::Btc => "btc",
            Asset::Eth => "eth",
            Asset::Sol => "sol",
        }
    }

    /// Reverse lookup from a Binance symbol.
    pub fn from_binance_symbol(symbol: &str) -> Option<Asset> {
        match symbol.to_uppercase().as_str() {
            "BTCUSDT" => Some(Asset::Btc),
            "ETHUSDT" => Some(Asset::Eth),
            "SOLUSDT" => Some(Asset::Sol),
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "SOL" => Ok(Asset::Sol),
            other => Err(format!("unsupported asset: {other}")),
        }
    }
}

/// Binary market outcome side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Yes, Side::No];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            other => Err(format!("unsupported side: {other}")),
        }
    }
}

/// Direction of a price move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("UP"),
            Direction::Down => f.write_str("DOWN"),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    Timeout,
    PhaseCutoff,
    PhaseChange,
    ForceShutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::Timeout => "TIMEOUT",
            ExitReason::PhaseCutoff => "PHASE_CUTOFF",
            ExitReason::PhaseChange => "PHASE_CHANGE",
            ExitReason::ForceShutdown => "FORCE_SHUTDOWN",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "TP" => Ok(ExitReason::TakeProfit),
            "TIMEOUT" => Ok(ExitReason::Timeout),
            "PHASE_CUTOFF" => Ok(ExitReason::PhaseCutoff),
            "PHASE_CHANGE" => Ok(ExitReason::PhaseChange),
            "FORCE_SHUTDOWN" => Ok(ExitReason::ForceShutdown),
            other => Err(format!("unsupported exit reason: {other}")),
        }
    }
}

/// Persisted open-position row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRow {
    pub id: Uuid,
    pub asset: String,
    pub side: String,
    pub token_id: String,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub entry_time: DateTime<Utc>,
    pub phase_at_entry: String,
    pub strategy: String,
    pub state: String,
}

/// Finalised trade, written once when a position closes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: Uuid,
    pub asset: String,
    pub side: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub shares: Decimal,
    pub pnl: Decimal,
    pub exit_reason: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub strategy: String,
}

/// One snapshot per discovered window, capturing the fixed price-to-beat and
/// the odds observed at capture time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WindowSnapshot {
    pub slug: String,
    pub asset: String,
    pub price_to_beat: Decimal,
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
    pub end_time: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_round_trip() {
        for asset in Asset::ALL {
            assert_eq!(asset.as_str().parse::<Asset>().unwrap(), asset);
        }
        assert!("DOGE".parse::<Asset>().is_err());
    }

    #[test]
    fn test_asset_symbol_mappings() {
        assert_eq!(Asset::Btc.binance_symbol(), "BTCUSDT");
        assert_eq!(Asset::from_binance_symbol("ethusdt"), Some(Asset::Eth));
        assert_eq!(Asset::Sol.slug_prefix(), "sol");
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite(), Side::Yes);
    }

    #[test]
    fn test_exit_reason_round_trip() {
        for reason in [
            ExitReason::TakeProfit,
            ExitReason::Timeout,
            ExitReason::PhaseCutoff,
            ExitReason::PhaseChange,
            ExitReason::ForceShutdown,
        ] {
            assert_eq!(reason.as_str().parse::<ExitReason>().unwrap(), reason);
        }
    }
}
