//! Persister: a single writer task fed by a command channel.
//!
//! Callers never block on the database; they enqueue commands and the
//! flusher applies them in order. On startup the engine reloads open
//! positions and rehydrates the risk gate from today's trade records.

use std::str::FromStr;

use chrono::{Duration, Utc};
use common::models::{Asset, Side};
use common::{Database, PositionRow, TradeRecord, WindowSnapshot};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::phase::Phase;
use crate::positions::Position;
use crate::windows::{aligned_start_unix, WindowKey};

/// Commands accepted by the persister task.
#[derive(Debug)]
pub enum PersistCmd {
    OpenPosition(PositionRow),
    ClosePosition { id: uuid::Uuid },
    Trade(TradeRecord),
    WindowSnapshot(WindowSnapshot),
}

/// Cloneable sender half handed to the rest of the engine.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistCmd>,
}

impl PersistHandle {
    pub fn open_position(&self, row: PositionRow) {
        self.send(PersistCmd::OpenPosition(row));
    }

    pub fn close_position(&self, id: uuid::Uuid) {
        self.send(PersistCmd::ClosePosition { id });
    }

    pub fn trade(&self, record: TradeRecord) {
        self.send(PersistCmd::Trade(record));
    }

    pub fn window_snapshot(&self, snapshot: WindowSnapshot) {
        self.send(PersistCmd::WindowSnapshot(snapshot));
    }

    fn send(&self, cmd: PersistCmd) {
        if let Err(e) = self.tx.try_send(cmd) {
            // Dropping a persistence command is loud but not fatal
            error!("[PERSIST] Queue full or closed, dropping command: {}", e);
        }
    }
}

/// Build the channel pair. The receiver goes to `run_persister`.
pub fn channel(capacity: usize) -> (PersistHandle, mpsc::Receiver<PersistCmd>) {
    let (tx, rx) = mpsc::channel(capacity);
    (PersistHandle { tx }, rx)
}

/// Flusher task: drains the command channel until every sender is dropped,
/// which is the shutdown flush.
pub async fn run_persister(db: Database, mut rx: mpsc::Receiver<PersistCmd>) {
    while let Some(cmd) = rx.recv().await {
        let result = match &cmd {
            PersistCmd::OpenPosition(row) => common::insert_position(db.pool(), row).await,
            PersistCmd::ClosePosition { id } => common::delete_position(db.pool(), *id).await,
            PersistCmd::Trade(record) => common::insert_trade_record(db.pool(), record).await,
            PersistCmd::WindowSnapshot(snapshot) => {
                common::insert_window_snapshot(db.pool(), snapshot).await
            }
        };

        if let Err(e) = result {
            error!("[PERSIST] Write failed for {:?}: {}", cmd, e);
        }
    }

    info!("[PERSIST] Channel drained, flusher exiting");
}

/// Serialise an open position into its row form.
pub fn position_row(position: &Position) -> PositionRow {
    PositionRow {
        id: position.id,
        asset: position.asset.as_str().to_string(),
        side: position.side.as_str().to_string(),
        token_id: position.token_id.clone(),
        entry_price: position.entry_price,
        shares: position.shares,
        entry_time: position.entry_time,
        phase_at_entry: position.phase_at_entry.as_str().to_string(),
        strategy: position.strategy.clone(),
        state: "open".to_string(),
    }
}

/// Rebuild an in-memory position from a recovered row. Fields the row does
/// not carry (window, target, timeout) are reconstructed from config; a
/// recovered position times out promptly so the exit loop closes it if its
/// window is already gone.
pub fn recover_position(
    row: &PositionRow,
    interval_secs: i64,
    max_hold_sec: i64,
    take_profit_delta: rust_decimal::Decimal,
    is_paper: bool,
) -> Option<Position> {
    let asset = match Asset::from_str(&row.asset) {
        Ok(a) => a,
        Err(e) => {
            warn!("[PERSIST] Skipping position {}: {}", row.id, e);
            return None;
        }
    };
    let side = match Side::from_str(&row.side) {
        Ok(s) => s,
        Err(e) => {
            warn!("[PERSIST] Skipping position {}: {}", row.id, e);
            return None;
        }
    };
    let phase_at_entry = Phase::from_str(&row.phase_at_entry).unwrap_or(Phase::Opening);

    let window_start = aligned_start_unix(row.entry_time, interval_secs);

    Some(Position {
        id: row.id,
        window: WindowKey::new(asset, window_start),
        condition_id: String::new(),
        token_id: row.token_id.clone(),
        asset,
        side,
        faded_direction: None,
        entry_price: row.entry_price,
        entry_time: row.entry_time,
        shares: row.shares,
        target_price: row.entry_price + take_profit_delta,
        timeout_at: row.entry_time + Duration::seconds(max_hold_sec),
        phase_at_entry,
        strategy: row.strategy.clone(),
        is_paper,
    })
}

/// Load persisted state at startup: open positions plus today's realised
/// PnL. Returns the recovered positions and the PnL sum.
pub async fn recover(
    db: &Database,
    interval_secs: i64,
    max_hold_sec: i64,
    take_profit_delta: rust_decimal::Decimal,
    is_paper: bool,
) -> anyhow::Result<(Vec<Position>, rust_decimal::Decimal)> {
    let now = Utc::now();

    let rows = common::load_open_positions(db.pool()).await?;
    let positions: Vec<Position> = rows
        .iter()
        .filter_map(|row| {
            recover_position(row, interval_secs, max_hold_sec, take_profit_delta, is_paper)
        })
        .collect();

    let daily_pnl = common::daily_realized_pnl(db.pool(), now).await?;

    if !positions.is_empty() {
        info!(
            "[PERSIST] Recovered {} open positions, daily PnL {}",
            positions.len(),
            daily_pnl
        );
    }

    Ok((positions, daily_pnl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::models::Direction;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_754_055_000 + secs, 0).unwrap()
    }

    fn position() -> Position {
        Position {
            id: uuid::Uuid::new_v4(),
            window: WindowKey::new(Asset::Btc, 1_754_055_000),
            condition_id: "0xc".to_string(),
            token_id: "tok-no".to_string(),
            asset: Asset::Btc,
            side: Side::No,
            faded_direction: Some(Direction::Up),
            entry_price: dec!(0.42),
            entry_time: t(20),
            shares: dec!(5),
            target_price: dec!(0.445),
            timeout_at: t(35),
            phase_at_entry: Phase::Opening,
            strategy: "fade".to_string(),
            is_paper: true,
        }
    }

    #[test]
    fn test_row_round_trip() {
        let original = position();
        let row = position_row(&original);
        assert_eq!(row.state, "open");
        assert_eq!(row.asset, "BTC");
        assert_eq!(row.side, "NO");
        assert_eq!(row.phase_at_entry, "OPENING");

        let recovered = recover_position(&row, 900, 15, dec!(0.025), true).unwrap();
        assert_eq!(recovered.id, original.id);
        assert_eq!(recovered.asset, original.asset);
        assert_eq!(recovered.side, original.side);
        assert_eq!(recovered.entry_price, original.entry_price);
        assert_eq!(recovered.shares, original.shares);
        assert_eq!(recovered.target_price, original.target_price);
        assert_eq!(recovered.timeout_at, original.timeout_at);
        // Window key is derived from the entry time's aligned boundary
        assert_eq!(recovered.window, original.window);
    }

    #[test]
    fn test_recover_skips_bad_rows() {
        let mut row = position_row(&position());
        row.asset = "DOGE".to_string();
        assert!(recover_position(&row, 900, 15, dec!(0.025), true).is_none());
    }

    #[tokio::test]
    async fn test_handle_enqueues_without_blocking() {
        let (handle, mut rx) = channel(8);
        handle.close_position(uuid::Uuid::new_v4());
        handle.trade(crate::positions::close_record(
            &position(),
            dec!(0.445),
            common::ExitReason::TakeProfit,
            t(22),
        ));

        assert!(matches!(
            rx.recv().await,
            Some(PersistCmd::ClosePosition { .. })
        ));
        assert!(matches!(rx.recv().await, Some(PersistCmd::Trade(_))));
    }
}
