//! Repository functions for positions, trade records and window snapshots.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PositionRow, TradeRecord, WindowSnapshot};

/// Insert a newly opened position.
pub async fn insert_position(pool: &PgPool, row: &PositionRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO positions
            (id, asset, side, token_id, entry_price, shares, entry_time, phase_at_entry, strategy, state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(row.id)
    .bind(&row.asset)
    .bind(&row.side)
    .bind(&row.token_id)
    .bind(row.entry_price)
    .bind(row.shares)
    .bind(row.entry_time)
    .bind(&row.phase_at_entry)
    .bind(&row.strategy)
    .bind(&row.state)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update a position's lifecycle state.
pub async fn update_position_state(
    pool: &PgPool,
    id: Uuid,
    state: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE positions SET state = $2 WHERE id = $1")
        .bind(id)
        .bind(state)
        .execute(pool)
        .await?;

    Ok(())
}

/// Remove a position once it is closed out.
pub async fn delete_position(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM positions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Load positions still marked open, for startup recovery.
pub async fn load_open_positions(pool: &PgPool) -> Result<Vec<PositionRow>, sqlx::Error> {
    sqlx::query_as::<_, PositionRow>(
        r#"
        SELECT id, asset, side, token_id, entry_price, shares, entry_time,
               phase_at_entry, strategy, state
        FROM positions
        WHERE state = 'open'
        ORDER BY entry_time ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Insert a finalised trade record.
pub async fn insert_trade_record(pool: &PgPool, record: &TradeRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trade_records
            (id, asset, side, entry_price, exit_price, shares, pnl, exit_reason,
             entry_time, exit_time, strategy)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(record.id)
    .bind(&record.asset)
    .bind(&record.side)
    .bind(record.entry_price)
    .bind(record.exit_price)
    .bind(record.shares)
    .bind(record.pnl)
    .bind(&record.exit_reason)
    .bind(record.entry_time)
    .bind(record.exit_time)
    .bind(&record.strategy)
    .execute(pool)
    .await?;

    Ok(())
}

/// Sum of realised PnL for trades that closed on the given UTC day.
/// Used to rehydrate the risk gate after a restart.
pub async fn daily_realized_pnl(
    pool: &PgPool,
    day: DateTime<Utc>,
) -> Result<Decimal, sqlx::Error> {
    let day_start = Utc
        .with_ymd_and_hms(day.year(), day.month(), day.day(), 0, 0, 0)
        .single()
        .unwrap_or(day);
    let day_end = day_start + Duration::days(1);

    let sum: Option<Decimal> = sqlx::query_scalar(
        "SELECT SUM(pnl) FROM trade_records WHERE exit_time >= $1 AND exit_time < $2",
    )
    .bind(day_start)
    .bind(day_end)
    .fetch_one(pool)
    .await?;

    Ok(sum.unwrap_or(Decimal::ZERO))
}

/// Trades that closed on the given UTC day, oldest first.
pub async fn daily_trade_records(
    pool: &PgPool,
    day: DateTime<Utc>,
) -> Result<Vec<TradeRecord>, sqlx::Error> {
    let day_start = Utc
        .with_ymd_and_hms(day.year(), day.month(), day.day(), 0, 0, 0)
        .single()
        .unwrap_or(day);
    let day_end = day_start + Duration::days(1);

    sqlx::query_as::<_, TradeRecord>(
        r#"
        SELECT id, asset, side, entry_price, exit_price, shares, pnl, exit_reason,
               entry_time, exit_time, strategy
        FROM trade_records
        WHERE exit_time >= $1 AND exit_time < $2
        ORDER BY exit_time ASC
        "#,
    )
    .bind(day_start)
    .bind(day_end)
    .fetch_all(pool)
    .await
}

/// Record a window snapshot. The first write wins; the price-to-beat for a
/// slug is never overwritten.
pub async fn insert_window_snapshot(
    pool: &PgPool,
    snapshot: &WindowSnapshot,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO window_snapshots
            (slug, asset, price_to_beat, yes_price, no_price, end_time, captured_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (slug) DO NOTHING
        "#,
    )
    .bind(&snapshot.slug)
    .bind(&snapshot.asset)
    .bind(snapshot.price_to_beat)
    .bind(snapshot.yes_price)
    .bind(snapshot.no_price)
    .bind(snapshot.end_time)
    .bind(snapshot.captured_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a snapshot by slug.
pub async fn get_window_snapshot(
    pool: &PgPool,
    slug: &str,
) -> Result<Option<WindowSnapshot>, sqlx::Error> {
    sqlx::query_as::<_, WindowSnapshot>(
        r#"
        SELECT slug, asset, price_to_beat, yes_price, no_price, end_time, captured_at
        FROM window_snapshots
        WHERE slug = $1
        "#,
    )
    .bind(slug)
    .fetch_optional(pool)
    .await
}

/// Drop snapshots older than the retention horizon.
pub async fn prune_window_snapshots(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM window_snapshots WHERE end_time < $1")
        .bind(older_than)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
