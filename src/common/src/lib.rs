//! Common library for the fade-sniper trading engine.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Database connection pooling and repositories
//! - Gamma API client (window market metadata)
//! - CLOB order-book WebSocket client
//! - Binance reference-price WebSocket client and price buffer
//! - CLOB REST client with L2 HMAC authentication
//! - EIP-712 order signing

pub mod binance_ws;
pub mod clob_ws;
pub mod config;
pub mod db;
pub mod exchange;
pub mod gamma;
pub mod models;
pub mod reference;
pub mod repository;
pub mod signing;

pub use binance_ws::{BinanceWsClient, BinanceWsStream};
pub use clob_ws::{
    BookEvent, BookMessage, ClobWsError, OrderBookStream, OrderBookWs, PriceChange,
    PriceChangeMessage, PriceLevel,
};
pub use config::{
    Config, ConfigError, ExecutorConfig, FadeConfig, PhaseConfig, RiskConfig, SizingConfig,
    SniperConfig,
};
pub use db::Database;
pub use exchange::{
    ClobRestClient, ExchangeCredentials, ExchangeError, LiveOrder, OrderAck, OrderType,
};
pub use gamma::{window_slug, GammaClient, GammaError, GammaMarket, WindowMarket};
pub use models::{
    Asset, Direction, ExitReason, PositionRow, Side, TradeRecord, WindowSnapshot,
};
pub use reference::{ReferencePrices, ReferenceTick};
pub use repository::{
    daily_realized_pnl, daily_trade_records, delete_position, get_window_snapshot,
    insert_position, insert_trade_record, insert_window_snapshot, load_open_positions,
    prune_window_snapshots, update_position_state,
};
pub use signing::{OrderArgs, OrderSide, OrderSigner, SignError, SignedOrder};
