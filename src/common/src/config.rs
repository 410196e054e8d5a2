//! Configuration loading from environment variables.

use std::env;
use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::Asset;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Phase boundaries in seconds-remaining, for 15-minute windows.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    /// Opening phase while `seconds_remaining > opening_end_sec`.
    pub opening_end_sec: i64,
    /// Dead zone while `deadzone_end_sec < seconds_remaining <= opening_end_sec`.
    pub deadzone_end_sec: i64,
    /// Closing while `closing_end_sec < seconds_remaining <= deadzone_end_sec`.
    pub closing_end_sec: i64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            opening_end_sec: 720,
            deadzone_end_sec: 180,
            closing_end_sec: 60,
        }
    }
}

/// Fade detector thresholds.
#[derive(Debug, Clone)]
pub struct FadeConfig {
    /// Minimum move magnitude to fade during Opening.
    pub opening_fade: Decimal,
    /// Minimum move magnitude to fade during Closing.
    pub closing_fade: Decimal,
    /// Take-profit delta above entry.
    pub take_profit_delta: Decimal,
    /// Maximum hold before timing out the position.
    pub max_hold_sec: i64,
    /// Lookback for sharp-move detection in Opening.
    pub opening_lookback_sec: i64,
    /// Lookback for sharp-move detection in Closing.
    pub closing_lookback_sec: i64,
    /// Minimum consecutive same-direction moves to confirm an impulse.
    pub min_impulse_moves: u32,
    /// Entry price bounds; signals outside are rejected.
    pub min_entry_price: Decimal,
    pub max_entry_price: Decimal,
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            opening_fade: Decimal::new(6, 2),       // 0.06
            closing_fade: Decimal::new(4, 2),       // 0.04
            take_profit_delta: Decimal::new(25, 3), // 0.025
            max_hold_sec: 15,
            opening_lookback_sec: 30,
            closing_lookback_sec: 20,
            min_impulse_moves: 2,
            min_entry_price: Decimal::new(10, 2), // 0.10
            max_entry_price: Decimal::new(90, 2), // 0.90
        }
    }
}

/// Sniper detector thresholds.
#[derive(Debug, Clone)]
pub struct SniperConfig {
    /// Candidate windows have `seconds_remaining` in [min, max].
    pub min_time_sec: i64,
    pub max_time_sec: i64,
    /// Acceptable odds band for the winning side.
    pub min_odds: Decimal,
    pub max_odds: Decimal,
    /// Exit targets.
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    /// Minimum reference move from price-to-beat, percent, per asset.
    pub min_move_pct_btc: Decimal,
    pub min_move_pct_eth: Decimal,
    pub min_move_pct_sol: Decimal,
    /// Velocity confirmation lookback.
    pub velocity_window_sec: i64,
    /// Per-window re-entry cooldown.
    pub window_cooldown_sec: i64,
}

impl SniperConfig {
    pub fn min_move_pct(&self, asset: Asset) -> Decimal {
        match asset {
            Asset::Btc => self.min_move_pct_btc,
            Asset::Eth => self.min_move_pct_eth,
            Asset::Sol => self.min_move_pct_sol,
        }
    }
}

impl Default for SniperConfig {
    fn default() -> Self {
        Self {
            min_time_sec: 15,
            max_time_sec: 60,
            min_odds: Decimal::new(88, 2),    // 0.88
            max_odds: Decimal::new(93, 2),    // 0.93
            take_profit: Decimal::new(99, 2), // 0.99
            stop_loss: Decimal::new(70, 2),   // 0.70
            min_move_pct_btc: Decimal::new(10, 2),
            min_move_pct_eth: Decimal::new(10, 2),
            min_move_pct_sol: Decimal::new(15, 2),
            velocity_window_sec: 5,
            window_cooldown_sec: 10,
        }
    }
}

/// Risk gate limits.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Cap on a single position as a fraction of balance.
    pub max_position_pct: Decimal,
    /// Daily loss limit as a fraction of the daily start balance.
    pub max_daily_loss_pct: Decimal,
    /// Consecutive losses that trip the circuit breaker.
    pub max_consecutive_losses: u32,
    /// Cooldown after any exit on an asset.
    pub cooldown_sec: i64,
    /// Circuit breaker cooldown.
    pub circuit_cooldown_min: i64,
    /// Losses on one asset before it is disabled for the day.
    pub asset_loss_cap: u32,
    /// Size multiplier applied to Closing-phase entries.
    pub closing_size_factor: Decimal,
    /// Reject entries sized below this many shares.
    pub min_size: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_pct: Decimal::new(25, 2),   // 0.25
            max_daily_loss_pct: Decimal::new(3, 2),  // 0.03
            max_consecutive_losses: 3,
            cooldown_sec: 30,
            circuit_cooldown_min: 30,
            asset_loss_cap: 2,
            closing_size_factor: Decimal::new(7, 1), // 0.7
            min_size: Decimal::ONE,
        }
    }
}

/// Order sizing defaults.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Notional for market-style entries.
    pub market_order_value: Decimal,
    /// Requested shares for limit entries before risk adjustment.
    pub limit_order_shares: Decimal,
    /// Balance used when no exchange balance is available.
    pub initial_balance: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            market_order_value: Decimal::new(110, 2), // $1.10
            limit_order_shares: Decimal::new(5, 0),
            initial_balance: Decimal::new(1000, 0),
        }
    }
}

/// Executor timing knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long to wait for a live order to fill before cancelling.
    pub fill_timeout_ms: u64,
    /// Resubmission attempts after a fill timeout.
    pub max_retries: u32,
    /// Exchange HTTP request timeout.
    pub request_timeout_sec: u64,
    /// Open-order reconciliation interval.
    pub reconcile_interval_sec: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: 500,
            max_retries: 1,
            request_timeout_sec: 30,
            reconcile_interval_sec: 60,
        }
    }
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Gamma API base URL (market metadata).
    pub gamma_api_url: String,
    /// CLOB WebSocket URL (order books).
    pub clob_ws_url: String,
    /// CLOB REST URL (orders, balance).
    pub clob_rest_url: String,
    /// Binance combined-stream WebSocket URL (reference prices).
    pub binance_ws_url: String,

    /// Assets the engine trades.
    pub assets: Vec<Asset>,
    /// Window length in seconds.
    pub interval_secs: i64,

    pub phases: PhaseConfig,
    pub fade: FadeConfig,
    pub sniper: SniperConfig,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub executor: ExecutorConfig,

    /// Simulated execution; no exchange credentials required.
    pub dry_run: bool,
    /// Starting balance for dry-run accounting.
    pub paper_balance: Decimal,

    /// Wallet private key (hex, with or without 0x). Required live.
    pub wallet_private_key: Option<String>,
    /// L2 API credentials. Required live.
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
    /// CTF Exchange contract address for the signing domain.
    pub exchange_address: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no `.env` file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let assets = match env::var("ASSETS") {
            Ok(raw) => {
                let mut parsed = Vec::new();
                for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                    parsed.push(part.parse::<Asset>().map_err(|e| {
                        ConfigError::InvalidValue("ASSETS".to_string(), e)
                    })?);
                }
                if parsed.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "ASSETS".to_string(),
                        raw,
                    ));
                }
                parsed
            }
            Err(_) => Asset::ALL.to_vec(),
        };

        let phases = PhaseConfig {
            opening_end_sec: env_parse("OPENING_END_SEC", PhaseConfig::default().opening_end_sec)?,
            deadzone_end_sec: env_parse(
                "DEADZONE_END_SEC",
                PhaseConfig::default().deadzone_end_sec,
            )?,
            closing_end_sec: env_parse("CLOSING_END_SEC", PhaseConfig::default().closing_end_sec)?,
        };

        let fade_defaults = FadeConfig::default();
        let fade = FadeConfig {
            opening_fade: env_parse("OPENING_FADE", fade_defaults.opening_fade)?,
            closing_fade: env_parse("CLOSING_FADE", fade_defaults.closing_fade)?,
            take_profit_delta: env_parse("TAKE_PROFIT_DELTA", fade_defaults.take_profit_delta)?,
            max_hold_sec: env_parse("MAX_HOLD_SEC", fade_defaults.max_hold_sec)?,
            ..fade_defaults
        };

        let sniper_defaults = SniperConfig::default();
        let sniper = SniperConfig {
            min_time_sec: env_parse("SNIPER_MIN_TIME_SEC", sniper_defaults.min_time_sec)?,
            max_time_sec: env_parse("SNIPER_MAX_TIME_SEC", sniper_defaults.max_time_sec)?,
            min_odds: env_parse("SNIPER_MIN_ODDS", sniper_defaults.min_odds)?,
            max_odds: env_parse("SNIPER_MAX_ODDS", sniper_defaults.max_odds)?,
            take_profit: env_parse("SNIPER_TP", sniper_defaults.take_profit)?,
            stop_loss: env_parse("SNIPER_SL", sniper_defaults.stop_loss)?,
            min_move_pct_btc: env_parse("SNIPER_MIN_MOVE_PCT_BTC", sniper_defaults.min_move_pct_btc)?,
            min_move_pct_eth: env_parse("SNIPER_MIN_MOVE_PCT_ETH", sniper_defaults.min_move_pct_eth)?,
            min_move_pct_sol: env_parse("SNIPER_MIN_MOVE_PCT_SOL", sniper_defaults.min_move_pct_sol)?,
            ..sniper_defaults
        };

        let risk_defaults = RiskConfig::default();
        let risk = RiskConfig {
            max_position_pct: env_parse("MAX_POSITION_PCT", risk_defaults.max_position_pct)?,
            max_daily_loss_pct: env_parse("MAX_DAILY_LOSS_PCT", risk_defaults.max_daily_loss_pct)?,
            max_consecutive_losses: env_parse(
                "MAX_CONSECUTIVE_LOSSES",
                risk_defaults.max_consecutive_losses,
            )?,
            cooldown_sec: env_parse("COOLDOWN_SEC", risk_defaults.cooldown_sec)?,
            circuit_cooldown_min: env_parse(
                "CIRCUIT_COOLDOWN_MIN",
                risk_defaults.circuit_cooldown_min,
            )?,
            asset_loss_cap: env_parse("ASSET_LOSS_CAP", risk_defaults.asset_loss_cap)?,
            ..risk_defaults
        };

        let sizing_defaults = SizingConfig::default();
        let sizing = SizingConfig {
            market_order_value: env_parse("MARKET_ORDER_VALUE", sizing_defaults.market_order_value)?,
            limit_order_shares: env_parse("LIMIT_ORDER_SHARES", sizing_defaults.limit_order_shares)?,
            initial_balance: env_parse("INITIAL_BALANCE", sizing_defaults.initial_balance)?,
        };

        let executor_defaults = ExecutorConfig::default();
        let executor = ExecutorConfig {
            fill_timeout_ms: env_parse("FILL_TIMEOUT_MS", executor_defaults.fill_timeout_ms)?,
            max_retries: env_parse("ORDER_MAX_RETRIES", executor_defaults.max_retries)?,
            ..executor_defaults
        };

        let dry_run = env_parse("DRY_RUN", true)?;
        let paper_balance = env_parse("PAPER_BALANCE", sizing.initial_balance)?;

        Ok(Self {
            database_url,
            gamma_api_url: env_string("GAMMA_API_URL", "https://gamma-api.polymarket.com"),
            clob_ws_url: env_string(
                "CLOB_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws",
            ),
            clob_rest_url: env_string("CLOB_REST_URL", "https://clob.polymarket.com"),
            binance_ws_url: env_string("BINANCE_WS_URL", "wss://stream.binance.com:9443/stream"),
            assets,
            interval_secs: env_parse("WINDOW_INTERVAL_SECS", 900)?,
            phases,
            fade,
            sniper,
            risk,
            sizing,
            executor,
            dry_run,
            paper_balance,
            wallet_private_key: env::var("WALLET_PRIVATE_KEY").ok(),
            api_key: env::var("POLY_API_KEY").ok(),
            api_secret: env::var("POLY_API_SECRET").ok(),
            api_passphrase: env::var("POLY_PASSPHRASE").ok(),
            exchange_address: env_string(
                "CTF_EXCHANGE_ADDRESS",
                "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E",
            ),
        })
    }

    /// Live trading needs a signing key and L2 credentials; refuse to start
    /// without them.
    pub fn validate_live(&self) -> Result<(), ConfigError> {
        if self.dry_run {
            return Ok(());
        }
        for (value, name) in [
            (&self.wallet_private_key, "WALLET_PRIVATE_KEY"),
            (&self.api_key, "POLY_API_KEY"),
            (&self.api_secret, "POLY_API_SECRET"),
            (&self.api_passphrase, "POLY_PASSPHRASE"),
        ] {
            if value.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(ConfigError::MissingVar(name.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_missing_database_url() {
        env::remove_var("DATABASE_URL");

        let result = Config::from_env_only();
        assert!(result.is_err());

        if let Err(ConfigError::MissingVar(var)) = result {
            assert_eq!(var, "DATABASE_URL");
        } else {
            panic!("Expected MissingVar error");
        }
    }

    #[test]
    #[serial]
    fn test_config_with_defaults() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("ASSETS");
        env::remove_var("DRY_RUN");

        let config = Config::from_env_only().unwrap();

        assert_eq!(config.assets, Asset::ALL.to_vec());
        assert_eq!(config.interval_secs, 900);
        assert_eq!(config.phases.opening_end_sec, 720);
        assert_eq!(config.fade.opening_fade, dec!(0.06));
        assert_eq!(config.fade.closing_fade, dec!(0.04));
        assert_eq!(config.sniper.min_odds, dec!(0.88));
        assert_eq!(config.sniper.min_move_pct(Asset::Sol), dec!(0.15));
        assert_eq!(config.risk.max_consecutive_losses, 3);
        assert_eq!(config.sizing.limit_order_shares, dec!(5));
        assert_eq!(config.executor.fill_timeout_ms, 500);
        assert!(config.dry_run);

        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_config_env_overrides() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("ASSETS", "BTC,SOL");
        env::set_var("OPENING_FADE", "0.08");
        env::set_var("COOLDOWN_SEC", "45");

        let config = Config::from_env_only().unwrap();
        assert_eq!(config.assets, vec![Asset::Btc, Asset::Sol]);
        assert_eq!(config.fade.opening_fade, dec!(0.08));
        assert_eq!(config.risk.cooldown_sec, 45);

        env::remove_var("DATABASE_URL");
        env::remove_var("ASSETS");
        env::remove_var("OPENING_FADE");
        env::remove_var("COOLDOWN_SEC");
    }

    #[test]
    #[serial]
    fn test_validate_live_requires_credentials() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("WALLET_PRIVATE_KEY");

        let mut config = Config::from_env_only().unwrap();
        config.dry_run = false;
        assert!(config.validate_live().is_err());

        config.dry_run = true;
        assert!(config.validate_live().is_ok());

        env::remove_var("DATABASE_URL");
    }
}
