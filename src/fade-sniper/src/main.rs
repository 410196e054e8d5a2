//! Fade-sniper: phase-aware trading engine for 15-minute binary windows.
//!
//! Two detectors share one pipeline: the fade detector buys against sharp
//! order-book moves in the opening and closing phases, the sniper buys
//! confirmed leaders in the final minute. Every entry passes the central
//! risk gate; every exit is deterministic (target, timeout, phase cutoff).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::models::Asset;
use common::{
    ClobRestClient, Config, Database, ExchangeCredentials, GammaClient, OrderSigner,
    ReferencePrices,
};

mod engine;
mod executor;
mod fade;
mod feed;
mod history;
mod metrics;
mod persist;
mod phase;
mod positions;
mod risk;
mod signal;
mod sniper;
mod windows;

use engine::EngineContext;
use executor::{Executor, LiveExchange, PaperExchange};
use feed::FeedRouter;
use history::PriceHistory;
use metrics::Metrics;
use positions::PositionManager;
use risk::RiskGate;
use windows::WindowRegistry;

/// Phase-aware fade-and-snipe trading engine
#[derive(Parser, Debug)]
#[command(name = "fade-sniper")]
#[command(about = "Trades 15-minute binary up/down windows: fades overreactions, snipes confirmed leads")]
struct Args {
    /// Force dry-run mode (simulated fills)
    #[arg(long)]
    dry_run: bool,

    /// Force live trading (overrides DRY_RUN=true)
    #[arg(long)]
    live: bool,

    /// Assets to trade (comma-separated, overrides ASSETS)
    #[arg(long)]
    assets: Option<String>,

    /// Paper balance for dry-run accounting
    #[arg(long)]
    paper_balance: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.dry_run && args.live {
        bail!("--dry-run and --live are mutually exclusive");
    }

    let mut config = Config::from_env()?;
    if args.dry_run {
        config.dry_run = true;
    }
    if args.live {
        config.dry_run = false;
    }
    if let Some(ref assets) = args.assets {
        let mut parsed = Vec::new();
        for part in assets.split(',').filter(|p| !p.trim().is_empty()) {
            parsed.push(Asset::from_str(part).map_err(|e| anyhow::anyhow!(e))?);
        }
        if parsed.is_empty() {
            bail!("no valid assets in --assets");
        }
        config.assets = parsed;
    }
    if let Some(balance) = args.paper_balance {
        config.paper_balance =
            Decimal::try_from(balance).context("Invalid --paper-balance")?;
    }

    // A live engine without a signing key must not start
    config.validate_live()?;

    info!("=== Fade-Sniper Engine ===");
    info!("Assets: {:?}", config.assets);
    info!("Window interval: {}s", config.interval_secs);
    info!(
        "Fade thresholds: opening {} / closing {} (tp +{}, hold {}s)",
        config.fade.opening_fade,
        config.fade.closing_fade,
        config.fade.take_profit_delta,
        config.fade.max_hold_sec
    );
    info!(
        "Sniper: {}-{}s, odds {}-{}",
        config.sniper.min_time_sec,
        config.sniper.max_time_sec,
        config.sniper.min_odds,
        config.sniper.max_odds
    );
    info!(
        "Risk: pos {}% / daily loss {}% / {} consec losses / {}s cooldown",
        config.risk.max_position_pct * Decimal::ONE_HUNDRED,
        config.risk.max_daily_loss_pct * Decimal::ONE_HUNDRED,
        config.risk.max_consecutive_losses,
        config.risk.cooldown_sec
    );
    info!("Dry run: {}", config.dry_run);

    let db = Database::connect(&config).await.context("database connect")?;
    db.ensure_schema().await.context("schema init")?;
    db.health_check().await.context("store health check")?;
    info!("Connected to database");

    // Shared components
    let registry = Arc::new(WindowRegistry::new(config.interval_secs));
    let history = Arc::new(PriceHistory::new(&config.assets));
    let reference = Arc::new(ReferencePrices::new(&config.assets));
    let positions = Arc::new(PositionManager::new());
    let metrics = Arc::new(Metrics::new());
    let router = Arc::new(FeedRouter::new());
    let gamma = Arc::new(GammaClient::new(&config));

    let initial_balance = if config.dry_run {
        config.paper_balance
    } else {
        config.sizing.initial_balance
    };
    let risk = Arc::new(RiskGate::new(
        config.risk.clone(),
        initial_balance,
        chrono::Utc::now(),
    ));

    // Execution backend
    let api: Arc<dyn executor::ExchangeApi> = if config.dry_run {
        Arc::new(PaperExchange::new(config.paper_balance))
    } else {
        let signer = OrderSigner::new(
            config.wallet_private_key.as_deref().expect("validated above"),
            &config.exchange_address,
        )
        .context("order signer")?;
        let rest = ClobRestClient::new(
            &config.clob_rest_url,
            ExchangeCredentials {
                api_key: config.api_key.clone().expect("validated above"),
                secret: config.api_secret.clone().expect("validated above"),
                passphrase: config.api_passphrase.clone().expect("validated above"),
            },
            signer.address_hex(),
            config.executor.request_timeout_sec,
        )
        .context("rest client")?;
        Arc::new(LiveExchange::new(rest, signer))
    };
    let exec = Arc::new(Executor::new(api, &config.executor));

    // Persister
    let (persist, persist_rx) = persist::channel(1024);
    let persister = tokio::spawn(persist::run_persister(db.clone(), persist_rx));

    // Startup recovery: open positions and today's realised PnL
    let (recovered, daily_pnl) = persist::recover(
        &db,
        config.interval_secs,
        config.fade.max_hold_sec,
        config.fade.take_profit_delta,
        config.dry_run,
    )
    .await
    .context("recovery")?;
    let recovered_assets: Vec<Asset> = recovered.iter().map(|p| p.asset).collect();
    for position in recovered {
        positions.open(position);
    }
    risk.rehydrate(daily_pnl, &recovered_assets);

    let ctx = Arc::new(EngineContext {
        config: config.clone(),
        registry: registry.clone(),
        history: history.clone(),
        reference: reference.clone(),
        risk: risk.clone(),
        positions: positions.clone(),
        executor: exec.clone(),
        persist: persist.clone(),
        metrics: metrics.clone(),
    });

    // Task fleet
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(feed::run_reference_worker(
        config.clone(),
        reference.clone(),
        router.clone(),
        metrics.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(feed::run_orderbook_worker(
        config.clone(),
        registry.clone(),
        history.clone(),
        router.clone(),
        metrics.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(windows::run_window_scheduler(
        registry.clone(),
        reference.clone(),
        gamma.clone(),
        history.clone(),
        persist.clone(),
        config.assets.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(fade::run_fade_loop(
        ctx.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(sniper::run_sniper_loop(
        ctx.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(engine::run_exit_loop(
        ctx.clone(),
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(executor::run_reconciliation_loop(
        exec.clone(),
        config.executor.reconcile_interval_sec,
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(engine::run_heartbeat(
        ctx.clone(),
        shutdown_tx.subscribe(),
    )));
    if !config.dry_run {
        tasks.push(tokio::spawn(engine::run_balance_sync(
            ctx.clone(),
            shutdown_tx.subscribe(),
        )));
    }

    info!("=== Engine running, press Ctrl+C to stop ===");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Stop entries, then unwind: cancel pending orders, force-close
    // positions, flush the persister.
    let _ = shutdown_tx.send(());
    engine::shutdown_close_all(&ctx).await;

    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Task did not stop within 5s");
        }
    }

    metrics.print_summary();
    info!(
        "Final: balance={} daily_pnl={}",
        risk.balance(),
        risk.daily_pnl()
    );

    // Dropping the last persist handles lets the flusher drain and exit
    drop(ctx);
    drop(persist);
    if tokio::time::timeout(Duration::from_secs(10), persister).await.is_err() {
        error!("Persister did not flush within 10s");
    }

    info!("Shutdown complete");
    Ok(())
}
