//! Order execution: signing, submission, the pending-order state machine,
//! and periodic reconciliation against the exchange.
//!
//! Dry-run mode swaps the live exchange for a paper one that fills every
//! order synthetically at the submitted limit price; downstream components
//! cannot tell the difference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{Asset, Direction, Side};
use common::{
    ClobRestClient, ExchangeError, LiveOrder, OrderAck, OrderArgs, OrderSide, OrderSigner,
    OrderType,
};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::phase::Phase;

/// Pending-order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Filled,
    Cancelled,
    Timeout,
}

/// A tracked order in flight.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct PendingOrder {
    pub order_id: String,
    pub asset: Asset,
    pub side: Side,
    pub token_id: String,
    pub limit_price: Decimal,
    pub shares: Decimal,
    pub submit_time: DateTime<Utc>,
    pub state: OrderState,
    pub retry_count: u32,
    pub phase_at_submit: Phase,
    pub market_id: String,
    pub faded_direction: Option<Direction>,
}

/// Minimal exchange surface the executor drives. The live implementation
/// signs and submits over HTTP; the paper one simulates.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_order(
        &self,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
        side: OrderSide,
        order_type: OrderType,
        post_only: bool,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn cancel_all(&self) -> Result<(), ExchangeError>;

    async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError>;

    async fn balance(&self) -> Result<Decimal, ExchangeError>;
}

/// Live exchange: EIP-712 signing plus the authenticated REST client.
pub struct LiveExchange {
    rest: ClobRestClient,
    signer: OrderSigner,
}

impl LiveExchange {
    pub fn new(rest: ClobRestClient, signer: OrderSigner) -> Self {
        Self { rest, signer }
    }
}

#[async_trait]
impl ExchangeApi for LiveExchange {
    async fn place_order(
        &self,
        token_id: &str,
        price: Decimal,
        shares: Decimal,
        side: OrderSide,
        order_type: OrderType,
        post_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let salt: u64 = rand::thread_rng().gen();
        let signed = self
            .signer
            .sign_order(
                &OrderArgs {
                    token_id: token_id.to_string(),
                    price,
                    shares,
                    side,
                    expiration: 0,
                },
                salt,
            )
            .map_err(|e| ExchangeError::Permanent {
                status: 0,
                message: format!("signing failed: {e}"),
            })?;

        self.rest.post_order(&signed, order_type, post_only).await
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError> {
        self.rest.cancel_order(order_id).await
    }

    async fn cancel_all(&self) -> Result<(), ExchangeError> {
        self.rest.cancel_all().await
    }

    async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError> {
        self.rest.open_orders().await
    }

    async fn balance(&self) -> Result<Decimal, ExchangeError> {
        self.rest.balance().await
    }
}

/// Paper exchange: every order fills instantly at its limit price.
pub struct PaperExchange {
    counter: AtomicU64,
    paper_balance: Decimal,
}

impl PaperExchange {
    pub fn new(paper_balance: Decimal) -> Self {
        Self {
            counter: AtomicU64::new(1),
            paper_balance,
        }
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn place_order(
        &self,
        _token_id: &str,
        _price: Decimal,
        _shares: Decimal,
        _side: OrderSide,
        _order_type: OrderType,
        _post_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(OrderAck {
            order_id: format!("paper-{n}"),
            status: Some("matched".to_string()),
            error_msg: None,
            making_amount: None,
            taking_amount: None,
        })
    }

    async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.paper_balance)
    }
}

/// Inputs for one entry submission.
#[derive(Debug, Clone)]
pub struct EntryOrder {
    pub asset: Asset,
    pub side: Side,
    pub token_id: String,
    pub limit_price: Decimal,
    pub shares: Decimal,
    pub phase: Phase,
    pub market_id: String,
    pub faded_direction: Option<Direction>,
}

/// Result of an entry submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Filled { order_id: String, price: Decimal },
    NotFilled,
}

/// Result of an exit submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Filled { price: Decimal },
    Failed,
}

/// The executor. Owns every pending order.
pub struct Executor {
    api: Arc<dyn ExchangeApi>,
    pending: Mutex<HashMap<String, PendingOrder>>,
    fill_timeout: Duration,
    max_retries: u32,
}

impl Executor {
    pub fn new(api: Arc<dyn ExchangeApi>, cfg: &common::ExecutorConfig) -> Self {
        Self {
            api,
            pending: Mutex::new(HashMap::new()),
            fill_timeout: Duration::from_millis(cfg.fill_timeout_ms),
            max_retries: cfg.max_retries,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending orders poisoned").len()
    }

    pub fn has_pending(&self, asset: Asset, side: Side) -> bool {
        self.pending
            .lock()
            .expect("pending orders poisoned")
            .values()
            .any(|o| o.asset == asset && o.side == side && o.state == OrderState::Pending)
    }

    fn track(&self, order: PendingOrder) {
        self.pending
            .lock()
            .expect("pending orders poisoned")
            .insert(order.order_id.clone(), order);
    }

    fn finish(&self, order_id: &str, state: OrderState) {
        let mut pending = self.pending.lock().expect("pending orders poisoned");
        if let Some(order) = pending.get_mut(order_id) {
            order.state = state;
        }
        // Terminal orders are discarded
        pending.remove(order_id);
    }

    /// Submit a buy entry and drive it to a terminal state. `still_in_range`
    /// re-checks the market before any resubmission.
    pub async fn submit_entry(
        &self,
        entry: &EntryOrder,
        still_in_range: impl Fn() -> bool + Send,
    ) -> EntryOutcome {
        let mut attempt: u32 = 0;

        loop {
            let ack = match self
                .api
                .place_order(
                    &entry.token_id,
                    entry.limit_price,
                    entry.shares,
                    OrderSide::Buy,
                    OrderType::Gtc,
                    false,
                )
                .await
            {
                Ok(ack) => ack,
                Err(e) if e.is_transient() => {
                    warn!("[EXEC] Transient submit error: {}", e);
                    if attempt < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    return EntryOutcome::NotFilled;
                }
                Err(e) => {
                    // Permanent rejection: no retry
                    error!("[EXEC] Entry rejected: {}", e);
                    return EntryOutcome::NotFilled;
                }
            };

            self.track(PendingOrder {
                order_id: ack.order_id.clone(),
                asset: entry.asset,
                side: entry.side,
                token_id: entry.token_id.clone(),
                limit_price: entry.limit_price,
                shares: entry.shares,
                submit_time: Utc::now(),
                state: OrderState::Pending,
                retry_count: attempt,
                phase_at_submit: entry.phase,
                market_id: entry.market_id.clone(),
                faded_direction: entry.faded_direction,
            });

            if ack.is_filled() {
                info!(
                    "[EXEC] Entry filled {} {} {} @ {} (order {})",
                    entry.asset, entry.side, entry.shares, entry.limit_price, ack.order_id
                );
                self.finish(&ack.order_id, OrderState::Filled);
                return EntryOutcome::Filled {
                    order_id: ack.order_id,
                    price: entry.limit_price,
                };
            }

            // Live on the book: bounded wait, then cancel
            tokio::time::sleep(self.fill_timeout).await;

            match self.api.cancel(&ack.order_id).await {
                Ok(()) => {
                    debug!("[EXEC] Entry {} timed out, cancelled", ack.order_id);
                    self.finish(&ack.order_id, OrderState::Timeout);
                }
                Err(e) => {
                    // Cancel of an already-filled order reports permanent;
                    // treat that as the fill it is.
                    if !e.is_transient() {
                        info!("[EXEC] Cancel rejected, order {} filled", ack.order_id);
                        self.finish(&ack.order_id, OrderState::Filled);
                        return EntryOutcome::Filled {
                            order_id: ack.order_id,
                            price: entry.limit_price,
                        };
                    }
                    warn!("[EXEC] Cancel failed for {}: {}", ack.order_id, e);
                    self.finish(&ack.order_id, OrderState::Cancelled);
                }
            }

            if attempt < self.max_retries && still_in_range() {
                attempt += 1;
                debug!("[EXEC] Resubmitting entry (attempt {})", attempt + 1);
                continue;
            }

            return EntryOutcome::NotFilled;
        }
    }

    /// Submit a sell exit. Exits use the same bounded-wait machine but give
    /// up without resubmission; the exit loop re-evaluates on its next tick.
    pub async fn submit_exit(
        &self,
        asset: Asset,
        side: Side,
        token_id: &str,
        limit_price: Decimal,
        shares: Decimal,
    ) -> ExitOutcome {
        let ack = match self
            .api
            .place_order(
                token_id,
                limit_price,
                shares,
                OrderSide::Sell,
                OrderType::Gtc,
                false,
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!("[EXEC] Exit submit failed for {} {}: {}", asset, side, e);
                return ExitOutcome::Failed;
            }
        };

        if ack.is_filled() {
            info!(
                "[EXEC] Exit filled {} {} {} @ {} (order {})",
                asset, side, shares, limit_price, ack.order_id
            );
            return ExitOutcome::Filled { price: limit_price };
        }

        tokio::time::sleep(self.fill_timeout).await;

        match self.api.cancel(&ack.order_id).await {
            Ok(()) => {
                debug!("[EXEC] Exit {} timed out, cancelled", ack.order_id);
                ExitOutcome::Failed
            }
            Err(e) if !e.is_transient() => {
                info!("[EXEC] Cancel rejected, exit {} filled", ack.order_id);
                ExitOutcome::Filled { price: limit_price }
            }
            Err(e) => {
                warn!("[EXEC] Exit cancel failed for {}: {}", ack.order_id, e);
                ExitOutcome::Failed
            }
        }
    }

    /// Cancel everything; used at shutdown.
    pub async fn cancel_all(&self) {
        if let Err(e) = self.api.cancel_all().await {
            warn!("[EXEC] cancel-all failed: {}", e);
        }
        self.pending
            .lock()
            .expect("pending orders poisoned")
            .clear();
    }

    pub async fn balance(&self) -> Result<Decimal, ExchangeError> {
        self.api.balance().await
    }

    /// Reconcile local pending orders against the exchange's live set.
    /// Orphans on the exchange are cancelled; local entries the exchange no
    /// longer knows are dropped.
    pub async fn reconcile(&self) {
        let live = match self.api.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("[EXEC] Reconciliation fetch failed: {}", e);
                return;
            }
        };

        let tracked: Vec<String> = {
            let pending = self.pending.lock().expect("pending orders poisoned");
            pending.keys().cloned().collect()
        };

        for order in &live {
            if !tracked.contains(&order.order_id) {
                warn!("[EXEC] Orphan order {} on exchange, cancelling", order.order_id);
                if let Err(e) = self.api.cancel(&order.order_id).await {
                    warn!("[EXEC] Orphan cancel failed: {}", e);
                }
            }
        }

        let live_ids: Vec<&str> = live.iter().map(|o| o.order_id.as_str()).collect();
        let mut pending = self.pending.lock().expect("pending orders poisoned");
        pending.retain(|id, order| {
            if live_ids.contains(&id.as_str()) {
                true
            } else {
                warn!(
                    "[EXEC] Tracked order {} ({} {}) unknown to exchange, dropping",
                    id, order.asset, order.side
                );
                false
            }
        });
    }
}

/// Periodic reconciliation task.
pub async fn run_reconciliation_loop(
    executor: Arc<Executor>,
    interval_sec: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    // One pass at startup, then on the interval
    executor.reconcile().await;

    let mut tick = tokio::time::interval(Duration::from_secs(interval_sec));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => executor.reconcile().await,
            _ = shutdown.recv() => {
                info!("[EXEC] Reconciliation loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry() -> EntryOrder {
        EntryOrder {
            asset: Asset::Btc,
            side: Side::No,
            token_id: "tok-no".to_string(),
            limit_price: dec!(0.42),
            shares: dec!(5),
            phase: Phase::Opening,
            market_id: "0xc".to_string(),
            faded_direction: Some(Direction::Up),
        }
    }

    fn executor(api: Arc<dyn ExchangeApi>) -> Executor {
        let mut cfg = common::ExecutorConfig::default();
        cfg.fill_timeout_ms = 10;
        Executor::new(api, &cfg)
    }

    #[tokio::test]
    async fn test_paper_entry_fills_at_limit() {
        let exec = executor(Arc::new(PaperExchange::new(dec!(1000))));

        let outcome = exec.submit_entry(&entry(), || true).await;
        match outcome {
            EntryOutcome::Filled { price, order_id } => {
                assert_eq!(price, dec!(0.42));
                assert!(order_id.starts_with("paper-"));
            }
            other => panic!("expected fill, got {:?}", other),
        }
        // Terminal orders leave the pending map
        assert_eq!(exec.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_paper_exit_fills_at_limit() {
        let exec = executor(Arc::new(PaperExchange::new(dec!(1000))));

        let outcome = exec
            .submit_exit(Asset::Btc, Side::No, "tok-no", dec!(0.445), dec!(5))
            .await;
        assert_eq!(outcome, ExitOutcome::Filled { price: dec!(0.445) });
    }

    /// Exchange that leaves every order live on the book.
    struct NeverFills {
        counter: AtomicU64,
        cancels: AtomicU64,
    }

    #[async_trait]
    impl ExchangeApi for NeverFills {
        async fn place_order(
            &self,
            _t: &str,
            _p: Decimal,
            _s: Decimal,
            _side: OrderSide,
            _ot: OrderType,
            _po: bool,
        ) -> Result<OrderAck, ExchangeError> {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(OrderAck {
                order_id: format!("live-{n}"),
                status: Some("live".to_string()),
                error_msg: None,
                making_amount: None,
                taking_amount: None,
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
            self.cancels.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn cancel_all(&self) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn balance(&self) -> Result<Decimal, ExchangeError> {
            Ok(dec!(0))
        }
    }

    #[tokio::test]
    async fn test_unfilled_entry_cancelled_and_retried_once() {
        let api = Arc::new(NeverFills {
            counter: AtomicU64::new(1),
            cancels: AtomicU64::new(0),
        });
        let exec = executor(api.clone());

        let outcome = exec.submit_entry(&entry(), || true).await;
        assert_eq!(outcome, EntryOutcome::NotFilled);
        // Initial submission plus one retry, each cancelled on timeout
        assert_eq!(api.counter.load(Ordering::Relaxed), 3);
        assert_eq!(api.cancels.load(Ordering::Relaxed), 2);
        assert_eq!(exec.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_resubmit_when_out_of_range() {
        let api = Arc::new(NeverFills {
            counter: AtomicU64::new(1),
            cancels: AtomicU64::new(0),
        });
        let exec = executor(api.clone());

        let outcome = exec.submit_entry(&entry(), || false).await;
        assert_eq!(outcome, EntryOutcome::NotFilled);
        assert_eq!(api.counter.load(Ordering::Relaxed), 2);
    }

    /// Exchange that rejects every order with a permanent error.
    struct Rejects;

    #[async_trait]
    impl ExchangeApi for Rejects {
        async fn place_order(
            &self,
            _t: &str,
            _p: Decimal,
            _s: Decimal,
            _side: OrderSide,
            _ot: OrderType,
            _po: bool,
        ) -> Result<OrderAck, ExchangeError> {
            Err(ExchangeError::Permanent {
                status: 400,
                message: "invalid order".to_string(),
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn cancel_all(&self) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn balance(&self) -> Result<Decimal, ExchangeError> {
            Ok(dec!(0))
        }
    }

    #[tokio::test]
    async fn test_permanent_rejection_not_retried() {
        let exec = executor(Arc::new(Rejects));
        let outcome = exec.submit_entry(&entry(), || true).await;
        assert_eq!(outcome, EntryOutcome::NotFilled);
        assert_eq!(exec.pending_count(), 0);
    }

    /// Cancel failing with a permanent error means the order already filled.
    struct FillsOnCancel {
        counter: AtomicU64,
    }

    #[async_trait]
    impl ExchangeApi for FillsOnCancel {
        async fn place_order(
            &self,
            _t: &str,
            _p: Decimal,
            _s: Decimal,
            _side: OrderSide,
            _ot: OrderType,
            _po: bool,
        ) -> Result<OrderAck, ExchangeError> {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(OrderAck {
                order_id: format!("race-{n}"),
                status: Some("live".to_string()),
                error_msg: None,
                making_amount: None,
                taking_amount: None,
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), ExchangeError> {
            Err(ExchangeError::Permanent {
                status: 404,
                message: "order already filled".to_string(),
            })
        }

        async fn cancel_all(&self) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn open_orders(&self) -> Result<Vec<LiveOrder>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn balance(&self) -> Result<Decimal, ExchangeError> {
            Ok(dec!(0))
        }
    }

    #[tokio::test]
    async fn test_cancel_race_counts_as_fill() {
        let exec = executor(Arc::new(FillsOnCancel {
            counter: AtomicU64::new(1),
        }));

        let outcome = exec.submit_entry(&entry(), || true).await;
        assert!(matches!(outcome, EntryOutcome::Filled { .. }));
    }
}
