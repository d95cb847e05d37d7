// =============================================================================
// Execution Engine — single-order lifecycle across dry-run/paper/live modes
// =============================================================================
//
// Submit flow: risk check, rate-limit check, construct the order, store it,
// then dispatch per mode. DRY_RUN acknowledges without touching the venue;
// PAPER and LIVE share one code path against their respective gateways, with
// a tracking worker polling fills and driving the same observable events.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::execution::order::Order;
use crate::execution::paired::{PairState, PairedExecutionResult, PairedExecutor};
use crate::kill_switch::KillSwitch;
use crate::polymarket::gateway::{OrderGateway, OrderRequest};
use crate::risk::RiskManager;
use crate::types::{now_ms, Fill, OrderState, OrderType, Signal, TradingMode};

/// Simulated fee rate charged on paper fills.
const PAPER_FEE_RATE: f64 = 0.02;
/// How long the tracking worker follows an order before giving up.
const TRACK_TIMEOUT_MS: i64 = 10_000;
/// Poll interval while tracking fills.
const TRACK_POLL_MS: u64 = 20;

/// Outcome of a submission attempt.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub accepted: bool,
    pub order_id: String,
    pub rejection_reason: String,
}

impl SubmitResult {
    fn accepted(order_id: &str) -> Self {
        Self {
            accepted: true,
            order_id: order_id.to_string(),
            rejection_reason: String::new(),
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            accepted: false,
            order_id: String::new(),
            rejection_reason: reason,
        }
    }
}

pub type FillCallback = Box<dyn Fn(&Fill) + Send + Sync>;
pub type OrderCallback = Box<dyn Fn(&Order) + Send + Sync>;

/// Latency percentiles over the engine's lifetime.
#[derive(Debug, Clone, Default)]
pub struct LatencyMetrics {
    pub p50_decision_to_send_ms: f64,
    pub p95_decision_to_send_ms: f64,
    pub p50_send_to_ack_ms: f64,
    pub p95_send_to_ack_ms: f64,
    pub samples: usize,
}

pub struct ExecutionEngine {
    mode: TradingMode,
    gateway: Arc<dyn OrderGateway>,
    risk: Arc<RiskManager>,
    kill_switch: Arc<KillSwitch>,
    paired: PairedExecutor,

    orders: Mutex<HashMap<String, Order>>,

    fill_callback: Mutex<Option<FillCallback>>,
    order_callback: Mutex<Option<OrderCallback>>,

    orders_submitted: AtomicU64,
    orders_filled: AtomicU64,
    orders_rejected: AtomicU64,

    decision_to_send_ms: Mutex<Vec<f64>>,
    send_to_ack_ms: Mutex<Vec<f64>>,

    track_tx: mpsc::UnboundedSender<String>,
    track_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ExecutionEngine {
    pub fn new(
        mode: TradingMode,
        gateway: Arc<dyn OrderGateway>,
        risk: Arc<RiskManager>,
        kill_switch: Arc<KillSwitch>,
        executor_config: ExecutorConfig,
    ) -> Self {
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        info!(mode = %mode, "execution engine initialised");

        Self {
            mode,
            gateway: gateway.clone(),
            risk,
            kill_switch: kill_switch.clone(),
            paired: PairedExecutor::new(gateway, kill_switch, executor_config),
            orders: Mutex::new(HashMap::new()),
            fill_callback: Mutex::new(None),
            order_callback: Mutex::new(None),
            orders_submitted: AtomicU64::new(0),
            orders_filled: AtomicU64::new(0),
            orders_rejected: AtomicU64::new(0),
            decision_to_send_ms: Mutex::new(Vec::new()),
            send_to_ack_ms: Mutex::new(Vec::new()),
            track_tx,
            track_rx: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn paired_executor(&self) -> &PairedExecutor {
        &self.paired
    }

    pub fn set_fill_callback(&self, cb: FillCallback) {
        *self.fill_callback.lock() = Some(cb);
    }

    pub fn set_order_callback(&self, cb: OrderCallback) {
        *self.order_callback.lock() = Some(cb);
    }

    /// Spawn the fill-tracking worker. Paper and live orders are followed
    /// until terminal; dry-run orders never enter the queue.
    pub fn start_tracking_worker(self: &Arc<Self>) {
        let Some(mut rx) = self.track_rx.lock().take() else {
            warn!("tracking worker already started");
            return;
        };

        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(order_id) = rx.recv().await {
                engine.track_order(&order_id).await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    pub async fn submit_order(&self, signal: &Signal) -> SubmitResult {
        let notional = signal.notional();

        // Risk gate first.
        let check = self.risk.check_order(signal, notional);
        if !check.allowed {
            let reason = check.reason.unwrap_or_else(|| "risk denied".to_string());
            warn!(strategy = %signal.strategy, reason = %reason, "order blocked by risk");
            self.orders_rejected.fetch_add(1, Ordering::Relaxed);
            return SubmitResult::rejected(reason);
        }

        // Rate limit; repeated breaches arm the kill switch.
        if !self.risk.can_place_order() {
            self.kill_switch.check_rate_limit_breach();
            self.orders_rejected.fetch_add(1, Ordering::Relaxed);
            return SubmitResult::rejected("order rate limit exceeded".to_string());
        }

        let mut order = Order::from_signal(signal, OrderType::Limit);
        let order_id = order.client_order_id.clone();
        self.orders_submitted.fetch_add(1, Ordering::Relaxed);
        self.risk.record_order_placed();

        match self.mode {
            TradingMode::DryRun => {
                order.mark_sent();
                order.mark_acknowledged(&format!("DRY-{order_id}"), now_ms());
                info!(order_id = %order_id, "dry-run order recorded");
                self.store_and_notify(order);
            }
            TradingMode::Paper | TradingMode::Live => {
                order.mark_sent();
                self.record_latency(
                    &self.decision_to_send_ms,
                    (order.sent_at_ms - signal.generated_at_ms) as f64,
                );

                let request = OrderRequest {
                    client_order_id: order_id.clone(),
                    market_id: order.market_id.clone(),
                    token_id: order.token_id.clone(),
                    side: order.side,
                    order_type: order.order_type,
                    price: order.price,
                    size: order.original_size,
                };

                match self.gateway.submit_order(&request).await {
                    Ok(ack) => {
                        order.mark_acknowledged(&ack.order_id, ack.exchange_time_ms);
                        self.record_latency(
                            &self.send_to_ack_ms,
                            (order.acked_at_ms - order.sent_at_ms) as f64,
                        );
                        self.store_and_notify(order);
                        // Follow the order until it terminates.
                        let _ = self.track_tx.send(order_id.clone());
                    }
                    Err(e) => {
                        let reason = format!("{e:#}");
                        order.mark_rejected(&reason);
                        self.orders_rejected.fetch_add(1, Ordering::Relaxed);
                        self.store_and_notify(order);
                        return SubmitResult::rejected(reason);
                    }
                }
            }
        }

        SubmitResult::accepted(&order_id)
    }

    /// Submit both legs of an underpricing pair. Dry-run records the legs as
    /// acknowledged; paper and live run the full paired protocol against the
    /// gateway.
    pub async fn submit_paired_order(
        &self,
        yes_signal: &Signal,
        no_signal: &Signal,
    ) -> PairedExecutionResult {
        if self.mode == TradingMode::DryRun {
            for signal in [yes_signal, no_signal] {
                let mut order = Order::from_signal(signal, OrderType::Ioc);
                order.mark_sent();
                let id = order.client_order_id.clone();
                order.mark_acknowledged(&format!("DRY-{id}"), now_ms());
                self.store_and_notify(order);
            }
            self.orders_submitted.fetch_add(2, Ordering::Relaxed);

            let mut result = PairedExecutionResult {
                success: true,
                pair_id: String::new(),
                final_state: PairState::Created,
                realized_pnl: 0.0,
                error: String::new(),
                leg1_filled: false,
                leg2_filled: false,
                leg1_fill_price: 0.0,
                leg2_fill_price: 0.0,
                leg1_fill_size: 0.0,
                leg2_fill_size: 0.0,
            };
            result.error = "dry run".to_string();
            return result;
        }

        // Risk gates apply per leg; each is its own trade.
        let denied = [yes_signal, no_signal]
            .iter()
            .map(|s| self.risk.check_order(s, s.notional()))
            .find(|c| !c.allowed);
        if let Some(check) = denied {
            let result = PairedExecutionResult {
                success: false,
                pair_id: String::new(),
                final_state: PairState::Created,
                realized_pnl: 0.0,
                error: check.reason.unwrap_or_else(|| "risk denied".to_string()),
                leg1_filled: false,
                leg2_filled: false,
                leg1_fill_price: 0.0,
                leg2_fill_price: 0.0,
                leg1_fill_size: 0.0,
                leg2_fill_size: 0.0,
            };
            warn!(reason = %result.error, "paired order blocked by risk");
            self.orders_rejected.fetch_add(2, Ordering::Relaxed);
            return result;
        }

        self.orders_submitted.fetch_add(2, Ordering::Relaxed);
        self.risk.record_order_placed();
        self.risk.record_order_placed();

        self.paired.execute(yes_signal, no_signal).await
    }

    // -------------------------------------------------------------------------
    // Cancel
    // -------------------------------------------------------------------------

    pub async fn cancel_order(&self, order_id: &str) -> bool {
        let exchange_id = {
            let orders = self.orders.lock();
            let Some(order) = orders.get(order_id) else {
                return false;
            };
            if order.is_terminal() {
                return false;
            }
            order.exchange_order_id.clone()
        };

        let success = if self.mode == TradingMode::DryRun {
            true
        } else {
            match self.gateway.cancel_order(&exchange_id).await {
                Ok(ack) => ack.success,
                Err(e) => {
                    warn!(order_id, error = %e, "cancel failed");
                    false
                }
            }
        };

        if success {
            let mut orders = self.orders.lock();
            if let Some(order) = orders.get_mut(order_id) {
                order.mark_canceled();
                self.notify_order(order);
            }
        }
        success
    }

    /// Cancel every non-terminal order; used on shutdown and kill-switch
    /// trips. Returns how many cancels succeeded.
    pub async fn cancel_all(&self) -> usize {
        let open_ids: Vec<String> = {
            let orders = self.orders.lock();
            orders
                .values()
                .filter(|o| !o.is_terminal())
                .map(|o| o.client_order_id.clone())
                .collect()
        };

        let mut canceled = 0;
        for order_id in open_ids {
            if self.cancel_order(&order_id).await {
                canceled += 1;
            }
        }

        info!(canceled, "cancel-all complete");
        canceled
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders.lock().get(order_id).cloned()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .lock()
            .values()
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect()
    }

    pub fn orders_for_market(&self, market_id: &str) -> Vec<Order> {
        self.orders
            .lock()
            .values()
            .filter(|o| o.market_id == market_id)
            .cloned()
            .collect()
    }

    pub fn orders_submitted(&self) -> u64 {
        self.orders_submitted.load(Ordering::Relaxed)
    }

    pub fn orders_filled(&self) -> u64 {
        self.orders_filled.load(Ordering::Relaxed)
    }

    pub fn orders_rejected(&self) -> u64 {
        self.orders_rejected.load(Ordering::Relaxed)
    }

    pub fn latency_metrics(&self) -> LatencyMetrics {
        let decision = self.decision_to_send_ms.lock();
        let ack = self.send_to_ack_ms.lock();
        LatencyMetrics {
            p50_decision_to_send_ms: percentile(&decision, 0.50),
            p95_decision_to_send_ms: percentile(&decision, 0.95),
            p50_send_to_ack_ms: percentile(&ack, 0.50),
            p95_send_to_ack_ms: percentile(&ack, 0.95),
            samples: decision.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Fill tracking
    // -------------------------------------------------------------------------

    /// Poll one order until terminal, applying fills as they appear.
    async fn track_order(&self, order_id: &str) {
        let exchange_id = match self.get_order(order_id) {
            Some(order) => order.exchange_order_id.clone(),
            None => return,
        };

        let deadline = now_ms() + TRACK_TIMEOUT_MS;
        let poll = tokio::time::Duration::from_millis(TRACK_POLL_MS);
        let mut seen_filled = 0.0f64;

        while now_ms() < deadline {
            let status = match self.gateway.order_status(&exchange_id).await {
                Ok(Some(status)) => status,
                Ok(None) => {
                    tokio::time::sleep(poll).await;
                    continue;
                }
                Err(e) => {
                    debug!(order_id, error = %e, "status poll failed");
                    tokio::time::sleep(poll).await;
                    continue;
                }
            };

            if status.filled_size > seen_filled {
                let delta = status.filled_size - seen_filled;
                seen_filled = status.filled_size;
                self.apply_fill_delta(order_id, delta, status.avg_fill_price);
            }

            if status.state.is_terminal() {
                if status.state != OrderState::Filled {
                    let mut orders = self.orders.lock();
                    if let Some(order) = orders.get_mut(order_id) {
                        match status.state {
                            OrderState::Canceled => order.mark_canceled(),
                            OrderState::Rejected => order.mark_rejected("venue rejected"),
                            OrderState::Expired => order.mark_expired(),
                            _ => {}
                        }
                        self.notify_order(order);
                    }
                }
                return;
            }

            tokio::time::sleep(poll).await;
        }

        debug!(order_id, "fill tracking timed out");
    }

    fn apply_fill_delta(&self, order_id: &str, size: f64, price: f64) {
        let fill = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.get_mut(order_id) else {
                return;
            };

            let notional = size * price;
            let fee = if self.mode == TradingMode::Paper {
                notional * PAPER_FEE_RATE
            } else {
                0.0
            };

            let fill = Fill {
                order_id: order_id.to_string(),
                trade_id: String::new(),
                market_id: order.market_id.clone(),
                token_id: order.token_id.clone(),
                side: order.side,
                price,
                size,
                notional,
                fee,
                fill_time_ms: now_ms(),
                exchange_time_ms: 0,
            };

            order.apply_fill(fill.clone());
            if order.state == OrderState::Filled {
                self.orders_filled.fetch_add(1, Ordering::Relaxed);
            }
            self.notify_order(order);
            fill
        };

        self.risk.record_fill(&fill);
        if let Some(cb) = self.fill_callback.lock().as_ref() {
            cb(&fill);
        }
    }

    fn store_and_notify(&self, order: Order) {
        self.notify_order(&order);
        self.orders
            .lock()
            .insert(order.client_order_id.clone(), order);
    }

    fn notify_order(&self, order: &Order) {
        if let Some(cb) = self.order_callback.lock().as_ref() {
            cb(order);
        }
    }

    fn record_latency(&self, samples: &Mutex<Vec<f64>>, value_ms: f64) {
        samples.lock().push(value_ms.max(0.0));
    }
}

/// Nearest-rank percentile over unsorted samples.
fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64 * p).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::execution::paper::{PaperConfig, PaperGateway};
    use crate::kill_switch::KillSwitchConfig;
    use crate::types::Side;

    fn signal(market: &str, price: f64, size: f64) -> Signal {
        Signal {
            strategy: "stale_odds".to_string(),
            market_id: market.to_string(),
            token_id: "tok-yes".to_string(),
            side: Side::Buy,
            target_price: price,
            target_size: size,
            expected_edge: 0.03,
            confidence: 0.9,
            generated_at_ms: now_ms(),
            reason: String::new(),
        }
    }

    fn engine(mode: TradingMode, paper: PaperConfig) -> Arc<ExecutionEngine> {
        engine_with_risk(mode, paper, RiskConfig::default())
    }

    fn engine_with_risk(
        mode: TradingMode,
        paper: PaperConfig,
        risk_config: RiskConfig,
    ) -> Arc<ExecutionEngine> {
        let ks = Arc::new(KillSwitch::new(50.0, KillSwitchConfig::default()));
        let risk = Arc::new(RiskManager::new(risk_config, 50.0, ks.clone()));
        let gateway = Arc::new(PaperGateway::new(paper));
        Arc::new(ExecutionEngine::new(
            mode,
            gateway,
            risk,
            ks,
            ExecutorConfig {
                leg1_timeout_ms: 100,
                leg2_timeout_ms: 100,
                unwind_timeout_ms: 100,
                poll_interval_ms: 10,
                ..ExecutorConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn dry_run_acknowledges_without_venue() {
        let engine = engine(TradingMode::DryRun, PaperConfig::never_fill());

        let result = engine.submit_order(&signal("m1", 0.50, 1.5)).await;
        assert!(result.accepted);

        let order = engine.get_order(&result.order_id).unwrap();
        assert_eq!(order.state, OrderState::Acknowledged);
        assert!(order.exchange_order_id.starts_with("DRY-"));
        assert_eq!(engine.orders_submitted(), 1);
    }

    #[tokio::test]
    async fn risk_denied_is_rejected_with_reason() {
        let engine = engine(TradingMode::DryRun, PaperConfig::never_fill());

        // Over the per-trade notional cap.
        let result = engine.submit_order(&signal("m1", 0.50, 10.0)).await;
        assert!(!result.accepted);
        assert!(result.rejection_reason.contains("exceeds max"));
        assert_eq!(engine.orders_rejected(), 1);
    }

    #[tokio::test]
    async fn rate_limit_rejections_feed_kill_switch() {
        let mut risk_config = RiskConfig::default();
        risk_config.max_orders_per_minute = 1;
        let engine = engine_with_risk(TradingMode::DryRun, PaperConfig::never_fill(), risk_config);

        assert!(engine.submit_order(&signal("m1", 0.50, 1.0)).await.accepted);

        let rejected = engine.submit_order(&signal("m1", 0.50, 1.0)).await;
        assert!(!rejected.accepted);
        assert!(rejected.rejection_reason.contains("rate limit"));
    }

    #[tokio::test]
    async fn paper_order_fills_and_fires_callback() {
        let engine = engine(TradingMode::Paper, PaperConfig::always_fill());
        engine.start_tracking_worker();

        let fills: Arc<Mutex<Vec<Fill>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fills.clone();
        engine.set_fill_callback(Box::new(move |fill| {
            sink.lock().push(fill.clone());
        }));

        let result = engine.submit_order(&signal("m1", 0.50, 1.5)).await;
        assert!(result.accepted);

        tokio::time::sleep(tokio::time::Duration::from_millis(120)).await;

        let order = engine.get_order(&result.order_id).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert!((order.filled_size - 1.5).abs() < 1e-9);
        assert_eq!(engine.orders_filled(), 1);

        let fills = fills.lock();
        assert_eq!(fills.len(), 1);
        // Fixed simulated fee on notional.
        assert!((fills[0].fee - 0.75 * PAPER_FEE_RATE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancel_all_skips_terminal_orders() {
        let engine = engine(TradingMode::Paper, PaperConfig::never_fill());

        let a = engine.submit_order(&signal("m1", 0.50, 1.0)).await;
        let b = engine.submit_order(&signal("m2", 0.50, 1.0)).await;
        assert!(a.accepted && b.accepted);

        // Manually terminate one order.
        {
            let mut orders = engine.orders.lock();
            orders.get_mut(&b.order_id).unwrap().mark_canceled();
        }

        let canceled = engine.cancel_all().await;
        assert_eq!(canceled, 1);
        assert_eq!(
            engine.get_order(&a.order_id).unwrap().state,
            OrderState::Canceled
        );
    }

    #[tokio::test]
    async fn paired_order_runs_through_executor_in_paper() {
        let engine = engine(TradingMode::Paper, PaperConfig::always_fill());

        let yes = signal("m1", 0.46, 2.0);
        let mut no = signal("m1", 0.48, 2.0);
        no.token_id = "tok-no".to_string();

        let result = engine.submit_paired_order(&yes, &no).await;
        assert!(result.success, "{}", result.error);
        assert_eq!(result.final_state, PairState::FullyFilled);
        assert_eq!(engine.paired_executor().successful_pairs(), 1);
    }

    #[tokio::test]
    async fn paired_order_dry_run_records_both_legs() {
        let engine = engine(TradingMode::DryRun, PaperConfig::never_fill());

        let yes = signal("m1", 0.46, 2.0);
        let mut no = signal("m1", 0.48, 2.0);
        no.token_id = "tok-no".to_string();

        let result = engine.submit_paired_order(&yes, &no).await;
        assert!(result.success);
        assert_eq!(engine.orders_submitted(), 2);
        assert_eq!(engine.open_orders().len(), 2);
    }

    #[tokio::test]
    async fn kill_switch_blocks_all_submissions() {
        let engine = engine(TradingMode::DryRun, PaperConfig::never_fill());
        engine.kill_switch.activate(
            crate::kill_switch::KillReason::Manual,
            "operator halt",
        );

        let result = engine.submit_order(&signal("m1", 0.50, 1.0)).await;
        assert!(!result.accepted);
        assert!(result.rejection_reason.contains("Kill switch"));
    }

    #[test]
    fn percentile_nearest_rank() {
        let samples = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&samples, 0.50), 30.0);
        assert_eq!(percentile(&samples, 0.95), 50.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }
}
