// =============================================================================
// Paired Executor — two-leg atomic execution with retry and unwind
// =============================================================================
//
// Submits both legs of a binary-market pair as IOC orders and drives the
// pair to a hedged terminal state. Leg-1 failure is safe (no exposure);
// leg-2 failure leaves unhedged exposure and triggers the unwind protocol:
// an opposite-side IOC on the filled leg at a worsened price. A pair that
// cannot be unwound is abandoned and arms the kill switch.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::kill_switch::{KillReason, KillSwitch};
use crate::polymarket::gateway::{OrderGateway, OrderRequest};
use crate::types::{now_ms, OrderState, OrderType, Side, Signal};

// ---------------------------------------------------------------------------
// Pair model
// ---------------------------------------------------------------------------

/// Pair lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairState {
    Created,
    Leg1Pending,
    Leg1Filled,
    Leg2Pending,
    FullyFilled,
    /// First leg failed; safe, no exposure.
    Leg1Failed,
    /// Second leg failed; dangerous, unhedged.
    Leg2Failed,
    UnwindPending,
    Unwound,
    /// Gave up; operator action required.
    Abandoned,
    Canceled,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Leg1Pending => "LEG1_PENDING",
            Self::Leg1Filled => "LEG1_FILLED",
            Self::Leg2Pending => "LEG2_PENDING",
            Self::FullyFilled => "FULLY_FILLED",
            Self::Leg1Failed => "LEG1_FAILED",
            Self::Leg2Failed => "LEG2_FAILED",
            Self::UnwindPending => "UNWIND_PENDING",
            Self::Unwound => "UNWOUND",
            Self::Abandoned => "ABANDONED",
            Self::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

/// One leg of a pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairedLeg {
    pub order_id: String,
    pub token_id: String,
    /// "YES" or "NO".
    pub outcome: String,
    pub side: Side,
    /// Current working price (worsened by retries).
    pub price: f64,
    /// Price at signal time; retry adjustments are measured from here.
    pub original_price: f64,
    pub size: f64,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    pub state: OrderState,
    pub retry_count: u32,
}

impl PairedLeg {
    fn from_signal(signal: &Signal, outcome: &str) -> Self {
        Self {
            order_id: String::new(),
            token_id: signal.token_id.clone(),
            outcome: outcome.to_string(),
            side: signal.side,
            price: signal.target_price,
            original_price: signal.target_price,
            size: signal.target_size,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            state: OrderState::Pending,
            retry_count: 0,
        }
    }
}

/// A paired order through its lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct PairedOrder {
    pub pair_id: String,
    pub market_id: String,
    pub leg1: PairedLeg,
    pub leg2: PairedLeg,
    pub state: PairState,
    pub expected_edge: f64,
    pub realized_pnl: f64,
    pub created_at_ms: i64,
    pub last_update_ms: i64,
    pub failure_reason: String,
}

impl PairedOrder {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            PairState::FullyFilled
                | PairState::Unwound
                | PairState::Abandoned
                | PairState::Canceled
                | PairState::Leg1Failed
        )
    }

    /// Hedged states carry no one-sided exposure.
    pub fn is_hedged(&self) -> bool {
        matches!(
            self.state,
            PairState::Created
                | PairState::Canceled
                | PairState::Leg1Failed
                | PairState::FullyFilled
                | PairState::Unwound
        )
    }

    pub fn needs_unwind(&self) -> bool {
        self.state == PairState::Leg2Failed
    }

    /// Absolute difference between the two legs' filled notionals.
    pub fn unhedged_exposure(&self) -> f64 {
        if self.is_hedged() {
            return 0.0;
        }
        let leg1 = self.leg1.filled_size * self.leg1.avg_fill_price;
        let leg2 = self.leg2.filled_size * self.leg2.avg_fill_price;
        (leg1 - leg2).abs()
    }
}

/// Result handed back to the submitter.
#[derive(Debug, Clone, Serialize)]
pub struct PairedExecutionResult {
    pub success: bool,
    pub pair_id: String,
    pub final_state: PairState,
    pub realized_pnl: f64,
    pub error: String,

    pub leg1_filled: bool,
    pub leg2_filled: bool,
    pub leg1_fill_price: f64,
    pub leg2_fill_price: f64,
    pub leg1_fill_size: f64,
    pub leg2_fill_size: f64,
}

impl PairedExecutionResult {
    fn new(pair_id: &str) -> Self {
        Self {
            success: false,
            pair_id: pair_id.to_string(),
            final_state: PairState::Created,
            realized_pnl: 0.0,
            error: String::new(),
            leg1_filled: false,
            leg2_filled: false,
            leg1_fill_price: 0.0,
            leg2_fill_price: 0.0,
            leg1_fill_size: 0.0,
            leg2_fill_size: 0.0,
        }
    }
}

enum Leg {
    One,
    Two,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct PairedExecutor {
    gateway: Arc<dyn OrderGateway>,
    kill_switch: Arc<KillSwitch>,
    config: ExecutorConfig,

    pairs: Mutex<HashMap<String, PairedOrder>>,
    pair_counter: AtomicU64,

    total_pairs: AtomicU64,
    successful_pairs: AtomicU64,
    failed_pairs: AtomicU64,
    unwind_attempts: AtomicU64,
}

impl PairedExecutor {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        kill_switch: Arc<KillSwitch>,
        config: ExecutorConfig,
    ) -> Self {
        info!(
            leg1_timeout_ms = config.leg1_timeout_ms,
            leg2_timeout_ms = config.leg2_timeout_ms,
            max_retries = config.max_retries,
            "paired executor initialised"
        );
        Self {
            gateway,
            kill_switch,
            config,
            pairs: Mutex::new(HashMap::new()),
            pair_counter: AtomicU64::new(0),
            total_pairs: AtomicU64::new(0),
            successful_pairs: AtomicU64::new(0),
            failed_pairs: AtomicU64::new(0),
            unwind_attempts: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Execution protocol
    // -------------------------------------------------------------------------

    pub async fn execute(
        &self,
        yes_signal: &Signal,
        no_signal: &Signal,
    ) -> PairedExecutionResult {
        let pair_id = format!(
            "PAIR-{}-{}",
            now_ms(),
            self.pair_counter.fetch_add(1, Ordering::Relaxed)
        );

        let mut pair = PairedOrder {
            pair_id: pair_id.clone(),
            market_id: yes_signal.market_id.clone(),
            leg1: PairedLeg::from_signal(yes_signal, "YES"),
            leg2: PairedLeg::from_signal(no_signal, "NO"),
            state: PairState::Created,
            expected_edge: yes_signal.expected_edge,
            realized_pnl: 0.0,
            created_at_ms: now_ms(),
            last_update_ms: now_ms(),
            failure_reason: String::new(),
        };

        let mut result = PairedExecutionResult::new(&pair_id);
        self.total_pairs.fetch_add(1, Ordering::Relaxed);
        self.store_pair(&pair);

        info!(
            pair_id = %pair_id,
            yes_price = pair.leg1.price,
            yes_size = pair.leg1.size,
            no_price = pair.leg2.price,
            no_size = pair.leg2.size,
            expected_edge_cents = pair.expected_edge * 100.0,
            "executing paired order"
        );

        // ── Leg 1 ───────────────────────────────────────────────────────
        self.set_state(&mut pair, PairState::Leg1Pending);
        if let Err(e) = self.submit_leg(&mut pair, Leg::One).await {
            // No exposure yet: safe failure.
            pair.failure_reason = format!("leg 1 submission failed: {e:#}");
            self.set_state(&mut pair, PairState::Leg1Failed);
            self.failed_pairs.fetch_add(1, Ordering::Relaxed);
            result.error = pair.failure_reason.clone();
            return self.finalize(pair, result);
        }

        let leg1_filled = self
            .wait_for_fill(&mut pair, Leg::One, self.config.leg1_timeout_ms)
            .await;

        if !leg1_filled {
            // Try to get out; the cancel can race an actual fill.
            let order_id = pair.leg1.order_id.clone();
            let cancel_ok = match self.gateway.cancel_order(&order_id).await {
                Ok(ack) => ack.success,
                Err(e) => {
                    warn!(pair_id = %pair_id, error = %e, "leg 1 cancel errored");
                    false
                }
            };

            let raced_fill = match self.gateway.order_status(&order_id).await {
                Ok(Some(status)) if status.filled_size > 0.0 => {
                    pair.leg1.filled_size = status.filled_size;
                    pair.leg1.avg_fill_price = status.avg_fill_price;
                    pair.leg1.state = OrderState::Filled;
                    true
                }
                _ => false,
            };

            if raced_fill {
                self.set_state(&mut pair, PairState::Leg1Filled);
            } else if cancel_ok {
                self.set_state(&mut pair, PairState::Canceled);
                result.error = "leg 1 timeout, canceled".to_string();
                return self.finalize(pair, result);
            } else {
                pair.failure_reason = "leg 1 timeout, cancel failed".to_string();
                self.set_state(&mut pair, PairState::Leg1Failed);
                self.failed_pairs.fetch_add(1, Ordering::Relaxed);
                result.error = pair.failure_reason.clone();
                return self.finalize(pair, result);
            }
        } else {
            self.set_state(&mut pair, PairState::Leg1Filled);
        }

        result.leg1_filled = pair.leg1.filled_size > 0.0;
        result.leg1_fill_price = pair.leg1.avg_fill_price;
        result.leg1_fill_size = pair.leg1.filled_size;

        // ── Leg 2 ───────────────────────────────────────────────────────
        self.set_state(&mut pair, PairState::Leg2Pending);
        if let Err(e) = self.submit_leg(&mut pair, Leg::Two).await {
            error!(pair_id = %pair_id, error = %e, "leg 2 submission failed, unhedged exposure");
            pair.failure_reason = format!("leg 2 submission failed: {e:#}");
            self.set_state(&mut pair, PairState::Leg2Failed);

            result.error = self.handle_leg2_failure(&mut pair).await;
            self.failed_pairs.fetch_add(1, Ordering::Relaxed);
            return self.finalize(pair, result);
        }

        let mut leg2_filled = self
            .wait_for_fill(&mut pair, Leg::Two, self.config.leg2_timeout_ms)
            .await;

        while !leg2_filled && pair.leg2.retry_count < self.config.max_retries {
            warn!(
                pair_id = %pair_id,
                retry = pair.leg2.retry_count + 1,
                max = self.config.max_retries,
                "leg 2 not filled, retrying at adjusted price"
            );

            let order_id = pair.leg2.order_id.clone();
            if let Err(e) = self.gateway.cancel_order(&order_id).await {
                warn!(pair_id = %pair_id, error = %e, "leg 2 cancel errored");
            }

            if !self.retry_leg2(&mut pair).await {
                break;
            }
            leg2_filled = self
                .wait_for_fill(&mut pair, Leg::Two, self.config.leg2_timeout_ms)
                .await;
        }

        if pair.leg2.filled_size >= pair.leg2.size * self.config.leg_fill_threshold {
            self.set_state(&mut pair, PairState::FullyFilled);
            // The captured edge realizes on the matched portion of the pair.
            pair.realized_pnl =
                pair.expected_edge * pair.leg1.filled_size.min(pair.leg2.filled_size);
            result.success = true;
            self.successful_pairs.fetch_add(1, Ordering::Relaxed);

            info!(
                pair_id = %pair_id,
                realized_pnl = pair.realized_pnl,
                "paired order fully filled"
            );
        } else {
            error!(
                pair_id = %pair_id,
                retries = pair.leg2.retry_count,
                "leg 2 failed after retries"
            );
            pair.failure_reason = "leg 2 unfilled after retries".to_string();
            self.set_state(&mut pair, PairState::Leg2Failed);
            result.error = self.handle_leg2_failure(&mut pair).await;
            self.failed_pairs.fetch_add(1, Ordering::Relaxed);
        }

        result.leg2_filled = pair.leg2.filled_size > 0.0;
        result.leg2_fill_price = pair.leg2.avg_fill_price;
        result.leg2_fill_size = pair.leg2.filled_size;

        self.finalize(pair, result)
    }

    /// Run the unwind protocol (when enabled) after a leg-2 failure and
    /// return the human-readable outcome.
    async fn handle_leg2_failure(&self, pair: &mut PairedOrder) -> String {
        if self.config.auto_unwind {
            if self.attempt_unwind(pair).await {
                "leg 2 failed, unwound successfully".to_string()
            } else {
                self.check_kill_switch_trigger(pair);
                "leg 2 failed, unwind FAILED - manual intervention needed".to_string()
            }
        } else {
            self.check_kill_switch_trigger(pair);
            "leg 2 failed, auto-unwind disabled".to_string()
        }
    }

    // -------------------------------------------------------------------------
    // Leg mechanics
    // -------------------------------------------------------------------------

    async fn submit_leg(&self, pair: &mut PairedOrder, which: Leg) -> anyhow::Result<()> {
        let leg = match which {
            Leg::One => &mut pair.leg1,
            Leg::Two => &mut pair.leg2,
        };

        let request = OrderRequest {
            client_order_id: format!("{}-{}", pair.pair_id, leg.outcome),
            market_id: pair.market_id.clone(),
            token_id: leg.token_id.clone(),
            side: leg.side,
            order_type: OrderType::Ioc,
            price: leg.price,
            size: leg.size,
        };

        let ack = self.gateway.submit_order(&request).await?;
        leg.order_id = ack.order_id;
        leg.state = OrderState::Sent;

        debug!(
            pair_id = %pair.pair_id,
            outcome = %leg.outcome,
            order_id = %leg.order_id,
            price = leg.price,
            "leg submitted"
        );
        Ok(())
    }

    /// Poll until the leg reaches the fill threshold, its order terminates
    /// unfilled, or the timeout lapses. Partial fills are recorded as they
    /// are observed.
    async fn wait_for_fill(&self, pair: &mut PairedOrder, which: Leg, timeout_ms: u64) -> bool {
        let leg = match which {
            Leg::One => &mut pair.leg1,
            Leg::Two => &mut pair.leg2,
        };

        let deadline = now_ms() + timeout_ms as i64;
        let poll = tokio::time::Duration::from_millis(self.config.poll_interval_ms);

        while now_ms() < deadline {
            match self.gateway.order_status(&leg.order_id).await {
                Ok(Some(status)) => {
                    if status.filled_size > 0.0 {
                        leg.filled_size = status.filled_size;
                        leg.avg_fill_price = status.avg_fill_price;
                    }

                    if status.filled_size >= leg.size * self.config.leg_fill_threshold {
                        leg.state = OrderState::Filled;
                        return true;
                    }

                    if status.state.is_terminal() {
                        leg.state = status.state;
                        return false;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(order_id = %leg.order_id, error = %e, "order status poll failed");
                }
            }

            tokio::time::sleep(poll).await;
        }

        false
    }

    /// Worsen the leg-2 price and resubmit, unless the adjustment cap or the
    /// minimum remaining edge forbids it.
    async fn retry_leg2(&self, pair: &mut PairedOrder) -> bool {
        pair.leg2.retry_count += 1;
        let retry = pair.leg2.retry_count;

        let adjusted = Self::adjusted_price(
            pair.leg2.original_price,
            pair.leg2.side,
            retry,
            self.config.retry_price_adjustment_bps,
        );

        let price_diff = (adjusted - pair.leg2.original_price).abs();
        let remaining_edge = pair.expected_edge - price_diff;
        if remaining_edge < self.config.min_edge_after_adjustment_cents / 100.0 {
            warn!(
                pair_id = %pair.pair_id,
                remaining_edge,
                "edge too small after adjustment, giving up"
            );
            return false;
        }

        let adjustment_bps = price_diff / pair.leg2.original_price * 10_000.0;
        if adjustment_bps > self.config.max_price_adjustment_bps {
            warn!(
                pair_id = %pair.pair_id,
                adjustment_bps,
                "max price adjustment exceeded, giving up"
            );
            return false;
        }

        pair.leg2.price = adjusted;
        match self.submit_leg(pair, Leg::Two).await {
            Ok(()) => true,
            Err(e) => {
                warn!(pair_id = %pair.pair_id, error = %e, "leg 2 retry submission failed");
                false
            }
        }
    }

    /// BUY legs worsen upward, SELL legs downward.
    fn adjusted_price(original: f64, side: Side, retry_count: u32, adjustment_bps: f64) -> f64 {
        let adjustment = original * (adjustment_bps / 10_000.0) * retry_count as f64;
        match side {
            Side::Buy => original + adjustment,
            Side::Sell => original - adjustment,
        }
    }

    // -------------------------------------------------------------------------
    // Unwind protocol
    // -------------------------------------------------------------------------

    async fn attempt_unwind(&self, pair: &mut PairedOrder) -> bool {
        self.unwind_attempts.fetch_add(1, Ordering::Relaxed);
        warn!(pair_id = %pair.pair_id, "attempting unwind");

        self.set_state(pair, PairState::UnwindPending);

        let (token_id, entry_side, entry_price, filled_size) = {
            let filled_leg = if pair.leg1.filled_size > 0.0 {
                &pair.leg1
            } else {
                &pair.leg2
            };
            (
                filled_leg.token_id.clone(),
                filled_leg.side,
                filled_leg.avg_fill_price,
                filled_leg.filled_size,
            )
        };

        let unwind_price = Self::unwind_price(
            entry_price,
            entry_side,
            self.config.unwind_price_discount_bps,
        );

        let request = OrderRequest {
            client_order_id: format!("{}-UNWIND", pair.pair_id),
            market_id: pair.market_id.clone(),
            token_id,
            side: entry_side.opposite(),
            order_type: OrderType::Ioc,
            price: unwind_price,
            size: filled_size,
        };

        let order_id = match self.gateway.submit_order(&request).await {
            Ok(ack) => ack.order_id,
            Err(e) => {
                error!(pair_id = %pair.pair_id, error = %e, "unwind submission failed");
                self.set_state(pair, PairState::Abandoned);
                return false;
            }
        };

        let deadline = now_ms() + self.config.unwind_timeout_ms as i64;
        let poll = tokio::time::Duration::from_millis(self.config.poll_interval_ms.max(50));

        while now_ms() < deadline {
            if let Ok(Some(status)) = self.gateway.order_status(&order_id).await {
                if status.filled_size >= filled_size * self.config.unwind_fill_threshold {
                    self.set_state(pair, PairState::Unwound);

                    // The discount is a realized loss on the round trip.
                    pair.realized_pnl = match entry_side {
                        Side::Buy => (status.avg_fill_price - entry_price) * filled_size,
                        Side::Sell => (entry_price - status.avg_fill_price) * filled_size,
                    };

                    info!(
                        pair_id = %pair.pair_id,
                        realized_pnl = pair.realized_pnl,
                        "unwind successful"
                    );
                    self.store_pair(pair);
                    return true;
                }
            }
            tokio::time::sleep(poll).await;
        }

        error!(pair_id = %pair.pair_id, "unwind timeout");
        self.set_state(pair, PairState::Abandoned);
        false
    }

    /// Unwinding a BUY means selling below entry; a SELL means buying above.
    fn unwind_price(entry_price: f64, entry_side: Side, discount_bps: f64) -> f64 {
        let discount = entry_price * (discount_bps / 10_000.0);
        match entry_side {
            Side::Buy => entry_price - discount,
            Side::Sell => entry_price + discount,
        }
    }

    /// Arm the kill switch when the pair ends with one-sided exposure.
    fn check_kill_switch_trigger(&self, pair: &PairedOrder) {
        let unhedged = pair.unhedged_exposure();
        if unhedged > 0.0 {
            error!(
                pair_id = %pair.pair_id,
                unhedged_exposure = unhedged,
                "UNHEDGED EXPOSURE"
            );
            self.kill_switch.activate(
                KillReason::UnhedgedPosition,
                &format!("Unhedged exposure ${unhedged:.2} from pair {}", pair.pair_id),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    fn set_state(&self, pair: &mut PairedOrder, state: PairState) {
        pair.state = state;
        pair.last_update_ms = now_ms();
        debug!(pair_id = %pair.pair_id, state = %state, "pair state");
        self.store_pair(pair);
    }

    fn store_pair(&self, pair: &PairedOrder) {
        self.pairs.lock().insert(pair.pair_id.clone(), pair.clone());
    }

    fn finalize(&self, pair: PairedOrder, mut result: PairedExecutionResult) -> PairedExecutionResult {
        result.final_state = pair.state;
        result.realized_pnl = pair.realized_pnl;
        result.leg1_fill_price = pair.leg1.avg_fill_price;
        result.leg1_fill_size = pair.leg1.filled_size;
        result.leg1_filled = pair.leg1.filled_size > 0.0;
        result.leg2_fill_price = pair.leg2.avg_fill_price;
        result.leg2_fill_size = pair.leg2.filled_size;
        result.leg2_filled = pair.leg2.filled_size > 0.0;
        self.store_pair(&pair);
        result
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_pair(&self, pair_id: &str) -> Option<PairedOrder> {
        self.pairs.lock().get(pair_id).cloned()
    }

    pub fn active_pairs(&self) -> Vec<PairedOrder> {
        self.pairs
            .lock()
            .values()
            .filter(|p| !p.is_terminal())
            .cloned()
            .collect()
    }

    pub fn pairs_needing_unwind(&self) -> Vec<PairedOrder> {
        self.pairs
            .lock()
            .values()
            .filter(|p| p.needs_unwind())
            .cloned()
            .collect()
    }

    pub fn total_unhedged_exposure(&self) -> f64 {
        self.pairs
            .lock()
            .values()
            .map(|p| p.unhedged_exposure())
            .sum()
    }

    pub fn total_pairs(&self) -> u64 {
        self.total_pairs.load(Ordering::Relaxed)
    }

    pub fn successful_pairs(&self) -> u64 {
        self.successful_pairs.load(Ordering::Relaxed)
    }

    pub fn failed_pairs(&self) -> u64 {
        self.failed_pairs.load(Ordering::Relaxed)
    }

    pub fn unwind_attempts(&self) -> u64 {
        self.unwind_attempts.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::kill_switch::KillSwitchConfig;
    use crate::polymarket::gateway::{CancelAck, OrderAck, OrderStatus};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy)]
    enum Script {
        /// Order fills immediately at this fraction of its size.
        Fill(f64),
        /// Submission is rejected by the venue.
        RejectSubmit,
        /// Order rests forever unfilled.
        NeverFill,
    }

    struct ScriptedGateway {
        scripts: Mutex<HashMap<String, VecDeque<Script>>>,
        orders: Mutex<HashMap<String, (OrderRequest, Script)>>,
        submitted: Mutex<Vec<OrderRequest>>,
        next_id: Mutex<u64>,
    }

    impl ScriptedGateway {
        fn new(scripts: Vec<(&str, Vec<Script>)>) -> Self {
            let map = scripts
                .into_iter()
                .map(|(token, s)| (token.to_string(), s.into_iter().collect()))
                .collect();
            Self {
                scripts: Mutex::new(map),
                orders: Mutex::new(HashMap::new()),
                submitted: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
            }
        }

        fn submitted_for(&self, token: &str) -> Vec<OrderRequest> {
            self.submitted
                .lock()
                .iter()
                .filter(|r| r.token_id == token)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl OrderGateway for ScriptedGateway {
        async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
            let script = self
                .scripts
                .lock()
                .get_mut(&request.token_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(Script::Fill(1.0));

            self.submitted.lock().push(request.clone());

            if matches!(script, Script::RejectSubmit) {
                anyhow::bail!("venue rejected order");
            }

            let order_id = {
                let mut next = self.next_id.lock();
                *next += 1;
                format!("SCRIPT-{}", *next)
            };
            self.orders
                .lock()
                .insert(order_id.clone(), (request.clone(), script));

            Ok(OrderAck {
                order_id,
                exchange_time_ms: now_ms(),
            })
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<CancelAck> {
            Ok(CancelAck { success: true })
        }

        async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>> {
            let orders = self.orders.lock();
            let Some((request, script)) = orders.get(order_id) else {
                return Ok(None);
            };

            let status = match script {
                Script::Fill(fraction) => {
                    let filled = request.size * fraction;
                    OrderStatus {
                        order_id: order_id.to_string(),
                        state: if *fraction >= 1.0 {
                            OrderState::Filled
                        } else {
                            OrderState::Partial
                        },
                        filled_size: filled,
                        avg_fill_price: request.price,
                    }
                }
                Script::NeverFill | Script::RejectSubmit => OrderStatus {
                    order_id: order_id.to_string(),
                    state: OrderState::Acknowledged,
                    filled_size: 0.0,
                    avg_fill_price: 0.0,
                },
            };
            Ok(Some(status))
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            leg1_timeout_ms: 60,
            leg2_timeout_ms: 60,
            unwind_timeout_ms: 60,
            poll_interval_ms: 10,
            ..ExecutorConfig::default()
        }
    }

    fn signal(token: &str, price: f64, size: f64) -> Signal {
        Signal {
            strategy: "underpricing".to_string(),
            market_id: "m1".to_string(),
            token_id: token.to_string(),
            side: Side::Buy,
            target_price: price,
            target_size: size,
            expected_edge: 0.04,
            confidence: 1.0,
            generated_at_ms: now_ms(),
            reason: String::new(),
        }
    }

    fn executor(gateway: Arc<ScriptedGateway>, config: ExecutorConfig) -> (PairedExecutor, Arc<KillSwitch>) {
        let ks = Arc::new(KillSwitch::new(50.0, KillSwitchConfig::default()));
        (PairedExecutor::new(gateway, ks.clone(), config), ks)
    }

    #[tokio::test]
    async fn clean_cycle_fully_fills() {
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0)]),
            ("tok-no", vec![Script::Fill(1.0)]),
        ]));
        let (exec, ks) = executor(gw.clone(), fast_config());

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert!(result.success, "{}", result.error);
        assert_eq!(result.final_state, PairState::FullyFilled);
        assert!(result.leg1_filled && result.leg2_filled);
        assert!((result.leg1_fill_price - 0.46).abs() < 1e-9);
        assert!((result.leg2_fill_price - 0.48).abs() < 1e-9);
        // Captured edge: 0.04 * 2 shares.
        assert!((result.realized_pnl - 0.08).abs() < 1e-9);

        let pair = exec.get_pair(&result.pair_id).unwrap();
        assert!(pair.is_hedged());
        assert_eq!(pair.unhedged_exposure(), 0.0);
        assert!(!ks.is_active());
        assert_eq!(exec.successful_pairs(), 1);
        assert!(exec.active_pairs().is_empty());
    }

    #[tokio::test]
    async fn leg1_submission_failure_is_safe() {
        let gw = Arc::new(ScriptedGateway::new(vec![(
            "tok-yes",
            vec![Script::RejectSubmit],
        )]));
        let (exec, ks) = executor(gw.clone(), fast_config());

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert!(!result.success);
        assert_eq!(result.final_state, PairState::Leg1Failed);
        assert!(!ks.is_active());
        assert_eq!(exec.failed_pairs(), 1);
        // Leg 2 was never submitted.
        assert!(gw.submitted_for("tok-no").is_empty());

        let pair = exec.get_pair(&result.pair_id).unwrap();
        assert!(pair.is_hedged());
    }

    #[tokio::test]
    async fn leg1_timeout_cancels_cleanly() {
        let gw = Arc::new(ScriptedGateway::new(vec![(
            "tok-yes",
            vec![Script::NeverFill],
        )]));
        let (exec, ks) = executor(gw.clone(), fast_config());

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert!(!result.success);
        assert_eq!(result.final_state, PairState::Canceled);
        assert!(result.error.contains("canceled"));
        assert!(!ks.is_active());
        assert!(gw.submitted_for("tok-no").is_empty());
    }

    #[tokio::test]
    async fn leg2_failure_unwinds_successfully() {
        // Leg 1 fills; every leg 2 attempt is rejected; the unwind SELL on
        // the YES token fills.
        let mut config = fast_config();
        config.max_retries = 3;
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0), Script::Fill(1.0)]),
            ("tok-no", vec![Script::RejectSubmit]),
        ]));
        let (exec, ks) = executor(gw.clone(), config);

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert!(!result.success);
        assert_eq!(result.final_state, PairState::Unwound);
        assert!(result.error.contains("unwound"));

        // The unwind order: opposite side at the 25bps discount.
        let yes_orders = gw.submitted_for("tok-yes");
        assert_eq!(yes_orders.len(), 2);
        let unwind = &yes_orders[1];
        assert_eq!(unwind.side, Side::Sell);
        assert!((unwind.price - 0.46 * (1.0 - 0.0025)).abs() < 1e-9);
        assert!((unwind.size - 2.0).abs() < 1e-9);

        // Realized loss equals the discount on the round trip.
        assert!(result.realized_pnl < 0.0);
        assert!((result.realized_pnl - (unwind.price - 0.46) * 2.0).abs() < 1e-9);

        // Unwind succeeded: the pair is hedged and the kill switch is quiet.
        let pair = exec.get_pair(&result.pair_id).unwrap();
        assert!(pair.is_hedged());
        assert!(!ks.is_active());
        assert_eq!(exec.unwind_attempts(), 1);
    }

    #[tokio::test]
    async fn unwind_timeout_abandons_and_arms_kill_switch() {
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0), Script::NeverFill]),
            ("tok-no", vec![Script::RejectSubmit]),
        ]));
        let mut config = fast_config();
        config.max_retries = 0;
        let (exec, ks) = executor(gw.clone(), config);

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert!(!result.success);
        assert_eq!(result.final_state, PairState::Abandoned);

        // Kill switch armed with the pair id in the detail.
        assert!(ks.is_active());
        assert_eq!(ks.reason(), KillReason::UnhedgedPosition);
        assert!(ks.details().contains(&result.pair_id));

        let pair = exec.get_pair(&result.pair_id).unwrap();
        assert!(!pair.is_hedged());
        assert!(pair.unhedged_exposure() > 0.0);
    }

    #[tokio::test]
    async fn leg2_retries_worsen_price_then_fill() {
        let mut config = fast_config();
        config.max_retries = 2;
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0)]),
            ("tok-no", vec![Script::NeverFill, Script::Fill(1.0)]),
        ]));
        let (exec, ks) = executor(gw.clone(), config);

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert!(result.success, "{}", result.error);
        assert_eq!(result.final_state, PairState::FullyFilled);
        assert!(!ks.is_active());

        // Retry was submitted 10bps worse than the original BUY price.
        let no_orders = gw.submitted_for("tok-no");
        assert_eq!(no_orders.len(), 2);
        assert!((no_orders[0].price - 0.48).abs() < 1e-9);
        assert!((no_orders[1].price - 0.48 * 1.001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retries_abort_when_edge_gone() {
        let mut config = fast_config();
        config.max_retries = 3;
        // Demand more edge after adjustment than the pair ever had.
        config.min_edge_after_adjustment_cents = 10.0;
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0), Script::Fill(1.0)]),
            ("tok-no", vec![Script::NeverFill]),
        ]));
        let (exec, _ks) = executor(gw.clone(), config);

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        // Only the initial leg-2 order went out; no retry.
        assert_eq!(gw.submitted_for("tok-no").len(), 1);
        assert_eq!(result.final_state, PairState::Unwound);
    }

    #[tokio::test]
    async fn fill_threshold_boundary() {
        // 99% fill counts as fully filled.
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0)]),
            ("tok-no", vec![Script::Fill(0.99)]),
        ]));
        let (exec, _) = executor(gw, fast_config());
        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;
        assert!(result.success);
        assert_eq!(result.final_state, PairState::FullyFilled);

        // 98.9% does not.
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0), Script::Fill(1.0)]),
            ("tok-no", vec![Script::Fill(0.989), Script::NeverFill]),
        ]));
        let mut config = fast_config();
        config.max_retries = 0;
        let (exec, _) = executor(gw, config);
        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;
        assert!(!result.success);
        assert_ne!(result.final_state, PairState::FullyFilled);
    }

    #[tokio::test]
    async fn pairs_needing_unwind_query() {
        let gw = Arc::new(ScriptedGateway::new(vec![
            ("tok-yes", vec![Script::Fill(1.0)]),
            ("tok-no", vec![Script::RejectSubmit]),
        ]));
        let mut config = fast_config();
        config.auto_unwind = false;
        let (exec, ks) = executor(gw, config);

        let result = exec
            .execute(&signal("tok-yes", 0.46, 2.0), &signal("tok-no", 0.48, 2.0))
            .await;

        assert_eq!(result.final_state, PairState::Leg2Failed);
        assert_eq!(exec.pairs_needing_unwind().len(), 1);
        assert!(exec.total_unhedged_exposure() > 0.0);
        // With auto-unwind disabled the kill switch fires directly.
        assert!(ks.is_active());
    }

    #[test]
    fn price_adjustment_math() {
        let buy = PairedExecutor::adjusted_price(0.48, Side::Buy, 2, 10.0);
        assert!((buy - 0.48 * 1.002).abs() < 1e-12);

        let sell = PairedExecutor::adjusted_price(0.48, Side::Sell, 1, 10.0);
        assert!((sell - 0.48 * 0.999).abs() < 1e-12);
    }

    #[test]
    fn unwind_price_math() {
        let from_buy = PairedExecutor::unwind_price(0.46, Side::Buy, 25.0);
        assert!((from_buy - 0.46 * 0.9975).abs() < 1e-12);

        let from_sell = PairedExecutor::unwind_price(0.46, Side::Sell, 25.0);
        assert!((from_sell - 0.46 * 1.0025).abs() < 1e-12);
    }
}
