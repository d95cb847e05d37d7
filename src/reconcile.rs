// =============================================================================
// Reconciler — startup compare-and-resolve of local vs. exchange state
// =============================================================================
//
// Runs before trading. Loads the best available local snapshot, fetches the
// exchange's open orders, positions, and balance, classifies every
// difference, and resolves according to the configured strategy. Critical
// discrepancies require operator approval; without an approval callback they
// fail reconciliation outright.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::polymarket::gateway::{ExchangePosition, VenueApi};
use crate::state::{PersistedOrder, PersistedPosition, StateManager, SystemState};
use crate::types::{now_ms, POSITION_EPSILON};

// ---------------------------------------------------------------------------
// Discrepancies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    /// Exchange has an order we don't know about.
    MissingLocalOrder,
    /// We have a live order the exchange no longer shows.
    MissingRemoteOrder,
    /// Same id, different state or filled size.
    OrderStateMismatch,
    /// Position size differs beyond tolerance.
    PositionSizeMismatch,
    /// Balance gap above tolerance.
    BalanceMismatch,
    /// Exchange position we don't track (or whose market mapping is absent).
    UnknownPosition,
}

impl std::fmt::Display for DiscrepancyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingLocalOrder => "MISSING_LOCAL_ORDER",
            Self::MissingRemoteOrder => "MISSING_REMOTE_ORDER",
            Self::OrderStateMismatch => "ORDER_STATE_MISMATCH",
            Self::PositionSizeMismatch => "POSITION_SIZE_MISMATCH",
            Self::BalanceMismatch => "BALANCE_MISMATCH",
            Self::UnknownPosition => "UNKNOWN_POSITION",
        };
        write!(f, "{s}")
    }
}

/// One difference between local and exchange state.
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyType,
    /// order_id, token_id, or "balance".
    pub identifier: String,
    pub local_value: String,
    pub remote_value: String,
    pub details: String,
    /// Critical discrepancies block trading until approved.
    pub is_critical: bool,
}

/// Outcome of a reconciliation run.
#[derive(Debug, Default)]
pub struct ReconciliationResult {
    pub success: bool,
    pub is_consistent: bool,
    pub discrepancies: Vec<Discrepancy>,
    pub resolved_state: Option<SystemState>,
    pub orders_synced: usize,
    pub positions_synced: usize,
    pub orders_canceled: usize,
    pub error_message: String,
}

impl ReconciliationResult {
    pub fn has_critical_discrepancies(&self) -> bool {
        self.discrepancies.iter().any(|d| d.is_critical)
    }

    pub fn summary(&self) -> String {
        format!(
            "success={} discrepancies={} (critical={}) orders_synced={} positions_synced={} canceled={}",
            self.success,
            self.discrepancies.len(),
            self.discrepancies.iter().filter(|d| d.is_critical).count(),
            self.orders_synced,
            self.positions_synced,
            self.orders_canceled,
        )
    }
}

/// How discrepancies get resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Overwrite local to match the exchange (default, safest).
    TrustExchange,
    /// Keep local state as-is. Testing only.
    TrustLocal,
    /// Fail on any discrepancy.
    Manual,
    /// Like TrustExchange but always cancels orphan orders.
    CancelOrphans,
}

pub type ApprovalCallback = Box<dyn Fn(&[Discrepancy]) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ReconcilerConfig {
    pub strategy: ResolutionStrategy,
    pub cancel_orphan_orders: bool,
    /// Balance gap tolerated, as a fraction of the exchange balance.
    pub balance_tolerance_percent: f64,
    /// Position sizes closer than this count as matching.
    pub position_size_tolerance: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::TrustExchange,
            cancel_orphan_orders: true,
            balance_tolerance_percent: 0.01,
            position_size_tolerance: POSITION_EPSILON,
        }
    }
}

/// Balance gaps above this fraction of the exchange balance are critical.
const CRITICAL_BALANCE_GAP: f64 = 0.05;

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    venue: Arc<dyn VenueApi>,
    state_manager: Arc<StateManager>,
    config: ReconcilerConfig,
    approval_callback: Option<ApprovalCallback>,
}

impl Reconciler {
    pub fn new(
        venue: Arc<dyn VenueApi>,
        state_manager: Arc<StateManager>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            venue,
            state_manager,
            config,
            approval_callback: None,
        }
    }

    pub fn set_approval_callback(&mut self, cb: ApprovalCallback) {
        self.approval_callback = Some(cb);
    }

    /// Main entry point: load local state (primary then backups) and
    /// reconcile against the exchange.
    pub async fn reconcile(&self) -> ReconciliationResult {
        info!("starting reconciliation");

        let local_state = match self.state_manager.load_best_available() {
            Some(state) => {
                info!(
                    orders = state.open_orders.len(),
                    positions = state.positions.len(),
                    balance = state.balance,
                    "loaded local state"
                );
                state
            }
            None => {
                warn!("no local state found, starting fresh");
                SystemState::default()
            }
        };

        self.reconcile_with_state(local_state).await
    }

    /// Reconcile an explicit local snapshot (used directly by tests).
    pub async fn reconcile_with_state(&self, local_state: SystemState) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();

        // ── 1. Fetch exchange state ─────────────────────────────────────
        let remote_orders = match self.venue.fetch_open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                result.error_message = format!("failed to fetch open orders: {e:#}");
                return result;
            }
        };
        let remote_positions = match self.venue.fetch_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                result.error_message = format!("failed to fetch positions: {e:#}");
                return result;
            }
        };
        let remote_balance = match self.venue.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                result.error_message = format!("failed to fetch balance: {e:#}");
                return result;
            }
        };

        info!(
            orders = remote_orders.len(),
            positions = remote_positions.len(),
            balance = remote_balance,
            "fetched exchange state"
        );

        // ── 2. Compare ──────────────────────────────────────────────────
        result
            .discrepancies
            .extend(self.compare_orders(&local_state.open_orders, &remote_orders));
        result
            .discrepancies
            .extend(self.compare_positions(&local_state.positions, &remote_positions));
        if let Some(d) = self.compare_balance(local_state.balance, remote_balance) {
            result.discrepancies.push(d);
        }

        for d in &result.discrepancies {
            warn!(
                kind = %d.kind,
                identifier = %d.identifier,
                local = %d.local_value,
                remote = %d.remote_value,
                critical = d.is_critical,
                "reconciliation discrepancy"
            );
        }

        result.is_consistent = result.discrepancies.is_empty();

        // ── 3. Approval gate for critical discrepancies ─────────────────
        if result.has_critical_discrepancies() {
            match &self.approval_callback {
                Some(cb) => {
                    if !cb(&result.discrepancies) {
                        result.error_message =
                            "operator did not approve critical discrepancies".to_string();
                        return result;
                    }
                    info!("critical discrepancies approved by operator");
                }
                None => {
                    result.error_message =
                        "critical discrepancies found and no approval callback set".to_string();
                    return result;
                }
            }
        }

        // ── 4. Resolve ──────────────────────────────────────────────────
        let resolved = match self.config.strategy {
            ResolutionStrategy::Manual => {
                if !result.is_consistent {
                    result.error_message =
                        "manual strategy: discrepancies require operator resolution".to_string();
                    return result;
                }
                local_state.clone()
            }
            ResolutionStrategy::TrustLocal => local_state.clone(),
            ResolutionStrategy::TrustExchange | ResolutionStrategy::CancelOrphans => {
                let cancel_orphans = self.config.cancel_orphan_orders
                    || self.config.strategy == ResolutionStrategy::CancelOrphans;

                if cancel_orphans {
                    result.orders_canceled = self
                        .cancel_orphan_orders(&local_state.open_orders, &remote_orders)
                        .await;
                }

                self.resolve_to_exchange(
                    &local_state,
                    &remote_orders,
                    &remote_positions,
                    remote_balance,
                    &result.discrepancies,
                )
            }
        };

        result.orders_synced = resolved.open_orders.len();
        result.positions_synced = resolved.positions.len();

        // ── 5. Persist ──────────────────────────────────────────────────
        self.state_manager.replace_state(resolved.clone());
        if let Err(e) = self.state_manager.save() {
            result.error_message = format!("failed to persist resolved state: {e:#}");
            return result;
        }

        result.resolved_state = Some(resolved);
        result.success = true;

        info!(summary = %result.summary(), "reconciliation complete");
        result
    }

    // -------------------------------------------------------------------------
    // Comparison
    // -------------------------------------------------------------------------

    fn compare_orders(
        &self,
        local: &[PersistedOrder],
        remote: &[PersistedOrder],
    ) -> Vec<Discrepancy> {
        let mut discrepancies = Vec::new();

        // Orders on the exchange we don't know about.
        for remote_order in remote {
            if !local.iter().any(|o| o.order_id == remote_order.order_id) {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyType::MissingLocalOrder,
                    identifier: remote_order.order_id.clone(),
                    local_value: "not present".to_string(),
                    remote_value: format!(
                        "{}@{:.4} x {:.2} ({})",
                        remote_order.side, remote_order.price, remote_order.size, remote_order.state
                    ),
                    details: "order on exchange not in local state".to_string(),
                    is_critical: true,
                });
            }
        }

        // Live local orders the exchange no longer shows.
        for local_order in local {
            if local_order.is_active()
                && !remote.iter().any(|o| o.order_id == local_order.order_id)
            {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyType::MissingRemoteOrder,
                    identifier: local_order.order_id.clone(),
                    local_value: format!(
                        "{}@{:.4} x {:.2} ({})",
                        local_order.side, local_order.price, local_order.size, local_order.state
                    ),
                    remote_value: "not present".to_string(),
                    details: "local order not found on exchange; may have filled or been canceled"
                        .to_string(),
                    is_critical: true,
                });
            }
        }

        // Matching ids with diverging state.
        for local_order in local {
            if let Some(remote_order) = remote.iter().find(|o| o.order_id == local_order.order_id)
            {
                let filled_differs = (local_order.filled_size - remote_order.filled_size).abs()
                    > self.config.position_size_tolerance;
                if local_order.state != remote_order.state || filled_differs {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyType::OrderStateMismatch,
                        identifier: local_order.order_id.clone(),
                        local_value: format!(
                            "{} filled={:.2}",
                            local_order.state, local_order.filled_size
                        ),
                        remote_value: format!(
                            "{} filled={:.2}",
                            remote_order.state, remote_order.filled_size
                        ),
                        details: "order state differs between local and exchange".to_string(),
                        is_critical: filled_differs,
                    });
                }
            }
        }

        discrepancies
    }

    fn compare_positions(
        &self,
        local: &[PersistedPosition],
        remote: &[ExchangePosition],
    ) -> Vec<Discrepancy> {
        let mut discrepancies = Vec::new();

        for remote_pos in remote {
            if remote_pos.size.abs() <= POSITION_EPSILON {
                continue;
            }

            // An explicit token->market mapping is required; a missing one
            // cannot be patched by guessing.
            if remote_pos.market_id.is_none() {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyType::UnknownPosition,
                    identifier: remote_pos.token_id.clone(),
                    local_value: "-".to_string(),
                    remote_value: format!("size={:.2}", remote_pos.size),
                    details: "exchange position carries no market mapping".to_string(),
                    is_critical: true,
                });
                continue;
            }

            match local.iter().find(|p| p.token_id == remote_pos.token_id) {
                None => {
                    discrepancies.push(Discrepancy {
                        kind: DiscrepancyType::UnknownPosition,
                        identifier: remote_pos.token_id.clone(),
                        local_value: "not tracked".to_string(),
                        remote_value: format!("size={:.2}", remote_pos.size),
                        details: "position on exchange not tracked locally".to_string(),
                        is_critical: true,
                    });
                }
                Some(local_pos) => {
                    let diff = (local_pos.size - remote_pos.size).abs();
                    if diff > self.config.position_size_tolerance {
                        discrepancies.push(Discrepancy {
                            kind: DiscrepancyType::PositionSizeMismatch,
                            identifier: remote_pos.token_id.clone(),
                            local_value: format!("size={:.4}", local_pos.size),
                            remote_value: format!("size={:.4}", remote_pos.size),
                            details: "position size differs beyond tolerance".to_string(),
                            is_critical: true,
                        });
                    }
                }
            }
        }

        // Local positions the exchange doesn't show at all.
        for local_pos in local {
            if local_pos.size.abs() > POSITION_EPSILON
                && !remote.iter().any(|p| p.token_id == local_pos.token_id)
            {
                discrepancies.push(Discrepancy {
                    kind: DiscrepancyType::PositionSizeMismatch,
                    identifier: local_pos.token_id.clone(),
                    local_value: format!("size={:.4}", local_pos.size),
                    remote_value: "size=0".to_string(),
                    details: "local position not present on exchange".to_string(),
                    is_critical: true,
                });
            }
        }

        discrepancies
    }

    fn compare_balance(&self, local: f64, remote: f64) -> Option<Discrepancy> {
        let diff = (local - remote).abs();
        let tolerance = self.config.balance_tolerance_percent * remote.abs();

        if diff <= tolerance {
            return None;
        }

        let gap_fraction = if remote.abs() > 0.0 { diff / remote.abs() } else { 1.0 };

        Some(Discrepancy {
            kind: DiscrepancyType::BalanceMismatch,
            identifier: "balance".to_string(),
            local_value: format!("{local:.2}"),
            remote_value: format!("{remote:.2}"),
            details: format!("balance differs by {:.2}%", gap_fraction * 100.0),
            is_critical: gap_fraction > CRITICAL_BALANCE_GAP,
        })
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    fn resolve_to_exchange(
        &self,
        local: &SystemState,
        remote_orders: &[PersistedOrder],
        remote_positions: &[ExchangePosition],
        remote_balance: f64,
        discrepancies: &[Discrepancy],
    ) -> SystemState {
        let mut resolved = local.clone();

        resolved.balance = remote_balance;
        if resolved.starting_balance <= 0.0 {
            resolved.starting_balance = remote_balance;
        }

        resolved.open_orders = remote_orders.to_vec();
        resolved.positions = remote_positions
            .iter()
            .filter(|p| p.size.abs() > POSITION_EPSILON)
            .filter_map(|p| {
                let market_id = p.market_id.clone()?;
                Some(PersistedPosition {
                    market_id,
                    token_id: p.token_id.clone(),
                    outcome: p.outcome.clone(),
                    size: p.size,
                    entry_price: p.avg_price,
                    cost_basis: p.size * p.avg_price,
                    unrealized_pnl: 0.0,
                    realized_pnl: 0.0,
                    entry_time: now_ms(),
                    last_update: now_ms(),
                })
            })
            .collect();

        resolved.total_exposure = resolved
            .positions
            .iter()
            .map(|p| p.size * p.entry_price)
            .sum();

        // A state mismatch whose filled size grew remotely is a missed fill.
        let missed_fills = discrepancies
            .iter()
            .filter(|d| d.kind == DiscrepancyType::OrderStateMismatch && d.is_critical)
            .count();
        resolved.total_fills += missed_fills as i64;

        resolved
    }

    async fn cancel_orphan_orders(
        &self,
        local: &[PersistedOrder],
        remote: &[PersistedOrder],
    ) -> usize {
        let mut canceled = 0;

        for order in local {
            let orphaned =
                order.is_active() && !remote.iter().any(|o| o.order_id == order.order_id);
            if !orphaned {
                continue;
            }

            match self.venue.cancel_order(&order.order_id).await {
                Ok(ack) if ack.success => {
                    info!(order_id = %order.order_id, "orphan order canceled");
                    canceled += 1;
                }
                Ok(_) => {
                    warn!(order_id = %order.order_id, "orphan order cancel rejected");
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "orphan order cancel failed");
                }
            }
        }

        canceled
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Runs the reconciler once and exposes a "ready" flag. The main loop
/// refuses to start trading when the guard is not ready.
pub struct ReconciliationGuard {
    result: ReconciliationResult,
    ready: bool,
}

impl ReconciliationGuard {
    pub async fn run(reconciler: &Reconciler) -> Self {
        let result = reconciler.reconcile().await;
        let ready = result.success;
        if !ready {
            warn!(error = %result.error_message, "reconciliation failed; trading blocked");
        }
        Self { result, ready }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn result(&self) -> &ReconciliationResult {
        &self.result
    }
}
