// =============================================================================
// Position Manager — per-token positions, realized/unrealized PnL, fees
// =============================================================================
//
// Positions are keyed by token id and uniquely owned here. Fills extend or
// reduce positions; settlements realize every position in a market at $1
// (winner) or $0 (loser). Aggregate realized PnL, daily realized PnL, and
// fees are tracked alongside.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{now_ms, Fill, Notional, Price, Side, Size, POSITION_EPSILON};

/// Position in a single token/outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_id: String,
    pub market_id: String,
    /// "YES" or "NO".
    pub outcome_name: String,

    /// Positive = long.
    pub size: Size,
    pub avg_entry_price: Price,
    pub cost_basis: Notional,

    pub realized_pnl: Notional,
    pub total_fees: Notional,

    pub last_mark_price: Price,
    pub unrealized_pnl: Notional,

    pub first_entry_ms: i64,
    pub last_update_ms: i64,
}

impl Position {
    fn new(token_id: &str, market_id: &str, outcome_name: &str) -> Self {
        Self {
            token_id: token_id.to_string(),
            market_id: market_id.to_string(),
            outcome_name: outcome_name.to_string(),
            size: 0.0,
            avg_entry_price: 0.0,
            cost_basis: 0.0,
            realized_pnl: 0.0,
            total_fees: 0.0,
            last_mark_price: 0.0,
            unrealized_pnl: 0.0,
            first_entry_ms: now_ms(),
            last_update_ms: now_ms(),
        }
    }

    pub fn total_pnl(&self) -> Notional {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn market_value(&self) -> Notional {
        self.size * self.last_mark_price
    }

    pub fn is_open(&self) -> bool {
        self.size.abs() > POSITION_EPSILON
    }
}

struct Aggregates {
    total_realized_pnl: Notional,
    daily_realized_pnl: Notional,
    total_fees: Notional,
}

/// Snapshot of all positions plus aggregates, for persistence/restore.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub positions: Vec<Position>,
    pub realized_pnl: Notional,
    pub total_fees: Notional,
    pub timestamp_ms: i64,
}

/// Thread-safe owner of all positions.
pub struct PositionManager {
    inner: Mutex<(HashMap<String, Position>, Aggregates)>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((
                HashMap::new(),
                Aggregates {
                    total_realized_pnl: 0.0,
                    daily_realized_pnl: 0.0,
                    total_fees: 0.0,
                },
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply a fill. Same-sign fills extend the position and re-average the
    /// entry; opposing fills realize PnL on the reduced amount.
    pub fn record_fill(&self, fill: &Fill) {
        self.record_fill_with_outcome(fill, "");
    }

    /// Like [`record_fill`](Self::record_fill) but labels a newly created
    /// position with its outcome name.
    pub fn record_fill_with_outcome(&self, fill: &Fill, outcome_name: &str) {
        let mut inner = self.inner.lock();
        let (positions, aggregates) = &mut *inner;

        let pos = positions
            .entry(fill.token_id.clone())
            .or_insert_with(|| Position::new(&fill.token_id, &fill.market_id, outcome_name));

        let signed_size = match fill.side {
            Side::Buy => fill.size,
            Side::Sell => -fill.size,
        };
        let fill_notional = fill.price * fill.size;

        let same_sign = (pos.size >= 0.0 && fill.side == Side::Buy)
            || (pos.size <= 0.0 && fill.side == Side::Sell);

        if same_sign {
            let new_size = pos.size + signed_size;
            pos.cost_basis += fill_notional;
            if new_size.abs() > POSITION_EPSILON {
                pos.avg_entry_price = pos.cost_basis / new_size.abs();
            }
            pos.size = new_size;
        } else {
            let reduction = signed_size.abs().min(pos.size.abs());
            let mut realized = reduction * (fill.price - pos.avg_entry_price);
            if fill.side == Side::Sell {
                realized = -realized;
            }

            pos.realized_pnl += realized - fill.fee;
            aggregates.total_realized_pnl += realized - fill.fee;
            aggregates.daily_realized_pnl += realized - fill.fee;

            pos.size += signed_size;
            pos.cost_basis = pos.size.abs() * pos.avg_entry_price;
        }

        pos.total_fees += fill.fee;
        pos.last_update_ms = now_ms();
        aggregates.total_fees += fill.fee;

        debug!(
            token_id = %fill.token_id,
            size = pos.size,
            avg_price = pos.avg_entry_price,
            realized_pnl = pos.realized_pnl,
            "position updated"
        );
    }

    /// Re-mark one token's position; recomputes unrealized PnL.
    pub fn mark_to_market(&self, token_id: &str, mark_price: Price) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.0.get_mut(token_id) else {
            return;
        };

        pos.last_mark_price = mark_price;
        pos.unrealized_pnl = if pos.size.abs() > POSITION_EPSILON {
            pos.size * (mark_price - pos.avg_entry_price)
        } else {
            0.0
        };
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    /// Realize every position in `market_id`: the winning token settles to
    /// $1 per share, every other token to $0. Sizes and cost bases zero out.
    pub fn record_settlement(&self, market_id: &str, winning_token_id: &str) {
        let mut inner = self.inner.lock();
        let (positions, aggregates) = &mut *inner;

        for (token_id, pos) in positions.iter_mut() {
            if pos.market_id != market_id {
                continue;
            }

            let pnl = if token_id == winning_token_id {
                pos.size * (1.0 - pos.avg_entry_price) - pos.total_fees
            } else {
                -pos.cost_basis - pos.total_fees
            };

            pos.realized_pnl += pnl;
            aggregates.total_realized_pnl += pnl;
            aggregates.daily_realized_pnl += pnl;

            pos.size = 0.0;
            pos.cost_basis = 0.0;
            pos.unrealized_pnl = 0.0;
            pos.last_update_ms = now_ms();

            info!(
                market_id,
                token_id = %token_id,
                winner = token_id == winning_token_id,
                pnl,
                "settlement recorded"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_position(&self, token_id: &str) -> Option<Position> {
        self.inner.lock().0.get(token_id).cloned()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.inner.lock().0.values().cloned().collect()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.inner
            .lock()
            .0
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    pub fn positions_for_market(&self, market_id: &str) -> Vec<Position> {
        self.inner
            .lock()
            .0
            .values()
            .filter(|p| p.market_id == market_id)
            .cloned()
            .collect()
    }

    pub fn total_realized_pnl(&self) -> Notional {
        self.inner.lock().1.total_realized_pnl
    }

    pub fn daily_realized_pnl(&self) -> Notional {
        self.inner.lock().1.daily_realized_pnl
    }

    pub fn total_unrealized_pnl(&self) -> Notional {
        self.inner.lock().0.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn total_pnl(&self) -> Notional {
        let inner = self.inner.lock();
        inner.1.total_realized_pnl + inner.0.values().map(|p| p.unrealized_pnl).sum::<f64>()
    }

    pub fn total_fees(&self) -> Notional {
        self.inner.lock().1.total_fees
    }

    /// Sum of |market value| across positions.
    pub fn gross_exposure(&self) -> Notional {
        self.inner
            .lock()
            .0
            .values()
            .map(|p| p.market_value().abs())
            .sum()
    }

    /// Signed sum of market values.
    pub fn net_exposure(&self) -> Notional {
        self.inner.lock().0.values().map(|p| p.market_value()).sum()
    }

    pub fn reset_daily_pnl(&self) {
        self.inner.lock().1.daily_realized_pnl = 0.0;
    }

    // -------------------------------------------------------------------------
    // Snapshot / restore
    // -------------------------------------------------------------------------

    pub fn create_snapshot(&self) -> PositionSnapshot {
        let inner = self.inner.lock();
        PositionSnapshot {
            positions: inner.0.values().cloned().collect(),
            realized_pnl: inner.1.total_realized_pnl,
            total_fees: inner.1.total_fees,
            timestamp_ms: now_ms(),
        }
    }

    pub fn restore_from_snapshot(&self, snapshot: &PositionSnapshot) {
        let mut inner = self.inner.lock();
        inner.0.clear();
        for pos in &snapshot.positions {
            inner.0.insert(pos.token_id.clone(), pos.clone());
        }
        inner.1.total_realized_pnl = snapshot.realized_pnl;
        inner.1.total_fees = snapshot.total_fees;

        info!(positions = inner.0.len(), "positions restored from snapshot");
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PositionManager")
            .field("positions", &inner.0.len())
            .field("total_realized_pnl", &inner.1.total_realized_pnl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fill(token: &str, side: Side, price: f64, size: f64, fee: f64) -> Fill {
        Fill {
            order_id: "o".to_string(),
            trade_id: String::new(),
            market_id: "m1".to_string(),
            token_id: token.to_string(),
            side,
            price,
            size,
            notional: price * size,
            fee,
            fill_time_ms: now_ms(),
            exchange_time_ms: 0,
        }
    }

    #[test]
    fn buy_fill_creates_position() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.46, 2.0, 0.0));

        let pos = pm.get_position("t1").unwrap();
        assert!((pos.size - 2.0).abs() < 1e-9);
        assert!((pos.avg_entry_price - 0.46).abs() < 1e-9);
        assert!((pos.cost_basis - 0.92).abs() < 1e-9);
        assert!(pos.is_open());
    }

    #[test]
    fn same_side_fills_reaverage_entry() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.40, 1.0, 0.0));
        pm.record_fill(&fill("t1", Side::Buy, 0.60, 1.0, 0.0));

        let pos = pm.get_position("t1").unwrap();
        assert!((pos.size - 2.0).abs() < 1e-9);
        assert!((pos.avg_entry_price - 0.50).abs() < 1e-9);
        assert!((pos.cost_basis - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reducing_fill_realizes_pnl_and_updates_basis() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.50, 2.0, 0.0));
        pm.record_fill(&fill("t1", Side::Sell, 0.40, 1.0, 0.0));

        let pos = pm.get_position("t1").unwrap();
        assert!((pos.size - 1.0).abs() < 1e-9);
        // realized = -(1.0 * (0.40 - 0.50)) = +0.10 on the reduced share
        assert!((pos.realized_pnl - 0.10).abs() < 1e-9);
        assert!((pos.cost_basis - 0.50).abs() < 1e-9);
        assert!((pm.total_realized_pnl() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn fees_accumulate_on_both_legs() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.50, 2.0, 0.02));
        pm.record_fill(&fill("t1", Side::Sell, 0.50, 1.0, 0.01));

        let pos = pm.get_position("t1").unwrap();
        assert!((pos.total_fees - 0.03).abs() < 1e-9);
        assert!((pm.total_fees() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn mark_to_market_sets_unrealized() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.46, 2.0, 0.0));
        pm.mark_to_market("t1", 0.50);

        let pos = pm.get_position("t1").unwrap();
        assert!((pos.unrealized_pnl - 0.08).abs() < 1e-9);
        assert!((pos.market_value() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn settlement_realizes_winner_and_loser() {
        let pm = PositionManager::new();
        let mut yes = fill("t_yes", Side::Buy, 0.46, 2.0, 0.01);
        yes.market_id = "m1".to_string();
        let mut no = fill("t_no", Side::Buy, 0.48, 2.0, 0.01);
        no.market_id = "m1".to_string();
        pm.record_fill(&yes);
        pm.record_fill(&no);

        pm.record_settlement("m1", "t_yes");

        let winner = pm.get_position("t_yes").unwrap();
        let loser = pm.get_position("t_no").unwrap();
        // Winner: 2.0 * (1 - 0.46) - 0.01 = 1.07
        assert!((winner.realized_pnl - 1.07).abs() < 1e-9);
        // Loser: -(2.0 * 0.48) - 0.01 = -0.97
        assert!((loser.realized_pnl + 0.97).abs() < 1e-9);
        assert!(!winner.is_open());
        assert!(!loser.is_open());
        assert!((pm.total_realized_pnl() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn aggregate_realized_matches_position_sum() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.50, 4.0, 0.01));
        pm.record_fill(&fill("t1", Side::Sell, 0.55, 2.0, 0.01));
        pm.record_fill(&fill("t2", Side::Buy, 0.30, 3.0, 0.0));
        pm.record_settlement("m1", "t2");

        let sum: f64 = pm.all_positions().iter().map(|p| p.realized_pnl).sum();
        assert!((pm.total_realized_pnl() - sum).abs() < 1e-9);
    }

    #[test]
    fn exposure_queries() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.50, 2.0, 0.0));
        pm.record_fill(&fill("t2", Side::Buy, 0.25, 4.0, 0.0));
        pm.mark_to_market("t1", 0.50);
        pm.mark_to_market("t2", 0.25);

        assert!((pm.gross_exposure() - 2.0).abs() < 1e-9);
        assert!((pm.net_exposure() - 2.0).abs() < 1e-9);
        assert_eq!(pm.open_positions().len(), 2);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.46, 2.0, 0.01));
        let snap = pm.create_snapshot();

        let restored = PositionManager::new();
        restored.restore_from_snapshot(&snap);

        let pos = restored.get_position("t1").unwrap();
        assert!((pos.size - 2.0).abs() < 1e-9);
        assert!((restored.total_fees() - 0.01).abs() < 1e-9);
        assert!((restored.total_realized_pnl() - pm.total_realized_pnl()).abs() < 1e-9);
    }

    #[test]
    fn daily_pnl_resets_independently() {
        let pm = PositionManager::new();
        pm.record_fill(&fill("t1", Side::Buy, 0.50, 2.0, 0.0));
        pm.record_fill(&fill("t1", Side::Sell, 0.40, 2.0, 0.0));

        assert!(pm.daily_realized_pnl() > 0.0);
        let total = pm.total_realized_pnl();

        pm.reset_daily_pnl();
        assert_eq!(pm.daily_realized_pnl(), 0.0);
        assert!((pm.total_realized_pnl() - total).abs() < 1e-9);
    }
}
