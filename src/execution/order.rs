// =============================================================================
// Order — full lifecycle tracking with monotonic state transitions
// =============================================================================
//
// PENDING -> SENT -> ACKNOWLEDGED -> (PARTIAL)* -> FILLED, with CANCELED,
// REJECTED, and EXPIRED as alternative terminals. Once terminal, an order
// never changes state again; late events are dropped with a warning.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{
    now_ms, Fill, Notional, OrderState, OrderType, Price, Side, Signal, Size, POSITION_EPSILON,
};

/// Generate a unique client order id.
pub fn generate_order_id() -> String {
    format!("ORD-{}", uuid::Uuid::new_v4().simple())
}

/// An order through its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Our id, assigned before submission.
    pub client_order_id: String,
    /// Exchange id, assigned on acknowledgment.
    #[serde(default)]
    pub exchange_order_id: String,
    pub strategy: String,

    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Price,
    pub original_size: Size,
    #[serde(default)]
    pub filled_size: Size,
    pub remaining_size: Size,

    pub state: OrderState,

    pub created_at_ms: i64,
    #[serde(default)]
    pub sent_at_ms: i64,
    #[serde(default)]
    pub acked_at_ms: i64,
    #[serde(default)]
    pub completed_at_ms: i64,
    #[serde(default)]
    pub exchange_ack_time_ms: i64,

    #[serde(default)]
    pub fills: Vec<Fill>,
    #[serde(default)]
    pub total_fees: Notional,

    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_order_id: Option<String>,
}

impl Order {
    pub fn from_signal(signal: &Signal, order_type: OrderType) -> Self {
        Self {
            client_order_id: generate_order_id(),
            exchange_order_id: String::new(),
            strategy: signal.strategy.clone(),
            market_id: signal.market_id.clone(),
            token_id: signal.token_id.clone(),
            side: signal.side,
            order_type,
            price: signal.target_price,
            original_size: signal.target_size,
            filled_size: 0.0,
            remaining_size: signal.target_size,
            state: OrderState::Pending,
            created_at_ms: now_ms(),
            sent_at_ms: 0,
            acked_at_ms: 0,
            completed_at_ms: 0,
            exchange_ack_time_ms: 0,
            fills: Vec::new(),
            total_fees: 0.0,
            reject_reason: String::new(),
            retry_count: 0,
            paired_order_id: None,
        }
    }

    // -------------------------------------------------------------------------
    // Computed values
    // -------------------------------------------------------------------------

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn average_fill_price(&self) -> Price {
        if self.filled_size <= POSITION_EPSILON {
            return 0.0;
        }
        let notional: f64 = self.fills.iter().map(|f| f.price * f.size).sum();
        notional / self.filled_size
    }

    pub fn filled_notional(&self) -> Notional {
        self.fills.iter().map(|f| f.price * f.size).sum()
    }

    // -------------------------------------------------------------------------
    // State transitions
    // -------------------------------------------------------------------------

    pub fn mark_sent(&mut self) {
        if !self.transition_allowed(OrderState::Sent) {
            return;
        }
        self.state = OrderState::Sent;
        self.sent_at_ms = now_ms();
    }

    pub fn mark_acknowledged(&mut self, exchange_id: &str, exchange_time_ms: i64) {
        if !self.transition_allowed(OrderState::Acknowledged) {
            return;
        }
        self.state = OrderState::Acknowledged;
        self.exchange_order_id = exchange_id.to_string();
        self.acked_at_ms = now_ms();
        self.exchange_ack_time_ms = exchange_time_ms;
    }

    /// Apply a fill; transitions to PARTIAL or FILLED depending on the
    /// cumulative filled size.
    pub fn apply_fill(&mut self, fill: Fill) {
        if self.is_terminal() {
            warn!(
                order_id = %self.client_order_id,
                state = %self.state,
                "fill arrived for terminal order, dropped"
            );
            return;
        }

        self.filled_size += fill.size;
        self.remaining_size = (self.original_size - self.filled_size).max(0.0);
        self.total_fees += fill.fee;
        self.fills.push(fill);

        if self.filled_size + POSITION_EPSILON >= self.original_size {
            self.state = OrderState::Filled;
            self.completed_at_ms = now_ms();
        } else {
            self.state = OrderState::Partial;
        }
    }

    pub fn mark_canceled(&mut self) {
        if !self.transition_allowed(OrderState::Canceled) {
            return;
        }
        self.state = OrderState::Canceled;
        self.completed_at_ms = now_ms();
    }

    pub fn mark_rejected(&mut self, reason: &str) {
        if !self.transition_allowed(OrderState::Rejected) {
            return;
        }
        self.state = OrderState::Rejected;
        self.reject_reason = reason.to_string();
        self.completed_at_ms = now_ms();
    }

    pub fn mark_expired(&mut self) {
        if !self.transition_allowed(OrderState::Expired) {
            return;
        }
        self.state = OrderState::Expired;
        self.completed_at_ms = now_ms();
    }

    /// Terminal states are stable, and no event moves an order backward.
    fn transition_allowed(&self, next: OrderState) -> bool {
        if self.is_terminal() {
            warn!(
                order_id = %self.client_order_id,
                from = %self.state,
                to = %next,
                "transition on terminal order dropped"
            );
            return false;
        }

        let backwards = matches!(
            (self.state, next),
            (OrderState::Acknowledged, OrderState::Sent)
                | (OrderState::Partial, OrderState::Sent)
                | (OrderState::Partial, OrderState::Acknowledged)
        );
        if backwards {
            warn!(
                order_id = %self.client_order_id,
                from = %self.state,
                to = %next,
                "backward transition dropped"
            );
            return false;
        }

        true
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> Signal {
        Signal {
            strategy: "underpricing".to_string(),
            market_id: "m1".to_string(),
            token_id: "tok-yes".to_string(),
            side: Side::Buy,
            target_price: 0.46,
            target_size: 2.0,
            expected_edge: 0.04,
            confidence: 1.0,
            generated_at_ms: now_ms(),
            reason: String::new(),
        }
    }

    fn fill(order_id: &str, size: f64, price: f64) -> Fill {
        Fill {
            order_id: order_id.to_string(),
            trade_id: String::new(),
            market_id: "m1".to_string(),
            token_id: "tok-yes".to_string(),
            side: Side::Buy,
            price,
            size,
            notional: price * size,
            fee: 0.0,
            fill_time_ms: now_ms(),
            exchange_time_ms: 0,
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut order = Order::from_signal(&signal(), OrderType::Ioc);
        assert_eq!(order.state, OrderState::Pending);

        order.mark_sent();
        assert_eq!(order.state, OrderState::Sent);
        assert!(order.sent_at_ms > 0);

        order.mark_acknowledged("EX-1", 123);
        assert_eq!(order.state, OrderState::Acknowledged);
        assert_eq!(order.exchange_order_id, "EX-1");

        order.apply_fill(fill(&order.client_order_id.clone(), 1.0, 0.46));
        assert_eq!(order.state, OrderState::Partial);
        assert!((order.remaining_size - 1.0).abs() < 1e-9);

        order.apply_fill(fill(&order.client_order_id.clone(), 1.0, 0.46));
        assert_eq!(order.state, OrderState::Filled);
        assert!(order.is_terminal());
        assert_eq!(order.remaining_size, 0.0);
    }

    #[test]
    fn filled_size_never_exceeds_original_in_accounting() {
        let mut order = Order::from_signal(&signal(), OrderType::Ioc);
        order.mark_sent();
        order.mark_acknowledged("EX-1", 0);
        order.apply_fill(fill("o", 2.0, 0.46));

        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.remaining_size, 0.0);
        assert!((order.filled_size - order.original_size).abs() < 1e-9);
    }

    #[test]
    fn terminal_states_are_stable() {
        let mut order = Order::from_signal(&signal(), OrderType::Ioc);
        order.mark_sent();
        order.mark_canceled();
        assert_eq!(order.state, OrderState::Canceled);

        // Every further event is dropped.
        order.mark_sent();
        order.mark_acknowledged("EX-9", 0);
        order.apply_fill(fill("o", 1.0, 0.46));
        order.mark_rejected("nope");
        assert_eq!(order.state, OrderState::Canceled);
        assert_eq!(order.filled_size, 0.0);
    }

    #[test]
    fn no_backward_transitions() {
        let mut order = Order::from_signal(&signal(), OrderType::Ioc);
        order.mark_sent();
        order.mark_acknowledged("EX-1", 0);

        order.mark_sent();
        assert_eq!(order.state, OrderState::Acknowledged);
    }

    #[test]
    fn rejection_records_reason() {
        let mut order = Order::from_signal(&signal(), OrderType::Limit);
        order.mark_sent();
        order.mark_rejected("insufficient balance");
        assert_eq!(order.state, OrderState::Rejected);
        assert_eq!(order.reject_reason, "insufficient balance");
        assert!(order.is_terminal());
    }

    #[test]
    fn average_fill_price_weights_by_size() {
        let mut order = Order::from_signal(&signal(), OrderType::Ioc);
        order.mark_sent();
        order.mark_acknowledged("EX-1", 0);
        order.apply_fill(fill("o", 1.0, 0.40));
        order.apply_fill(fill("o", 1.0, 0.50));

        assert!((order.average_fill_price() - 0.45).abs() < 1e-9);
        assert!((order.filled_notional() - 0.90).abs() < 1e-9);
    }

    #[test]
    fn order_ids_are_unique() {
        let a = generate_order_id();
        let b = generate_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("ORD-"));
    }
}
