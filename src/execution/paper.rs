// =============================================================================
// Paper Gateway — simulated venue for paper trading and tests
// =============================================================================
//
// Implements the same `OrderGateway` the live client does, so the execution
// engine and paired executor drive identical code paths in paper mode.
// Orders acknowledge after a small delay and then fill per a probabilistic
// model: mostly full fills, occasionally partial, occasionally missed, with
// a fixed simulated fee on notional.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::polymarket::gateway::{CancelAck, OrderAck, OrderGateway, OrderRequest, OrderStatus};
use crate::types::{now_ms, OrderState};

/// Fill-model parameters.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Delay between submission and the fill becoming visible.
    pub ack_delay_ms: i64,
    /// Probability of a complete fill.
    pub full_fill_probability: f64,
    /// Probability of a half fill (miss probability is the remainder).
    pub partial_fill_probability: f64,
    /// Simulated fee rate on filled notional.
    pub fee_rate: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            ack_delay_ms: 20,
            full_fill_probability: 0.90,
            partial_fill_probability: 0.07,
            fee_rate: 0.02,
        }
    }
}

impl PaperConfig {
    /// Deterministic variant that always fills immediately. Used in tests.
    pub fn always_fill() -> Self {
        Self {
            ack_delay_ms: 0,
            full_fill_probability: 1.0,
            partial_fill_probability: 0.0,
            fee_rate: 0.02,
        }
    }

    /// Deterministic variant that never fills. Used in tests.
    pub fn never_fill() -> Self {
        Self {
            ack_delay_ms: 0,
            full_fill_probability: 0.0,
            partial_fill_probability: 0.0,
            fee_rate: 0.02,
        }
    }
}

struct SimulatedOrder {
    request: OrderRequest,
    /// Fill fraction decided at submission; realized once `ready_at_ms`
    /// passes.
    fill_fraction: f64,
    ready_at_ms: i64,
    canceled: bool,
}

/// In-memory venue double.
pub struct PaperGateway {
    config: PaperConfig,
    orders: Mutex<HashMap<String, SimulatedOrder>>,
    next_id: Mutex<u64>,
}

impl PaperGateway {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            config,
            orders: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Fee the simulator charges on a filled notional.
    pub fn simulated_fee(&self, notional: f64) -> f64 {
        notional * self.config.fee_rate
    }

    fn decide_fill_fraction(&self) -> f64 {
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.config.full_fill_probability {
            1.0
        } else if roll < self.config.full_fill_probability + self.config.partial_fill_probability {
            0.5
        } else {
            0.0
        }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let order_id = {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("SIM-{}", *next)
        };

        let fill_fraction = self.decide_fill_fraction();
        debug!(
            order_id = %order_id,
            token_id = %request.token_id,
            fill_fraction,
            "paper order accepted"
        );

        self.orders.lock().insert(
            order_id.clone(),
            SimulatedOrder {
                request: request.clone(),
                fill_fraction,
                ready_at_ms: now_ms() + self.config.ack_delay_ms,
                canceled: false,
            },
        );

        Ok(OrderAck {
            order_id,
            exchange_time_ms: now_ms(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelAck> {
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(CancelAck { success: false });
        };

        // A fill that already landed wins the race against the cancel.
        if order.fill_fraction > 0.0 && now_ms() >= order.ready_at_ms {
            return Ok(CancelAck { success: false });
        }

        order.canceled = true;
        Ok(CancelAck { success: true })
    }

    async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>> {
        let orders = self.orders.lock();
        let Some(order) = orders.get(order_id) else {
            return Ok(None);
        };

        if order.canceled {
            return Ok(Some(OrderStatus {
                order_id: order_id.to_string(),
                state: OrderState::Canceled,
                filled_size: 0.0,
                avg_fill_price: 0.0,
            }));
        }

        if now_ms() < order.ready_at_ms {
            return Ok(Some(OrderStatus {
                order_id: order_id.to_string(),
                state: OrderState::Acknowledged,
                filled_size: 0.0,
                avg_fill_price: 0.0,
            }));
        }

        let filled = order.request.size * order.fill_fraction;
        let state = if order.fill_fraction >= 1.0 {
            OrderState::Filled
        } else if order.fill_fraction > 0.0 {
            OrderState::Partial
        } else {
            // IOC that missed: expired unfilled.
            OrderState::Expired
        };

        Ok(Some(OrderStatus {
            order_id: order_id.to_string(),
            state,
            filled_size: filled,
            avg_fill_price: if filled > 0.0 { order.request.price } else { 0.0 },
        }))
    }
}
