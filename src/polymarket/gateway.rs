// =============================================================================
// Venue Gateway — the seam between execution logic and the exchange
// =============================================================================
//
// `OrderGateway` is what the execution engine and paired executor talk to;
// `ExchangeStateApi` is what the reconciler reads. The live REST client
// implements both; the paper simulator and test doubles implement them
// without touching the network.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::PersistedOrder;
use crate::types::{OrderState, OrderType, Price, Side, Size};

/// A new order as handed to the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Price,
    pub size: Size,
}

/// Venue acknowledgment of a submitted order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    /// Exchange-assigned order id.
    pub order_id: String,
    pub exchange_time_ms: i64,
}

/// Point-in-time order status from the venue.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub filled_size: Size,
    pub avg_fill_price: Price,
}

/// Result of a cancel request. `success == false` usually means the order
/// raced to a fill; callers re-check the status to find out.
#[derive(Debug, Clone)]
pub struct CancelAck {
    pub success: bool,
}

/// Position as reported by the exchange. `market_id` is the explicit
/// token-to-market mapping; its absence is a reconciliation discrepancy,
/// never something to guess.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub token_id: String,
    pub market_id: Option<String>,
    pub outcome: String,
    pub size: Size,
    pub avg_price: Price,
}

/// Order entry points on the venue.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck>;
    async fn cancel_order(&self, order_id: &str) -> Result<CancelAck>;
    async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>>;
}

/// Read-only exchange state used during reconciliation.
#[async_trait]
pub trait ExchangeStateApi: Send + Sync {
    async fn fetch_open_orders(&self) -> Result<Vec<PersistedOrder>>;
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>>;
    async fn fetch_balance(&self) -> Result<f64>;
}

/// Everything the engine needs from one venue.
pub trait VenueApi: OrderGateway + ExchangeStateApi {}
impl<T: OrderGateway + ExchangeStateApi> VenueApi for T {}
