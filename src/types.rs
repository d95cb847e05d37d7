// =============================================================================
// Shared types used across the Polyedge trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Prediction-token price in [0, 1] (probability units); unbounded positive
/// for the reference asset.
pub type Price = f64;
pub type Size = f64;
pub type Notional = f64;

/// Positions smaller than this are considered flat.
pub const POSITION_EPSILON: f64 = 0.0001;

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The side that closes a position opened on `self`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Venue order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
    /// Good till cancel.
    Gtc,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
            Self::Gtc => write!(f, "GTC"),
        }
    }
}

/// Order lifecycle state.
///
/// PENDING -> SENT -> ACKNOWLEDGED -> (PARTIAL)* -> FILLED, with CANCELED,
/// REJECTED, and EXPIRED as alternative terminals. Terminal states are
/// stable: no event moves an order out of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderState {
    Pending,
    Sent,
    Acknowledged,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// How orders reach the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    /// Compute signals only; orders are recorded but never dispatched.
    DryRun,
    /// Simulated execution with synthetic acknowledgments and fills.
    Paper,
    /// Real orders against the venue.
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "DRY_RUN"),
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single price level in an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub size: Size,
}

/// One tradable outcome of a binary market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub token_id: String,
    /// "YES" or "NO".
    pub name: String,
    #[serde(default)]
    pub best_bid: Price,
    #[serde(default)]
    pub bid_size: Size,
    #[serde(default)]
    pub best_ask: Price,
    #[serde(default)]
    pub ask_size: Size,
    #[serde(default)]
    pub last_trade_price: Price,
}

/// A binary prediction market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub condition_id: String,
    pub question: String,
    #[serde(default)]
    pub slug: String,
    pub yes_outcome: Outcome,
    pub no_outcome: Outcome,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Market resolution time, epoch milliseconds.
    #[serde(default)]
    pub end_date_ms: i64,
    /// Venue fee in basis points, charged on winnings.
    #[serde(default)]
    pub fee_rate_bps: f64,
}

fn default_active() -> bool {
    true
}

/// Top-of-book snapshot of the reference asset (BTC spot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReferencePrice {
    pub bid: Price,
    pub ask: Price,
    pub mid: Price,
    pub last: Price,
    /// Local receive time, epoch milliseconds.
    pub recv_ms: i64,
    /// Exchange-reported event time, epoch milliseconds.
    pub exchange_time_ms: i64,
}

// ---------------------------------------------------------------------------
// Trading events
// ---------------------------------------------------------------------------

/// A single execution against the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    #[serde(default)]
    pub trade_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Price,
    pub size: Size,
    pub notional: Notional,
    #[serde(default)]
    pub fee: Notional,
    pub fill_time_ms: i64,
    #[serde(default)]
    pub exchange_time_ms: i64,
}

/// A trade recommendation produced by a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub target_price: Price,
    pub target_size: Size,
    /// Expected profit in probability units (0.01 = one cent per share).
    pub expected_edge: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub generated_at_ms: i64,
    pub reason: String,
}

impl Signal {
    pub fn notional(&self) -> Notional {
        self.target_price * self.target_size
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_terminal() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Canceled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
        assert!(!OrderState::Sent.is_terminal());
        assert!(!OrderState::Acknowledged.is_terminal());
        assert!(!OrderState::Partial.is_terminal());
    }

    #[test]
    fn side_serialises_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
        let s: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn order_state_roundtrip() {
        for state in [
            OrderState::Pending,
            OrderState::Sent,
            OrderState::Acknowledged,
            OrderState::Partial,
            OrderState::Filled,
            OrderState::Canceled,
            OrderState::Rejected,
            OrderState::Expired,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            let back: OrderState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }
}
