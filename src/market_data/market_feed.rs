// =============================================================================
// Prediction-Market Feed — per-token book updates over WebSocket
// =============================================================================
//
// Subscribes to the market channel with the token ids of every registered
// market and dispatches three event kinds: full book snapshots, incremental
// price changes, and trade ticks. A token-to-market index routes each update
// to the right side of the right binary book. The registry exclusively owns
// the books; strategies borrow them for one evaluation tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::degradation::CONN_MARKET_WS;
use crate::health::ConnectionHealthMonitor;
use crate::market_data::backoff_delay_ms;
use crate::market_data::order_book::BinaryMarketBook;
use crate::types::{Market, PriceLevel, Side};

/// Trade ticks are forwarded as (token_id, price, size).
pub type TradeCallback = Box<dyn Fn(&str, f64, f64) + Send + Sync>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns every `BinaryMarketBook` and the token-to-market routing index.
pub struct MarketBookRegistry {
    books: RwLock<HashMap<String, Arc<BinaryMarketBook>>>,
    /// token_id -> (market_id, is_yes_side)
    token_index: RwLock<HashMap<String, (String, bool)>>,
}

impl MarketBookRegistry {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            token_index: RwLock::new(HashMap::new()),
        }
    }

    /// Create the book pair for a market and index both token ids.
    pub fn register_market(&self, market: &Market) {
        let book = Arc::new(BinaryMarketBook::new(
            &market.market_id,
            &market.question,
            &market.yes_outcome.token_id,
            &market.no_outcome.token_id,
            market.end_date_ms,
            market.fee_rate_bps,
        ));

        self.books
            .write()
            .insert(market.market_id.clone(), book);

        let mut index = self.token_index.write();
        index.insert(
            market.yes_outcome.token_id.clone(),
            (market.market_id.clone(), true),
        );
        index.insert(
            market.no_outcome.token_id.clone(),
            (market.market_id.clone(), false),
        );

        info!(market_id = %market.market_id, question = %market.question, "market registered");
    }

    pub fn book(&self, market_id: &str) -> Option<Arc<BinaryMarketBook>> {
        self.books.read().get(market_id).cloned()
    }

    pub fn all_books(&self) -> Vec<Arc<BinaryMarketBook>> {
        self.books.read().values().cloned().collect()
    }

    pub fn market_for_token(&self, token_id: &str) -> Option<String> {
        self.token_index.read().get(token_id).map(|(m, _)| m.clone())
    }

    pub fn subscribed_token_ids(&self) -> Vec<String> {
        self.token_index.read().keys().cloned().collect()
    }

    /// Replace all levels on the book side `token_id` belongs to.
    pub fn apply_snapshot(&self, token_id: &str, bids: &[PriceLevel], asks: &[PriceLevel]) {
        let Some((market_id, is_yes)) = self.token_index.read().get(token_id).cloned() else {
            debug!(token_id, "snapshot for unknown token");
            return;
        };
        let Some(book) = self.book(&market_id) else {
            return;
        };

        let side_book = if is_yes { book.yes_book() } else { book.no_book() };
        side_book.apply_snapshot(bids, asks);
    }

    /// Apply one incremental level change.
    pub fn apply_price_change(&self, token_id: &str, side: Side, price: f64, size: f64) {
        let Some((market_id, is_yes)) = self.token_index.read().get(token_id).cloned() else {
            debug!(token_id, "price change for unknown token");
            return;
        };
        let Some(book) = self.book(&market_id) else {
            return;
        };

        let side_book = if is_yes { book.yes_book() } else { book.no_book() };
        match side {
            Side::Buy => side_book.update_bid(price, size),
            Side::Sell => side_book.update_ask(price, size),
        }
    }
}

impl Default for MarketBookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Feed task
// ---------------------------------------------------------------------------

/// Long-running feed task with backoff reconnect; resubscribes after every
/// reconnect.
pub async fn run_market_feed(
    config: ConnectionConfig,
    registry: Arc<MarketBookRegistry>,
    health: Arc<ConnectionHealthMonitor>,
    running: Arc<AtomicBool>,
    on_trade: Option<TradeCallback>,
) {
    let mut attempt: u32 = 0;

    while running.load(Ordering::Acquire) {
        match stream_once(&config, &registry, &health, &running, on_trade.as_ref()).await {
            Ok(()) => {
                attempt = 0;
            }
            Err(e) => {
                error!(error = %e, "market feed error");
                health.record_error(CONN_MARKET_WS);
                attempt += 1;
            }
        }

        health.record_disconnected(CONN_MARKET_WS);

        if !running.load(Ordering::Acquire) {
            break;
        }
        if attempt >= config.max_reconnect_attempts {
            error!(attempts = attempt, "market feed exhausted reconnect attempts");
            break;
        }

        let delay = backoff_delay_ms(attempt, config.reconnect_delay_ms, config.max_reconnect_delay_ms);
        warn!(attempt, delay_ms = delay, "market feed reconnecting");
        health.record_reconnect(CONN_MARKET_WS);
        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
    }
}

async fn stream_once(
    config: &ConnectionConfig,
    registry: &MarketBookRegistry,
    health: &ConnectionHealthMonitor,
    running: &AtomicBool,
    on_trade: Option<&TradeCallback>,
) -> Result<()> {
    let token_ids = registry.subscribed_token_ids();
    if token_ids.is_empty() {
        anyhow::bail!("no markets registered to subscribe to");
    }

    info!(url = %config.polymarket_ws_url, tokens = token_ids.len(), "connecting to market feed");

    let (ws_stream, _response) = connect_async(&config.polymarket_ws_url)
        .await
        .context("failed to connect to market WebSocket")?;

    health.record_connected(CONN_MARKET_WS);
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "type": "subscribe",
        "channel": "market",
        "assets_ids": token_ids,
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send market subscription")?;
    health.record_message_sent(CONN_MARKET_WS);
    info!("market feed subscribed");

    loop {
        if !running.load(Ordering::Acquire) {
            return Ok(());
        }

        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                health.record_message_received(CONN_MARKET_WS);
                if let Err(e) = dispatch_frame(&text, registry, on_trade) {
                    warn!(error = %e, "failed to handle market frame");
                    health.record_error(CONN_MARKET_WS);
                }
            }
            Some(Ok(Message::Ping(_))) => {
                health.record_heartbeat(CONN_MARKET_WS);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(e).context("market WebSocket read error");
            }
            None => {
                warn!("market feed stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Frames arrive either as a single event object or an array of them.
fn dispatch_frame(
    text: &str,
    registry: &MarketBookRegistry,
    on_trade: Option<&TradeCallback>,
) -> Result<()> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse market frame")?;

    match root {
        serde_json::Value::Array(events) => {
            for event in events {
                handle_event(&event, registry, on_trade);
            }
        }
        event => handle_event(&event, registry, on_trade),
    }
    Ok(())
}

fn handle_event(
    event: &serde_json::Value,
    registry: &MarketBookRegistry,
    on_trade: Option<&TradeCallback>,
) {
    let Some(event_type) = event["event_type"].as_str() else {
        return;
    };
    let Some(asset_id) = event["asset_id"].as_str() else {
        return;
    };

    match event_type {
        "book" => {
            let bids = parse_levels(event.get("bids").or_else(|| event.get("buys")));
            let asks = parse_levels(event.get("asks").or_else(|| event.get("sells")));
            registry.apply_snapshot(asset_id, &bids, &asks);
        }
        "price_change" => {
            if let Some(changes) = event["changes"].as_array() {
                for change in changes {
                    apply_change(registry, asset_id, change);
                }
            } else {
                apply_change(registry, asset_id, event);
            }
        }
        "last_trade_price" => {
            let price = parse_f64(&event["price"]);
            let size = parse_f64(&event["size"]);
            if let Some(cb) = on_trade {
                cb(asset_id, price, size);
            }
        }
        other => {
            debug!(event_type = other, "ignoring market event");
        }
    }
}

fn apply_change(registry: &MarketBookRegistry, asset_id: &str, change: &serde_json::Value) {
    let price = parse_f64(&change["price"]);
    let size = parse_f64(&change["size"]);
    let side = match change["side"].as_str() {
        Some("BUY") => Side::Buy,
        Some("SELL") => Side::Sell,
        _ => {
            debug!(asset_id, "price change missing side");
            return;
        }
    };
    registry.apply_price_change(asset_id, side, price, size);
}

/// Levels arrive as `[{"price": "0.46", "size": "100"}, ...]`.
fn parse_levels(value: Option<&serde_json::Value>) -> Vec<PriceLevel> {
    let Some(array) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    array
        .iter()
        .map(|level| PriceLevel {
            price: parse_f64(&level["price"]),
            size: parse_f64(&level["size"]),
        })
        .filter(|l| l.price > 0.0)
        .collect()
}

/// Venue numbers arrive as strings or raw numbers.
fn parse_f64(value: &serde_json::Value) -> f64 {
    if let Some(s) = value.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        value.as_f64().unwrap_or(0.0)
    }
}
