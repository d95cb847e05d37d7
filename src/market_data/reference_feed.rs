// =============================================================================
// Reference-Price Feed — BTC spot top-of-book over WebSocket
// =============================================================================
//
// Streams the Binance bookTicker for the configured symbol and publishes a
// fresh `ReferencePrice` into the shared cell whenever either side of the top
// of book moves. Reconnects with exponential backoff up to the configured
// attempt cap; every reconnect and error is recorded with the health monitor.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::config::ConnectionConfig;
use crate::degradation::CONN_REFERENCE;
use crate::health::ConnectionHealthMonitor;
use crate::market_data::backoff_delay_ms;
use crate::types::{now_ms, ReferencePrice};

/// Shared cell holding the latest reference price.
pub struct ReferencePriceCell {
    inner: RwLock<Option<ReferencePrice>>,
}

impl ReferencePriceCell {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn set(&self, price: ReferencePrice) {
        *self.inner.write() = Some(price);
    }

    pub fn get(&self) -> Option<ReferencePrice> {
        *self.inner.read()
    }

    /// Age of the latest observation, or `None` before first data.
    pub fn age_ms(&self) -> Option<i64> {
        self.inner.read().map(|p| now_ms() - p.recv_ms)
    }
}

impl Default for ReferencePriceCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-running feed task: connect, stream, reconnect with backoff. Returns
/// once the running flag clears or the attempt cap is exhausted.
pub async fn run_reference_feed(
    config: ConnectionConfig,
    cell: Arc<ReferencePriceCell>,
    health: Arc<ConnectionHealthMonitor>,
    running: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    while running.load(Ordering::Acquire) {
        match stream_once(&config, &cell, &health, &running).await {
            Ok(()) => {
                // Clean close; reconnect immediately.
                attempt = 0;
            }
            Err(e) => {
                error!(error = %e, "reference feed error");
                health.record_error(CONN_REFERENCE);
                attempt += 1;
            }
        }

        health.record_disconnected(CONN_REFERENCE);

        if !running.load(Ordering::Acquire) {
            break;
        }
        if attempt >= config.max_reconnect_attempts {
            error!(
                attempts = attempt,
                "reference feed exhausted reconnect attempts"
            );
            break;
        }

        let delay = backoff_delay_ms(attempt, config.reconnect_delay_ms, config.max_reconnect_delay_ms);
        warn!(attempt, delay_ms = delay, "reference feed reconnecting");
        health.record_reconnect(CONN_REFERENCE);
        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
    }
}

async fn stream_once(
    config: &ConnectionConfig,
    cell: &ReferencePriceCell,
    health: &ConnectionHealthMonitor,
    running: &AtomicBool,
) -> Result<()> {
    let symbol = config.binance_symbol.to_lowercase();
    let url = format!("{}/{}@bookTicker", config.binance_ws_url, symbol);
    info!(url = %url, "connecting to reference feed");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to reference WebSocket")?;

    info!("reference feed connected");
    health.record_connected(CONN_REFERENCE);
    let (_write, mut read) = ws_stream.split();

    let mut last_bid = 0.0f64;
    let mut last_ask = 0.0f64;

    loop {
        if !running.load(Ordering::Acquire) {
            return Ok(());
        }

        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    health.record_message_received(CONN_REFERENCE);
                    match parse_book_ticker(&text) {
                        Ok(Some((bid, ask, exchange_time_ms))) => {
                            // Only publish on a top-of-book change.
                            if bid != last_bid || ask != last_ask {
                                last_bid = bid;
                                last_ask = ask;
                                cell.set(ReferencePrice {
                                    bid,
                                    ask,
                                    mid: (bid + ask) / 2.0,
                                    last: (bid + ask) / 2.0,
                                    recv_ms: now_ms(),
                                    exchange_time_ms,
                                });
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "failed to parse bookTicker message");
                            health.record_error(CONN_REFERENCE);
                        }
                    }
                }
            }
            Some(Err(e)) => {
                return Err(e).context("reference WebSocket read error");
            }
            None => {
                warn!("reference feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance bookTicker frame.
///
/// Expected shape:
/// ```json
/// {"u":400900217,"s":"BTCUSDT","b":"97250.10","B":"1.2","a":"97250.90","A":"0.8"}
/// ```
fn parse_book_ticker(text: &str) -> Result<Option<(f64, f64, i64)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse bookTicker JSON")?;

    let Some(bid_str) = root["b"].as_str() else {
        // Subscription acks and other control frames carry no book fields.
        return Ok(None);
    };
    let ask_str = root["a"].as_str().context("missing field a")?;

    let bid: f64 = bid_str.parse().context("failed to parse bid")?;
    let ask: f64 = ask_str.parse().context("failed to parse ask")?;
    let exchange_time_ms = root["E"].as_i64().unwrap_or(0);

    Ok(Some((bid, ask, exchange_time_ms)))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_ticker_frame() {
        let text = r#"{"u":400900217,"s":"BTCUSDT","b":"97250.10","B":"1.2","a":"97250.90","A":"0.8"}"#;
        let (bid, ask, _) = parse_book_ticker(text).unwrap().unwrap();
        assert!((bid - 97_250.10).abs() < 1e-6);
        assert!((ask - 97_250.90).abs() < 1e-6);
    }

    #[test]
    fn control_frames_are_skipped() {
        let text = r#"{"result":null,"id":1}"#;
        assert!(parse_book_ticker(text).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(parse_book_ticker("not json").is_err());
        assert!(parse_book_ticker(r#"{"b":"1.0"}"#).is_err());
    }

    #[test]
    fn cell_stores_latest_price() {
        let cell = ReferencePriceCell::new();
        assert!(cell.get().is_none());

        cell.set(ReferencePrice {
            bid: 97_000.0,
            ask: 97_001.0,
            mid: 97_000.5,
            last: 97_000.5,
            recv_ms: now_ms(),
            exchange_time_ms: 0,
        });

        let price = cell.get().unwrap();
        assert!((price.mid - 97_000.5).abs() < 1e-9);
        assert!(cell.age_ms().unwrap() >= 0);
    }
}
