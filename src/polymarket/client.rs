// =============================================================================
// Polymarket REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// Every authenticated request is signed with HMAC-SHA256 over
// `timestamp + METHOD + path + body` using the base64-decoded API secret,
// and carries the POLY_API_KEY / POLY_TIMESTAMP / POLY_SIGNATURE /
// POLY_PASSPHRASE headers. The secret is never logged or serialized.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::polymarket::gateway::{
    CancelAck, ExchangePosition, ExchangeStateApi, OrderAck, OrderGateway, OrderRequest,
    OrderStatus,
};
use crate::state::PersistedOrder;
use crate::types::{
    now_ms, Market, OrderState, OrderType, Outcome, PriceLevel, Side,
};

type HmacSha256 = Hmac<Sha256>;

/// API credentials, read from the environment.
#[derive(Clone)]
pub struct PolymarketCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl PolymarketCredentials {
    /// Read `POLYMARKET_API_KEY`, `POLYMARKET_API_SECRET`, and
    /// `POLYMARKET_API_PASSPHRASE`. Missing variables come back empty so a
    /// dry-run needs no credentials.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("POLYMARKET_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("POLYMARKET_API_SECRET").unwrap_or_default(),
            passphrase: std::env::var("POLYMARKET_API_PASSPHRASE").unwrap_or_default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty() && !self.passphrase.is_empty()
    }
}

impl std::fmt::Debug for PolymarketCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// REST client for the prediction-market venue.
#[derive(Clone)]
pub struct PolymarketClient {
    credentials: PolymarketCredentials,
    base_url: String,
    client: reqwest::Client,
}

impl PolymarketClient {
    pub fn new(base_url: impl Into<String>, credentials: PolymarketCredentials) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            credentials,
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 over `timestamp + METHOD + path + body`, keyed with the
    /// base64-decoded secret. The signature is base64-encoded for the header.
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&self.credentials.api_secret)
            .context("API secret is not valid base64")?;

        let mut mac =
            HmacSha256::new_from_slice(&secret).context("HMAC key construction failed")?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());

        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Issue a signed request and parse the JSON response, failing on
    /// non-success statuses with the venue's error body attached.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let timestamp = (now_ms() / 1000).to_string();
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str)?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("POLY_API_KEY", &self.credentials.api_key)
            .header("POLY_TIMESTAMP", &timestamp)
            .header("POLY_SIGNATURE", &signature)
            .header("POLY_PASSPHRASE", &self.credentials.passphrase);

        if let Some(b) = body {
            request = request.json(&b);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let parsed: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("venue {method} {path} returned {status}: {parsed}");
        }

        Ok(parsed)
    }

    async fn public_get(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let parsed: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("venue GET {path} returned {status}: {parsed}");
        }

        Ok(parsed)
    }

    // -------------------------------------------------------------------------
    // Market metadata
    // -------------------------------------------------------------------------

    /// GET /markets — the tradable binary markets.
    pub async fn get_markets(&self) -> Result<Vec<Market>> {
        let body = self.public_get("/markets").await?;

        let entries = body
            .as_array()
            .or_else(|| body["data"].as_array())
            .context("markets response is not an array")?;

        let mut markets = Vec::new();
        for entry in entries {
            match parse_market(entry) {
                Some(market) => markets.push(market),
                None => {
                    warn!("skipping malformed market entry");
                }
            }
        }

        debug!(count = markets.len(), "markets fetched");
        Ok(markets)
    }

    /// GET /book?token_id=… — one order-book snapshot.
    pub async fn get_order_book(
        &self,
        token_id: &str,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>)> {
        let body = self
            .public_get(&format!("/book?token_id={token_id}"))
            .await?;

        let bids = parse_level_array(&body["bids"]);
        let asks = parse_level_array(&body["asks"]);
        Ok((bids, asks))
    }

    /// GET /balance (signed).
    pub async fn get_balance(&self) -> Result<f64> {
        let body = self.signed_request(reqwest::Method::GET, "/balance", None).await?;
        Ok(parse_number(&body["balance"]))
    }
}

// ---------------------------------------------------------------------------
// Gateway implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl OrderGateway for PolymarketClient {
    /// POST /order (signed).
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let body = json!({
            "tokenId": request.token_id,
            "side": request.side.to_string(),
            "price": request.price,
            "size": request.size,
            "type": request.order_type.to_string(),
        });

        debug!(
            token_id = %request.token_id,
            side = %request.side,
            price = request.price,
            size = request.size,
            "submitting order"
        );

        let resp = self
            .signed_request(reqwest::Method::POST, "/order", Some(body))
            .await?;

        let order_id = resp["orderId"]
            .as_str()
            .or_else(|| resp["id"].as_str())
            .context("order response missing order id")?
            .to_string();

        Ok(OrderAck {
            order_id,
            exchange_time_ms: resp["timestamp"].as_i64().unwrap_or_else(now_ms),
        })
    }

    /// DELETE /order/{id} (signed).
    async fn cancel_order(&self, order_id: &str) -> Result<CancelAck> {
        let path = format!("/order/{order_id}");
        match self.signed_request(reqwest::Method::DELETE, &path, None).await {
            Ok(resp) => Ok(CancelAck {
                success: resp["success"].as_bool().unwrap_or(true),
            }),
            Err(e) => {
                // A cancel rejection usually means the order raced to a fill;
                // the caller re-checks the order status to find out.
                warn!(order_id, error = %e, "cancel rejected");
                Ok(CancelAck { success: false })
            }
        }
    }

    /// GET /order/{id} (signed).
    async fn order_status(&self, order_id: &str) -> Result<Option<OrderStatus>> {
        let path = format!("/order/{order_id}");
        let resp = match self.signed_request(reqwest::Method::GET, &path, None).await {
            Ok(resp) => resp,
            Err(_) => return Ok(None),
        };

        Ok(Some(OrderStatus {
            order_id: order_id.to_string(),
            state: parse_order_state(resp["status"].as_str().unwrap_or("")),
            filled_size: parse_number(&resp["size_matched"]),
            avg_fill_price: parse_number(&resp["price"]),
        }))
    }
}

#[async_trait]
impl ExchangeStateApi for PolymarketClient {
    /// GET /orders (signed) — all open orders.
    async fn fetch_open_orders(&self) -> Result<Vec<PersistedOrder>> {
        let body = self.signed_request(reqwest::Method::GET, "/orders", None).await?;

        let entries = body
            .as_array()
            .or_else(|| body["data"].as_array())
            .context("orders response is not an array")?;

        let orders = entries.iter().filter_map(parse_open_order).collect();
        Ok(orders)
    }

    /// GET /positions (signed).
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>> {
        let body = self
            .signed_request(reqwest::Method::GET, "/positions", None)
            .await?;

        let entries = body
            .as_array()
            .or_else(|| body["data"].as_array())
            .context("positions response is not an array")?;

        let positions = entries
            .iter()
            .filter_map(|entry| {
                let token_id = entry["asset_id"]
                    .as_str()
                    .or_else(|| entry["token_id"].as_str())?;
                Some(ExchangePosition {
                    token_id: token_id.to_string(),
                    market_id: entry["market"]
                        .as_str()
                        .or_else(|| entry["market_id"].as_str())
                        .map(|s| s.to_string()),
                    outcome: entry["outcome"].as_str().unwrap_or("").to_string(),
                    size: parse_number(&entry["size"]),
                    avg_price: parse_number(&entry["avg_price"]),
                })
            })
            .collect();

        Ok(positions)
    }

    async fn fetch_balance(&self) -> Result<f64> {
        self.get_balance().await
    }
}

impl std::fmt::Debug for PolymarketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketClient")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_market(entry: &serde_json::Value) -> Option<Market> {
    let condition_id = entry["condition_id"].as_str()?;
    let question = entry["question"].as_str().unwrap_or("");
    let tokens = entry["tokens"].as_array()?;

    let mut yes_outcome = None;
    let mut no_outcome = None;
    for token in tokens {
        let outcome = Outcome {
            token_id: token["token_id"].as_str()?.to_string(),
            name: token["outcome"].as_str().unwrap_or("").to_uppercase(),
            best_bid: 0.0,
            bid_size: 0.0,
            best_ask: 0.0,
            ask_size: 0.0,
            last_trade_price: 0.0,
        };
        if outcome.name == "YES" {
            yes_outcome = Some(outcome);
        } else {
            no_outcome = Some(outcome);
        }
    }

    Some(Market {
        market_id: condition_id.to_string(),
        condition_id: condition_id.to_string(),
        question: question.to_string(),
        slug: entry["market_slug"]
            .as_str()
            .or_else(|| entry["slug"].as_str())
            .unwrap_or("")
            .to_string(),
        yes_outcome: yes_outcome?,
        no_outcome: no_outcome?,
        active: entry["active"].as_bool().unwrap_or(true),
        end_date_ms: entry["end_date_iso"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0),
        fee_rate_bps: parse_number(&entry["fee_rate_bps"]),
    })
}

fn parse_open_order(entry: &serde_json::Value) -> Option<PersistedOrder> {
    let order_id = entry["id"].as_str().or_else(|| entry["orderId"].as_str())?;
    Some(PersistedOrder {
        order_id: order_id.to_string(),
        client_order_id: entry["client_order_id"].as_str().unwrap_or("").to_string(),
        market_id: entry["market"].as_str().unwrap_or("").to_string(),
        token_id: entry["asset_id"].as_str().unwrap_or("").to_string(),
        side: if entry["side"].as_str() == Some("SELL") {
            Side::Sell
        } else {
            Side::Buy
        },
        order_type: OrderType::Gtc,
        state: parse_order_state(entry["status"].as_str().unwrap_or("")),
        price: parse_number(&entry["price"]),
        size: parse_number(&entry["original_size"]),
        filled_size: parse_number(&entry["size_matched"]),
        created_at: entry["created_at"].as_i64().unwrap_or(0),
        last_update: now_ms(),
        paired_order_id: None,
    })
}

fn parse_order_state(status: &str) -> OrderState {
    match status.to_uppercase().as_str() {
        "LIVE" | "OPEN" | "ACKNOWLEDGED" => OrderState::Acknowledged,
        "PARTIAL" | "PARTIALLY_FILLED" => OrderState::Partial,
        "FILLED" | "MATCHED" => OrderState::Filled,
        "CANCELED" | "CANCELLED" => OrderState::Canceled,
        "REJECTED" => OrderState::Rejected,
        "EXPIRED" => OrderState::Expired,
        _ => OrderState::Sent,
    }
}

fn parse_level_array(value: &serde_json::Value) -> Vec<PriceLevel> {
    let Some(array) = value.as_array() else {
        return Vec::new();
    };
    array
        .iter()
        .map(|level| PriceLevel {
            price: parse_number(&level["price"]),
            size: parse_number(&level["size"]),
        })
        .filter(|l| l.price > 0.0)
        .collect()
}

fn parse_number(value: &serde_json::Value) -> f64 {
    if let Some(s) = value.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        value.as_f64().unwrap_or(0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PolymarketClient {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"test-secret-key");
        PolymarketClient::new(
            "https://clob.example.com",
            PolymarketCredentials {
                api_key: "key".to_string(),
                api_secret: secret,
                passphrase: "pass".to_string(),
            },
        )
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let c = client();

        let a = c.sign("1700000000", "POST", "/order", "{}").unwrap();
        let b = c.sign("1700000000", "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);

        let different_path = c.sign("1700000000", "POST", "/orders", "{}").unwrap();
        assert_ne!(a, different_path);

        let different_ts = c.sign("1700000001", "POST", "/order", "{}").unwrap();
        assert_ne!(a, different_ts);

        // Signature must be valid base64 of a 32-byte MAC.
        let raw = base64::engine::general_purpose::STANDARD.decode(&a).unwrap();
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn invalid_secret_fails_signing() {
        let c = PolymarketClient::new(
            "https://clob.example.com",
            PolymarketCredentials {
                api_key: "key".to_string(),
                api_secret: "!!! not base64 !!!".to_string(),
                passphrase: "pass".to_string(),
            },
        );
        assert!(c.sign("0", "GET", "/balance", "").is_err());
    }

    #[test]
    fn parses_market_entry() {
        let entry = serde_json::json!({
            "condition_id": "0xabc",
            "question": "Will BTC be above $100,000 on Jan 31?",
            "market_slug": "btc-above-100k",
            "active": true,
            "end_date_iso": "2026-01-31T12:00:00Z",
            "fee_rate_bps": "200",
            "tokens": [
                {"token_id": "tok-yes", "outcome": "Yes"},
                {"token_id": "tok-no", "outcome": "No"}
            ]
        });

        let market = parse_market(&entry).unwrap();
        assert_eq!(market.market_id, "0xabc");
        assert_eq!(market.yes_outcome.token_id, "tok-yes");
        assert_eq!(market.no_outcome.token_id, "tok-no");
        assert!((market.fee_rate_bps - 200.0).abs() < 1e-9);
        assert!(market.end_date_ms > 0);
    }

    #[test]
    fn parses_open_order_entry() {
        let entry = serde_json::json!({
            "id": "ord-1",
            "market": "0xabc",
            "asset_id": "tok-yes",
            "side": "BUY",
            "status": "LIVE",
            "price": "0.48",
            "original_size": "1.0",
            "size_matched": "0.25",
            "created_at": 1700000000000i64
        });

        let order = parse_open_order(&entry).unwrap();
        assert_eq!(order.order_id, "ord-1");
        assert_eq!(order.state, OrderState::Acknowledged);
        assert!((order.filled_size - 0.25).abs() < 1e-9);
        assert!(order.is_active());
    }

    #[test]
    fn order_state_mapping() {
        assert_eq!(parse_order_state("LIVE"), OrderState::Acknowledged);
        assert_eq!(parse_order_state("matched"), OrderState::Filled);
        assert_eq!(parse_order_state("CANCELED"), OrderState::Canceled);
        assert_eq!(parse_order_state("weird"), OrderState::Sent);
    }

    #[test]
    fn credentials_completeness() {
        let complete = PolymarketCredentials {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            passphrase: "p".to_string(),
        };
        assert!(complete.is_complete());

        let partial = PolymarketCredentials {
            api_key: "k".to_string(),
            api_secret: String::new(),
            passphrase: "p".to_string(),
        };
        assert!(!partial.is_complete());
    }
}
