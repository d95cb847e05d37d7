// =============================================================================
// Order Book — sorted price ladders with a binary-market pair aggregate
// =============================================================================
//
// One `OrderBook` per outcome token. Bids iterate descending, asks ascending.
// Setting a level's size to zero removes it; after every mutation the book is
// trimmed to `max_levels` per side, dropping the worst-priced levels.
// =============================================================================

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use crate::types::{now_ms, Price, PriceLevel, Size};

/// Default number of levels retained per side.
pub const DEFAULT_MAX_LEVELS: usize = 10;

struct BookInner {
    /// Keyed ascending; bids read in reverse so the highest price is best.
    bids: BTreeMap<OrderedFloat<f64>, Size>,
    asks: BTreeMap<OrderedFloat<f64>, Size>,
    sequence: u64,
    last_update_ms: i64,
}

/// Thread-safe order book maintaining sorted price levels for one token.
pub struct OrderBook {
    symbol: String,
    max_levels: usize,
    inner: Mutex<BookInner>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>, max_levels: usize) -> Self {
        Self {
            symbol: symbol.into(),
            max_levels,
            inner: Mutex::new(BookInner {
                bids: BTreeMap::new(),
                asks: BTreeMap::new(),
                sequence: 0,
                last_update_ms: now_ms(),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Insert, update, or remove a bid level. Size <= 0 removes the level.
    pub fn update_bid(&self, price: Price, size: Size) {
        let mut inner = self.inner.lock();
        if size <= 0.0 {
            inner.bids.remove(&OrderedFloat(price));
        } else {
            inner.bids.insert(OrderedFloat(price), size);
        }
        inner.last_update_ms = now_ms();
        Self::trim(&mut inner, self.max_levels);
    }

    /// Insert, update, or remove an ask level. Size <= 0 removes the level.
    pub fn update_ask(&self, price: Price, size: Size) {
        let mut inner = self.inner.lock();
        if size <= 0.0 {
            inner.asks.remove(&OrderedFloat(price));
        } else {
            inner.asks.insert(OrderedFloat(price), size);
        }
        inner.last_update_ms = now_ms();
        Self::trim(&mut inner, self.max_levels);
    }

    /// Remove all levels from both sides.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.bids.clear();
        inner.asks.clear();
        inner.last_update_ms = now_ms();
    }

    /// Atomically replace all levels. Zero-size entries are dropped.
    pub fn apply_snapshot(&self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        let mut inner = self.inner.lock();

        inner.bids.clear();
        for level in bids {
            if level.size > 0.0 {
                inner.bids.insert(OrderedFloat(level.price), level.size);
            }
        }

        inner.asks.clear();
        for level in asks {
            if level.size > 0.0 {
                inner.asks.insert(OrderedFloat(level.price), level.size);
            }
        }

        inner.last_update_ms = now_ms();
        Self::trim(&mut inner, self.max_levels);
    }

    /// Stamp the venue sequence number for this book.
    pub fn set_sequence(&self, seq: u64) {
        self.inner.lock().sequence = seq;
    }

    pub fn sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn best_bid(&self) -> Option<PriceLevel> {
        let inner = self.inner.lock();
        inner.bids.iter().next_back().map(|(p, s)| PriceLevel {
            price: p.into_inner(),
            size: *s,
        })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        let inner = self.inner.lock();
        inner.asks.iter().next().map(|(p, s)| PriceLevel {
            price: p.into_inner(),
            size: *s,
        })
    }

    /// Midpoint of the top of book; zero if either side is empty.
    pub fn mid_price(&self) -> Price {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => (bid.price + ask.price) / 2.0,
            _ => 0.0,
        }
    }

    /// Top-of-book spread; zero if either side is empty.
    pub fn spread(&self) -> Price {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask.price - bid.price,
            _ => 0.0,
        }
    }

    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid_price();
        if mid <= 0.0 {
            return 0.0;
        }
        (self.spread() / mid) * 10_000.0
    }

    /// Up to `n` bid levels, best first.
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        let inner = self.inner.lock();
        inner
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, s)| PriceLevel {
                price: p.into_inner(),
                size: *s,
            })
            .collect()
    }

    /// Up to `n` ask levels, best first.
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        let inner = self.inner.lock();
        inner
            .asks
            .iter()
            .take(n)
            .map(|(p, s)| PriceLevel {
                price: p.into_inner(),
                size: *s,
            })
            .collect()
    }

    /// Summed size across the top `levels` bid levels.
    pub fn bid_depth(&self, levels: usize) -> Size {
        let inner = self.inner.lock();
        inner.bids.iter().rev().take(levels).map(|(_, s)| *s).sum()
    }

    /// Summed size across the top `levels` ask levels.
    pub fn ask_depth(&self, levels: usize) -> Size {
        let inner = self.inner.lock();
        inner.asks.iter().take(levels).map(|(_, s)| *s).sum()
    }

    pub fn total_depth(&self, levels: usize) -> Size {
        self.bid_depth(levels) + self.ask_depth(levels)
    }

    pub fn last_update_ms(&self) -> i64 {
        self.inner.lock().last_update_ms
    }

    /// True when the book has not been updated within `threshold_ms`.
    pub fn is_stale(&self, threshold_ms: i64) -> bool {
        now_ms() - self.last_update_ms() > threshold_ms
    }

    fn trim(inner: &mut BookInner, max_levels: usize) {
        // Worst bid is the lowest price; worst ask is the highest.
        while inner.bids.len() > max_levels {
            let worst = *inner.bids.keys().next().expect("non-empty");
            inner.bids.remove(&worst);
        }
        while inner.asks.len() > max_levels {
            let worst = *inner.asks.keys().next_back().expect("non-empty");
            inner.asks.remove(&worst);
        }
    }
}

// =============================================================================
// BinaryMarketBook
// =============================================================================

/// Paired YES/NO books for one binary market, plus the market metadata the
/// strategies need (question text for strike parsing, expiry, fee rate).
pub struct BinaryMarketBook {
    market_id: String,
    question: String,
    yes_token_id: String,
    no_token_id: String,
    end_date_ms: i64,
    fee_rate_bps: f64,
    yes_book: OrderBook,
    no_book: OrderBook,
}

impl BinaryMarketBook {
    pub fn new(
        market_id: impl Into<String>,
        question: impl Into<String>,
        yes_token_id: impl Into<String>,
        no_token_id: impl Into<String>,
        end_date_ms: i64,
        fee_rate_bps: f64,
    ) -> Self {
        let market_id = market_id.into();
        Self {
            yes_book: OrderBook::new(format!("{market_id}_YES"), DEFAULT_MAX_LEVELS),
            no_book: OrderBook::new(format!("{market_id}_NO"), DEFAULT_MAX_LEVELS),
            market_id,
            question: question.into(),
            yes_token_id: yes_token_id.into(),
            no_token_id: no_token_id.into(),
            end_date_ms,
            fee_rate_bps,
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn yes_token_id(&self) -> &str {
        &self.yes_token_id
    }

    pub fn no_token_id(&self) -> &str {
        &self.no_token_id
    }

    pub fn end_date_ms(&self) -> i64 {
        self.end_date_ms
    }

    pub fn fee_rate_bps(&self) -> f64 {
        self.fee_rate_bps
    }

    pub fn yes_book(&self) -> &OrderBook {
        &self.yes_book
    }

    pub fn no_book(&self) -> &OrderBook {
        &self.no_book
    }

    /// YES ask + NO ask; zero unless both are present. The underpricing
    /// strategy compares this against `1 - fee - min_edge`.
    pub fn sum_of_best_asks(&self) -> f64 {
        match (self.yes_book.best_ask(), self.no_book.best_ask()) {
            (Some(yes), Some(no)) => yes.price + no.price,
            _ => 0.0,
        }
    }

    /// YES bid + NO bid; zero unless both are present.
    pub fn sum_of_best_bids(&self) -> f64 {
        match (self.yes_book.best_bid(), self.no_book.best_bid()) {
            (Some(yes), Some(no)) => yes.price + no.price,
            _ => 0.0,
        }
    }

    /// YES mid price read as the market's implied probability.
    pub fn yes_implied_probability(&self) -> f64 {
        self.yes_book.mid_price()
    }

    /// Both outcomes quoted on both sides.
    pub fn has_liquidity(&self) -> bool {
        self.yes_book.best_bid().is_some()
            && self.yes_book.best_ask().is_some()
            && self.no_book.best_bid().is_some()
            && self.no_book.best_ask().is_some()
    }

    /// Stale if either side's book has gone quiet.
    pub fn is_stale(&self, threshold_ms: i64) -> bool {
        self.yes_book.is_stale(threshold_ms) || self.no_book.is_stale(threshold_ms)
    }

    /// Age in milliseconds of the older of the two books' last updates.
    pub fn last_update_age_ms(&self) -> i64 {
        let oldest = self
            .yes_book
            .last_update_ms()
            .min(self.no_book.last_update_ms());
        now_ms() - oldest
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> PriceLevel {
        PriceLevel { price, size }
    }

    #[test]
    fn zero_size_removes_level() {
        let book = OrderBook::new("T", 10);
        book.update_bid(0.45, 100.0);
        assert_eq!(book.best_bid().unwrap().price, 0.45);

        book.update_bid(0.45, 0.0);
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn best_prices_are_sorted_correctly() {
        let book = OrderBook::new("T", 10);
        book.update_bid(0.44, 10.0);
        book.update_bid(0.46, 5.0);
        book.update_bid(0.45, 7.0);
        book.update_ask(0.49, 3.0);
        book.update_ask(0.47, 8.0);
        book.update_ask(0.48, 2.0);

        assert_eq!(book.best_bid().unwrap().price, 0.46);
        assert_eq!(book.best_ask().unwrap().price, 0.47);
        assert!(book.best_ask().unwrap().price > book.best_bid().unwrap().price);
    }

    #[test]
    fn snapshot_replaces_everything() {
        let book = OrderBook::new("T", 10);
        book.update_bid(0.10, 1.0);
        book.update_ask(0.90, 1.0);

        let bids = vec![level(0.45, 100.0), level(0.44, 50.0)];
        let asks = vec![level(0.47, 80.0), level(0.48, 60.0)];
        book.apply_snapshot(&bids, &asks);

        assert_eq!(book.best_bid().unwrap().price, 0.45);
        assert_eq!(book.best_ask().unwrap().price, 0.47);
        assert_eq!(book.top_bids(10).len(), 2);
        assert_eq!(book.top_asks(10).len(), 2);
    }

    #[test]
    fn snapshot_is_idempotent() {
        let book = OrderBook::new("T", 10);
        let bids = vec![level(0.45, 100.0), level(0.44, 50.0)];
        let asks = vec![level(0.47, 80.0)];

        book.apply_snapshot(&bids, &asks);
        let first_bids = book.top_bids(10);
        let first_asks = book.top_asks(10);

        book.apply_snapshot(&bids, &asks);
        assert_eq!(book.top_bids(10), first_bids);
        assert_eq!(book.top_asks(10), first_asks);
    }

    #[test]
    fn snapshot_drops_zero_size_levels() {
        let book = OrderBook::new("T", 10);
        book.apply_snapshot(&[level(0.45, 0.0), level(0.44, 10.0)], &[level(0.47, 5.0)]);
        assert_eq!(book.best_bid().unwrap().price, 0.44);
    }

    #[test]
    fn trims_to_max_levels_dropping_worst() {
        let book = OrderBook::new("T", 3);
        for i in 0..6 {
            book.update_bid(0.40 + i as f64 * 0.01, 1.0);
            book.update_ask(0.50 + i as f64 * 0.01, 1.0);
        }

        let bids = book.top_bids(10);
        let asks = book.top_asks(10);
        assert_eq!(bids.len(), 3);
        assert_eq!(asks.len(), 3);
        // Best prices survive the trim.
        assert!((bids[0].price - 0.45).abs() < 1e-9);
        assert!((asks[0].price - 0.50).abs() < 1e-9);
    }

    #[test]
    fn mid_and_spread_zero_when_one_side_empty() {
        let book = OrderBook::new("T", 10);
        book.update_bid(0.45, 10.0);
        assert_eq!(book.mid_price(), 0.0);
        assert_eq!(book.spread(), 0.0);
        assert_eq!(book.spread_bps(), 0.0);

        book.update_ask(0.47, 10.0);
        assert!((book.mid_price() - 0.46).abs() < 1e-9);
        assert!((book.spread() - 0.02).abs() < 1e-9);
        assert!(book.spread_bps() > 0.0);
    }

    #[test]
    fn depth_sums_top_levels() {
        let book = OrderBook::new("T", 10);
        book.update_bid(0.45, 10.0);
        book.update_bid(0.44, 20.0);
        book.update_bid(0.43, 30.0);

        assert!((book.bid_depth(2) - 30.0).abs() < 1e-9);
        assert!((book.bid_depth(10) - 60.0).abs() < 1e-9);
        assert_eq!(book.ask_depth(10), 0.0);
    }

    #[test]
    fn staleness_uses_last_update() {
        let book = OrderBook::new("T", 10);
        book.update_bid(0.45, 10.0);
        assert!(!book.is_stale(60_000));
        assert!(book.is_stale(-1));
    }

    #[test]
    fn binary_book_aggregates() {
        let mb = BinaryMarketBook::new("mkt-1", "Will BTC be above $100,000?", "tok-yes", "tok-no", 0, 200.0);

        assert_eq!(mb.sum_of_best_asks(), 0.0);
        assert!(!mb.has_liquidity());

        mb.yes_book().update_bid(0.44, 10.0);
        mb.yes_book().update_ask(0.46, 10.0);
        mb.no_book().update_bid(0.46, 10.0);
        mb.no_book().update_ask(0.48, 10.0);

        assert!(mb.has_liquidity());
        assert!((mb.sum_of_best_asks() - 0.94).abs() < 1e-9);
        assert!((mb.sum_of_best_bids() - 0.90).abs() < 1e-9);
        assert!((mb.yes_implied_probability() - 0.45).abs() < 1e-9);
    }
}
