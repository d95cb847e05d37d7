// =============================================================================
// Underpricing Strategy — paired entry when YES + NO asks sum below fair
// =============================================================================
//
// If buying both outcomes costs less than the $1 payout net of fees and the
// minimum edge, emit a BUY signal on each outcome. The pair of signals is
// consumed as one unit by the paired executor. The comparison is strict: a
// market priced exactly at the threshold is not traded.
// =============================================================================

use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::strategy::StrategyInputs;
use crate::types::{Side, Signal};

pub const STRATEGY_NAME: &str = "underpricing";

pub struct UnderpricingStrategy {
    config: StrategyConfig,
    signals_generated: u64,
}

impl UnderpricingStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            signals_generated: 0,
        }
    }

    pub fn signals_generated(&self) -> u64 {
        self.signals_generated
    }

    /// Edge left after paying both asks and the fee, in probability units.
    pub fn calculate_edge(yes_ask: f64, no_ask: f64, fee_rate_bps: f64) -> f64 {
        1.0 - fee_rate_bps / 10_000.0 - (yes_ask + no_ask)
    }

    pub fn evaluate(&mut self, inputs: &StrategyInputs<'_>) -> Vec<Signal> {
        if !self.config.enable_underpricing {
            return Vec::new();
        }

        let book = inputs.book;
        if !book.has_liquidity() {
            return Vec::new();
        }

        let (Some(yes_ask), Some(no_ask)) =
            (book.yes_book().best_ask(), book.no_book().best_ask())
        else {
            return Vec::new();
        };

        // Wide books are skipped regardless of apparent edge.
        let yes_rel_spread = book.yes_book().spread() / yes_ask.price;
        let no_rel_spread = book.no_book().spread() / no_ask.price;
        if yes_rel_spread > self.config.max_spread_to_trade
            || no_rel_spread > self.config.max_spread_to_trade
        {
            debug!(
                market_id = %book.market_id(),
                yes_rel_spread,
                no_rel_spread,
                "spread too wide for underpricing"
            );
            return Vec::new();
        }

        let min_edge = self.config.min_edge_cents / 100.0;
        let fee_rate = book.fee_rate_bps() / 10_000.0;
        let sum_of_asks = yes_ask.price + no_ask.price;

        // Strict inequality: exactly at threshold is not traded.
        if !(sum_of_asks < 1.0 - fee_rate - min_edge) {
            return Vec::new();
        }

        let edge = Self::calculate_edge(yes_ask.price, no_ask.price, book.fee_rate_bps());

        // Per-leg budget: half the balance, the per-trade cap, and whatever
        // exposure headroom remains.
        let budget = (inputs.available_balance / 2.0)
            .min(inputs.max_notional_per_trade)
            .min(inputs.exposure_headroom);
        if budget <= 0.0 {
            return Vec::new();
        }

        let yes_size = (budget / yes_ask.price).min(yes_ask.size);
        let no_size = (budget / no_ask.price).min(no_ask.size);
        if yes_size <= 0.0 || no_size <= 0.0 {
            return Vec::new();
        }

        let confidence = (edge / min_edge).min(1.0);
        let reason = format!(
            "sum of asks {:.4} < {:.4} after {:.0}bps fee, edge {:.2}c",
            sum_of_asks,
            1.0 - fee_rate - min_edge,
            book.fee_rate_bps(),
            edge * 100.0
        );

        info!(
            market_id = %book.market_id(),
            yes_ask = yes_ask.price,
            no_ask = no_ask.price,
            edge_cents = edge * 100.0,
            "underpricing signal"
        );

        self.signals_generated += 2;

        vec![
            Signal {
                strategy: STRATEGY_NAME.to_string(),
                market_id: book.market_id().to_string(),
                token_id: book.yes_token_id().to_string(),
                side: Side::Buy,
                target_price: yes_ask.price,
                target_size: yes_size,
                expected_edge: edge,
                confidence,
                generated_at_ms: inputs.now_ms,
                reason: reason.clone(),
            },
            Signal {
                strategy: STRATEGY_NAME.to_string(),
                market_id: book.market_id().to_string(),
                token_id: book.no_token_id().to_string(),
                side: Side::Buy,
                target_price: no_ask.price,
                target_size: no_size,
                expected_edge: edge,
                confidence,
                generated_at_ms: inputs.now_ms,
                reason,
            },
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::order_book::BinaryMarketBook;
    use crate::types::now_ms;

    fn book(yes_ask: f64, no_ask: f64, fee_bps: f64) -> BinaryMarketBook {
        let book = BinaryMarketBook::new(
            "m1",
            "Will BTC be above $100,000?",
            "tok-yes",
            "tok-no",
            now_ms() + 3_600_000,
            fee_bps,
        );
        book.yes_book().update_bid(yes_ask - 0.01, 100.0);
        book.yes_book().update_ask(yes_ask, 100.0);
        book.no_book().update_bid(no_ask - 0.01, 100.0);
        book.no_book().update_ask(no_ask, 100.0);
        book
    }

    fn inputs<'a>(book: &'a BinaryMarketBook) -> StrategyInputs<'a> {
        StrategyInputs {
            book,
            reference: None,
            now_ms: now_ms(),
            available_balance: 50.0,
            max_notional_per_trade: 1.50,
            exposure_headroom: 100.0,
        }
    }

    fn strategy() -> UnderpricingStrategy {
        UnderpricingStrategy::new(StrategyConfig::default())
    }

    #[test]
    fn underpriced_market_emits_paired_buys() {
        // 0.46 + 0.48 = 0.94 < 1 - 0.02 (fee) - 0.02 (min edge) = 0.96
        let book = book(0.46, 0.48, 200.0);
        let mut s = strategy();

        let signals = s.evaluate(&inputs(&book));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].token_id, "tok-yes");
        assert_eq!(signals[1].token_id, "tok-no");
        assert!(signals.iter().all(|s| s.side == Side::Buy));

        // edge = 1 - 0.02 - 0.94 = 0.04
        assert!((signals[0].expected_edge - 0.04).abs() < 1e-9);
        assert_eq!(s.signals_generated(), 2);
    }

    #[test]
    fn threshold_is_strict() {
        // Sum of asks exactly 1 - fee - min_edge = 0.96: no trade.
        let book1 = book(0.47, 0.49, 200.0);
        let mut s = strategy();
        assert!(s.evaluate(&inputs(&book1)).is_empty());

        // One tick below the threshold trades.
        let book2 = book(0.47, 0.4899, 200.0);
        let mut s = strategy();
        assert_eq!(s.evaluate(&inputs(&book2)).len(), 2);
    }

    #[test]
    fn sizes_respect_budget_and_depth() {
        let book = book(0.46, 0.48, 200.0);
        let mut s = strategy();

        let signals = s.evaluate(&inputs(&book));
        // Budget = min(50/2, 1.50, 100) = 1.50 per leg.
        assert!((signals[0].target_size - 1.50 / 0.46).abs() < 1e-9);
        assert!((signals[1].target_size - 1.50 / 0.48).abs() < 1e-9);

        // Thin ask caps the size.
        let thin = BinaryMarketBook::new("m2", "q", "y", "n", 0, 200.0);
        thin.yes_book().update_bid(0.45, 1.0);
        thin.yes_book().update_ask(0.46, 0.5);
        thin.no_book().update_bid(0.47, 1.0);
        thin.no_book().update_ask(0.48, 100.0);
        let signals = s.evaluate(&inputs(&thin));
        assert!((signals[0].target_size - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wide_spread_blocks_trade() {
        let book = BinaryMarketBook::new("m1", "q", "y", "n", 0, 200.0);
        book.yes_book().update_bid(0.30, 100.0); // huge spread on YES
        book.yes_book().update_ask(0.46, 100.0);
        book.no_book().update_bid(0.47, 100.0);
        book.no_book().update_ask(0.48, 100.0);

        let mut s = strategy();
        assert!(s.evaluate(&inputs(&book)).is_empty());
    }

    #[test]
    fn missing_liquidity_blocks_trade() {
        let book = BinaryMarketBook::new("m1", "q", "y", "n", 0, 200.0);
        book.yes_book().update_ask(0.40, 100.0);
        book.no_book().update_ask(0.40, 100.0);
        // No bids anywhere: has_liquidity is false.
        let mut s = strategy();
        assert!(s.evaluate(&inputs(&book)).is_empty());
    }

    #[test]
    fn disabled_strategy_is_silent() {
        let book = book(0.40, 0.40, 200.0);
        let mut config = StrategyConfig::default();
        config.enable_underpricing = false;
        let mut s = UnderpricingStrategy::new(config);
        assert!(s.evaluate(&inputs(&book)).is_empty());
    }

    #[test]
    fn edge_formula_uses_fractional_fee() {
        // fee_rate_bps is basis points; the formula converts to a fraction.
        let edge = UnderpricingStrategy::calculate_edge(0.46, 0.48, 200.0);
        assert!((edge - 0.04).abs() < 1e-9);

        let no_fee = UnderpricingStrategy::calculate_edge(0.46, 0.48, 0.0);
        assert!((no_fee - 0.06).abs() < 1e-9);
    }
}
