// =============================================================================
// Stale-Odds Strategy — lag arbitrage against a moving reference price
// =============================================================================
//
// When the reference price moves sharply but the market's books have gone
// quiet, the quoted odds lag where they should be. Buy the side the move
// favours at its current ask. Position management (take-profit, stop-loss)
// belongs to the executor; this strategy only produces entry signals.
// =============================================================================

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::strategy::{parse_strike_from_question, StrategyInputs};
use crate::types::{Side, Signal};

pub const STRATEGY_NAME: &str = "stale_odds";

/// Reference samples retained (60 s at ~10 Hz).
const MAX_HISTORY: usize = 600;
/// Fraction of full Kelly used for sizing.
const KELLY_FRACTION: f64 = 0.25;
/// Linear fair-probability model: percent distance to strike maps to
/// probability at this slope.
const DISTANCE_TO_PROB_SLOPE: f64 = 0.1;

pub struct StaleOddsStrategy {
    config: StrategyConfig,
    /// (timestamp_ms, reference mid).
    history: VecDeque<(i64, f64)>,
    signals_generated: u64,
}

impl StaleOddsStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            signals_generated: 0,
        }
    }

    pub fn signals_generated(&self) -> u64 {
        self.signals_generated
    }

    /// Record one reference observation.
    pub fn update_reference(&mut self, price: f64, now_ms: i64) {
        self.history.push_back((now_ms, price));
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    /// Reference move in basis points over the trailing `window_ms`.
    pub fn move_bps(&self, window_ms: i64, now_ms: i64) -> f64 {
        let Some(&(_, current)) = self.history.back() else {
            return 0.0;
        };

        let target = now_ms - window_ms;
        let past = self
            .history
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= target)
            .map(|(_, p)| *p)
            .or_else(|| self.history.front().map(|(_, p)| *p))
            .unwrap_or(0.0);

        if past <= 0.0 || current <= 0.0 {
            return 0.0;
        }
        (current - past) / past * 10_000.0
    }

    /// Where the YES probability should sit given the reference distance to
    /// the strike: 0.5 at the strike, +-0.1 per percent away, clamped.
    fn fair_yes_probability(reference: f64, strike: f64) -> f64 {
        let distance_pct = (reference - strike) / strike * 100.0;
        (0.5 + distance_pct * DISTANCE_TO_PROB_SLOPE).clamp(0.05, 0.95)
    }

    pub fn evaluate(&mut self, inputs: &StrategyInputs<'_>) -> Vec<Signal> {
        if !self.config.enable_stale_odds {
            return Vec::new();
        }

        let Some(reference) = inputs.reference else {
            return Vec::new();
        };
        self.update_reference(reference.mid, inputs.now_ms);

        let book = inputs.book;
        if !book.has_liquidity() {
            return Vec::new();
        }

        let move_1s = self.move_bps(1_000, inputs.now_ms);
        let move_5s = self.move_bps(5_000, inputs.now_ms);

        if move_1s.abs() < self.config.lag_move_threshold_bps {
            return Vec::new();
        }

        // The market must actually be lagging.
        let oldest_update = book
            .yes_book()
            .last_update_ms()
            .min(book.no_book().last_update_ms());
        let staleness_ms = inputs.now_ms - oldest_update;
        if staleness_ms < self.config.staleness_window_ms {
            return Vec::new();
        }

        let Some(strike) = parse_strike_from_question(book.question()) else {
            debug!(market_id = %book.market_id(), "no strike in question");
            return Vec::new();
        };

        let fair_yes = Self::fair_yes_probability(reference.mid, strike);
        let min_gap = self.config.min_edge_cents / 100.0;

        let (Some(yes_ask), Some(no_ask)) =
            (book.yes_book().best_ask(), book.no_book().best_ask())
        else {
            return Vec::new();
        };

        let edge_yes = fair_yes - yes_ask.price;
        let edge_no = (1.0 - fair_yes) - no_ask.price;

        let (token_id, side_price, edge, favored) = if move_1s > 0.0 && edge_yes > min_gap {
            (book.yes_token_id(), yes_ask, edge_yes, "YES")
        } else if move_1s < 0.0 && edge_no > min_gap {
            (book.no_token_id(), no_ask, edge_no, "NO")
        } else {
            return Vec::new();
        };

        let confidence = (edge / min_gap).min(1.0);
        if confidence < self.config.min_confidence {
            return Vec::new();
        }

        // Kelly stake on the bankroll, capped by the per-trade notional and
        // remaining exposure headroom.
        let probability = if favored == "YES" { fair_yes } else { 1.0 - fair_yes };
        let q = (1.0 - probability).max(0.01);
        let stake_fraction = (edge / q) * KELLY_FRACTION;
        let notional = (stake_fraction * inputs.available_balance)
            .min(inputs.max_notional_per_trade)
            .min(inputs.exposure_headroom);
        let size = (notional / side_price.price).min(side_price.size);
        if size <= 0.0 {
            return Vec::new();
        }

        info!(
            market_id = %book.market_id(),
            favored,
            move_1s_bps = move_1s,
            staleness_ms,
            edge_cents = edge * 100.0,
            "stale-odds signal"
        );

        self.signals_generated += 1;

        vec![Signal {
            strategy: STRATEGY_NAME.to_string(),
            market_id: book.market_id().to_string(),
            token_id: token_id.to_string(),
            side: Side::Buy,
            target_price: side_price.price,
            target_size: size,
            expected_edge: edge,
            confidence,
            generated_at_ms: inputs.now_ms,
            reason: format!(
                "reference moved {move_1s:.1}bps/1s ({move_5s:.1}bps/5s), market {staleness_ms}ms stale, fair {favored} {fair_yes:.3}"
            ),
        }]
    }
}
