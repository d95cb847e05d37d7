// =============================================================================
// Strategies — signal generation from books and the reference price
// =============================================================================
//
// Each strategy is a pure evaluation over one binary book plus the reference
// price, with no side effects beyond its own rolling history. The three
// concrete strategies are tagged variants; the evaluation loop iterates them
// per market per tick.
// =============================================================================

pub mod fair_value;
pub mod stale_odds;
pub mod underpricing;

pub use fair_value::FairValueStrategy;
pub use stale_odds::StaleOddsStrategy;
pub use underpricing::UnderpricingStrategy;

use crate::market_data::order_book::BinaryMarketBook;
use crate::types::{ReferencePrice, Signal};

/// Everything a strategy may look at during one evaluation tick. The book
/// reference is borrowed for the duration of the tick and never stored.
pub struct StrategyInputs<'a> {
    pub book: &'a BinaryMarketBook,
    pub reference: Option<ReferencePrice>,
    pub now_ms: i64,
    /// Balance not currently tied up in exposure.
    pub available_balance: f64,
    pub max_notional_per_trade: f64,
    /// Remaining exposure headroom from the exposure manager.
    pub exposure_headroom: f64,
}

/// The three concrete strategies as a tagged set.
pub enum Strategy {
    Underpricing(UnderpricingStrategy),
    StaleOdds(StaleOddsStrategy),
    FairValue(FairValueStrategy),
}

impl Strategy {
    pub fn evaluate(&mut self, inputs: &StrategyInputs<'_>) -> Vec<Signal> {
        match self {
            Self::Underpricing(s) => s.evaluate(inputs),
            Self::StaleOdds(s) => s.evaluate(inputs),
            Self::FairValue(s) => s.evaluate(inputs),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Underpricing(_) => underpricing::STRATEGY_NAME,
            Self::StaleOdds(_) => stale_odds::STRATEGY_NAME,
            Self::FairValue(_) => fair_value::STRATEGY_NAME,
        }
    }

    pub fn signals_generated(&self) -> u64 {
        match self {
            Self::Underpricing(s) => s.signals_generated(),
            Self::StaleOdds(s) => s.signals_generated(),
            Self::FairValue(s) => s.signals_generated(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Extract a dollar strike from a market question, e.g.
/// "Will BTC be above $100,000 on Jan 31?" -> 100000.0.
pub(crate) fn parse_strike_from_question(question: &str) -> Option<f64> {
    let dollar = question.find('$')?;
    let rest = &question[dollar + 1..];

    let numeric: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();

    if numeric.is_empty() {
        return None;
    }
    numeric.parse().ok().filter(|v: &f64| *v > 0.0)
}

/// Years between now and the market end time.
pub(crate) fn time_to_expiry_years(end_date_ms: i64, now_ms: i64) -> f64 {
    let seconds = (end_date_ms - now_ms) as f64 / 1000.0;
    if seconds <= 0.0 {
        return 0.0;
    }
    seconds / (365.25 * 24.0 * 3600.0)
}

/// Fractional-Kelly stake: `f* = edge / (1 - p)`, scaled by `kelly_fraction`
/// and capped at `max_size`. Sub-unit stakes round down to zero.
pub(crate) fn kelly_size(edge: f64, probability: f64, max_size: f64, kelly_fraction: f64) -> f64 {
    let q = (1.0 - probability).max(0.01);
    let kelly_full = edge / q;
    let size = (kelly_full * kelly_fraction * max_size).min(max_size);
    if size < 1.0 {
        0.0
    } else {
        size
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strike_parsing() {
        assert_eq!(
            parse_strike_from_question("Will BTC be above $100,000 on Jan 31?"),
            Some(100_000.0)
        );
        assert_eq!(
            parse_strike_from_question("BTC 15m: Above $98,500.50?"),
            Some(98_500.50)
        );
        assert_eq!(parse_strike_from_question("Will it rain tomorrow?"), None);
        assert_eq!(parse_strike_from_question("Above $?"), None);
    }

    #[test]
    fn expiry_in_years() {
        let now = 1_700_000_000_000i64;
        let one_year_later = now + (365.25 * 24.0 * 3600.0 * 1000.0) as i64;
        let ttx = time_to_expiry_years(one_year_later, now);
        assert!((ttx - 1.0).abs() < 1e-6);

        assert_eq!(time_to_expiry_years(now - 1000, now), 0.0);
    }

    #[test]
    fn kelly_scales_and_floors() {
        // 4% edge at p=0.5 -> full Kelly 8%, quarter Kelly 2% of max.
        let size = kelly_size(0.04, 0.5, 1_000.0, 0.25);
        assert!((size - 20.0).abs() < 1e-9);

        // Tiny stake floors to zero.
        assert_eq!(kelly_size(0.001, 0.5, 100.0, 0.25), 0.0);

        // Never exceeds max.
        assert_eq!(kelly_size(10.0, 0.99, 50.0, 1.0), 50.0);
    }
}
