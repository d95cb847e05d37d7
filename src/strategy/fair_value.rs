// =============================================================================
// Volatility Fair-Value Strategy — digital-option pricing vs. market odds
// =============================================================================
//
// Estimates realized volatility from reference log returns, prices the
// market's "above the strike at expiry" claim as a digital call N(d2), and
// trades when the fair probability diverges from the market's implied
// probability by both a probability edge and a cents edge.
// =============================================================================

use std::collections::VecDeque;

use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::strategy::{
    kelly_size, parse_strike_from_question, time_to_expiry_years, StrategyInputs,
};
use crate::types::{Side, Signal};

pub const STRATEGY_NAME: &str = "fair_value";

/// Volatility-model parameters.
#[derive(Debug, Clone)]
pub struct FairValueConfig {
    pub vol_lookback_hours: u32,
    pub vol_sample_interval_secs: u32,
    pub default_annualized_vol: f64,

    pub min_probability_edge: f64,
    pub min_cents_edge: f64,
    pub max_probability: f64,
    pub min_probability: f64,

    pub max_spread_percent: f64,
    pub min_liquidity_usd: f64,

    pub kelly_fraction: f64,
}

impl Default for FairValueConfig {
    fn default() -> Self {
        Self {
            vol_lookback_hours: 24,
            vol_sample_interval_secs: 300,
            default_annualized_vol: 0.50,
            min_probability_edge: 0.03,
            min_cents_edge: 1.5,
            max_probability: 0.95,
            min_probability: 0.05,
            max_spread_percent: 0.05,
            min_liquidity_usd: 10.0,
            kelly_fraction: 0.25,
        }
    }
}

/// Result of one fair-value computation, kept for the signal's reason text.
#[derive(Debug, Clone)]
pub struct FairValueResult {
    pub fair_probability: f64,
    pub market_probability: f64,
    pub probability_edge: f64,
    pub realized_vol: f64,
    pub implied_vol: f64,
    pub is_tradeable: bool,
    pub reason: String,
}

pub struct FairValueStrategy {
    config: StrategyConfig,
    vol_config: FairValueConfig,
    /// (timestamp_ms, reference mid), sampled at the configured interval.
    price_history: VecDeque<(i64, f64)>,
    signals_generated: u64,
}

impl FairValueStrategy {
    pub fn new(config: StrategyConfig, vol_config: FairValueConfig) -> Self {
        Self {
            config,
            vol_config,
            price_history: VecDeque::new(),
            signals_generated: 0,
        }
    }

    pub fn signals_generated(&self) -> u64 {
        self.signals_generated
    }

    // -------------------------------------------------------------------------
    // Volatility estimation
    // -------------------------------------------------------------------------

    /// Record a reference observation. Samples are kept at the configured
    /// interval; the window is bounded by the lookback.
    pub fn update_reference(&mut self, price: f64, now_ms: i64) {
        let interval_ms = self.vol_config.vol_sample_interval_secs as i64 * 1000;
        if let Some(&(last_ts, _)) = self.price_history.back() {
            if now_ms - last_ts < interval_ms {
                return;
            }
        }

        self.price_history.push_back((now_ms, price));

        let max_samples = (self.vol_config.vol_lookback_hours as usize * 3600)
            / self.vol_config.vol_sample_interval_secs.max(1) as usize;
        while self.price_history.len() > max_samples.max(2) {
            self.price_history.pop_front();
        }
    }

    /// Annualized realized volatility from log returns; falls back to the
    /// configured default with fewer than 10 samples.
    pub fn annualized_volatility(&self) -> f64 {
        if self.price_history.len() < 10 {
            return self.vol_config.default_annualized_vol;
        }

        let returns: Vec<f64> = self
            .price_history
            .iter()
            .zip(self.price_history.iter().skip(1))
            .filter(|((_, prev), (_, next))| *prev > 0.0 && *next > 0.0)
            .map(|((_, prev), (_, next))| (next / prev).ln())
            .collect();

        if returns.is_empty() {
            return self.vol_config.default_annualized_vol;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / returns.len() as f64;
        let per_sample = variance.sqrt();

        let samples_per_year =
            365.25 * 24.0 * 3600.0 / self.vol_config.vol_sample_interval_secs as f64;
        per_sample * samples_per_year.sqrt()
    }

    // -------------------------------------------------------------------------
    // Pricing
    // -------------------------------------------------------------------------

    /// P(S > K at T): the digital-call probability N(d2). At zero time or
    /// zero vol this collapses to the indicator S >= K.
    pub fn digital_probability(spot: f64, strike: f64, ttx_years: f64, sigma: f64) -> f64 {
        if ttx_years <= 0.0 || sigma <= 0.0 {
            return if spot >= strike { 1.0 } else { 0.0 };
        }

        let normal = Normal::new(0.0, 1.0).expect("standard normal");
        let d1 = ((spot / strike).ln() + 0.5 * sigma * sigma * ttx_years)
            / (sigma * ttx_years.sqrt());
        let d2 = d1 - sigma * ttx_years.sqrt();
        normal.cdf(d2)
    }

    /// Back out the volatility that reproduces the market probability.
    /// Newton-Raphson with a vega-like derivative, bounded to [1%, 300%].
    fn implied_volatility(&self, market_prob: f64, spot: f64, strike: f64, ttx_years: f64) -> f64 {
        let normal = Normal::new(0.0, 1.0).expect("standard normal");
        let mut sigma = self.vol_config.default_annualized_vol;

        for _ in 0..20 {
            let calc = Self::digital_probability(spot, strike, ttx_years, sigma);
            let error = calc - market_prob;
            if error.abs() < 0.001 {
                break;
            }

            let d1 = ((spot / strike).ln() + 0.5 * sigma * sigma * ttx_years)
                / (sigma * ttx_years.sqrt());
            let vega = normal.pdf(d1) * ttx_years.sqrt();
            if vega < 0.001 {
                break;
            }

            sigma = (sigma - error / vega).clamp(0.01, 3.0);
        }

        sigma
    }

    pub fn calculate_fair_value(
        &self,
        market_probability: f64,
        spot: f64,
        strike: f64,
        ttx_years: f64,
    ) -> FairValueResult {
        let realized_vol = self.annualized_volatility();
        let fair_probability = Self::digital_probability(spot, strike, ttx_years, realized_vol);
        let implied_vol = self.implied_volatility(market_probability, spot, strike, ttx_years);
        let probability_edge = fair_probability - market_probability;

        let mut result = FairValueResult {
            fair_probability,
            market_probability,
            probability_edge,
            realized_vol,
            implied_vol,
            is_tradeable: false,
            reason: String::new(),
        };

        if fair_probability > self.vol_config.max_probability
            || fair_probability < self.vol_config.min_probability
        {
            result.reason = format!(
                "fair probability {:.1}% outside bounds",
                fair_probability * 100.0
            );
            return result;
        }
        if market_probability > self.vol_config.max_probability
            || market_probability < self.vol_config.min_probability
        {
            result.reason = format!(
                "market probability {:.1}% outside bounds",
                market_probability * 100.0
            );
            return result;
        }

        result.is_tradeable = true;
        result
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    pub fn evaluate(&mut self, inputs: &StrategyInputs<'_>) -> Vec<Signal> {
        if !self.config.enable_fair_value {
            return Vec::new();
        }

        let Some(reference) = inputs.reference else {
            return Vec::new();
        };
        self.update_reference(reference.mid, inputs.now_ms);

        let book = inputs.book;
        if !self.is_market_tradeable(inputs) {
            return Vec::new();
        }

        let Some(strike) = parse_strike_from_question(book.question()) else {
            debug!(market_id = %book.market_id(), "no strike in question");
            return Vec::new();
        };
        let ttx = time_to_expiry_years(book.end_date_ms(), inputs.now_ms);
        if ttx <= 0.0 {
            debug!(market_id = %book.market_id(), "market expired");
            return Vec::new();
        }

        let market_probability = book.yes_implied_probability();
        let fv = self.calculate_fair_value(market_probability, reference.mid, strike, ttx);
        if !fv.is_tradeable {
            debug!(market_id = %book.market_id(), reason = %fv.reason, "not tradeable");
            return Vec::new();
        }

        let edge = fv.probability_edge.abs();
        if edge < self.vol_config.min_probability_edge {
            return Vec::new();
        }
        if edge * 100.0 < self.vol_config.min_cents_edge {
            return Vec::new();
        }

        let buy_yes = fv.fair_probability > fv.market_probability;
        let (Some(yes_ask), Some(no_ask)) =
            (book.yes_book().best_ask(), book.no_book().best_ask())
        else {
            return Vec::new();
        };
        let (token_id, ask) = if buy_yes {
            (book.yes_token_id(), yes_ask)
        } else {
            (book.no_token_id(), no_ask)
        };

        let probability = if buy_yes {
            fv.fair_probability
        } else {
            1.0 - fv.fair_probability
        };
        let max_shares = inputs
            .max_notional_per_trade
            .min(inputs.available_balance)
            .min(inputs.exposure_headroom)
            / ask.price;
        let size = kelly_size(edge, probability, max_shares, self.vol_config.kelly_fraction)
            .min(ask.size);
        if size <= 0.0 {
            return Vec::new();
        }

        let confidence = (edge / self.vol_config.min_probability_edge).min(1.0);

        info!(
            market_id = %book.market_id(),
            buy_yes,
            fair = fv.fair_probability,
            market = fv.market_probability,
            realized_vol = fv.realized_vol,
            "fair-value signal"
        );

        self.signals_generated += 1;

        vec![Signal {
            strategy: STRATEGY_NAME.to_string(),
            market_id: book.market_id().to_string(),
            token_id: token_id.to_string(),
            side: Side::Buy,
            target_price: ask.price,
            target_size: size,
            expected_edge: edge,
            confidence,
            generated_at_ms: inputs.now_ms,
            reason: format!(
                "fair {:.1}% vs market {:.1}%, realized vol {:.1}%, implied vol {:.1}%",
                fv.fair_probability * 100.0,
                fv.market_probability * 100.0,
                fv.realized_vol * 100.0,
                fv.implied_vol * 100.0
            ),
        }]
    }

    fn is_market_tradeable(&self, inputs: &StrategyInputs<'_>) -> bool {
        let book = inputs.book;
        if !book.has_liquidity() {
            return false;
        }

        let (Some(yes_ask), Some(yes_bid)) =
            (book.yes_book().best_ask(), book.yes_book().best_bid())
        else {
            return false;
        };

        let rel_spread = (yes_ask.price - yes_bid.price) / yes_ask.price;
        if rel_spread > self.vol_config.max_spread_percent {
            return false;
        }

        // Require a minimum of resting notional at the touch.
        if yes_ask.size * yes_ask.price < self.vol_config.min_liquidity_usd {
            return false;
        }

        true
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::order_book::BinaryMarketBook;
    use crate::types::{now_ms, ReferencePrice};

    fn book_with_mid(yes_mid: f64) -> BinaryMarketBook {
        let book = BinaryMarketBook::new(
            "m1",
            "Will BTC be above $100,000?",
            "tok-yes",
            "tok-no",
            now_ms() + 3_600_000, // one hour out
            0.0,
        );
        book.yes_book().update_bid(yes_mid - 0.005, 500.0);
        book.yes_book().update_ask(yes_mid + 0.005, 500.0);
        book.no_book().update_bid(1.0 - yes_mid - 0.005, 500.0);
        book.no_book().update_ask(1.0 - yes_mid + 0.005, 500.0);
        book
    }

    fn inputs<'a>(book: &'a BinaryMarketBook, mid: f64) -> StrategyInputs<'a> {
        StrategyInputs {
            book,
            reference: Some(ReferencePrice {
                bid: mid - 0.5,
                ask: mid + 0.5,
                mid,
                last: mid,
                recv_ms: now_ms(),
                exchange_time_ms: 0,
            }),
            now_ms: now_ms(),
            available_balance: 500.0,
            max_notional_per_trade: 100.0,
            exposure_headroom: 500.0,
        }
    }

    fn strategy() -> FairValueStrategy {
        FairValueStrategy::new(StrategyConfig::default(), FairValueConfig::default())
    }

    #[test]
    fn digital_probability_basics() {
        // At the strike with modest vol the probability sits near one half.
        let p = FairValueStrategy::digital_probability(100_000.0, 100_000.0, 0.01, 0.5);
        assert!((p - 0.5).abs() < 0.05);

        // Deep in the money approaches one; out of the money approaches zero.
        let itm = FairValueStrategy::digital_probability(150_000.0, 100_000.0, 0.01, 0.5);
        let otm = FairValueStrategy::digital_probability(50_000.0, 100_000.0, 0.01, 0.5);
        assert!(itm > 0.99);
        assert!(otm < 0.01);

        // Expired markets collapse to the indicator.
        assert_eq!(
            FairValueStrategy::digital_probability(101.0, 100.0, 0.0, 0.5),
            1.0
        );
        assert_eq!(
            FairValueStrategy::digital_probability(99.0, 100.0, 0.0, 0.5),
            0.0
        );
    }

    #[test]
    fn default_vol_until_enough_samples() {
        let s = strategy();
        assert!((s.annualized_volatility() - 0.50).abs() < 1e-9);
    }

    #[test]
    fn constant_prices_mean_zero_vol() {
        let mut s = strategy();
        let t0 = 1_700_000_000_000i64;
        for i in 0..20 {
            s.update_reference(100_000.0, t0 + i * 300_000);
        }
        assert!(s.annualized_volatility() < 1e-9);
    }

    #[test]
    fn volatile_prices_yield_positive_vol() {
        let mut s = strategy();
        let t0 = 1_700_000_000_000i64;
        for i in 0..20 {
            let price = if i % 2 == 0 { 100_000.0 } else { 101_000.0 };
            s.update_reference(price, t0 + i * 300_000);
        }
        assert!(s.annualized_volatility() > 0.5);
    }

    #[test]
    fn samples_respect_interval() {
        let mut s = strategy();
        let t0 = 1_700_000_000_000i64;
        s.update_reference(100_000.0, t0);
        s.update_reference(100_100.0, t0 + 1_000); // too soon, dropped
        s.update_reference(100_200.0, t0 + 300_000);
        assert_eq!(s.price_history.len(), 2);
    }

    #[test]
    fn cheap_market_buys_yes() {
        // Market at 30% while the model (near the strike) says ~50%.
        let book = book_with_mid(0.30);
        let mut s = strategy();

        let signals = s.evaluate(&inputs(&book, 100_000.0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].token_id, "tok-yes");
        assert!(signals[0].expected_edge > 0.03);
    }

    #[test]
    fn rich_market_buys_no() {
        let book = book_with_mid(0.70);
        let mut s = strategy();

        let signals = s.evaluate(&inputs(&book, 100_000.0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].token_id, "tok-no");
    }

    #[test]
    fn extreme_probabilities_are_not_traded() {
        // Reference far above the strike: fair probability ~1, out of bounds.
        let book = book_with_mid(0.50);
        let mut s = strategy();

        let signals = s.evaluate(&inputs(&book, 150_000.0));
        assert!(signals.is_empty());
    }

    #[test]
    fn small_edge_is_not_traded() {
        // Market at 49% vs fair ~50%: under both edge thresholds.
        let book = book_with_mid(0.49);
        let mut s = strategy();

        let signals = s.evaluate(&inputs(&book, 100_000.0));
        assert!(signals.is_empty());
    }

    #[test]
    fn implied_vol_stays_bounded() {
        let s = strategy();
        for prob in [0.1, 0.3, 0.5, 0.7, 0.9] {
            let iv = s.implied_volatility(prob, 100_000.0, 98_000.0, 0.1);
            assert!((0.01..=3.0).contains(&iv));
            assert!(iv.is_finite());
        }
    }

    #[test]
    fn wide_spread_fails_tradeable_gate() {
        let book = BinaryMarketBook::new(
            "m1",
            "Will BTC be above $100,000?",
            "y",
            "n",
            now_ms() + 3_600_000,
            0.0,
        );
        book.yes_book().update_bid(0.30, 500.0);
        book.yes_book().update_ask(0.50, 500.0);
        book.no_book().update_bid(0.49, 500.0);
        book.no_book().update_ask(0.51, 500.0);

        let mut s = strategy();
        assert!(s.evaluate(&inputs(&book, 100_000.0)).is_empty());
    }
}
