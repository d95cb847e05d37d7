// =============================================================================
// Market Data — order books and the two streaming feeds
// =============================================================================

pub mod market_feed;
pub mod order_book;
pub mod reference_feed;

pub use market_feed::MarketBookRegistry;
pub use order_book::{BinaryMarketBook, OrderBook};
pub use reference_feed::ReferencePriceCell;

/// Exponential backoff delay for reconnect attempt `attempt` (0-based),
/// doubling from `base_ms` and capped at `cap_ms`.
pub(crate) fn backoff_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let shift = attempt.min(16);
    base_ms.saturating_mul(1u64 << shift).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0, 1_000, 30_000), 1_000);
        assert_eq!(backoff_delay_ms(1, 1_000, 30_000), 2_000);
        assert_eq!(backoff_delay_ms(2, 1_000, 30_000), 4_000);
        assert_eq!(backoff_delay_ms(4, 1_000, 30_000), 16_000);
        assert_eq!(backoff_delay_ms(5, 1_000, 30_000), 30_000);
        assert_eq!(backoff_delay_ms(60, 1_000, 30_000), 30_000);
    }
}
