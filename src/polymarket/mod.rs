// =============================================================================
// Polymarket — REST client and the venue gateway traits
// =============================================================================

pub mod client;
pub mod gateway;

pub use client::{PolymarketClient, PolymarketCredentials};
