// =============================================================================
// Exposure Manager — hard and soft position limits
// =============================================================================
//
// Hard limits are compile-time constants; soft limits come from configuration
// and are clamped to the hard limits at construction. The hot counters (total
// exposure, open position count) are atomics so the common checks read
// lock-free; the per-market and per-position maps sit behind one mutex.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ExposureConfig;

// ---------------------------------------------------------------------------
// Check result
// ---------------------------------------------------------------------------

/// Outcome of a pre-trade exposure check.
#[derive(Debug, Clone)]
pub struct ExposureCheck {
    pub allowed: bool,
    pub rejection_reason: Option<String>,
    pub current_exposure: f64,
    pub limit: f64,
    /// How much more notional could be added before hitting the limit.
    pub headroom: f64,
}

impl ExposureCheck {
    fn denied(reason: String, current: f64, limit: f64, headroom: f64) -> Self {
        Self {
            allowed: false,
            rejection_reason: Some(reason),
            current_exposure: current,
            limit,
            headroom: headroom.max(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Soft limits
// ---------------------------------------------------------------------------

/// Configured limits after clamping to the hard constants.
#[derive(Debug, Clone)]
pub struct SoftLimits {
    pub max_total_exposure: f64,
    pub max_market_exposure: f64,
    pub max_position_size: f64,
    pub max_open_positions: u32,
    pub max_positions_per_market: u32,
}

impl SoftLimits {
    fn clamped(config: &ExposureConfig) -> Self {
        Self {
            max_total_exposure: config
                .max_total_exposure
                .min(ExposureManager::HARD_MAX_TOTAL_EXPOSURE),
            max_market_exposure: config
                .max_market_exposure
                .min(ExposureManager::HARD_MAX_MARKET_EXPOSURE),
            max_position_size: config
                .max_position_size
                .min(ExposureManager::HARD_MAX_POSITION_SIZE),
            max_open_positions: config
                .max_open_positions
                .min(ExposureManager::HARD_MAX_OPEN_POSITIONS),
            max_positions_per_market: config
                .max_positions_per_market
                .min(ExposureManager::HARD_MAX_POSITIONS_PER_MARKET),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ExposureMaps {
    market_exposures: HashMap<String, f64>,
    position_exposures: HashMap<String, f64>,
    market_position_counts: HashMap<String, u32>,
    token_to_market: HashMap<String, String>,
}

/// Tracks open exposure and enforces both limit tiers.
pub struct ExposureManager {
    soft_limits: SoftLimits,
    maps: Mutex<ExposureMaps>,
    /// f64 bits of the current total exposure, for lock-free reads.
    total_exposure_bits: AtomicU64,
    open_positions: AtomicU32,
}

impl ExposureManager {
    // Hard limits. Cannot be overridden by configuration.
    pub const HARD_MAX_TOTAL_EXPOSURE: f64 = 10_000.0;
    pub const HARD_MAX_MARKET_EXPOSURE: f64 = 2_000.0;
    pub const HARD_MAX_POSITION_SIZE: f64 = 1_000.0;
    pub const HARD_MAX_OPEN_POSITIONS: u32 = 20;
    pub const HARD_MAX_POSITIONS_PER_MARKET: u32 = 4;

    pub fn new(config: &ExposureConfig) -> Self {
        let soft_limits = SoftLimits::clamped(config);
        debug!(
            total = soft_limits.max_total_exposure,
            market = soft_limits.max_market_exposure,
            position = soft_limits.max_position_size,
            positions = soft_limits.max_open_positions,
            "exposure manager initialised"
        );
        Self {
            soft_limits,
            maps: Mutex::new(ExposureMaps::default()),
            total_exposure_bits: AtomicU64::new(0f64.to_bits()),
            open_positions: AtomicU32::new(0),
        }
    }

    pub fn soft_limits(&self) -> &SoftLimits {
        &self.soft_limits
    }

    // -------------------------------------------------------------------------
    // Pre-trade checks
    // -------------------------------------------------------------------------

    /// Check whether a brand-new position of `notional` may be opened in
    /// `market_id`. Hard limits are checked first, then soft limits.
    pub fn can_open_position(&self, market_id: &str, notional: f64) -> ExposureCheck {
        let maps = self.maps.lock();

        let current_total = self.total_exposure();
        let current_count = self.open_positions.load(Ordering::Relaxed);
        let current_market = maps.market_exposures.get(market_id).copied().unwrap_or(0.0);
        let market_count = maps
            .market_position_counts
            .get(market_id)
            .copied()
            .unwrap_or(0);

        let new_total = current_total + notional;
        let new_market = current_market + notional;
        let new_count = current_count + 1;
        let new_market_count = market_count + 1;

        // Hard limits first.
        if new_total > Self::HARD_MAX_TOTAL_EXPOSURE {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: total exposure ${new_total:.2} would exceed ${:.0}",
                    Self::HARD_MAX_TOTAL_EXPOSURE
                ),
                current_total,
                Self::HARD_MAX_TOTAL_EXPOSURE,
                Self::HARD_MAX_TOTAL_EXPOSURE - current_total,
            );
        }
        if new_market > Self::HARD_MAX_MARKET_EXPOSURE {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: market exposure ${new_market:.2} would exceed ${:.0}",
                    Self::HARD_MAX_MARKET_EXPOSURE
                ),
                current_total,
                Self::HARD_MAX_MARKET_EXPOSURE,
                Self::HARD_MAX_MARKET_EXPOSURE - current_market,
            );
        }
        if notional > Self::HARD_MAX_POSITION_SIZE {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: position size ${notional:.2} exceeds ${:.0}",
                    Self::HARD_MAX_POSITION_SIZE
                ),
                current_total,
                Self::HARD_MAX_POSITION_SIZE,
                Self::HARD_MAX_POSITION_SIZE,
            );
        }
        if new_count > Self::HARD_MAX_OPEN_POSITIONS {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: {new_count} positions would exceed max {}",
                    Self::HARD_MAX_OPEN_POSITIONS
                ),
                current_total,
                Self::HARD_MAX_OPEN_POSITIONS as f64,
                0.0,
            );
        }
        if new_market_count > Self::HARD_MAX_POSITIONS_PER_MARKET {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: {new_market_count} positions in market would exceed max {}",
                    Self::HARD_MAX_POSITIONS_PER_MARKET
                ),
                current_total,
                Self::HARD_MAX_POSITIONS_PER_MARKET as f64,
                0.0,
            );
        }

        // Soft limits.
        if new_total > self.soft_limits.max_total_exposure {
            return ExposureCheck::denied(
                format!(
                    "Total exposure ${new_total:.2} would exceed limit ${:.0}",
                    self.soft_limits.max_total_exposure
                ),
                current_total,
                self.soft_limits.max_total_exposure,
                self.soft_limits.max_total_exposure - current_total,
            );
        }
        if new_market > self.soft_limits.max_market_exposure {
            return ExposureCheck::denied(
                format!(
                    "Market exposure ${new_market:.2} would exceed limit ${:.0}",
                    self.soft_limits.max_market_exposure
                ),
                current_total,
                self.soft_limits.max_market_exposure,
                self.soft_limits.max_market_exposure - current_market,
            );
        }
        if notional > self.soft_limits.max_position_size {
            return ExposureCheck::denied(
                format!(
                    "Position size ${notional:.2} exceeds limit ${:.0}",
                    self.soft_limits.max_position_size
                ),
                current_total,
                self.soft_limits.max_position_size,
                self.soft_limits.max_position_size,
            );
        }
        if new_count > self.soft_limits.max_open_positions {
            return ExposureCheck::denied(
                format!(
                    "{new_count} positions would exceed limit {}",
                    self.soft_limits.max_open_positions
                ),
                current_total,
                self.soft_limits.max_open_positions as f64,
                0.0,
            );
        }
        if new_market_count > self.soft_limits.max_positions_per_market {
            return ExposureCheck::denied(
                format!(
                    "{new_market_count} positions in market would exceed limit {}",
                    self.soft_limits.max_positions_per_market
                ),
                current_total,
                self.soft_limits.max_positions_per_market as f64,
                0.0,
            );
        }

        ExposureCheck {
            allowed: true,
            rejection_reason: None,
            current_exposure: current_total,
            limit: self.soft_limits.max_total_exposure,
            headroom: self.soft_limits.max_total_exposure - new_total,
        }
    }

    /// Check whether an existing position in `token_id` may grow by
    /// `additional_notional`.
    pub fn can_increase_position(
        &self,
        market_id: &str,
        token_id: &str,
        additional_notional: f64,
    ) -> ExposureCheck {
        let maps = self.maps.lock();

        let current_total = self.total_exposure();
        let current_market = maps.market_exposures.get(market_id).copied().unwrap_or(0.0);
        let current_position = maps.position_exposures.get(token_id).copied().unwrap_or(0.0);

        let new_total = current_total + additional_notional;
        let new_market = current_market + additional_notional;
        let new_position = current_position + additional_notional;

        if new_total > Self::HARD_MAX_TOTAL_EXPOSURE {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: total exposure ${new_total:.2} would exceed ${:.0}",
                    Self::HARD_MAX_TOTAL_EXPOSURE
                ),
                current_total,
                Self::HARD_MAX_TOTAL_EXPOSURE,
                Self::HARD_MAX_TOTAL_EXPOSURE - current_total,
            );
        }
        if new_market > Self::HARD_MAX_MARKET_EXPOSURE {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: market exposure ${new_market:.2} would exceed ${:.0}",
                    Self::HARD_MAX_MARKET_EXPOSURE
                ),
                current_total,
                Self::HARD_MAX_MARKET_EXPOSURE,
                Self::HARD_MAX_MARKET_EXPOSURE - current_market,
            );
        }
        if new_position > Self::HARD_MAX_POSITION_SIZE {
            return ExposureCheck::denied(
                format!(
                    "HARD LIMIT: position size ${new_position:.2} would exceed ${:.0}",
                    Self::HARD_MAX_POSITION_SIZE
                ),
                current_total,
                Self::HARD_MAX_POSITION_SIZE,
                Self::HARD_MAX_POSITION_SIZE - current_position,
            );
        }

        if new_total > self.soft_limits.max_total_exposure {
            return ExposureCheck::denied(
                format!(
                    "Total exposure ${new_total:.2} would exceed limit ${:.0}",
                    self.soft_limits.max_total_exposure
                ),
                current_total,
                self.soft_limits.max_total_exposure,
                self.soft_limits.max_total_exposure - current_total,
            );
        }
        if new_market > self.soft_limits.max_market_exposure {
            return ExposureCheck::denied(
                format!(
                    "Market exposure ${new_market:.2} would exceed limit ${:.0}",
                    self.soft_limits.max_market_exposure
                ),
                current_total,
                self.soft_limits.max_market_exposure,
                self.soft_limits.max_market_exposure - current_market,
            );
        }
        if new_position > self.soft_limits.max_position_size {
            return ExposureCheck::denied(
                format!(
                    "Position size ${new_position:.2} would exceed limit ${:.0}",
                    self.soft_limits.max_position_size
                ),
                current_total,
                self.soft_limits.max_position_size,
                self.soft_limits.max_position_size - current_position,
            );
        }

        let headroom = (self.soft_limits.max_total_exposure - new_total)
            .min(self.soft_limits.max_market_exposure - new_market)
            .min(self.soft_limits.max_position_size - new_position);

        ExposureCheck {
            allowed: true,
            rejection_reason: None,
            current_exposure: current_total,
            limit: self.soft_limits.max_total_exposure,
            headroom,
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    pub fn record_position_opened(&self, market_id: &str, token_id: &str, notional: f64) {
        let mut maps = self.maps.lock();

        *maps.market_exposures.entry(market_id.to_string()).or_insert(0.0) += notional;
        maps.position_exposures.insert(token_id.to_string(), notional);
        *maps
            .market_position_counts
            .entry(market_id.to_string())
            .or_insert(0) += 1;
        maps.token_to_market
            .insert(token_id.to_string(), market_id.to_string());

        let new_total = self.total_exposure() + notional;
        self.store_total(new_total);
        self.open_positions.fetch_add(1, Ordering::AcqRel);

        debug!(market_id, token_id, notional, total = new_total, "position opened");
    }

    pub fn record_position_increased(&self, market_id: &str, token_id: &str, additional: f64) {
        let mut maps = self.maps.lock();

        *maps.market_exposures.entry(market_id.to_string()).or_insert(0.0) += additional;
        *maps.position_exposures.entry(token_id.to_string()).or_insert(0.0) += additional;

        let new_total = self.total_exposure() + additional;
        self.store_total(new_total);

        debug!(market_id, token_id, additional, total = new_total, "position increased");
    }

    pub fn record_position_decreased(&self, market_id: &str, token_id: &str, reduced: f64) {
        let mut maps = self.maps.lock();

        if let Some(m) = maps.market_exposures.get_mut(market_id) {
            *m = (*m - reduced).max(0.0);
        }
        if let Some(p) = maps.position_exposures.get_mut(token_id) {
            *p = (*p - reduced).max(0.0);
        }

        let new_total = (self.total_exposure() - reduced).max(0.0);
        self.store_total(new_total);

        debug!(market_id, token_id, reduced, total = new_total, "position decreased");
    }

    /// Release whatever notional the position still holds.
    pub fn record_position_closed(&self, market_id: &str, token_id: &str) {
        let mut maps = self.maps.lock();

        let Some(notional) = maps.position_exposures.remove(token_id) else {
            warn!(token_id, "attempted to close unknown position");
            return;
        };

        if let Some(m) = maps.market_exposures.get_mut(market_id) {
            *m = (*m - notional).max(0.0);
        }
        if let Some(count) = maps.market_position_counts.get_mut(market_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                maps.market_position_counts.remove(market_id);
                maps.market_exposures.remove(market_id);
            }
        }
        maps.token_to_market.remove(token_id);

        let new_total = (self.total_exposure() - notional).max(0.0);
        self.store_total(new_total);
        self.open_positions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .ok();

        debug!(market_id, token_id, notional, total = new_total, "position closed");
    }

    /// Bulk-load exposures from reconciled exchange state, replacing all
    /// current tracking.
    pub fn load_positions(
        &self,
        position_exposures: &HashMap<String, f64>,
        token_to_market: &HashMap<String, String>,
    ) {
        let mut maps = self.maps.lock();
        maps.market_exposures.clear();
        maps.position_exposures.clear();
        maps.market_position_counts.clear();
        maps.token_to_market.clear();

        let mut total = 0.0;
        let mut count: u32 = 0;

        for (token_id, notional) in position_exposures {
            let Some(market_id) = token_to_market.get(token_id) else {
                warn!(token_id, "skipping position with no market mapping");
                continue;
            };
            maps.position_exposures.insert(token_id.clone(), *notional);
            *maps.market_exposures.entry(market_id.clone()).or_insert(0.0) += *notional;
            *maps.market_position_counts.entry(market_id.clone()).or_insert(0) += 1;
            maps.token_to_market.insert(token_id.clone(), market_id.clone());
            total += *notional;
            count += 1;
        }

        self.store_total(total);
        self.open_positions.store(count, Ordering::Release);

        debug!(positions = count, total, "exposure state loaded");
    }

    pub fn reset(&self) {
        let mut maps = self.maps.lock();
        *maps = ExposureMaps::default();
        self.store_total(0.0);
        self.open_positions.store(0, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn total_exposure(&self) -> f64 {
        f64::from_bits(self.total_exposure_bits.load(Ordering::Acquire))
    }

    pub fn market_exposure(&self, market_id: &str) -> f64 {
        self.maps
            .lock()
            .market_exposures
            .get(market_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn position_exposure(&self, token_id: &str) -> f64 {
        self.maps
            .lock()
            .position_exposures
            .get(token_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn open_position_count(&self) -> u32 {
        self.open_positions.load(Ordering::Acquire)
    }

    pub fn positions_in_market(&self, market_id: &str) -> u32 {
        self.maps
            .lock()
            .market_position_counts
            .get(market_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_headroom(&self) -> f64 {
        (self.soft_limits.max_total_exposure - self.total_exposure()).max(0.0)
    }

    pub fn market_headroom(&self, market_id: &str) -> f64 {
        (self.soft_limits.max_market_exposure - self.market_exposure(market_id)).max(0.0)
    }

    pub fn total_utilization(&self) -> f64 {
        if self.soft_limits.max_total_exposure <= 0.0 {
            return 0.0;
        }
        self.total_exposure() / self.soft_limits.max_total_exposure
    }

    fn store_total(&self, total: f64) {
        self.total_exposure_bits
            .store(total.to_bits(), Ordering::Release);
    }
}

impl std::fmt::Debug for ExposureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureManager")
            .field("total_exposure", &self.total_exposure())
            .field("open_positions", &self.open_position_count())
            .finish()
    }
}

// =============================================================================
// Reservation
// =============================================================================

/// Scoped exposure reservation: acquires exposure at construction and
/// releases it on drop unless explicitly committed. Covers the "order
/// submitted but rejected" path with no lingering headroom.
pub struct ExposureReservation<'a> {
    manager: &'a ExposureManager,
    market_id: String,
    token_id: String,
    valid: bool,
    committed: bool,
}

impl<'a> ExposureReservation<'a> {
    /// Attempt to reserve `notional` for a new position. The reservation is
    /// invalid (and a no-op on drop) if the exposure check fails.
    pub fn acquire(
        manager: &'a ExposureManager,
        market_id: &str,
        token_id: &str,
        notional: f64,
    ) -> (Self, ExposureCheck) {
        let check = manager.can_open_position(market_id, notional);
        let valid = check.allowed;
        if valid {
            manager.record_position_opened(market_id, token_id, notional);
        }
        (
            Self {
                manager,
                market_id: market_id.to_string(),
                token_id: token_id.to_string(),
                valid,
                committed: false,
            },
            check,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The order succeeded: keep the exposure.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ExposureReservation<'_> {
    fn drop(&mut self) {
        if self.valid && !self.committed {
            self.manager
                .record_position_closed(&self.market_id, &self.token_id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ExposureManager {
        ExposureManager::new(&ExposureConfig::default())
    }

    #[test]
    fn soft_limits_are_clamped_to_hard() {
        let config = ExposureConfig {
            max_total_exposure: 1_000_000.0,
            max_market_exposure: 1_000_000.0,
            max_position_size: 1_000_000.0,
            max_open_positions: 500,
            max_positions_per_market: 500,
        };
        let em = ExposureManager::new(&config);
        let limits = em.soft_limits();
        assert_eq!(limits.max_total_exposure, ExposureManager::HARD_MAX_TOTAL_EXPOSURE);
        assert_eq!(limits.max_open_positions, ExposureManager::HARD_MAX_OPEN_POSITIONS);
        assert_eq!(
            limits.max_positions_per_market,
            ExposureManager::HARD_MAX_POSITIONS_PER_MARKET
        );
    }

    #[test]
    fn open_close_returns_to_zero() {
        let em = manager();

        em.record_position_opened("m1", "t1", 5.0);
        em.record_position_opened("m2", "t2", 7.5);
        assert!((em.total_exposure() - 12.5).abs() < 1e-9);
        assert_eq!(em.open_position_count(), 2);

        em.record_position_closed("m1", "t1");
        em.record_position_closed("m2", "t2");
        assert_eq!(em.total_exposure(), 0.0);
        assert_eq!(em.open_position_count(), 0);
        assert_eq!(em.market_exposure("m1"), 0.0);
    }

    #[test]
    fn position_size_limit_rejects() {
        let em = manager();
        let check = em.can_open_position("m1", 11.0); // soft cap is $10
        assert!(!check.allowed);
        assert!(check.rejection_reason.unwrap().contains("Position size"));
    }

    #[test]
    fn per_market_position_count_enforced() {
        let em = manager();
        em.record_position_opened("m1", "t1", 1.0);
        em.record_position_opened("m1", "t2", 1.0);

        // Default soft limit is two positions per market.
        let check = em.can_open_position("m1", 1.0);
        assert!(!check.allowed);
        assert!(check
            .rejection_reason
            .unwrap()
            .contains("positions in market"));
    }

    #[test]
    fn increase_checks_position_cap() {
        let em = manager();
        em.record_position_opened("m1", "t1", 8.0);

        let ok = em.can_increase_position("m1", "t1", 1.0);
        assert!(ok.allowed);

        let too_much = em.can_increase_position("m1", "t1", 3.0);
        assert!(!too_much.allowed);
    }

    #[test]
    fn decrease_releases_partial_exposure() {
        let em = manager();
        em.record_position_opened("m1", "t1", 10.0);
        em.record_position_decreased("m1", "t1", 4.0);
        assert!((em.total_exposure() - 6.0).abs() < 1e-9);
        assert!((em.position_exposure("t1") - 6.0).abs() < 1e-9);
        assert_eq!(em.open_position_count(), 1);
    }

    #[test]
    fn reservation_releases_on_drop() {
        let em = manager();
        {
            let (res, check) = ExposureReservation::acquire(&em, "m1", "t1", 5.0);
            assert!(check.allowed);
            assert!(res.is_valid());
            assert!((em.total_exposure() - 5.0).abs() < 1e-9);
        }
        assert_eq!(em.total_exposure(), 0.0);
        assert_eq!(em.open_position_count(), 0);
    }

    #[test]
    fn committed_reservation_keeps_exposure() {
        let em = manager();
        let (res, _) = ExposureReservation::acquire(&em, "m1", "t1", 5.0);
        res.commit();
        assert!((em.total_exposure() - 5.0).abs() < 1e-9);
        assert_eq!(em.open_position_count(), 1);
    }

    #[test]
    fn failed_reservation_is_invalid_and_inert() {
        let em = manager();
        let (res, check) = ExposureReservation::acquire(&em, "m1", "t1", 500.0);
        assert!(!check.allowed);
        assert!(!res.is_valid());
        drop(res);
        assert_eq!(em.total_exposure(), 0.0);
    }

    #[test]
    fn load_positions_requires_market_mapping() {
        let em = manager();

        let mut positions = HashMap::new();
        positions.insert("t1".to_string(), 3.0);
        positions.insert("t2".to_string(), 4.0);

        let mut mapping = HashMap::new();
        mapping.insert("t1".to_string(), "m1".to_string());
        // t2 has no mapping and is skipped.

        em.load_positions(&positions, &mapping);
        assert!((em.total_exposure() - 3.0).abs() < 1e-9);
        assert_eq!(em.open_position_count(), 1);
        assert_eq!(em.positions_in_market("m1"), 1);
    }
}
