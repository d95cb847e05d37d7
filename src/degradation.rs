// =============================================================================
// Degradation Manager — operating-mode state machine
// =============================================================================
//
// Five ordered modes from NORMAL (best) to HALTED (worst). Every evaluation
// tick takes the worst mode implied by connection health, loss percentage,
// recent volatility, and the rolling error count. Downgrades apply
// immediately; upgrades are gated behind a cooldown and a run of consecutive
// healthy checks.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::health::{ConnectionHealthMonitor, HealthStatus};
use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Modes & restrictions
// ---------------------------------------------------------------------------

/// Operating modes, ordered best to worst. The numeric value is the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Normal = 0,
    Reduced = 1,
    Minimal = 2,
    Maintenance = 3,
    Halted = 4,
}

impl OperatingMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Reduced,
            2 => Self::Minimal,
            3 => Self::Maintenance,
            _ => Self::Halted,
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Reduced => "REDUCED",
            Self::Minimal => "MINIMAL",
            Self::Maintenance => "MAINTENANCE",
            Self::Halted => "HALTED",
        };
        write!(f, "{s}")
    }
}

/// What trading is allowed in a given mode.
#[derive(Debug, Clone, Serialize)]
pub struct TradingRestrictions {
    pub allow_new_positions: bool,
    pub allow_position_increase: bool,
    pub allow_aggressive_orders: bool,
    pub allow_passive_orders: bool,

    pub max_position_size_multiplier: f64,
    pub min_edge_multiplier: f64,
    pub max_exposure_multiplier: f64,

    pub max_concurrent_orders: u32,
    pub min_order_interval_ms: u64,
}

impl TradingRestrictions {
    pub fn for_mode(mode: OperatingMode) -> Self {
        let mut r = Self {
            allow_new_positions: true,
            allow_position_increase: true,
            allow_aggressive_orders: true,
            allow_passive_orders: true,
            max_position_size_multiplier: 1.0,
            min_edge_multiplier: 1.0,
            max_exposure_multiplier: 1.0,
            max_concurrent_orders: 10,
            min_order_interval_ms: 0,
        };

        match mode {
            OperatingMode::Normal => {}
            OperatingMode::Reduced => {
                r.max_position_size_multiplier = 0.5;
                r.min_edge_multiplier = 1.5;
                r.max_exposure_multiplier = 0.75;
                r.max_concurrent_orders = 5;
                r.min_order_interval_ms = 100;
            }
            OperatingMode::Minimal => {
                r.allow_new_positions = false;
                r.allow_aggressive_orders = false;
                r.max_position_size_multiplier = 0.25;
                r.min_edge_multiplier = 2.0;
                r.max_exposure_multiplier = 0.5;
                r.max_concurrent_orders = 2;
                r.min_order_interval_ms = 500;
            }
            OperatingMode::Maintenance | OperatingMode::Halted => {
                r.allow_new_positions = false;
                r.allow_position_increase = false;
                r.allow_aggressive_orders = false;
                r.allow_passive_orders = false;
                r.max_position_size_multiplier = 0.0;
                r.max_exposure_multiplier = 0.0;
                r.max_concurrent_orders = 0;
            }
        }

        r
    }
}

/// Audit record of one mode transition.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationEvent {
    pub timestamp_ms: i64,
    pub from_mode: OperatingMode,
    pub to_mode: OperatingMode,
    pub reason: String,
    pub triggers: Vec<String>,
}

pub type ModeChangeCallback = Box<dyn Fn(OperatingMode, OperatingMode, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DegradationConfig {
    pub require_reference_feed: bool,
    pub require_market_feed: bool,

    /// Loss thresholds as fractions of starting balance.
    pub reduced_mode_loss_percent: f64,
    pub minimal_mode_loss_percent: f64,
    pub halt_loss_percent: f64,

    /// Recent reference-price move magnitudes, as fractions.
    pub reduced_mode_volatility: f64,
    pub minimal_mode_volatility: f64,

    pub reduced_mode_errors: usize,
    pub minimal_mode_errors: usize,
    pub halt_errors: usize,
    pub error_window_secs: i64,

    pub recovery_cooldown_secs: i64,
    /// Consecutive healthy evaluations before an upgrade is taken.
    pub required_healthy_checks: u32,

    pub allow_manual_override: bool,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            require_reference_feed: true,
            require_market_feed: true,
            reduced_mode_loss_percent: 0.03,
            minimal_mode_loss_percent: 0.05,
            halt_loss_percent: 0.08,
            reduced_mode_volatility: 0.02,
            minimal_mode_volatility: 0.05,
            reduced_mode_errors: 3,
            minimal_mode_errors: 5,
            halt_errors: 10,
            error_window_secs: 300,
            recovery_cooldown_secs: 60,
            required_healthy_checks: 5,
            allow_manual_override: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Connection names checked against the health monitor.
pub const CONN_REFERENCE: &str = "reference_feed";
pub const CONN_MARKET_WS: &str = "market_feed";

struct Inputs {
    current_balance: f64,
    volatility: f64,
    recent_errors: VecDeque<(i64, String)>,
    consecutive_healthy_checks: u32,
    last_mode_change_ms: i64,
}

/// Drives the operating mode from health, PnL, volatility, and error inputs.
pub struct DegradationManager {
    health_monitor: Option<Arc<ConnectionHealthMonitor>>,
    starting_balance: f64,
    config: DegradationConfig,

    mode: AtomicU8,
    inputs: Mutex<Inputs>,
    history: Mutex<Vec<DegradationEvent>>,
    callback: Mutex<Option<ModeChangeCallback>>,
}

impl DegradationManager {
    pub fn new(
        health_monitor: Option<Arc<ConnectionHealthMonitor>>,
        starting_balance: f64,
        config: DegradationConfig,
    ) -> Self {
        Self {
            health_monitor,
            starting_balance,
            config,
            mode: AtomicU8::new(OperatingMode::Normal as u8),
            inputs: Mutex::new(Inputs {
                current_balance: starting_balance,
                volatility: 0.0,
                recent_errors: VecDeque::new(),
                consecutive_healthy_checks: 0,
                last_mode_change_ms: 0,
            }),
            history: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        }
    }

    pub fn set_mode_change_callback(&self, cb: ModeChangeCallback) {
        *self.callback.lock() = Some(cb);
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    pub fn update_balance(&self, current_balance: f64) {
        self.inputs.lock().current_balance = current_balance;
    }

    /// Magnitude of the recent reference move, as a fraction (0.02 = 2%).
    pub fn update_volatility(&self, recent_move: f64) {
        self.inputs.lock().volatility = recent_move.abs();
    }

    pub fn record_error(&self, error_type: &str) {
        let mut inputs = self.inputs.lock();
        inputs.recent_errors.push_back((now_ms(), error_type.to_string()));
        inputs.consecutive_healthy_checks = 0;
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Recompute the target mode and transition. Downgrades apply
    /// immediately; upgrades wait for the cooldown plus a run of healthy
    /// checks.
    pub fn evaluate(&self) {
        let target = self.determine_mode();
        let current = self.current_mode();

        if target > current {
            let triggers = self.degradation_triggers();
            self.inputs.lock().consecutive_healthy_checks = 0;
            self.transition(current, target, "conditions degraded", triggers);
            return;
        }

        if target < current {
            let can_upgrade = {
                let mut inputs = self.inputs.lock();
                inputs.consecutive_healthy_checks += 1;

                let cooldown_ok = now_ms() - inputs.last_mode_change_ms
                    >= self.config.recovery_cooldown_secs * 1000;
                cooldown_ok
                    && inputs.consecutive_healthy_checks >= self.config.required_healthy_checks
            };

            if can_upgrade {
                self.inputs.lock().consecutive_healthy_checks = 0;
                self.transition(current, target, "conditions recovered", Vec::new());
            }
            return;
        }

        // Holding steady at the target mode counts as a healthy check.
        if target == OperatingMode::Normal {
            self.inputs.lock().consecutive_healthy_checks += 1;
        }
    }

    fn determine_mode(&self) -> OperatingMode {
        let mut worst = OperatingMode::Normal;

        // Connection health.
        if let Some(monitor) = &self.health_monitor {
            let health = monitor.system_health();
            match health.overall_status {
                HealthStatus::Disconnected => return OperatingMode::Halted,
                HealthStatus::Unhealthy => worst = worst.max(OperatingMode::Maintenance),
                _ => {}
            }

            if self.config.require_reference_feed
                && matches!(
                    monitor.connection_health(CONN_REFERENCE),
                    HealthStatus::Disconnected | HealthStatus::Unknown
                )
            {
                return OperatingMode::Halted;
            }

            if self.config.require_market_feed
                && matches!(
                    monitor.connection_health(CONN_MARKET_WS),
                    HealthStatus::Disconnected | HealthStatus::Unknown
                )
            {
                worst = worst.max(OperatingMode::Maintenance);
            }
        }

        let inputs = self.inputs.lock();

        // Loss thresholds.
        let loss_percent =
            (self.starting_balance - inputs.current_balance) / self.starting_balance;
        if loss_percent >= self.config.halt_loss_percent {
            return OperatingMode::Halted;
        }
        if loss_percent >= self.config.minimal_mode_loss_percent {
            worst = worst.max(OperatingMode::Minimal);
        } else if loss_percent >= self.config.reduced_mode_loss_percent {
            worst = worst.max(OperatingMode::Reduced);
        }

        // Volatility thresholds.
        if inputs.volatility >= self.config.minimal_mode_volatility {
            worst = worst.max(OperatingMode::Minimal);
        } else if inputs.volatility >= self.config.reduced_mode_volatility {
            worst = worst.max(OperatingMode::Reduced);
        }

        // Rolling error count.
        let cutoff = now_ms() - self.config.error_window_secs * 1000;
        let errors = inputs
            .recent_errors
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .count();
        if errors >= self.config.halt_errors {
            return OperatingMode::Halted;
        }
        if errors >= self.config.minimal_mode_errors {
            worst = worst.max(OperatingMode::Minimal);
        } else if errors >= self.config.reduced_mode_errors {
            worst = worst.max(OperatingMode::Reduced);
        }

        worst
    }

    fn degradation_triggers(&self) -> Vec<String> {
        let mut triggers = Vec::new();

        if let Some(monitor) = &self.health_monitor {
            let health = monitor.system_health();
            if !health.can_trade() {
                triggers.push(format!("system health {}", health.overall_status));
            }
            for name in health.unhealthy_connections() {
                triggers.push(format!("connection {name} unhealthy"));
            }
        }

        let inputs = self.inputs.lock();
        let loss_percent =
            (self.starting_balance - inputs.current_balance) / self.starting_balance;
        if loss_percent >= self.config.reduced_mode_loss_percent {
            triggers.push(format!("loss {:.1}%", loss_percent * 100.0));
        }
        if inputs.volatility >= self.config.reduced_mode_volatility {
            triggers.push(format!("volatility {:.1}%", inputs.volatility * 100.0));
        }

        let cutoff = now_ms() - self.config.error_window_secs * 1000;
        let errors = inputs
            .recent_errors
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .count();
        if errors >= self.config.reduced_mode_errors {
            triggers.push(format!("{errors} recent errors"));
        }

        triggers
    }

    fn transition(
        &self,
        from: OperatingMode,
        to: OperatingMode,
        reason: &str,
        triggers: Vec<String>,
    ) {
        self.mode.store(to as u8, Ordering::Release);

        {
            let mut inputs = self.inputs.lock();
            inputs.last_mode_change_ms = now_ms();
        }

        let event = DegradationEvent {
            timestamp_ms: now_ms(),
            from_mode: from,
            to_mode: to,
            reason: reason.to_string(),
            triggers: triggers.clone(),
        };
        self.history.lock().push(event);

        if to > from {
            warn!(from = %from, to = %to, reason, ?triggers, "operating mode degraded");
        } else {
            info!(from = %from, to = %to, reason, "operating mode upgraded");
        }

        if let Some(cb) = self.callback.lock().as_ref() {
            cb(from, to, reason);
        }
    }

    // -------------------------------------------------------------------------
    // Queries & manual control
    // -------------------------------------------------------------------------

    pub fn current_mode(&self) -> OperatingMode {
        OperatingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn current_restrictions(&self) -> TradingRestrictions {
        TradingRestrictions::for_mode(self.current_mode())
    }

    pub fn can_open_position(&self) -> bool {
        self.current_restrictions().allow_new_positions
    }

    pub fn can_place_order(&self) -> bool {
        let r = self.current_restrictions();
        r.allow_aggressive_orders || r.allow_passive_orders
    }

    pub fn adjusted_max_size(&self, base_size: f64) -> f64 {
        base_size * self.current_restrictions().max_position_size_multiplier
    }

    pub fn adjusted_min_edge(&self, base_edge: f64) -> f64 {
        base_edge * self.current_restrictions().min_edge_multiplier
    }

    /// Operator-forced mode. Rejected when manual override is disabled.
    pub fn set_mode(&self, mode: OperatingMode, reason: &str) -> bool {
        if !self.config.allow_manual_override {
            warn!("manual mode override is disabled");
            return false;
        }
        let current = self.current_mode();
        if current == mode {
            return true;
        }
        self.transition(current, mode, reason, vec!["manual override".to_string()]);
        true
    }

    pub fn event_history(&self) -> Vec<DegradationEvent> {
        self.history.lock().clone()
    }

    pub fn status_summary(&self) -> String {
        let mode = self.current_mode();
        let r = TradingRestrictions::for_mode(mode);
        format!(
            "mode={mode} new_positions={} size_mult={:.2} edge_mult={:.2}",
            r.allow_new_positions, r.max_position_size_multiplier, r.min_edge_multiplier
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config_no_health() -> DegradationConfig {
        DegradationConfig {
            require_reference_feed: false,
            require_market_feed: false,
            ..DegradationConfig::default()
        }
    }

    fn manager(config: DegradationConfig) -> DegradationManager {
        DegradationManager::new(None, 50.0, config)
    }

    #[test]
    fn restriction_vectors_per_mode() {
        let normal = TradingRestrictions::for_mode(OperatingMode::Normal);
        assert!(normal.allow_new_positions);
        assert_eq!(normal.max_position_size_multiplier, 1.0);

        let reduced = TradingRestrictions::for_mode(OperatingMode::Reduced);
        assert!(reduced.allow_new_positions);
        assert_eq!(reduced.max_position_size_multiplier, 0.5);
        assert_eq!(reduced.min_edge_multiplier, 1.5);
        assert_eq!(reduced.max_concurrent_orders, 5);

        let minimal = TradingRestrictions::for_mode(OperatingMode::Minimal);
        assert!(!minimal.allow_new_positions);
        assert!(!minimal.allow_aggressive_orders);
        assert!(minimal.allow_passive_orders);

        for mode in [OperatingMode::Maintenance, OperatingMode::Halted] {
            let r = TradingRestrictions::for_mode(mode);
            assert!(!r.allow_new_positions);
            assert!(!r.allow_passive_orders);
            assert_eq!(r.max_concurrent_orders, 0);
        }
    }

    #[test]
    fn loss_thresholds_cascade() {
        let dm = manager(config_no_health());
        assert_eq!(dm.current_mode(), OperatingMode::Normal);

        dm.update_balance(48.0); // 4% loss -> REDUCED
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Reduced);

        dm.update_balance(47.0); // 6% loss -> MINIMAL
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Minimal);

        dm.update_balance(45.0); // 10% loss -> HALTED
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Halted);
        assert!(!dm.can_place_order());
    }

    #[test]
    fn volatility_thresholds() {
        let dm = manager(config_no_health());
        dm.update_volatility(0.03);
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Reduced);

        dm.update_volatility(0.06);
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Minimal);
    }

    #[test]
    fn errors_cascade_to_halt() {
        let dm = manager(config_no_health());
        for _ in 0..10 {
            dm.record_error("ws_error");
        }
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Halted);
    }

    #[test]
    fn worst_input_wins() {
        let dm = manager(config_no_health());
        dm.update_balance(48.0); // REDUCED from loss
        dm.update_volatility(0.06); // MINIMAL from volatility
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Minimal);
    }

    #[test]
    fn upgrade_requires_cooldown_and_healthy_checks() {
        let mut config = config_no_health();
        config.recovery_cooldown_secs = 0;
        config.required_healthy_checks = 3;
        let dm = manager(config);

        dm.update_volatility(0.03);
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Reduced);

        // Conditions recover; the first two checks do not upgrade yet.
        dm.update_volatility(0.0);
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Reduced);
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Reduced);

        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Normal);
    }

    #[test]
    fn downgrade_is_immediate() {
        let dm = manager(config_no_health());
        dm.update_balance(45.0);
        dm.evaluate();
        assert_eq!(dm.current_mode(), OperatingMode::Halted);
        assert_eq!(dm.event_history().len(), 1);
    }

    #[test]
    fn manual_override_respects_config() {
        let dm = manager(config_no_health());
        assert!(dm.set_mode(OperatingMode::Maintenance, "operator request"));
        assert_eq!(dm.current_mode(), OperatingMode::Maintenance);

        let mut config = config_no_health();
        config.allow_manual_override = false;
        let dm = manager(config);
        assert!(!dm.set_mode(OperatingMode::Halted, "nope"));
        assert_eq!(dm.current_mode(), OperatingMode::Normal);
    }

    #[test]
    fn transitions_are_recorded_with_triggers() {
        let dm = manager(config_no_health());
        dm.update_balance(45.0);
        dm.evaluate();

        let history = dm.event_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_mode, OperatingMode::Normal);
        assert_eq!(history[0].to_mode, OperatingMode::Halted);
        assert!(!history[0].triggers.is_empty());
    }
}
