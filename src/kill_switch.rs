// =============================================================================
// Kill Switch — process-wide trading latch with audit trail
// =============================================================================
//
// Activation is immediate and atomic (compare-and-set); only the first
// activation records its reason and fires the callback. Deactivation requires
// an explicit operator action and is the only path to clear. Hard limits are
// compile-time constants that configuration cannot raise.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Reasons & events
// ---------------------------------------------------------------------------

/// Trip reasons, ordered by severity for the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillReason {
    Manual,
    DailyLossLimit,
    TotalLossLimit,
    ExposureBreach,
    ConnectivityLoss,
    HighSlippage,
    ReconciliationFail,
    UnhedgedPosition,
    RateLimitBreach,
    SystemError,
    Unknown,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Manual => "MANUAL",
            Self::DailyLossLimit => "DAILY_LOSS_LIMIT",
            Self::TotalLossLimit => "TOTAL_LOSS_LIMIT",
            Self::ExposureBreach => "EXPOSURE_BREACH",
            Self::ConnectivityLoss => "CONNECTIVITY_LOSS",
            Self::HighSlippage => "HIGH_SLIPPAGE",
            Self::ReconciliationFail => "RECONCILIATION_FAIL",
            Self::UnhedgedPosition => "UNHEDGED_POSITION",
            Self::RateLimitBreach => "RATE_LIMIT_BREACH",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// One entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillEvent {
    pub timestamp_ms: i64,
    pub reason: KillReason,
    pub details: String,
    /// true = activation, false = deactivation.
    pub is_activation: bool,
}

/// Invoked once per activation with (reason, details).
pub type KillCallback = Box<dyn Fn(KillReason, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Soft limits. Each is checked alongside the absolute constants below.
#[derive(Debug, Clone)]
pub struct KillSwitchConfig {
    pub daily_loss_limit: f64,
    /// Fraction of starting balance.
    pub total_loss_limit_percent: f64,
    pub max_exposure: f64,
    pub max_connectivity_failures: u32,
    pub high_slippage_bps: f64,
    pub max_slippage_events: usize,
    pub slippage_window_secs: i64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit: 5.0,
            total_loss_limit_percent: 0.10,
            max_exposure: 100.0,
            max_connectivity_failures: 10,
            high_slippage_bps: 100.0,
            max_slippage_events: 3,
            slippage_window_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

struct ActiveState {
    reason: KillReason,
    details: String,
    activation_ms: i64,
}

/// Process-wide latch. Every order-submission path checks `is_active` before
/// touching the venue.
pub struct KillSwitch {
    active: AtomicBool,
    starting_balance: f64,
    config: KillSwitchConfig,

    state: Mutex<ActiveState>,
    history: Mutex<Vec<KillEvent>>,
    slippage_events: Mutex<Vec<(i64, f64)>>,
    rate_limit_breaches: AtomicU32,
    callback: Mutex<Option<KillCallback>>,
}

impl KillSwitch {
    // Absolute limits. Cannot be changed via configuration.
    pub const ABSOLUTE_MAX_LOSS_PERCENT: f64 = 0.25;
    pub const ABSOLUTE_MAX_EXPOSURE: f64 = 10_000.0;
    pub const ABSOLUTE_MAX_OPEN_POSITIONS: u32 = 20;
    pub const MAX_RATE_LIMIT_BREACHES: u32 = 5;

    /// History compaction bounds.
    const MAX_HISTORY: usize = 1000;
    const HISTORY_DROP: usize = 500;

    pub fn new(starting_balance: f64, config: KillSwitchConfig) -> Self {
        Self {
            active: AtomicBool::new(false),
            starting_balance,
            config,
            state: Mutex::new(ActiveState {
                reason: KillReason::Unknown,
                details: String::new(),
                activation_ms: 0,
            }),
            history: Mutex::new(Vec::new()),
            slippage_events: Mutex::new(Vec::new()),
            rate_limit_breaches: AtomicU32::new(0),
            callback: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, cb: KillCallback) {
        *self.callback.lock() = Some(cb);
    }

    // -------------------------------------------------------------------------
    // State queries
    // -------------------------------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> KillReason {
        self.state.lock().reason
    }

    pub fn details(&self) -> String {
        self.state.lock().details.clone()
    }

    pub fn activation_time_ms(&self) -> i64 {
        self.state.lock().activation_ms
    }

    // -------------------------------------------------------------------------
    // Activation / deactivation
    // -------------------------------------------------------------------------

    /// Arm the switch. Idempotent: only the first caller records its reason
    /// and fires the callback; concurrent activations are ignored.
    pub fn activate(&self, reason: KillReason, details: &str) {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(details, "kill switch already active, ignoring activation");
            return;
        }

        {
            let mut state = self.state.lock();
            state.reason = reason;
            state.details = details.to_string();
            state.activation_ms = now_ms();
        }

        self.record_event(reason, details, true);

        error!(reason = %reason, details, "KILL SWITCH ACTIVATED");

        if let Some(cb) = self.callback.lock().as_ref() {
            cb(reason, details);
        }
    }

    pub fn activate_manual(&self, operator_note: &str) {
        let note = if operator_note.is_empty() {
            "Manual activation"
        } else {
            operator_note
        };
        self.activate(KillReason::Manual, note);
    }

    /// Clear the switch. Returns false if it was not active.
    pub fn deactivate(&self, operator_note: &str) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("kill switch deactivation requested but not active");
            return false;
        }

        let prev_reason;
        {
            let mut state = self.state.lock();
            prev_reason = state.reason;
            state.reason = KillReason::Unknown;
            state.details.clear();
        }

        self.record_event(prev_reason, operator_note, false);
        self.rate_limit_breaches.store(0, Ordering::Relaxed);

        warn!(operator_note, "kill switch deactivated by operator");
        true
    }

    // -------------------------------------------------------------------------
    // Condition checks — each returns "just tripped?"
    // -------------------------------------------------------------------------

    pub fn check_daily_loss(&self, current_daily_pnl: f64) -> bool {
        if self.is_active() {
            return false;
        }

        if current_daily_pnl <= -self.config.daily_loss_limit {
            self.activate(
                KillReason::DailyLossLimit,
                &format!(
                    "Daily loss ${:.2} exceeded limit ${:.2}",
                    -current_daily_pnl, self.config.daily_loss_limit
                ),
            );
            return true;
        }
        false
    }

    pub fn check_total_loss(&self, current_balance: f64) -> bool {
        if self.is_active() {
            return false;
        }

        let loss_percent = (self.starting_balance - current_balance) / self.starting_balance;

        if loss_percent >= Self::ABSOLUTE_MAX_LOSS_PERCENT {
            self.activate(
                KillReason::TotalLossLimit,
                &format!(
                    "HARD LIMIT: lost {:.1}% of starting balance (limit {:.1}%)",
                    loss_percent * 100.0,
                    Self::ABSOLUTE_MAX_LOSS_PERCENT * 100.0
                ),
            );
            return true;
        }

        if loss_percent >= self.config.total_loss_limit_percent {
            self.activate(
                KillReason::TotalLossLimit,
                &format!(
                    "Lost {:.1}% of starting balance (limit {:.1}%)",
                    loss_percent * 100.0,
                    self.config.total_loss_limit_percent * 100.0
                ),
            );
            return true;
        }
        false
    }

    pub fn check_exposure(&self, current_exposure: f64) -> bool {
        if self.is_active() {
            return false;
        }

        if current_exposure >= Self::ABSOLUTE_MAX_EXPOSURE {
            self.activate(
                KillReason::ExposureBreach,
                &format!(
                    "HARD LIMIT: exposure ${current_exposure:.2} exceeded absolute max ${:.2}",
                    Self::ABSOLUTE_MAX_EXPOSURE
                ),
            );
            return true;
        }

        if current_exposure >= self.config.max_exposure {
            self.activate(
                KillReason::ExposureBreach,
                &format!(
                    "Exposure ${current_exposure:.2} exceeded limit ${:.2}",
                    self.config.max_exposure
                ),
            );
            return true;
        }
        false
    }

    pub fn check_position_count(&self, open_positions: u32) -> bool {
        if self.is_active() {
            return false;
        }

        if open_positions >= Self::ABSOLUTE_MAX_OPEN_POSITIONS {
            self.activate(
                KillReason::ExposureBreach,
                &format!(
                    "HARD LIMIT: {open_positions} positions exceeded max {}",
                    Self::ABSOLUTE_MAX_OPEN_POSITIONS
                ),
            );
            return true;
        }
        false
    }

    pub fn check_connectivity(&self, consecutive_failures: u32) -> bool {
        if self.is_active() {
            return false;
        }

        if consecutive_failures >= self.config.max_connectivity_failures {
            self.activate(
                KillReason::ConnectivityLoss,
                &format!("{consecutive_failures} consecutive connection failures"),
            );
            return true;
        }
        false
    }

    /// Record a slippage sample; trips when enough high-slippage events land
    /// inside the rolling window.
    pub fn check_slippage(&self, slippage_bps: f64) -> bool {
        if self.is_active() {
            return false;
        }

        if slippage_bps < self.config.high_slippage_bps {
            return false;
        }

        let tripped = {
            let mut events = self.slippage_events.lock();
            let now = now_ms();
            events.push((now, slippage_bps));

            let cutoff = now - self.config.slippage_window_secs * 1000;
            events.retain(|(ts, _)| *ts >= cutoff);

            events.len() >= self.config.max_slippage_events
        };

        if tripped {
            self.activate(
                KillReason::HighSlippage,
                &format!(
                    "{} high-slippage events (>{:.0}bps) within {}s",
                    self.config.max_slippage_events,
                    self.config.high_slippage_bps,
                    self.config.slippage_window_secs
                ),
            );
            return true;
        }

        warn!(slippage_bps, "high slippage detected");
        false
    }

    /// Count a rate-limit breach; auto-trips after the absolute maximum.
    pub fn check_rate_limit_breach(&self) -> bool {
        if self.is_active() {
            return false;
        }

        let breaches = self.rate_limit_breaches.fetch_add(1, Ordering::AcqRel) + 1;
        if breaches >= Self::MAX_RATE_LIMIT_BREACHES {
            self.activate(
                KillReason::RateLimitBreach,
                &format!("{breaches} rate limit breaches"),
            );
            return true;
        }

        warn!(breaches, "rate limit breach recorded");
        false
    }

    /// Static pre-check used by the reconciler before restoring a state file.
    pub fn would_breach_absolute_limits(
        current_balance: f64,
        starting_balance: f64,
        exposure: f64,
        positions: u32,
    ) -> bool {
        let loss_percent = (starting_balance - current_balance) / starting_balance;

        loss_percent >= Self::ABSOLUTE_MAX_LOSS_PERCENT
            || exposure >= Self::ABSOLUTE_MAX_EXPOSURE
            || positions >= Self::ABSOLUTE_MAX_OPEN_POSITIONS
    }

    // -------------------------------------------------------------------------
    // Audit trail
    // -------------------------------------------------------------------------

    pub fn event_history(&self) -> Vec<KillEvent> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    fn record_event(&self, reason: KillReason, details: &str, is_activation: bool) {
        let mut history = self.history.lock();
        history.push(KillEvent {
            timestamp_ms: now_ms(),
            reason,
            details: details.to_string(),
            is_activation,
        });

        if history.len() > Self::MAX_HISTORY {
            history.drain(..Self::HISTORY_DROP);
        }
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("active", &self.is_active())
            .field("reason", &self.reason())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn switch() -> KillSwitch {
        KillSwitch::new(50.0, KillSwitchConfig::default())
    }

    #[test]
    fn activation_is_idempotent() {
        let ks = switch();
        ks.activate(KillReason::DailyLossLimit, "first");
        ks.activate(KillReason::Manual, "second");

        assert!(ks.is_active());
        assert_eq!(ks.reason(), KillReason::DailyLossLimit);
        assert_eq!(ks.details(), "first");
        assert_eq!(ks.event_history().len(), 1);
    }

    #[test]
    fn concurrent_activations_fire_callback_once() {
        let ks = Arc::new(switch());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        ks.set_callback(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut handles = Vec::new();
        for i in 0..8 {
            let ks = ks.clone();
            handles.push(std::thread::spawn(move || {
                ks.activate(KillReason::SystemError, &format!("thread {i}"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ks.event_history().len(), 1);
    }

    #[test]
    fn activate_deactivate_activate_records_three_events() {
        let ks = switch();
        ks.activate(KillReason::Manual, "a");
        assert!(ks.deactivate("operator cleared"));
        ks.activate(KillReason::ExposureBreach, "b");

        let history = ks.event_history();
        assert_eq!(history.len(), 3);
        assert!(history[0].is_activation);
        assert!(!history[1].is_activation);
        assert!(history[2].is_activation);
        assert_eq!(history[2].reason, KillReason::ExposureBreach);
    }

    #[test]
    fn deactivate_when_inactive_is_noop() {
        let ks = switch();
        assert!(!ks.deactivate("nothing to clear"));
        assert!(ks.event_history().is_empty());
    }

    #[test]
    fn daily_loss_trips_once_past_limit() {
        let ks = switch();
        assert!(!ks.check_daily_loss(-4.99));
        assert!(!ks.is_active());

        assert!(ks.check_daily_loss(-5.01));
        assert!(ks.is_active());
        assert_eq!(ks.reason(), KillReason::DailyLossLimit);

        // Already active: the check reports no new trip.
        assert!(!ks.check_daily_loss(-6.0));
        assert_eq!(ks.event_history().len(), 1);
    }

    #[test]
    fn total_loss_hard_limit_beats_soft_limit() {
        let ks = switch();
        // 30% loss on a $50 bankroll crosses the 25% absolute cap.
        assert!(ks.check_total_loss(35.0));
        assert!(ks.details().contains("HARD LIMIT"));
    }

    #[test]
    fn exposure_soft_limit_trips() {
        let ks = switch();
        assert!(!ks.check_exposure(99.0));
        assert!(ks.check_exposure(100.0));
        assert_eq!(ks.reason(), KillReason::ExposureBreach);
    }

    #[test]
    fn rate_limit_breaches_auto_trip() {
        let ks = switch();
        for _ in 0..KillSwitch::MAX_RATE_LIMIT_BREACHES - 1 {
            ks.check_rate_limit_breach();
        }
        assert!(!ks.is_active());

        assert!(ks.check_rate_limit_breach());
        assert!(ks.is_active());
        assert_eq!(ks.reason(), KillReason::RateLimitBreach);
    }

    #[test]
    fn slippage_needs_enough_events_in_window() {
        let ks = switch();
        assert!(!ks.check_slippage(150.0));
        assert!(!ks.check_slippage(50.0)); // below threshold, not recorded
        assert!(!ks.check_slippage(150.0));
        assert!(ks.check_slippage(150.0));
        assert_eq!(ks.reason(), KillReason::HighSlippage);
    }

    #[test]
    fn absolute_limit_pre_check() {
        assert!(KillSwitch::would_breach_absolute_limits(30.0, 50.0, 0.0, 0));
        assert!(KillSwitch::would_breach_absolute_limits(50.0, 50.0, 10_000.0, 0));
        assert!(KillSwitch::would_breach_absolute_limits(50.0, 50.0, 0.0, 20));
        assert!(!KillSwitch::would_breach_absolute_limits(48.0, 50.0, 50.0, 3));
    }
}
