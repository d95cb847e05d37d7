// =============================================================================
// Connection Health Monitor — per-connection metrics and system rollup
// =============================================================================
//
// Each named connection climbs a ladder HEALTHY -> DEGRADED -> UNHEALTHY ->
// DISCONNECTED (UNKNOWN before first data), driven by error rates, EMA
// latency, and missed heartbeats. System health is the worst of the required
// connections; only HEALTHY and DEGRADED count as trading-ready. Change
// callbacks are delivered after the internal mutex has been released.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Status & metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Disconnected => "DISCONNECTED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one connection's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub name: String,
    pub status: HealthStatus,

    pub connected: bool,
    pub reconnect_count: u32,
    pub last_connected_ms: i64,
    pub last_disconnected_ms: i64,

    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub last_message_ms: i64,

    /// Milliseconds. `ema_latency_ms` is an exponential moving average.
    pub last_latency_ms: f64,
    pub ema_latency_ms: f64,
    pub max_latency_ms: f64,

    pub last_heartbeat_ms: i64,
    pub missed_heartbeats: u32,
}

impl ConnectionMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unknown,
            connected: false,
            reconnect_count: 0,
            last_connected_ms: 0,
            last_disconnected_ms: 0,
            messages_received: 0,
            messages_sent: 0,
            errors: 0,
            last_message_ms: 0,
            last_latency_ms: 0.0,
            ema_latency_ms: 0.0,
            max_latency_ms: 0.0,
            last_heartbeat_ms: 0,
            missed_heartbeats: 0,
        }
    }
}

/// Rollup across all connections.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub connections: HashMap<String, ConnectionMetrics>,
}

impl SystemHealth {
    pub fn can_trade(&self) -> bool {
        matches!(
            self.overall_status,
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    pub fn unhealthy_connections(&self) -> Vec<String> {
        self.connections
            .values()
            .filter(|m| {
                matches!(
                    m.status,
                    HealthStatus::Unhealthy | HealthStatus::Disconnected
                )
            })
            .map(|m| m.name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub heartbeat_timeout_secs: i64,
    pub max_missed_heartbeats: u32,
    /// Errors per message.
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub degraded_latency_ms: f64,
    pub unhealthy_latency_ms: f64,
    /// Rolling window for error-rate computation.
    pub metrics_window_secs: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 60,
            max_missed_heartbeats: 3,
            degraded_error_rate: 0.01,
            unhealthy_error_rate: 0.05,
            degraded_latency_ms: 500.0,
            unhealthy_latency_ms: 2_000.0,
            metrics_window_secs: 60,
        }
    }
}

/// EMA smoothing factor for latency.
const LATENCY_EMA_ALPHA: f64 = 0.2;

pub type HealthChangeCallback = Box<dyn Fn(&str, HealthStatus, HealthStatus) + Send + Sync>;

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct ConnState {
    metrics: ConnectionMetrics,
    required: bool,
    /// (timestamp_ms, is_error) within the metrics window.
    message_history: VecDeque<(i64, bool)>,
}

/// Tracks every named data-source connection.
pub struct ConnectionHealthMonitor {
    config: HealthConfig,
    connections: Mutex<HashMap<String, ConnState>>,
    callback: Mutex<Option<HealthChangeCallback>>,
}

impl ConnectionHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
        }
    }

    pub fn set_health_change_callback(&self, cb: HealthChangeCallback) {
        *self.callback.lock() = Some(cb);
    }

    /// Register a connection before its feed starts.
    pub fn register_connection(&self, name: &str, required: bool) {
        let mut conns = self.connections.lock();
        conns.entry(name.to_string()).or_insert_with(|| ConnState {
            metrics: ConnectionMetrics::new(name),
            required,
            message_history: VecDeque::new(),
        });
        info!(name, required, "connection registered");
    }

    // -------------------------------------------------------------------------
    // State updates
    // -------------------------------------------------------------------------

    pub fn record_connected(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.connected = true;
            state.metrics.last_connected_ms = now_ms();
        });
    }

    pub fn record_disconnected(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.connected = false;
            state.metrics.last_disconnected_ms = now_ms();
        });
    }

    pub fn record_reconnect(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.reconnect_count += 1;
        });
    }

    pub fn record_message_received(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.messages_received += 1;
            state.metrics.last_message_ms = now_ms();
            state.message_history.push_back((now_ms(), false));
        });
    }

    pub fn record_message_sent(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.messages_sent += 1;
        });
    }

    pub fn record_error(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.errors += 1;
            state.message_history.push_back((now_ms(), true));
        });
    }

    pub fn record_latency(&self, name: &str, latency_ms: f64) {
        self.with_conn(name, |state| {
            let m = &mut state.metrics;
            m.last_latency_ms = latency_ms;
            m.ema_latency_ms = if m.ema_latency_ms == 0.0 {
                latency_ms
            } else {
                LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * m.ema_latency_ms
            };
            m.max_latency_ms = m.max_latency_ms.max(latency_ms);
        });
    }

    pub fn record_heartbeat(&self, name: &str) {
        self.with_conn(name, |state| {
            state.metrics.last_heartbeat_ms = now_ms();
            state.metrics.missed_heartbeats = 0;
        });
    }

    /// Count heartbeats that failed to arrive within the timeout. Call
    /// periodically from the evaluation loop.
    pub fn check_heartbeats(&self) {
        let timeout_ms = self.config.heartbeat_timeout_secs * 1000;
        let now = now_ms();
        let mut conns = self.connections.lock();
        for state in conns.values_mut() {
            let m = &mut state.metrics;
            if m.last_heartbeat_ms > 0 && now - m.last_heartbeat_ms > timeout_ms {
                m.missed_heartbeats += 1;
                // Restart the timeout window from now.
                m.last_heartbeat_ms = now;
                warn!(
                    name = %m.name,
                    missed = m.missed_heartbeats,
                    "heartbeat missed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Recompute every connection's ladder position and fire the change
    /// callback for any that moved. The callback runs with no lock held.
    pub fn evaluate_health(&self) {
        let mut changes: Vec<(String, HealthStatus, HealthStatus)> = Vec::new();

        {
            let mut conns = self.connections.lock();
            let window_cutoff = now_ms() - self.config.metrics_window_secs * 1000;

            for state in conns.values_mut() {
                while let Some((ts, _)) = state.message_history.front() {
                    if *ts < window_cutoff {
                        state.message_history.pop_front();
                    } else {
                        break;
                    }
                }

                let new_status = self.calculate_health(state);
                let old_status = state.metrics.status;
                if new_status != old_status {
                    state.metrics.status = new_status;
                    changes.push((state.metrics.name.clone(), old_status, new_status));
                }
            }
        }

        for (name, old, new) in &changes {
            debug!(name, from = %old, to = %new, "connection health changed");
            if let Some(cb) = self.callback.lock().as_ref() {
                cb(name, *old, *new);
            }
        }
    }

    fn calculate_health(&self, state: &ConnState) -> HealthStatus {
        let m = &state.metrics;

        if m.messages_received == 0 && m.last_connected_ms == 0 {
            return HealthStatus::Unknown;
        }
        if !m.connected {
            return HealthStatus::Disconnected;
        }

        // Error rate over the rolling window.
        let total = state.message_history.len();
        let errors = state.message_history.iter().filter(|(_, e)| *e).count();
        let error_rate = if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        };

        if error_rate >= self.config.unhealthy_error_rate
            || m.ema_latency_ms >= self.config.unhealthy_latency_ms
            || m.missed_heartbeats >= self.config.max_missed_heartbeats
        {
            return HealthStatus::Unhealthy;
        }

        if error_rate >= self.config.degraded_error_rate
            || m.ema_latency_ms >= self.config.degraded_latency_ms
            || m.missed_heartbeats > 0
        {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn connection_health(&self, name: &str) -> HealthStatus {
        self.connections
            .lock()
            .get(name)
            .map(|s| s.metrics.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn connection_metrics(&self, name: &str) -> Option<ConnectionMetrics> {
        self.connections.lock().get(name).map(|s| s.metrics.clone())
    }

    /// Rollup: any required connection DISCONNECTED -> DISCONNECTED; any
    /// required UNHEALTHY -> UNHEALTHY; any connection DEGRADED -> DEGRADED;
    /// otherwise HEALTHY (UNKNOWN with no data at all).
    pub fn system_health(&self) -> SystemHealth {
        let conns = self.connections.lock();

        let mut overall = HealthStatus::Healthy;
        let mut any_known = false;

        for state in conns.values() {
            let status = state.metrics.status;
            if status != HealthStatus::Unknown {
                any_known = true;
            }

            if state.required {
                match status {
                    HealthStatus::Disconnected | HealthStatus::Unknown => {
                        overall = HealthStatus::Disconnected;
                    }
                    HealthStatus::Unhealthy if overall != HealthStatus::Disconnected => {
                        overall = HealthStatus::Unhealthy;
                    }
                    HealthStatus::Degraded if overall == HealthStatus::Healthy => {
                        overall = HealthStatus::Degraded;
                    }
                    _ => {}
                }
            } else if status == HealthStatus::Degraded && overall == HealthStatus::Healthy {
                overall = HealthStatus::Degraded;
            }
        }

        if !any_known {
            overall = HealthStatus::Unknown;
        }

        SystemHealth {
            overall_status: overall,
            connections: conns
                .iter()
                .map(|(k, v)| (k.clone(), v.metrics.clone()))
                .collect(),
        }
    }

    pub fn is_trading_ready(&self) -> bool {
        self.system_health().can_trade()
    }

    pub fn reset_connection(&self, name: &str) {
        self.with_conn(name, |state| {
            let required = state.required;
            let name = state.metrics.name.clone();
            state.metrics = ConnectionMetrics::new(&name);
            state.message_history.clear();
            state.required = required;
        });
    }

    fn with_conn(&self, name: &str, f: impl FnOnce(&mut ConnState)) {
        let mut conns = self.connections.lock();
        if let Some(state) = conns.get_mut(name) {
            f(state);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn monitor() -> ConnectionHealthMonitor {
        ConnectionHealthMonitor::new(HealthConfig::default())
    }

    #[test]
    fn unknown_before_any_data() {
        let mon = monitor();
        mon.register_connection("binance", true);
        mon.evaluate_health();
        assert_eq!(mon.connection_health("binance"), HealthStatus::Unknown);
        assert_eq!(mon.system_health().overall_status, HealthStatus::Unknown);
        assert!(!mon.is_trading_ready());
    }

    #[test]
    fn healthy_connection_after_messages() {
        let mon = monitor();
        mon.register_connection("binance", true);
        mon.record_connected("binance");
        for _ in 0..100 {
            mon.record_message_received("binance");
        }
        mon.evaluate_health();
        assert_eq!(mon.connection_health("binance"), HealthStatus::Healthy);
        assert!(mon.is_trading_ready());
    }

    #[test]
    fn error_rate_degrades_then_unhealthy() {
        let mon = monitor();
        mon.register_connection("ws", true);
        mon.record_connected("ws");

        for _ in 0..97 {
            mon.record_message_received("ws");
        }
        // 3 errors out of 100 events = 3% -> degraded (>= 1%), not yet 5%.
        for _ in 0..3 {
            mon.record_error("ws");
        }
        mon.evaluate_health();
        assert_eq!(mon.connection_health("ws"), HealthStatus::Degraded);

        for _ in 0..10 {
            mon.record_error("ws");
        }
        mon.evaluate_health();
        assert_eq!(mon.connection_health("ws"), HealthStatus::Unhealthy);
    }

    #[test]
    fn latency_thresholds_drive_ladder() {
        let mon = monitor();
        mon.register_connection("rest", true);
        mon.record_connected("rest");
        mon.record_message_received("rest");

        mon.record_latency("rest", 600.0);
        mon.evaluate_health();
        assert_eq!(mon.connection_health("rest"), HealthStatus::Degraded);

        for _ in 0..50 {
            mon.record_latency("rest", 5_000.0);
        }
        mon.evaluate_health();
        assert_eq!(mon.connection_health("rest"), HealthStatus::Unhealthy);
    }

    #[test]
    fn disconnect_beats_everything() {
        let mon = monitor();
        mon.register_connection("ws", true);
        mon.record_connected("ws");
        mon.record_message_received("ws");
        mon.record_disconnected("ws");
        mon.evaluate_health();
        assert_eq!(mon.connection_health("ws"), HealthStatus::Disconnected);
        assert_eq!(
            mon.system_health().overall_status,
            HealthStatus::Disconnected
        );
    }

    #[test]
    fn system_rollup_takes_worst_required() {
        let mon = monitor();
        mon.register_connection("a", true);
        mon.register_connection("b", true);
        mon.register_connection("c", false);

        for name in ["a", "b", "c"] {
            mon.record_connected(name);
            for _ in 0..100 {
                mon.record_message_received(name);
            }
        }

        // Degrade the optional connection: system is DEGRADED.
        for _ in 0..3 {
            mon.record_error("c");
        }
        mon.evaluate_health();
        assert_eq!(mon.system_health().overall_status, HealthStatus::Degraded);
        assert!(mon.is_trading_ready());

        // Make one required connection unhealthy: system follows.
        for _ in 0..10 {
            mon.record_error("b");
        }
        mon.evaluate_health();
        assert_eq!(mon.system_health().overall_status, HealthStatus::Unhealthy);
        assert!(!mon.is_trading_ready());
    }

    #[test]
    fn change_callback_fires_on_transition() {
        let mon = monitor();
        mon.register_connection("ws", true);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mon.set_health_change_callback(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        mon.record_connected("ws");
        mon.record_message_received("ws");
        mon.evaluate_health(); // UNKNOWN -> HEALTHY
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        mon.evaluate_health(); // no change
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        mon.record_disconnected("ws");
        mon.evaluate_health(); // HEALTHY -> DISCONNECTED
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missed_heartbeats_degrade() {
        let mut config = HealthConfig::default();
        config.heartbeat_timeout_secs = 0;
        let mon = ConnectionHealthMonitor::new(config);
        mon.register_connection("ws", true);
        mon.record_connected("ws");
        mon.record_message_received("ws");
        mon.record_heartbeat("ws");

        std::thread::sleep(std::time::Duration::from_millis(5));
        mon.check_heartbeats();
        mon.evaluate_health();
        assert_eq!(mon.connection_health("ws"), HealthStatus::Degraded);

        std::thread::sleep(std::time::Duration::from_millis(5));
        mon.check_heartbeats();
        std::thread::sleep(std::time::Duration::from_millis(5));
        mon.check_heartbeats();
        mon.evaluate_health();
        assert_eq!(mon.connection_health("ws"), HealthStatus::Unhealthy);
    }
}
