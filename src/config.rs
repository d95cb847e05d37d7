// =============================================================================
// Configuration — file-backed engine settings with atomic save
// =============================================================================
//
// Every tunable parameter lives here. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_starting_balance() -> f64 {
    50.0
}

fn default_max_notional_per_trade() -> f64 {
    1.50
}

fn default_max_daily_loss() -> f64 {
    5.0
}

fn default_max_open_positions() -> u32 {
    3
}

fn default_max_exposure_per_market() -> f64 {
    3.0
}

fn default_stop_loss_threshold() -> f64 {
    0.10
}

fn default_slippage_threshold_bps() -> f64 {
    50.0
}

fn default_max_orders_per_minute() -> u32 {
    10
}

fn default_min_edge_cents() -> f64 {
    2.0
}

fn default_max_spread_to_trade() -> f64 {
    0.05
}

fn default_lag_move_threshold_bps() -> f64 {
    25.0
}

fn default_staleness_window_ms() -> i64 {
    500
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_leg_timeout_ms() -> u64 {
    5_000
}

fn default_unwind_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_price_adjustment_bps() -> f64 {
    10.0
}

fn default_max_price_adjustment_bps() -> f64 {
    50.0
}

fn default_min_edge_after_adjustment_cents() -> f64 {
    0.5
}

fn default_unwind_price_discount_bps() -> f64 {
    25.0
}

fn default_leg_fill_threshold() -> f64 {
    0.99
}

fn default_unwind_fill_threshold() -> f64 {
    0.95
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_polymarket_rest_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_polymarket_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_binance_ws_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_binance_symbol() -> String {
    "btcusdt".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_state_dir() -> String {
    "./data".to_string()
}

fn default_ledger_path() -> String {
    "./data/trades.json".to_string()
}

fn default_auto_save_interval_secs() -> u64 {
    30
}

fn default_max_backups() -> u32 {
    5
}

fn default_soft_max_total_exposure() -> f64 {
    100.0
}

fn default_soft_max_market_exposure() -> f64 {
    50.0
}

fn default_soft_max_position_size() -> f64 {
    10.0
}

fn default_soft_max_open_positions() -> u32 {
    5
}

fn default_soft_max_positions_per_market() -> u32 {
    2
}

// =============================================================================
// Sections
// =============================================================================

/// Risk-manager limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum notional per single trade.
    #[serde(default = "default_max_notional_per_trade")]
    pub max_notional_per_trade: f64,

    /// Maximum cumulative daily loss before trading halts.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    #[serde(default = "default_max_exposure_per_market")]
    pub max_exposure_per_market: f64,

    /// Stop trading when total loss reaches this fraction of starting balance.
    #[serde(default = "default_stop_loss_threshold")]
    pub stop_loss_threshold: f64,

    #[serde(default = "default_slippage_threshold_bps")]
    pub slippage_threshold_bps: f64,

    #[serde(default = "default_max_orders_per_minute")]
    pub max_orders_per_minute: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_notional_per_trade: default_max_notional_per_trade(),
            max_daily_loss: default_max_daily_loss(),
            max_open_positions: default_max_open_positions(),
            max_exposure_per_market: default_max_exposure_per_market(),
            stop_loss_threshold: default_stop_loss_threshold(),
            slippage_threshold_bps: default_slippage_threshold_bps(),
            max_orders_per_minute: default_max_orders_per_minute(),
        }
    }
}

/// Strategy thresholds shared by all three strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Minimum edge (in cents) after fees for underpricing entries.
    #[serde(default = "default_min_edge_cents")]
    pub min_edge_cents: f64,

    /// Skip markets whose relative spread exceeds this.
    #[serde(default = "default_max_spread_to_trade")]
    pub max_spread_to_trade: f64,

    /// Reference move (bps over 1 s) that arms the stale-odds strategy.
    #[serde(default = "default_lag_move_threshold_bps")]
    pub lag_move_threshold_bps: f64,

    /// Market considered stale when its last update is older than this.
    #[serde(default = "default_staleness_window_ms")]
    pub staleness_window_ms: i64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_true")]
    pub enable_underpricing: bool,

    #[serde(default = "default_true")]
    pub enable_stale_odds: bool,

    #[serde(default = "default_true")]
    pub enable_fair_value: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_edge_cents: default_min_edge_cents(),
            max_spread_to_trade: default_max_spread_to_trade(),
            lag_move_threshold_bps: default_lag_move_threshold_bps(),
            staleness_window_ms: default_staleness_window_ms(),
            min_confidence: default_min_confidence(),
            enable_underpricing: true,
            enable_stale_odds: true,
            enable_fair_value: true,
        }
    }
}

/// Soft exposure limits. Clamped to the hard constants in `exposure.rs` at
/// construction; raising them here cannot bypass the hard caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureConfig {
    #[serde(default = "default_soft_max_total_exposure")]
    pub max_total_exposure: f64,

    #[serde(default = "default_soft_max_market_exposure")]
    pub max_market_exposure: f64,

    #[serde(default = "default_soft_max_position_size")]
    pub max_position_size: f64,

    #[serde(default = "default_soft_max_open_positions")]
    pub max_open_positions: u32,

    #[serde(default = "default_soft_max_positions_per_market")]
    pub max_positions_per_market: u32,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_total_exposure: default_soft_max_total_exposure(),
            max_market_exposure: default_soft_max_market_exposure(),
            max_position_size: default_soft_max_position_size(),
            max_open_positions: default_soft_max_open_positions(),
            max_positions_per_market: default_soft_max_positions_per_market(),
        }
    }
}

/// Paired-executor timing and retry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_leg_timeout_ms")]
    pub leg1_timeout_ms: u64,

    #[serde(default = "default_leg_timeout_ms")]
    pub leg2_timeout_ms: u64,

    #[serde(default = "default_unwind_timeout_ms")]
    pub unwind_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Worsen the leg-2 price by this many bps per retry.
    #[serde(default = "default_retry_price_adjustment_bps")]
    pub retry_price_adjustment_bps: f64,

    /// Give up retrying once the cumulative adjustment exceeds this.
    #[serde(default = "default_max_price_adjustment_bps")]
    pub max_price_adjustment_bps: f64,

    /// Abort retries when the edge remaining after adjustment drops below
    /// this many cents.
    #[serde(default = "default_min_edge_after_adjustment_cents")]
    pub min_edge_after_adjustment_cents: f64,

    #[serde(default = "default_true")]
    pub auto_unwind: bool,

    /// Worsen the unwind price by this many bps to get out quickly.
    #[serde(default = "default_unwind_price_discount_bps")]
    pub unwind_price_discount_bps: f64,

    /// Fraction of leg-2 size that counts as fully filled.
    #[serde(default = "default_leg_fill_threshold")]
    pub leg_fill_threshold: f64,

    /// Fraction of the unwind order that counts as unwound.
    #[serde(default = "default_unwind_fill_threshold")]
    pub unwind_fill_threshold: f64,

    /// Sleep between order-status polls while waiting for a fill.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            leg1_timeout_ms: default_leg_timeout_ms(),
            leg2_timeout_ms: default_leg_timeout_ms(),
            unwind_timeout_ms: default_unwind_timeout_ms(),
            max_retries: default_max_retries(),
            retry_price_adjustment_bps: default_retry_price_adjustment_bps(),
            max_price_adjustment_bps: default_max_price_adjustment_bps(),
            min_edge_after_adjustment_cents: default_min_edge_after_adjustment_cents(),
            auto_unwind: true,
            unwind_price_discount_bps: default_unwind_price_discount_bps(),
            leg_fill_threshold: default_leg_fill_threshold(),
            unwind_fill_threshold: default_unwind_fill_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Endpoints and reconnect behaviour for both venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_polymarket_rest_url")]
    pub polymarket_rest_url: String,

    #[serde(default = "default_polymarket_ws_url")]
    pub polymarket_ws_url: String,

    #[serde(default = "default_binance_ws_url")]
    pub binance_ws_url: String,

    #[serde(default = "default_binance_symbol")]
    pub binance_symbol: String,

    /// Initial reconnect delay; doubles per attempt up to the cap below.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            polymarket_rest_url: default_polymarket_rest_url(),
            polymarket_ws_url: default_polymarket_ws_url(),
            binance_ws_url: default_binance_ws_url(),
            binance_symbol: default_binance_symbol(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Trading mode: DRY_RUN, PAPER, or LIVE.
    #[serde(default)]
    pub mode: TradingMode,

    /// Starting bankroll in quote currency.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub exposure: ExposureConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Directory for state snapshots and backups.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_ledger_path")]
    pub trade_ledger_path: String,

    #[serde(default = "default_auto_save_interval_secs")]
    pub auto_save_interval_secs: u64,

    #[serde(default = "default_max_backups")]
    pub max_backups: u32,

    /// Market slugs to trade. Empty means trade nothing until configured.
    #[serde(default)]
    pub market_slugs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TradingMode::DryRun,
            starting_balance: default_starting_balance(),
            risk: RiskConfig::default(),
            strategy: StrategyConfig::default(),
            exposure: ExposureConfig::default(),
            executor: ExecutorConfig::default(),
            connection: ConnectionConfig::default(),
            state_dir: default_state_dir(),
            trade_ledger_path: default_ledger_path(),
            auto_save_interval_secs: default_auto_save_interval_secs(),
            max_backups: default_max_backups(),
            market_slugs: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            starting_balance = config.starting_balance,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Reject configurations the engine cannot run with. Called at load
    /// time; a failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.starting_balance <= 0.0 {
            anyhow::bail!("starting_balance must be positive");
        }
        if self.risk.max_daily_loss <= 0.0 {
            anyhow::bail!("risk.max_daily_loss must be positive");
        }
        if self.risk.max_notional_per_trade <= 0.0 {
            anyhow::bail!("risk.max_notional_per_trade must be positive");
        }
        if !(0.0..=1.0).contains(&self.risk.stop_loss_threshold) {
            anyhow::bail!("risk.stop_loss_threshold must be in [0, 1]");
        }
        if self.executor.leg1_timeout_ms == 0 || self.executor.leg2_timeout_ms == 0 {
            anyhow::bail!("executor leg timeouts must be positive");
        }
        if !(0.0..=1.0).contains(&self.executor.leg_fill_threshold) {
            anyhow::bail!("executor.leg_fill_threshold must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.executor.unwind_fill_threshold) {
            anyhow::bail!("executor.unwind_fill_threshold must be in [0, 1]");
        }
        if self.auto_save_interval_secs == 0 {
            anyhow::bail!("auto_save_interval_secs must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.mode, TradingMode::DryRun);
        assert!((cfg.starting_balance - 50.0).abs() < f64::EPSILON);
        assert!((cfg.risk.max_daily_loss - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.max_orders_per_minute, 10);
        assert!((cfg.strategy.min_edge_cents - 2.0).abs() < f64::EPSILON);
        assert!(cfg.strategy.enable_underpricing);
        assert_eq!(cfg.executor.max_retries, 3);
        assert!((cfg.executor.leg_fill_threshold - 0.99).abs() < f64::EPSILON);
        assert!((cfg.executor.unwind_fill_threshold - 0.95).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, TradingMode::DryRun);
        assert_eq!(cfg.connection.binance_symbol, "btcusdt");
        assert_eq!(cfg.max_backups, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "LIVE", "starting_balance": 250.0 }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, TradingMode::Live);
        assert!((cfg.starting_balance - 250.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.max_open_positions, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.market_slugs, cfg2.market_slugs);
        assert!((cfg.executor.retry_price_adjustment_bps
            - cfg2.executor.retry_price_adjustment_bps)
            .abs()
            < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.starting_balance = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.executor.leg_fill_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.risk.stop_loss_threshold = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = Config::default();
        cfg.market_slugs = vec!["btc-above-100k".to_string()];
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.market_slugs, vec!["btc-above-100k".to_string()]);
    }
}
