// =============================================================================
// Application State — shared engine context
// =============================================================================
//
// The single wiring point for the engine. Every subsystem manages its own
// interior mutability; AppState ties the Arcs together along with the
// process-wide running flag and the shared reference-price cell. All
// long-running tasks receive clones of these handles.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::degradation::{DegradationConfig, DegradationManager};
use crate::exposure::ExposureManager;
use crate::health::{ConnectionHealthMonitor, HealthConfig};
use crate::kill_switch::{KillSwitch, KillSwitchConfig};
use crate::ledger::TradeLedger;
use crate::market_data::{MarketBookRegistry, ReferencePriceCell};
use crate::position::PositionManager;
use crate::risk::RiskManager;
use crate::state::{StateConfig, StateManager};

/// Shared context for every thread of the engine.
pub struct AppState {
    pub config: Config,

    /// Cooperative shutdown flag; feed tasks observe it at every read
    /// boundary.
    pub running: Arc<AtomicBool>,

    pub reference_price: Arc<ReferencePriceCell>,
    pub books: Arc<MarketBookRegistry>,

    pub kill_switch: Arc<KillSwitch>,
    pub risk: Arc<RiskManager>,
    pub exposure: Arc<ExposureManager>,
    pub positions: Arc<PositionManager>,
    pub health: Arc<ConnectionHealthMonitor>,
    pub degradation: Arc<DegradationManager>,

    pub state_manager: Arc<StateManager>,
    pub ledger: Arc<TradeLedger>,
}

impl AppState {
    /// Build every subsystem from the loaded configuration. The kill-switch
    /// and degradation soft limits derive from the risk section so one
    /// config block governs them all.
    pub fn new(config: Config) -> Result<Self> {
        let kill_switch = Arc::new(KillSwitch::new(
            config.starting_balance,
            KillSwitchConfig {
                daily_loss_limit: config.risk.max_daily_loss,
                total_loss_limit_percent: config.risk.stop_loss_threshold,
                max_exposure: config.exposure.max_total_exposure,
                high_slippage_bps: config.risk.slippage_threshold_bps * 2.0,
                ..KillSwitchConfig::default()
            },
        ));

        let risk = Arc::new(RiskManager::new(
            config.risk.clone(),
            config.starting_balance,
            kill_switch.clone(),
        ));

        let exposure = Arc::new(ExposureManager::new(&config.exposure));
        let positions = Arc::new(PositionManager::new());

        let health = Arc::new(ConnectionHealthMonitor::new(HealthConfig::default()));
        let degradation = Arc::new(DegradationManager::new(
            Some(health.clone()),
            config.starting_balance,
            DegradationConfig::default(),
        ));

        let state_manager = Arc::new(StateManager::new(StateConfig {
            state_dir: PathBuf::from(&config.state_dir),
            max_backups: config.max_backups,
            auto_save_interval_secs: config.auto_save_interval_secs,
            ..StateConfig::default()
        })?);

        let ledger = Arc::new(TradeLedger::new(&config.trade_ledger_path)?);

        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            reference_price: Arc::new(ReferencePriceCell::new()),
            books: Arc::new(MarketBookRegistry::new()),
            kill_switch,
            risk,
            exposure,
            positions,
            health,
            degradation,
            state_manager,
            ledger,
        })
    }
}
