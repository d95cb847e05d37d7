// =============================================================================
// Risk Manager — stateful pre-trade gating beyond raw exposure
// =============================================================================
//
// Checks daily PnL against the loss budget, rate-limits order flow with a
// sliding one-minute window, tracks slippage and connectivity incidents, and
// owns available balance (balance minus open exposure). The stop-loss trip
// arms the shared kill switch.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::kill_switch::{KillReason, KillSwitch};
use crate::types::{Fill, Notional, Side, Signal};

/// Outcome of a risk check.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl RiskCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Maximum retained slippage samples.
const MAX_SLIPPAGE_SAMPLES: usize = 50;

struct MarketExposure {
    by_market: std::collections::HashMap<String, f64>,
    open_positions: u32,
}

/// Stateful risk gate shared by the execution paths.
pub struct RiskManager {
    config: RiskConfig,
    starting_balance: f64,
    kill_switch: Arc<KillSwitch>,

    /// f64 bits, lock-free reads on the hot path.
    balance_bits: AtomicU64,
    daily_pnl_bits: AtomicU64,

    exposure: Mutex<MarketExposure>,
    slippage_samples: Mutex<VecDeque<(i64, f64)>>,
    connectivity_issues: AtomicU32,
    order_timestamps: Mutex<VecDeque<i64>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, starting_balance: f64, kill_switch: Arc<KillSwitch>) -> Self {
        info!(
            starting_balance,
            max_daily_loss = config.max_daily_loss,
            max_notional = config.max_notional_per_trade,
            "risk manager initialised"
        );
        Self {
            config,
            starting_balance,
            kill_switch,
            balance_bits: AtomicU64::new(starting_balance.to_bits()),
            daily_pnl_bits: AtomicU64::new(0f64.to_bits()),
            exposure: Mutex::new(MarketExposure {
                by_market: std::collections::HashMap::new(),
                open_positions: 0,
            }),
            slippage_samples: Mutex::new(VecDeque::new()),
            connectivity_issues: AtomicU32::new(0),
            order_timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Pre-trade checks
    // -------------------------------------------------------------------------

    /// Aggregate order gate: kill switch, per-trade notional cap, daily-loss
    /// budget, per-market exposure, and balance sufficiency, in that order.
    pub fn check_order(&self, signal: &Signal, notional: Notional) -> RiskCheck {
        if self.kill_switch.is_active() {
            return RiskCheck::deny(format!(
                "Kill switch active: {}",
                self.kill_switch.details()
            ));
        }

        if notional > self.config.max_notional_per_trade {
            return RiskCheck::deny(format!(
                "Notional ${notional:.2} exceeds max ${:.2}",
                self.config.max_notional_per_trade
            ));
        }

        let daily = self.daily_pnl();
        if daily <= -self.config.max_daily_loss {
            return RiskCheck::deny(format!("Daily loss limit reached: ${:.2}", -daily));
        }

        {
            let exposure = self.exposure.lock();

            if exposure.open_positions >= self.config.max_open_positions {
                return RiskCheck::deny(format!(
                    "Max open positions reached: {}",
                    self.config.max_open_positions
                ));
            }

            if let Some(market) = exposure.by_market.get(&signal.market_id) {
                if *market >= self.config.max_exposure_per_market {
                    return RiskCheck::deny(format!(
                        "Market exposure limit reached for {}: ${:.2}",
                        signal.market_id, self.config.max_exposure_per_market
                    ));
                }
            }
        }

        let available = self.available_balance();
        if notional > available {
            return RiskCheck::deny(format!(
                "Insufficient balance: need ${notional:.2}, have ${available:.2}"
            ));
        }

        RiskCheck::allow()
    }

    pub fn check_daily_loss(&self) -> RiskCheck {
        if self.daily_loss_remaining() <= 0.0 {
            return RiskCheck::deny("Daily loss limit reached".to_string());
        }
        RiskCheck::allow()
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Track per-market exposure from fills. Buys add exposure, sells release
    /// it; a market whose exposure drops to zero no longer counts as open.
    pub fn record_fill(&self, fill: &Fill) {
        let mut exposure = self.exposure.lock();

        let notional = fill.size * fill.price;
        match fill.side {
            Side::Buy => {
                let entry = exposure.by_market.entry(fill.market_id.clone()).or_insert(0.0);
                let was_flat = *entry <= 0.0;
                *entry += notional;
                if was_flat {
                    exposure.open_positions += 1;
                }
            }
            Side::Sell => {
                if let Some(entry) = exposure.by_market.get_mut(&fill.market_id) {
                    *entry -= notional;
                    if *entry <= 0.0 {
                        exposure.by_market.remove(&fill.market_id);
                        exposure.open_positions = exposure.open_positions.saturating_sub(1);
                    }
                }
            }
        }

        debug!(
            market_id = %fill.market_id,
            open_positions = exposure.open_positions,
            "risk exposure updated from fill"
        );
    }

    /// Apply realized PnL to the daily counter and balance; arms the kill
    /// switch when the stop-loss threshold is crossed.
    pub fn record_pnl(&self, realized_pnl: f64) {
        let daily = self.daily_pnl() + realized_pnl;
        self.daily_pnl_bits.store(daily.to_bits(), Ordering::Release);

        let balance = self.current_balance() + realized_pnl;
        self.balance_bits.store(balance.to_bits(), Ordering::Release);

        info!(realized_pnl, daily_pnl = daily, balance, "pnl recorded");

        if (self.starting_balance - balance) / self.starting_balance
            >= self.config.stop_loss_threshold
        {
            self.kill_switch.activate(
                KillReason::TotalLossLimit,
                &format!(
                    "Stop loss threshold exceeded: balance ${balance:.2} of ${:.2}",
                    self.starting_balance
                ),
            );
        }
    }

    /// Record a slippage sample; high samples feed the kill switch's rolling
    /// slippage trip.
    pub fn record_slippage(&self, slippage_bps: f64) {
        {
            let mut samples = self.slippage_samples.lock();
            samples.push_back((crate::types::now_ms(), slippage_bps));
            while samples.len() > MAX_SLIPPAGE_SAMPLES {
                samples.pop_front();
            }
        }

        if slippage_bps > self.config.slippage_threshold_bps {
            warn!(slippage_bps, "high slippage recorded");
            self.kill_switch.check_slippage(slippage_bps);
        }
    }

    pub fn record_connectivity_issue(&self) {
        let count = self.connectivity_issues.fetch_add(1, Ordering::AcqRel) + 1;
        self.kill_switch.check_connectivity(count);
    }

    // -------------------------------------------------------------------------
    // Rate limiting
    // -------------------------------------------------------------------------

    /// Sliding one-minute window; true when another order may be placed.
    pub fn can_place_order(&self) -> bool {
        let mut timestamps = self.order_timestamps.lock();
        let now = crate::types::now_ms();

        while let Some(front) = timestamps.front() {
            if now - front > 60_000 {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.config.max_orders_per_minute as usize {
            warn!(
                limit = self.config.max_orders_per_minute,
                "order rate limit reached"
            );
            return false;
        }
        true
    }

    pub fn record_order_placed(&self) {
        self.order_timestamps.lock().push_back(crate::types::now_ms());
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn daily_pnl(&self) -> f64 {
        f64::from_bits(self.daily_pnl_bits.load(Ordering::Acquire))
    }

    pub fn daily_loss_remaining(&self) -> f64 {
        // daily_pnl is negative for losses.
        self.config.max_daily_loss + self.daily_pnl()
    }

    pub fn current_balance(&self) -> f64 {
        f64::from_bits(self.balance_bits.load(Ordering::Acquire))
    }

    pub fn update_balance(&self, new_balance: f64) {
        self.balance_bits
            .store(new_balance.to_bits(), Ordering::Release);
    }

    pub fn current_exposure(&self) -> f64 {
        self.exposure.lock().by_market.values().sum()
    }

    pub fn exposure_for_market(&self, market_id: &str) -> f64 {
        self.exposure
            .lock()
            .by_market
            .get(market_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn open_position_count(&self) -> u32 {
        self.exposure.lock().open_positions
    }

    pub fn available_balance(&self) -> f64 {
        self.current_balance() - self.current_exposure()
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    pub fn reset_daily_counters(&self) {
        self.daily_pnl_bits.store(0f64.to_bits(), Ordering::Release);
        self.slippage_samples.lock().clear();
        self.connectivity_issues.store(0, Ordering::Release);
        info!("daily risk counters reset");
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("balance", &self.current_balance())
            .field("daily_pnl", &self.daily_pnl())
            .field("open_positions", &self.open_position_count())
            .finish()
    }
}
