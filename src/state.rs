// =============================================================================
// State Manager — versioned JSON snapshots with atomic writes and backups
// =============================================================================
//
// Exclusive owner of the authoritative `SystemState`. Every mutation sets a
// dirty flag; persistence writes to a temp file in the same directory and
// renames it over the primary (the rename is the commit point). Numbered
// backups rotate with `state_backup_0.json` newest.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{now_ms, OrderState, OrderType, Side};

/// Current snapshot schema version.
pub const STATE_VERSION: i32 = 2;
/// Versions the loader accepts.
const MIN_STATE_VERSION: i32 = 1;
const MAX_STATE_VERSION: i32 = 10;

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Position state as persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPosition {
    pub market_id: String,
    pub token_id: String,
    /// "YES" or "NO".
    pub outcome: String,
    pub size: f64,
    pub entry_price: f64,
    pub cost_basis: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    /// Epoch milliseconds.
    pub entry_time: i64,
    pub last_update: i64,
}

/// Order state as persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub state: OrderState,
    pub price: f64,
    pub size: f64,
    #[serde(default)]
    pub filled_size: f64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub last_update: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_order_id: Option<String>,
}

impl PersistedOrder {
    /// Orders still working on the venue.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            OrderState::Sent | OrderState::Acknowledged | OrderState::Partial
        )
    }
}

/// Complete system snapshot. Field names are the on-disk JSON keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub version: i32,

    #[serde(default)]
    pub positions: Vec<PersistedPosition>,
    #[serde(default)]
    pub open_orders: Vec<PersistedOrder>,

    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub starting_balance: f64,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default)]
    pub total_exposure: f64,

    #[serde(default)]
    pub session_id: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub session_start: i64,
    #[serde(default)]
    pub last_save: i64,
    #[serde(default)]
    pub save_count: i32,

    #[serde(default)]
    pub kill_switch_active: bool,
    #[serde(default)]
    pub kill_switch_reason: String,

    #[serde(default)]
    pub total_orders: i64,
    #[serde(default)]
    pub total_fills: i64,
    #[serde(default)]
    pub total_cancels: i64,
    #[serde(default)]
    pub total_fees: f64,
    #[serde(default)]
    pub total_volume: f64,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            positions: Vec::new(),
            open_orders: Vec::new(),
            balance: 0.0,
            starting_balance: 0.0,
            daily_pnl: 0.0,
            total_pnl: 0.0,
            total_exposure: 0.0,
            session_id: String::new(),
            session_start: 0,
            last_save: 0,
            save_count: 0,
            kill_switch_active: false,
            kill_switch_reason: String::new(),
            total_orders: 0,
            total_fills: 0,
            total_cancels: 0,
            total_fees: 0.0,
            total_volume: 0.0,
        }
    }
}

impl SystemState {
    pub fn is_valid(&self) -> bool {
        self.validation_error().is_none()
    }

    /// First validation failure, if any. A file failing validation is
    /// skipped by the loader rather than corrupted further.
    pub fn validation_error(&self) -> Option<String> {
        if !(MIN_STATE_VERSION..=MAX_STATE_VERSION).contains(&self.version) {
            return Some(format!("invalid version number {}", self.version));
        }
        if self.balance < 0.0 {
            return Some("negative balance".to_string());
        }
        if self.starting_balance <= 0.0 {
            return Some("invalid starting balance".to_string());
        }
        if self.total_exposure < 0.0 {
            return Some("negative exposure".to_string());
        }
        for pos in &self.positions {
            if pos.size < 0.0 {
                return Some(format!("negative position size for {}", pos.token_id));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// State manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StateConfig {
    pub state_dir: PathBuf,
    pub state_file: String,
    pub backup_prefix: String,
    pub max_backups: u32,
    pub auto_save_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./data"),
            state_file: "state.json".to_string(),
            backup_prefix: "state_backup_".to_string(),
            max_backups: 5,
            auto_save_interval_secs: 30,
        }
    }
}

/// Handles all persistence operations for the system state.
pub struct StateManager {
    config: StateConfig,
    state: Mutex<SystemState>,
    dirty: AtomicBool,
    last_save_ms: Mutex<i64>,
}

impl StateManager {
    pub fn new(config: StateConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!("failed to create state dir {}", config.state_dir.display())
        })?;
        info!(dir = %config.state_dir.display(), "state manager initialised");

        Ok(Self {
            config,
            state: Mutex::new(SystemState::default()),
            dirty: AtomicBool::new(false),
            last_save_ms: Mutex::new(now_ms()),
        })
    }

    /// Seed a fresh session. Generates an 8-hex-char session id when none is
    /// supplied.
    pub fn initialize(&self, starting_balance: f64, session_id: Option<String>) {
        let mut state = self.state.lock();
        state.starting_balance = starting_balance;
        state.balance = starting_balance;
        state.session_start = now_ms();
        state.session_id = session_id.unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            id[..8].to_string()
        });
        self.dirty.store(true, Ordering::Release);

        info!(
            session_id = %state.session_id,
            starting_balance,
            "state initialised"
        );
    }

    /// Replace the in-memory state wholesale (used after reconciliation).
    pub fn replace_state(&self, new_state: SystemState) {
        *self.state.lock() = new_state;
        self.dirty.store(true, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Mutations — each marks the state dirty
    // -------------------------------------------------------------------------

    pub fn update_position(&self, position: PersistedPosition) {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .positions
            .iter_mut()
            .find(|p| p.token_id == position.token_id)
        {
            *existing = position;
        } else {
            state.positions.push(position);
        }
        self.dirty.store(true, Ordering::Release);
    }

    pub fn remove_position(&self, token_id: &str) {
        self.state.lock().positions.retain(|p| p.token_id != token_id);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn update_order(&self, order: PersistedOrder) {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .open_orders
            .iter_mut()
            .find(|o| o.order_id == order.order_id)
        {
            *existing = order;
        } else {
            state.open_orders.push(order);
        }
        self.dirty.store(true, Ordering::Release);
    }

    pub fn remove_order(&self, order_id: &str) {
        self.state.lock().open_orders.retain(|o| o.order_id != order_id);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn update_balance(&self, balance: f64) {
        self.state.lock().balance = balance;
        self.dirty.store(true, Ordering::Release);
    }

    pub fn update_daily_pnl(&self, daily_pnl: f64) {
        self.state.lock().daily_pnl = daily_pnl;
        self.dirty.store(true, Ordering::Release);
    }

    pub fn update_total_pnl(&self, total_pnl: f64) {
        self.state.lock().total_pnl = total_pnl;
        self.dirty.store(true, Ordering::Release);
    }

    pub fn update_exposure(&self, exposure: f64) {
        self.state.lock().total_exposure = exposure;
        self.dirty.store(true, Ordering::Release);
    }

    /// Kill-switch changes are saved immediately: they are the event the
    /// next startup most needs to see.
    pub fn set_kill_switch(&self, active: bool, reason: &str) {
        {
            let mut state = self.state.lock();
            state.kill_switch_active = active;
            state.kill_switch_reason = reason.to_string();
        }
        self.dirty.store(true, Ordering::Release);

        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save state on kill-switch change");
        }
    }

    pub fn record_order(&self) {
        self.state.lock().total_orders += 1;
        self.dirty.store(true, Ordering::Release);
    }

    /// Fills force an immediate save: a missed fill is the costliest thing
    /// to lose across a crash.
    pub fn record_fill(&self, fee: f64, volume: f64) {
        {
            let mut state = self.state.lock();
            state.total_fills += 1;
            state.total_fees += fee;
            state.total_volume += volume;
        }
        self.dirty.store(true, Ordering::Release);

        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save state on fill");
        }
    }

    pub fn record_cancel(&self) {
        self.state.lock().total_cancels += 1;
        self.dirty.store(true, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write the current snapshot to the primary path atomically.
    pub fn save(&self) -> Result<()> {
        let state_copy = {
            let mut state = self.state.lock();
            state.last_save = now_ms();
            state.save_count += 1;
            state.clone()
        };

        self.write_atomic(&self.state_path(), &state_copy)?;

        self.dirty.store(false, Ordering::Release);
        *self.last_save_ms.lock() = now_ms();
        debug!(save_count = state_copy.save_count, "state saved");
        Ok(())
    }

    /// Rotate numbered backups then write a fresh `backup_0`.
    pub fn save_backup(&self) -> Result<()> {
        self.rotate_backups();

        let state_copy = {
            let mut state = self.state.lock();
            state.last_save = now_ms();
            state.clone()
        };

        self.write_atomic(&self.backup_path(0), &state_copy)
    }

    /// Save only if dirty and the auto-save interval has elapsed.
    pub fn save_if_needed(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }

        let elapsed_ms = now_ms() - *self.last_save_ms.lock();
        if elapsed_ms >= self.config.auto_save_interval_secs as i64 * 1000 {
            return self.save();
        }
        Ok(())
    }

    /// Load from the primary file; rejects snapshots failing validation.
    pub fn load(&self) -> Option<SystemState> {
        self.read_file(&self.state_path())
    }

    /// Try the primary file, then backups newest-first.
    pub fn load_best_available(&self) -> Option<SystemState> {
        if let Some(state) = self.load() {
            if state.is_valid() {
                info!("loaded state from primary file");
                return Some(state);
            }
        }

        for index in 0..self.config.max_backups {
            let path = self.backup_path(index);
            if let Some(state) = self.read_file(&path) {
                if state.is_valid() {
                    warn!(backup = %path.display(), "loaded state from backup");
                    return Some(state);
                }
            }
        }

        warn!("no valid state file found");
        None
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn current_state(&self) -> SystemState {
        self.state.lock().clone()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    pub fn state_file_exists(&self) -> bool {
        self.state_path().exists()
    }

    pub fn list_backups(&self) -> Vec<PathBuf> {
        (0..self.config.max_backups)
            .map(|i| self.backup_path(i))
            .filter(|p| p.exists())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn state_path(&self) -> PathBuf {
        self.config.state_dir.join(&self.config.state_file)
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        self.config
            .state_dir
            .join(format!("{}{}.json", self.config.backup_prefix, index))
    }

    /// Serialize to a temp file in the same directory, then rename. The
    /// rename is the commit point; temp and target must share a filesystem.
    fn write_atomic(&self, path: &Path, state: &SystemState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise system state")?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Option<SystemState> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<SystemState>(&content) {
            Ok(state) => {
                if let Some(err) = state.validation_error() {
                    warn!(path = %path.display(), error = %err, "state file failed validation");
                    None
                } else {
                    Some(state)
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file failed to parse");
                None
            }
        }
    }

    /// Shift backup_i to backup_{i+1}, dropping the oldest.
    fn rotate_backups(&self) {
        let max = self.config.max_backups;
        if max == 0 {
            return;
        }

        let oldest = self.backup_path(max - 1);
        if oldest.exists() {
            let _ = std::fs::remove_file(&oldest);
        }

        for index in (0..max - 1).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let to = self.backup_path(index + 1);
                if let Err(e) = std::fs::rename(&from, &to) {
                    warn!(error = %e, "backup rotation failed");
                }
            }
        }
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        if self.dirty.load(Ordering::Acquire) {
            if let Err(e) = self.save() {
                warn!(error = %e, "failed to save state on shutdown");
            }
        }
    }
}
