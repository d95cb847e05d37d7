// =============================================================================
// Polyedge — binary-market arbitrage engine, main entry point
// =============================================================================
//
// Startup order: config, safety state, reconciliation (live), market data,
// execution, evaluation loop. Live mode requires an interactive CONFIRM and
// a clean reconciliation before any order can leave the process.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod config;
mod degradation;
mod execution;
mod exposure;
mod health;
mod kill_switch;
mod ledger;
mod market_data;
mod polymarket;
mod position;
mod reconcile;
mod risk;
mod state;
mod strategy;
mod types;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::degradation::{CONN_MARKET_WS, CONN_REFERENCE};
use crate::execution::engine::ExecutionEngine;
use crate::execution::paper::{PaperConfig, PaperGateway};
use crate::exposure::ExposureReservation;
use crate::market_data::{market_feed, reference_feed};
use crate::polymarket::client::{PolymarketClient, PolymarketCredentials};
use crate::polymarket::gateway::OrderGateway;
use crate::reconcile::{Discrepancy, ReconcilerConfig, ReconciliationGuard, Reconciler};
use crate::state::PersistedPosition;
use crate::strategy::{
    FairValueStrategy, StaleOddsStrategy, Strategy, StrategyInputs, UnderpricingStrategy,
};
use crate::strategy::fair_value::FairValueConfig;
use crate::types::{now_ms, Fill, Side, TradingMode};

/// Evaluation tick interval.
const TICK_MS: u64 = 250;
/// Backup cadence in ticks (every ~60 s at the default tick).
const BACKUP_EVERY_TICKS: u64 = 240;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "polyedge", version, about = "Prediction-market arbitrage engine")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: std::path::PathBuf,

    /// Compute signals only; never dispatch orders.
    #[arg(long, conflicts_with_all = ["paper", "live"])]
    dry_run: bool,

    /// Simulated execution against the paper gateway.
    #[arg(long, conflicts_with = "live")]
    paper: bool,

    /// Real orders. Requires typing CONFIRM interactively.
    #[arg(long)]
    live: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // ── 1. Configuration ─────────────────────────────────────────────────
    let mut config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid configuration");
                std::process::exit(1);
            }
        }
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    if cli.dry_run {
        config.mode = TradingMode::DryRun;
    } else if cli.paper {
        config.mode = TradingMode::Paper;
    } else if cli.live {
        config.mode = TradingMode::Live;
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    info!(
        mode = %config.mode,
        starting_balance = config.starting_balance,
        markets = config.market_slugs.len(),
        "polyedge starting"
    );

    // ── 2. Live-mode confirmation ────────────────────────────────────────
    if config.mode == TradingMode::Live {
        println!("LIVE trading requested with real funds. Type CONFIRM to proceed:");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        if line.trim() != "CONFIRM" {
            error!("live trading not confirmed");
            std::process::exit(1);
        }
    }

    // ── 3. Shared state ──────────────────────────────────────────────────
    let app = Arc::new(AppState::new(config.clone())?);
    app.state_manager
        .initialize(config.starting_balance, None);

    // REST client: market metadata for every mode, execution only in live.
    let credentials = PolymarketCredentials::from_env();
    if config.mode == TradingMode::Live && !credentials.is_complete() {
        error!("live mode requires POLYMARKET_API_KEY/SECRET/PASSPHRASE");
        std::process::exit(1);
    }
    let client = Arc::new(PolymarketClient::new(
        config.connection.polymarket_rest_url.clone(),
        credentials,
    ));

    // ── 4. Reconciliation (live only, before trading) ────────────────────
    if config.mode == TradingMode::Live {
        let mut reconciler = Reconciler::new(
            client.clone(),
            app.state_manager.clone(),
            ReconcilerConfig::default(),
        );
        reconciler.set_approval_callback(Box::new(prompt_approval));

        let guard = ReconciliationGuard::run(&reconciler).await;
        if !guard.is_ready() {
            error!(
                error = %guard.result().error_message,
                "reconciliation failed; refusing to trade"
            );
            std::process::exit(1);
        }

        restore_from_resolved_state(&app, guard);
    }

    // ── 5. Market registration + book seeding ────────────────────────────
    match client.get_markets().await {
        Ok(markets) => {
            for market in markets {
                let selected = market.active
                    && (config.market_slugs.is_empty()
                        || config.market_slugs.contains(&market.slug));
                if !selected {
                    continue;
                }

                app.books.register_market(&market);

                for token_id in [&market.yes_outcome.token_id, &market.no_outcome.token_id] {
                    match client.get_order_book(token_id).await {
                        Ok((bids, asks)) => app.books.apply_snapshot(token_id, &bids, &asks),
                        Err(e) => warn!(token_id = %token_id, error = %e, "book seed failed"),
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "market fetch failed; starting with no markets");
        }
    }

    if app.books.all_books().is_empty() {
        warn!("no markets registered; strategies will produce no signals");
    }

    // ── 6. Market data feeds ─────────────────────────────────────────────
    app.health.register_connection(CONN_REFERENCE, true);
    app.health.register_connection(CONN_MARKET_WS, true);

    {
        let feed_config = config.connection.clone();
        let cell = app.reference_price.clone();
        let health = app.health.clone();
        let running = app.running.clone();
        tokio::spawn(async move {
            reference_feed::run_reference_feed(feed_config, cell, health, running).await;
        });
    }

    if !app.books.all_books().is_empty() {
        let feed_config = config.connection.clone();
        let registry = app.books.clone();
        let health = app.health.clone();
        let running = app.running.clone();
        tokio::spawn(async move {
            market_feed::run_market_feed(feed_config, registry, health, running, None).await;
        });
    }

    info!("market data feeds launched");

    // ── 7. Execution engine ──────────────────────────────────────────────
    let gateway: Arc<dyn OrderGateway> = match config.mode {
        TradingMode::Live => client.clone(),
        _ => Arc::new(PaperGateway::new(PaperConfig::default())),
    };

    let engine = Arc::new(ExecutionEngine::new(
        config.mode,
        gateway,
        app.risk.clone(),
        app.kill_switch.clone(),
        config.executor.clone(),
    ));
    engine.start_tracking_worker();

    wire_fill_callback(&app, &engine);
    wire_order_callback(&app, &engine);
    wire_kill_switch_callback(&app, &engine);

    // ── 8. Evaluation loop ───────────────────────────────────────────────
    {
        let app = app.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            evaluation_loop(app, engine).await;
        });
    }

    info!("all subsystems running; ctrl-c to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    app.running.store(false, Ordering::Release);

    if config.mode != TradingMode::DryRun {
        engine.cancel_all().await;
    }
    if let Err(e) = app.state_manager.save() {
        error!(error = %e, "final state save failed");
    }
    if let Err(e) = app.ledger.flush() {
        error!(error = %e, "ledger flush failed");
    }

    info!("polyedge stopped");
    Ok(())
}

// =============================================================================
// Startup helpers
// =============================================================================

/// Interactive approval for critical reconciliation discrepancies.
fn prompt_approval(discrepancies: &[Discrepancy]) -> bool {
    println!("Reconciliation found critical discrepancies:");
    for d in discrepancies.iter().filter(|d| d.is_critical) {
        println!(
            "  {} {}: local={} remote={}",
            d.kind, d.identifier, d.local_value, d.remote_value
        );
    }
    println!("Type APPROVE to accept the exchange state:");

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    line.trim() == "APPROVE"
}

/// Push the reconciler's resolved state into the live components.
fn restore_from_resolved_state(app: &Arc<AppState>, guard: ReconciliationGuard) {
    let Some(resolved) = guard.result().resolved_state.clone() else {
        return;
    };

    app.risk.update_balance(resolved.balance);

    let mut exposures = std::collections::HashMap::new();
    let mut mapping = std::collections::HashMap::new();
    for pos in &resolved.positions {
        exposures.insert(pos.token_id.clone(), pos.size * pos.entry_price);
        mapping.insert(pos.token_id.clone(), pos.market_id.clone());

        app.positions.record_fill_with_outcome(
            &Fill {
                order_id: String::new(),
                trade_id: String::new(),
                market_id: pos.market_id.clone(),
                token_id: pos.token_id.clone(),
                side: Side::Buy,
                price: pos.entry_price,
                size: pos.size,
                notional: pos.size * pos.entry_price,
                fee: 0.0,
                fill_time_ms: now_ms(),
                exchange_time_ms: 0,
            },
            &pos.outcome,
        );
    }
    app.exposure.load_positions(&exposures, &mapping);

    info!(
        positions = resolved.positions.len(),
        balance = resolved.balance,
        "reconciled state restored"
    );
}

// =============================================================================
// Callback wiring
// =============================================================================

/// Apply one fill's effects to positions, exposure, the persisted state,
/// and the ledger. Shared by the engine's fill callback (single orders) and
/// the paired-execution path. Buy-side exposure is recorded by the
/// submission path; sells release it here.
fn apply_fill_effects(app: &AppState, fill: &Fill) {
    let outcome = app
        .books
        .book(&fill.market_id)
        .map(|b| {
            if b.yes_token_id() == fill.token_id {
                "YES"
            } else {
                "NO"
            }
        })
        .unwrap_or("");
    app.positions.record_fill_with_outcome(fill, outcome);

    if fill.side == Side::Sell {
        let remaining = app
            .positions
            .get_position(&fill.token_id)
            .map(|p| p.is_open())
            .unwrap_or(false);
        if remaining {
            app.exposure
                .record_position_decreased(&fill.market_id, &fill.token_id, fill.notional);
        } else {
            app.exposure
                .record_position_closed(&fill.market_id, &fill.token_id);
        }
    }

    if let Some(pos) = app.positions.get_position(&fill.token_id) {
        app.state_manager.update_position(PersistedPosition {
            market_id: pos.market_id.clone(),
            token_id: pos.token_id.clone(),
            outcome: pos.outcome_name.clone(),
            size: pos.size,
            entry_price: pos.avg_entry_price,
            cost_basis: pos.cost_basis,
            unrealized_pnl: pos.unrealized_pnl,
            realized_pnl: pos.realized_pnl,
            entry_time: pos.first_entry_ms,
            last_update: pos.last_update_ms,
        });
    }

    app.state_manager.record_fill(fill.fee, fill.notional);
    if let Err(e) = app.ledger.record_fill(fill) {
        warn!(error = %e, "ledger fill append failed");
    }
}

fn wire_fill_callback(app: &Arc<AppState>, engine: &Arc<ExecutionEngine>) {
    let app = app.clone();
    engine.set_fill_callback(Box::new(move |fill| {
        apply_fill_effects(&app, fill);
    }));
}

/// Reconstruct the fills of a paired execution: one entry per filled leg,
/// plus the opposite-side unwind fill when the pair ended UNWOUND (its price
/// is implied by the pair's realized PnL).
fn build_pair_fills(
    result: &crate::execution::paired::PairedExecutionResult,
    signals: &[crate::types::Signal],
) -> Vec<Fill> {
    use crate::execution::paired::PairState;

    let mut fills = Vec::new();
    let legs = [
        (&signals[0], result.leg1_fill_price, result.leg1_fill_size),
        (&signals[1], result.leg2_fill_price, result.leg2_fill_size),
    ];

    for (signal, price, size) in legs {
        if size <= 0.0 {
            continue;
        }
        fills.push(Fill {
            order_id: result.pair_id.clone(),
            trade_id: String::new(),
            market_id: signal.market_id.clone(),
            token_id: signal.token_id.clone(),
            side: signal.side,
            price,
            size,
            notional: price * size,
            fee: 0.0,
            fill_time_ms: now_ms(),
            exchange_time_ms: 0,
        });
    }

    if result.final_state == PairState::Unwound && result.leg1_fill_size > 0.0 {
        let unwind_price =
            result.leg1_fill_price + result.realized_pnl / result.leg1_fill_size;
        fills.push(Fill {
            order_id: format!("{}-UNWIND", result.pair_id),
            trade_id: String::new(),
            market_id: signals[0].market_id.clone(),
            token_id: signals[0].token_id.clone(),
            side: signals[0].side.opposite(),
            price: unwind_price,
            size: result.leg1_fill_size,
            notional: unwind_price * result.leg1_fill_size,
            fee: 0.0,
            fill_time_ms: now_ms(),
            exchange_time_ms: 0,
        });
    }

    fills
}

/// Order transitions keep the persisted open-order set and counters current.
fn wire_order_callback(app: &Arc<AppState>, engine: &Arc<ExecutionEngine>) {
    let state_manager = app.state_manager.clone();
    let ledger = app.ledger.clone();

    engine.set_order_callback(Box::new(move |order| {
        use crate::types::OrderState;

        match order.state {
            OrderState::Acknowledged => {
                state_manager.record_order();
                state_manager.update_order(crate::state::PersistedOrder {
                    order_id: order.client_order_id.clone(),
                    client_order_id: order.client_order_id.clone(),
                    market_id: order.market_id.clone(),
                    token_id: order.token_id.clone(),
                    side: order.side,
                    order_type: order.order_type,
                    state: order.state,
                    price: order.price,
                    size: order.original_size,
                    filled_size: order.filled_size,
                    created_at: order.created_at_ms,
                    last_update: now_ms(),
                    paired_order_id: order.paired_order_id.clone(),
                });
            }
            OrderState::Canceled => {
                state_manager.record_cancel();
                state_manager.remove_order(&order.client_order_id);
            }
            state if state.is_terminal() => {
                state_manager.remove_order(&order.client_order_id);
            }
            _ => {}
        }

        if order.is_terminal() {
            if let Err(e) = ledger.record_order(order) {
                warn!(error = %e, "ledger order append failed");
            }
        }
    }));
}

/// A kill-switch trip persists immediately, goes to the ledger, and
/// cancel-alls from the glue (never from inside the executor).
fn wire_kill_switch_callback(app: &Arc<AppState>, engine: &Arc<ExecutionEngine>) {
    let state_manager = app.state_manager.clone();
    let ledger = app.ledger.clone();
    let engine = engine.clone();

    app.kill_switch.set_callback(Box::new(move |reason, details| {
        error!(reason = %reason, details, "kill switch tripped");

        state_manager.set_kill_switch(true, &reason.to_string());
        let _ = ledger.record_event(
            "kill_switch",
            serde_json::json!({ "reason": reason.to_string(), "details": details }),
        );

        let engine = engine.clone();
        tokio::spawn(async move {
            let canceled = engine.cancel_all().await;
            warn!(canceled, "cancel-all after kill switch");
        });
    }));
}

// =============================================================================
// Evaluation loop
// =============================================================================

async fn evaluation_loop(app: Arc<AppState>, engine: Arc<ExecutionEngine>) {
    let config = app.config.clone();

    let mut strategies: Vec<Strategy> = Vec::new();
    if config.strategy.enable_underpricing {
        strategies.push(Strategy::Underpricing(UnderpricingStrategy::new(
            config.strategy.clone(),
        )));
    }
    if config.strategy.enable_stale_odds {
        strategies.push(Strategy::StaleOdds(StaleOddsStrategy::new(
            config.strategy.clone(),
        )));
    }
    if config.strategy.enable_fair_value {
        strategies.push(Strategy::FairValue(FairValueStrategy::new(
            config.strategy.clone(),
            FairValueConfig::default(),
        )));
    }
    info!(count = strategies.len(), "strategies armed");

    // Reference history for the degradation manager's volatility input.
    let mut reference_history: VecDeque<(i64, f64)> = VecDeque::new();

    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(TICK_MS));
    let mut tick: u64 = 0;

    while app.running.load(Ordering::Acquire) {
        interval.tick().await;
        tick += 1;

        // ── Health & degradation ────────────────────────────────────
        app.health.check_heartbeats();
        app.health.evaluate_health();

        let reference = app.reference_price.get();
        if let Some(price) = reference {
            let now = now_ms();
            reference_history.push_back((now, price.mid));
            while let Some((ts, _)) = reference_history.front() {
                if now - ts > 60_000 {
                    reference_history.pop_front();
                } else {
                    break;
                }
            }
            if let Some((_, oldest)) = reference_history.front() {
                if *oldest > 0.0 {
                    app.degradation
                        .update_volatility((price.mid - oldest) / oldest);
                }
            }
        }
        app.degradation.update_balance(app.risk.current_balance());
        app.degradation.evaluate();

        // ── Kill-switch condition sweep ─────────────────────────────
        app.kill_switch.check_daily_loss(app.risk.daily_pnl());
        app.kill_switch.check_total_loss(app.risk.current_balance());
        app.kill_switch.check_exposure(app.exposure.total_exposure());
        app.kill_switch
            .check_position_count(app.exposure.open_position_count());

        // ── Mark-to-market & state sync ─────────────────────────────
        for book in app.books.all_books() {
            let yes_mid = book.yes_book().mid_price();
            if yes_mid > 0.0 {
                app.positions.mark_to_market(book.yes_token_id(), yes_mid);
            }
            let no_mid = book.no_book().mid_price();
            if no_mid > 0.0 {
                app.positions.mark_to_market(book.no_token_id(), no_mid);
            }
        }

        app.state_manager.update_balance(app.risk.current_balance());
        app.state_manager.update_daily_pnl(app.risk.daily_pnl());
        app.state_manager.update_total_pnl(app.positions.total_pnl());
        app.state_manager
            .update_exposure(app.exposure.total_exposure());
        if let Err(e) = app.state_manager.save_if_needed() {
            warn!(error = %e, "auto-save failed");
            app.degradation.record_error("state_save");
        }
        if tick % BACKUP_EVERY_TICKS == 0 {
            if let Err(e) = app.state_manager.save_backup() {
                warn!(error = %e, "backup save failed");
            }
        }

        // ── Trading gates ───────────────────────────────────────────
        if app.kill_switch.is_active() {
            continue;
        }
        if !app.health.is_trading_ready() {
            continue;
        }
        let restrictions = app.degradation.current_restrictions();
        if !restrictions.allow_new_positions {
            continue;
        }

        // ── Strategy evaluation ─────────────────────────────────────
        let max_notional = app
            .degradation
            .adjusted_max_size(config.risk.max_notional_per_trade);

        for book in app.books.all_books() {
            let inputs = StrategyInputs {
                book: book.as_ref(),
                reference,
                now_ms: now_ms(),
                available_balance: app.risk.available_balance(),
                max_notional_per_trade: max_notional,
                exposure_headroom: app
                    .exposure
                    .total_headroom()
                    .min(app.exposure.market_headroom(book.market_id())),
            };

            for strategy in strategies.iter_mut() {
                let mut signals = strategy.evaluate(&inputs);

                // Degraded modes demand more edge; paired legs share one
                // edge value, so the filter keeps or drops them together.
                let min_edge = config.strategy.min_edge_cents / 100.0
                    * restrictions.min_edge_multiplier;
                signals.retain(|s| s.expected_edge >= min_edge);
                if signals.is_empty() {
                    continue;
                }

                for signal in &signals {
                    if let Err(e) = app.ledger.record_signal(signal) {
                        warn!(error = %e, "ledger signal append failed");
                    }
                }

                if signals.len() == 2 {
                    // Underpricing pair: both legs through the paired
                    // executor as one unit.
                    let combined = signals[0].notional() + signals[1].notional();
                    let check = app
                        .exposure
                        .can_open_position(book.market_id(), combined);
                    if !check.allowed {
                        warn!(
                            market_id = %book.market_id(),
                            reason = check.rejection_reason.as_deref().unwrap_or(""),
                            "paired signal blocked by exposure"
                        );
                        continue;
                    }

                    let result = engine.submit_paired_order(&signals[0], &signals[1]).await;

                    // Exposure opens for every filled leg; the pair's fills
                    // then flow through the shared fill path (an unwind's
                    // opposite fill releases the leg it closes).
                    if result.leg1_fill_size > 0.0 {
                        app.exposure.record_position_opened(
                            book.market_id(),
                            &signals[0].token_id,
                            result.leg1_fill_price * result.leg1_fill_size,
                        );
                    }
                    if result.leg2_fill_size > 0.0 {
                        app.exposure.record_position_opened(
                            book.market_id(),
                            &signals[1].token_id,
                            result.leg2_fill_price * result.leg2_fill_size,
                        );
                    }
                    for fill in build_pair_fills(&result, &signals) {
                        app.risk.record_fill(&fill);
                        apply_fill_effects(&app, &fill);
                    }
                    if result.realized_pnl != 0.0 {
                        app.risk.record_pnl(result.realized_pnl);
                    }

                    if !result.success && !result.error.is_empty() {
                        warn!(error = %result.error, "paired execution failed");
                        app.degradation.record_error("paired_execution");
                    }
                } else {
                    for signal in &signals {
                        let (reservation, check) = ExposureReservation::acquire(
                            &app.exposure,
                            &signal.market_id,
                            &signal.token_id,
                            signal.notional(),
                        );
                        if !check.allowed {
                            warn!(
                                market_id = %signal.market_id,
                                reason = check.rejection_reason.as_deref().unwrap_or(""),
                                "signal blocked by exposure"
                            );
                            continue;
                        }

                        let result = engine.submit_order(signal).await;
                        if result.accepted {
                            reservation.commit();
                        }
                        // A dropped (uncommitted) reservation releases its
                        // exposure automatically.
                    }
                }
            }
        }
    }

    info!("evaluation loop stopped");
}
