// =============================================================================
// Aurora Futures Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety regardless of what a
// stored config says; operators opt into Live trading with `--live` plus a
// config that sets `trading_mode`/`account_mode` explicitly.
// =============================================================================

mod collab;
mod config;
mod error;
mod gateway;
mod market_data;
mod orchestrator;
mod position;
mod position_manager;
mod reconcile;
mod risk;
mod scheduler;
mod types;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::collab::{IdentityWeighter, NeutralIndicatorProvider, NoOpSignalSource};
use crate::config::Config;
use crate::gateway::Gateway;
use crate::market_data::MarketDataFeed;
use crate::orchestrator::Orchestrator;
use crate::position::CloseReason;
use crate::position_manager::PositionManager;
use crate::reconcile::ReconcileEngine;
use crate::risk::{RiskConfig, RiskEngine};
use crate::scheduler::Scheduler;
use crate::types::{AccountMode, TradingMode};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const DEFAULT_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "SOLUSDT"];

#[derive(Parser, Debug)]
#[command(name = "aurora-futures-engine", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Close every open position before the process exits.
    #[arg(long, global = true)]
    close_on_exit: bool,

    /// Never submit real orders; exercises the full pipeline against stub
    /// collaborators and logs what would have happened.
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine (default).
    Start,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora futures engine starting up");

    match run(cli) {
        Ok(()) => ExitCode::from(0),
        // §7 exit code 1: startup failure the operator must fix before
        // retrying — missing credentials or clock drift beyond tolerance.
        Err(StartupError::MissingCredentials) => {
            error!("startup failed: missing exchange API credentials");
            ExitCode::from(1)
        }
        Err(StartupError::ClockDrift(e)) => {
            error!(error = %e, "startup failed: clock drift exceeds tolerance");
            ExitCode::from(1)
        }
        // §7 exit code 2: unrecoverable runtime/config error.
        Err(StartupError::Config(e)) => {
            error!(error = %e, "configuration error");
            ExitCode::from(2)
        }
        Err(StartupError::Runtime(e)) => {
            error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

enum StartupError {
    MissingCredentials,
    ClockDrift(crate::error::AppError),
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

fn run(cli: Cli) -> Result<(), StartupError> {
    let Command::Start = cli.command.unwrap_or(Command::Start);

    let mut config = Config::load().map_err(StartupError::Config)?;

    // SAFETY: every boot forces Demo + Paused. Operators flip to Live mode
    // out of band (e.g. AURORA__TRADING_MODE=Live in the environment) only
    // once they've confirmed the rest of the stack; --dry-run overrides
    // whatever the config says back to Demo/Paused.
    if cli.dry_run {
        config.account_mode = AccountMode::Demo;
        config.trading_mode = TradingMode::Paused;
    } else if config.credentials.api_key.is_empty()
        || config.credentials.api_secret.is_empty()
        || config.credentials.api_passphrase.is_empty()
    {
        return Err(StartupError::MissingCredentials);
    }

    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        testnet = config.testnet,
        dry_run = cli.dry_run,
        "engine configuration loaded"
    );

    let symbols: Vec<String> = std::env::var("AURORA_SYMBOLS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());
    info!(?symbols, "trading universe");

    let config = Arc::new(config);
    let scheduler = Arc::new(Scheduler::new());
    let gateway = Arc::new(Gateway::new(&config, scheduler).map_err(StartupError::Runtime)?);

    if !cli.dry_run {
        match gateway.check_clock_drift_now() {
            Ok(()) => {}
            Err(e @ crate::error::AppError::ClockDrift { .. }) => {
                return Err(StartupError::ClockDrift(e));
            }
            Err(e) => {
                warn!(error = %e, "startup clock check failed (non-drift error), continuing");
            }
        }
    }

    let initial_balance = if cli.dry_run {
        10_000.0
    } else {
        gateway
            .get_balance()
            .map(|b| b.used.max(1.0))
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not fetch starting balance, defaulting risk baseline to 10000");
                10_000.0
            })
    };

    let risk = Arc::new(RiskEngine::new(
        RiskConfig {
            max_open_positions: config.max_open_positions,
            kill_switch_daily_loss_pct: config.kill_switch_daily_loss_pct,
            per_trade_cap_pct: config.risk_per_trade,
        },
        initial_balance,
    ));

    let positions = Arc::new(PositionManager::new(
        gateway.clone(),
        risk.clone(),
        config.snapshot_path.clone(),
    ));
    if let Err(e) = positions.load_snapshot() {
        warn!(error = %e, "failed to load position snapshot, starting with an empty registry");
    }
    let reconcile = Arc::new(ReconcileEngine::new(gateway.clone(), positions.clone()));
    if !cli.dry_run {
        if let Err(e) = reconcile.reconcile_once() {
            warn!(error = %e, "startup reconciliation failed");
        }
    }

    let feed_cancelled = Arc::new(AtomicBool::new(false));
    let feed = Arc::new(MarketDataFeed::new(gateway.clone(), symbols.clone(), feed_cancelled.clone()));
    let price_board = feed.board();
    let _feed_handle = feed.clone().spawn();

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        gateway.clone(),
        risk.clone(),
        positions.clone(),
        reconcile.clone(),
        price_board,
        Arc::new(NoOpSignalSource),
        Arc::new(NeutralIndicatorProvider),
        Arc::new(IdentityWeighter),
    ));

    let orchestrator_for_workers = orchestrator.clone();
    let workers_handle = std::thread::spawn(move || orchestrator_for_workers.run());

    wait_for_shutdown_signal();
    info!("shutdown signal received, draining workers");
    orchestrator.request_shutdown();
    feed_cancelled.store(true, Ordering::SeqCst);

    let drain_started = Instant::now();
    while !workers_handle.is_finished() && drain_started.elapsed() < SHUTDOWN_DRAIN {
        std::thread::sleep(Duration::from_millis(50));
    }
    if !workers_handle.is_finished() {
        warn!("workers did not drain within the shutdown window, proceeding anyway");
    }

    if cli.close_on_exit {
        for symbol in positions.all_symbols() {
            if let Err(e) = positions.close_position(&symbol, CloseReason::ManualShutdown) {
                warn!(symbol, error = %e, "failed to close position during shutdown");
            }
        }
    }

    info!("aurora futures engine stopped");
    Ok(())
}

/// Blocks the calling thread until SIGINT/SIGTERM arrives. Tokio is already
/// a dependency for the market data feed; a throwaway current-thread runtime
/// is enough to await its cross-platform signal future without pulling in a
/// separate signal-handling crate.
fn wait_for_shutdown_signal() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build shutdown-signal runtime");
    rt.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal, exiting immediately");
        }
    });
}
