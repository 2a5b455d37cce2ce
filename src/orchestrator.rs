//! Orchestrator (C7): three long-lived cooperating workers on plain OS
//! threads, each with its own cancellation flag, supervised by a signal
//! handler.
//!
//! Grounded in the teacher's `main.rs` worker-loop shapes (interval sleeps,
//! a shared `AppState`-like hub) but rebuilt on `std::thread::spawn` instead
//! of `tokio::spawn`: the trading-critical path here is blocking REST calls
//! and lock-guarded state, not I/O concurrency, so plain OS threads are
//! simpler than an async runtime with nothing to interleave.

use chrono::{Duration as ChronoDuration, Timelike};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::collab::{IndicatorProvider, ModelWeighter, SignalSource};
use crate::config::Config;
use crate::gateway::client::Gateway;
use crate::market_data::feed::PriceBoard;
use crate::position_manager::{PositionManager, PriceSource};
use crate::reconcile::ReconcileEngine;
use crate::risk::RiskEngine;
use crate::types::{Opportunity, Signal};

struct FeedPriceSource {
    board: PriceBoard,
    gateway: Arc<Gateway>,
}

impl PriceSource for FeedPriceSource {
    fn price(&self, symbol: &str) -> Option<f64> {
        if self.board.is_fresh(symbol) {
            return self.board.get(symbol).map(|u| u.price);
        }
        // §4.3 fallback: stale or unsubscribed symbol goes to REST at
        // NORMAL priority via the Gateway.
        self.gateway.get_ticker(symbol).ok().map(|t| t.last)
    }
}

struct ScanSlot {
    opportunities: Vec<Opportunity>,
    scanned_at: Instant,
}

pub struct Orchestrator {
    config: Arc<Config>,
    gateway: Arc<Gateway>,
    risk: Arc<RiskEngine>,
    positions: Arc<PositionManager>,
    reconcile: Arc<ReconcileEngine>,
    price_board: PriceBoard,
    signal_source: Arc<dyn SignalSource>,
    indicator_provider: Arc<dyn IndicatorProvider>,
    model_weighter: Arc<dyn ModelWeighter>,
    scan_slot: RwLock<Option<ScanSlot>>,
    cancel_position_monitor: Arc<AtomicBool>,
    cancel_scanner: Arc<AtomicBool>,
    cancel_main: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<Gateway>,
        risk: Arc<RiskEngine>,
        positions: Arc<PositionManager>,
        reconcile: Arc<ReconcileEngine>,
        price_board: PriceBoard,
        signal_source: Arc<dyn SignalSource>,
        indicator_provider: Arc<dyn IndicatorProvider>,
        model_weighter: Arc<dyn ModelWeighter>,
    ) -> Self {
        Self {
            config,
            gateway,
            risk,
            positions,
            reconcile,
            price_board,
            signal_source,
            indicator_provider,
            model_weighter,
            scan_slot: RwLock::new(None),
            cancel_position_monitor: Arc::new(AtomicBool::new(false)),
            cancel_scanner: Arc::new(AtomicBool::new(false)),
            cancel_main: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns W1/W2/W3 and blocks until all three cancellation flags have
    /// been observed (i.e. until `request_shutdown` is called from another
    /// thread, typically the process signal handler).
    pub fn run(self: Arc<Self>) {
        let w1 = {
            let this = self.clone();
            std::thread::spawn(move || this.run_position_monitor())
        };
        let w2 = {
            let this = self.clone();
            std::thread::spawn(move || this.run_background_scanner())
        };
        let w3 = {
            let this = self.clone();
            std::thread::spawn(move || this.run_main_loop())
        };

        for handle in [w1, w2, w3] {
            let _ = handle.join();
        }
        info!("orchestrator: all workers drained");
    }

    pub fn request_shutdown(&self) {
        self.cancel_position_monitor.store(true, Ordering::SeqCst);
        self.cancel_scanner.store(true, Ordering::SeqCst);
        self.cancel_main.store(true, Ordering::SeqCst);
    }

    fn price_source(&self) -> FeedPriceSource {
        FeedPriceSource { board: self.price_board.clone(), gateway: self.gateway.clone() }
    }

    /// W1: position monitor, 50ms loop interval, sweeps every
    /// `position_update_interval` while the registry is non-empty.
    fn run_position_monitor(&self) {
        info!("orchestrator: position monitor starting");
        let mut last_sweep = Instant::now() - self.config.position_update_interval();
        let source = self.price_source();

        while !self.cancel_position_monitor.load(Ordering::SeqCst) {
            if self.positions.open_count() > 0
                && last_sweep.elapsed() >= self.config.position_update_interval()
            {
                let drawdown = self.risk.snapshot().current_drawdown;
                self.positions.update_positions(
                    &source,
                    &|symbol| self.indicator_provider.latest(symbol),
                    drawdown,
                    0.0,
                );
                last_sweep = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        info!("orchestrator: position monitor stopped");
    }

    /// W2: background scanner, `check_interval` period, sleeping in 1s
    /// increments so it reacts promptly to cancellation.
    fn run_background_scanner(&self) {
        info!("orchestrator: background scanner starting");
        while !self.cancel_scanner.load(Ordering::SeqCst) {
            let opportunities = self
                .signal_source
                .scan()
                .into_iter()
                .map(|mut o| {
                    o.indicators = self.model_weighter.weight(o.indicators);
                    o
                })
                .collect();

            *self.scan_slot.write() = Some(ScanSlot { opportunities, scanned_at: Instant::now() });

            let deadline = Instant::now() + self.config.check_interval();
            while Instant::now() < deadline && !self.cancel_scanner.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        info!("orchestrator: background scanner stopped");
    }

    /// W3: main orchestrator, 50ms loop interval; once per `check_interval`
    /// it consumes the scan slot, gates each candidate through the risk
    /// engine, and opens positions for those that pass. Also performs
    /// hourly maintenance (clock sync, metadata refresh) and periodic
    /// reconciliation.
    fn run_main_loop(&self) {
        info!("orchestrator: main loop starting");
        let mut last_cycle = Instant::now() - self.config.check_interval();
        let mut last_reconcile = Instant::now();

        while !self.cancel_main.load(Ordering::SeqCst) {
            if last_cycle.elapsed() >= self.config.check_interval() {
                self.run_cycle();
                last_cycle = Instant::now();
            }

            if last_reconcile.elapsed() >= Duration::from_secs(60) {
                if matches!(self.config.account_mode, crate::types::AccountMode::Live) {
                    if let Err(e) = self.reconcile.reconcile_once() {
                        warn!(error = %e, "reconciliation pass failed");
                    }
                }
                last_reconcile = Instant::now();
            }

            if let Err(e) = self.gateway.ensure_clock_synced() {
                warn!(error = %e, "clock sync check failed");
            }

            std::thread::sleep(Duration::from_millis(50));
        }
        info!("orchestrator: main loop stopped");
    }

    fn run_cycle(&self) {
        if matches!(self.config.trading_mode, crate::types::TradingMode::Paused | crate::types::TradingMode::Killed) {
            return;
        }

        let max_age = ChronoDuration::seconds(
            self.config.check_interval_secs as i64 * self.config.stale_data_multiplier as i64,
        );

        let mut opportunities: Vec<Opportunity> = {
            let slot = self.scan_slot.read();
            match slot.as_ref() {
                Some(s) if s.scanned_at.elapsed() < max_age.to_std().unwrap_or(Duration::MAX) => {
                    s.opportunities.clone()
                }
                _ => {
                    warn!("main loop: no fresh opportunities, skipping cycle");
                    return;
                }
            }
        };
        opportunities.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        for opp in opportunities {
            if opp.is_stale(max_age) || matches!(opp.signal, Signal::Hold) {
                continue;
            }
            if opp.confidence < self.config.min_trade_confidence {
                continue;
            }
            self.try_open(&opp);
        }
    }

    fn try_open(&self, opp: &Opportunity) {
        let balance = match self.gateway.get_balance() {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol = %opp.symbol, error = %e, "balance fetch failed, skipping candidate");
                return;
            }
        };

        let recent_win_rate = self.risk.recent_win_rate().unwrap_or(0.5);
        let session_hour_utc = chrono::Utc::now().hour();
        let adjusted_risk_pct = self.risk.adjust_risk_for_conditions(
            self.config.risk_per_trade,
            opp.indicators.volatility,
            recent_win_rate,
            session_hour_utc,
        );
        let position_value = self.config.max_position_size * adjusted_risk_pct;
        let (allowed, reason) = self.risk.validate_trade_guardrails(
            balance.free,
            position_value,
            self.positions.open_count(),
            false,
        );
        if !allowed {
            info!(symbol = %opp.symbol, ?reason, "guardrail denied candidate");
            return;
        }

        let side = match opp.signal {
            Signal::Buy => crate::types::Side::Long,
            Signal::Sell => crate::types::Side::Short,
            Signal::Hold => return,
        };

        let regime_multiplier = 1.0 + opp.indicators.regime.abs().min(1.0) * 0.5;
        let stop_loss_pct =
            self.risk.calculate_stop_loss_pct(opp.indicators.volatility, regime_multiplier);
        let leverage = self.risk.get_max_leverage(
            opp.indicators.volatility,
            opp.confidence,
            opp.indicators.momentum,
            opp.indicators.trend_strength,
            opp.indicators.regime,
            recent_win_rate,
            self.risk.snapshot().current_drawdown,
        ) as u32;

        let ticker = match self.gateway.get_ticker(&opp.symbol) {
            Ok(t) => t,
            Err(e) => {
                warn!(symbol = %opp.symbol, error = %e, "ticker fetch failed, skipping candidate");
                return;
            }
        };

        let (avg_win, avg_loss) = self.risk.avg_win_loss();
        let kelly_fraction = self.risk.calculate_kelly_criterion(
            recent_win_rate,
            if avg_win > 0.0 { avg_win } else { 0.02 },
            if avg_loss > 0.0 { avg_loss } else { 0.01 },
            self.risk.historical_win_rate(),
            opp.indicators.volatility,
        );
        if kelly_fraction <= 0.0 {
            info!(symbol = %opp.symbol, "kelly sizing denied candidate (non-positive edge)");
            return;
        }

        let risked_dollars = (balance.free * kelly_fraction).min(position_value);
        let amount = risked_dollars / ticker.last;
        if let Err(e) =
            self.positions.open_position(&opp.symbol, side, amount, leverage, stop_loss_pct)
        {
            warn!(symbol = %opp.symbol, error = %e, "failed to open position");
        }
    }
}
