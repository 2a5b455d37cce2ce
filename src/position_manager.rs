//! Position Manager (C6): thread-safe position registry; open/close/scale/
//! reconcile; concurrent-close prevention.
//!
//! Grounded in the teacher's `position_engine.rs::PositionManager` (the
//! `RwLock`-guarded collection, recorded-leverage-over-gateway-default
//! close idiom) and `exit/monitor.rs` (the "collect exit candidates under
//! lock, close outside the lock" pattern), generalised from a flat `Vec` to
//! a per-symbol registry since spec §3 requires at most one Position per
//! symbol.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::gateway::client::{Gateway, NewOrderRequest};
use crate::position::{CloseReason, Position};
use crate::risk::RiskEngine;
use crate::types::{IndicatorSnapshot, Side};

/// Collaborator the Position Manager polls for current price (§4.6
/// `update_positions(market_data_provider)`); implemented by the
/// market-data feed with REST fallback through the Gateway.
pub trait PriceSource: Send + Sync {
    fn price(&self, symbol: &str) -> Option<f64>;
}

pub struct ClosedTrade {
    pub symbol: String,
    pub reason: String,
    pub net_pnl: f64,
}

pub struct PositionManager {
    gateway: Arc<Gateway>,
    risk: Arc<RiskEngine>,
    registry: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
    closed: Mutex<Vec<ClosedTrade>>,
    snapshot_path: String,
}

impl PositionManager {
    pub fn new(gateway: Arc<Gateway>, risk: Arc<RiskEngine>, snapshot_path: impl Into<String>) -> Self {
        Self {
            gateway,
            risk,
            registry: RwLock::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// §6 "Persisted state (optional, recommended)": writes every open
    /// position to `snapshot_path` as JSON. Called after every
    /// mutation-causing event; a write failure is logged, never fatal.
    fn persist_snapshot(&self) {
        let positions: Vec<Position> = self
            .registry
            .read()
            .values()
            .map(|handle| handle.lock().clone())
            .collect();
        match serde_json::to_string_pretty(&positions) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.snapshot_path, json) {
                    warn!(path = %self.snapshot_path, error = %e, "failed to persist position snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize position snapshot"),
        }
    }

    /// Loads a previously persisted snapshot into the registry. Intended to
    /// run once at startup, before the first `reconcile_with_exchange` pass
    /// reconciles the loaded state against authoritative exchange state —
    /// per spec §7, "positions are never orphaned" applies to a restart as
    /// much as to a crash mid-sweep.
    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        if !std::path::Path::new(&self.snapshot_path).exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.snapshot_path)?;
        let positions: Vec<Position> = serde_json::from_str(&raw)?;
        let mut registry = self.registry.write();
        for position in positions {
            info!(symbol = %position.symbol, "restored position from snapshot");
            registry.insert(position.symbol.clone(), Arc::new(Mutex::new(position)));
        }
        Ok(())
    }

    pub fn open_count(&self) -> u32 {
        self.registry.read().len() as u32
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.registry.read().contains_key(symbol)
    }

    pub fn snapshot(&self, symbol: &str) -> Option<Position> {
        let handle = self.registry.read().get(symbol).cloned()?;
        Some(handle.lock().clone())
    }

    pub fn all_symbols(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    /// §4.6 `open_position`. Forbids a duplicate symbol.
    pub fn open_position(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        leverage: u32,
        stop_loss_pct: f64,
    ) -> anyhow::Result<()> {
        if self.has_position(symbol) {
            anyhow::bail!("position already open for {symbol}");
        }

        let ack = self.gateway.create_market_order(NewOrderRequest {
            symbol: symbol.to_string(),
            side,
            amount,
            leverage,
            price: None,
            reduce_only: false,
            post_only: false,
        })?;

        let entry_price = ack
            .average_price
            .ok_or_else(|| anyhow::anyhow!("no fill price reported for {symbol}"))?;

        let stop_loss = match side {
            Side::Long => entry_price * (1.0 - stop_loss_pct),
            Side::Short => entry_price * (1.0 + stop_loss_pct),
        };
        let take_profit = match side {
            Side::Long => entry_price * (1.0 + stop_loss_pct * 3.0),
            Side::Short => entry_price * (1.0 - stop_loss_pct * 3.0),
        };

        let position = Position::new(
            symbol.to_string(),
            side,
            amount,
            leverage,
            entry_price,
            stop_loss,
            take_profit,
            self.gateway.taker_fee(),
        );

        self.registry
            .write()
            .insert(symbol.to_string(), Arc::new(Mutex::new(position)));

        info!(symbol, %side, entry_price, amount, leverage, "position opened");
        self.persist_snapshot();
        Ok(())
    }

    /// §4.6 `close_position`. Reads leverage from the locally-recorded
    /// Position (itself sourced from the exchange at open time) rather than
    /// a gateway default, matching the documented leverage-mismatch fix.
    pub fn close_position(&self, symbol: &str, reason: CloseReason) -> anyhow::Result<()> {
        let handle = match self.registry.write().remove(symbol) {
            Some(h) => h,
            None => return Ok(()), // already closed by a concurrent sweep
        };

        let position = handle.lock().clone();
        let ack = self.gateway.create_market_order(NewOrderRequest {
            symbol: symbol.to_string(),
            side: position.side.opposite(),
            amount: position.amount,
            leverage: position.leverage,
            price: None,
            reduce_only: true,
            post_only: false,
        })?;

        let exit_price = ack.average_price.unwrap_or(position.entry_price);
        let net_pnl = position.net_pnl(exit_price) * position.amount * position.entry_price;

        self.closed.lock().push(ClosedTrade {
            symbol: symbol.to_string(),
            reason: format!("{reason:?}"),
            net_pnl,
        });

        info!(symbol, ?reason, net_pnl, "position closed");
        self.persist_snapshot();
        Ok(())
    }

    /// §4.6 `update_positions`. For each open position: update tracking,
    /// run the three exit-price-update rules, evaluate `should_close`, and
    /// — after releasing every per-position lock — close the ones that
    /// fired. Between the candidate list being built and a close actually
    /// happening, re-check the registry so a position closed by a prior
    /// iteration of the same sweep (or another thread) is not closed twice
    /// (the concurrent-close-prevention rule).
    pub fn update_positions(
        &self,
        prices: &dyn PriceSource,
        indicators: &dyn Fn(&str) -> IndicatorSnapshot,
        drawdown: f64,
        portfolio_correlation: f64,
    ) {
        let symbols = self.all_symbols();
        let mut to_close: Vec<(String, CloseReason)> = Vec::new();

        for symbol in symbols {
            let Some(handle) = self.registry.read().get(&symbol).cloned() else {
                continue;
            };
            let Some(price) = prices.price(&symbol) else {
                warn!(symbol, "no price available for open position, skipping sweep");
                continue;
            };

            let snapshot = indicators(&symbol);
            let mut position = handle.lock();
            position.update_tracking(price);
            position.update_trailing_stop(0.01, snapshot.volatility, snapshot.momentum);
            position.update_breakeven_plus(price, snapshot.volatility);
            position.update_trailing_take_profit(price, snapshot.volatility, snapshot.momentum);
            position.update_take_profit(
                price,
                snapshot.momentum,
                snapshot.trend_strength,
                snapshot.volatility,
                snapshot.rsi,
                snapshot.resistance.or(snapshot.support),
            );

            if let Some(reason) =
                position.should_close(price, snapshot.volatility, drawdown, portfolio_correlation)
            {
                to_close.push((symbol, reason));
            }
        }

        for (symbol, reason) in to_close {
            if !self.has_position(&symbol) {
                continue; // closed already since the candidate was collected
            }
            if let Err(e) = self.close_position(&symbol, reason) {
                warn!(symbol, error = %e, "failed to close position");
            }
        }
    }

    /// §4.6 `scale_out`: reduce-only partial close using the position's own
    /// recorded leverage, not a gateway default.
    pub fn scale_out(&self, symbol: &str, fraction: f64) -> anyhow::Result<()> {
        anyhow::ensure!((0.0..1.0).contains(&fraction), "fraction must be in (0,1)");
        let handle = self
            .registry
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no open position for {symbol}"))?;

        let (side, leverage, reduce_amount) = {
            let position = handle.lock();
            (position.side, position.leverage, position.amount * fraction)
        };

        self.gateway.validate_locally(symbol, reduce_amount, None)?;
        self.gateway.create_market_order(NewOrderRequest {
            symbol: symbol.to_string(),
            side: side.opposite(),
            amount: reduce_amount,
            leverage,
            price: None,
            reduce_only: true,
            post_only: false,
        })?;

        {
            let mut position = handle.lock();
            position.amount -= reduce_amount;
        }
        self.persist_snapshot();
        Ok(())
    }

    /// §4.6 `reconcile_with_exchange`. Idempotent: running twice with no
    /// intervening exchange change leaves the registry unchanged.
    pub fn reconcile_with_exchange(&self) -> anyhow::Result<()> {
        let exchange_positions = self.gateway.fetch_positions()?;
        let exchange_symbols: std::collections::HashSet<_> =
            exchange_positions.iter().map(|p| p.symbol.clone()).collect();

        for ep in &exchange_positions {
            if !self.has_position(&ep.symbol) {
                let position = Position::new(
                    ep.symbol.clone(),
                    ep.side,
                    ep.amount,
                    ep.leverage,
                    ep.entry_price,
                    // No local stop-loss/take-profit record exists for an
                    // exchange-only position; seed conservatively at ±2%.
                    match ep.side {
                        Side::Long => ep.entry_price * 0.98,
                        Side::Short => ep.entry_price * 1.02,
                    },
                    match ep.side {
                        Side::Long => ep.entry_price * 1.06,
                        Side::Short => ep.entry_price * 0.94,
                    },
                    self.gateway.taker_fee(),
                );
                warn!(symbol = %ep.symbol, "reconcile: adopted untracked exchange position");
                self.registry
                    .write()
                    .insert(ep.symbol.clone(), Arc::new(Mutex::new(position)));
            }
        }

        let local_symbols = self.all_symbols();
        for symbol in local_symbols {
            if !exchange_symbols.contains(&symbol) {
                if let Some(handle) = self.registry.write().remove(&symbol) {
                    let position = handle.lock().clone();
                    let implied_pnl = position.net_pnl(position.entry_price)
                        * position.amount
                        * position.entry_price;
                    warn!(symbol, implied_pnl, "reconcile: removed untracked-exit position");
                    self.risk.record_trade_outcome(implied_pnl, self.risk.snapshot().peak_balance);
                    self.closed.lock().push(ClosedTrade {
                        symbol,
                        reason: "untracked_exit".to_string(),
                        net_pnl: implied_pnl,
                    });
                }
            }
        }

        self.persist_snapshot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::risk::RiskConfig;
    use crate::scheduler::Scheduler;

    fn manager() -> PositionManager {
        let cfg = Config::default();
        let gateway = Arc::new(Gateway::new(&cfg, Arc::new(Scheduler::new())).unwrap());
        let risk = Arc::new(RiskEngine::new(RiskConfig::default(), 10_000.0));
        PositionManager::new(gateway, risk, "test_snapshot.json")
    }

    #[test]
    fn empty_registry_has_zero_open_count() {
        let pm = manager();
        assert_eq!(pm.open_count(), 0);
        assert!(!pm.has_position("BTCUSDT"));
    }

    #[test]
    fn scale_out_rejects_fraction_out_of_range() {
        let pm = manager();
        assert!(pm.scale_out("BTCUSDT", 1.5).is_err());
        assert!(pm.scale_out("BTCUSDT", 0.0).is_err());
    }

    #[test]
    fn close_on_missing_symbol_is_a_no_op() {
        let pm = manager();
        assert!(pm.close_position("NOPE", CloseReason::StopLoss).is_ok());
    }
}
