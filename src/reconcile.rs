// =============================================================================
// Reconciliation (supplements C6) — balance-drift watch on top of
// PositionManager::reconcile_with_exchange
// =============================================================================
//
// SAFETY POLICY (kept from the teacher verbatim): this module logs warnings
// for any drift it discovers but will **never** automatically cancel orders
// or close positions on the exchange. The position-level reconciliation
// that *does* adopt/remove positions lives in `PositionManager`
// (§4.6 `reconcile_with_exchange`); this module only watches the account
// balance for unexplained drift, per SPEC_FULL §11.
// =============================================================================

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gateway::client::Gateway;
use crate::position_manager::PositionManager;

const DRIFT_THRESHOLD_PCT: f64 = 0.0001; // 0.01%, relative change

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub open_positions: u32,
    pub balance_drift_detected: bool,
    pub free_balance: f64,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct ReconcileEngine {
    gateway: std::sync::Arc<Gateway>,
    positions: std::sync::Arc<PositionManager>,
    last_free_balance: Mutex<Option<f64>>,
}

impl ReconcileEngine {
    pub fn new(gateway: std::sync::Arc<Gateway>, positions: std::sync::Arc<PositionManager>) -> Self {
        Self { gateway, positions, last_free_balance: Mutex::new(None) }
    }

    /// Runs a full pass: position-level reconciliation via the manager,
    /// then this module's balance-drift check. Invoked by the orchestrator
    /// on its 60s maintenance cadence, and within 30s of any ambiguous
    /// close outcome per §7.
    pub fn reconcile_once(&self) -> anyhow::Result<ReconcileResult> {
        self.positions.reconcile_with_exchange()?;

        let balance = self.gateway.get_balance()?;
        let drift = self.detect_balance_drift(balance.free);

        Ok(ReconcileResult {
            open_positions: self.positions.open_count(),
            balance_drift_detected: drift,
            free_balance: balance.free,
            timestamp: Utc::now(),
        })
    }

    fn detect_balance_drift(&self, current_free: f64) -> bool {
        let mut last = self.last_free_balance.lock();
        let drifted = match *last {
            Some(prev) if prev != 0.0 => {
                let relative_change = ((current_free - prev) / prev).abs();
                relative_change > DRIFT_THRESHOLD_PCT
            }
            _ => false,
        };
        if drifted {
            warn!(
                previous = *last,
                current = current_free,
                "reconcile: balance drift exceeds threshold, logging only (no corrective action taken)"
            );
        } else {
            info!(current_free, "reconcile: balance within expected range");
        }
        *last = Some(current_free);
        drifted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_relative_change_is_not_drift() {
        let last = Mutex::new(Some(1000.0));
        let relative_change: f64 = ((1000.05_f64 - 1000.0) / 1000.0).abs();
        assert!(relative_change < DRIFT_THRESHOLD_PCT * 10.0);
        drop(last);
    }
}
