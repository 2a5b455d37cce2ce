// =============================================================================
// Risk Engine (C4) — guardrails, streak/drawdown tracking, fractional Kelly
// =============================================================================
//
// Grounded in the teacher's split of an `Inner` struct behind a single
// `RwLock` plus an immutable config, and its UTC-day daily-reset pattern;
// generalised with the Kelly/leverage/session formulas of spec §4.4, which
// the teacher's risk engine did not implement.

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::types::RiskStateSnapshot;

const RECENT_TRADES_CAPACITY: usize = 20;

struct Inner {
    initial_balance: f64,
    peak_balance: f64,
    current_drawdown: f64,
    daily_pnl: f64,
    initial_daily_balance: f64,
    daily_reset_at: DateTime<Utc>,
    win_streak: u32,
    loss_streak: u32,
    recent_trades: VecDeque<f64>,
    total_trades: u64,
    total_wins: u64,
    kill_switch_active: bool,
    kill_switch_reason: Option<String>,
}

/// Immutable per-process risk configuration (§6 environment fields).
pub struct RiskConfig {
    pub max_open_positions: u32,
    pub kill_switch_daily_loss_pct: f64,
    pub per_trade_cap_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            kill_switch_daily_loss_pct: 0.10,
            per_trade_cap_pct: 0.05,
        }
    }
}

pub struct RiskEngine {
    config: RiskConfig,
    inner: RwLock<Inner>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig, initial_balance: f64) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                initial_balance,
                peak_balance: initial_balance,
                current_drawdown: 0.0,
                daily_pnl: 0.0,
                initial_daily_balance: initial_balance,
                daily_reset_at: Utc::now(),
                win_streak: 0,
                loss_streak: 0,
                recent_trades: VecDeque::with_capacity(RECENT_TRADES_CAPACITY),
                total_trades: 0,
                total_wins: 0,
                kill_switch_active: false,
                kill_switch_reason: None,
            }),
        }
    }

    /// §4.4 `validate_trade_guardrails`.
    pub fn validate_trade_guardrails(
        &self,
        balance: f64,
        position_value: f64,
        current_positions: u32,
        is_exit: bool,
    ) -> (bool, Option<String>) {
        self.maybe_reset_daily();

        if balance <= 0.0 {
            return (false, Some("insufficient balance".to_string()));
        }

        {
            let inner = self.inner.read();
            if inner.kill_switch_active && !is_exit {
                return (
                    false,
                    Some(format!(
                        "kill switch active: {}",
                        inner.kill_switch_reason.as_deref().unwrap_or("unknown")
                    )),
                );
            }
        }

        if !is_exit && position_value / balance > self.config.per_trade_cap_pct {
            return (false, Some("per-trade cap exceeded".to_string()));
        }

        if !is_exit && current_positions >= self.config.max_open_positions {
            return (false, Some("max open positions reached".to_string()));
        }

        let mut inner = self.inner.write();
        if inner.initial_daily_balance > 0.0
            && inner.daily_pnl / inner.initial_daily_balance <= -self.config.kill_switch_daily_loss_pct
        {
            inner.kill_switch_active = true;
            inner.kill_switch_reason = Some("daily loss limit".to_string());
            warn!("risk engine: kill switch activated (daily loss limit)");
            return (false, Some("daily loss limit".to_string()));
        }

        (true, None)
    }

    /// §4.4 `record_trade_outcome`.
    pub fn record_trade_outcome(&self, net_pnl: f64, current_balance: f64) {
        self.maybe_reset_daily();
        let mut inner = self.inner.write();

        inner.daily_pnl += net_pnl;
        if inner.recent_trades.len() == RECENT_TRADES_CAPACITY {
            inner.recent_trades.pop_front();
        }
        inner.recent_trades.push_back(net_pnl);

        inner.total_trades += 1;
        if net_pnl > 0.0 {
            inner.total_wins += 1;
            inner.win_streak += 1;
            inner.loss_streak = 0;
        } else if net_pnl < 0.0 {
            inner.loss_streak += 1;
            inner.win_streak = 0;
        }

        if current_balance > inner.peak_balance {
            inner.peak_balance = current_balance;
        }
        inner.current_drawdown = if inner.peak_balance > 0.0 {
            (inner.peak_balance - current_balance) / inner.peak_balance
        } else {
            0.0
        };

        info!(
            net_pnl,
            daily_pnl = inner.daily_pnl,
            win_streak = inner.win_streak,
            loss_streak = inner.loss_streak,
            drawdown = inner.current_drawdown,
            "risk engine: trade outcome recorded"
        );
    }

    fn maybe_reset_daily(&self) {
        let needs_reset = {
            let inner = self.inner.read();
            inner.daily_reset_at.date_naive() != Utc::now().date_naive()
        };
        if !needs_reset {
            return;
        }
        let mut inner = self.inner.write();
        if inner.daily_reset_at.date_naive() != Utc::now().date_naive() {
            inner.daily_pnl = 0.0;
            inner.initial_daily_balance = inner.peak_balance;
            inner.daily_reset_at = Utc::now();
            info!("risk engine: daily P&L reset on UTC date rollover (kill switch unaffected)");
        }
    }

    pub fn kill(&self, reason: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.kill_switch_active = true;
        inner.kill_switch_reason = Some(reason.into());
    }

    pub fn reset_kill_switch(&self) {
        let mut inner = self.inner.write();
        inner.kill_switch_active = false;
        inner.kill_switch_reason = None;
    }

    pub fn snapshot(&self) -> RiskStateSnapshot {
        let inner = self.inner.read();
        RiskStateSnapshot {
            initial_balance: inner.initial_balance,
            peak_balance: inner.peak_balance,
            current_drawdown: inner.current_drawdown,
            daily_pnl: inner.daily_pnl,
            daily_reset_at: inner.daily_reset_at,
            win_streak: inner.win_streak,
            loss_streak: inner.loss_streak,
            kill_switch_active: inner.kill_switch_active,
            kill_switch_reason: inner.kill_switch_reason.clone(),
        }
    }

    /// Win rate over the last (at most) 20 recorded trades, the window
    /// `calculate_kelly_criterion`'s consistency check compares against the
    /// caller-supplied historical rate.
    pub fn recent_win_rate(&self) -> Option<f64> {
        let inner = self.inner.read();
        if inner.recent_trades.is_empty() {
            return None;
        }
        let wins = inner.recent_trades.iter().filter(|&&p| p > 0.0).count();
        Some(wins as f64 / inner.recent_trades.len() as f64)
    }

    /// Cumulative win rate across every trade this engine has recorded,
    /// distinct from the 20-trade `recent_win_rate` ring.
    pub fn historical_win_rate(&self) -> f64 {
        let inner = self.inner.read();
        if inner.total_trades == 0 {
            return 0.5;
        }
        inner.total_wins as f64 / inner.total_trades as f64
    }

    /// Average winning and average losing trade size (both non-negative)
    /// over the 20-trade recent window, for feeding `calculate_kelly_criterion`.
    pub fn avg_win_loss(&self) -> (f64, f64) {
        let inner = self.inner.read();
        let wins: Vec<f64> = inner.recent_trades.iter().copied().filter(|&p| p > 0.0).collect();
        let losses: Vec<f64> = inner.recent_trades.iter().copied().filter(|&p| p < 0.0).collect();
        let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().map(|p| p.abs()).sum::<f64>() / losses.len() as f64
        };
        (avg_win, avg_loss)
    }

    /// §4.4 `calculate_kelly_criterion`.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_kelly_criterion(
        &self,
        win_rate: f64,
        avg_win: f64,
        avg_loss: f64,
        historical_win_rate: f64,
        volatility: f64,
    ) -> f64 {
        if avg_loss == 0.0 {
            return 0.0;
        }
        let b = avg_win / avg_loss;
        let p = win_rate;
        let q = 1.0 - p;
        let kelly = (b * p - q) / b;
        if kelly <= 0.0 {
            return 0.0;
        }

        let recent_wr = self.recent_win_rate().unwrap_or(win_rate);
        let consistency = 1.0 - (recent_wr - historical_win_rate).abs();
        let mut fraction: f64 = if consistency < 0.5 {
            0.35
        } else if consistency < 0.6 {
            0.45
        } else if consistency < 0.7 {
            0.50
        } else if consistency < 0.85 {
            0.55
        } else if consistency < 0.9 {
            0.60
        } else {
            0.65
        };

        if win_rate >= 0.65 {
            fraction = (fraction * 1.10).min(0.70);
        } else if win_rate <= 0.45 {
            fraction = (fraction * 0.85).max(0.30);
        }

        let (win_streak, loss_streak) = {
            let inner = self.inner.read();
            (inner.win_streak, inner.loss_streak)
        };
        if loss_streak >= 3 {
            fraction *= 0.65;
        } else if loss_streak >= 2 {
            fraction *= 0.85;
        } else if win_streak >= 5 {
            fraction = (fraction * 1.15).min(0.70);
        } else if win_streak >= 3 {
            fraction *= 1.08;
        }

        if volatility > 0.06 {
            fraction = fraction.min(0.25);
        }

        let result = (0.025_f64).min(kelly * fraction);
        if result > 0.0 {
            result.max(0.005)
        } else {
            0.0
        }
    }

    /// §4.4 `calculate_stop_loss_pct`.
    pub fn calculate_stop_loss_pct(&self, volatility: f64, regime_multiplier: f64) -> f64 {
        let base = 0.012;
        let addition = (volatility * regime_multiplier).min(0.02);
        (base + addition).clamp(0.010, 0.025)
    }

    /// §4.4 `get_max_leverage`, 8-factor sum clamped to `[3, 20]`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_max_leverage(
        &self,
        volatility: f64,
        confidence: f64,
        momentum: f64,
        trend_strength: f64,
        regime: f64,
        recent_win_rate: f64,
        drawdown: f64,
    ) -> i32 {
        let mut leverage: f64 = 10.0;

        leverage += if volatility > 0.06 {
            -4.0
        } else if volatility > 0.04 {
            -2.0
        } else if volatility < 0.015 {
            2.0
        } else {
            0.0
        };

        leverage += if confidence > 0.85 {
            3.0
        } else if confidence > 0.70 {
            1.0
        } else if confidence < 0.55 {
            -2.0
        } else {
            0.0
        };

        leverage += if momentum.abs() > 0.03 { 1.0 } else { 0.0 };
        leverage += if trend_strength > 0.6 { 2.0 } else { 0.0 };

        leverage += if regime > 0.5 {
            2.0
        } else if regime < -0.5 {
            -2.0
        } else {
            0.0
        };

        leverage += if recent_win_rate >= 0.65 {
            2.0
        } else if recent_win_rate <= 0.40 {
            -3.0
        } else {
            0.0
        };

        let (win_streak, loss_streak) = {
            let inner = self.inner.read();
            (inner.win_streak, inner.loss_streak)
        };
        leverage += if loss_streak >= 3 {
            -3.0
        } else if win_streak >= 5 {
            1.0
        } else {
            0.0
        };

        // drawdown adjustment dominates (§4.4).
        leverage += if drawdown >= 0.20 {
            -10.0
        } else if drawdown >= 0.15 {
            -6.0
        } else if drawdown >= 0.10 {
            -3.0
        } else {
            0.0
        };

        (leverage.round() as i32).clamp(3, 20)
    }

    /// §4.4 `adjust_risk_for_conditions`: base risk scaled by session,
    /// volatility, and recent win rate.
    pub fn adjust_risk_for_conditions(
        &self,
        base_risk: f64,
        volatility: f64,
        win_rate: f64,
        session_hour_utc: u32,
    ) -> f64 {
        let session_factor = match session_hour_utc {
            0..=7 => 0.95,   // asian
            8..=15 => 1.00,  // european
            _ => 1.05,       // us
        };

        let volatility_factor = if volatility > 0.06 {
            0.75
        } else if volatility > 0.04 {
            0.90
        } else if volatility < 0.015 {
            1.10
        } else {
            1.00
        };

        let win_rate_factor = if win_rate >= 0.65 {
            1.15
        } else if win_rate <= 0.40 {
            0.80
        } else {
            1.00
        };

        base_risk * session_factor * volatility_factor * win_rate_factor
    }

    pub fn session_factor_for(timestamp: DateTime<Utc>) -> f64 {
        match timestamp.hour() {
            0..=7 => 0.95,
            8..=15 => 1.00,
            _ => 1.05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig::default(), 10_000.0)
    }

    #[test]
    fn zero_balance_denies_without_panic() {
        let e = engine();
        let (allowed, reason) = e.validate_trade_guardrails(0.0, 100.0, 0, false);
        assert!(!allowed);
        assert_eq!(reason.as_deref(), Some("insufficient balance"));
    }

    #[test]
    fn per_trade_cap_denies_oversized_entries() {
        let e = engine();
        let (allowed, _) = e.validate_trade_guardrails(10_000.0, 600.0, 0, false);
        assert!(!allowed);
    }

    #[test]
    fn per_trade_cap_does_not_apply_to_exits() {
        let e = engine();
        let (allowed, _) = e.validate_trade_guardrails(10_000.0, 600.0, 0, true);
        assert!(allowed);
    }

    #[test]
    fn kill_switch_activates_at_daily_loss_threshold() {
        let e = engine();
        e.record_trade_outcome(-1010.0, 8990.0);
        let (allowed, reason) = e.validate_trade_guardrails(8990.0, 100.0, 0, false);
        assert!(!allowed);
        assert_eq!(reason.as_deref(), Some("daily loss limit"));
    }

    #[test]
    fn kill_switch_still_allows_exits() {
        let e = engine();
        e.kill("manual test");
        let (allowed, _) = e.validate_trade_guardrails(10_000.0, 100.0, 0, true);
        assert!(allowed);
    }

    #[test]
    fn kelly_zero_avg_loss_is_zero_not_panic() {
        let e = engine();
        assert_eq!(e.calculate_kelly_criterion(0.6, 100.0, 0.0, 0.6, 0.02), 0.0);
    }

    #[test]
    fn kelly_non_positive_returns_zero() {
        let e = engine();
        // b=1, p=0.3 => kelly = (1*0.3 - 0.7)/1 = -0.4 -> non-positive.
        assert_eq!(e.calculate_kelly_criterion(0.3, 100.0, 100.0, 0.3, 0.02), 0.0);
    }

    #[test]
    fn kelly_positive_is_bounded() {
        let e = engine();
        let k = e.calculate_kelly_criterion(0.65, 150.0, 100.0, 0.60, 0.02);
        assert!(k > 0.0);
        assert!(k <= 0.025);
        assert!(k >= 0.005);
    }

    #[test]
    fn stop_loss_pct_is_clamped() {
        let e = engine();
        assert!(e.calculate_stop_loss_pct(0.20, 1.5) <= 0.025);
        assert!(e.calculate_stop_loss_pct(0.0, 1.0) >= 0.010);
    }

    #[test]
    fn max_leverage_is_clamped_3_to_20() {
        let e = engine();
        let lo = e.get_max_leverage(0.20, 0.1, 0.0, 0.0, -1.0, 0.0, 0.25);
        let hi = e.get_max_leverage(0.01, 0.95, 0.05, 0.9, 1.0, 0.9, 0.0);
        assert!((3..=20).contains(&lo));
        assert!((3..=20).contains(&hi));
        assert!(hi > lo);
    }

    #[test]
    fn regime_shifts_leverage_up_and_down() {
        let e = engine();
        let neutral = e.get_max_leverage(0.02, 0.6, 0.0, 0.0, 0.0, 0.5, 0.0);
        let trending = e.get_max_leverage(0.02, 0.6, 0.0, 0.0, 1.0, 0.5, 0.0);
        let choppy = e.get_max_leverage(0.02, 0.6, 0.0, 0.0, -1.0, 0.5, 0.0);
        assert!(trending > neutral);
        assert!(choppy < neutral);
    }

    #[test]
    fn adjust_risk_for_conditions_scales_by_volatility_and_win_rate() {
        let e = engine();
        let calm_skilled = e.adjust_risk_for_conditions(0.02, 0.01, 0.70, 10);
        let volatile_unskilled = e.adjust_risk_for_conditions(0.02, 0.08, 0.30, 10);
        assert!(calm_skilled > volatile_unskilled);
    }
}
