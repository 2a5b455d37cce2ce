//! Immutable process configuration, built once at startup.
//!
//! This replaces the hot-reloadable `RuntimeConfig` pattern with a single
//! record constructed in `main()` and threaded by reference (`Arc<Config>`)
//! through every component — no global mutable singleton, no save/reload.
//! Every field enumerated in spec §6 lives here with a safe default so an
//! empty environment still starts in Demo/Paused mode.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub credentials: Credentials,

    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_min_profit_threshold")]
    pub min_profit_threshold: f64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_position_update_interval")]
    pub position_update_interval_secs: u64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_stale_data_multiplier")]
    pub stale_data_multiplier: u32,

    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: f64,

    #[serde(default = "default_min_signal_confidence")]
    pub min_signal_confidence: f64,
    #[serde(default = "default_min_trade_confidence")]
    pub min_trade_confidence: f64,

    #[serde(default = "default_kill_switch_daily_loss_pct")]
    pub kill_switch_daily_loss_pct: f64,

    #[serde(default)]
    pub account_mode: crate::types::AccountMode,
    #[serde(default)]
    pub trading_mode: crate::types::TradingMode,

    #[serde(default = "default_testnet")]
    pub testnet: bool,

    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub api_passphrase: String,
}

fn default_leverage() -> u32 {
    10
}
fn default_max_position_size() -> f64 {
    1000.0
}
fn default_risk_per_trade() -> f64 {
    0.02
}
fn default_min_profit_threshold() -> f64 {
    0.005
}
fn default_check_interval() -> u64 {
    60
}
fn default_position_update_interval() -> u64 {
    1
}
fn default_max_open_positions() -> u32 {
    5
}
fn default_stale_data_multiplier() -> u32 {
    3
}
fn default_taker_fee() -> f64 {
    0.0006
}
fn default_maker_fee() -> f64 {
    0.0002
}
fn default_min_signal_confidence() -> f64 {
    0.5
}
fn default_min_trade_confidence() -> f64 {
    0.6
}
fn default_kill_switch_daily_loss_pct() -> f64 {
    0.10
}
fn default_testnet() -> bool {
    true
}
fn default_snapshot_path() -> String {
    "positions_snapshot.json".to_string()
}

impl Config {
    /// Load from environment (`.env` + `AURORA_*` vars), falling back to an
    /// optional `config.toml`/`config.yaml` in the working directory.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let raw = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("AURORA"),
            )
            .build()
            .context("failed to build configuration sources")?;

        let cfg: Config = raw
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.leverage >= 1 && self.leverage <= 125,
            "leverage must be within [1, 125]"
        );
        anyhow::ensure!(
            self.risk_per_trade > 0.0 && self.risk_per_trade < 1.0,
            "risk_per_trade must be within (0, 1)"
        );
        anyhow::ensure!(
            self.max_open_positions > 0,
            "max_open_positions must be positive"
        );
        anyhow::ensure!(
            self.kill_switch_daily_loss_pct > 0.0 && self.kill_switch_daily_loss_pct < 1.0,
            "kill_switch_daily_loss_pct must be within (0, 1)"
        );
        Ok(())
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs)
    }

    pub fn position_update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.position_update_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Credentials {
                api_key: String::new(),
                api_secret: String::new(),
                api_passphrase: String::new(),
            },
            leverage: default_leverage(),
            max_position_size: default_max_position_size(),
            risk_per_trade: default_risk_per_trade(),
            min_profit_threshold: default_min_profit_threshold(),
            check_interval_secs: default_check_interval(),
            position_update_interval_secs: default_position_update_interval(),
            max_open_positions: default_max_open_positions(),
            stale_data_multiplier: default_stale_data_multiplier(),
            taker_fee: default_taker_fee(),
            maker_fee: default_maker_fee(),
            min_signal_confidence: default_min_signal_confidence(),
            min_trade_confidence: default_min_trade_confidence(),
            kill_switch_daily_loss_pct: default_kill_switch_daily_loss_pct(),
            account_mode: crate::types::AccountMode::Demo,
            trading_mode: crate::types::TradingMode::Paused,
            testnet: default_testnet(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn default_config_starts_paused_demo() {
        let cfg = Config::default();
        assert_eq!(cfg.account_mode, crate::types::AccountMode::Demo);
        assert_eq!(cfg.trading_mode, crate::types::TradingMode::Paused);
    }

    #[test]
    fn rejects_leverage_out_of_range() {
        let mut cfg = Config::default();
        cfg.leverage = 200;
        assert!(cfg.validate().is_err());
    }
}
