// =============================================================================
// Shared types used across the Aurora futures engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Which way a position or signal points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Used throughout P&L math.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Raw trade signal from the (out-of-scope) signal pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Cached per-market trading rules (§3 Symbol / Market Metadata). Refreshed
/// every ~1h or on a validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMetadata {
    pub symbol: String,
    pub min_amount: f64,
    pub max_amount: f64,
    pub amount_step: f64,
    pub price_step: f64,
    pub contract_size: f64,
    pub active: bool,
    pub is_swap: bool,
    pub is_future: bool,
    pub fetched_at: DateTime<Utc>,
}

impl MarketMetadata {
    /// Symbol universe rule (§4.2): union of swap and future markets —
    /// filtering on `swap` alone silently drops quarterlies.
    pub fn is_tradable_futures(&self) -> bool {
        self.active && (self.is_swap || self.is_future)
    }

    pub fn amount_step_aligned(&self, amount: f64) -> bool {
        if self.amount_step <= 0.0 {
            return true;
        }
        let steps = amount / self.amount_step;
        (steps - steps.round()).abs() < 1e-9
    }

    pub fn validate_amount(&self, amount: f64) -> Result<(), String> {
        if !self.active {
            return Err(format!("market {} is inactive", self.symbol));
        }
        if amount < self.min_amount {
            return Err(format!("amount {amount} below min_amount {}", self.min_amount));
        }
        if amount > self.max_amount {
            return Err(format!("amount {amount} above max_amount {}", self.max_amount));
        }
        if !self.amount_step_aligned(amount) {
            return Err(format!(
                "amount {amount} not aligned to amount_step {}",
                self.amount_step
            ));
        }
        Ok(())
    }

    pub fn validate_price(&self, price: f64) -> Result<(), String> {
        if self.price_step <= 0.0 {
            return Ok(());
        }
        let steps = price / self.price_step;
        if (steps - steps.round()).abs() >= 1e-9 {
            return Err(format!("price {price} not aligned to price_step {}", self.price_step));
        }
        Ok(())
    }
}

/// Indicator snapshot consumed from the out-of-scope indicator pipeline
/// (§6, §9 "Broad indicators dict"). Concrete fields only, no opaque maps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub momentum: f64,
    pub trend_strength: f64,
    pub volatility: f64,
    pub volume_ratio: f64,
    /// Normalized trend/volatility regime score: positive favors a trending,
    /// leverageable market; negative marks chop; 0.0 is the neutral default.
    pub regime: f64,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
}

/// A candidate trade produced by the (out-of-scope) scanner (§3 Opportunity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub signal: Signal,
    pub confidence: f64,
    pub score: f64,
    pub indicators: IndicatorSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl Opportunity {
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.timestamp > max_age
    }
}

/// Process-wide risk bookkeeping snapshot (§3 RiskState). The live instance
/// lives behind locks in [`crate::risk::RiskEngine`]; this is the read-only
/// view handed to other components and logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskStateSnapshot {
    pub initial_balance: f64,
    pub peak_balance: f64,
    pub current_drawdown: f64,
    pub daily_pnl: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
}

/// Process-wide gateway bookkeeping snapshot (§3 GatewayState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStateSnapshot {
    pub last_clock_check: Option<DateTime<Utc>>,
    pub clock_drift_ms: i64,
    pub critical_in_flight: u32,
    pub last_api_call_at: Option<DateTime<Utc>>,
    pub cached_symbols: usize,
}

/// One completed trade outcome fed back to the risk engine (§4.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub net_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// Exchange-native ticker quote (§4.2 `get_ticker`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Account balance split into free and used margin (§4.2 `get_balance`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub used: f64,
}

/// Raw, exchange-native position view (§4.2 `fetch_positions`), distinct
/// from the engine's own [`crate::position::Position`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

/// Opaque exchange order acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub average_price: Option<f64>,
    pub filled_amount: f64,
}

pub type MetadataCache = HashMap<String, MarketMetadata>;
