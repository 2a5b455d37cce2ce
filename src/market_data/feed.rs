//! Websocket market data feed (C2), connected to KuCoin Futures' public
//! channel.
//!
//! The engine's three workers (§4.7) run on plain OS threads with no
//! cooperative scheduler, but the websocket reader is naturally
//! stream-shaped, so — grounded in `Zuytan-rustrade`'s `main.rs`, which
//! spawns `std::thread::spawn(move || { let rt = tokio::runtime::Builder
//! ::new_multi_thread()...; rt.block_on(...) })` to run an async subsystem
//! inside an otherwise thread-based program — this feed owns a private
//! Tokio runtime on its own dedicated thread. No other component depends on
//! async; the rest of the engine blocks freely.

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::gateway::client::Gateway;

const SUBSCRIBE_RETRY_ATTEMPTS: u32 = 3;
const SUBSCRIBE_RETRY_SPACING: Duration = Duration::from_secs(1);
const ERROR_DEDUP_WINDOW: Duration = Duration::from_secs(60);
const MAX_RECONNECT_DELAY_SECS: u64 = 300;
const STALE_THRESHOLD: Duration = Duration::from_secs(2);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct PriceUpdate {
    pub price: f64,
    pub received_at: Instant,
}

struct ErrorDeduper {
    last_message: Option<String>,
    window_start: Instant,
    repeat_count: u32,
}

impl ErrorDeduper {
    fn new() -> Self {
        Self { last_message: None, window_start: Instant::now(), repeat_count: 0 }
    }

    /// Returns text to log, or `None` if this message was coalesced into
    /// the running repeat count for the current 60s window.
    fn observe(&mut self, message: &str) -> Option<String> {
        let same = self.last_message.as_deref() == Some(message);
        let within_window = self.window_start.elapsed() < ERROR_DEDUP_WINDOW;

        if same && within_window {
            self.repeat_count += 1;
            return None;
        }

        let carryover = if self.repeat_count > 0 {
            Some(format!("previous error repeated {} times", self.repeat_count))
        } else {
            None
        };
        self.last_message = Some(message.to_string());
        self.window_start = Instant::now();
        self.repeat_count = 0;
        carryover.or_else(|| Some(message.to_string()))
    }
}

/// §4.3 reconnect backoff: `min(5 * 2^(n-1), 300)` seconds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    Duration::from_secs(secs.min(MAX_RECONNECT_DELAY_SECS))
}

/// Shared, thread-safe view of the latest price per symbol, written by the
/// feed thread and read by any consumer (position monitor, orchestrator).
#[derive(Clone, Default)]
pub struct PriceBoard {
    prices: Arc<RwLock<HashMap<String, PriceUpdate>>>,
}

impl PriceBoard {
    pub fn set(&self, symbol: &str, price: f64) {
        self.prices
            .write()
            .insert(symbol.to_string(), PriceUpdate { price, received_at: Instant::now() });
    }

    pub fn get(&self, symbol: &str) -> Option<PriceUpdate> {
        self.prices.read().get(symbol).copied()
    }

    /// Whether fresh data exists for `symbol` within spec's 2s staleness
    /// window; if not the caller should fall back to REST via the Gateway.
    pub fn is_fresh(&self, symbol: &str) -> bool {
        match self.get(symbol) {
            Some(update) => update.received_at.elapsed() < STALE_THRESHOLD,
            None => false,
        }
    }
}

pub struct MarketDataFeed {
    gateway: Arc<Gateway>,
    symbols: Vec<String>,
    board: PriceBoard,
    cancelled: Arc<AtomicBool>,
}

impl MarketDataFeed {
    pub fn new(gateway: Arc<Gateway>, symbols: Vec<String>, cancelled: Arc<AtomicBool>) -> Self {
        Self { gateway, symbols, board: PriceBoard::default(), cancelled }
    }

    pub fn board(&self) -> PriceBoard {
        self.board.clone()
    }

    /// Spawns the feed's dedicated thread and private Tokio runtime.
    /// Returns the `JoinHandle`; the thread exits once `cancelled` is set.
    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .expect("failed to build market data feed runtime");
            rt.block_on(self.run());
        })
    }

    async fn run(&self) {
        let mut attempt: u32 = 0;
        let mut deduper = ErrorDeduper::new();

        while !self.cancelled.load(Ordering::SeqCst) {
            match self.connect_and_stream(&mut deduper).await {
                Ok(()) => attempt = 0,
                Err(e) => {
                    attempt += 1;
                    let delay = reconnect_delay(attempt);
                    warn!(attempt, ?delay, error = %e, "market data feed disconnected, reconnecting");
                    let deadline = Instant::now() + delay;
                    while Instant::now() < deadline && !self.cancelled.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
        info!("market data feed thread stopping");
    }

    async fn connect_and_stream(&self, deduper: &mut ErrorDeduper) -> anyhow::Result<()> {
        // Bullet-token negotiation (§4.3): fetched fresh per connect attempt
        // since the token is short-lived and single-use.
        let gateway = self.gateway.clone();
        let ws_info = tokio::task::spawn_blocking(move || gateway.get_ws_token()).await??;
        let ping_interval = Duration::from_millis(ws_info.ping_interval_ms.max(1000));

        let (mut socket, _) = connect_async(ws_info.url.as_str()).await?;
        self.subscribe_with_retry(&mut socket).await?;

        let mut last_ping = Instant::now();
        let mut last_pong = Instant::now();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            if last_ping.elapsed() >= ping_interval {
                socket.send(Message::Ping(vec![])).await?;
                last_ping = Instant::now();
            }
            if last_pong.elapsed() > ping_interval + PONG_TIMEOUT {
                anyhow::bail!("pong timeout, forcing reconnect");
            }

            let next = tokio::time::timeout(Duration::from_millis(500), socket.next()).await;
            let msg = match next {
                Ok(Some(m)) => m?,
                Ok(None) => anyhow::bail!("exchange closed the connection"),
                Err(_) => continue, // read timeout, loop back to check ping/cancel
            };

            match msg {
                Message::Text(text) => self.handle_message(&text, deduper),
                Message::Pong(_) => last_pong = Instant::now(),
                Message::Close(_) => anyhow::bail!("exchange sent close frame"),
                _ => {}
            }
        }
    }

    async fn subscribe_with_retry(
        &self,
        socket: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> anyhow::Result<()> {
        for symbol in &self.symbols {
            let frame = json!({
                "type": "subscribe",
                "topic": format!("/contractMarket/ticker:{symbol}"),
                "privateChannel": false,
                "response": true,
            });

            let mut sent = false;
            for attempt in 1..=SUBSCRIBE_RETRY_ATTEMPTS {
                match socket.send(Message::Text(frame.to_string())).await {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(e) if attempt < SUBSCRIBE_RETRY_ATTEMPTS => {
                        warn!(symbol, attempt, error = %e, "subscribe attempt failed, retrying");
                        tokio::time::sleep(SUBSCRIBE_RETRY_SPACING).await;
                    }
                    Err(e) => {
                        error!(symbol, error = %e, "subscribe failed after all retries");
                    }
                }
            }
            if !sent {
                anyhow::bail!("failed to subscribe to {symbol}");
            }
        }
        Ok(())
    }

    fn handle_message(&self, text: &str, deduper: &mut ErrorDeduper) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("error") => {
                let code = value.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                let topic = value.get("topic").and_then(|t| t.as_str()).unwrap_or("");
                let message = value.get("data").and_then(|d| d.as_str()).unwrap_or("");
                let summary = format!("ws error code={code} topic={topic} message={message}");
                if let Some(line) = deduper.observe(&summary) {
                    warn!("{line}");
                }
            }
            Some("message") => {
                if let (Some(symbol), Some(price)) = (
                    value["topic"]
                        .as_str()
                        .and_then(|t| t.rsplit(':').next())
                        .map(|s| s.to_string()),
                    value["data"]["price"].as_str().and_then(|s| s.parse::<f64>().ok()),
                ) {
                    self.board.set(&symbol, price);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_then_clamps_at_300() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(5));
        assert_eq!(reconnect_delay(2), Duration::from_secs(10));
        assert_eq!(reconnect_delay(3), Duration::from_secs(20));
        assert_eq!(reconnect_delay(10), Duration::from_secs(300));
    }

    #[test]
    fn price_board_reports_freshness_within_2s() {
        let board = PriceBoard::default();
        board.set("BTCUSDT", 50_000.0);
        assert!(board.is_fresh("BTCUSDT"));
        assert!(!board.is_fresh("ETHUSDT"));
    }

    #[test]
    fn error_deduper_coalesces_identical_messages_within_window() {
        let mut d = ErrorDeduper::new();
        assert!(d.observe("boom").is_some());
        assert!(d.observe("boom").is_none());
        assert!(d.observe("boom").is_none());
        let next = d.observe("different");
        assert_eq!(next.as_deref(), Some("previous error repeated 2 times"));
    }
}
