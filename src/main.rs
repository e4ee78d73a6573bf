// =============================================================================
// Candlestream — Main Entry Point
// =============================================================================
//
// Streams one symbol/timeframe from the exchange, aggregates ticks into bars
// and maintains indicators plus signal markers.  Stdin accepts
// `<SYMBOL> [TIMEFRAME]` lines to switch the session; Ctrl+C stops it.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod error;
mod indicator_engine;
mod indicators;
mod market_data;
mod runtime_config;
mod signals;
mod streaming;
mod types;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceFeed;
use crate::runtime_config::RuntimeConfig;
use crate::streaming::{CoordinatorHandle, StreamEvent, StreamingCoordinator};
use crate::types::Timeframe;

const DEFAULT_CONFIG_PATH: &str = "candlestream.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candlestream starting up");

    let config_path =
        std::env::var("CANDLESTREAM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();

    info!(
        symbol = %config.stream.symbol,
        timeframe = %config.stream.timeframe,
        first_load_min_bars = config.stream.first_load_min_bars,
        first_load_timeout_ms = config.stream.first_load_timeout_ms,
        "Session configured"
    );

    // ── 2. Market feed ───────────────────────────────────────────────────
    let feed = Arc::new(BinanceFeed::new(std::env::var("BINANCE_BASE_URL").ok())?);

    // ── 3. Coordinator ───────────────────────────────────────────────────
    let default_timeframe = config.stream.timeframe;
    let (handle, mut events, task) = StreamingCoordinator::spawn(feed, config);

    // ── 4. Event consumer ────────────────────────────────────────────────
    let consumer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                StreamEvent::HistoryBatch(bars) => {
                    info!(
                        bars = bars.len(),
                        first = bars.first().map(|b| b.time),
                        last = bars.last().map(|b| b.time),
                        "history batch"
                    );
                }
                StreamEvent::BarUpdate(bar) => {
                    debug!(time = bar.time, close = bar.close, "bar update");
                }
                StreamEvent::IndicatorBatch(batch) => {
                    info!(
                        trend_rider = batch.markers.trend_rider.len(),
                        vol_breakout = batch.markers.vol_breakout.len(),
                        "indicator batch"
                    );
                }
                StreamEvent::IndicatorPatch(patch) => {
                    for marker in patch
                        .markers
                        .trend_rider
                        .iter()
                        .chain(patch.markers.vol_breakout.iter())
                    {
                        info!(
                            kind = %marker.kind,
                            direction = %marker.direction,
                            time = marker.time,
                            price = marker.price,
                            "signal"
                        );
                    }
                }
                StreamEvent::Snapshot(snapshot) => {
                    debug!(
                        rsi14 = ?snapshot.rsi14,
                        ema20 = ?snapshot.ema20,
                        macd_hist = ?snapshot.macd_hist,
                        "indicator snapshot"
                    );
                }
                StreamEvent::Finished(state) => {
                    info!(state = %state, "session finished");
                    break;
                }
            }
        }
    });

    // ── 5. Operator input ────────────────────────────────────────────────
    let control = handle.clone();
    tokio::spawn(async move {
        read_commands(control, default_timeframe).await;
    });

    info!("Streaming. Type `<SYMBOL> [TIMEFRAME]` to switch, Ctrl+C to stop.");

    // ── 6. Shutdown ──────────────────────────────────────────────────────
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, stopping gracefully");
                handle.shutdown();
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
        }
    });

    let state = task.await?;
    let _ = consumer.await;
    info!(state = %state, "Candlestream shut down complete.");
    Ok(())
}

/// Parse `<SYMBOL> [TIMEFRAME]` lines from stdin into parameter changes.
async fn read_commands(handle: CoordinatorHandle, default_timeframe: Timeframe) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut timeframe = default_timeframe;

    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        let Some(symbol) = parts.next() else {
            continue;
        };
        if let Some(raw) = parts.next() {
            match raw.parse::<Timeframe>() {
                Ok(tf) => timeframe = tf,
                Err(e) => {
                    warn!(error = %e, "ignoring command");
                    continue;
                }
            }
        }
        if handle.set_params(symbol.to_uppercase(), timeframe).is_err() {
            break;
        }
    }
}
