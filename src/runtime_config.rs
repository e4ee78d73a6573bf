// =============================================================================
// Runtime Configuration — immutable engine settings
// =============================================================================
//
// Every tunable of the pipeline lives here and is handed to each component at
// construction, so two sessions never share ambient state.
//
// Loading order: built-in defaults, then an optional JSON file, then
// environment variables.  All fields carry `#[serde(default)]` so that a
// partial file never breaks loading.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_first_load_min_bars() -> usize {
    120
}

fn default_first_load_timeout_ms() -> u64 {
    2_500
}

fn default_history_lookback_days() -> u32 {
    60
}

fn default_history_depth() -> usize {
    5_000
}

fn default_history_retry_limit() -> u32 {
    6
}

fn default_history_retry_backoff_ms() -> u64 {
    1_200
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_spike_threshold() -> f64 {
    0.05
}

fn default_stale_slots() -> i64 {
    3
}

fn default_ema_period() -> usize {
    20
}

fn default_ema_long_period() -> usize {
    100
}

fn default_rsi_period() -> usize {
    14
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_bollinger_period() -> usize {
    20
}

fn default_bollinger_deviation() -> f64 {
    2.0
}

fn default_tr_cooldown() -> usize {
    20
}

fn default_vbo_cooldown() -> usize {
    10
}

fn default_marker_capacity() -> usize {
    600
}

fn default_squeeze_lookback() -> usize {
    50
}

fn default_squeeze_ratio() -> f64 {
    0.6
}

fn default_squeeze_fallback_ratio() -> f64 {
    0.9
}

// =============================================================================
// StreamParams
// =============================================================================

/// Settings of the streaming coordinator (feed polling, history, first load).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default)]
    pub timeframe: Timeframe,

    /// Bars to accumulate before the one-time initial batch is released.
    #[serde(default = "default_first_load_min_bars")]
    pub first_load_min_bars: usize,

    /// Upper bound on the initial buffering, in milliseconds. 0 disables the timer.
    #[serde(default = "default_first_load_timeout_ms")]
    pub first_load_timeout_ms: u64,

    /// Width of the time-ranged history request.
    #[serde(default = "default_history_lookback_days")]
    pub history_lookback_days: u32,

    /// Cap on the fixed-depth fallback request.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    #[serde(default = "default_history_retry_limit")]
    pub history_retry_limit: u32,

    #[serde(default = "default_history_retry_backoff_ms")]
    pub history_retry_backoff_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum relative deviation of a tick from the open bar's close.
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: f64,

    /// History whose last bar is more than this many slots old is refetched.
    #[serde(default = "default_stale_slots")]
    pub stale_slots: i64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: Timeframe::default(),
            first_load_min_bars: default_first_load_min_bars(),
            first_load_timeout_ms: default_first_load_timeout_ms(),
            history_lookback_days: default_history_lookback_days(),
            history_depth: default_history_depth(),
            history_retry_limit: default_history_retry_limit(),
            history_retry_backoff_ms: default_history_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            spike_threshold: default_spike_threshold(),
            stale_slots: default_stale_slots(),
        }
    }
}

impl StreamParams {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn first_load_timeout(&self) -> Duration {
        Duration::from_millis(self.first_load_timeout_ms)
    }

    pub fn history_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.history_retry_backoff_ms)
    }

    /// Bar count for the fixed-depth fallback:
    /// `max(200, min(depth, lookback_days * 86400 / width + 500))`.
    pub fn fallback_depth(&self) -> usize {
        let width = self.timeframe.seconds().max(1) as u64;
        let estimated = (u64::from(self.history_lookback_days) * 86_400 / width + 500) as usize;
        estimated.min(self.history_depth).max(200)
    }
}

// =============================================================================
// IndicatorParams
// =============================================================================

/// Periods, cooldowns and caps of the indicator engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    #[serde(default = "default_ema_period")]
    pub ema_period: usize,

    #[serde(default = "default_ema_long_period")]
    pub ema_long_period: usize,

    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,

    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,

    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,

    #[serde(default = "default_bollinger_period")]
    pub bollinger_period: usize,

    /// Band distance in standard deviations.
    #[serde(default = "default_bollinger_deviation")]
    pub bollinger_deviation: f64,

    /// Minimum bar distance between two Trend Rider markers (either direction).
    #[serde(default = "default_tr_cooldown")]
    pub tr_cooldown: usize,

    /// Minimum bar distance between two Volatility Breakout markers.
    #[serde(default = "default_vbo_cooldown")]
    pub vbo_cooldown: usize,

    /// Retained markers per kind.
    #[serde(default = "default_marker_capacity")]
    pub marker_capacity: usize,

    /// Trailing window of band widths used for the squeeze reference.
    #[serde(default = "default_squeeze_lookback")]
    pub squeeze_lookback: usize,

    #[serde(default = "default_squeeze_ratio")]
    pub squeeze_ratio: f64,

    /// Ratio applied to the current width when the trailing window is short.
    #[serde(default = "default_squeeze_fallback_ratio")]
    pub squeeze_fallback_ratio: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            ema_period: default_ema_period(),
            ema_long_period: default_ema_long_period(),
            rsi_period: default_rsi_period(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            bollinger_period: default_bollinger_period(),
            bollinger_deviation: default_bollinger_deviation(),
            tr_cooldown: default_tr_cooldown(),
            vbo_cooldown: default_vbo_cooldown(),
            marker_capacity: default_marker_capacity(),
            squeeze_lookback: default_squeeze_lookback(),
            squeeze_ratio: default_squeeze_ratio(),
            squeeze_fallback_ratio: default_squeeze_fallback_ratio(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration of one symbol/timeframe session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub stream: StreamParams,

    #[serde(default)]
    pub indicators: IndicatorParams,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.stream.symbol,
            timeframe = %config.stream.timeframe,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any `key -> value` lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbol) = lookup("DEFAULT_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.stream.symbol = symbol;
            }
        }
        override_parsed(&lookup, "DEFAULT_TIMEFRAME", &mut self.stream.timeframe);
        override_parsed(&lookup, "FIRST_LOAD_MIN_BARS", &mut self.stream.first_load_min_bars);
        override_parsed(&lookup, "FIRST_LOAD_TIMEOUT_MS", &mut self.stream.first_load_timeout_ms);
        override_parsed(&lookup, "HISTORY_LOOKBACK_DAYS", &mut self.stream.history_lookback_days);
        override_parsed(&lookup, "INITIAL_HISTORY_BARS", &mut self.stream.history_depth);
        override_parsed(&lookup, "HISTORY_RETRY_LIMIT", &mut self.stream.history_retry_limit);
        override_parsed(&lookup, "POLL_INTERVAL_MS", &mut self.stream.poll_interval_ms);
        override_parsed(&lookup, "TR_COOLDOWN_BARS", &mut self.indicators.tr_cooldown);
        override_parsed(&lookup, "VBO_COOLDOWN_BARS", &mut self.indicators.vbo_cooldown);
        override_parsed(&lookup, "BOLLINGER_PERIOD", &mut self.indicators.bollinger_period);
        override_parsed(&lookup, "BOLLINGER_DEVIATION", &mut self.indicators.bollinger_deviation);
        override_parsed(&lookup, "MARKER_CAPACITY", &mut self.indicators.marker_capacity);
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable config override"),
    }
}
