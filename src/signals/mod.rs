// =============================================================================
// Signals Module
// =============================================================================
//
// Rule-based trade markers evaluated per bar index:
// - Trend Rider (EMA stack + MACD momentum + RSI cross through 50)
// - Volatility Breakout (Bollinger squeeze followed by a band break)
// plus the bounded marker ring and cooldown cursor shared by both.

pub mod marker_ring;
pub mod trend_rider;
pub mod vol_breakout;

pub use marker_ring::{CooldownCursor, MarkerRing};

use crate::indicators::BollingerPoint;

/// Borrowed, index-aligned view of the series the rules read.
#[derive(Debug, Clone, Copy)]
pub struct SignalInputs<'a> {
    pub closes: &'a [f64],
    pub ema: &'a [Option<f64>],
    pub ema_long: &'a [Option<f64>],
    pub rsi: &'a [Option<f64>],
    pub macd_hist: &'a [Option<f64>],
    pub bands: &'a [Option<BollingerPoint>],
}

pub(crate) fn at(series: &[Option<f64>], i: usize) -> Option<f64> {
    series.get(i).copied().flatten()
}
