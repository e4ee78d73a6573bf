// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free series computations.  Every series is index-aligned
// with its input closes and uses `None` for "not enough data yet", so callers
// are forced to handle insufficient-data scenarios instead of reading zeros.

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

pub use bollinger::{BollingerPoint, BollingerTracker};
pub use ema::ema_series;
pub use macd::{macd_series, MacdSeries};
pub use rsi::rsi_series;

/// Most recent defined value of a series, scanning backward past `None`s.
pub fn last_defined(series: &[Option<f64>]) -> Option<f64> {
    series.iter().rev().find_map(|v| *v)
}
