// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
//   line   = EMA(fast) - EMA(slow)           (where both are defined)
//   signal = EMA(signal_period) of the line   (undefined line entries count as 0)
//   hist   = line - signal
// =============================================================================

use super::ema::ema_series;

/// The three MACD series, index-aligned with the closes they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacdSeries {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub hist: Vec<Option<f64>>,
}

pub fn macd_series(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);

    let line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let zero_filled: Vec<f64> = line.iter().map(|m| m.unwrap_or(0.0)).collect();
    let signal = ema_series(&zero_filled, signal_period);

    let hist = line
        .iter()
        .zip(&signal)
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    MacdSeries { line, signal, hist }
}
