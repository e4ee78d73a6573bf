// =============================================================================
// Volatility Breakout — band break out of a Bollinger squeeze
// =============================================================================
//
// Squeeze at bar i: width[i] < squeeze_ratio * mean(width over the trailing
// `squeeze_lookback` bars ending at i).  When that window is not fully
// defined the reference falls back to `squeeze_fallback_ratio * width[i]`,
// which a positive width can never be below, so no breakout fires until the
// trailing window exists.
//
// Given a squeeze:
//   up   when close[i] > upper[i] and close[i-1] <= upper[i-1]
//   down when close[i] < lower[i] and close[i-1] >= lower[i-1]

use super::SignalInputs;
use crate::indicators::BollingerPoint;
use crate::runtime_config::IndicatorParams;
use crate::types::Direction;

pub fn in_squeeze(bands: &[Option<BollingerPoint>], i: usize, params: &IndicatorParams) -> bool {
    let Some(width) = bands.get(i).copied().flatten().and_then(|b| b.width) else {
        return false;
    };

    let lookback = params.squeeze_lookback;
    let trailing_mean = if lookback > 0 && i + 1 >= lookback {
        let widths: Vec<f64> = bands[i + 1 - lookback..=i]
            .iter()
            .filter_map(|b| b.and_then(|b| b.width))
            .collect();
        (widths.len() == lookback).then(|| widths.iter().sum::<f64>() / lookback as f64)
    } else {
        None
    };

    let threshold = match trailing_mean {
        Some(mean) => params.squeeze_ratio * mean,
        None => params.squeeze_fallback_ratio * width,
    };

    width < threshold
}

pub fn evaluate(
    inputs: &SignalInputs<'_>,
    i: usize,
    params: &IndicatorParams,
) -> Option<Direction> {
    if i < 1 || !in_squeeze(inputs.bands, i, params) {
        return None;
    }

    let band = inputs.bands.get(i).copied().flatten()?;
    let prev_band = inputs.bands.get(i - 1).copied().flatten()?;
    let close = *inputs.closes.get(i)?;
    let prev_close = *inputs.closes.get(i - 1)?;

    if close > band.upper && prev_close <= prev_band.upper {
        Some(Direction::Up)
    } else if close < band.lower && prev_close >= prev_band.lower {
        Some(Direction::Down)
    } else {
        None
    }
}
