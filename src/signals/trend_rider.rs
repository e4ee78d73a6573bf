// =============================================================================
// Trend Rider — momentum continuation arrows
// =============================================================================
//
// Buy at bar i when all of:
//   close[i] > EMA[i] > EMA_long[i]
//   EMA[i] > EMA[i-3]                      (short EMA rising over 3 bars)
//   hist[i] > 0 and hist[i] >= hist[i-1]   (MACD momentum building)
//   RSI[i-1] <= 48 and RSI[i] >= 52        (RSI crossing up through 50)
//
// Sell mirrors every condition.  Cooldown is applied by the caller.

use super::{at, SignalInputs};
use crate::types::Direction;

const RSI_CROSS_LOW: f64 = 48.0;
const RSI_CROSS_HIGH: f64 = 52.0;
const EMA_SLOPE_LOOKBACK: usize = 3;

pub fn evaluate(inputs: &SignalInputs<'_>, i: usize) -> Option<Direction> {
    if i < EMA_SLOPE_LOOKBACK {
        return None;
    }

    let close = *inputs.closes.get(i)?;
    let ema = at(inputs.ema, i)?;
    let ema_back = at(inputs.ema, i - EMA_SLOPE_LOOKBACK)?;
    let ema_long = at(inputs.ema_long, i)?;
    let hist = at(inputs.macd_hist, i)?;
    let hist_prev = at(inputs.macd_hist, i - 1)?;
    let rsi = at(inputs.rsi, i)?;
    let rsi_prev = at(inputs.rsi, i - 1)?;

    let buy = close > ema
        && ema > ema_long
        && ema > ema_back
        && hist > 0.0
        && hist >= hist_prev
        && rsi_prev <= RSI_CROSS_LOW
        && rsi >= RSI_CROSS_HIGH;
    if buy {
        return Some(Direction::Up);
    }

    let sell = close < ema
        && ema < ema_long
        && ema < ema_back
        && hist < 0.0
        && hist <= hist_prev
        && rsi_prev >= RSI_CROSS_HIGH
        && rsi <= RSI_CROSS_LOW;
    if sell {
        return Some(Direction::Down);
    }

    None
}
