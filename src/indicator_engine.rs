// =============================================================================
// Indicator Engine — batch and incremental indicator maintenance
// =============================================================================
//
// Owns the working bar history and every derived series:
//   EMA(20), EMA(100), RSI(14), MACD(12,26,9), Bollinger(20, 2σ)
// plus the Trend Rider and Volatility Breakout marker rings.
//
// Two entry points must agree:
//   set_history(bars): wholesale rebuild, then replay every signal rule.
//   on_bar(bar):       same-slot replace or append, rules at the newest index.
//
// EMA / RSI / MACD are recomputed over the full close series on every bar.
// Bollinger keeps running moments (see `indicators::bollinger`) whose update
// path performs the same float operations as a rebuild, so both modes are
// bit-identical.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::indicators::{
    ema_series, last_defined, macd_series, rsi_series, BollingerPoint, BollingerTracker,
    MacdSeries,
};
use crate::runtime_config::IndicatorParams;
use crate::signals::{trend_rider, vol_breakout, CooldownCursor, MarkerRing, SignalInputs};
use crate::types::{Bar, Marker, MarkerKind};

// =============================================================================
// Output shapes
// =============================================================================

/// A defined value of a series at a bar time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinePoint {
    pub time: i64,
    pub value: f64,
}

/// A possibly-undefined value at a bar time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub time: i64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MacdLines {
    pub line: Vec<LinePoint>,
    pub signal: Vec<LinePoint>,
    pub hist: Vec<LinePoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandLines {
    pub mid: Vec<LinePoint>,
    pub upper: Vec<LinePoint>,
    pub lower: Vec<LinePoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerSet {
    pub trend_rider: Vec<Marker>,
    pub vol_breakout: Vec<Marker>,
}

impl MarkerSet {
    pub fn is_empty(&self) -> bool {
        self.trend_rider.is_empty() && self.vol_breakout.is_empty()
    }
}

/// Full indicator state, emitted after every `set_history`. Undefined entries
/// are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndicatorBatch {
    pub ema20: Vec<LinePoint>,
    pub ema100: Vec<LinePoint>,
    pub rsi14: Vec<LinePoint>,
    pub macd: MacdLines,
    pub bollinger: BandLines,
    pub markers: MarkerSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdPoint {
    pub time: i64,
    pub macd: Option<f64>,
    pub signal: Option<f64>,
    pub hist: Option<f64>,
}

/// Values at the newest bar plus markers fired by it, emitted per `on_bar`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorPatch {
    pub ema20: SeriesPoint,
    pub rsi14: SeriesPoint,
    pub macd: MacdPoint,
    pub markers: MarkerSet,
}

/// Latest defined values, used for assistant context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub rsi14: Option<f64>,
    pub ema20: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
}

// =============================================================================
// IndicatorEngine
// =============================================================================

pub struct IndicatorEngine {
    params: IndicatorParams,
    bars: Vec<Bar>,
    closes: Vec<f64>,
    ema: Vec<Option<f64>>,
    ema_long: Vec<Option<f64>>,
    rsi: Vec<Option<f64>>,
    macd: MacdSeries,
    bollinger: BollingerTracker,
    trend_markers: MarkerRing,
    breakout_markers: MarkerRing,
    trend_cooldown: CooldownCursor,
    breakout_cooldown: CooldownCursor,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams) -> Self {
        Self {
            bars: Vec::new(),
            closes: Vec::new(),
            ema: Vec::new(),
            ema_long: Vec::new(),
            rsi: Vec::new(),
            macd: MacdSeries::default(),
            bollinger: BollingerTracker::new(params.bollinger_period, params.bollinger_deviation),
            trend_markers: MarkerRing::new(params.marker_capacity),
            breakout_markers: MarkerRing::new(params.marker_capacity),
            trend_cooldown: CooldownCursor::new(params.tr_cooldown),
            breakout_cooldown: CooldownCursor::new(params.vbo_cooldown),
            params,
        }
    }

    /// Replace the working history and rebuild every series and marker ring.
    ///
    /// Bars are expected in ascending time order; a bar whose time is not
    /// after its predecessor replaces it (duplicate) or is dropped (older).
    pub fn set_history(&mut self, bars: &[Bar]) {
        self.bars.clear();
        for bar in bars {
            match self.bars.last().map(|b| b.time) {
                Some(last) if last == bar.time => {
                    let i = self.bars.len() - 1;
                    self.bars[i] = *bar;
                }
                Some(last) if last > bar.time => {
                    debug!(time = bar.time, last, "dropping out-of-order history bar");
                }
                _ => self.bars.push(*bar),
            }
        }
        self.closes = self.bars.iter().map(|b| b.close).collect();

        self.recompute_full_series();
        self.bollinger.rebuild(&self.closes);

        self.trend_markers.clear();
        self.breakout_markers.clear();
        self.trend_cooldown.reset();
        self.breakout_cooldown.reset();
        for i in 1..self.bars.len() {
            self.evaluate_rules(i);
        }

        debug!(
            bars = self.bars.len(),
            trend_markers = self.trend_markers.len(),
            breakout_markers = self.breakout_markers.len(),
            "indicator history rebuilt"
        );
    }

    /// Apply one bar from the live stream.
    ///
    /// Returns `None` (and changes nothing) when the bar is older than the
    /// last known bar.
    pub fn on_bar(&mut self, bar: Bar) -> Option<IndicatorPatch> {
        match self.bars.last().map(|b| b.time) {
            Some(last) if bar.time < last => {
                debug!(time = bar.time, last, "ignoring stale bar");
                return None;
            }
            Some(last) if bar.time == last => {
                let i = self.bars.len() - 1;
                self.bars[i] = bar;
                self.closes[i] = bar.close;
                self.bollinger.replace_last(&self.closes);
            }
            _ => {
                self.bars.push(bar);
                self.closes.push(bar.close);
                self.bollinger.push(&self.closes);
            }
        }

        self.recompute_full_series();

        let i = self.bars.len() - 1;
        let markers = if i >= 1 {
            self.evaluate_rules(i)
        } else {
            MarkerSet::default()
        };

        Some(IndicatorPatch {
            ema20: SeriesPoint {
                time: bar.time,
                value: self.ema[i],
            },
            rsi14: SeriesPoint {
                time: bar.time,
                value: self.rsi[i],
            },
            macd: MacdPoint {
                time: bar.time,
                macd: self.macd.line[i],
                signal: self.macd.signal[i],
                hist: self.macd.hist[i],
            },
            markers,
        })
    }

    /// Every defined point of every series, plus both marker rings.
    pub fn batch(&self) -> IndicatorBatch {
        let bands = self.bollinger.points();
        let band_line = |pick: fn(&BollingerPoint) -> f64| {
            self.bars
                .iter()
                .zip(bands)
                .filter_map(|(bar, p)| {
                    p.as_ref().map(|p| LinePoint {
                        time: bar.time,
                        value: pick(p),
                    })
                })
                .collect::<Vec<_>>()
        };

        IndicatorBatch {
            ema20: self.line(&self.ema),
            ema100: self.line(&self.ema_long),
            rsi14: self.line(&self.rsi),
            macd: MacdLines {
                line: self.line(&self.macd.line),
                signal: self.line(&self.macd.signal),
                hist: self.line(&self.macd.hist),
            },
            bollinger: BandLines {
                mid: band_line(|p| p.mid),
                upper: band_line(|p| p.upper),
                lower: band_line(|p| p.lower),
            },
            markers: MarkerSet {
                trend_rider: self.trend_markers.to_vec(),
                vol_breakout: self.breakout_markers.to_vec(),
            },
        }
    }

    pub fn latest_snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi14: last_defined(&self.rsi),
            ema20: last_defined(&self.ema),
            macd: last_defined(&self.macd.line),
            macd_signal: last_defined(&self.macd.signal),
            macd_hist: last_defined(&self.macd.hist),
        }
    }

    #[cfg(test)]
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn recompute_full_series(&mut self) {
        let p = &self.params;
        self.ema = ema_series(&self.closes, p.ema_period);
        self.ema_long = ema_series(&self.closes, p.ema_long_period);
        self.rsi = rsi_series(&self.closes, p.rsi_period);
        self.macd = macd_series(&self.closes, p.macd_fast, p.macd_slow, p.macd_signal);
    }

    /// Run both rules at bar `i`, record fired markers, return them.
    fn evaluate_rules(&mut self, i: usize) -> MarkerSet {
        let (trend, breakout) = {
            let inputs = SignalInputs {
                closes: &self.closes,
                ema: &self.ema,
                ema_long: &self.ema_long,
                rsi: &self.rsi,
                macd_hist: &self.macd.hist,
                bands: self.bollinger.points(),
            };
            (
                trend_rider::evaluate(&inputs, i),
                vol_breakout::evaluate(&inputs, i, &self.params),
            )
        };

        let mut fired = MarkerSet::default();
        let bar = self.bars[i];

        if let Some(direction) = trend {
            if self.trend_cooldown.ready(i) {
                let marker = Marker {
                    time: bar.time,
                    price: bar.close,
                    direction,
                    kind: MarkerKind::TrendRider,
                };
                self.trend_cooldown.mark(i);
                self.trend_markers.push(marker);
                fired.trend_rider.push(marker);
                debug!(time = bar.time, %direction, "trend rider marker");
            }
        }

        if let Some(direction) = breakout {
            if self.breakout_cooldown.ready(i) {
                let marker = Marker {
                    time: bar.time,
                    price: bar.close,
                    direction,
                    kind: MarkerKind::VolBreakout,
                };
                self.breakout_cooldown.mark(i);
                self.breakout_markers.push(marker);
                fired.vol_breakout.push(marker);
                debug!(time = bar.time, %direction, "volatility breakout marker");
            }
        }

        fired
    }

    fn line(&self, series: &[Option<f64>]) -> Vec<LinePoint> {
        self.bars
            .iter()
            .zip(series)
            .filter_map(|(bar, v)| v.map(|value| LinePoint { time: bar.time, value }))
            .collect()
    }
}
