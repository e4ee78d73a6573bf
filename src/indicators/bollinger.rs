// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ). The Band Width is the normalised distance:
// width = (upper - lower) / middle.
//
// σ is the population standard deviation of the trailing window, derived from
// a running sum and sum-of-squares so each new bar costs O(1).
//
// The tracker keeps two copies of the running moments: `committed` covers
// every bar except the last, `tip` includes it.  An in-place update of the
// last bar restarts from `committed`, which performs exactly the same float
// operations as a rebuild from scratch.

/// Band values at one index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerPoint {
    pub mid: f64,
    pub upper: f64,
    pub lower: f64,
    /// `None` when the middle band is zero.
    pub width: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RollingMoments {
    sum: f64,
    sum_sq: f64,
}

impl RollingMoments {
    /// Moments after admitting `closes[i]` and evicting `closes[i - period]`.
    fn step(self, closes: &[f64], i: usize, period: usize) -> Self {
        let c = closes[i];
        let mut sum = self.sum + c;
        let mut sum_sq = self.sum_sq + c * c;
        if i >= period {
            let old = closes[i - period];
            sum -= old;
            sum_sq -= old * old;
        }
        Self { sum, sum_sq }
    }
}

/// Incrementally maintained Bollinger series, index-aligned with the closes.
#[derive(Debug, Clone)]
pub struct BollingerTracker {
    period: usize,
    num_std: f64,
    committed: RollingMoments,
    tip: RollingMoments,
    points: Vec<Option<BollingerPoint>>,
}

impl BollingerTracker {
    pub fn new(period: usize, num_std: f64) -> Self {
        Self {
            period,
            num_std,
            committed: RollingMoments::default(),
            tip: RollingMoments::default(),
            points: Vec::new(),
        }
    }

    /// Discard all state and recompute over `closes`.
    pub fn rebuild(&mut self, closes: &[f64]) {
        self.committed = RollingMoments::default();
        self.tip = RollingMoments::default();
        self.points.clear();
        for len in 1..=closes.len() {
            self.push(&closes[..len]);
        }
    }

    /// Account for a newly appended close (`closes.last()`).
    pub fn push(&mut self, closes: &[f64]) {
        debug_assert_eq!(closes.len(), self.points.len() + 1);
        let i = closes.len() - 1;
        if self.period == 0 {
            self.points.push(None);
            return;
        }
        self.committed = self.tip;
        self.tip = self.committed.step(closes, i, self.period);
        self.points.push(self.point_at(i));
    }

    /// Account for an in-place change of the last close.
    pub fn replace_last(&mut self, closes: &[f64]) {
        debug_assert_eq!(closes.len(), self.points.len());
        let Some(i) = closes.len().checked_sub(1) else {
            return;
        };
        if self.period == 0 {
            return;
        }
        self.tip = self.committed.step(closes, i, self.period);
        self.points[i] = self.point_at(i);
    }

    pub fn points(&self) -> &[Option<BollingerPoint>] {
        &self.points
    }

    #[cfg(test)]
    pub fn get(&self, i: usize) -> Option<BollingerPoint> {
        self.points.get(i).copied().flatten()
    }

    fn point_at(&self, i: usize) -> Option<BollingerPoint> {
        if i + 1 < self.period {
            return None;
        }
        let n = self.period as f64;
        let mid = self.tip.sum / n;
        let variance = (self.tip.sum_sq / n - mid * mid).max(0.0);
        let std_dev = variance.sqrt();

        let upper = mid + self.num_std * std_dev;
        let lower = mid - self.num_std * std_dev;
        if !(mid.is_finite() && upper.is_finite() && lower.is_finite()) {
            return None;
        }

        let width = if mid == 0.0 {
            None
        } else {
            Some((upper - lower) / mid).filter(|w| w.is_finite())
        };

        Some(BollingerPoint {
            mid,
            upper,
            lower,
            width,
        })
    }
}
