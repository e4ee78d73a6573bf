// =============================================================================
// Candle Aggregator — folds ticks into fixed-width OHLCV slots
// =============================================================================
//
// slot = floor(timestamp / width) * width
//
// At most one bar is open at a time.  When a tick lands in a later slot the
// open bar is returned verbatim as the closed bar and never touched again.
// Ticks from earlier slots must be filtered by the caller.

use crate::types::Bar;

#[derive(Debug, Clone)]
pub struct CandleAggregator {
    width: i64,
    open: Option<Bar>,
}

impl CandleAggregator {
    /// `width` is the slot width in seconds (clamped to at least 1).
    pub fn new(width: i64) -> Self {
        Self {
            width: width.max(1),
            open: None,
        }
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    /// Start of the slot containing `timestamp`.
    pub fn slot_of(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.width) * self.width
    }

    /// Slot of the open bar, if any.
    pub fn open_slot(&self) -> Option<i64> {
        self.open.map(|b| b.time)
    }

    /// The open bar, if any.
    pub fn current(&self) -> Option<&Bar> {
        self.open.as_ref()
    }

    /// Make `bar` the open bar.
    pub fn seed(&mut self, bar: Bar) {
        self.open = Some(bar);
    }

    /// Fold one tick into the open bar. Returns `(closed, current)`.
    pub fn push_tick(&mut self, timestamp: i64, price: f64, volume: f64) -> (Option<Bar>, Bar) {
        let slot = self.slot_of(timestamp);

        match self.open.as_mut() {
            Some(bar) if slot == bar.time => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume += volume;
                (None, *bar)
            }
            Some(bar) if slot > bar.time => {
                let closed = *bar;
                *bar = Bar::flat(slot, price, volume);
                (Some(closed), *bar)
            }
            Some(bar) => {
                // Late tick that slipped past the caller: fold it into the open bar
                // rather than reopening an older slot.
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume += volume;
                (None, *bar)
            }
            None => {
                let bar = Bar::flat(slot, price, volume);
                self.open = Some(bar);
                (None, bar)
            }
        }
    }

    /// Close the open bar and open a fresh one at the slot of `timestamp`,
    /// without creating bars for any skipped slots.
    pub fn jump_to(&mut self, timestamp: i64, price: f64, volume: f64) -> (Option<Bar>, Bar) {
        let closed = self.open.take();
        let seed = Bar::flat(self.slot_of(timestamp), price, volume);
        self.seed(seed);
        (closed, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_tick_scenario() {
        let mut agg = CandleAggregator::new(60);

        let (closed, cur) = agg.push_tick(60, 1.1000, 0.0);
        assert!(closed.is_none());
        assert_eq!(cur, Bar::flat(60, 1.1000, 0.0));

        let (closed, cur) = agg.push_tick(95, 1.1010, 0.0);
        assert!(closed.is_none());
        assert_eq!(cur.time, 60);
        assert_eq!(cur.open, 1.1000);
        assert_eq!(cur.high, 1.1010);
        assert_eq!(cur.low, 1.1000);
        assert_eq!(cur.close, 1.1010);

        let (closed, cur) = agg.push_tick(130, 1.0995, 0.0);
        let closed = closed.unwrap();
        assert_eq!(closed.time, 60);
        assert_eq!(closed.open, 1.1000);
        assert_eq!(closed.high, 1.1010);
        assert_eq!(closed.low, 1.1000);
        assert_eq!(closed.close, 1.1010);
        assert_eq!(cur, Bar::flat(120, 1.0995, 0.0));
    }

    #[test]
    fn envelope_within_slot() {
        let mut agg = CandleAggregator::new(300);
        let prices = [10.0, 12.5, 9.75, 11.0, 11.0, 9.8, 12.4];
        let mut last = None;
        for (k, p) in prices.iter().enumerate() {
            let (closed, cur) = agg.push_tick(600 + k as i64 * 10, *p, 1.0);
            assert!(closed.is_none());
            last = Some(cur);
        }
        let bar = last.unwrap();
        assert_eq!(bar.high, 12.5);
        assert_eq!(bar.low, 9.75);
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.close, 12.4);
        assert_eq!(bar.volume, prices.len() as f64);
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
    }

    #[test]
    fn next_slot_closes_exactly_the_previous_state() {
        let mut agg = CandleAggregator::new(60);
        agg.seed(Bar {
            time: 120,
            open: 5.0,
            high: 6.0,
            low: 4.0,
            close: 5.5,
            volume: 7.0,
        });
        let before = *agg.current().unwrap();
        let (closed, cur) = agg.push_tick(185, 5.6, 2.0);
        assert_eq!(closed, Some(before));
        assert_eq!(cur, Bar::flat(180, 5.6, 2.0));
        assert_eq!(agg.open_slot(), Some(180));
    }

    #[test]
    fn jump_closes_and_reseeds_without_filler() {
        let mut agg = CandleAggregator::new(60);
        agg.push_tick(60, 1.0, 0.0);
        let (closed, seed) = agg.jump_to(400, 1.2, 3.0);
        assert_eq!(closed.map(|b| b.time), Some(60));
        assert_eq!(seed, Bar::flat(360, 1.2, 3.0));
        assert_eq!(agg.open_slot(), Some(360));
    }

    #[test]
    fn slot_of_handles_boundaries() {
        let agg = CandleAggregator::new(60);
        assert_eq!(agg.slot_of(119), 60);
        assert_eq!(agg.slot_of(120), 120);
        assert_eq!(agg.slot_of(0), 0);
    }
}
