// =============================================================================
// Tick Guard — per-tick validation ahead of the aggregator
// =============================================================================
//
// Checks, in order:
//   1. price must be positive (and finite)
//   2. |price - open_close| / open_close <= spike_threshold
//   3. slot must not be earlier than the aggregator's open slot
//   4. timestamp must differ from the previously accepted tick
//
// Rejections are not errors: the caller logs them at debug level and moves on.

use crate::error::TickRejection;
use crate::market_data::CandleAggregator;
use crate::types::Tick;

#[derive(Debug, Clone)]
pub struct TickGuard {
    spike_threshold: f64,
    last_accepted: Option<i64>,
}

impl TickGuard {
    pub fn new(spike_threshold: f64) -> Self {
        Self {
            spike_threshold,
            last_accepted: None,
        }
    }

    pub fn check(&self, tick: &Tick, aggregator: &CandleAggregator) -> Result<(), TickRejection> {
        let price = tick.price;
        if !(price > 0.0 && price.is_finite()) {
            return Err(TickRejection::NonPositivePrice { price });
        }

        if let Some(open) = aggregator.current() {
            let reference = open.close;
            if reference > 0.0 {
                let deviation = (price - reference).abs() / reference;
                if deviation > self.spike_threshold {
                    return Err(TickRejection::Spike {
                        price,
                        reference,
                        deviation,
                    });
                }
            }
        }

        if let Some(open_slot) = aggregator.open_slot() {
            let slot = aggregator.slot_of(tick.time);
            if slot < open_slot {
                return Err(TickRejection::Late { slot, open_slot });
            }
        }

        if self.last_accepted == Some(tick.time) {
            return Err(TickRejection::Duplicate { time: tick.time });
        }

        Ok(())
    }

    /// Record `tick` as the latest accepted tick.
    pub fn accept(&mut self, tick: &Tick) {
        self.last_accepted = Some(tick.time);
    }

    /// Forget the duplicate cursor (stream restart).
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;

    fn tick(time: i64, price: f64) -> Tick {
        Tick {
            time,
            price,
            volume: 0.0,
        }
    }

    fn seeded(close: f64) -> CandleAggregator {
        let mut agg = CandleAggregator::new(60);
        agg.seed(Bar::flat(120, close, 0.0));
        agg
    }

    #[test]
    fn rejects_non_positive_prices() {
        let guard = TickGuard::new(0.05);
        let agg = CandleAggregator::new(60);
        assert!(matches!(
            guard.check(&tick(130, 0.0), &agg),
            Err(TickRejection::NonPositivePrice { .. })
        ));
        assert!(guard.check(&tick(130, -1.0), &agg).is_err());
        assert!(guard.check(&tick(130, f64::NAN), &agg).is_err());
    }

    #[test]
    fn rejects_six_percent_spike() {
        let guard = TickGuard::new(0.05);
        let agg = seeded(1.0);
        let before = *agg.current().unwrap();
        assert!(matches!(
            guard.check(&tick(130, 1.06), &agg),
            Err(TickRejection::Spike { .. })
        ));
        assert_eq!(*agg.current().unwrap(), before);
        assert!(guard.check(&tick(130, 1.04), &agg).is_ok());
    }

    #[test]
    fn rejects_late_slot() {
        let guard = TickGuard::new(0.05);
        let agg = seeded(1.0);
        assert_eq!(
            guard.check(&tick(100, 1.0), &agg),
            Err(TickRejection::Late {
                slot: 60,
                open_slot: 120
            })
        );
    }

    #[test]
    fn rejects_duplicate_timestamp_until_reset() {
        let mut guard = TickGuard::new(0.05);
        let agg = seeded(1.0);
        let t = tick(130, 1.0);
        assert!(guard.check(&t, &agg).is_ok());
        guard.accept(&t);
        assert_eq!(
            guard.check(&t, &agg),
            Err(TickRejection::Duplicate { time: 130 })
        );
        assert!(guard.check(&tick(131, 1.0), &agg).is_ok());
        guard.reset();
        assert!(guard.check(&t, &agg).is_ok());
    }

    #[test]
    fn first_tick_without_open_bar_passes() {
        let guard = TickGuard::new(0.05);
        assert!(guard.check(&tick(60, 123.0), &CandleAggregator::new(60)).is_ok());
    }
}
