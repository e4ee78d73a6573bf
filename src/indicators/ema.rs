// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes
// and placed at index `period - 1`.
// =============================================================================

/// Compute the EMA series for `values`, index-aligned with the input.
///
/// Entries before index `period - 1` are `None`.
///
/// # Edge cases
/// - `period == 0` or `values.len() < period` => all `None`
/// - A non-finite intermediate value ends the series; later entries stay `None`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    // Seed: SMA of the first `period` values.
    let sma: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return out;
    }
    out[period - 1] = Some(sma);

    let mut prev_ema = sma;
    for (i, &value) in values.iter().enumerate().skip(period) {
        let ema = value * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        out[i] = Some(ema);
        prev_ema = ema;
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(ema_series(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).iter().all(Option::is_none));
    }

    #[test]
    fn ema_insufficient_data() {
        let ema = ema_series(&[1.0, 2.0], 5);
        assert_eq!(ema.len(), 2);
        assert!(ema.iter().all(Option::is_none));
    }

    #[test]
    fn ema_period_equals_length() {
        let ema = ema_series(&[2.0, 4.0, 6.0], 3);
        assert!(ema[..2].iter().all(Option::is_none));
        // SMA = (2+4+6)/3 = 4.0
        assert!((ema[2].unwrap() - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1..=10]: SMA seed 3.0 at index 4, multiplier 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = ema_series(&closes, 5);
        assert!(ema[..4].iter().all(Option::is_none));

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((ema[4].unwrap() - expected).abs() < 1e-10);
        for i in 5..10 {
            expected = closes[i] * mult + expected * (1.0 - mult);
            let got = ema[i].unwrap();
            assert!((got - expected).abs() < 1e-10, "got {got}, expected {expected}");
        }
    }

    #[test]
    fn ema_stops_on_nan() {
        let ema = ema_series(&[1.0, 2.0, 3.0, f64::NAN, 5.0], 3);
        assert_eq!(ema[2], Some(2.0));
        assert_eq!(ema[3], None);
        assert_eq!(ema[4], None);
    }

    #[test]
    fn ema_prefix_is_stable() {
        // Appending values never changes earlier entries.
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let short = ema_series(&closes[..30], 20);
        let long = ema_series(&closes, 20);
        assert_eq!(short[..], long[..30]);
    }
}
