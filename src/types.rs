// =============================================================================
// Shared types used across the candle / indicator pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single price observation from the market feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Epoch seconds.
    pub time: i64,
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
}

/// One OHLCV candle. `time` is the epoch-second start of its slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    /// A bar with O=H=L=C=`price`.
    pub fn flat(time: i64, price: f64, volume: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }
}

// =============================================================================
// Timeframe
// =============================================================================

/// Candle resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M5
    }
}

impl Timeframe {
    /// Slot width in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    /// Interval string understood by the exchange kline endpoint.
    pub fn exchange_interval(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "M1" => Ok(Self::M1),
            "M5" => Ok(Self::M5),
            "M15" => Ok(Self::M15),
            "M30" => Ok(Self::M30),
            "H1" => Ok(Self::H1),
            "H4" => Ok(Self::H4),
            "D1" => Ok(Self::D1),
            other => anyhow::bail!("unknown timeframe {other:?}"),
        }
    }
}

// =============================================================================
// Markers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    TrendRider,
    VolBreakout,
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendRider => write!(f, "TrendRider"),
            Self::VolBreakout => write!(f, "VolBreakout"),
        }
    }
}

/// A trade-signal arrow placed on a bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub time: i64,
    pub price: f64,
    pub direction: Direction,
    pub kind: MarkerKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parse_and_display() {
        let tf: Timeframe = "m5".parse().unwrap();
        assert_eq!(tf, Timeframe::M5);
        assert_eq!(tf.to_string(), "M5");
        assert_eq!(tf.seconds(), 300);
        assert_eq!(tf.exchange_interval(), "5m");
        assert!("W1".parse::<Timeframe>().is_err());
    }

    #[test]
    fn flat_bar_has_equal_prices() {
        let bar = Bar::flat(120, 1.0995, 0.0);
        assert_eq!(bar.open, bar.close);
        assert_eq!(bar.high, bar.low);
        assert_eq!(bar.time, 120);
    }

    #[test]
    fn marker_serialises_lowercase_direction() {
        let m = Marker {
            time: 60,
            price: 1.1,
            direction: Direction::Down,
            kind: MarkerKind::VolBreakout,
        };
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"down\""));
        assert!(json.contains("VolBreakout"));
    }
}
