// =============================================================================
// Error types for the market feed boundary and tick validation
// =============================================================================

use thiserror::Error;

/// Failure reported by a [`MarketFeed`](crate::market_data::MarketFeed).
#[derive(Debug, Error)]
pub enum FeedError {
    /// The feed could not be reached or refused the symbol. Terminal for the session.
    #[error("market feed unavailable: {0}")]
    Unavailable(String),

    /// The feed answered with something we could not interpret.
    #[error("malformed feed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Reason a polled tick was dropped before aggregation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TickRejection {
    #[error("non-positive price {price}")]
    NonPositivePrice { price: f64 },

    #[error("price {price} deviates {deviation:.4} from open close {reference}")]
    Spike {
        price: f64,
        reference: f64,
        deviation: f64,
    },

    #[error("late tick: slot {slot} before open slot {open_slot}")]
    Late { slot: i64, open_slot: i64 },

    #[error("duplicate tick at {time}")]
    Duplicate { time: i64 },
}
