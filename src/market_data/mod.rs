pub mod candle_aggregator;
pub mod feed;

// Re-export for convenient access (e.g. `use crate::market_data::CandleAggregator`).
pub use candle_aggregator::CandleAggregator;
pub use feed::MarketFeed;
