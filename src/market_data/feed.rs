// =============================================================================
// Market Feed — the broker-facing data source
// =============================================================================

use async_trait::async_trait;

use crate::error::FeedError;
use crate::types::{Bar, Tick, Timeframe};

/// Source of live ticks and historical bars for one broker connection.
///
/// Bars are returned in ascending `time` order with epoch-second slot starts.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Open the connection. Called once before anything else.
    async fn initialize(&self) -> Result<(), FeedError> {
        Ok(())
    }

    /// Make `symbol` available for ticks and history. `false` means unknown or
    /// not tradable.
    async fn select_symbol(&self, symbol: &str) -> Result<bool, FeedError>;

    async fn latest_tick(&self, symbol: &str) -> Result<Option<Tick>, FeedError>;

    /// Bars whose slot start lies in `[start, end]` (epoch seconds).
    async fn historical_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>, FeedError>;

    /// The most recent `count` bars.
    async fn historical_depth(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, FeedError>;

    /// Release the connection.
    async fn shutdown(&self) {}
}
