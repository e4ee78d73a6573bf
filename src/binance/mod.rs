pub mod client;

pub use client::BinanceFeed;
