// src/stats/mod.rs
mod aggregator;

pub use aggregator::StatsAggregator;
