//! Stat aggregation between collectors and sinks

mod config;
mod engine;
mod types;

pub use config::{AggregatorConfig, FanOutPolicy};
pub use engine::{AggregationEngine, Subscription};
pub use types::{AggregatedBatch, SourceId, Stat, TimestampedStat};
pub use tokio::sync::mpsc::error::TryRecvError;
