pub mod agent;
pub mod aggregator;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod error;
pub mod keepalive;
pub mod link;
pub mod observability;
pub mod signal;

pub use agent::{Agent, AgentExit, RESTART_EXIT_CODE};
pub use aggregator::{AggregatedBatch, AggregationEngine, AggregatorConfig, SourceId, Stat, Subscription, TimestampedStat};
pub use config::AgentConfig;
pub use error::{AgentError, DeliveryError, Result};
pub use link::{ManagementLink, PingReply, Transport};
pub use signal::{failure_channel, Failure, FailureListener, FailureSignal};
