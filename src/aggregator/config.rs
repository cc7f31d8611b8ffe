use serde::{Deserialize, Serialize};
use tracing::warn;

/// What fan-out does when a subscriber queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanOutPolicy {
    /// Wait for room. A slow subscriber stalls the cycle and, through the
    /// inbound queue, the collectors.
    #[default]
    Block,
    /// Skip that subscriber for this batch and keep going.
    DropIfFull,
}

/// Aggregation engine settings. Capacities are signed so that a negative
/// value coming from a config file can be reported and clamped instead of
/// rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Inbound queue capacity
    #[serde(default)]
    pub inbound_capacity: i64,
    /// Per-subscriber outbound queue capacity
    #[serde(default)]
    pub outbound_capacity: i64,
    /// Drop a stat equal to the last one seen for its type
    #[serde(default)]
    pub suppress_duplicates: bool,
    #[serde(default)]
    pub fan_out: FanOutPolicy,
}

impl AggregatorConfig {
    pub fn new(inbound_capacity: i64, outbound_capacity: i64) -> Self {
        AggregatorConfig {
            inbound_capacity,
            outbound_capacity,
            ..Default::default()
        }
    }

    /// Enable per-type duplicate suppression
    pub fn with_duplicate_suppression(mut self) -> Self {
        self.suppress_duplicates = true;
        self
    }

    pub fn with_fan_out(mut self, policy: FanOutPolicy) -> Self {
        self.fan_out = policy;
        self
    }

    /// Clamp negative capacities to zero, warning for each one.
    pub fn normalized(mut self, name: &str) -> Self {
        if self.inbound_capacity < 0 {
            warn!(
                aggregator = name,
                capacity = self.inbound_capacity,
                "Invalid inbound queue capacity, setting to 0"
            );
            self.inbound_capacity = 0;
        }
        if self.outbound_capacity < 0 {
            warn!(
                aggregator = name,
                capacity = self.outbound_capacity,
                "Invalid outbound queue capacity, setting to 0"
            );
            self.outbound_capacity = 0;
        }
        self
    }

    pub(crate) fn inbound_buffer(&self) -> usize {
        channel_buffer(self.inbound_capacity)
    }

    pub(crate) fn outbound_buffer(&self) -> usize {
        channel_buffer(self.outbound_capacity)
    }
}

/// tokio channels need at least one slot. A zero capacity gets that slot
/// plus a per-item acknowledgement, see the engine.
fn channel_buffer(capacity: i64) -> usize {
    capacity.max(1) as usize
}
