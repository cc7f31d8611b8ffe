use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the forwarding engine instance the stats were collected from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observation from a collector. The type tag is its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    type_tag: String,
    payload: serde_json::Value,
}

impl Stat {
    pub fn new(type_tag: impl Into<String>, payload: serde_json::Value) -> Self {
        Stat {
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Classify a value by its Rust type name and capture its serialized form.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Stat {
            type_tag: std::any::type_name::<T>().to_string(),
            payload: serde_json::to_value(value)?,
        })
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub(crate) fn into_parts(self) -> (String, serde_json::Value) {
        (self.type_tag, self.payload)
    }
}

/// A stat accepted into a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampedStat {
    pub source_id: SourceId,
    pub timestamp: DateTime<Utc>,
    pub stat_type: String,
    pub stat: serde_json::Value,
}

impl fmt::Display for TimestampedStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.timestamp.to_rfc3339(),
            self.source_id,
            self.stat_type,
            self.stat
        )
    }
}

/// Output of one collection cycle. Never empty; shared read-only by every
/// subscriber that received it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedBatch {
    source_id: SourceId,
    stats: Vec<TimestampedStat>,
}

impl AggregatedBatch {
    /// Returns `None` for an empty cycle.
    pub(crate) fn new(source_id: SourceId, stats: Vec<TimestampedStat>) -> Option<Self> {
        if stats.is_empty() {
            None
        } else {
            Some(AggregatedBatch { source_id, stats })
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn stats(&self) -> &[TimestampedStat] {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
