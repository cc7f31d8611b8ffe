//! Agent configuration
//!
//! Every component kind is a closed, tagged type. Unknown kinds, unknown
//! fields and dangling references are rejected when the file is loaded.
//!
//! ```toml
//! source_id = "vpp-4a3f"
//!
//! [keepalive]
//! interval_secs = 10
//! timeout_secs = 10
//!
//! [aggregators.main]
//! type = "filtering"
//! inbound_capacity = 100
//! outbound_capacity = 10
//!
//! [sinks.stats-file]
//! type = "file"
//! aggregator = "main"
//! format = "structured-json"
//! path = "/var/log/vpp-agent/stats.log"
//!
//! [sinks.stats-kafka]
//! type = "kafka"
//! aggregator = "main"
//! format = "structured-json"
//! topic = "vpp-stats"
//! brokers = ["localhost:9092"]
//!
//! [collectors.counters]
//! type = "simulated-counters"
//! aggregator = "main"
//! schedule = { type = "scheduled", delay_secs = 5 }
//! ```

use crate::aggregator::{AggregatorConfig, FanOutPolicy, SourceId};
use crate::collector::Schedule;
use crate::delivery::{OutputFormat, DEFAULT_FAILURE_THRESHOLD};
use crate::error::{AgentError, Result};
use crate::keepalive::KeepaliveConfig;
use crate::observability::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSettings {
    #[serde(default)]
    pub inbound_capacity: i64,
    #[serde(default)]
    pub outbound_capacity: i64,
    #[serde(default)]
    pub fan_out: FanOutPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AggregatorSpec {
    /// Forwards every stat
    Buffered(QueueSettings),
    /// Drops a stat equal to the previous one of the same type
    Filtering(QueueSettings),
}

impl AggregatorSpec {
    pub fn to_config(&self) -> AggregatorConfig {
        let (settings, suppress_duplicates) = match self {
            AggregatorSpec::Buffered(settings) => (settings, false),
            AggregatorSpec::Filtering(settings) => (settings, true),
        };
        AggregatorConfig {
            inbound_capacity: settings.inbound_capacity,
            outbound_capacity: settings.outbound_capacity,
            suppress_duplicates,
            fan_out: settings.fan_out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSinkSettings {
    pub aggregator: String,
    pub format: OutputFormat,
    pub path: PathBuf,
    /// Overrides the agent-wide threshold
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSinkSettings {
    pub aggregator: String,
    pub format: OutputFormat,
    pub failure_threshold: Option<u32>,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaSinkSettings {
    pub aggregator: String,
    pub format: OutputFormat,
    pub topic: String,
    /// Bootstrap brokers as `host:port`
    pub brokers: Vec<String>,
    #[serde(default)]
    pub partition: i32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SinkSpec {
    File(FileSinkSettings),
    Log(LogSinkSettings),
    Kafka(KafkaSinkSettings),
}

impl SinkSpec {
    pub fn aggregator(&self) -> &str {
        match self {
            SinkSpec::File(s) => &s.aggregator,
            SinkSpec::Log(s) => &s.aggregator,
            SinkSpec::Kafka(s) => &s.aggregator,
        }
    }

    pub fn failure_threshold(&self) -> Option<u32> {
        match self {
            SinkSpec::File(s) => s.failure_threshold,
            SinkSpec::Log(s) => s.failure_threshold,
            SinkSpec::Kafka(s) => s.failure_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedCountersSettings {
    pub aggregator: String,
    pub schedule: Schedule,
    #[serde(default = "default_interfaces")]
    pub interfaces: u32,
}

fn default_interfaces() -> u32 {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CollectorSpec {
    SimulatedCounters(SimulatedCountersSettings),
}

impl CollectorSpec {
    pub fn aggregator(&self) -> &str {
        match self {
            CollectorSpec::SimulatedCounters(s) => &s.aggregator,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        match self {
            CollectorSpec::SimulatedCounters(s) => &s.schedule,
        }
    }
}

fn default_connection_name() -> String {
    "vpp-monitoring-agent".to_string()
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Identifies the monitored engine in every produced stat
    pub source_id: String,
    /// Client name used on the management link
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub aggregators: BTreeMap<String, AggregatorSpec>,
    #[serde(default)]
    pub sinks: BTreeMap<String, SinkSpec>,
    #[serde(default)]
    pub collectors: BTreeMap<String, CollectorSpec>,
}

impl AgentConfig {
    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AgentConfig =
            toml::from_str(content).map_err(|e| AgentError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn source_id(&self) -> SourceId {
        SourceId::new(self.source_id.trim())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            return Err(AgentError::Configuration("source_id has to be set".to_string()));
        }
        if self.failure_threshold == 0 {
            return Err(AgentError::Configuration(
                "failure_threshold must be positive".to_string(),
            ));
        }
        if self.keepalive.timeout_secs == 0 || self.keepalive.interval_secs == 0 {
            return Err(AgentError::Configuration(
                "keepalive interval and timeout must be positive".to_string(),
            ));
        }

        for (name, sink) in &self.sinks {
            self.check_aggregator("sink", name, sink.aggregator())?;
            if sink.failure_threshold() == Some(0) {
                return Err(AgentError::Configuration(format!(
                    "sink '{}': failure_threshold must be positive",
                    name
                )));
            }
            if let SinkSpec::Kafka(kafka) = sink {
                if kafka.topic.trim().is_empty() || kafka.brokers.is_empty() {
                    return Err(AgentError::Configuration(format!(
                        "sink '{}': kafka needs a topic and at least one broker",
                        name
                    )));
                }
                if kafka.connect_timeout_secs == 0 {
                    return Err(AgentError::Configuration(format!(
                        "sink '{}': connect_timeout_secs must be positive",
                        name
                    )));
                }
            }
        }

        for (name, collector) in &self.collectors {
            self.check_aggregator("collector", name, collector.aggregator())?;
            collector.schedule().validate().map_err(|e| {
                AgentError::Configuration(format!("collector '{}': {}", name, e))
            })?;
        }

        Ok(())
    }

    fn check_aggregator(&self, kind: &str, name: &str, aggregator: &str) -> Result<()> {
        if self.aggregators.contains_key(aggregator) {
            Ok(())
        } else {
            Err(AgentError::Configuration(format!(
                "{} '{}' references unknown aggregator '{}'",
                kind, name, aggregator
            )))
        }
    }
}
