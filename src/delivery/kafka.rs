use super::format::OutputFormat;
use super::sink::Sink;
use crate::aggregator::TimestampedStat;
use crate::error::DeliveryError;
use bytes::Bytes;
use chrono::Utc;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::Record;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Publishes one keyed record and waits for the broker's acknowledgement.
pub trait RecordProducer: Send + 'static {
    fn produce(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DeliveryError>;
}

/// Producer for a single topic partition.
///
/// `produce` blocks on the runtime it was connected from, so it must run on
/// a blocking thread, which is where delivery workers run.
pub struct PartitionProducer {
    topic: String,
    partition: i32,
    client: PartitionClient,
    runtime: Handle,
}

impl PartitionProducer {
    pub async fn connect(
        brokers: Vec<String>,
        topic: impl Into<String>,
        partition: i32,
        connect_timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let topic = topic.into();
        info!(brokers = ?brokers, topic = %topic, partition, "Initializing kafka connection");

        let connect = async {
            let client = ClientBuilder::new(brokers.clone()).build().await?;
            let partition_client = client
                .partition_client(topic.clone(), partition, UnknownTopicHandling::Retry)
                .await?;
            Ok::<_, rskafka::client::error::Error>(partition_client)
        };
        let client = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| {
                DeliveryError::Rejected(format!(
                    "no kafka connection to {:?} within {:?}",
                    brokers, connect_timeout
                ))
            })?
            .map_err(|e| DeliveryError::Rejected(format!("unable to connect to kafka: {}", e)))?;

        info!(topic = %topic, partition, "Kafka connection successful");
        Ok(PartitionProducer {
            topic,
            partition,
            client,
            runtime: Handle::current(),
        })
    }
}

impl RecordProducer for PartitionProducer {
    fn produce(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DeliveryError> {
        let record = Record {
            key: Some(key),
            value: Some(value),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };
        let offsets = self
            .runtime
            .block_on(self.client.produce(vec![record], Compression::NoCompression))
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        debug!(topic = %self.topic, partition = self.partition, offsets = ?offsets, "Successfully sent message to kafka");
        Ok(())
    }
}

/// Sends each stat as one record keyed by the send time in Unix seconds.
pub struct KafkaSink<P: RecordProducer = PartitionProducer> {
    name: String,
    format: OutputFormat,
    producer: P,
}

impl<P: RecordProducer> KafkaSink<P> {
    pub fn new(name: impl Into<String>, format: OutputFormat, producer: P) -> Self {
        KafkaSink {
            name: name.into(),
            format,
            producer,
        }
    }
}

impl<P: RecordProducer> Sink for KafkaSink<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, stat: &TimestampedStat) -> Result<Bytes, DeliveryError> {
        self.format.encode(stat)
    }

    fn deliver(&mut self, encoded: Bytes) -> Result<(), DeliveryError> {
        let key = Utc::now().timestamp().to_string().into_bytes();
        let value = encoded.strip_suffix(b"\n").unwrap_or(&encoded[..]).to_vec();
        self.producer.produce(key, value)
    }
}
