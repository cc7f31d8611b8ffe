//! Sinks and the delivery reliability policy they all share

mod format;
mod kafka;
mod policy;
mod sink;
mod worker;

pub use format::OutputFormat;
pub use kafka::{KafkaSink, PartitionProducer, RecordProducer};
pub use policy::{DeliveryPolicy, DEFAULT_FAILURE_THRESHOLD};
pub use sink::{FileSink, LogSink, MemorySink, Sink};
pub use worker::DeliveryWorker;
