//! Agent supervisor
//!
//! Wires aggregators, sinks, collectors and the keepalive watchdog from an
//! [`AgentConfig`], then waits for the first fatal failure. Any failure,
//! whether a dead link, a protocol violation or a sink that exhausted its
//! retries, tears the whole agent down; an external supervisor restarts the
//! process when it exits with [`RESTART_EXIT_CODE`].

use crate::aggregator::AggregationEngine;
use crate::collector::{spawn_collector, Collector, SimulatedCountersCollector};
use crate::config::{AgentConfig, CollectorSpec, SinkSpec};
use crate::delivery::{DeliveryPolicy, DeliveryWorker, FileSink, KafkaSink, LogSink, PartitionProducer};
use crate::error::{AgentError, Result};
use crate::keepalive::KeepaliveWatchdog;
use crate::link::{ManagementLink, Transport};
use crate::signal::{failure_channel, Failure, FailureListener, FailureSignal};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code asking the external supervisor for a restart
pub const RESTART_EXIT_CODE: u8 = 100;

/// Why [`Agent::run_until`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    Failure(Failure),
    Shutdown,
}

pub struct Agent {
    engines: BTreeMap<String, Arc<AggregationEngine>>,
    link: Arc<ManagementLink>,
    failure: FailureSignal,
    listener: FailureListener,
    stop: CancellationToken,
    keepalive: JoinHandle<Result<()>>,
    sinks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl Agent {
    /// Build and start every component. Sinks subscribe before the engines
    /// start so no batch is produced without its consumers in place.
    pub async fn start(config: AgentConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let source_id = config.source_id();
        let (failure, listener) = failure_channel();

        let link = Arc::new(ManagementLink::connect(config.connection_name.as_str(), transport).await?);
        link.set_failure_signal(failure.clone());

        let engines: BTreeMap<String, Arc<AggregationEngine>> = config
            .aggregators
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    Arc::new(AggregationEngine::new(name.as_str(), spec.to_config())),
                )
            })
            .collect();

        let mut sinks = Vec::with_capacity(config.sinks.len());
        let stop = CancellationToken::new();
        let keepalive =
            match Self::launch(&config, &engines, &link, &failure, &stop, &mut sinks).await {
                Ok(keepalive) => keepalive,
                Err(e) => {
                    // Unblock the sink workers that were already spawned
                    stop.cancel();
                    for engine in engines.values() {
                        engine.close().await;
                    }
                    return Err(e);
                }
            };

        info!(
            source = %source_id,
            aggregators = engines.len(),
            sinks = sinks.len(),
            collectors = config.collectors.len(),
            "Agent started"
        );

        Ok(Agent {
            engines,
            link,
            failure,
            listener,
            stop,
            keepalive,
            sinks,
        })
    }

    async fn launch(
        config: &AgentConfig,
        engines: &BTreeMap<String, Arc<AggregationEngine>>,
        link: &Arc<ManagementLink>,
        failure: &FailureSignal,
        stop: &CancellationToken,
        sinks: &mut Vec<(String, JoinHandle<Result<()>>)>,
    ) -> Result<JoinHandle<Result<()>>> {
        for (name, spec) in &config.sinks {
            let engine = lookup(engines, spec.aggregator())?;
            let threshold = spec.failure_threshold().unwrap_or(config.failure_threshold);
            let policy = DeliveryPolicy::new(name.as_str(), threshold)?;
            let subscription = engine.subscribe()?;

            let handle = match spec {
                SinkSpec::File(settings) => {
                    let sink = FileSink::open(name.as_str(), &settings.path, settings.format)?;
                    DeliveryWorker::new(sink, subscription, policy, failure.clone()).spawn()
                }
                SinkSpec::Log(settings) => {
                    let sink = LogSink::new(name.as_str(), settings.format);
                    DeliveryWorker::new(sink, subscription, policy, failure.clone()).spawn()
                }
                SinkSpec::Kafka(settings) => {
                    let producer = PartitionProducer::connect(
                        settings.brokers.clone(),
                        settings.topic.as_str(),
                        settings.partition,
                        Duration::from_secs(settings.connect_timeout_secs),
                    )
                    .await?;
                    let sink = KafkaSink::new(name.as_str(), settings.format, producer);
                    DeliveryWorker::new(sink, subscription, policy, failure.clone()).spawn()
                }
            };
            sinks.push((name.clone(), handle));
        }

        let source_id = config.source_id();
        for engine in engines.values() {
            engine.start(source_id.clone())?;
        }

        let keepalive =
            KeepaliveWatchdog::from_config(link.clone(), &config.keepalive, failure.clone())?;

        for (name, spec) in &config.collectors {
            let engine = lookup(engines, spec.aggregator())?;
            let collector: Box<dyn Collector> = match spec {
                CollectorSpec::SimulatedCounters(settings) => Box::new(
                    SimulatedCountersCollector::new(name.as_str(), settings.interfaces),
                ),
            };
            spawn_collector(
                collector,
                spec.schedule().clone(),
                link.clone(),
                engine.clone(),
                failure.clone(),
                stop.child_token(),
            )?;
        }

        Ok(keepalive.spawn(stop.child_token()))
    }

    pub fn engine(&self, name: &str) -> Option<&Arc<AggregationEngine>> {
        self.engines.get(name)
    }

    pub fn link(&self) -> &Arc<ManagementLink> {
        &self.link
    }

    /// Handle for reporting failures from outside the agent's own tasks
    pub fn failure_signal(&self) -> FailureSignal {
        self.failure.clone()
    }

    /// Run until a component fails.
    pub async fn run(self) -> AgentExit {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until a component fails or `shutdown` completes, then tear
    /// everything down.
    pub async fn run_until<F>(self, shutdown: F) -> AgentExit
    where
        F: Future,
    {
        let Agent {
            engines,
            link,
            failure,
            listener,
            stop,
            keepalive,
            sinks,
        } = self;

        let exit = tokio::select! {
            failure = listener.wait() => match failure {
                Some(failure) => {
                    error!(failure = %failure, "Fatal failure detected, tearing down agent");
                    AgentExit::Failure(failure)
                }
                None => AgentExit::Shutdown,
            },
            _ = shutdown => {
                info!("Shutdown requested");
                AgentExit::Shutdown
            }
        };
        drop(failure);

        // Collectors see the stop between rounds and are not awaited; errors
        // they hit from here on are not raised
        info!("Stopping all collector executions");
        stop.cancel();

        match keepalive.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Keepalive ended with error"),
            Err(e) => error!(error = %e, "Keepalive task failed"),
        }

        info!("Closing all aggregators");
        for engine in engines.values() {
            engine.close().await;
        }

        for (name, handle) in sinks {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(sink = %name, error = %e, "Sink ended with error"),
                Err(e) => error!(sink = %name, error = %e, "Sink task failed"),
            }
        }

        info!(link = link.name(), pending = link.pending(), "Agent stopped");
        exit
    }
}

fn lookup<'a>(
    engines: &'a BTreeMap<String, Arc<AggregationEngine>>,
    name: &str,
) -> Result<&'a Arc<AggregationEngine>> {
    engines
        .get(name)
        .ok_or_else(|| AgentError::Configuration(format!("unknown aggregator '{}'", name)))
}
