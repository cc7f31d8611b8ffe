//! Stat collectors and their scheduling
//!
//! A collector queries the management link and submits what it finds to an
//! aggregation engine. Decoding the engine's counter layouts is left to the
//! concrete collectors; this module only decides when they run.

mod simulated;

pub use simulated::{InterfaceCounters, InterfaceState, SimulatedCountersCollector};

use crate::aggregator::AggregationEngine;
use crate::error::{AgentError, Result};
use crate::link::ManagementLink;
use crate::signal::{Failure, FailureSignal};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub trait Collector: Send + 'static {
    fn name(&self) -> &str;

    /// One collection round.
    fn collect<'a>(
        &'a mut self,
        link: &'a ManagementLink,
        engine: &'a AggregationEngine,
    ) -> BoxFuture<'a, Result<()>>;
}

/// When a collector runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Schedule {
    Once,
    /// Registers for notifications in its single round
    Notifications,
    /// Every `delay_secs` seconds until stopped
    Scheduled { delay_secs: u64 },
}

impl Schedule {
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Scheduled { delay_secs: 0 } => Err(AgentError::Configuration(
                "scheduled delay needs to be > 0".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Run one round. Non-fatal errors are logged and swallowed; a fatal one is
/// returned so a repeating schedule can stop.
async fn collect_once(
    collector: &mut dyn Collector,
    link: &ManagementLink,
    engine: &AggregationEngine,
) -> Result<()> {
    debug!(collector = collector.name(), "Executing collector");
    match collector.collect(link, engine).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(collector = collector.name(), error = %e, "Collector execution failed");
            Err(e)
        }
        Err(e) => {
            error!(collector = collector.name(), error = %e, "Collector round failed, continuing");
            Ok(())
        }
    }
}

/// Start `collector` on its schedule. Repeating collectors check `stop`
/// between rounds. A fatal round ends the task and, unless the agent is
/// already stopping, raises [`Failure::CollectorFailed`] on `failure`.
pub fn spawn_collector(
    mut collector: Box<dyn Collector>,
    schedule: Schedule,
    link: Arc<ManagementLink>,
    engine: Arc<AggregationEngine>,
    failure: FailureSignal,
    stop: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    schedule.validate()?;

    let handle = tokio::spawn(async move {
        let outcome = run_schedule(collector.as_mut(), &schedule, &link, &engine, &stop).await;

        if let Err(e) = &outcome {
            if stop.is_cancelled() {
                debug!(collector = collector.name(), error = %e, "Collector ended during shutdown");
            } else {
                failure.raise(Failure::CollectorFailed {
                    collector: collector.name().to_string(),
                    error: e.to_string(),
                });
            }
        }
        outcome
    });
    Ok(handle)
}

async fn run_schedule(
    collector: &mut dyn Collector,
    schedule: &Schedule,
    link: &ManagementLink,
    engine: &AggregationEngine,
    stop: &CancellationToken,
) -> Result<()> {
    match schedule {
        Schedule::Once | Schedule::Notifications => collect_once(collector, link, engine).await,
        Schedule::Scheduled { delay_secs } => {
            let delay = Duration::from_secs(*delay_secs);
            info!(collector = collector.name(), delay_secs, "Executing scheduled collector at fixed rate");

            loop {
                collect_once(collector, link, engine).await?;

                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(collector = collector.name(), "Stopping execution");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatorConfig, SourceId, Stat};
    use crate::link::LoopbackTransport;
    use crate::signal::failure_channel;
    use serde_json::json;

    struct Counting {
        rounds: u32,
        fail_with: Option<fn() -> AgentError>,
    }

    impl Collector for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn collect<'a>(
            &'a mut self,
            _link: &'a ManagementLink,
            engine: &'a AggregationEngine,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.rounds += 1;
                if let Some(make) = self.fail_with {
                    return Err(make());
                }
                engine.submit(Stat::new("round", json!(self.rounds))).await
            })
        }
    }

    async fn fixtures() -> (Arc<ManagementLink>, Arc<AggregationEngine>) {
        let link = ManagementLink::connect("collector-test", Arc::new(LoopbackTransport::new(1)))
            .await
            .unwrap();
        let engine = AggregationEngine::new("test", AggregatorConfig::new(64, 64));
        (Arc::new(link), Arc::new(engine))
    }

    #[test]
    fn test_zero_delay_rejected() {
        assert!(Schedule::Scheduled { delay_secs: 0 }.validate().is_err());
        assert!(Schedule::Once.validate().is_ok());
    }

    #[test]
    fn test_schedule_from_toml() {
        let schedule: Schedule = toml::from_str("type = \"scheduled\"\ndelay_secs = 5").unwrap();
        assert_eq!(schedule, Schedule::Scheduled { delay_secs: 5 });
        assert!(toml::from_str::<Schedule>("type = \"hourly\"").is_err());
    }

    #[tokio::test]
    async fn test_once_runs_single_round() {
        let (link, engine) = fixtures().await;
        let mut sub = engine.subscribe().unwrap();
        engine.start(SourceId::new("vpp")).unwrap();

        let (signal, mut listener) = failure_channel();
        let collector = Box::new(Counting { rounds: 0, fail_with: None });
        let handle = spawn_collector(
            collector,
            Schedule::Once,
            link,
            engine.clone(),
            signal,
            CancellationToken::new(),
        )
        .unwrap();
        handle.await.unwrap().unwrap();
        assert!(listener.try_take().is_none());
        engine.close().await;

        let batch = sub.recv().await.unwrap();
        assert_eq!(batch.stats()[0].stat, json!(1));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scheduled_stops_on_cancel() {
        let (link, engine) = fixtures().await;
        let (signal, _listener) = failure_channel();
        let stop = CancellationToken::new();
        let handle = spawn_collector(
            Box::new(Counting { rounds: 0, fail_with: None }),
            Schedule::Scheduled { delay_secs: 3600 },
            link,
            engine,
            signal,
            stop.clone(),
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("collector should observe stop between rounds")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_round_raises_collector_failure() {
        let (link, engine) = fixtures().await;
        let (signal, listener) = failure_channel();
        let handle = spawn_collector(
            Box::new(Counting {
                rounds: 0,
                fail_with: Some(|| AgentError::Transport("shared memory detached".to_string())),
            }),
            Schedule::Scheduled { delay_secs: 1 },
            link,
            engine,
            signal,
            CancellationToken::new(),
        )
        .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("fatal error ends the schedule")
            .unwrap();
        assert!(matches!(result, Err(AgentError::Transport(_))));
        assert_eq!(
            listener.wait().await,
            Some(Failure::CollectorFailed {
                collector: "counting".to_string(),
                error: "transport error: shared memory detached".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_once_fatal_round_raises_collector_failure() {
        let (link, engine) = fixtures().await;
        let (signal, listener) = failure_channel();
        spawn_collector(
            Box::new(Counting {
                rounds: 0,
                fail_with: Some(|| AgentError::EngineClosed),
            }),
            Schedule::Once,
            link,
            engine,
            signal,
            CancellationToken::new(),
        )
        .unwrap();

        let failure = tokio::time::timeout(std::time::Duration::from_secs(5), listener.wait())
            .await
            .unwrap();
        assert!(matches!(failure, Some(Failure::CollectorFailed { .. })));
    }

    #[tokio::test]
    async fn test_fatal_round_during_shutdown_is_not_raised() {
        let (link, engine) = fixtures().await;
        let (signal, mut listener) = failure_channel();
        let stop = CancellationToken::new();
        stop.cancel();

        let handle = spawn_collector(
            Box::new(Counting {
                rounds: 0,
                fail_with: Some(|| AgentError::EngineClosed),
            }),
            Schedule::Once,
            link,
            engine,
            signal,
            stop,
        )
        .unwrap();

        assert!(handle.await.unwrap().is_err());
        assert!(listener.try_take().is_none());
    }

    #[tokio::test]
    async fn test_non_fatal_round_keeps_schedule_running() {
        let (link, engine) = fixtures().await;
        let (signal, mut listener) = failure_channel();
        let stop = CancellationToken::new();
        let handle = spawn_collector(
            Box::new(Counting {
                rounds: 0,
                fail_with: Some(|| AgentError::Configuration("bad counter index".to_string())),
            }),
            Schedule::Scheduled { delay_secs: 3600 },
            link,
            engine,
            signal,
            stop.clone(),
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        stop.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert!(listener.try_take().is_none());
    }
}
