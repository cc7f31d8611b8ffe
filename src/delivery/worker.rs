use super::policy::DeliveryPolicy;
use super::sink::Sink;
use crate::aggregator::{Subscription, TimestampedStat};
use crate::error::{AgentError, Result};
use crate::signal::{Failure, FailureSignal};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Delivery loop for one sink: drains its subscription through the
/// reliability policy until the queue closes or the policy gives up.
pub struct DeliveryWorker<S: Sink> {
    sink: S,
    subscription: Subscription,
    policy: DeliveryPolicy,
    failure: FailureSignal,
}

impl<S: Sink> DeliveryWorker<S> {
    pub fn new(
        sink: S,
        subscription: Subscription,
        policy: DeliveryPolicy,
        failure: FailureSignal,
    ) -> Self {
        DeliveryWorker {
            sink,
            subscription,
            policy,
            failure,
        }
    }

    /// Run on a blocking thread; sink I/O never stalls the runtime.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn run(mut self) -> Result<()> {
        info!(
            sink = self.sink.name(),
            subscription = self.subscription.id(),
            threshold = self.policy.threshold(),
            "Sink started"
        );

        while let Some(batch) = self.subscription.blocking_recv() {
            for stat in batch.stats() {
                let delivered = self.policy.attempt(
                    &mut self.sink,
                    stat,
                    |sink: &S, stat: &TimestampedStat| sink.encode(stat),
                    |sink: &mut S, encoded| sink.deliver(encoded),
                );

                if let Err(e) = delivered {
                    if let AgentError::DeliveryThresholdExceeded { sink, failures } = &e {
                        self.failure.raise(Failure::SinkExhausted {
                            sink: sink.clone(),
                            failures: *failures,
                        });
                    }
                    self.close_sink();
                    return Err(e);
                }
            }
        }

        info!(sink = self.sink.name(), "Subscription closed, stopping sink");
        self.close_sink();
        Ok(())
    }

    fn close_sink(&mut self) {
        if let Err(e) = self.sink.close() {
            error!(sink = self.sink.name(), error = %e, "Failed to close sink");
        }
    }
}
