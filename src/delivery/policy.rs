use crate::error::{AgentError, DeliveryError, Result};
use tracing::{error, warn};

/// Consecutive delivery failures a sink tolerates before giving up.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 25;

/// Consecutive-failure counter shared by every sink kind.
///
/// Each failure is logged and counted; a success resets the count. Reaching
/// the threshold turns the failure into
/// [`AgentError::DeliveryThresholdExceeded`].
#[derive(Debug)]
pub struct DeliveryPolicy {
    sink: String,
    threshold: u32,
    consecutive_failures: u32,
}

impl DeliveryPolicy {
    pub fn new(sink: impl Into<String>, threshold: u32) -> Result<Self> {
        let sink = sink.into();
        if threshold == 0 {
            return Err(AgentError::Configuration(format!(
                "sink '{}': failure threshold must be positive",
                sink
            )));
        }
        Ok(DeliveryPolicy {
            sink,
            threshold,
            consecutive_failures: 0,
        })
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Encode `item` and deliver it through `target`.
    ///
    /// `Ok` means the attempt either succeeded or failed below the
    /// threshold; the caller keeps going either way.
    pub fn attempt<C, T, E, Enc, Del>(
        &mut self,
        target: &mut C,
        item: &T,
        encode: Enc,
        deliver: Del,
    ) -> Result<()>
    where
        T: ?Sized,
        Enc: FnOnce(&C, &T) -> std::result::Result<E, DeliveryError>,
        Del: FnOnce(&mut C, E) -> std::result::Result<(), DeliveryError>,
    {
        let outcome = encode(target, item).and_then(|encoded| deliver(target, encoded));
        self.record(outcome)
    }

    /// Count the outcome of one delivery done elsewhere.
    pub fn record(&mut self, outcome: std::result::Result<(), DeliveryError>) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    sink = %self.sink,
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Unable to deliver stat. Ignoring"
                );

                if self.consecutive_failures >= self.threshold {
                    error!(
                        sink = %self.sink,
                        consecutive_failures = self.consecutive_failures,
                        "Too many consecutive failures"
                    );
                    return Err(AgentError::DeliveryThresholdExceeded {
                        sink: self.sink.clone(),
                        failures: self.consecutive_failures,
                    });
                }
                Ok(())
            }
        }
    }
}
