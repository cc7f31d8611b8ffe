//! One-shot failure signal
//!
//! Every fatal condition that the owning process must react to is reported
//! through one shared slot: a keepalive timeout, a protocol violation on the
//! management link, a sink exhausting its retries or a collector failing.
//! Only the first report is delivered; the agent tears down and restarts on
//! it.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Why the agent must restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    LivenessTimeout { context: u32 },
    ProtocolViolation { context: u32 },
    PingRejected { context: u32, retval: i32 },
    SinkExhausted { sink: String, failures: u32 },
    CollectorFailed { collector: String, error: String },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::LivenessTimeout { context } => {
                write!(f, "keepalive {} timed out", context)
            }
            Failure::ProtocolViolation { context } => {
                write!(f, "unexpected reply for context {}", context)
            }
            Failure::PingRejected { context, retval } => {
                write!(f, "control ping {} rejected with retval {}", context, retval)
            }
            Failure::SinkExhausted { sink, failures } => {
                write!(f, "sink '{}' failed {} times in a row", sink, failures)
            }
            Failure::CollectorFailed { collector, error } => {
                write!(f, "collector '{}' failed: {}", collector, error)
            }
        }
    }
}

/// Sending side. Cheap to clone; all clones share the single slot.
#[derive(Clone)]
pub struct FailureSignal {
    slot: Arc<Mutex<Option<oneshot::Sender<Failure>>>>,
}

impl FailureSignal {
    /// Report a failure without blocking. Returns `true` only for the call
    /// that actually filled the slot.
    pub fn raise(&self, failure: Failure) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(failure).is_ok(),
            None => false,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl fmt::Debug for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}

/// Receiving side, held by the owning process.
pub struct FailureListener {
    rx: oneshot::Receiver<Failure>,
}

impl FailureListener {
    /// Wait for the failure. `None` if every signal handle was dropped
    /// without raising.
    pub async fn wait(self) -> Option<Failure> {
        self.rx.await.ok()
    }

    pub fn try_take(&mut self) -> Option<Failure> {
        self.rx.try_recv().ok()
    }
}

/// Create a connected signal/listener pair
pub fn failure_channel() -> (FailureSignal, FailureListener) {
    let (tx, rx) = oneshot::channel();
    (
        FailureSignal {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        FailureListener { rx },
    )
}
