//! Agent error taxonomy
//!
//! Recoverable conditions (configuration clamping, individual delivery
//! failures) are logged where they happen and never leave their loop.
//! Everything that does surface as an `AgentError` is classified by
//! [`AgentError::is_fatal`].

use std::fmt;
use std::io;

/// Error raised by a single sink encode or deliver call.
#[derive(Debug)]
pub enum DeliveryError {
    /// The stat could not be encoded in the sink's output format
    Encode(String),
    /// The encoded bytes could not be written or sent
    Io(io::Error),
    /// Sink-specific failure (broker rejected the message, etc.)
    Rejected(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Encode(msg) => write!(f, "encode failed: {}", msg),
            DeliveryError::Io(e) => write!(f, "write failed: {}", e),
            DeliveryError::Rejected(msg) => write!(f, "delivery rejected: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DeliveryError {
    fn from(e: io::Error) -> Self {
        DeliveryError::Io(e)
    }
}

#[derive(Debug)]
pub enum AgentError {
    /// Invalid configuration that cannot be clamped into a usable value
    Configuration(String),
    /// `submit`/`subscribe` on an engine whose inbound queue is closed
    EngineClosed,
    /// Programming error against the aggregation engine (double start, etc.)
    EngineMisuse(&'static str),
    /// Reply for a context that has no pending request
    ProtocolViolation { context: u32 },
    /// The forwarding engine answered a ping with a negative return value
    PingRejected { context: u32, retval: i32 },
    /// A request is already pending under this context
    ContextInUse { context: u32 },
    /// The reply path went away before the reply arrived
    LinkClosed { context: u32 },
    /// The transport refused the outbound request
    Transport(String),
    /// Keepalive reply did not arrive within the bounded wait
    LivenessTimeout { context: u32 },
    /// A single delivery failure (recoverable below the threshold)
    Delivery(DeliveryError),
    /// A sink hit its consecutive-failure threshold
    DeliveryThresholdExceeded { sink: String, failures: u32 },
    /// A component that may only exist once per owner was created twice
    AlreadyExists(String),
    /// A collected value could not be captured as a stat payload
    Serialize(serde_json::Error),
    Io(io::Error),
}

impl AgentError {
    /// Fatal errors stop the owning task and must reach the failure signal
    /// or terminate the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AgentError::Configuration(_) | AgentError::Delivery(_) | AgentError::Serialize(_)
        )
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Configuration(msg) => write!(f, "invalid configuration: {}", msg),
            AgentError::EngineClosed => write!(f, "aggregation engine is closed"),
            AgentError::EngineMisuse(msg) => write!(f, "aggregation engine misuse: {}", msg),
            AgentError::ProtocolViolation { context } => {
                write!(f, "protocol violation: no pending request for context {}", context)
            }
            AgentError::PingRejected { context, retval } => {
                write!(f, "control ping {} failed with retval {}", context, retval)
            }
            AgentError::ContextInUse { context } => {
                write!(f, "context {} already has a pending request", context)
            }
            AgentError::LinkClosed { context } => {
                write!(f, "management link dropped the reply for context {}", context)
            }
            AgentError::Transport(msg) => write!(f, "transport error: {}", msg),
            AgentError::LivenessTimeout { context } => {
                write!(f, "keepalive timed out waiting for context {}", context)
            }
            AgentError::Delivery(e) => write!(f, "delivery error: {}", e),
            AgentError::DeliveryThresholdExceeded { sink, failures } => write!(
                f,
                "sink '{}' failed {} consecutive deliveries",
                sink, failures
            ),
            AgentError::AlreadyExists(what) => write!(f, "{} already exists", what),
            AgentError::Serialize(e) => write!(f, "stat serialization failed: {}", e),
            AgentError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Delivery(e) => Some(e),
            AgentError::Serialize(e) => Some(e),
            AgentError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeliveryError> for AgentError {
    fn from(e: DeliveryError) -> Self {
        AgentError::Delivery(e)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialize(e)
    }
}

impl From<io::Error> for AgentError {
    fn from(e: io::Error) -> Self {
        AgentError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
