use super::correlator::ReplyDispatcher;
use std::fmt;

/// Requests the agent sends over the management link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ControlPing { client_index: u32, context: u32 },
}

impl Request {
    pub fn context(&self) -> u32 {
        match self {
            Request::ControlPing { context, .. } => *context,
        }
    }
}

/// The `(retval, pid, context)` triple carried by a control ping reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    pub retval: i32,
    pub pid: u32,
    pub context: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TransportError {}

/// Connection to the forwarding engine's control interface.
///
/// Replies never come back from `send`. The transport's inbound path hands
/// them to the [`ReplyDispatcher`] registered at connect time.
pub trait Transport: Send + Sync + 'static {
    /// Index assigned to this client by the engine
    fn client_index(&self) -> u32;

    fn send(&self, request: Request) -> Result<(), TransportError>;

    fn register_reply_handler(&self, dispatcher: ReplyDispatcher);
}
