//! Management link to the packet-forwarding engine

mod correlator;
mod loopback;
mod transport;

pub use correlator::{ManagementLink, ReplyDispatcher};
pub(crate) use correlator::KeepaliveSlot;
pub use loopback::LoopbackTransport;
pub use transport::{PingReply, Request, Transport, TransportError};
