//! Request/reply correlation over the management link
//!
//! The engine answers requests asynchronously on a separate notification
//! path, tagged only with the context id the caller chose. Each outbound
//! request registers a one-shot callback under its context; the inbound path
//! removes and runs it.
//!
//! ```text
//! Unsent ──ping()──▶ Sent (callback registered) ──dispatch_reply()──▶ Replied (entry removed)
//! ```
//!
//! A reply whose context has no entry is either a duplicate or an answer to
//! something never sent. Both are protocol violations and fatal.

use super::transport::{PingReply, Request, Transport};
use crate::error::{AgentError, Result};
use crate::signal::{Failure, FailureSignal};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

type ReplyCallback = Box<dyn FnOnce(u32, u32) + Send>;

struct PendingReplies {
    callbacks: Mutex<AHashMap<u32, ReplyCallback>>,
    failure: Mutex<Option<FailureSignal>>,
}

impl PendingReplies {
    fn raise(&self, failure: Failure) {
        if let Some(signal) = self.failure.lock().as_ref() {
            signal.raise(failure);
        }
    }
}

/// Inbound side of the link, handed to the transport.
#[derive(Clone)]
pub struct ReplyDispatcher {
    pending: Arc<PendingReplies>,
}

impl ReplyDispatcher {
    /// Resolve the request registered under `reply.context`.
    ///
    /// Fatal errors are also raised on the link's failure signal, if one is
    /// set, so a transport thread that cannot propagate the error still
    /// brings the agent down.
    pub fn dispatch(&self, reply: PingReply) -> Result<()> {
        debug!(retval = reply.retval, context = reply.context, "Control ping reply received");

        let callback = self.pending.callbacks.lock().remove(&reply.context);
        let callback = match callback {
            Some(callback) => callback,
            None => {
                error!(context = reply.context, "No pending request for control ping reply");
                self.pending.raise(Failure::ProtocolViolation {
                    context: reply.context,
                });
                return Err(AgentError::ProtocolViolation {
                    context: reply.context,
                });
            }
        };

        if reply.retval < 0 {
            error!(retval = reply.retval, context = reply.context, "Control ping failed");
            self.pending.raise(Failure::PingRejected {
                context: reply.context,
                retval: reply.retval,
            });
            return Err(AgentError::PingRejected {
                context: reply.context,
                retval: reply.retval,
            });
        }

        callback(reply.pid, reply.context);
        Ok(())
    }
}

/// Management link with request/reply correlation.
pub struct ManagementLink {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
    context_id: Mutex<u32>,
    pid: u32,
    keepalive_attached: Arc<AtomicBool>,
}

impl ManagementLink {
    /// Register the reply path with the transport and run the initial
    /// handshake ping on context 0.
    ///
    /// The handshake waits without a timeout; the transport is expected to
    /// be reachable once it has been handed over.
    pub async fn connect(name: impl Into<String>, transport: Arc<dyn Transport>) -> Result<Self> {
        let name = name.into();
        debug!(name = %name, "Attempting connect to management API");

        let pending = Arc::new(PendingReplies {
            callbacks: Mutex::new(AHashMap::new()),
            failure: Mutex::new(None),
        });
        transport.register_reply_handler(ReplyDispatcher {
            pending: pending.clone(),
        });

        let mut link = ManagementLink {
            name,
            transport,
            pending,
            context_id: Mutex::new(0),
            pid: 0,
            keepalive_attached: Arc::new(AtomicBool::new(false)),
        };

        let (pid, _) = link.ping_sync(0).await?;
        link.pid = pid;

        info!(
            name = %link.name,
            pid = link.pid,
            client_index = link.transport.client_index(),
            "Connected to management API"
        );
        Ok(link)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process id of the forwarding engine, learned during the handshake
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Report fatal reply-path errors on this signal.
    pub fn set_failure_signal(&self, signal: FailureSignal) {
        *self.pending.failure.lock() = Some(signal);
    }

    pub fn dispatcher(&self) -> ReplyDispatcher {
        ReplyDispatcher {
            pending: self.pending.clone(),
        }
    }

    /// Fresh context id, strictly increasing for the lifetime of the link.
    pub fn next_context_id(&self) -> u32 {
        let mut id = self.context_id.lock();
        debug!(current_context = *id, next_context = id.wrapping_add(1), "Getting next context ID");
        *id = id.wrapping_add(1);
        *id
    }

    /// Number of requests still waiting for a reply
    pub fn pending(&self) -> usize {
        self.pending.callbacks.lock().len()
    }

    /// Send a control ping tagged `context`; `on_reply(pid, context)` runs
    /// once when the reply is dispatched.
    pub fn ping<F>(&self, context: u32, on_reply: F) -> Result<()>
    where
        F: FnOnce(u32, u32) + Send + 'static,
    {
        debug!(context, "Invoking control ping");

        {
            let mut callbacks = self.pending.callbacks.lock();
            if callbacks.contains_key(&context) {
                return Err(AgentError::ContextInUse { context });
            }
            callbacks.insert(context, Box::new(on_reply));
        }

        let request = Request::ControlPing {
            client_index: self.transport.client_index(),
            context,
        };
        if let Err(e) = self.transport.send(request) {
            self.pending.callbacks.lock().remove(&context);
            return Err(AgentError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Drop the pending request for `context`, if any. A reply arriving for it
    /// afterwards is a protocol violation.
    pub fn cancel(&self, context: u32) -> bool {
        let removed = self.pending.callbacks.lock().remove(&context).is_some();
        if removed {
            debug!(context, "Pending request cancelled");
        }
        removed
    }

    /// Ping and wait for the reply. There is no timeout: use only where the
    /// link is already known to be reachable.
    pub async fn ping_sync(&self, context: u32) -> Result<(u32, u32)> {
        let (tx, rx) = oneshot::channel();
        self.ping(context, move |pid, ctx| {
            let _ = tx.send((pid, ctx));
        })?;
        rx.await.map_err(|_| AgentError::LinkClosed { context })
    }

    /// Claim the link's single keepalive slot. The guard releases it on drop.
    pub(crate) fn attach_keepalive(&self) -> Result<KeepaliveSlot> {
        if self.keepalive_attached.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyExists(format!(
                "keepalive watchdog for link '{}'",
                self.name
            )));
        }
        Ok(KeepaliveSlot {
            attached: self.keepalive_attached.clone(),
        })
    }
}

impl std::fmt::Debug for ManagementLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementLink")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("client_index", &self.transport.client_index())
            .finish()
    }
}

pub(crate) struct KeepaliveSlot {
    attached: Arc<AtomicBool>,
}

impl Drop for KeepaliveSlot {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}
