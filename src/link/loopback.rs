//! In-process stand-in for the forwarding engine's control interface.
//!
//! Answers control pings on the reply path, optionally after a delay, and
//! can be told to go silent or to refuse sends so the keepalive and
//! correlation paths can be driven without a real engine.

use super::correlator::ReplyDispatcher;
use super::transport::{PingReply, Request, Transport, TransportError};
use crate::error::{AgentError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, warn};

pub struct LoopbackTransport {
    pid: u32,
    client_index: u32,
    dispatcher: Mutex<Option<ReplyDispatcher>>,
    responsive: AtomicBool,
    fail_sends: AtomicBool,
    reply_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<Request>>,
}

impl LoopbackTransport {
    pub fn new(pid: u32) -> Self {
        LoopbackTransport {
            pid,
            client_index: 1,
            dispatcher: Mutex::new(None),
            responsive: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            reply_delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Answer pings after `delay` instead of inline. Needs a tokio runtime.
    pub fn with_reply_delay(self, delay: Duration) -> Self {
        *self.reply_delay.lock() = Some(delay);
        self
    }

    /// A silent engine accepts requests but never replies.
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Every request accepted so far
    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }

    /// Push a reply through the reply path as if the engine had sent it.
    pub fn inject_reply(&self, reply: PingReply) -> Result<()> {
        let dispatcher = self.dispatcher.lock().clone();
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(reply),
            None => Err(AgentError::Transport("no reply handler registered".to_string())),
        }
    }

    fn reply_to(&self, request: &Request) {
        let dispatcher = match self.dispatcher.lock().clone() {
            Some(dispatcher) => dispatcher,
            None => {
                warn!(context = request.context(), "Reply path not registered, dropping reply");
                return;
            }
        };
        let reply = match request {
            Request::ControlPing { context, .. } => PingReply {
                retval: 0,
                pid: self.pid,
                context: *context,
            },
        };

        let delay = *self.reply_delay.lock();
        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = dispatcher.dispatch(reply) {
                        error!(error = %e, "Reply dispatch failed");
                    }
                });
            }
            None => {
                if let Err(e) = dispatcher.dispatch(reply) {
                    error!(error = %e, "Reply dispatch failed");
                }
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn client_index(&self) -> u32 {
        self.client_index
    }

    fn send(&self, request: Request) -> std::result::Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError("loopback send refused".to_string()));
        }
        self.sent.lock().push(request.clone());

        if self.responsive.load(Ordering::SeqCst) {
            self.reply_to(&request);
        }
        Ok(())
    }

    fn register_reply_handler(&self, dispatcher: ReplyDispatcher) {
        *self.dispatcher.lock() = Some(dispatcher);
    }
}
