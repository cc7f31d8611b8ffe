//! Keepalive watchdog
//!
//! Pings the forwarding engine on a fixed interval and waits a bounded time
//! for each reply. The first missed reply raises the failure signal and ends
//! the watchdog; restarting is the owning process's job.

use crate::error::{AgentError, Result};
use crate::link::{KeepaliveSlot, ManagementLink};
use crate::signal::{Failure, FailureSignal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepaliveConfig {
    /// Seconds between pings
    #[serde(default = "default_secs")]
    pub interval_secs: u64,
    /// Seconds to wait for each reply
    #[serde(default = "default_secs")]
    pub timeout_secs: u64,
}

fn default_secs() -> u64 {
    10
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval_secs: default_secs(),
            timeout_secs: default_secs(),
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub struct KeepaliveWatchdog {
    link: Arc<ManagementLink>,
    interval: Duration,
    timeout: Duration,
    failure: FailureSignal,
    _slot: KeepaliveSlot,
}

impl KeepaliveWatchdog {
    /// One watchdog per link; a second one is refused until the first is
    /// dropped.
    pub fn new(
        link: Arc<ManagementLink>,
        interval: Duration,
        timeout: Duration,
        failure: FailureSignal,
    ) -> Result<Self> {
        let slot = link.attach_keepalive()?;
        debug!(link = link.name(), ?interval, ?timeout, "Keepalive watchdog created");
        Ok(KeepaliveWatchdog {
            link,
            interval,
            timeout,
            failure,
            _slot: slot,
        })
    }

    pub fn from_config(
        link: Arc<ManagementLink>,
        config: &KeepaliveConfig,
        failure: FailureSignal,
    ) -> Result<Self> {
        Self::new(link, config.interval(), config.timeout(), failure)
    }

    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(stop))
    }

    /// Ping until a ping goes unanswered or `stop` is cancelled. The stop token is
    /// only observed between pings.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        info!(link = self.link.name(), interval = ?self.interval, "Keepalive started");

        loop {
            self.check_liveness().await?;

            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(link = self.link.name(), "Stopping keepalive");
                    return Ok(());
                }
                _ = sleep(self.interval) => {}
            }
        }
    }

    async fn check_liveness(&self) -> Result<()> {
        let context = self.link.next_context_id();
        debug!(context, "Executing keepalive ping");

        let (tx, rx) = oneshot::channel();
        let sent = self.link.ping(context, move |_, ctx| {
            let _ = tx.send(ctx);
        });
        if let Err(e) = sent {
            error!(context, error = %e, "Keepalive ping could not be sent");
            self.failure.raise(Failure::LivenessTimeout { context });
            return Err(e);
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(_)) => {
                debug!(context, "Keepalive executed successfully");
                Ok(())
            }
            _ => {
                self.link.cancel(context);
                error!(context, timeout = ?self.timeout, "Keepalive failed");
                self.failure.raise(Failure::LivenessTimeout { context });
                Err(AgentError::LivenessTimeout { context })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LoopbackTransport, PingReply};
    use crate::signal::failure_channel;

    async fn link_with(transport: Arc<LoopbackTransport>) -> Arc<ManagementLink> {
        Arc::new(
            ManagementLink::connect("keepalive-test", transport)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_healthy_link_keeps_probing_until_stopped() {
        let transport = Arc::new(LoopbackTransport::new(7));
        let link = link_with(transport.clone()).await;
        let (signal, mut listener) = failure_channel();

        let watchdog = KeepaliveWatchdog::new(
            link.clone(),
            Duration::from_millis(10),
            Duration::from_millis(200),
            signal,
        )
        .unwrap();
        let stop = CancellationToken::new();
        let handle = watchdog.spawn(stop.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(listener.try_take().is_none());
        // handshake plus several pings
        assert!(transport.sent().len() >= 3);
        assert_eq!(link.pending(), 0);
    }

    #[tokio::test]
    async fn test_silent_link_raises_failure_once() {
        let transport = Arc::new(LoopbackTransport::new(7));
        let link = link_with(transport.clone()).await;
        transport.set_responsive(false);
        let (signal, listener) = failure_channel();

        let watchdog = KeepaliveWatchdog::new(
            link.clone(),
            Duration::from_millis(10),
            Duration::from_millis(30),
            signal.clone(),
        )
        .unwrap();
        let result = watchdog.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(AgentError::LivenessTimeout { context: 1 })));
        // the timed-out ping no longer waits for a reply
        assert_eq!(link.pending(), 0);
        let late = transport.inject_reply(PingReply { retval: 0, pid: 7, context: 1 });
        assert!(matches!(late, Err(AgentError::ProtocolViolation { context: 1 })));
        assert!(signal.is_raised());
        assert_eq!(
            listener.wait().await,
            Some(Failure::LivenessTimeout { context: 1 })
        );
    }

    #[tokio::test]
    async fn test_slow_reply_within_timeout_is_healthy() {
        let transport = Arc::new(
            LoopbackTransport::new(7).with_reply_delay(Duration::from_millis(20)),
        );
        let link = link_with(transport).await;
        let (signal, mut listener) = failure_channel();

        let watchdog = KeepaliveWatchdog::new(
            link,
            Duration::from_millis(5),
            Duration::from_millis(500),
            signal,
        )
        .unwrap();
        let stop = CancellationToken::new();
        let handle = watchdog.spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert!(listener.try_take().is_none());
    }

    #[tokio::test]
    async fn test_second_watchdog_on_link_is_refused() {
        let link = link_with(Arc::new(LoopbackTransport::new(7))).await;
        let (signal, _listener) = failure_channel();

        let first = KeepaliveWatchdog::from_config(
            link.clone(),
            &KeepaliveConfig::default(),
            signal.clone(),
        )
        .unwrap();
        assert!(matches!(
            KeepaliveWatchdog::from_config(link.clone(), &KeepaliveConfig::default(), signal.clone()),
            Err(AgentError::AlreadyExists(_))
        ));

        drop(first);
        assert!(KeepaliveWatchdog::from_config(link, &KeepaliveConfig::default(), signal).is_ok());
    }
}
