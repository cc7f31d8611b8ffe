//! Management link correlation tests
//!
//! Drives the link through the loopback transport: context allocation under
//! contention, reply matching and protocol violations on the reply path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use vpp_agent::link::{LoopbackTransport, ManagementLink, PingReply};
use vpp_agent::{failure_channel, AgentError, Failure};

async fn connect(pid: u32) -> (Arc<LoopbackTransport>, Arc<ManagementLink>) {
    let transport = Arc::new(LoopbackTransport::new(pid));
    let link = ManagementLink::connect("correlation-test", transport.clone())
        .await
        .unwrap();
    (transport, Arc::new(link))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_context_ids_are_distinct() {
    let (_transport, link) = connect(11).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let link = link.clone();
            tokio::spawn(async move { (0..500).map(|_| link.next_context_id()).collect::<Vec<_>>() })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "context id {} handed out twice", id);
        }
    }
    assert_eq!(seen.len(), 16 * 500);
}

#[tokio::test]
async fn test_ping_sync_waits_for_its_own_context() {
    let (transport, link) = connect(77).await;
    transport.set_responsive(false);

    let waiter = {
        let link = link.clone();
        tokio::spawn(async move { link.ping_sync(7).await })
    };
    while link.pending() == 0 {
        tokio::task::yield_now().await;
    }

    // A reply for a context nobody registered is a violation, not a match.
    let err = transport
        .inject_reply(PingReply { retval: 0, pid: 77, context: 8 })
        .unwrap_err();
    assert!(matches!(err, AgentError::ProtocolViolation { context: 8 }));
    assert!(!waiter.is_finished());

    transport
        .inject_reply(PingReply { retval: 0, pid: 77, context: 7 })
        .unwrap();
    let (pid, context) = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!((pid, context), (77, 7));
    assert_eq!(link.pending(), 0);
}

#[tokio::test]
async fn test_duplicate_reply_raises_failure() {
    let (transport, link) = connect(5).await;
    let (signal, mut listener) = failure_channel();
    link.set_failure_signal(signal);

    let context = link.next_context_id();
    link.ping_sync(context).await.unwrap();

    let err = transport
        .inject_reply(PingReply { retval: 0, pid: 5, context })
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        listener.try_take(),
        Some(Failure::ProtocolViolation { context })
    );
}

#[tokio::test]
async fn test_connect_fails_when_transport_refuses() {
    let transport = Arc::new(LoopbackTransport::new(1));
    transport.fail_sends(true);

    let err = ManagementLink::connect("refused", transport).await.unwrap_err();
    assert!(matches!(err, AgentError::Transport(_)));
}
