//! Aggregation Engine
//!
//! Decouples collectors, which push stats at whatever rate they produce
//! them, from any number of subscribers (sinks) that each drain their own
//! queue at their own pace.
//!
//! ```text
//!  collectors ──submit──▶ inbound queue ──▶ CollectionCycle ──▶ subscriber queue ──▶ sink
//!                                              (one task)  ├──▶ subscriber queue ──▶ sink
//!                                                          └──▶ subscriber queue ──▶ sink
//! ```
//!
//! Each cycle drains what was queued when it began, wraps every accepted stat
//! into a [`TimestampedStat`] and hands one shared [`AggregatedBatch`] to every
//! registered subscriber. With [`FanOutPolicy::Block`] a full subscriber queue
//! suspends the cycle, which in turn fills the inbound queue and suspends the
//! collectors.
//!
//! A zero capacity makes a queue a rendezvous: the item carries an
//! acknowledgement and the sender waits until the receiving side took it.

use super::config::{AggregatorConfig, FanOutPolicy};
use super::types::{AggregatedBatch, SourceId, Stat, TimestampedStat};
use crate::error::{AgentError, Result};
use ahash::AHashMap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type BatchSender = mpsc::Sender<Handoff<Arc<AggregatedBatch>>>;

/// Queue item. `ack` is set only on zero-capacity queues and fires when the
/// receiver takes the item.
struct Handoff<T> {
    item: T,
    ack: Option<oneshot::Sender<()>>,
}

impl<T> Handoff<T> {
    fn queued(item: T) -> Self {
        Handoff { item, ack: None }
    }

    fn rendezvous(item: T) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Handoff { item, ack: Some(tx) }, rx)
    }

    fn take(self) -> T {
        if let Some(ack) = self.ack {
            let _ = ack.send(());
        }
        self.item
    }
}

/// Subscriber registry. Every mutation and every fan-out snapshot goes
/// through the one lock.
struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    next_id: u64,
    subscribers: BTreeMap<u64, BatchSender>,
    closed: bool,
}

impl Registry {
    fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                subscribers: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    fn register(&self, tx: BatchSender) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(AgentError::EngineClosed);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(id, tx);
        Ok(id)
    }

    /// Removing an id that is already gone is a no-op.
    fn remove(&self, id: u64) -> bool {
        self.inner.lock().subscribers.remove(&id).is_some()
    }

    fn snapshot(&self) -> Vec<(u64, BatchSender)> {
        self.inner
            .lock()
            .subscribers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    /// Drops every subscriber sender so their queues report closed once
    /// drained, and refuses further registrations.
    fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        count
    }

    fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// A live registration owning one outbound queue.
///
/// Dropping the subscription (or calling [`Subscription::close`]) removes it
/// from the engine and releases the queue.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Handoff<Arc<AggregatedBatch>>>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next batch, or `None` once the engine has closed and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Arc<AggregatedBatch>> {
        self.rx.recv().await.map(Handoff::take)
    }

    /// Blocking variant for delivery loops running on a blocking thread.
    /// Must not be called from within an async context.
    pub fn blocking_recv(&mut self) -> Option<Arc<AggregatedBatch>> {
        self.rx.blocking_recv().map(Handoff::take)
    }

    /// `Empty` while the engine is open but nothing is queued,
    /// `Disconnected` once it has closed and the queue is drained.
    pub fn try_recv(&mut self) -> std::result::Result<Arc<AggregatedBatch>, TryRecvError> {
        self.rx.try_recv().map(Handoff::take)
    }

    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.registry.remove(self.id) {
            debug!(subscription = self.id, "Subscription closed");
        }
        self.rx.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub struct AggregationEngine {
    name: String,
    config: AggregatorConfig,
    inbound: RwLock<Option<mpsc::Sender<Handoff<Stat>>>>,
    receiver: Mutex<Option<mpsc::Receiver<Handoff<Stat>>>>,
    registry: Arc<Registry>,
    cycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationEngine {
    /// Build an engine. Negative capacities are clamped to zero with a
    /// warning.
    pub fn new(name: impl Into<String>, config: AggregatorConfig) -> Self {
        let name = name.into();
        let config = config.normalized(&name);
        let (tx, rx) = mpsc::channel(config.inbound_buffer());

        debug!(
            aggregator = %name,
            inbound_capacity = config.inbound_capacity,
            outbound_capacity = config.outbound_capacity,
            suppress_duplicates = config.suppress_duplicates,
            "Aggregation engine created"
        );

        AggregationEngine {
            name,
            config,
            inbound: RwLock::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            registry: Arc::new(Registry::new()),
            cycle_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn inbound_sender(&self) -> Result<mpsc::Sender<Handoff<Stat>>> {
        self.inbound.read().clone().ok_or(AgentError::EngineClosed)
    }

    /// Enqueue a stat, waiting while the inbound queue is full. With a zero
    /// inbound capacity this returns only once the collection cycle took
    /// the stat.
    pub async fn submit(&self, stat: Stat) -> Result<()> {
        let tx = self.inbound_sender()?;
        if self.config.inbound_capacity > 0 {
            return tx
                .send(Handoff::queued(stat))
                .await
                .map_err(|_| AgentError::EngineClosed);
        }

        let (handoff, taken) = Handoff::rendezvous(stat);
        tx.send(handoff).await.map_err(|_| AgentError::EngineClosed)?;
        drop(tx);
        taken.await.map_err(|_| AgentError::EngineClosed)
    }

    /// Blocking variant of [`submit`](Self::submit) for collectors running
    /// outside the runtime. Must not be called from within an async context.
    pub fn blocking_submit(&self, stat: Stat) -> Result<()> {
        let tx = self.inbound_sender()?;
        if self.config.inbound_capacity > 0 {
            return tx
                .blocking_send(Handoff::queued(stat))
                .map_err(|_| AgentError::EngineClosed);
        }

        let (handoff, taken) = Handoff::rendezvous(stat);
        tx.blocking_send(handoff).map_err(|_| AgentError::EngineClosed)?;
        drop(tx);
        taken.blocking_recv().map_err(|_| AgentError::EngineClosed)
    }

    /// Register a new subscriber with its own outbound queue.
    pub fn subscribe(&self) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer());
        let id = self.registry.register(tx)?;
        debug!(aggregator = %self.name, subscription = id, "Subscriber registered");
        Ok(Subscription {
            id,
            rx,
            registry: self.registry.clone(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Launch the collection-cycle task. The task owns the inbound queue, so
    /// an engine can only be started once.
    pub fn start(&self, source_id: SourceId) -> Result<()> {
        let rx = self
            .receiver
            .lock()
            .take()
            .ok_or(AgentError::EngineMisuse("engine started twice or after close"))?;

        let cycle = CollectionCycle {
            aggregator: self.name.clone(),
            source_id,
            rx,
            registry: self.registry.clone(),
            suppress_duplicates: self.config.suppress_duplicates,
            fan_out: self.config.fan_out,
            rendezvous: self.config.outbound_capacity == 0,
            last_seen: AHashMap::new(),
        };

        let handle = tokio::spawn(cycle.run());
        *self.cycle_task.lock() = Some(handle);
        Ok(())
    }

    /// Close the inbound queue, wait for the collection task to forward what
    /// was already queued, then close every subscriber queue.
    pub async fn close(&self) {
        let tx = self.inbound.write().take();
        if tx.is_none() {
            debug!(aggregator = %self.name, "Aggregation engine already closed");
            return;
        }
        drop(tx);

        let task = self.cycle_task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!(aggregator = %self.name, error = %e, "Collection cycle task failed");
                    self.registry.close_all();
                }
            }
            None => {
                self.receiver.lock().take();
                self.registry.close_all();
            }
        }

        info!(aggregator = %self.name, "Aggregation engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.read().is_none()
    }
}

enum CycleEnd {
    /// More cycles follow
    Open,
    /// The inbound queue is closed and drained
    Closed,
}

/// The single task that owns the inbound queue.
struct CollectionCycle {
    aggregator: String,
    source_id: SourceId,
    rx: mpsc::Receiver<Handoff<Stat>>,
    registry: Arc<Registry>,
    suppress_duplicates: bool,
    fan_out: FanOutPolicy,
    /// Zero outbound capacity: wait until each subscriber took the batch
    rendezvous: bool,
    /// Last payload accepted per type tag
    last_seen: AHashMap<String, serde_json::Value>,
}

impl CollectionCycle {
    async fn run(mut self) {
        info!(
            aggregator = %self.aggregator,
            source = %self.source_id,
            "Collection cycle started"
        );

        loop {
            let (batch, end) = self.collect().await;

            if let Some(batch) = batch {
                info!(
                    aggregator = %self.aggregator,
                    batch_size = batch.len(),
                    "Batch aggregated, forwarding"
                );
                self.forward(Arc::new(batch)).await;
            }

            if let CycleEnd::Closed = end {
                info!(aggregator = %self.aggregator, "Inbound queue closed");
                break;
            }
        }

        let closed = self.registry.close_all();
        debug!(aggregator = %self.aggregator, subscriptions = closed, "Subscriber queues closed");
    }

    /// Wait for the first stat, then take exactly as many more as were
    /// queued at that moment.
    async fn collect(&mut self) -> (Option<AggregatedBatch>, CycleEnd) {
        let first = match self.rx.recv().await {
            Some(handoff) => handoff.take(),
            None => return (None, CycleEnd::Closed),
        };
        let queued = self.rx.len();

        let mut stats = Vec::with_capacity(queued + 1);
        let mut end = CycleEnd::Open;
        self.accept(first, &mut stats);

        for _ in 0..queued {
            match self.rx.try_recv() {
                Ok(handoff) => self.accept(handoff.take(), &mut stats),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    end = CycleEnd::Closed;
                    break;
                }
            }
        }

        (AggregatedBatch::new(self.source_id.clone(), stats), end)
    }

    fn accept(&mut self, stat: Stat, batch: &mut Vec<TimestampedStat>) {
        if self.suppress_duplicates {
            if self.last_seen.get(stat.type_tag()) == Some(stat.payload()) {
                debug!(stat_type = stat.type_tag(), stat = %stat.payload(), "Ignoring stat");
                return;
            }
            self.last_seen
                .insert(stat.type_tag().to_string(), stat.payload().clone());
        }

        let (stat_type, payload) = stat.into_parts();
        debug!(stat_type = %stat_type, stat = %payload, "Stat received, aggregating");
        batch.push(TimestampedStat {
            source_id: self.source_id.clone(),
            timestamp: Utc::now(),
            stat_type,
            stat: payload,
        });
    }

    async fn forward(&self, batch: Arc<AggregatedBatch>) {
        for (id, tx) in self.registry.snapshot() {
            match self.fan_out {
                FanOutPolicy::Block if self.rendezvous => {
                    let (handoff, taken) = Handoff::rendezvous(batch.clone());
                    if tx.send(handoff).await.is_err() || taken.await.is_err() {
                        self.registry.remove(id);
                    }
                }
                FanOutPolicy::Block => {
                    if tx.send(Handoff::queued(batch.clone())).await.is_err() {
                        self.registry.remove(id);
                    }
                }
                FanOutPolicy::DropIfFull => match tx.try_send(Handoff::queued(batch.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            aggregator = %self.aggregator,
                            subscription = id,
                            batch_size = batch.len(),
                            "Subscriber queue full, dropping batch"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.registry.remove(id);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Serialize)]
    struct TestStat {
        name: &'static str,
        number: u32,
    }

    fn source() -> SourceId {
        SourceId::new("vpp-test")
    }

    #[tokio::test]
    async fn test_single_stat_reaches_subscriber() {
        let engine = AggregationEngine::new("test", AggregatorConfig::new(0, 0));
        engine.start(source()).unwrap();
        let mut sub = engine.subscribe().unwrap();

        engine
            .submit(Stat::new("test", json!({"stat": "x"})))
            .await
            .unwrap();

        let batch = timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("subscriber should receive a batch")
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.stats()[0].stat, json!({"stat": "x"}));
        assert_eq!(batch.source_id(), &source());

        engine.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_suppression_per_type() {
        let engine = AggregationEngine::new(
            "filtering",
            AggregatorConfig::new(16, 16).with_duplicate_suppression(),
        );
        let mut sub = engine.subscribe().unwrap();

        let stat = Stat::of(&TestStat { name: "stat", number: 44 }).unwrap();
        for _ in 0..4 {
            engine.submit(stat.clone()).await.unwrap();
        }
        engine
            .submit(Stat::new("other", json!({"name": "stat", "number": 44})))
            .await
            .unwrap();

        engine.start(source()).unwrap();
        engine.close().await;

        let mut received = Vec::new();
        while let Some(batch) = sub.recv().await {
            received.extend(batch.stats().iter().map(|s| s.stat_type.clone()));
        }
        assert_eq!(received.len(), 2);
        assert!(received[0].ends_with("TestStat"));
        assert_eq!(received[1], "other");
    }

    #[tokio::test]
    async fn test_changed_value_passes_suppression() {
        let engine = AggregationEngine::new(
            "filtering",
            AggregatorConfig::new(16, 16).with_duplicate_suppression(),
        );
        let mut sub = engine.subscribe().unwrap();

        engine.submit(Stat::new("state", json!("up"))).await.unwrap();
        engine.submit(Stat::new("state", json!("down"))).await.unwrap();
        engine.submit(Stat::new("state", json!("up"))).await.unwrap();
        engine.start(source()).unwrap();
        engine.close().await;

        let batch = sub.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cycle_drains_queued_stats_into_one_batch() {
        let engine = AggregationEngine::new("test", AggregatorConfig::new(8, 4));
        let mut sub = engine.subscribe().unwrap();
        for i in 0..5 {
            engine.submit(Stat::new("n", json!(i))).await.unwrap();
        }

        engine.start(source()).unwrap();
        let batch = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        let values: Vec<_> = batch.stats().iter().map(|s| s.stat.clone()).collect();
        assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_submit_after_close_is_rejected() {
        let engine = AggregationEngine::new("test", AggregatorConfig::default());
        engine.start(source()).unwrap();
        engine.close().await;

        let result = engine.submit(Stat::new("late", json!(1))).await;
        assert!(matches!(result, Err(AgentError::EngineClosed)));
        assert!(matches!(engine.subscribe(), Err(AgentError::EngineClosed)));
    }

    #[tokio::test]
    async fn test_double_start_is_misuse() {
        let engine = AggregationEngine::new("test", AggregatorConfig::default());
        engine.start(source()).unwrap();
        assert!(matches!(
            engine.start(source()),
            Err(AgentError::EngineMisuse(_))
        ));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_subscription_close_is_idempotent_for_registry() {
        let engine = AggregationEngine::new("test", AggregatorConfig::default());
        let a = engine.subscribe().unwrap();
        let b = engine.subscribe().unwrap();
        assert_eq!(engine.subscriber_count(), 2);

        let a_id = a.id();
        a.close();
        assert!(!engine.registry.remove(a_id));
        assert_eq!(engine.subscriber_count(), 1);

        drop(b);
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_blocks_when_inbound_full() {
        let engine = AggregationEngine::new("test", AggregatorConfig::new(1, 1));
        engine.submit(Stat::new("n", json!(1))).await.unwrap();

        // Not started: nothing drains the inbound queue
        let blocked = timeout(
            Duration::from_millis(50),
            engine.submit(Stat::new("n", json!(2))),
        )
        .await;
        assert!(blocked.is_err(), "submit should wait for room");
    }

    #[tokio::test]
    async fn test_zero_capacity_submit_waits_for_cycle() {
        let engine = AggregationEngine::new("test", AggregatorConfig::new(0, 4));
        let mut sub = engine.subscribe().unwrap();

        // Not started: nobody takes the stat
        let pending = timeout(
            Duration::from_millis(100),
            engine.submit(Stat::new("n", json!(1))),
        )
        .await;
        assert!(pending.is_err(), "rendezvous submit must wait for the cycle");

        engine.start(source()).unwrap();
        timeout(Duration::from_secs(5), engine.submit(Stat::new("n", json!(2))))
            .await
            .expect("started cycle takes the stat")
            .unwrap();

        engine.close().await;
        let mut values = Vec::new();
        while let Some(batch) = sub.recv().await {
            values.extend(batch.stats().iter().map(|s| s.stat.clone()));
        }
        assert_eq!(values.last(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_zero_capacity_fan_out_waits_for_subscriber() {
        let engine = Arc::new(AggregationEngine::new("test", AggregatorConfig::new(0, 0)));
        let mut sub = engine.subscribe().unwrap();
        engine.start(source()).unwrap();

        engine.submit(Stat::new("n", json!(1))).await.unwrap();
        // The cycle holds batch [1] until the subscriber takes it, so it
        // cannot take the next stat.
        let stalled = timeout(
            Duration::from_millis(100),
            engine.submit(Stat::new("n", json!(2))),
        )
        .await;
        assert!(stalled.is_err());

        let first = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.stats()[0].stat, json!(1));
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));

        let reader = tokio::spawn(async move {
            let mut values = Vec::new();
            while let Some(batch) = sub.recv().await {
                values.extend(batch.stats().iter().map(|s| s.stat.clone()));
            }
            values
        });
        timeout(Duration::from_secs(5), engine.submit(Stat::new("n", json!(3))))
            .await
            .expect("submit resumes once the subscriber drains")
            .unwrap();
        engine.close().await;

        let values = reader.await.unwrap();
        assert_eq!(values.last(), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_try_recv_reports_disconnect_after_close() {
        let engine = AggregationEngine::new("test", AggregatorConfig::new(4, 4));
        let mut sub = engine.subscribe().unwrap();
        engine.start(source()).unwrap();
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));

        engine.submit(Stat::new("n", json!(1))).await.unwrap();
        engine.close().await;

        assert_eq!(sub.try_recv().unwrap().len(), 1);
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn test_full_subscriber_blocks_submitters() {
        let engine = AggregationEngine::new("test", AggregatorConfig::new(1, 1));
        let mut stalled = engine.subscribe().unwrap();
        engine.start(source()).unwrap();

        let mut accepted = 0u32;
        let mut blocked = false;
        for i in 0..16u32 {
            match timeout(Duration::from_millis(100), engine.submit(Stat::new("n", json!(i)))).await {
                Ok(result) => {
                    result.unwrap();
                    accepted += 1;
                }
                Err(_) => {
                    blocked = true;
                    break;
                }
            }
        }
        assert!(blocked, "a stalled subscriber must stall submit");
        assert!(accepted >= 1);

        let reader = tokio::spawn(async move {
            let mut count = 0;
            while let Some(batch) = stalled.recv().await {
                count += batch.len();
            }
            count
        });
        timeout(Duration::from_secs(5), engine.submit(Stat::new("n", json!(99))))
            .await
            .expect("submit resumes once the subscriber drains")
            .unwrap();
        engine.close().await;

        assert_eq!(reader.await.unwrap(), accepted as usize + 1);
    }

    #[tokio::test]
    async fn test_drop_if_full_keeps_fast_subscriber_flowing() {
        let engine = AggregationEngine::new(
            "test",
            AggregatorConfig::new(1, 1).with_fan_out(FanOutPolicy::DropIfFull),
        );
        let _slow = engine.subscribe().unwrap();
        let mut fast = engine.subscribe().unwrap();
        engine.start(source()).unwrap();

        for i in 0..3 {
            engine.submit(Stat::new("n", json!(i))).await.unwrap();
            let batch = timeout(Duration::from_secs(5), fast.recv())
                .await
                .expect("fast subscriber must not be stalled")
                .unwrap();
            assert_eq!(batch.stats()[0].stat, json!(i));
        }

        engine.close().await;
    }
}
