//! Dispatcher: turns subscriber streams into isolated, typed handler calls
//!
//! Topology: one pump task per [`Sub`] feeding a single bounded queue shared
//! by all subscriptions, drained by a small worker pool. A slow or failing
//! handler costs at most `handler_timeout` of one worker and never stops the
//! pumps or the other workers.
//!
//! Because the queue is shared, overflow drops and delivery order are
//! global: a burst on one topic can delay another topic, and order is only
//! preserved within a single subscription.

mod queue;
mod sub;

pub use sub::{DecodeFailure, Decoded, FailureKind, Payload, Sub};

use crate::ctx::CtxFactory;
use crate::error::{BusError, Result};
use crate::metrics::Metrics;
use crate::provider::{MessageStream, Subscriber};
use crate::topic::{self, TopicRegistry};
use crate::types::Envelope;
use futures::{FutureExt, StreamExt};
use queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::Instrument;

/// What to do with a new entry when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Evict the globally oldest entry to make room
    #[default]
    DropOldest,
    /// Discard the new entry
    DropNew,
    /// Wait for room, at most `handler_timeout`
    Block,
}

impl OverflowStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowStrategy::DropOldest => "drop_oldest",
            OverflowStrategy::DropNew => "drop_new",
            OverflowStrategy::Block => "block",
        }
    }
}

impl std::fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowStrategy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drop_oldest" => Ok(OverflowStrategy::DropOldest),
            "drop_new" => Ok(OverflowStrategy::DropNew),
            "block" => Ok(OverflowStrategy::Block),
            other => Err(BusError::Config(format!(
                "Unknown overflow strategy '{}' (expected drop_oldest, drop_new or block)",
                other
            ))),
        }
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// Capacity of the shared queue
    pub queue_size: usize,

    /// Number of worker tasks draining the queue
    pub workers: usize,

    /// Upper bound for one handler call, and for a `Block` enqueue
    pub handler_timeout: Duration,

    pub overflow: OverflowStrategy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            workers: 1,
            handler_timeout: Duration::from_secs(10),
            overflow: OverflowStrategy::DropOldest,
        }
    }
}

struct Entry<P> {
    sub: Arc<Sub<P>>,
    envelope: Envelope,
    payload: Payload,
}

struct Inner<P> {
    subscriber: Arc<dyn Subscriber>,
    registry: Arc<TopicRegistry>,
    subs: Vec<Arc<Sub<P>>>,
    queue: BoundedQueue<Entry<P>>,
    ctx_factory: CtxFactory<P>,
    options: DispatchOptions,
    metrics: Arc<Metrics>,
}

/// Backpressure-aware dispatcher
pub struct Dispatcher<P = ()> {
    inner: Arc<Inner<P>>,
    tasks: Mutex<Vec<AbortHandle>>,
    stopped: AtomicBool,
}

impl<P: Send + Sync + 'static> Dispatcher<P> {
    /// Build a dispatcher; fails on malformed topic filters or options
    pub fn new(
        subscriber: Arc<dyn Subscriber>,
        registry: Arc<TopicRegistry>,
        subs: Vec<Sub<P>>,
        ctx_factory: CtxFactory<P>,
        metrics: Arc<Metrics>,
        options: DispatchOptions,
    ) -> Result<Self> {
        if options.workers == 0 {
            return Err(BusError::Config("Dispatcher needs at least one worker".to_string()));
        }
        if options.queue_size == 0 {
            return Err(BusError::Config("Queue size must be positive".to_string()));
        }
        if options.handler_timeout.is_zero() {
            return Err(BusError::Config("Handler timeout must be positive".to_string()));
        }
        for sub in &subs {
            topic::validate_filter(sub.topic())?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                subscriber,
                registry,
                subs: subs.into_iter().map(Arc::new).collect(),
                queue: BoundedQueue::new(options.queue_size),
                ctx_factory,
                options,
                metrics,
            }),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Start every pump and worker and wait for them
    ///
    /// Returns once all tasks have ended, normally after [`Dispatcher::stop`].
    /// Fails only if a subscription stream cannot be opened.
    pub async fn run(&self) -> Result<()> {
        let mut streams: Vec<(Arc<Sub<P>>, MessageStream)> = Vec::with_capacity(self.inner.subs.len());
        for sub in &self.inner.subs {
            let stream = self.inner.subscriber.messages(sub.topic(), sub.qos()).await?;
            streams.push((sub.clone(), stream));
        }

        let mut handles = Vec::with_capacity(streams.len() + self.inner.options.workers);
        for (sub, stream) in streams {
            handles.push(tokio::spawn(pump(self.inner.clone(), sub, stream)));
        }
        for worker_id in 0..self.inner.options.workers {
            handles.push(tokio::spawn(worker(self.inner.clone(), worker_id)));
        }

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles.iter().map(|h| h.abort_handle()));

        // stop() may have run while the streams were being opened
        if self.stopped.load(Ordering::Acquire) {
            self.stop();
        }

        tracing::info!(
            subscriptions = self.inner.subs.len(),
            workers = self.inner.options.workers,
            queue_size = self.inner.queue.capacity(),
            overflow = %self.inner.options.overflow,
            "Dispatcher running"
        );

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "Dispatcher task panicked");
                }
            }
        }
        Ok(())
    }

    /// Cancel all tasks and discard whatever is still queued
    ///
    /// Returns the number of discarded entries.
    pub fn stop(&self) -> usize {
        self.stopped.store(true, Ordering::Release);
        let handles: Vec<AbortHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in &handles {
            handle.abort();
        }

        let drained = self.inner.queue.drain();
        tracing::info!(tasks = handles.len(), drained, "Dispatcher stopped");
        drained
    }

    /// Entries currently waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Sub<P>> {
        self.inner.subs.iter().map(|s| s.as_ref())
    }
}

async fn pump<P: Send + Sync + 'static>(inner: Arc<Inner<P>>, sub: Arc<Sub<P>>, mut stream: MessageStream) {
    while let Some(raw) = stream.next().await {
        Metrics::incr(&inner.metrics.received);

        match sub.decode(&inner.registry, &raw) {
            Decoded::Message { envelope, payload } => {
                // Overflow outcomes are logged and counted inside enqueue
                let _ = inner
                    .enqueue(Entry {
                        sub: sub.clone(),
                        envelope,
                        payload,
                    })
                    .await;
            }
            Decoded::Failure(failure) => {
                let counter = match failure.kind {
                    FailureKind::DecodeFailed => &inner.metrics.decode_failed,
                    FailureKind::ValidationFailed => &inner.metrics.validation_failed,
                    FailureKind::UnknownTopic => &inner.metrics.unknown_topic,
                };
                Metrics::incr(counter);
                tracing::warn!(
                    event = failure.kind.as_str(),
                    topic = %raw.topic,
                    model = sub.model(),
                    reason = %failure.reason,
                    "Dropping message"
                );
            }
        }
    }

    tracing::debug!(topic = %sub.topic(), "Subscription stream ended");
}

async fn worker<P: Send + Sync + 'static>(inner: Arc<Inner<P>>, worker_id: usize) {
    tracing::debug!(worker_id, "Dispatch worker started");
    loop {
        let entry = inner.queue.pop().await;
        inner.deliver(entry).await;
    }
}

impl<P: Send + Sync + 'static> Inner<P> {
    async fn enqueue(&self, entry: Entry<P>) -> Result<()> {
        let entry = match self.queue.try_push(entry) {
            Ok(()) => {
                Metrics::incr(&self.metrics.enqueued);
                return Ok(());
            }
            Err(entry) => entry,
        };

        let strategy = self.options.overflow;
        let overflow = |entry: &Entry<P>| BusError::QueueOverflow {
            strategy: strategy.to_string(),
            topic: entry.sub.topic().to_string(),
        };

        match strategy {
            OverflowStrategy::DropOldest => {
                if let Some(oldest) = self.queue.pop_front() {
                    Metrics::incr(&self.metrics.dropped_oldest);
                    tracing::warn!(
                        event = "dropped_oldest",
                        topic = %oldest.sub.topic(),
                        envelope_id = %oldest.envelope.id(),
                        "Queue full, evicted oldest entry"
                    );
                }

                match self.queue.try_push(entry) {
                    Ok(()) => {
                        Metrics::incr(&self.metrics.enqueued);
                        Ok(())
                    }
                    Err(entry) => {
                        Metrics::incr(&self.metrics.dropped_new);
                        tracing::warn!(
                            event = "dropped_new_after_evict",
                            topic = %entry.sub.topic(),
                            envelope_id = %entry.envelope.id(),
                            "Queue refilled during eviction, dropped new entry"
                        );
                        Err(overflow(&entry))
                    }
                }
            }
            OverflowStrategy::DropNew => {
                Metrics::incr(&self.metrics.dropped_new);
                tracing::warn!(
                    event = "dropped_new",
                    topic = %entry.sub.topic(),
                    envelope_id = %entry.envelope.id(),
                    "Queue full, dropped new entry"
                );
                Err(overflow(&entry))
            }
            OverflowStrategy::Block => {
                let err = overflow(&entry);
                let envelope_id = entry.envelope.id().to_string();

                match tokio::time::timeout(self.options.handler_timeout, self.queue.push(entry)).await {
                    Ok(()) => {
                        Metrics::incr(&self.metrics.enqueued);
                        Ok(())
                    }
                    Err(_) => {
                        Metrics::incr(&self.metrics.block_timeouts);
                        tracing::warn!(
                            event = "block_timeout",
                            envelope_id = %envelope_id,
                            timeout_ms = self.options.handler_timeout.as_millis() as u64,
                            "Queue stayed full, dropped new entry"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    async fn deliver(&self, entry: Entry<P>) {
        let Entry {
            sub,
            envelope,
            payload,
        } = entry;

        let envelope_id = envelope.id().to_string();
        let ctx = (self.ctx_factory)(&envelope);
        let span = ctx.span().clone();
        let call = AssertUnwindSafe(sub.call(ctx, envelope, payload))
            .catch_unwind()
            .instrument(span);

        match tokio::time::timeout(self.options.handler_timeout, call).await {
            Ok(Ok(Ok(()))) => {
                Metrics::incr(&self.metrics.delivered);
            }
            Ok(Ok(Err(BusError::Validation { target, reason }))) => {
                Metrics::incr(&self.metrics.revalidate_failed);
                tracing::warn!(
                    event = "payload_revalidate_failed",
                    topic = %sub.topic(),
                    envelope_id = %envelope_id,
                    model = %target,
                    reason = %reason,
                    "Handler rejected payload"
                );
            }
            Ok(Ok(Err(e))) => {
                Metrics::incr(&self.metrics.handler_errors);
                tracing::warn!(
                    event = "handler_failed",
                    topic = %sub.topic(),
                    envelope_id = %envelope_id,
                    error = %e,
                    "Handler failed"
                );
            }
            Ok(Err(_panic)) => {
                Metrics::incr(&self.metrics.handler_errors);
                tracing::error!(
                    event = "handler_failed",
                    topic = %sub.topic(),
                    envelope_id = %envelope_id,
                    "Handler panicked"
                );
            }
            Err(_) => {
                Metrics::incr(&self.metrics.handler_timeouts);
                let err = BusError::HandlerTimeout {
                    topic: sub.topic().to_string(),
                    timeout_ms: self.options.handler_timeout.as_millis() as u64,
                };
                tracing::warn!(
                    event = "handler_timeout",
                    envelope_id = %envelope_id,
                    error = %err,
                    "Handler cancelled"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::Ctx;
    use crate::provider::memory::MemoryBroker;
    use serde_json::json;

    fn dispatcher(queue_size: usize, overflow: OverflowStrategy, handler_timeout: Duration) -> Dispatcher {
        let broker = MemoryBroker::new();
        let registry = Arc::new(TopicRegistry::new([("tts.say", "robot/tts/say")]).unwrap());
        let metrics = Arc::new(Metrics::new());
        let subs = vec![Sub::new(
            "robot/tts/say",
            |_ctx: Ctx, _env: Envelope, _data: serde_json::Value| async { Ok(()) },
        )];
        let factory = Ctx::factory(
            Arc::new(broker.clone()),
            registry.clone(),
            Arc::new(()),
            metrics.clone(),
            "test",
        );

        Dispatcher::new(
            Arc::new(broker),
            registry,
            subs,
            factory,
            metrics,
            DispatchOptions {
                queue_size,
                workers: 1,
                handler_timeout,
                overflow,
            },
        )
        .unwrap()
    }

    fn entry(d: &Dispatcher, n: u32) -> Entry<()> {
        let data = json!({ "n": n });
        Entry {
            sub: d.inner.subs[0].clone(),
            envelope: Envelope::new("tts.say", data.clone()),
            payload: Box::new(data),
        }
    }

    fn queued(d: &Dispatcher) -> Vec<u64> {
        d.inner.queue.inspect(|items| {
            items
                .iter()
                .filter_map(|e| e.envelope.data()["n"].as_u64())
                .collect()
        })
    }

    #[tokio::test]
    async fn test_drop_new_keeps_first() {
        let d = dispatcher(1, OverflowStrategy::DropNew, Duration::from_secs(1));

        assert!(d.inner.enqueue(entry(&d, 1)).await.is_ok());
        let err = d.inner.enqueue(entry(&d, 2)).await.unwrap_err();

        assert!(matches!(err, BusError::QueueOverflow { ref strategy, .. } if strategy == "drop_new"));
        assert_eq!(queued(&d), vec![1]);
        assert_eq!(d.metrics().snapshot().dropped_new, 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let d = dispatcher(1, OverflowStrategy::DropOldest, Duration::from_secs(1));

        d.inner.enqueue(entry(&d, 1)).await.unwrap();
        d.inner.enqueue(entry(&d, 2)).await.unwrap();

        assert_eq!(queued(&d), vec![2]);
        let snapshot = d.metrics().snapshot();
        assert_eq!(snapshot.dropped_oldest, 1);
        assert_eq!(snapshot.enqueued, 2);
    }

    #[tokio::test]
    async fn test_block_completes_when_room_frees() {
        let d = dispatcher(1, OverflowStrategy::Block, Duration::from_millis(500));
        d.inner.enqueue(entry(&d, 1)).await.unwrap();

        let inner = d.inner.clone();
        let pending = entry(&d, 2);
        let blocked = tokio::spawn(async move { inner.enqueue(pending).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        let freed = d.inner.queue.pop_front().unwrap();
        assert_eq!(freed.envelope.data()["n"], 1);

        assert!(blocked.await.unwrap().is_ok());
        assert_eq!(queued(&d), vec![2]);
        assert_eq!(d.metrics().snapshot().block_timeouts, 0);
    }

    #[tokio::test]
    async fn test_block_times_out_and_keeps_original() {
        let d = dispatcher(1, OverflowStrategy::Block, Duration::from_millis(50));
        d.inner.enqueue(entry(&d, 1)).await.unwrap();

        let err = d.inner.enqueue(entry(&d, 2)).await.unwrap_err();

        assert!(matches!(err, BusError::QueueOverflow { .. }));
        assert_eq!(queued(&d), vec![1]);
        assert_eq!(d.metrics().snapshot().block_timeouts, 1);
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let d = dispatcher(4, OverflowStrategy::DropNew, Duration::from_secs(1));
        for n in 0..3 {
            d.inner.enqueue(entry(&d, n)).await.unwrap();
        }
        assert_eq!(d.queue_len(), 3);
        assert_eq!(d.stop(), 3);
        assert_eq!(d.queue_len(), 0);
    }

    #[test]
    fn test_rejects_bad_options() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(TopicRegistry::default());
        let metrics = Arc::new(Metrics::new());
        let factory = Ctx::factory(
            Arc::new(broker.clone()),
            registry.clone(),
            Arc::new(()),
            metrics.clone(),
            "test",
        );

        let bad_filter: Vec<Sub> = vec![Sub::new(
            "robot/#/tail",
            |_ctx: Ctx, _env: Envelope, _data: serde_json::Value| async { Ok(()) },
        )];
        let result = Dispatcher::new(
            Arc::new(broker.clone()),
            registry.clone(),
            bad_filter,
            factory.clone(),
            metrics.clone(),
            DispatchOptions::default(),
        );
        assert!(matches!(result, Err(BusError::InvalidTopic { .. })));

        let no_workers = Dispatcher::new(
            Arc::new(broker.clone()),
            registry.clone(),
            Vec::<Sub>::new(),
            factory.clone(),
            metrics.clone(),
            DispatchOptions {
                workers: 0,
                ..Default::default()
            },
        );
        assert!(matches!(no_workers, Err(BusError::Config(_))));

        let empty_queue = Dispatcher::new(
            Arc::new(broker),
            registry,
            Vec::<Sub>::new(),
            factory,
            metrics,
            DispatchOptions {
                queue_size: 0,
                ..Default::default()
            },
        );
        assert!(matches!(empty_queue, Err(BusError::Config(_))));
    }

    #[test]
    fn test_overflow_strategy_parsing() {
        assert_eq!("block".parse::<OverflowStrategy>().unwrap(), OverflowStrategy::Block);
        assert_eq!(
            "drop_oldest".parse::<OverflowStrategy>().unwrap(),
            OverflowStrategy::DropOldest
        );
        assert!("drop_everything".parse::<OverflowStrategy>().is_err());
        assert_eq!(
            serde_json::to_string(&OverflowStrategy::DropNew).unwrap(),
            "\"drop_new\""
        );
    }
}
