//! At-least-once task queue in the shared store.
//!
//! A dequeued item is leased to one consumer for the visibility timeout. If the
//! consumer neither commits nor requeues it in time, the next `dequeue` returns it
//! to the queue and another consumer gets it. Consumers must therefore be
//! idempotent.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::BoxError;
use crate::clock::Clock;
use crate::error::QueueError;
use crate::metrics::GateMetrics;
use crate::store::ItemState;
use crate::store::SharedStore;
use crate::store::dead_letter_queue;

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub id: String,
    pub payload: T,
    pub enqueued_at_ms: u64,
    /// Failed processing attempts so far.
    pub attempts: u32,
}

/// Where an enqueued item is now, as reported by [`TaskQueue::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Waiting for a consumer.
    Queued,
    /// Leased to a consumer that has not committed it yet.
    InFlight,
    /// Parked in the dead-letter queue.
    DeadLettered,
}

/// An item leased to the consumer that dequeued it.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub item: QueueItem<T>,
    lease: String,
}

impl<T> Delivery<T> {
    pub fn lease(&self) -> &str {
        &self.lease
    }
}

/// Processes queue items for a [`WorkerPool`].
#[async_trait]
pub trait Job<T>: Send + Sync {
    async fn run(&self, item: &QueueItem<T>) -> Result<(), BoxError>;
}

fn random_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// A named queue of `T` payloads, JSON-encoded in the store.
#[derive(Debug)]
pub struct TaskQueue<T> {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    name: String,
    dead_letter: String,
    visibility_timeout: Duration,
    max_attempts: u32,
    max_depth: Option<u64>,
    poll_interval: Duration,
    metrics: GateMetrics,
    _payload: PhantomData<fn() -> T>,
}

impl<T> TaskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            store,
            clock,
            dead_letter: dead_letter_queue(&name),
            name,
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
            max_depth: None,
            poll_interval: Duration::from_millis(100),
            metrics: GateMetrics::new(),
            _payload: PhantomData,
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_depth(mut self, max_depth: Option<u64>) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `payload` and returns the new item's id.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] if `max_depth` items are already queued, and
    /// [`QueueError::EnqueueFailed`] if the store did not accept the item.
    pub async fn enqueue(&self, payload: T) -> Result<String, QueueError> {
        if let Some(max_depth) = self.max_depth {
            let depth = self
                .store
                .queue_len(&self.name)
                .await
                .map_err(QueueError::EnqueueFailed)?;
            if depth >= max_depth {
                return Err(QueueError::Full {
                    queue: self.name.clone(),
                    depth,
                });
            }
        }

        let item = QueueItem {
            id: random_token(),
            payload,
            enqueued_at_ms: self.clock.now().as_millis() as u64,
            attempts: 0,
        };
        let bytes = serde_json::to_vec(&item)?;
        let depth = self
            .store
            .queue_push(&self.name, &item.id, &bytes)
            .await
            .map_err(QueueError::EnqueueFailed)?;

        self.metrics.enqueued(&self.name);
        self.metrics.queue_depth(&self.name, depth);
        debug!(queue = %self.name, id = %item.id, "enqueued");
        Ok(item.id)
    }

    /// Leases the next item.
    ///
    /// With `wait` of `None` this returns immediately; otherwise it polls the
    /// store until an item arrives or `wait` has elapsed.
    pub async fn dequeue(&self, wait: Option<Duration>) -> Result<Option<Delivery<T>>, QueueError> {
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            let lease = random_token();
            if let Some((id, bytes)) = self
                .store
                .queue_pop(&self.name, &lease, self.visibility_timeout)
                .await?
            {
                match serde_json::from_slice::<QueueItem<T>>(&bytes) {
                    Ok(item) => return Ok(Some(Delivery { item, lease })),
                    Err(err) => {
                        error!(queue = %self.name, %id, error = %err, "undecodable item, dead-lettering");
                        if self
                            .store
                            .queue_move(&self.name, &self.dead_letter, &id, &lease, &bytes)
                            .await?
                        {
                            self.record_dead_letter().await;
                        } else {
                            warn!(queue = %self.name, %id, "lease expired before dead-lettering undecodable item");
                        }
                        continue;
                    }
                }
            }

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Removes a processed item for good.
    ///
    /// # Errors
    ///
    /// [`QueueError::LeaseExpired`] if the visibility timeout elapsed and the
    /// item was handed to another consumer.
    pub async fn commit(&self, delivery: &Delivery<T>) -> Result<(), QueueError> {
        let id = &delivery.item.id;
        if self
            .store
            .queue_ack(&self.name, id, &delivery.lease)
            .await?
        {
            debug!(queue = %self.name, %id, "committed");
            Ok(())
        } else {
            warn!(queue = %self.name, %id, "lease expired before commit");
            Err(QueueError::LeaseExpired { id: id.clone() })
        }
    }

    /// Returns a failed item to the back of the queue with one more attempt
    /// recorded, or moves it to the dead-letter queue once it has used up
    /// `max_attempts`.
    ///
    /// # Errors
    ///
    /// [`QueueError::DeadLettered`] when the item was dead-lettered, and
    /// [`QueueError::LeaseExpired`] if the item was handed to another consumer.
    pub async fn requeue(&self, delivery: Delivery<T>) -> Result<(), QueueError> {
        let Delivery { mut item, lease } = delivery;
        item.attempts += 1;
        let bytes = serde_json::to_vec(&item)?;

        let dead = item.attempts >= self.max_attempts;
        let target = if dead { &self.dead_letter } else { &self.name };
        if !self
            .store
            .queue_move(&self.name, target, &item.id, &lease, &bytes)
            .await?
        {
            warn!(queue = %self.name, id = %item.id, "lease expired before requeue");
            return Err(QueueError::LeaseExpired { id: item.id });
        }

        if dead {
            error!(queue = %self.name, id = %item.id, attempts = item.attempts, "dead-lettered");
            self.record_dead_letter().await;
            Err(QueueError::DeadLettered {
                id: item.id,
                attempts: item.attempts,
            })
        } else {
            debug!(queue = %self.name, id = %item.id, attempts = item.attempts, "requeued");
            Ok(())
        }
    }

    /// Ready plus in-flight items.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.store.queue_len(&self.name).await?)
    }

    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        Ok(self.store.queue_len(&self.dead_letter).await?)
    }

    /// Where the item `id` is, or `None` once it has been committed (or was
    /// never enqueued here).
    pub async fn status(&self, id: &str) -> Result<Option<ItemStatus>, QueueError> {
        match self.store.queue_locate(&self.name, id).await? {
            Some(ItemState::Ready) => return Ok(Some(ItemStatus::Queued)),
            Some(ItemState::InFlight) => return Ok(Some(ItemStatus::InFlight)),
            None => {}
        }
        Ok(self
            .store
            .queue_locate(&self.dead_letter, id)
            .await?
            .map(|_| ItemStatus::DeadLettered))
    }

    async fn record_dead_letter(&self) {
        self.metrics.dead_lettered(&self.name);
        match self.store.queue_len(&self.dead_letter).await {
            Ok(depth) => self.metrics.dead_letter_depth(&self.name, depth),
            Err(err) => warn!(queue = %self.name, error = %err, "failed to read dead-letter depth"),
        }
    }
}

/// A fixed number of consumer loops draining one queue.
#[derive(Debug)]
pub struct WorkerPool {
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Starts `workers` consumers. Each commits items `job` processed and
    /// requeues the ones it failed, until `shutdown` turns `true` or its sender
    /// is dropped.
    pub fn spawn<T, J>(
        queue: Arc<TaskQueue<T>>,
        job: Arc<J>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        J: Job<T> + ?Sized + 'static,
    {
        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(consume(
                worker,
                Arc::clone(&queue),
                Arc::clone(&job),
                shutdown.clone(),
            ));
        }
        Self { workers: set }
    }

    /// Waits for every consumer to stop.
    pub async fn join(mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "queue worker panicked");
            }
        }
    }
}

async fn consume<T, J>(
    worker: usize,
    queue: Arc<TaskQueue<T>>,
    job: Arc<J>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: Serialize + DeserializeOwned + Send + Sync,
    J: Job<T> + ?Sized,
{
    let wait = queue.poll_interval * 10;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }

            delivery = queue.dequeue(Some(wait)) => delivery,
        };

        let delivery = match delivery {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                warn!(queue = %queue.name, worker, error = %err, "dequeue failed");
                tokio::time::sleep(queue.poll_interval).await;
                continue;
            }
        };

        match job.run(&delivery.item).await {
            Ok(()) => {
                if let Err(err) = queue.commit(&delivery).await {
                    warn!(queue = %queue.name, worker, error = %err, "commit failed");
                }
            }
            Err(err) => {
                warn!(queue = %queue.name, worker, id = %delivery.item.id, error = %err, "job failed");
                // Dead-lettering is already logged by `requeue`.
                if let Err(err @ (QueueError::Store(_) | QueueError::Codec(_))) =
                    queue.requeue(delivery).await
                {
                    warn!(queue = %queue.name, worker, error = %err, "requeue failed");
                }
            }
        }
    }

    debug!(queue = %queue.name, worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn queue(clock: &ManualClock) -> (Arc<MemoryStore>, TaskQueue<String>) {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let queue = TaskQueue::new(store.clone(), clock, "emails")
            .with_visibility_timeout(Duration::from_secs(30))
            .with_max_attempts(3);
        (store, queue)
    }

    #[tokio::test]
    async fn items_are_delivered_in_order_and_committed() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);

        let first = queue.enqueue("welcome".to_string()).await.unwrap();
        queue.enqueue("digest".to_string()).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);

        let delivery = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(delivery.item.id, first);
        assert_eq!(delivery.item.payload, "welcome");
        assert_eq!(delivery.item.enqueued_at_ms, 1_000_000);
        assert_eq!(delivery.item.attempts, 0);

        queue.commit(&delivery).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);

        // Committed items are never delivered again.
        clock.advance(Duration::from_secs(60));
        let next = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(next.item.payload, "digest");
        queue.commit(&next).await.unwrap();
        assert!(queue.dequeue(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn uncommitted_items_become_visible_again() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        queue.enqueue("resize".to_string()).await.unwrap();

        let stale = queue.dequeue(None).await.unwrap().unwrap();
        assert!(queue.dequeue(None).await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        let fresh = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(fresh.item.id, stale.item.id);

        assert!(matches!(
            queue.commit(&stale).await,
            Err(QueueError::LeaseExpired { .. })
        ));
        queue.commit(&fresh).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_items_are_dead_lettered_after_max_attempts() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        let id = queue.enqueue("poison".to_string()).await.unwrap();

        for attempts in 0..2 {
            let delivery = queue.dequeue(None).await.unwrap().unwrap();
            assert_eq!(delivery.item.attempts, attempts);
            queue.requeue(delivery).await.unwrap();
        }

        let delivery = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(delivery.item.attempts, 2);
        match queue.requeue(delivery).await {
            Err(QueueError::DeadLettered { id: dead, attempts }) => {
                assert_eq!(dead, id);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected dead-lettering, got {other:?}"),
        }

        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_items_go_straight_to_the_dead_letter_queue() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (store, queue) = queue(&clock);
        store.queue_push("emails", "bad", b"not json").await.unwrap();
        queue.enqueue("ok".to_string()).await.unwrap();

        let delivery = queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(delivery.item.payload, "ok");
        assert_eq!(queue.dead_letter_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn status_tracks_an_item_until_commit() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        assert_eq!(queue.status("missing").await.unwrap(), None);

        let id = queue.enqueue("welcome".to_string()).await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap(), Some(ItemStatus::Queued));

        queue.dequeue(None).await.unwrap().unwrap();
        assert_eq!(queue.status(&id).await.unwrap(), Some(ItemStatus::InFlight));

        // An expired lease puts the item back in line.
        clock.advance(Duration::from_secs(30));
        assert_eq!(queue.status(&id).await.unwrap(), Some(ItemStatus::Queued));

        let delivery = queue.dequeue(None).await.unwrap().unwrap();
        queue.commit(&delivery).await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn status_reports_dead_lettered_items() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        let queue = queue.with_max_attempts(1);
        let id = queue.enqueue("poison".to_string()).await.unwrap();

        let delivery = queue.dequeue(None).await.unwrap().unwrap();
        assert!(matches!(
            queue.requeue(delivery).await,
            Err(QueueError::DeadLettered { .. })
        ));
        assert_eq!(
            queue.status(&id).await.unwrap(),
            Some(ItemStatus::DeadLettered)
        );
    }

    #[tokio::test]
    async fn depth_gauges_follow_enqueues_and_dead_letters() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (store, queue) = queue(&clock);
        let metrics = GateMetrics::new();
        let queue = queue.with_metrics(metrics.clone());

        queue.enqueue("one".to_string()).await.unwrap();
        queue.dequeue(None).await.unwrap().unwrap();
        queue.enqueue("two".to_string()).await.unwrap();
        assert_eq!(metrics.snapshot().last_queue_depth, 2);

        store.queue_push("emails", "bad", b"not json").await.unwrap();
        // "two" is ahead of the undecodable item.
        queue.dequeue(None).await.unwrap().unwrap();
        assert!(queue.dequeue(None).await.unwrap().is_none());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.last_dead_letter_depth, 1);
    }

    #[tokio::test]
    async fn max_depth_rejects_enqueues() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        let queue = queue.with_max_depth(Some(1));

        queue.enqueue("one".to_string()).await.unwrap();
        assert!(matches!(
            queue.enqueue("two".to_string()).await,
            Err(QueueError::Full { depth: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_waits_for_an_item() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        let queue = Arc::new(queue);

        assert!(
            queue
                .dequeue(Some(Duration::from_millis(500)))
                .await
                .unwrap()
                .is_none()
        );

        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            producer.enqueue("late".to_string()).await.unwrap();
        });

        let delivery = queue
            .dequeue(Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.item.payload, "late");
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Job<String> for Recorder {
        async fn run(&self, item: &QueueItem<String>) -> Result<(), BoxError> {
            if item.payload == "fail" {
                return Err("refused".into());
            }
            self.seen.lock().unwrap().push(item.payload.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_drains_the_queue_until_shutdown() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let (_, queue) = queue(&clock);
        let queue = Arc::new(queue);
        for payload in ["a", "b", "fail", "c"] {
            queue.enqueue(payload.to_string()).await.unwrap();
        }

        let job = Arc::new(Recorder::default());
        let (shutdown, rx) = watch::channel(false);
        let pool = WorkerPool::spawn(Arc::clone(&queue), Arc::clone(&job), 2, rx);

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.send(true).unwrap();
        pool.join().await;

        let mut seen = job.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_depth().await.unwrap(), 1);
    }
}
