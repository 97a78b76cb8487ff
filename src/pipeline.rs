//! Ingestion pipeline: parse -> resolve -> admit -> append, per message.
//!
//! A dispatcher task pops deliveries off the [`DeliveryQueue`] and routes each
//! one to a worker chosen by hashing its topic. The topic fixes hub and
//! sensor, so all messages of one sensor go to the same worker and are handled
//! in receive order; different sensors proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::identity::IdentityResolver;
use crate::parser::{preview, Parser};
use crate::queue::{Delivery, DeliveryQueue};
use crate::scheduler::{Decision, IntervalScheduler};
use crate::store::Store;

/// Per-worker backlog; a full worker backs up the delivery queue.
const WORKER_BACKLOG: usize = 64;

// ---

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stored,
    Deferred,
    Rejected,
    Failed,
}

/// Pipeline counters, shared with the broker task and the HTTP layer.
#[derive(Debug, Default)]
pub struct PipelineStats {
    // ---
    received: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    deferred: AtomicU64,
    stored: AtomicU64,
    storage_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub deferred: u64,
    pub stored: u64,
    pub storage_errors: u64,
}

impl PipelineStats {
    // ---
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // ---
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: Outcome) {
        // ---
        let counter = match outcome {
            Outcome::Stored => &self.stored,
            Outcome::Deferred => &self.deferred,
            Outcome::Rejected => &self.rejected,
            Outcome::Failed => &self.storage_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The per-message stages, wired together.
#[derive(Debug)]
pub struct Ingestor {
    // ---
    parser: Parser,
    resolver: IdentityResolver,
    scheduler: IntervalScheduler,
    store: Store,
    stats: Arc<PipelineStats>,
    /// Shared by every in-flight message from resolve to confirm; taken
    /// exclusively by a storage reset.
    gate: RwLock<()>,
}

impl Ingestor {
    // ---
    /// Rehydrate identities and scheduler state from `store`.
    pub async fn open(
        store: Store,
        parser: Parser,
        scheduler: IntervalScheduler,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, StorageError> {
        // ---
        let resolver = IdentityResolver::load(store.clone()).await?;
        let last = store.last_accepted().await?;
        debug!("Seeding scheduler with {} last-accepted timestamps", last.len());
        scheduler.hydrate(last);

        Ok(Self {
            parser,
            resolver,
            scheduler,
            store,
            stats,
            gate: RwLock::new(()),
        })
    }

    /// Run one delivery through every stage. Never fails: each stage error
    /// is logged, counted and turned into an [`Outcome`].
    pub async fn ingest(&self, delivery: &Delivery) -> Outcome {
        // ---
        let outcome = self.process(delivery).await;
        self.stats.record(outcome);
        outcome
    }

    async fn process(&self, delivery: &Delivery) -> Outcome {
        // ---
        let reading = match self.parser.parse(&delivery.topic, &delivery.payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    topic = %delivery.topic,
                    payload = %preview(&delivery.payload),
                    error = %e,
                    "Discarding message"
                );
                return Outcome::Rejected;
            }
        };

        let _gate = self.gate.read().await;

        let identity = match self
            .resolver
            .resolve(&reading.hub_id, &reading.sensor_id)
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                error!(topic = %delivery.topic, error = %e, "Failed to resolve identity");
                return Outcome::Failed;
            }
        };

        if self.scheduler.admit(&identity, &reading) == Decision::Defer {
            debug!(
                hub_id = %identity.hub_id,
                sensor_id = %identity.sensor_id,
                observed_at = %reading.observed_at,
                "Deferred by sampling interval"
            );
            return Outcome::Deferred;
        }

        match self
            .store
            .append(&identity, &reading, delivery.received_at)
            .await
        {
            Ok(()) => {
                self.scheduler.confirm(&identity, reading.observed_at);
                debug!(
                    hub_id = %identity.hub_id,
                    sensor_id = %identity.sensor_id,
                    observed_at = %reading.observed_at,
                    "Stored reading"
                );
                Outcome::Stored
            }
            Err(e) => {
                error!(
                    hub_id = %identity.hub_id,
                    sensor_id = %identity.sensor_id,
                    observed_at = %reading.observed_at,
                    error = %e,
                    "Failed to store reading"
                );
                Outcome::Failed
            }
        }
    }

    /// Administrative reset: drop and recreate storage and forget all
    /// cached identity and scheduling state.
    ///
    /// Waits for in-flight messages to finish and holds new ones back until
    /// storage, identities and scheduler state are all cleared.
    pub async fn reset_storage(&self) -> Result<(), StorageError> {
        // ---
        let _gate = self.gate.write().await;
        self.resolver.reset_storage().await?;
        self.scheduler.clear();
        info!("Storage reset complete");
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn scheduler(&self) -> &IntervalScheduler {
        &self.scheduler
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}

/// Running dispatcher and workers.
pub struct PipelineHandle {
    // ---
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Start the dispatcher and `workers` worker tasks.
pub fn spawn(ingestor: Arc<Ingestor>, queue: Arc<DeliveryQueue>, workers: usize) -> PipelineHandle {
    // ---
    let workers = workers.max(1);
    let mut senders = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
        let (tx, mut rx) = mpsc::channel::<Delivery>(WORKER_BACKLOG);
        let ingestor = ingestor.clone();
        handles.push(tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                ingestor.ingest(&delivery).await;
            }
            debug!(worker, "Worker drained");
        }));
        senders.push(tx);
    }

    let dispatcher = tokio::spawn(async move {
        while let Some(delivery) = queue.pop().await {
            let shard = shard_for(&delivery.topic, senders.len());
            if senders[shard].send(delivery).await.is_err() {
                error!(worker = shard, "Worker stopped unexpectedly; message lost");
            }
        }
        debug!("Dispatcher drained");
        // Dropping the senders lets each worker finish its backlog and exit.
    });

    info!(workers, "Pipeline started");
    PipelineHandle {
        dispatcher,
        workers: handles,
    }
}

impl PipelineHandle {
    /// Wait until the (closed) queue and every worker backlog are empty.
    pub async fn drain(self) {
        // ---
        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Pipeline drained");
    }
}

/// Worker index for a topic; stable for the life of the process.
pub fn shard_for(topic: &str, shards: usize) -> usize {
    // ---
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}
