//! Usage events, delivered off the request path.
//!
//! Admitted requests usually trigger side effects such as usage accounting or
//! billing. These must never add latency to the admission decision, so they go
//! through a bounded queue drained by a background worker.
//!
//! Delivery is at-most-once: when the queue is full the event is dropped, and a
//! failed delivery is logged but not retried. Both are counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// One unit of metered usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEvent {
    pub tenant: String,
    pub endpoint: String,
    pub quantity: u32,
    pub at: SystemTime,
}

impl UsageEvent {
    pub fn new(tenant: impl Into<String>, endpoint: impl Into<String>, quantity: u32) -> Self {
        Self {
            tenant: tenant.into(),
            endpoint: endpoint.into(),
            quantity,
            at: SystemTime::now(),
        }
    }
}

/// Destination for usage events.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn deliver(&self, event: UsageEvent) -> anyhow::Result<()>;
}

/// Sink that writes events to the log.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl UsageSink for TracingSink {
    async fn deliver(&self, event: UsageEvent) -> anyhow::Result<()> {
        info!(
            tenant = %event.tenant,
            endpoint = %event.endpoint,
            quantity = event.quantity,
            "Usage recorded"
        );
        Ok(())
    }
}

/// Queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageQueueConfig {
    /// Events buffered before new ones are dropped
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Deliveries running at the same time
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for UsageQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_capacity() -> usize {
    1024
}

fn default_max_in_flight() -> usize {
    8
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> UsageStats {
        UsageStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handle for enqueueing usage events.
pub struct UsageRecorder {
    sender: mpsc::Sender<UsageEvent>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl UsageRecorder {
    /// Start the background worker. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn UsageSink>, config: UsageQueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(
            receiver,
            sink,
            config.max_in_flight.max(1),
            counters.clone(),
        ));

        Self {
            sender,
            counters,
            worker,
        }
    }

    /// Enqueue an event without waiting. Returns `false` if it was dropped.
    pub fn record(&self, event: UsageEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tenant = %event.tenant,
                    endpoint = %event.endpoint,
                    "Usage queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> UsageStats {
        self.counters.snapshot()
    }

    /// Stop accepting events and wait for queued and in-flight deliveries.
    pub async fn shutdown(self) -> UsageStats {
        let Self {
            sender,
            counters,
            worker,
        } = self;
        drop(sender);

        if let Err(e) = worker.await {
            error!(error = %e, "Usage worker panicked");
        }
        counters.snapshot()
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<UsageEvent>,
    sink: Arc<dyn UsageSink>,
    max_in_flight: usize,
    counters: Arc<Counters>,
) {
    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    let mut join_set = JoinSet::new();

    while let Some(event) = receiver.recv().await {
        while let Some(result) = join_set.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Usage delivery task panicked");
            }
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let sink = sink.clone();
        let counters = counters.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let tenant = event.tenant.clone();
            match sink.deliver(event).await {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(tenant = %tenant, error = %e, "Usage delivery failed");
                }
            }
        });
    }

    while let Some(result) = join_set.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Usage delivery task panicked");
        }
    }
    debug!("Usage worker stopped");
}
