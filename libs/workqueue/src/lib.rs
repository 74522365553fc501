//! Keyed operation queues with deduplication and rate-limited retry.
//!
//! An [`OperationQueue`] carries string keys toward a single worker:
//!
//! - Enqueuing a key that is already queued is a no-op, so a burst of
//!   reconcile events collapses into one pending operation per key.
//! - The worker runs alone (concurrency = 1), so operations against the
//!   same key never interleave within one queue.
//! - A failed item is re-enqueued after the delay its [`RetryPolicy`]
//!   returns; the per-key attempt count resets on success.
//!
//! Workers are shut down through a `watch` channel, the same signal shape
//! the rest of the system uses for its long-running loops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Retry delay applied when no policy is configured explicitly.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handles one queue item. Implementations must be idempotent: the queue
/// redelivers keys after failures and callers may enqueue the same key for
/// the same logical operation more than once.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, key: &str) -> anyhow::Result<()>;
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_DELAY,
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number (first retry is attempt 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = rand_jitter(delay * self.jitter);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

/// Per-item retry schedule.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Same delay for every retry.
    Fixed(Duration),

    /// Exponential backoff per attempt.
    Backoff(BackoffPolicy),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Fixed(delay) => *delay,
            RetryPolicy::Backoff(policy) => policy.delay(attempt),
        }
    }
}

struct QueueState {
    /// Keys currently waiting in the channel.
    queued: HashSet<String>,

    /// Failure count per key, cleared on success.
    attempts: HashMap<String, u32>,
}

/// A deduplicating, single-worker operation queue.
pub struct OperationQueue {
    name: String,
    handler: Arc<dyn OperationHandler>,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl OperationQueue {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.into(),
            handler,
            retry,
            state: Mutex::new(QueueState {
                queued: HashSet::new(),
                attempts: HashMap::new(),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Adds a key to the queue. A key that is already queued is dropped.
    pub fn enqueue(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.state.lock().unwrap();
            if !state.queued.insert(key.clone()) {
                debug!(queue = %self.name, key = %key, "ItemAlreadyQueued");
                return;
            }
        }
        if self.tx.send(key.clone()).is_err() {
            self.state.lock().unwrap().queued.remove(&key);
            warn!(queue = %self.name, key = %key, "enqueue after worker stopped");
            return;
        }
        debug!(queue = %self.name, key = %key, "ItemEnqueued");
    }

    /// Number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the single worker. Calling this a second time is a no-op;
    /// the receiver is gone once the first worker owns it.
    pub fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let rx = self.rx.lock().unwrap().take();
            let Some(rx) = rx else {
                warn!(queue = %self.name, "run() called while already running; ignoring");
                return;
            };
            self.worker_loop(rx, shutdown).await;
        })
    }

    async fn worker_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(queue = %self.name, "Worker started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!(queue = %self.name, "Worker shutting down");
                        break;
                    }
                }

                key = rx.recv() => {
                    let Some(key) = key else {
                        debug!(queue = %self.name, "Queue channel closed");
                        break;
                    };
                    self.state.lock().unwrap().queued.remove(&key);
                    self.clone().process(key).await;
                }
            }
        }
    }

    async fn process(self: Arc<Self>, key: String) {
        match self.handler.handle(&key).await {
            Ok(()) => {
                self.state.lock().unwrap().attempts.remove(&key);
                debug!(queue = %self.name, key = %key, "ItemProcessed");
            }
            Err(err) => {
                let attempt = {
                    let mut state = self.state.lock().unwrap();
                    let attempt = state.attempts.entry(key.clone()).or_insert(0);
                    *attempt += 1;
                    *attempt
                };
                let delay = self.retry.delay(attempt);
                warn!(
                    queue = %self.name,
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "ItemFailedWillRetry"
                );

                // Re-enqueue after the retry delay without blocking the
                // worker; the send fails harmlessly once the queue stops.
                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(key);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
        failures_remaining: AtomicU32,
    }

    impl RecordingHandler {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(failures),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperationHandler for RecordingHandler {
        async fn handle(&self, key: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(key.to_string());
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_deduplicates_pending_keys() {
        let handler = RecordingHandler::new(0);
        let queue = OperationQueue::new("test", handler.clone(), RetryPolicy::default());

        queue.enqueue("biz-a:1.0");
        queue.enqueue("biz-a:1.0");
        queue.enqueue("biz-b:1.0");
        assert_eq!(queue.len(), 2);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        queue.clone().run(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let calls = handler.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&"biz-a:1.0".to_string()));
        assert!(calls.contains(&"biz-b:1.0".to_string()));

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn failed_items_are_retried() {
        let handler = RecordingHandler::new(2);
        let queue = OperationQueue::new(
            "test",
            handler.clone(),
            RetryPolicy::Fixed(Duration::from_millis(10)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        queue.clone().run(shutdown_rx);

        queue.enqueue("biz-a:1.0");
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Two failures then a success.
        assert_eq!(handler.calls().len(), 3);
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let handler = RecordingHandler::new(0);
        let queue = OperationQueue::new("test", handler.clone(), RetryPolicy::default());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = queue.clone().run(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        // The worker is gone; late enqueues are dropped on the floor once
        // the channel closes, and nothing is processed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.calls().is_empty());
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn backoff_policy_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
    }
}
