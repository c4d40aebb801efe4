//! Rate-limited retrying queue in front of a single external endpoint
//!
//! Every outbound call goes through [`RateLimitedQueue::enqueue`]. A worker
//! task, spawned once at construction, drains whatever is queued into a
//! batch, starts the batch items no faster than the current
//! requests-per-second ceiling allows, and feeds each outcome into a
//! [`RateController`]. Failed operations are handed back to their caller,
//! which re-enqueues them until the retry budget is spent.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::rate::{Adjustment, RateController};

/// Rate and retry parameters of a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name used in logs
    pub name: String,
    /// Lowest requests-per-second ceiling
    pub min_rps: f64,
    /// Highest requests-per-second ceiling
    pub max_rps: f64,
    /// Starting ceiling, clamped into [min_rps, max_rps]
    pub initial_rps: f64,
    /// Total attempts per operation
    pub max_retries: u32,
    /// Number of recent outcomes considered for adjustments
    pub window_size: usize,
    /// Success rate that raises the ceiling
    pub success_threshold: f64,
    /// Failure rate that lowers the ceiling
    pub failure_threshold: f64,
    /// Additive step of every adjustment
    pub adjustment_size: f64,
    /// Minimum seconds between adjustments
    pub adjustment_cooldown_secs: f64,
    /// Capacity of the submission channel
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            min_rps: 1.0,
            max_rps: 3.0,
            initial_rps: 3.0,
            max_retries: 3,
            window_size: 10,
            success_threshold: 0.9,
            failure_threshold: 0.05,
            adjustment_size: 0.5,
            adjustment_cooldown_secs: 5.0,
            channel_capacity: 1024,
        }
    }
}

impl QueueConfig {
    pub fn adjustment_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.adjustment_cooldown_secs.max(0.0))
    }

    /// Check that the parameters describe a usable controller
    pub fn validate(&self) -> crate::Result<()> {
        let invalid =
            |msg: String| Err(crate::Error::InvalidConfig(format!("{}: {}", self.name, msg)));

        if !(self.min_rps.is_finite() && self.min_rps > 0.0) {
            return invalid(format!("min_rps must be positive, got {}", self.min_rps));
        }
        if !(self.max_rps.is_finite() && self.max_rps >= self.min_rps) {
            return invalid(format!(
                "max_rps ({}) must be at least min_rps ({})",
                self.max_rps, self.min_rps
            ));
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1".to_string());
        }
        if self.window_size == 0 {
            return invalid("window_size must be at least 1".to_string());
        }
        for (label, value) in [
            ("success_threshold", self.success_threshold),
            ("failure_threshold", self.failure_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{label} must be within [0, 1], got {value}"));
            }
        }
        if !(self.adjustment_size.is_finite() && self.adjustment_size > 0.0) {
            return invalid(format!(
                "adjustment_size must be positive, got {}",
                self.adjustment_size
            ));
        }
        if !(self.adjustment_cooldown_secs.is_finite() && self.adjustment_cooldown_secs >= 0.0) {
            return invalid("adjustment_cooldown_secs must not be negative".to_string());
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Why `enqueue` did not produce a value
#[derive(Error, Debug)]
pub enum QueueError<E> {
    /// The worker is gone
    #[error("queue '{0}' is closed")]
    Closed(String),

    /// The operation panicked while running in the worker
    #[error("operation panicked in queue '{0}'")]
    Panicked(String),

    /// The operation failed on every attempt; this is the last failure
    #[error("{0}")]
    Operation(E),
}

type Outcome<T, E> = std::result::Result<T, E>;

type RetryFilter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// One attempt of an operation, waiting in the queue
struct QueuedTask<T, E> {
    id: String,
    operation: BoxFuture<'static, Outcome<T, E>>,
    result_tx: oneshot::Sender<Outcome<T, E>>,
    retry_count: u32,
}

/// A shared, rate-limited, retrying queue
pub struct RateLimitedQueue<T, E> {
    name: String,
    max_retries: u32,
    tx: mpsc::Sender<QueuedTask<T, E>>,
    rps: watch::Receiver<f64>,
    retry_filter: Option<RetryFilter<E>>,
}

impl<T, E> fmt::Debug for RateLimitedQueue<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedQueue")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("current_rps", &*self.rps.borrow())
            .finish()
    }
}

impl<T, E> RateLimitedQueue<T, E>
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Create the queue and spawn its worker on the current tokio runtime.
    ///
    /// The worker stops once every handle to the queue has been dropped.
    pub fn new(config: QueueConfig) -> crate::Result<Self> {
        config.validate()?;

        let controller = RateController::new(&config, Instant::now());
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (rps_tx, rps_rx) = watch::channel(controller.current_rps());

        tokio::spawn(run_worker(config.name.clone(), rx, controller, rps_tx));

        Ok(Self {
            name: config.name,
            max_retries: config.max_retries,
            tx,
            rps: rps_rx,
            retry_filter: None,
        })
    }

    /// Only retry failures for which `filter` returns true; others are
    /// returned to the caller after the first attempt.
    pub fn with_retry_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_filter = Some(Arc::new(filter));
        self
    }

    fn should_retry(&self, error: &E) -> bool {
        self.retry_filter.as_ref().is_none_or(|filter| filter(error))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The current requests-per-second ceiling
    pub fn current_rps(&self) -> f64 {
        *self.rps.borrow()
    }

    /// Run an operation through the queue and wait for its result.
    ///
    /// `operation` is called once per attempt. Intermediate failures are
    /// logged and retried; only the last failure is returned, after
    /// `max_retries` attempts.
    pub async fn enqueue<F, Fut>(&self, operation: F) -> Result<T, QueueError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<T, E>> + Send + 'static,
    {
        let id = short_id();
        let mut retry_count = 0u32;

        loop {
            tracing::debug!(
                queue = %self.name,
                task = %id,
                "Enqueuing task for attempt {}",
                retry_count
            );

            let (result_tx, result_rx) = oneshot::channel();
            let task = QueuedTask {
                id: id.clone(),
                operation: operation().boxed(),
                result_tx,
                retry_count,
            };
            self.tx
                .send(task)
                .await
                .map_err(|_| QueueError::Closed(self.name.clone()))?;

            match result_rx.await {
                Ok(Ok(value)) => {
                    tracing::debug!(queue = %self.name, task = %id, "Task completed successfully");
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    retry_count += 1;
                    tracing::warn!(queue = %self.name, task = %id, "Exception in task: {}", error);

                    if !self.should_retry(&error) {
                        tracing::error!(queue = %self.name, task = %id, "Not retrying: {}", error);
                        return Err(QueueError::Operation(error));
                    }
                    if retry_count >= self.max_retries {
                        tracing::error!(
                            queue = %self.name,
                            task = %id,
                            "All {} attempts failed. Final error: {}",
                            retry_count,
                            error
                        );
                        return Err(QueueError::Operation(error));
                    }
                    tracing::info!(
                        queue = %self.name,
                        task = %id,
                        "Retrying. Attempt {}",
                        retry_count
                    );
                }
                Err(_) if self.tx.is_closed() => return Err(QueueError::Closed(self.name.clone())),
                Err(_) => return Err(QueueError::Panicked(self.name.clone())),
            }
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Pull batches off the channel until every sender is gone
async fn run_worker<T, E>(
    name: String,
    mut rx: mpsc::Receiver<QueuedTask<T, E>>,
    mut controller: RateController,
    rps_tx: watch::Sender<f64>,
) where
    T: Send + 'static,
    E: Send + 'static,
{
    tracing::debug!(queue = %name, "Worker started");
    let mut next_slot = Instant::now();

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(task) = rx.try_recv() {
            batch.push(task);
        }

        let rps = controller.current_rps();
        let interval = Duration::from_secs_f64(1.0 / rps);
        tracing::debug!(queue = %name, "Processing {} calls at {:.1} RPS", batch.len(), rps);

        let mut running = FuturesUnordered::new();
        for task in batch {
            let start = next_slot.max(Instant::now());
            next_slot = start + interval;

            let QueuedTask {
                id,
                operation,
                result_tx,
                retry_count,
            } = task;
            running.push(async move {
                tokio::time::sleep_until(start).await;
                tracing::debug!(task = %id, attempt = retry_count, "Starting task");
                // A panic counts as this item's failure and never reaches siblings
                let outcome = AssertUnwindSafe(operation).catch_unwind().await.ok();
                (outcome, result_tx)
            });
        }

        while let Some((outcome, result_tx)) = running.next().await {
            let success = matches!(outcome, Some(Ok(_)));
            if let Some(adjustment) = controller.record(success, Instant::now()) {
                log_adjustment(&name, adjustment);
                rps_tx.send_replace(controller.current_rps());
            }
            // The caller may have given up waiting; the outcome still counted
            if let Some(outcome) = outcome {
                let _ = result_tx.send(outcome);
            }
        }
    }

    tracing::debug!(queue = %name, "Worker stopped");
}

fn log_adjustment(name: &str, adjustment: Adjustment) {
    match adjustment {
        Adjustment::Decreased { rps, failure_rate } => tracing::warn!(
            queue = %name,
            "High failure rate ({:.1}%), reducing RPS to {:.1}",
            failure_rate * 100.0,
            rps
        ),
        Adjustment::Increased { rps, success_rate } => tracing::info!(
            queue = %name,
            "High success rate ({:.1}%), increasing RPS to {:.1}",
            success_rate * 100.0,
            rps
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> QueueConfig {
        QueueConfig {
            name: "test".into(),
            min_rps: 500.0,
            max_rps: 1000.0,
            initial_rps: 1000.0,
            max_retries,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_returns_value() {
        let queue: RateLimitedQueue<u32, String> = RateLimitedQueue::new(fast_config(3)).unwrap();
        let value = queue.enqueue(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_enqueue_retries_until_success() {
        let queue: RateLimitedQueue<&'static str, String> =
            RateLimitedQueue::new(fast_config(3)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let value = queue
            .enqueue(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err(format!("failure {attempt}"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "ok");
        // Two hidden failures, then the success
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_enqueue_gives_up_after_max_retries() {
        let queue: RateLimitedQueue<(), String> = RateLimitedQueue::new(fast_config(4)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let err = queue
            .enqueue(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {attempt}"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(matches!(err, QueueError::Operation(ref msg) if msg == "failure 4"));
    }

    #[tokio::test]
    async fn test_retry_filter_stops_early() {
        let queue: RateLimitedQueue<(), String> = RateLimitedQueue::new(fast_config(5))
            .unwrap()
            .with_retry_filter(|e: &String| e != "fatal");
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let err = queue
            .enqueue(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Operation(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_their_own_results() {
        let queue: Arc<RateLimitedQueue<u32, String>> =
            Arc::new(RateLimitedQueue::new(fast_config(2)).unwrap());

        let handles: Vec<_> = (0..20u32)
            .map(|i| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.enqueue(move || async move { Ok(i * 2) }).await })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i as u32 * 2);
        }
    }

    #[tokio::test]
    async fn test_failing_item_does_not_abort_siblings() {
        let queue: Arc<RateLimitedQueue<u32, String>> =
            Arc::new(RateLimitedQueue::new(fast_config(1)).unwrap());

        let bad = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(|| async { Err("boom".to_string()) }).await })
        };
        let good = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(|| async { Ok(7) }).await })
        };

        assert!(bad.await.unwrap().is_err());
        assert_eq!(good.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_operation_is_contained() {
        let queue: RateLimitedQueue<u32, String> = RateLimitedQueue::new(fast_config(1)).unwrap();

        let err = queue
            .enqueue(|| async {
                if true {
                    panic!("operation blew up");
                }
                Ok(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Panicked(_)));

        // The worker survived
        assert_eq!(queue.enqueue(|| async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_is_paced() {
        let config = QueueConfig {
            name: "paced".into(),
            min_rps: 20.0,
            max_rps: 20.0,
            initial_rps: 20.0,
            ..QueueConfig::default()
        };
        let queue: Arc<RateLimitedQueue<(), String>> =
            Arc::new(RateLimitedQueue::new(config).unwrap());

        let started = std::time::Instant::now();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.enqueue(|| async { Ok(()) }).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Five starts spaced 50ms apart need at least four intervals
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_failures_lower_the_ceiling() {
        let config = QueueConfig {
            name: "adaptive".into(),
            min_rps: 100.0,
            max_rps: 400.0,
            initial_rps: 400.0,
            max_retries: 1,
            window_size: 2,
            failure_threshold: 0.5,
            adjustment_size: 100.0,
            adjustment_cooldown_secs: 0.0,
            ..QueueConfig::default()
        };
        let queue: RateLimitedQueue<(), String> = RateLimitedQueue::new(config).unwrap();
        assert_eq!(queue.current_rps(), 400.0);

        for _ in 0..2 {
            let _ = queue.enqueue(|| async { Err("503".to_string()) }).await;
        }
        // Outcomes are recorded before results are handed back
        assert_eq!(queue.current_rps(), 300.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(QueueConfig::default().validate().is_ok());

        let bad = [
            QueueConfig { min_rps: 0.0, ..QueueConfig::default() },
            QueueConfig { min_rps: 5.0, max_rps: 2.0, ..QueueConfig::default() },
            QueueConfig { max_retries: 0, ..QueueConfig::default() },
            QueueConfig { window_size: 0, ..QueueConfig::default() },
            QueueConfig { success_threshold: 1.5, ..QueueConfig::default() },
            QueueConfig { adjustment_size: 0.0, ..QueueConfig::default() },
            QueueConfig { adjustment_cooldown_secs: -1.0, ..QueueConfig::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }
}
