//! Priority-queued retry manager.
//!
//! Operations are queued by priority (higher first, FIFO among equals) and
//! executed one at a time by a single worker task, so no two queued
//! operations ever race on the same repository. Each operation is attempted
//! up to `max_attempts` times with exponential backoff between attempts and a
//! timeout on every attempt.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Priority of the initial branch fetch.
pub const PRIORITY_INITIAL_FETCH: i32 = 10;
/// Priority of user-triggered branch operations.
pub const PRIORITY_USER: i32 = 5;
/// Priority of background refreshes.
pub const PRIORITY_BACKGROUND: i32 = 1;

/// Number of finished operations kept for inspection.
const HISTORY_LIMIT: usize = 50;

/// Retry progress of the operation currently executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    /// Operation name.
    pub operation_name: String,
    /// Attempts made so far.
    pub attempt: u32,
    /// When the next attempt starts, if one is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    /// Waiting in the queue.
    Queued,
    /// Being attempted.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// Public view of a queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    /// Operation id.
    pub id: u64,
    /// Operation name.
    pub name: String,
    /// Queue priority.
    pub priority: i32,
    /// Lifecycle status.
    pub status: OperationStatus,
}

type AttemptFn = Box<dyn FnMut() -> BoxFuture<'static, SyncResult<()>> + Send>;
type FinishFn = Box<dyn FnOnce(SyncResult<()>) + Send>;

/// A type-erased operation waiting in the queue.
struct QueuedOperation {
    id: u64,
    name: String,
    priority: i32,
    seq: u64,
    retry_config: RetryConfig,
    status: OperationStatus,
    run: AttemptFn,
    finish: FinishFn,
}

impl QueuedOperation {
    fn info(&self) -> OperationInfo {
        OperationInfo {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            status: self.status,
        }
    }
}

impl PartialEq for QueuedOperation {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedOperation {}

impl PartialOrd for QueuedOperation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOperation {
    // Max-heap: higher priority first, then lower sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    default_config: RetryConfig,
    events: EventBus,
    queue: Mutex<BinaryHeap<QueuedOperation>>,
    wakeup: Notify,
    next_id: AtomicU64,
    active: Mutex<Option<(OperationInfo, RetryStatus)>>,
    history: Mutex<VecDeque<OperationInfo>>,
}

/// Serializes and retries failure-prone operations.
pub struct RetryManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryManager {
    /// Creates a manager whose operations default to `default_config`.
    pub fn new(default_config: RetryConfig, events: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_config,
                events,
                queue: Mutex::new(BinaryHeap::new()),
                wakeup: Notify::new(),
                next_id: AtomicU64::new(1),
                active: Mutex::new(None),
                history: Mutex::new(VecDeque::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queues `op` and waits for its final outcome.
    ///
    /// `op` is invoked once per attempt. Non-retryable errors end the
    /// operation early. A failed operation rejects with
    /// [`SyncError::RetriesExhausted`] naming the operation and attempt count.
    pub async fn enqueue<T, F, Fut>(
        &self,
        name: &str,
        priority: i32,
        retry_config: Option<RetryConfig>,
        mut op: F,
    ) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<SyncResult<T>>();
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

        let attempt_slot = Arc::clone(&slot);
        let run: AttemptFn = Box::new(move || {
            let attempt = op();
            let slot = Arc::clone(&attempt_slot);
            async move {
                let value = attempt.await?;
                *slot.lock() = Some(value);
                Ok(())
            }
            .boxed()
        });

        let finish_name = name.to_string();
        let finish: FinishFn = Box::new(move |outcome| {
            let result = outcome.and_then(|()| {
                slot.lock()
                    .take()
                    .ok_or_else(|| SyncError::Cancelled(finish_name))
            });
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        });

        let id = self.shared.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let operation = QueuedOperation {
            id,
            name: name.to_string(),
            priority,
            seq: id,
            retry_config: retry_config.unwrap_or_else(|| self.shared.default_config.clone()),
            status: OperationStatus::Queued,
            run,
            finish,
        };

        debug!(operation = name, id, priority, "queued");
        self.shared.queue.lock().push(operation);
        self.ensure_worker();
        self.shared.wakeup.notify_one();

        rx.await
            .unwrap_or_else(|_| Err(SyncError::Cancelled(name.to_string())))
    }

    /// Returns retry progress of the executing operation, if any.
    pub fn retry_status(&self) -> Option<RetryStatus> {
        self.shared.active.lock().as_ref().map(|(_, s)| s.clone())
    }

    /// Returns the executing operation, if any.
    pub fn current_operation(&self) -> Option<OperationInfo> {
        self.shared.active.lock().as_ref().map(|(op, _)| op.clone())
    }

    /// Returns queued operations in execution order.
    pub fn queued(&self) -> Vec<OperationInfo> {
        let queue = self.shared.queue.lock();
        let mut ops: Vec<&QueuedOperation> = queue.iter().collect();
        ops.sort_by(|a, b| b.cmp(a));
        ops.into_iter().map(QueuedOperation::info).collect()
    }

    /// Returns recently finished operations, oldest first.
    pub fn history(&self) -> Vec<OperationInfo> {
        self.shared.history.lock().iter().cloned().collect()
    }

    /// Number of operations waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Rejects every queued operation with [`SyncError::Cancelled`].
    ///
    /// The executing operation, if any, is not interrupted.
    pub fn clear_queue(&self) -> usize {
        let drained: Vec<QueuedOperation> = self.shared.queue.lock().drain().collect();
        let count = drained.len();
        for op in drained {
            (op.finish)(Err(SyncError::Cancelled(op.name)));
        }
        count
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(true, JoinHandle::is_finished) {
            *worker = Some(tokio::spawn(run_worker(Arc::clone(&self.shared))));
        }
    }
}

impl Drop for RetryManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = shared.queue.lock().pop();
        match next {
            Some(op) => shared.execute(op).await,
            None => shared.wakeup.notified().await,
        }
    }
}

impl Shared {
    async fn execute(&self, mut op: QueuedOperation) {
        op.status = OperationStatus::Running;
        let config = op.retry_config.clone();
        let max_attempts = config.max_attempts.max(1);
        let mut attempts = 0u32;

        *self.active.lock() = Some((
            op.info(),
            RetryStatus {
                operation_name: op.name.clone(),
                attempt: 0,
                next_retry_at: None,
                last_error: None,
            },
        ));

        let outcome = loop {
            let attempt = (op.run)();
            let result = if config.timeout.is_zero() {
                attempt.await
            } else {
                match tokio::time::timeout(config.timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        operation: op.name.clone(),
                    }),
                }
            };
            attempts += 1;

            match result {
                Ok(()) => break Ok(()),
                Err(err) if attempts < max_attempts && err.is_retryable() => {
                    let delay = config.delay_for_attempt(attempts - 1);
                    let status = RetryStatus {
                        operation_name: op.name.clone(),
                        attempt: attempts,
                        next_retry_at: Some(Utc::now() + chrono_delay(delay)),
                        last_error: Some(err.to_string()),
                    };
                    warn!(
                        operation = %op.name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    if let Some((_, active)) = self.active.lock().as_mut() {
                        *active = status.clone();
                    }
                    self.events.emit(SyncEvent::OperationRetrying(status));
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        *self.active.lock() = None;

        match outcome {
            Ok(()) => {
                debug!(operation = %op.name, attempts, "operation complete");
                op.status = OperationStatus::Completed;
                self.record(op.info());
                self.events.emit(SyncEvent::OperationComplete {
                    id: op.id,
                    name: op.name.clone(),
                    attempts,
                });
                (op.finish)(Ok(()));
            }
            Err(err) => {
                warn!(operation = %op.name, attempts, error = %err, "operation failed");
                op.status = OperationStatus::Failed;
                self.record(op.info());
                self.events.emit(SyncEvent::OperationFailed {
                    id: op.id,
                    name: op.name.clone(),
                    attempts,
                    error: err.to_string(),
                });
                (op.finish)(Err(SyncError::RetriesExhausted {
                    operation: op.name,
                    attempts,
                    source: Box::new(err),
                }));
            }
        }
    }

    fn record(&self, info: OperationInfo) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(info);
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn manager() -> RetryManager {
        RetryManager::new(RetryConfig::default(), EventBus::new())
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_runs_first_and_ties_are_fifo() {
        let manager = manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        let record = |name: &'static str| {
            let order = Arc::clone(&order);
            move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(name);
                    Ok::<_, SyncError>(name)
                }
            }
        };

        let (push, fetch, pull) = tokio::join!(
            manager.enqueue("push", 1, None, record("push")),
            manager.enqueue("fetch", 2, None, record("fetch")),
            manager.enqueue("pull", 1, None, record("pull")),
        );

        assert_eq!(push.unwrap(), "push");
        assert_eq!(fetch.unwrap(), "fetch");
        assert_eq!(pull.unwrap(), "pull");
        assert_eq!(*order.lock(), vec!["fetch", "push", "pull"]);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_uses_every_attempt_with_backoff() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = RetryManager::new(RetryConfig::default(), events);
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1000))
            .with_backoff_factor(2.0);

        let starts = Arc::new(Mutex::new(Vec::new()));
        let op_starts = Arc::clone(&starts);
        let result: SyncResult<()> = manager
            .enqueue("push", 1, Some(config), move || {
                op_starts.lock().push(Instant::now());
                async { Err(SyncError::transport_retryable("offline")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            SyncError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(err.to_string().contains("push"));

        let starts = starts.lock().clone();
        assert_eq!(starts.len(), 3);
        let first_gap = starts[1] - starts[0];
        let second_gap = starts[2] - starts[1];
        assert!(first_gap >= Duration::from_millis(1000) && first_gap < Duration::from_millis(1100));
        assert!(second_gap >= Duration::from_millis(2000) && second_gap < Duration::from_millis(2100));

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec!["operationRetrying", "operationRetrying", "operationFailed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn negative_backoff_factor_still_exhausts_cleanly() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = RetryManager::new(RetryConfig::default(), events);
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_factor(-2.0);

        let err = manager
            .enqueue("fetch", 1, Some(config), || async {
                Err::<(), _>(SyncError::transport_retryable("offline"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.last(), Some(&"operationFailed"));

        let next = manager
            .enqueue("status", 1, None, || async { Ok::<_, SyncError>(7) })
            .await;
        assert_eq!(next.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failure() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);

        let value = manager
            .enqueue("pull", 1, None, move || {
                let n = op_calls.fetch_add(1, AtomicOrdering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SyncError::LockContention("index.lock".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(manager.history()[0].status, OperationStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_early() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);

        let err = manager
            .enqueue("push", 1, None, move || {
                op_calls.fetch_add(1, AtomicOrdering::SeqCst);
                async { Err::<(), _>(SyncError::AuthenticationFailed("denied".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_counts_as_failure() {
        let manager = manager();
        let config = RetryConfig::new(2)
            .with_timeout(Duration::from_millis(100))
            .with_initial_delay(Duration::from_millis(10));

        let err = manager
            .enqueue("fetch", 1, Some(config), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SyncError>(())
            })
            .await
            .unwrap_err();

        match err {
            SyncError::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, SyncError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn operations_never_overlap() {
        let manager = Arc::new(manager());
        let running = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            handles.push(tokio::spawn(async move {
                manager
                    .enqueue(&format!("op-{i}"), i, None, move || {
                        let running = Arc::clone(&running);
                        let overlap = Arc::clone(&overlap);
                        async move {
                            if running.fetch_add(1, AtomicOrdering::SeqCst) > 0 {
                                overlap.fetch_add(1, AtomicOrdering::SeqCst);
                            }
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            running.fetch_sub(1, AtomicOrdering::SeqCst);
                            Ok::<_, SyncError>(())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(overlap.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queue_cancels_waiting_callers() {
        let manager = Arc::new(manager());

        let blocker = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .enqueue("slow", 1, None, || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok::<_, SyncError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .enqueue("queued", 1, None, || async { Ok::<_, SyncError>(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.queued().len(), 1);
        assert_eq!(manager.current_operation().unwrap().name, "slow");
        assert_eq!(manager.clear_queue(), 1);
        assert!(matches!(
            waiting.await.unwrap(),
            Err(SyncError::Cancelled(_))
        ));
        blocker.await.unwrap().unwrap();
    }
}
