//! Connector queue manager (§4.6): a bounded per-connector FIFO enforcing an
//! inflight cap and a single wait+execute timeout budget, so one stuck
//! backend can't starve another.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("queue timeout")]
    QueueTimeout,
    #[error("queue manager is shutting down")]
    ShuttingDown,
}

/// Either a queue-level rejection or the upstream error `exec_fn` returned.
#[derive(Debug, Error)]
pub enum EnqueueError<E: std::error::Error> {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Upstream(E),
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome<T> {
    pub result: T,
    pub queue_wait_ms: u64,
    pub upstream_latency_ms: u64,
}

struct Waiter {
    ready_tx: oneshot::Sender<()>,
    enqueued_at: Instant,
    deadline: Instant,
}

enum ExecOutcome<T, E> {
    Done(Result<T, E>),
    TimedOut,
    Cancelled,
}

/// One connector's bounded FIFO: a queue of waiters plus an inflight counter.
pub struct ConnectorQueue {
    max_inflight: usize,
    max_queue_depth: usize,
    waiting: parking_lot::Mutex<VecDeque<Waiter>>,
    inflight: AtomicUsize,
    cancel: CancellationToken,
}

impl ConnectorQueue {
    pub fn new(max_inflight: usize, max_queue_depth: usize, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            max_inflight: max_inflight.max(1),
            max_queue_depth,
            waiting: parking_lot::Mutex::new(VecDeque::new()),
            inflight: AtomicUsize::new(0),
            cancel: parent.child_token(),
        })
    }

    pub fn queue_len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Admits as many waiters as `max_inflight` currently allows, skipping
    /// (and dropping) any waiter whose deadline has already elapsed.
    fn pump(&self) {
        loop {
            let mut waiting = self.waiting.lock();
            if self.inflight.load(Ordering::SeqCst) >= self.max_inflight {
                return;
            }
            let Some(w) = waiting.pop_front() else { return };
            drop(waiting);
            if Instant::now() >= w.deadline {
                continue;
            }
            self.inflight.fetch_add(1, Ordering::SeqCst);
            let _ = w.ready_tx.send(());
        }
    }

    /// Runs `exec_fn` once admitted, enforcing the combined wait+execute
    /// budget `timeout` and the shared cancellation token (§4.6).
    pub async fn enqueue<F, Fut, T, E>(self: &Arc<Self>, timeout: Duration, exec_fn: F) -> Result<EnqueueOutcome<T>, EnqueueError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        if self.cancel.is_cancelled() {
            return Err(QueueError::ShuttingDown.into());
        }

        {
            let waiting = self.waiting.lock();
            if waiting.len() + self.inflight.load(Ordering::SeqCst) >= self.max_queue_depth + self.max_inflight {
                return Err(QueueError::QueueFull.into());
            }
        }

        let enqueued_at = Instant::now();
        let deadline = enqueued_at + timeout;
        let (tx, rx) = oneshot::channel();
        {
            let mut waiting = self.waiting.lock();
            waiting.push_back(Waiter { ready_tx: tx, enqueued_at, deadline });
        }
        self.pump();

        let picked = tokio::select! {
            r = rx => r.is_ok(),
            _ = tokio::time::sleep_until(deadline.into()) => false,
            _ = self.cancel.cancelled() => return Err(QueueError::ShuttingDown.into()),
        };
        if !picked {
            return Err(QueueError::QueueTimeout.into());
        }

        let picked_at = Instant::now();
        if self.cancel.is_cancelled() {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::ShuttingDown.into());
        }
        // Tie-break: a deadline that elapsed exactly at pick time never runs exec_fn.
        if picked_at >= deadline {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            self.pump();
            return Err(QueueError::QueueTimeout.into());
        }

        let queue_wait_ms = picked_at.duration_since(enqueued_at).as_millis() as u64;
        let remaining = deadline.saturating_duration_since(picked_at);
        let cancel_child = self.cancel.clone();

        let outcome = tokio::select! {
            res = exec_fn(cancel_child.clone()) => ExecOutcome::Done(res),
            _ = tokio::time::sleep(remaining) => ExecOutcome::TimedOut,
            _ = cancel_child.cancelled() => ExecOutcome::Cancelled,
        };
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.pump();

        match outcome {
            ExecOutcome::Done(Ok(value)) => {
                let upstream_latency_ms = picked_at.elapsed().as_millis() as u64;
                Ok(EnqueueOutcome { result: value, queue_wait_ms, upstream_latency_ms })
            },
            ExecOutcome::Done(Err(e)) => Err(EnqueueError::Upstream(e)),
            ExecOutcome::TimedOut => Err(QueueError::QueueTimeout.into()),
            ExecOutcome::Cancelled => Err(QueueError::ShuttingDown.into()),
        }
    }

    /// Fires the cancellation token and wakes every waiting request so it
    /// observes `ShuttingDown` instead of hanging until its deadline.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut waiting = self.waiting.lock();
        for w in waiting.drain(..) {
            let _ = w.ready_tx.send(());
        }
    }
}

/// Owns one [`ConnectorQueue`] per connector id.
pub struct QueueManager {
    queues: DashMap<String, Arc<ConnectorQueue>>,
    cancel: CancellationToken,
}

impl QueueManager {
    pub fn new() -> Self {
        Self { queues: DashMap::new(), cancel: CancellationToken::new() }
    }

    /// Registers (or replaces) the queue for a connector, used both at
    /// startup and when a hot reload changes a connector's concurrency caps.
    pub fn register(&self, connector_id: &str, max_inflight: usize, max_queue_depth: usize) -> Arc<ConnectorQueue> {
        let queue = ConnectorQueue::new(max_inflight, max_queue_depth, &self.cancel);
        self.queues.insert(connector_id.to_string(), queue.clone());
        queue
    }

    pub fn get(&self, connector_id: &str) -> Option<Arc<ConnectorQueue>> {
        self.queues.get(connector_id).map(|q| q.clone())
    }

    /// Shuts down and removes a single connector's queue, e.g. when a hot
    /// reload disables or restarts it.
    pub fn drain(&self, connector_id: &str) {
        if let Some((_, queue)) = self.queues.remove(connector_id) {
            queue.shutdown();
        }
    }

    pub async fn enqueue<F, Fut, T, E>(
        &self,
        connector_id: &str,
        timeout: Duration,
        exec_fn: F,
    ) -> Result<EnqueueOutcome<T>, EnqueueError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let Some(queue) = self.get(connector_id) else {
            return Err(QueueError::ShuttingDown.into());
        };
        queue.enqueue(timeout, exec_fn).await
    }

    /// Shuts down every connector queue and fires the shared cancellation
    /// token, per the process-wide graceful shutdown sequence in §5.
    pub fn shutdown_all(&self) {
        self.cancel.cancel();
        for entry in self.queues.iter() {
            entry.value().shutdown();
        }
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[tokio::test]
    async fn fifo_ordering_within_a_connector() {
        let manager = QueueManager::new();
        manager.register("conn-a", 1, 8);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let manager = &manager;
            let order = order.clone();
            handles.push(async move {
                manager
                    .enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(2), move |_cancel| async move {
                        order.lock().push(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    })
                    .await
                    .unwrap();
            });
            // Stagger submission so requests genuinely enqueue in order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        futures::future::join_all(handles).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn overflow_rejects_with_queue_full() {
        let manager = QueueManager::new();
        manager.register("conn-a", 1, 1);
        let block = Arc::new(tokio::sync::Notify::new());

        let blocker = {
            let manager = &manager;
            let block = block.clone();
            manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(5), move |_cancel| async move {
                block.notified().await;
                Ok(())
            })
        };
        let blocker_task = tokio::spawn(async move { blocker.await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One slot is inflight, one more is allowed to queue (max_queue_depth=1).
        let filler = manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(5), |_cancel| async { Ok(()) });
        let filler_task = tokio::spawn(filler);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rejected = manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(5), |_cancel| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(EnqueueError::Queue(QueueError::QueueFull))));

        block.notify_one();
        blocker_task.await.unwrap().unwrap();
        filler_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn deadline_elapsed_while_waiting_rejects_without_running_exec_fn() {
        let manager = QueueManager::new();
        manager.register("conn-a", 1, 8);
        let ran = Arc::new(AtomicU32::new(0));

        let block = Arc::new(tokio::sync::Notify::new());
        let blocker = {
            let block = block.clone();
            manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(5), move |_cancel| async move {
                block.notified().await;
                Ok(())
            })
        };
        let blocker_task = tokio::spawn(blocker);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ran_clone = ran.clone();
        let result = manager
            .enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_millis(30), move |_cancel| async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(EnqueueError::Queue(QueueError::QueueTimeout))));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "exec_fn must not run once the deadline has elapsed");

        block.notify_one();
        blocker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_waiting_and_inflight_requests() {
        let manager = QueueManager::new();
        manager.register("conn-a", 1, 8);
        let block = Arc::new(tokio::sync::Notify::new());

        let inflight = {
            let block = block.clone();
            let cancel_seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let cancel_seen_clone = cancel_seen.clone();
            manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(30), move |cancel| {
                let block = block.clone();
                let cancel_seen = cancel_seen_clone.clone();
                async move {
                    tokio::select! {
                        _ = block.notified() => Ok(()),
                        _ = cancel.cancelled() => {
                            cancel_seen.store(true, Ordering::SeqCst);
                            Ok(())
                        }
                    }
                }
            })
        };
        let inflight_task = tokio::spawn(inflight);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiting = manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(30), |_cancel| async { Ok(()) });
        let waiting_task = tokio::spawn(waiting);
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.shutdown_all();

        let waiting_result = waiting_task.await.unwrap();
        assert!(matches!(waiting_result, Err(EnqueueError::Queue(QueueError::ShuttingDown))));

        let inflight_result = inflight_task.await.unwrap();
        assert!(matches!(inflight_result, Err(EnqueueError::Queue(QueueError::ShuttingDown))));
    }

    #[tokio::test]
    async fn independent_connectors_do_not_block_each_other() {
        let manager = QueueManager::new();
        manager.register("conn-a", 1, 0);
        manager.register("conn-b", 1, 8);

        let block = Arc::new(tokio::sync::Notify::new());
        let blocker = {
            let block = block.clone();
            manager.enqueue::<_, _, (), std::convert::Infallible>("conn-a", Duration::from_secs(5), move |_cancel| async move {
                block.notified().await;
                Ok(())
            })
        };
        let blocker_task = tokio::spawn(blocker);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = manager
            .enqueue::<_, _, (), std::convert::Infallible>("conn-b", Duration::from_secs(1), |_cancel| async { Ok(()) })
            .await;
        assert!(other.is_ok(), "conn-b must not be affected by conn-a's congestion");

        block.notify_one();
        blocker_task.await.unwrap().unwrap();
    }
}
