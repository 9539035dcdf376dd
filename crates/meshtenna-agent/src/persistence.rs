//! Serialized access to storage.
//!
//! Every read and write goes through one FIFO queue. Whoever enqueues while
//! no drain is running becomes the drainer and executes queued operations
//! one at a time until the queue is empty; callers arriving during a drain
//! only append and wait for their own result. At most one drain is active,
//! so a later read always observes every earlier write.
//!
//! The drain loop runs on its own task. Cancelling the caller that started
//! it leaves the drain running, so queued operations still complete.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::storage::{OpOutput, Query, Row, Storage, StorageOp};

struct Job {
    op: StorageOp,
    reply: oneshot::Sender<OpOutput>,
}

struct Inner<S> {
    storage: S,
    pending: Mutex<VecDeque<Job>>,
    draining: AtomicBool,
}

/// Cloneable handle to the shared queue.
pub struct PersistenceQueue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for PersistenceQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Clears the draining flag even if the drain task panics mid-operation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: Storage> PersistenceQueue<S> {
    pub fn new(storage: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                pending: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Queue an operation and wait for its result.
    ///
    /// Failed operations are logged and yield an empty output.
    pub async fn enqueue(&self, op: StorageOp) -> OpOutput {
        let (reply, result) = oneshot::channel();
        self.lock_pending().push_back(Job { op, reply });

        if self.inner.try_begin_drain() {
            let inner = self.inner.clone();
            let drain = tokio::spawn(async move { inner.drain().await });
            if let Err(e) = drain.await {
                tracing::warn!(error = %e, "storage drain task failed");
            }
        }

        result.await.unwrap_or_default()
    }

    pub async fn read_one(&self, query: Query) -> Option<Row> {
        self.enqueue(StorageOp::ReadOne(query)).await.rows.into_iter().next()
    }

    pub async fn read_all(&self, query: Query) -> Vec<Row> {
        self.enqueue(StorageOp::ReadAll(query)).await.rows
    }

    pub async fn write(&self, query: Query) -> u64 {
        self.enqueue(StorageOp::Write(query)).await.rows_affected
    }

    /// Number of operations waiting to run.
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        self.inner.lock_pending()
    }
}

impl<S: Storage> Inner<S> {
    fn try_begin_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs with the draining flag already taken.
    async fn drain(&self) {
        loop {
            {
                let _guard = DrainGuard(&self.draining);
                loop {
                    let next = self.lock_pending().pop_front();
                    let Some(job) = next else { break };
                    let output = self.run(&job.op).await;
                    let _ = job.reply.send(output);
                }
            }

            // A job pushed between our last pop and releasing the flag found
            // the flag still set; pick it up rather than strand it.
            if self.lock_pending().is_empty() || !self.try_begin_drain() {
                return;
            }
        }
    }

    async fn run(&self, op: &StorageOp) -> OpOutput {
        match self.storage.execute(op).await {
            Ok(output) => {
                tracing::trace!(kind = op.kind(), sql = %op.query().sql, "storage op complete");
                output
            }
            Err(e) => {
                tracing::warn!(
                    kind = op.kind(),
                    sql = %op.query().sql,
                    error = %e,
                    "storage op failed"
                );
                OpOutput::default()
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageError, Value};
    use std::time::Duration;

    /// Records the order operations execute in and fails on demand.
    #[derive(Default)]
    struct RecordingStorage {
        log: Mutex<Vec<String>>,
        active: AtomicBool,
    }

    impl Storage for RecordingStorage {
        async fn execute(&self, op: &StorageOp) -> Result<OpOutput, StorageError> {
            assert!(
                !self.active.swap(true, Ordering::SeqCst),
                "storage ops overlapped"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
            let sql = op.query().sql.clone();
            self.log.lock().unwrap().push(sql.clone());
            self.active.store(false, Ordering::SeqCst);

            if sql == "FAIL" {
                return Err(StorageError::Database(sqlx::Error::RowNotFound));
            }
            let rows = match op {
                StorageOp::Write(_) => Vec::new(),
                _ => vec![vec![Value::Text(sql)]],
            };
            Ok(OpOutput {
                rows,
                rows_affected: 1,
            })
        }
    }

    #[tokio::test]
    async fn failed_read_yields_empty_and_queue_continues() {
        let queue = PersistenceQueue::new(RecordingStorage::default());
        assert!(queue.read_all(Query::new("FAIL")).await.is_empty());
        assert_eq!(queue.write(Query::new("W")).await, 1);
        assert_eq!(
            queue.read_one(Query::new("R")).await,
            Some(vec![Value::Text("R".into())])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overlap() {
        let queue = PersistenceQueue::new(RecordingStorage::default());
        let mut handles = Vec::new();
        for i in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.write(Query::new(format!("W{i}"))).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1);
        }
        assert_eq!(queue.storage().log.lock().unwrap().len(), 16);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn arrivals_during_drain_run_in_fifo_order() {
        let queue = PersistenceQueue::new(RecordingStorage::default());
        let a = queue.write(Query::new("A"));
        let b = queue.write(Query::new("B"));
        let c = queue.read_all(Query::new("C"));
        let (_, _, rows) = tokio::join!(a, b, c);

        assert_eq!(rows, vec![vec![Value::Text("C".into())]]);
        assert_eq!(*queue.storage().log.lock().unwrap(), vec!["A", "B", "C"]);
    }

    /// Slow enough that a second caller can queue behind the first.
    #[derive(Default)]
    struct SlowStorage {
        started: std::sync::atomic::AtomicUsize,
        log: Mutex<Vec<String>>,
    }

    impl Storage for SlowStorage {
        async fn execute(&self, op: &StorageOp) -> Result<OpOutput, StorageError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.log.lock().unwrap().push(op.query().sql.clone());
            Ok(OpOutput {
                rows: Vec::new(),
                rows_affected: 1,
            })
        }
    }

    #[tokio::test]
    async fn cancelled_drainer_does_not_strand_queued_ops() {
        let queue = PersistenceQueue::new(SlowStorage::default());

        let drainer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.write(Query::new("A")).await }
        });
        while queue.storage().started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.write(Query::new("B")).await }
        });
        while queue.pending() == 0 {
            tokio::task::yield_now().await;
        }

        drainer.abort();
        assert!(drainer.await.unwrap_err().is_cancelled());

        let affected = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("queued write stranded")
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(*queue.storage().log.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(queue.pending(), 0);
    }
}
