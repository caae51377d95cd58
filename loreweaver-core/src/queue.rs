//! Single-concurrency embedding refresh queue.
//!
//! Embedding computation calls an external model and must not block the
//! write path: card upserts return immediately and schedule a refresh here.
//! Concurrency is capped at 1 to respect upstream rate limits and avoid
//! duplicate-embedding races on the same row. At most one task per key is
//! pending at a time, so a burst of upserts during one turn coalesces into a
//! single story-wide sweep.
//!
//! The queue is an explicitly injected object, not a module-level singleton:
//! construct one per process (or per test) and hand it to the world store.

use crate::error::Result;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::Notify;

type Task = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Dedup-by-key async task queue with a single worker.
#[derive(Clone)]
pub struct EmbeddingQueue {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<(String, Task)>,
    pending: Mutex<HashSet<String>>,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn finish(&self, key: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl EmbeddingQueue {
    /// Create a queue and spawn its worker on the current runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Task)>();
        let inner = Arc::new(Inner {
            tx,
            pending: Mutex::new(HashSet::new()),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let worker = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some((key, task)) = rx.recv().await {
                if let Err(error) = task.await {
                    tracing::warn!(%key, %error, "embedding task failed");
                }
                match worker.upgrade() {
                    Some(inner) => inner.finish(&key),
                    // every queue handle dropped; nothing left to notify
                    None => break,
                }
            }
        });

        Self { inner }
    }

    /// Schedule `task` under `key`. A no-op if a task with the same key is
    /// already pending or running: the coalesced request is covered by the
    /// in-flight one, and failures are retried implicitly by the next write
    /// that re-enqueues the key.
    pub fn enqueue<F>(&self, key: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = key.into();
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !pending.insert(key.clone()) {
                return;
            }
        }
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.inner.tx.send((key.clone(), Box::pin(task))).is_err() {
            // worker is gone (runtime shutdown); roll back bookkeeping
            self.inner.finish(&key);
        }
    }

    /// Wait until every scheduled task has finished. Used by tests and
    /// tools that need a consistent embedding snapshot.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of keys currently pending or running.
    pub fn pending_len(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl Default for EmbeddingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_tasks_run_and_drain() {
        let queue = EmbeddingQueue::new();
        let counter = Arc::new(AtomicU32::new(0));

        for i in 0..3 {
            let counter = Arc::clone(&counter);
            queue.enqueue(format!("key-{i}"), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        queue.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_same_key_coalesces() {
        let queue = EmbeddingQueue::new();
        let counter = Arc::new(AtomicU32::new(0));

        // no await point between the two enqueues, so the worker cannot have
        // started the first task yet
        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            queue.enqueue("cards:story-1", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        queue.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_task_releases_key() {
        let queue = EmbeddingQueue::new();
        let counter = Arc::new(AtomicU32::new(0));

        queue.enqueue("key", async move {
            Err(crate::error::EngineError::Storage("boom".to_string()))
        });
        queue.drain().await;

        // key is free again after failure
        {
            let counter = Arc::clone(&counter);
            queue.enqueue("key", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_returns_immediately() {
        let queue = EmbeddingQueue::new();
        queue.drain().await;
    }
}
