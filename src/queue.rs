//! Bounded in-process work queue.
//!
//! Many producers hold cloned [`TaskQueue`] handles; exactly one
//! [`WorkReceiver`] exists and is owned by the worker loop. Items are
//! delivered in the order their enqueue completed. When the buffer is full,
//! producers either wait for a free slot or are rejected, per
//! [`OverflowPolicy`].

use std::future::Future;
use std::sync::Arc;

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{Error, Result};
use crate::model::{WorkId, WorkItem};
use crate::telemetry::metrics;

/// Create a queue: the cloneable producer handle and the single consumer end.
pub fn channel(config: &QueueConfig) -> (TaskQueue, WorkReceiver) {
    // tokio rejects a zero-sized bounded channel
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    (
        TaskQueue {
            tx,
            overflow: config.overflow,
        },
        WorkReceiver { rx },
    )
}

/// Producer handle. Cheap to clone; share it with anything that enqueues work.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<WorkItem>,
    overflow: OverflowPolicy,
}

impl TaskQueue {
    /// Queue unscoped work. Fire-and-forget: the returned id is for
    /// correlation only, no completion signal comes back.
    pub async fn queue_work<F, Fut>(&self, action: F) -> Result<WorkId>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue(WorkItem::unscoped(action)).await
    }

    /// Queue work that receives a freshly resolved `T` when it runs.
    pub async fn queue_scoped_work<T, F, Fut>(&self, action: F) -> Result<WorkId>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue(WorkItem::scoped::<T, F, Fut>(action)).await
    }

    /// [`queue_work`](Self::queue_work), giving up when `cancel` fires
    /// while waiting for capacity.
    pub async fn queue_work_with_cancel<F, Fut>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<WorkId>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue_with_cancel(WorkItem::unscoped(action), cancel)
            .await
    }

    /// [`queue_scoped_work`](Self::queue_scoped_work), giving up when
    /// `cancel` fires while waiting for capacity.
    pub async fn queue_scoped_work_with_cancel<T, F, Fut>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<WorkId>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue_with_cancel(WorkItem::scoped::<T, F, Fut>(action), cancel)
            .await
    }

    /// Queue unscoped work without ever waiting.
    pub fn try_queue_work<F, Fut>(&self, action: F) -> Result<WorkId>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.try_enqueue(WorkItem::unscoped(action))
    }

    /// Queue scoped work without ever waiting.
    pub fn try_queue_scoped_work<T, F, Fut>(&self, action: F) -> Result<WorkId>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.try_enqueue(WorkItem::scoped::<T, F, Fut>(action))
    }

    /// Enqueue a prepared item according to the overflow policy.
    pub async fn enqueue(&self, item: WorkItem) -> Result<WorkId> {
        match self.overflow {
            OverflowPolicy::Reject => self.try_enqueue(item),
            OverflowPolicy::Wait => {
                let (id, kind) = (item.id(), item.kind());
                let result = self.tx.send(item).await.map_err(|_| Error::QueueClosed);
                self.record(id, kind, &result);
                result.map(|_| id)
            }
        }
    }

    /// Enqueue a prepared item; a wait for capacity is abandoned when
    /// `cancel` fires.
    pub async fn enqueue_with_cancel(
        &self,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> Result<WorkId> {
        if self.overflow == OverflowPolicy::Reject {
            return self.try_enqueue(item);
        }

        let (id, kind) = (item.id(), item.kind());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::EnqueueCancelled),
            sent = self.tx.send(item) => sent.map_err(|_| Error::QueueClosed),
        };
        self.record(id, kind, &result);
        result.map(|_| id)
    }

    /// Enqueue a prepared item, failing with `QueueFull` instead of waiting.
    pub fn try_enqueue(&self, item: WorkItem) -> Result<WorkId> {
        let (id, kind) = (item.id(), item.kind());
        let result = self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull {
                capacity: self.capacity(),
            },
            TrySendError::Closed(_) => Error::QueueClosed,
        });
        self.record(id, kind, &result);
        result.map(|_| id)
    }

    /// Items currently buffered (including slots reserved by waiting senders).
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// True once the worker has stopped taking items.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    fn record(&self, id: WorkId, kind: &'static str, result: &Result<()>) {
        let outcome = match result {
            Ok(()) => "ok",
            Err(Error::QueueFull { .. }) => "full",
            Err(Error::EnqueueCancelled) => "cancelled",
            Err(_) => "closed",
        };
        metrics::work_enqueued().add(
            1,
            &[KeyValue::new("kind", kind), KeyValue::new("result", outcome)],
        );
        debug!(work.id = %id, work.kind = kind, result = outcome, depth = self.len(), "enqueue");
    }
}

/// The consumer end. Owned by the worker loop.
pub struct WorkReceiver {
    rx: mpsc::Receiver<WorkItem>,
}

impl WorkReceiver {
    /// Wait for the next item.
    ///
    /// Returns `None` once `stopping` is cancelled (even if items remain
    /// buffered) or when every producer handle has been dropped.
    pub async fn dequeue(&mut self, stopping: &CancellationToken) -> Option<WorkItem> {
        tokio::select! {
            biased;
            _ = stopping.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Refuse further enqueues. Items already buffered stay until
    /// [`close_and_discard`](Self::close_and_discard).
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Close intake and drop everything still buffered. Returns how many
    /// items were discarded.
    pub fn close_and_discard(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
