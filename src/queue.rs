// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded single-consumer work queue.
//!
//! Both internal queues (replication messages, change notifications) share
//! this shape: a bounded channel drained by one worker task. Enqueue never
//! blocks — a full queue drops the item and the caller logs it, which is
//! acceptable back-pressure because the reconciler repairs any missed
//! delivery on its next tick.
//!
//! The pause gate is a fair `RwLock<()>`: the worker holds the read side
//! while handling a job, the reconciler takes the write side for the span of
//! a sync pass. Fairness means a pause request waits for the in-flight job,
//! then blocks new ones until released.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) struct TaskQueue<T> {
    name: &'static str,
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    gate: Arc<RwLock<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// While held, the worker is idle and stays idle. Jobs keep queueing.
pub(crate) type QueuePause = OwnedRwLockWriteGuard<()>;

impl<T: Send + 'static> TaskQueue<T> {
    /// Spawn the worker task and return the queue handle.
    pub(crate) fn spawn<F, Fut>(name: &'static str, capacity: usize, mut handler: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel(capacity);
        let gate = Arc::new(RwLock::new(()));
        let worker_gate = Arc::clone(&gate);

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let _running = worker_gate.read().await;
                handler(job).await;
            }
            debug!(queue = name, "worker drained and stopped");
        });

        Self {
            name,
            capacity,
            tx: Mutex::new(Some(tx)),
            gate,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue without blocking. Returns `false` (and drops the job) when the
    /// queue is full or already shut down.
    pub(crate) fn try_push(&self, job: T) -> bool {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Suspend the worker after its current job. Processing resumes when the
    /// returned guard is dropped.
    pub(crate) async fn pause(&self) -> QueuePause {
        Arc::clone(&self.gate).write_owned().await
    }

    /// Stop accepting jobs and let the worker drain what is queued, waiting
    /// at most `timeout` before aborting it.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        drop(self.tx.lock().take());
        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };
        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(queue = self.name, "worker panicked during drain");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(queue = self.name, ?timeout, "drain deadline hit, aborting worker");
                worker.abort();
            }
        }
    }
}
