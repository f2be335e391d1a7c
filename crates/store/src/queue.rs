//! Bounded dispatch queue of target ids and the worker pool draining it.
//!
//! The queue is not deduplicated; repeated ids are absorbed by the targets' triggers. A full
//! queue suspends the producer instead of dropping ids.

use std::sync::Arc;

use kmerge_core::ObjectRef;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::registry::Registry;

/// Worker pools smaller than this are rounded up.
pub const MIN_WORKERS: usize = 3;

#[derive(Debug, thiserror::Error)]
#[error("dispatch queue closed")]
pub struct QueueClosed;

/// Producer side of the dispatch queue.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::Sender<ObjectRef>,
}

impl Dispatcher {
    /// Suspends while the queue is full.
    pub async fn enqueue(&self, id: ObjectRef) -> Result<(), QueueClosed> {
        self.tx.send(id).await.map_err(|_| QueueClosed)
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer side, shared by all workers.
#[derive(Clone)]
pub struct DispatchReceiver {
    rx: Arc<Mutex<mpsc::Receiver<ObjectRef>>>,
}

impl DispatchReceiver {
    pub async fn recv(&self) -> Option<ObjectRef> {
        self.rx.lock().await.recv().await
    }

    /// Take whatever is queued right now without waiting. Empty if a worker holds the queue.
    pub fn drain_ready(&self) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(id) = rx.try_recv() {
                out.push(id);
            }
        }
        out
    }
}

pub fn dispatch_queue(cap: usize) -> (Dispatcher, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(cap.max(1));
    (Dispatcher { tx }, DispatchReceiver { rx: Arc::new(Mutex::new(rx)) })
}

/// Spawn `workers` (at least [`MIN_WORKERS`]) tasks that pop ids and fire the matching trigger.
/// Workers stop on shutdown or once every producer is gone.
pub fn spawn_workers(
    workers: usize,
    rx: DispatchReceiver,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let workers = workers.max(MIN_WORKERS);
    (0..workers)
        .map(|n| tokio::spawn(worker(n, rx.clone(), Arc::clone(&registry), shutdown.clone())))
        .collect()
}

async fn worker(n: usize, rx: DispatchReceiver, registry: Arc<Registry>, shutdown: CancellationToken) {
    debug!(worker = n, "dispatch worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(id) = next else { break };
        match registry.trigger(&id) {
            Some(trigger) => trigger.fire(),
            None => trace!(primary = %id, "target gone before dispatch"),
        }
    }
    debug!(worker = n, "dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{Trigger, TriggerFn, TriggerParams};
    use futures::FutureExt;
    use kmerge_core::{tags, WatchedObject};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::task::TaskTracker;

    #[tokio::test(start_paused = true)]
    async fn full_queue_suspends_producer() {
        let (tx, rx) = dispatch_queue(1);
        assert_eq!(tx.capacity(), 1);
        tx.enqueue(ObjectRef::new("ns", "a")).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.enqueue(ObjectRef::new("ns", "b"))).await;
        assert!(blocked.is_err(), "second enqueue should wait for room");

        assert_eq!(rx.recv().await.unwrap().name, "a");
        tx.enqueue(ObjectRef::new("ns", "c")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn workers_fire_triggers_until_shutdown() {
        let shutdown = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = dispatch_queue(16);
        let registry = {
            let (shutdown, runs) = (shutdown.clone(), runs.clone());
            Arc::new(Registry::new(tx, move |id: &ObjectRef| {
                let runs = runs.clone();
                let func: TriggerFn = Arc::new(move || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                });
                let params = TriggerParams { name: id.to_string(), min_interval: Duration::from_millis(100) };
                Trigger::new(params, shutdown.clone(), TaskTracker::new(), func)
            }))
        };
        let obj = WatchedObject::new("ns", "p").with_tag(tags::PRIMARY, "").with_tag(tags::NAME, "cfg");
        registry.upsert(&obj).unwrap();
        for _ in 0..5 {
            registry.enqueue(obj.id.clone()).await.unwrap();
        }
        // unknown ids are skipped
        registry.enqueue(ObjectRef::new("ns", "ghost")).await.unwrap();

        let handles = spawn_workers(1, rx, Arc::clone(&registry), shutdown.clone());
        assert_eq!(handles.len(), MIN_WORKERS);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
