//! Wires registry, triggers, worker pool and router around one object store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use kmerge_core::{Delta, ObjectRef, ObjectStore};
use kmerge_store::{dispatch_queue, spawn_workers, Registry, Trigger, TriggerFn, TriggerParams};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::pipeline::{Reconciler, RetryPolicy};
use crate::router::EventRouter;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Raised to [`kmerge_store::MIN_WORKERS`] if lower.
    pub workers: usize,
    pub queue_capacity: usize,
    /// Minimum spacing between two merges of the same target.
    pub min_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 5, queue_capacity: 128, min_interval: Duration::from_secs(1), retry: RetryPolicy::default() }
    }
}

pub struct Controller {
    registry: Arc<Registry>,
    router: EventRouter,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Controller {
    /// Build the registry and spawn the worker pool. Everything stops once `shutdown` fires.
    pub fn start<S>(store: Arc<S>, config: ControllerConfig, shutdown: CancellationToken) -> Self
    where
        S: ObjectStore + ?Sized + 'static,
    {
        let tracker = TaskTracker::new();
        let (dispatcher, receiver) = dispatch_queue(config.queue_capacity);
        let reconciler = Arc::new(Reconciler::new(store, config.retry));

        let registry = Arc::new_cyclic(|weak: &Weak<Registry>| {
            let weak = weak.clone();
            let (shutdown, tracker) = (shutdown.clone(), tracker.clone());
            let min_interval = config.min_interval;
            Registry::new(dispatcher, move |id: &ObjectRef| {
                let (weak, reconciler, target) = (weak.clone(), Arc::clone(&reconciler), id.clone());
                let func: TriggerFn = Arc::new(move || {
                    let (weak, reconciler, target) = (weak.clone(), Arc::clone(&reconciler), target.clone());
                    async move {
                        if let Some(registry) = weak.upgrade() {
                            reconciler.run(&registry, &target).await;
                        }
                    }
                    .boxed()
                });
                let params = TriggerParams { name: id.to_string(), min_interval };
                Trigger::new(params, shutdown.clone(), tracker.clone(), func)
            })
        });

        let workers = spawn_workers(config.workers, receiver, Arc::clone(&registry), shutdown.clone());
        info!(
            workers = workers.len(),
            queue = config.queue_capacity,
            min_interval_ms = config.min_interval.as_millis() as u64,
            "controller started"
        );
        let router = EventRouter::new(Arc::clone(&registry));
        Self { registry, router, workers, shutdown, tracker }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Route deltas until shutdown or until the sender side is dropped.
    pub async fn run(&self, mut events: mpsc::Receiver<Delta>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                ev = events.recv() => ev,
            };
            let Some(delta) = next else { break };
            let routed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                res = self.router.handle(delta) => res,
            };
            if let Err(e) = routed {
                warn!(error = %e, "stopping event loop");
                break;
            }
        }
        info!("event loop stopped");
    }

    /// Cancel, join the workers and wait up to `grace` for in-flight merges. Returns false when
    /// merges were still running at the deadline.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.shutdown.cancel();
        for w in self.workers {
            if let Err(e) = w.await {
                warn!(error = %e, "dispatch worker failed");
            }
        }
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("controller stopped");
                true
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "merges still in flight at shutdown deadline");
                false
            }
        }
    }
}
