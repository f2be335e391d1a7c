//! Aggregation -> merge -> hash -> conditional patch for one target.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kmerge_core::{tags, MergePatch, ObjectRef, ObjectStore, Payload, StoreError, WatchedObject};
use kmerge_merge::{content_hash, merge_fields, FieldError};
use kmerge_store::{Registry, TargetSpec};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Fixed-interval retry for the final patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, interval: Duration::from_millis(10) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The target was no longer registered.
    Skipped,
    /// Digest matched the primary's hash tag; nothing written.
    Unchanged { digest: String },
    Patched { digest: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetch primary {primary}: {source}")]
    Fetch { primary: ObjectRef, source: StoreError },
    #[error("primary {0} not found")]
    PrimaryMissing(ObjectRef),
    #[error("list secondaries in {namespace}: {source}")]
    List { namespace: String, source: StoreError },
    #[error(transparent)]
    Merge(#[from] FieldError),
    #[error("patch {primary} failed after {attempts} attempts: {source}")]
    Patch { primary: ObjectRef, attempts: u32, source: StoreError },
}

/// Keep the secondaries of `spec` and put them in merge order: ascending by namespace and name
/// concatenated, so later (higher priority) entries do not depend on list order.
pub fn select_secondaries(spec: &TargetSpec, objects: Vec<WatchedObject>) -> Vec<WatchedObject> {
    let mut picked: Vec<WatchedObject> = objects
        .into_iter()
        .filter(|o| o.id != spec.primary)
        .filter(|o| o.logical_name() == Some(spec.logical_name.as_str()))
        .collect();
    picked.sort_by_cached_key(|o| (format!("{}{}", o.id.namespace, o.id.name), o.id.clone()));
    picked
}

pub struct Reconciler<S: ?Sized> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S: ObjectStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// One pipeline run. Reads a registry snapshot, never holds the registry lock across I/O.
    pub async fn reconcile(&self, registry: &Registry, id: &ObjectRef) -> Result<Outcome, ReconcileError> {
        let Some(spec) = registry.snapshot(id) else {
            return Ok(Outcome::Skipped);
        };
        let primary = match self.store.get(id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                registry.remove(id);
                return Err(ReconcileError::PrimaryMissing(id.clone()));
            }
            Err(source) => return Err(ReconcileError::Fetch { primary: id.clone(), source }),
        };

        let candidates = self.collect(&spec).await?;
        let secondaries = select_secondaries(&spec, candidates);
        debug!(
            primary = %id,
            kind = %spec.kind,
            secondaries = ?secondaries.iter().map(|o| o.id.to_string()).collect::<Vec<_>>(),
            "merge inputs"
        );
        let sources: Vec<&Payload> = secondaries.iter().map(|o| &o.payload).collect();
        let merged = merge_fields(spec.kind, primary.payload.keys(), &sources)?;
        let digest = content_hash(&merged);
        if primary.content_hash() == Some(digest.as_str()) {
            return Ok(Outcome::Unchanged { digest });
        }

        let patch = MergePatch {
            payload: merged,
            tags: BTreeMap::from([(tags::HASH.to_string(), digest.clone())]),
        };
        self.patch_with_retry(id, &patch).await?;
        Ok(Outcome::Patched { digest })
    }

    /// [`Reconciler::reconcile`] plus logging and metrics; what a target's trigger runs.
    pub async fn run(&self, registry: &Registry, id: &ObjectRef) {
        let started = Instant::now();
        counter!("kmerge_reconcile_total", 1u64);
        debug!(primary = %id, "merge started");
        match self.reconcile(registry, id).await {
            Ok(Outcome::Skipped) => debug!(primary = %id, "target no longer registered"),
            Ok(Outcome::Unchanged { digest }) => debug!(primary = %id, %digest, "merged content unchanged"),
            Ok(Outcome::Patched { digest }) => {
                counter!("kmerge_patch_total", 1u64);
                info!(primary = %id, %digest, "primary updated");
            }
            Err(e) => {
                match &e {
                    ReconcileError::Merge(_) => {
                        counter!("kmerge_merge_errors_total", 1u64);
                    }
                    ReconcileError::Patch { .. } => {
                        counter!("kmerge_patch_errors_total", 1u64);
                    }
                    _ => {}
                }
                warn!(primary = %id, error = %e, "merge aborted");
            }
        }
        histogram!("kmerge_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    async fn collect(&self, spec: &TargetSpec) -> Result<Vec<WatchedObject>, ReconcileError> {
        if spec.namespace_filter.is_empty() {
            return self
                .store
                .list(None)
                .await
                .map_err(|source| ReconcileError::List { namespace: "all namespaces".into(), source });
        }
        let mut out = Vec::new();
        for ns in &spec.namespace_filter {
            let items = self
                .store
                .list(Some(ns))
                .await
                .map_err(|source| ReconcileError::List { namespace: ns.clone(), source })?;
            out.extend(items);
        }
        Ok(out)
    }

    async fn patch_with_retry(&self, id: &ObjectRef, patch: &MergePatch) -> Result<(), ReconcileError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.merge_patch(id, patch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    debug!(primary = %id, attempt, error = %e, "patch failed; retrying");
                    tokio::time::sleep(self.retry.interval).await;
                }
                Err(source) => return Err(ReconcileError::Patch { primary: id.clone(), attempts: attempt, source }),
            }
        }
    }
}
