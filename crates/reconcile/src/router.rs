//! Change-event router: turns watch deltas into registry updates and dispatches.

use std::sync::Arc;

use kmerge_core::{Delta, DeltaKind};
use kmerge_store::{QueueClosed, Registry};
use tracing::trace;

pub struct EventRouter {
    registry: Arc<Registry>,
}

impl EventRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Route one delta. Suspends while the dispatch queue is full.
    ///
    /// Targets are registered (or refreshed) and enqueued; a target whose logical name changed
    /// also wakes the targets still using the old name. Anything else, including deleted and
    /// un-tagged primaries, leaves the registry and wakes the targets that may merge it: by the
    /// object's logical name, by the name it was registered under when that differs, or every
    /// target admitting its namespace when it has no name at all.
    pub async fn handle(&self, delta: Delta) -> Result<(), QueueClosed> {
        let obj = &delta.object;
        let gone = delta.kind == DeltaKind::Deleted || obj.deleting;
        if !gone && obj.is_target() {
            let renamed_from = self.registry.upsert(obj).and_then(|u| u.renamed_from);
            self.registry.enqueue(obj.id.clone()).await?;
            if let Some(prev) = renamed_from {
                let n = self.registry.notify_by_logical_name(&prev, &obj.id.namespace).await?;
                trace!(object = %obj.id, name = %prev, notified = n, "target renamed; old peers woken");
            }
            return Ok(());
        }

        let removed = self.registry.remove(&obj.id);
        let tagged = obj.logical_name();
        let mut names: Vec<&str> = tagged.into_iter().collect();
        if let Some(prev) = removed.as_deref().filter(|prev| Some(*prev) != tagged) {
            names.push(prev);
        }
        if names.is_empty() {
            names.push("");
        }
        for name in names {
            let n = self.registry.notify_by_logical_name(name, &obj.id.namespace).await?;
            trace!(object = %obj.id, name = %name, notified = n, "secondary change routed");
        }
        Ok(())
    }
}
