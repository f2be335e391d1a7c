//! Target registry: primary identity -> target spec + debounce trigger.

use std::collections::BTreeSet;

use kmerge_core::{tags, Kind, ObjectRef, WatchedObject};
use metrics::gauge;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use crate::queue::{Dispatcher, QueueClosed};
use crate::trigger::Trigger;

/// Builds the trigger for a newly registered target.
pub type TriggerFactory = Box<dyn Fn(&ObjectRef) -> Trigger + Send + Sync>;

/// Result of [`Registry::upsert`].
#[derive(Debug, Clone)]
pub struct Upserted {
    pub trigger: Trigger,
    /// Logical name the target was registered under before this call, when it changed.
    pub renamed_from: Option<String>,
}

/// One primary under management, as read by the merge pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub primary: ObjectRef,
    pub logical_name: String,
    pub kind: Kind,
    /// Empty means every namespace.
    pub namespace_filter: BTreeSet<String>,
}

impl TargetSpec {
    /// `None` unless the object carries both the primary marker and a logical name.
    pub fn from_object(obj: &WatchedObject) -> Option<Self> {
        if !obj.is_primary() {
            return None;
        }
        let logical_name = obj.logical_name()?.to_string();
        Some(Self {
            primary: obj.id.clone(),
            logical_name,
            kind: Kind::from_tag(obj.tag(tags::KIND)),
            namespace_filter: tags::parse_namespace_filter(obj.tag(tags::FROM_NAMESPACES)),
        })
    }

    pub fn admits(&self, namespace: &str) -> bool {
        self.namespace_filter.is_empty() || self.namespace_filter.contains(namespace)
    }
}

struct Target {
    spec: TargetSpec,
    trigger: Trigger,
}

/// All mutation happens under the write lock, lookups under the read lock, and the lock is
/// never held across an await.
pub struct Registry {
    targets: RwLock<FxHashMap<ObjectRef, Target>>,
    dispatcher: Dispatcher,
    make_trigger: TriggerFactory,
}

impl Registry {
    pub fn new(dispatcher: Dispatcher, make_trigger: impl Fn(&ObjectRef) -> Trigger + Send + Sync + 'static) -> Self {
        Self { targets: RwLock::new(FxHashMap::default()), dispatcher, make_trigger: Box::new(make_trigger) }
    }

    /// Create or refresh the target for `obj`. The trigger is created once per target and kept
    /// across refreshes. Returns `None` when `obj` is not a target.
    pub fn upsert(&self, obj: &WatchedObject) -> Option<Upserted> {
        let spec = TargetSpec::from_object(obj)?;
        let mut targets = self.targets.write();
        let mut renamed_from = None;
        let trigger = match targets.get_mut(&spec.primary) {
            Some(existing) => {
                if existing.spec != spec {
                    debug!(primary = %spec.primary, name = %spec.logical_name, kind = %spec.kind, "target refreshed");
                    let previous = std::mem::replace(&mut existing.spec, spec);
                    if previous.logical_name != existing.spec.logical_name {
                        renamed_from = Some(previous.logical_name);
                    }
                }
                existing.trigger.clone()
            }
            None => {
                info!(
                    primary = %spec.primary,
                    name = %spec.logical_name,
                    kind = %spec.kind,
                    from = ?spec.namespace_filter,
                    "target registered"
                );
                let trigger = (self.make_trigger)(&spec.primary);
                targets.insert(spec.primary.clone(), Target { spec, trigger: trigger.clone() });
                trigger
            }
        };
        gauge!("kmerge_targets", targets.len() as f64);
        Some(Upserted { trigger, renamed_from })
    }

    /// Drop the target; returns its logical name if it was registered.
    pub fn remove(&self, id: &ObjectRef) -> Option<String> {
        let mut targets = self.targets.write();
        let removed = targets.remove(id)?;
        gauge!("kmerge_targets", targets.len() as f64);
        info!(primary = %id, name = %removed.spec.logical_name, "target removed");
        Some(removed.spec.logical_name)
    }

    /// Detached copy of the spec; later registry changes do not show through it.
    pub fn snapshot(&self, id: &ObjectRef) -> Option<TargetSpec> {
        self.targets.read().get(id).map(|t| t.spec.clone())
    }

    pub fn trigger(&self, id: &ObjectRef) -> Option<Trigger> {
        self.targets.read().get(id).map(|t| t.trigger.clone())
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Targets that may include a secondary named `logical_name` living in `namespace`, sorted.
    /// An empty `logical_name` matches every target that admits the namespace.
    pub fn matching(&self, logical_name: &str, namespace: &str) -> Vec<ObjectRef> {
        let targets = self.targets.read();
        let mut ids: Vec<ObjectRef> = targets
            .values()
            .filter(|t| logical_name.is_empty() || t.spec.logical_name == logical_name)
            .filter(|t| t.spec.admits(namespace))
            .map(|t| t.spec.primary.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Enqueue every target returned by [`Registry::matching`]. Suspends while the dispatch
    /// queue is full. Returns how many ids were enqueued.
    pub async fn notify_by_logical_name(&self, logical_name: &str, namespace: &str) -> Result<usize, QueueClosed> {
        let ids = self.matching(logical_name, namespace);
        trace!(name = %logical_name, ns = %namespace, count = ids.len(), "notifying targets");
        let n = ids.len();
        for id in ids {
            self.dispatcher.enqueue(id).await?;
        }
        Ok(n)
    }

    /// Enqueue one target id.
    pub async fn enqueue(&self, id: ObjectRef) -> Result<(), QueueClosed> {
        self.dispatcher.enqueue(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::dispatch_queue;
    use crate::trigger::{TriggerFn, TriggerParams};
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn noop_registry(cap: usize) -> (Registry, crate::queue::DispatchReceiver) {
        let (tx, rx) = dispatch_queue(cap);
        let reg = Registry::new(tx, |id: &ObjectRef| {
            let func: TriggerFn = Arc::new(|| async {}.boxed());
            let params = TriggerParams { name: id.to_string(), min_interval: Duration::from_millis(10) };
            Trigger::new(params, CancellationToken::new(), TaskTracker::new(), func)
        });
        (reg, rx)
    }

    fn primary(ns: &str, name: &str, logical: &str) -> WatchedObject {
        WatchedObject::new(ns, name).with_tag(tags::PRIMARY, "true").with_tag(tags::NAME, logical)
    }

    #[test]
    fn upsert_keeps_trigger_and_refreshes_spec() {
        let (reg, _rx) = noop_registry(8);
        let obj = primary("ns1", "p", "cfg").with_tag(tags::FROM_NAMESPACES, "ns1,ns2");
        let first = reg.upsert(&obj).unwrap();
        assert!(first.renamed_from.is_none());

        let updated = primary("ns1", "p", "cfg2").with_tag(tags::KIND, "json").with_tag(tags::FROM_NAMESPACES, "ns3");
        let second = reg.upsert(&updated).unwrap();
        assert!(first.trigger.same_as(&second.trigger));
        assert_eq!(second.renamed_from.as_deref(), Some("cfg"));
        assert!(reg.upsert(&updated).unwrap().renamed_from.is_none());
        assert_eq!(reg.len(), 1);

        let spec = reg.snapshot(&obj.id).unwrap();
        assert_eq!(spec.logical_name, "cfg2");
        assert_eq!(spec.kind, Kind::Json);
        // filter is replaced, not accumulated
        assert_eq!(spec.namespace_filter.into_iter().collect::<Vec<_>>(), vec!["ns3".to_string()]);
    }

    #[test]
    fn upsert_ignores_non_targets() {
        let (reg, _rx) = noop_registry(8);
        let secondary = WatchedObject::new("ns", "s").with_tag(tags::NAME, "cfg");
        let unnamed = WatchedObject::new("ns", "u").with_tag(tags::PRIMARY, "");
        assert!(reg.upsert(&secondary).is_none());
        assert!(reg.upsert(&unnamed).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_returns_logical_name_once() {
        let (reg, _rx) = noop_registry(8);
        let obj = primary("ns", "p", "cfg");
        reg.upsert(&obj);
        assert_eq!(reg.remove(&obj.id).as_deref(), Some("cfg"));
        assert_eq!(reg.remove(&obj.id), None);
        assert!(reg.snapshot(&obj.id).is_none());
        assert!(reg.trigger(&obj.id).is_none());
    }

    #[test]
    fn snapshot_is_detached_from_later_updates() {
        let (reg, _rx) = noop_registry(8);
        let obj = primary("ns", "p", "cfg");
        reg.upsert(&obj);
        let snap = reg.snapshot(&obj.id).unwrap();
        reg.upsert(&primary("ns", "p", "other"));
        assert_eq!(snap.logical_name, "cfg");
        assert_eq!(reg.snapshot(&obj.id).unwrap().logical_name, "other");
    }

    #[test]
    fn matching_respects_name_and_namespace_filter() {
        let (reg, _rx) = noop_registry(8);
        reg.upsert(&primary("ns1", "all", "cfg"));
        reg.upsert(&primary("ns1", "scoped", "cfg").with_tag(tags::FROM_NAMESPACES, "ns1,ns2"));
        reg.upsert(&primary("ns1", "other", "db"));

        let names = |v: Vec<ObjectRef>| v.into_iter().map(|r| r.name).collect::<Vec<_>>();
        assert_eq!(names(reg.matching("cfg", "ns2")), vec!["all", "scoped"]);
        assert_eq!(names(reg.matching("cfg", "ns3")), vec!["all"]);
        assert_eq!(names(reg.matching("", "ns3")), vec!["all", "other"]);
        assert!(reg.matching("nope", "ns1").is_empty());
    }

    #[tokio::test]
    async fn notify_enqueues_matching_targets() {
        let (reg, rx) = noop_registry(8);
        reg.upsert(&primary("ns1", "a", "cfg"));
        reg.upsert(&primary("ns2", "b", "cfg"));
        reg.upsert(&primary("ns3", "c", "db"));

        assert_eq!(reg.notify_by_logical_name("cfg", "ns9").await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), ObjectRef::new("ns1", "a"));
        assert_eq!(rx.recv().await.unwrap(), ObjectRef::new("ns2", "b"));
    }
}
