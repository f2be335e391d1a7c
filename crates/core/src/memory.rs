//! In-memory [`ObjectStore`] with failure injection. Backs the test suites and offline runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::{MergePatch, ObjectRef, ObjectStore, StoreError, WatchedObject};

/// Objects are kept in insertion order and `list` returns them in that order, which lets tests
/// control the physical order the pipeline sees.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<Vec<WatchedObject>>,
    patches: AtomicUsize,
    failing_patches: AtomicUsize,
    failing_lists: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: impl IntoIterator<Item = WatchedObject>) -> Self {
        let me = Self::new();
        for o in objects {
            me.insert(o);
        }
        me
    }

    /// Insert or replace (in place) by identity.
    pub fn insert(&self, object: WatchedObject) {
        let mut objects = self.objects.write();
        match objects.iter_mut().find(|o| o.id == object.id) {
            Some(slot) => *slot = object,
            None => objects.push(object),
        }
    }

    pub fn remove(&self, id: &ObjectRef) -> Option<WatchedObject> {
        let mut objects = self.objects.write();
        let idx = objects.iter().position(|o| &o.id == id)?;
        Some(objects.remove(idx))
    }

    pub fn object(&self, id: &ObjectRef) -> Option<WatchedObject> {
        self.objects.read().iter().find(|o| &o.id == id).cloned()
    }

    /// Number of patches that were applied successfully.
    pub fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    /// Make the next `n` patch calls fail with a conflict.
    pub fn fail_next_patches(&self, n: usize) {
        self.failing_patches.store(n, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, on: bool) {
        self.failing_lists.store(on, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, id: &ObjectRef) -> Result<Option<WatchedObject>, StoreError> {
        Ok(self.object(id))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<WatchedObject>, StoreError> {
        if self.failing_lists.load(Ordering::SeqCst) {
            return Err(StoreError::Internal("injected list failure".into()));
        }
        let objects = self.objects.read();
        Ok(objects
            .iter()
            .filter(|o| namespace.map_or(true, |ns| o.id.namespace == ns))
            .cloned()
            .collect())
    }

    async fn merge_patch(&self, id: &ObjectRef, patch: &MergePatch) -> Result<(), StoreError> {
        let injected = self
            .failing_patches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict(format!("injected conflict on {id}")));
        }
        let mut objects = self.objects.write();
        let target = objects
            .iter_mut()
            .find(|o| &o.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        target.payload.extend(patch.payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        target.tags.extend(patch.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_filters_by_namespace_and_keeps_insertion_order() {
        let store = MemoryStore::with_objects([
            WatchedObject::new("ns2", "b"),
            WatchedObject::new("ns1", "a"),
            WatchedObject::new("ns2", "a"),
        ]);
        let all: Vec<_> = store.list(None).await.unwrap().into_iter().map(|o| o.id.to_string()).collect();
        assert_eq!(all, vec!["ns2/b", "ns1/a", "ns2/a"]);
        let ns2 = store.list(Some("ns2")).await.unwrap();
        assert_eq!(ns2.len(), 2);

        store.fail_lists(true);
        assert!(store.list(None).await.is_err());
    }

    #[tokio::test]
    async fn patch_merges_fields_and_tags() {
        let id = ObjectRef::new("ns", "p");
        let store = MemoryStore::with_objects([WatchedObject::new("ns", "p").with_field("keep", "1").with_field("k", "old")]);
        let mut patch = MergePatch::default();
        patch.payload.insert("k".into(), b"new".to_vec());
        patch.tags.insert("t".into(), "v".into());

        store.fail_next_patches(1);
        assert!(matches!(store.merge_patch(&id, &patch).await, Err(StoreError::Conflict(_))));
        store.merge_patch(&id, &patch).await.unwrap();

        let o = store.object(&id).unwrap();
        assert_eq!(o.payload["keep"], b"1");
        assert_eq!(o.payload["k"], b"new");
        assert_eq!(o.tag("t"), Some("v"));
        assert_eq!(store.patch_count(), 1);

        let missing = ObjectRef::new("ns", "nope");
        assert!(matches!(store.merge_patch(&missing, &patch).await, Err(StoreError::NotFound(_))));
    }
}
