// ── Device registry ──
//
// Concurrent device-id -> node map with a `watch` snapshot of the ids,
// rebuilt on every membership change. Inserts are atomic
// insert-if-absent, so two registrations for one id cannot both win.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::model::DeviceId;

pub(crate) struct Registry<T: Send + Sync + 'static> {
    by_id: DashMap<DeviceId, Arc<T>>,
    ids: watch::Sender<Arc<Vec<DeviceId>>>,
}

impl<T: Send + Sync + 'static> Registry<T> {
    pub(crate) fn new() -> Self {
        let (ids, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            ids,
        }
    }

    /// Insert `entry` unless the id is taken; hands back the occupant if it is.
    pub(crate) fn insert_if_absent(&self, id: DeviceId, entry: Arc<T>) -> Result<(), Arc<T>> {
        match self.by_id.entry(id) {
            Entry::Occupied(existing) => return Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => drop(slot.insert(entry)),
        }
        // Shard lock is released; the snapshot iterates every shard.
        self.rebuild_snapshot();
        Ok(())
    }

    pub(crate) fn get(&self, id: &DeviceId) -> Option<Arc<T>> {
        self.by_id.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Remove `id` only while it still maps to `entry`.
    pub(crate) fn remove_if_same(&self, id: &DeviceId, entry: &Arc<T>) -> bool {
        let removed = self
            .by_id
            .remove_if(id, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            self.rebuild_snapshot();
        }
        removed
    }

    pub(crate) fn values(&self) -> Vec<Arc<T>> {
        self.by_id.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<DeviceId>>> {
        self.ids.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn rebuild_snapshot(&self) {
        let mut ids: Vec<DeviceId> = self.by_id.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.ids.send_modify(|snap| *snap = Arc::new(ids));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn insert_if_absent_keeps_first_entry() {
        let reg: Registry<&'static str> = Registry::new();
        let first = Arc::new("first");
        reg.insert_if_absent(DeviceId::from("d1"), Arc::clone(&first))
            .unwrap();
        let occupant = reg
            .insert_if_absent(DeviceId::from("d1"), Arc::new("second"))
            .unwrap_err();
        assert!(Arc::ptr_eq(&occupant, &first));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_if_same_ignores_replaced_entries() {
        let reg: Registry<u32> = Registry::new();
        let id = DeviceId::from("d1");
        let stale = Arc::new(1);
        reg.insert_if_absent(id.clone(), Arc::new(2)).unwrap();
        assert!(!reg.remove_if_same(&id, &stale));
        let current = reg.get(&id).unwrap();
        assert!(reg.remove_if_same(&id, &current));
        assert!(reg.get(&id).is_none());
    }

    #[test]
    fn snapshot_tracks_membership() {
        let reg: Registry<u32> = Registry::new();
        let rx = reg.subscribe();
        reg.insert_if_absent(DeviceId::from("b"), Arc::new(1)).unwrap();
        reg.insert_if_absent(DeviceId::from("a"), Arc::new(2)).unwrap();
        assert_eq!(
            **rx.borrow(),
            vec![DeviceId::from("a"), DeviceId::from("b")]
        );
        assert_eq!(reg.values().len(), 2);
    }
}
