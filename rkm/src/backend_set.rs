//! Shared membership registries.
//!
//! A [`BackendSet`] maps registration ids to capabilities of one type. Every
//! clone of a set is another owner of the same registry: a mutation made
//! through one handle is immediately visible through all the others, and the
//! registry is freed when the last handle goes away.
//!
//! Readers never get a live iterator. [`BackendSet::snapshot`] copies the
//! current members out under the lock, so callers can iterate while other
//! owners keep registering and unregistering.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::MachineError;

/// Registration handle returned by [`BackendSet::register`].
pub type BackendId = u64;

pub struct BackendSet<T> {
    inner: Arc<Mutex<Backends<T>>>,
}

struct Backends<T> {
    entries: BTreeMap<BackendId, T>,
    next_id: BackendId,
    // Smallest id `choose_one` may hand out next.
    cursor: BackendId,
}

impl<T> Backends<T> {
    // Keeps fresh ids ahead of caller-chosen ones until the id space wraps.
    fn bump_next_id(&mut self, id: BackendId) {
        if id >= self.next_id {
            self.next_id = id.wrapping_add(1);
        }
    }
}

impl<T> Default for BackendSet<T> {
    fn default() -> Self {
        BackendSet {
            inner: Arc::new(Mutex::new(Backends {
                entries: BTreeMap::new(),
                next_id: 0,
                cursor: 0,
            })),
        }
    }
}

impl<T> Clone for BackendSet<T> {
    fn clone(&self) -> Self {
        BackendSet {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for BackendSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("len", &self.len())
            .field("owners", &self.owners())
            .finish()
    }
}

impl<T> BackendSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Backends<T>> {
        // Every mutation leaves the map consistent, so a poisoned lock is safe to reuse.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a capability under a freshly allocated id. Ids already taken,
    /// including ones chosen through [`BackendSet::insert`], are skipped and
    /// allocation wraps around after `u64::MAX`.
    pub fn register(&self, backend: T) -> BackendId {
        let mut backends = self.lock();
        let mut id = backends.next_id;
        while backends.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        backends.next_id = id.wrapping_add(1);
        backends.entries.insert(id, backend);
        id
    }

    /// Adds a capability under an id chosen by the caller, replacing any
    /// capability already registered under it.
    pub fn insert(&self, id: BackendId, backend: T) -> Option<T> {
        let mut backends = self.lock();
        backends.bump_next_id(id);
        backends.entries.insert(id, backend)
    }

    /// Removes a registration. Unknown ids are ignored.
    pub fn unregister(&self, id: BackendId) -> Option<T> {
        self.lock().entries.remove(&id)
    }

    /// Replaces the whole membership under a single lock acquisition.
    pub fn reset<I>(&self, members: I)
    where
        I: IntoIterator<Item = (BackendId, T)>,
    {
        let mut backends = self.lock();
        backends.entries.clear();
        backends.cursor = 0;
        for (id, backend) in members {
            backends.bump_next_id(id);
            backends.entries.insert(id, backend);
        }
    }

    pub fn clear(&self) {
        let mut backends = self.lock();
        backends.entries.clear();
        backends.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn contains(&self, id: BackendId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Number of handles currently sharing this registry.
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same registry.
    pub fn same_set(&self, other: &BackendSet<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> BackendSet<T> {
    /// Point-in-time copy of the members, ordered by registration id.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().entries.values().cloned().collect()
    }

    /// Like [`BackendSet::snapshot`], keeping the registration ids.
    pub fn entries(&self) -> Vec<(BackendId, T)> {
        self.lock()
            .entries
            .iter()
            .map(|(id, backend)| (*id, backend.clone()))
            .collect()
    }

    /// Picks a member, cycling through the set on successive calls.
    pub fn choose_one(&self) -> Result<T, MachineError> {
        let mut backends = self.lock();
        let cursor = backends.cursor;
        let (id, backend) = backends
            .entries
            .range((Bound::Included(cursor), Bound::Unbounded))
            .next()
            .or_else(|| backends.entries.iter().next())
            .map(|(id, backend)| (*id, backend.clone()))
            .ok_or(MachineError::NoBackendAvailable)?;
        backends.cursor = id.wrapping_add(1);
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_registrations() {
        let set = BackendSet::new();
        let a = set.register("a");
        let b = set.register("b");
        let c = set.register("c");
        assert_ne!(a, b);

        assert_eq!(set.unregister(b), Some("b"));
        assert_eq!(set.snapshot(), vec!["a", "c"]);

        set.unregister(a);
        set.unregister(c);
        assert!(set.is_empty());
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let set = BackendSet::new();
        let id = set.register(1);
        assert_eq!(set.unregister(id + 100), None);
        assert_eq!(set.unregister(id), Some(1));
        assert_eq!(set.unregister(id), None);
        assert!(set.is_empty());
    }

    #[test]
    fn clones_share_one_registry() {
        let set = BackendSet::new();
        let other = set.clone();
        assert!(set.same_set(&other));
        assert_eq!(set.owners(), 2);

        let id = other.register("peer");
        assert_eq!(set.snapshot(), vec!["peer"]);
        set.unregister(id);
        assert!(other.is_empty());

        drop(other);
        assert_eq!(set.owners(), 1);
        assert!(!set.same_set(&BackendSet::new()));
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let set = BackendSet::new();
        set.register(1);
        set.register(2);
        let snapshot = set.snapshot();
        set.clear();
        set.register(3);
        assert_eq!(snapshot, vec![1, 2]);
        assert_eq!(set.snapshot(), vec![3]);
    }

    #[test]
    fn explicit_ids_do_not_collide_with_allocated_ones() {
        let set = BackendSet::new();
        assert_eq!(set.insert(7, "seven"), None);
        let id = set.register("next");
        assert!(id > 7);
        assert_eq!(set.insert(7, "again"), Some("seven"));
        assert_eq!(set.entries(), vec![(7, "again"), (id, "next")]);
    }

    #[test]
    fn reset_replaces_membership() {
        let set = BackendSet::new();
        set.register("old");
        set.reset(vec![(10, "x"), (11, "y")]);
        assert_eq!(set.entries(), vec![(10, "x"), (11, "y")]);
        set.reset(Vec::new());
        assert!(set.is_empty());
    }

    #[test]
    fn choose_one_round_robins() {
        let set = BackendSet::new();
        assert!(matches!(
            set.choose_one(),
            Err(MachineError::NoBackendAvailable)
        ));

        set.register("a");
        let b = set.register("b");
        set.register("c");
        let picks: Vec<_> = (0..4).map(|_| set.choose_one().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);

        // The next pick would be "b"; removing it moves the rotation on.
        set.unregister(b);
        assert_eq!(set.choose_one().unwrap(), "c");
        assert_eq!(set.choose_one().unwrap(), "a");
    }

    #[test]
    fn allocation_wraps_past_the_largest_id() {
        let set = BackendSet::new();
        set.insert(0, "zero");
        set.insert(u64::MAX, "peer-max");

        let fresh = set.register("fresh");
        assert_eq!(fresh, 1);
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.entries(),
            vec![(0, "zero"), (1, "fresh"), (u64::MAX, "peer-max")]
        );
    }

    #[test]
    fn rotation_wraps_after_the_largest_id() {
        let set = BackendSet::new();
        set.insert(1, "a");
        set.insert(u64::MAX, "z");
        let picks: Vec<_> = (0..4).map(|_| set.choose_one().unwrap()).collect();
        assert_eq!(picks, vec!["a", "z", "a", "z"]);
    }
}
