use crate::body::{Body, BodyId};
use crate::sync;
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of live bodies, used for pairwise collision scans.
///
/// Scans hold the registry lock for their whole duration instead of copying
/// a snapshot, so a body removed by `stop` is never visited half-gone. Lock
/// order for a tick is registry, then the ticking body, then one neighbour
/// at a time; nothing else takes two body locks.
#[derive(Default)]
pub struct BodyRegistry {
    members: Mutex<FnvHashMap<BodyId, Arc<Body>>>,
}

/// Registry lock held for the duration of a scan.
pub struct RegistryScan<'a> {
    members: MutexGuard<'a, FnvHashMap<BodyId, Arc<Body>>>,
}

impl RegistryScan<'_> {
    /// Calls `f` on every member except `than`.
    pub fn for_each_other<F>(&self, than: BodyId, mut f: F)
    where
        F: FnMut(&Body),
    {
        for (id, body) in self.members.iter() {
            if *id != than {
                f(body);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl BodyRegistry {
    pub fn new() -> BodyRegistry {
        BodyRegistry::default()
    }

    pub fn add(&self, body: Arc<Body>) {
        sync::lock(&self.members).insert(body.id(), body);
    }

    pub fn remove(&self, id: BodyId) -> Option<Arc<Body>> {
        sync::lock(&self.members).remove(&id)
    }

    pub fn contains(&self, id: BodyId) -> bool {
        sync::lock(&self.members).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the registry lock; membership is frozen until the scan is dropped.
    pub fn lock(&self) -> RegistryScan<'_> {
        RegistryScan {
            members: sync::lock(&self.members),
        }
    }

    pub fn for_each_other<F>(&self, than: BodyId, f: F)
    where
        F: FnMut(&Body),
    {
        self.lock().for_each_other(than, f)
    }

    /// Empties the registry, handing back whatever was still registered.
    pub fn clear(&self) -> Vec<Arc<Body>> {
        sync::lock(&self.members).drain().map(|(_, body)| body).collect()
    }
}
