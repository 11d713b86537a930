use std::collections::HashMap;
use std::hash::Hash;

use spin::Mutex;

/// The first retainer of every object marked while retaining paths are tracked.
///
/// `None` means the object was marked from a root.
pub struct Retainers<O> {
    retainers: Mutex<HashMap<O, Option<O>>>,
}

impl<O: Copy + Eq + Hash + std::fmt::Debug> Retainers<O> {
    pub fn new() -> Self {
        Self {
            retainers: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `host` caused `object` to be marked. Only the first retainer is kept.
    pub fn add_retainer(&self, host: Option<O>, object: O) {
        self.retainers.lock().entry(object).or_insert(host);
    }

    /// The retainer of `object`, if it was marked from another object.
    pub fn retainer_of(&self, object: O) -> Option<O> {
        self.retainers.lock().get(&object).copied().flatten()
    }

    pub fn is_retained(&self, object: O) -> bool {
        self.retainers.lock().contains_key(&object)
    }

    /// The chain of retainers from `object` back to the object marked from a root,
    /// starting with `object` itself.
    pub fn path_to(&self, object: O) -> Vec<O> {
        let retainers = self.retainers.lock();
        let mut path = vec![object];
        let mut current = object;
        while let Some(Some(host)) = retainers.get(&current) {
            if path.contains(host) {
                break;
            }
            path.push(*host);
            current = *host;
        }
        debug!("Retaining path of {:?}: {:?}", object, path);
        path
    }

    pub fn clear(&self) {
        self.retainers.lock().clear();
    }
}

impl<O: Copy + Eq + Hash + std::fmt::Debug> Default for Retainers<O> {
    fn default() -> Self {
        Self::new()
    }
}
