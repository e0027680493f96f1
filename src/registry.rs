//! Process-wide set of known Coroot instances
//!
//! Per-instance resources are reclaimed through owner references, but
//! cluster-scoped resources are shared across all instances and have no
//! owner. The registry exists to answer one question: did the instance that
//! just disappeared take the last reference to those shared resources with
//! it?

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

/// Identity of a Coroot instance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceKey {
    /// Instance namespace
    pub namespace: String,
    /// Instance name
    pub name: String,
}

impl InstanceKey {
    /// Build a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lock-guarded set of currently known instance keys
#[derive(Default)]
pub struct InstanceRegistry {
    keys: Mutex<BTreeSet<InstanceKey>>,
}

impl InstanceRegistry {
    /// Record that an instance exists (idempotent)
    pub fn mark_seen(&self, key: &InstanceKey) {
        self.keys.lock().expect("registry lock").insert(key.clone());
    }

    /// Record that an instance is gone.
    ///
    /// Returns true when the registry is empty afterwards, i.e. the caller
    /// must clean up shared cluster-scoped resources.
    pub fn mark_gone(&self, key: &InstanceKey) -> bool {
        let mut keys = self.keys.lock().expect("registry lock");
        keys.remove(key);
        keys.is_empty()
    }

    /// Snapshot of all known keys
    pub fn keys(&self) -> Vec<InstanceKey> {
        self.keys
            .lock()
            .expect("registry lock")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_seen_is_idempotent() {
        let registry = InstanceRegistry::default();
        let key = InstanceKey::new("ns", "a");
        registry.mark_seen(&key);
        registry.mark_seen(&key);
        assert_eq!(registry.keys(), vec![key]);
    }

    #[test]
    fn only_the_last_removal_reports_empty() {
        let registry = InstanceRegistry::default();
        let a = InstanceKey::new("ns", "a");
        let b = InstanceKey::new("other", "b");
        registry.mark_seen(&a);
        registry.mark_seen(&b);

        assert!(!registry.mark_gone(&a));
        assert!(registry.mark_gone(&b));
    }

    #[test]
    fn removing_an_unknown_key_from_an_empty_registry_reports_empty() {
        let registry = InstanceRegistry::default();
        assert!(registry.mark_gone(&InstanceKey::new("ns", "ghost")));
    }
}
