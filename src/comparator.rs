//! User-supplied comparators for sorted collections
//!
//! A sorted collection records the name of its comparator in its durable
//! header; recovery refuses to rebuild a collection whose comparator is not
//! registered, since the element order would be undefined.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;

/// Comparison function over user keys
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Name of the pre-registered bytewise comparator
pub const DEFAULT_COMPARATOR_NAME: &str = "default";

fn bytewise_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Registry mapping comparator names to comparison functions
pub struct ComparatorRegistry {
    comparators: RwLock<HashMap<String, Comparator>>,
}

impl ComparatorRegistry {
    /// Create a registry with the default bytewise comparator registered
    pub fn new() -> Self {
        let mut comparators: HashMap<String, Comparator> = HashMap::new();
        comparators.insert(DEFAULT_COMPARATOR_NAME.to_string(), bytewise_compare);
        Self {
            comparators: RwLock::new(comparators),
        }
    }

    /// Register a comparator under `name`.
    ///
    /// Returns `false` if the name is already taken.
    pub fn register(&self, name: impl Into<String>, comparator: Comparator) -> bool {
        let mut comparators = self.comparators.write();
        match comparators.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(comparator);
                true
            }
        }
    }

    /// Look up a comparator by name
    pub fn get(&self, name: &str) -> Option<Comparator> {
        self.comparators.read().get(name).copied()
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reverse_compare(a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }

    #[test]
    fn test_default_comparator() {
        let registry = ComparatorRegistry::new();
        let cmp = registry.get(DEFAULT_COMPARATOR_NAME).unwrap();
        assert_eq!(cmp(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp(b"b", b"b"), Ordering::Equal);
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ComparatorRegistry::new();
        assert!(registry.register("reverse", reverse_compare));
        assert!(!registry.register("reverse", reverse_compare));

        let cmp = registry.get("reverse").unwrap();
        assert_eq!(cmp(b"a", b"b"), Ordering::Greater);
        assert!(registry.get("missing").is_none());
    }
}
