use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered string → string mapping describing an object.
///
/// Insertion order is kept so that serialized output is stable, but equality
/// ignores it: two bags are equal when they hold the same key/value pairs.
///
/// Bags handed to a registry global are shared read-only; to change one,
/// clone it, mutate the clone and swap it in.
///
/// ```
/// use conduit_types::PropertyBag;
///
/// let mut bag = PropertyBag::new();
/// bag.set("node.name", "alsa_output.pci");
/// assert_eq!(bag.get("node.name"), Some("alsa_output.pci"));
/// assert!(bag.get("media.class").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag {
    entries: IndexMap<String, String>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace `key`, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// Remove `key`, keeping the relative order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    /// Copy every entry of `other` into `self`, overwriting existing keys.
    pub fn update_from(&mut self, other: &PropertyBag) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = PropertyBag::new();
        for (k, v) in iter {
            bag.set(k, v);
        }
        bag
    }
}
