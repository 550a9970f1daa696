use std::{collections::BTreeMap, fmt};

use http::Extensions;
use opentelemetry::{Key, KeyValue};

/// The fixed set of dimensions every twirp measurement is keyed by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagKey {
    Package,
    Service,
    Method,
    Status,
}

impl TagKey {
    pub const ALL: [TagKey; 4] = [
        TagKey::Package,
        TagKey::Service,
        TagKey::Method,
        TagKey::Status,
    ];

    /// Name used both as metric attribute key and span attribute key.
    pub const fn name(self) -> &'static str {
        match self {
            TagKey::Package => "twirp.package",
            TagKey::Service => "twirp.service",
            TagKey::Method => "twirp.method",
            TagKey::Status => "twirp.status",
        }
    }

    pub fn key(self) -> Key {
        Key::from_static_str(self.name())
    }

    /// Builds a string attribute for this key.
    pub fn attribute(self, value: impl Into<String>) -> KeyValue {
        KeyValue::new(self.key(), value.into())
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tags collected for a single call, consumed when a measurement is recorded.
///
/// Inserting a key overwrites its previous value, except that an empty value
/// never replaces a non-empty one: enrichment adds information, it does not
/// blank what an earlier layer already knew.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagMap {
    tags: BTreeMap<TagKey, String>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: TagKey, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.tags.get(&key) {
            Some(existing) if value.is_empty() && !existing.is_empty() => {}
            _ => {
                self.tags.insert(key, value);
            }
        }
        self
    }

    pub fn with(mut self, key: TagKey, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds an empty value for every key in `keys` that has not been set.
    pub fn fill_missing(&mut self, keys: &[TagKey]) -> &mut Self {
        for key in keys {
            self.tags.entry(*key).or_default();
        }
        self
    }

    pub fn get(&self, key: TagKey) -> Option<&str> {
        self.tags.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TagKey, &str)> {
        self.tags.iter().map(|(key, value)| (*key, value.as_str()))
    }

    /// Metric attributes for the tags in `keys` that are set, in tag key
    /// order.
    pub fn select(&self, keys: &[TagKey]) -> Vec<KeyValue> {
        self.iter()
            .filter(|(key, _)| keys.contains(key))
            .map(|(key, value)| key.attribute(value))
            .collect()
    }

    /// Applies `update` to the tag map stored in `extensions`, creating an
    /// empty one first if none is present.
    pub fn update_in(extensions: &mut Extensions, update: impl FnOnce(&mut TagMap)) {
        let mut tags = extensions.remove::<TagMap>().unwrap_or_default();
        update(&mut tags);
        extensions.insert(tags);
    }
}
