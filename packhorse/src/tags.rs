//! Immutable tag sets attached to metrics.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use indexmap::IndexMap;

use crate::{
    error::CreateError,
    validation::{apply_transform, is_valid_tag_name, is_valid_tag_value, StringTransform},
};

/// An immutable, ordered mapping of tag names to tag values.
///
/// A tag set is frozen when the owning metric is constructed: the source's
/// default tags are merged with the metric-local tags (local wins on
/// collision), every name and value is validated, and the resulting pairs are
/// sorted by name so that iteration order is deterministic for serialization
/// and so that two sets holding the same pairs compare equal.
///
/// Cloning is cheap; the underlying map is shared.
#[derive(Clone)]
pub struct TagSet {
    inner: Arc<IndexMap<String, String>>,
}

impl TagSet {
    /// Merges default tags with metric-local tags, validating every pair.
    ///
    /// Local tags win on name collision. Local names and values pass through
    /// the configured transforms before validation; default tags are expected
    /// to have been canonicalized once by the owning source and are only
    /// re-validated. An empty merged set is rejected: every metric must carry
    /// at least one tag.
    pub fn merge(
        metric_name: &str,
        default_tags: &[(String, String)],
        local_tags: &[(String, String)],
        name_transform: Option<&StringTransform>,
        value_transform: Option<&StringTransform>,
    ) -> Result<TagSet, CreateError> {
        let mut merged = IndexMap::with_capacity(default_tags.len() + local_tags.len());
        for (name, value) in default_tags {
            if !is_valid_tag_name(name) {
                return Err(CreateError::InvalidTagName { name: name.clone() });
            }
            if !is_valid_tag_value(value) {
                return Err(CreateError::InvalidTagValue {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            merged.insert(name.clone(), value.clone());
        }
        for (name, value) in local_tags {
            let name = apply_transform(name, name_transform);
            if !is_valid_tag_name(&name) {
                return Err(CreateError::InvalidTagName { name });
            }

            let value = apply_transform(value, value_transform);
            if !is_valid_tag_value(&value) {
                return Err(CreateError::InvalidTagValue { name, value });
            }

            merged.insert(name, value);
        }

        if merged.is_empty() {
            return Err(CreateError::EmptyTagSet { name: metric_name.to_string() });
        }

        merged.sort_unstable_keys();
        Ok(TagSet { inner: Arc::new(merged) })
    }

    /// Number of tags in the set.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the set is empty.
    ///
    /// Sets produced by [`TagSet::merge`] are never empty; this only returns
    /// true for sets that dropped their last tag via [`TagSet::without`].
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Looks up the value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    /// Iterates over (name, value) pairs in sorted-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a copy of this set with `name` removed.
    ///
    /// Used by handlers that strip tags the remote relay re-adds (e.g. the
    /// `host` tag on cumulative counter readings). Returns a clone sharing
    /// the original map when `name` is not present.
    pub fn without(&self, name: &str) -> TagSet {
        if !self.inner.contains_key(name) {
            return self.clone();
        }

        let mut pruned = IndexMap::clone(&self.inner);
        pruned.shift_remove(name);
        TagSet { inner: Arc::new(pruned) }
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.inner.len() == other.inner.len()
            && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl Eq for TagSet {}

impl Hash for TagSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (name, value) in self.iter() {
            name.hash(state);
            value.hash(state);
        }
    }
}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
pub(crate) fn tag_set(tags: &[(&str, &str)]) -> TagSet {
    let local: Vec<_> =
        tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    TagSet::merge("test", &[], &local, None, None).unwrap()
}
