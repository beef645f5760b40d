use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{Instrument, ReadingWriter};
use crate::{
    batch::ReadingBatch,
    error::{CreateError, QueueFullError},
    metadata::Metadata,
    source::CanonicalOptions,
    tags::TagSet,
    validation::{apply_transform, is_valid_tag_value},
};

/// Constructs a kernel for a concrete tag-value tuple.
pub(crate) type KernelConstructor<K> =
    Box<dyn Fn(Arc<str>, TagSet) -> Result<K, CreateError> + Send + Sync>;

/// A family of kernels sharing one metric name, differentiated by the values
/// of a fixed set of tag keys.
///
/// The factory lazily creates one kernel per distinct tag-value tuple; tuples
/// are validated on first use and the resulting kernel is shared on every
/// subsequent lookup. Snapshots and metadata cover whichever kernels exist at
/// the time of the call.
pub struct TaggedMetrics<K> {
    name: Arc<str>,
    tag_keys: Vec<String>,
    options: Arc<CanonicalOptions>,
    registered: Arc<Mutex<HashSet<(String, TagSet)>>>,
    epoch: Arc<AtomicU64>,
    make: KernelConstructor<K>,
    kernels: RwLock<HashMap<Vec<String>, Arc<K>>>,
}

impl<K: Instrument> TaggedMetrics<K> {
    pub(crate) fn new(
        name: Arc<str>,
        tag_keys: Vec<String>,
        options: Arc<CanonicalOptions>,
        registered: Arc<Mutex<HashSet<(String, TagSet)>>>,
        epoch: Arc<AtomicU64>,
        make: KernelConstructor<K>,
    ) -> Self {
        TaggedMetrics {
            name,
            tag_keys,
            options,
            registered,
            epoch,
            make,
            kernels: RwLock::new(HashMap::new()),
        }
    }

    /// The factory's metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tag keys every kernel of this family carries.
    pub fn tag_keys(&self) -> &[String] {
        &self.tag_keys
    }

    /// Returns the kernel for the given tag values, creating it on first use.
    ///
    /// `values` must supply one value per declared tag key, in declaration
    /// order. Values pass through the source's tag-value transform and are
    /// validated before a kernel is constructed.
    pub fn get_or_add(&self, values: &[&str]) -> Result<Arc<K>, CreateError> {
        if values.len() != self.tag_keys.len() {
            return Err(CreateError::TagValueCount {
                name: self.name.to_string(),
                expected: self.tag_keys.len(),
                actual: values.len(),
            });
        }

        let mut canonical = Vec::with_capacity(values.len());
        for value in values {
            let value = apply_transform(value, self.options.tag_value_transform.as_ref());
            if !is_valid_tag_value(&value) {
                return Err(CreateError::InvalidTagValue {
                    name: self.name.to_string(),
                    value,
                });
            }
            canonical.push(value);
        }

        if let Some(existing) = self.kernels.read().get(&canonical) {
            return Ok(Arc::clone(existing));
        }

        let mut kernels = self.kernels.write();
        if let Some(existing) = kernels.get(&canonical) {
            return Ok(Arc::clone(existing));
        }

        let locals: Vec<(String, String)> = self
            .tag_keys
            .iter()
            .zip(canonical.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let tags = TagSet::merge(&self.name, &self.options.default_tags, &locals, None, None)?;

        if !self.registered.lock().insert((self.name.to_string(), tags.clone())) {
            return Err(CreateError::DuplicateMetric { name: self.name.to_string() });
        }

        let kernel = Arc::new((self.make)(Arc::clone(&self.name), tags)?);
        kernels.insert(canonical, Arc::clone(&kernel));
        self.epoch.fetch_add(1, Relaxed);

        Ok(kernel)
    }

    fn current_kernels(&self) -> Vec<Arc<K>> {
        self.kernels.read().values().map(Arc::clone).collect()
    }
}

impl<K: Instrument> ReadingWriter for TaggedMetrics<K> {
    fn write_readings(
        &self,
        batch: &mut dyn ReadingBatch,
        timestamp: DateTime<Utc>,
    ) -> Result<(), QueueFullError> {
        for kernel in self.current_kernels() {
            Instrument::write_readings(kernel.as_ref(), batch, timestamp)?;
        }
        Ok(())
    }

    fn metadata(&self) -> Vec<Metadata> {
        self.current_kernels().iter().flat_map(|k| k.info().metadata()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use crate::{
        batch::CollectingBatch,
        error::CreateError,
        instrument::ReadingWriter,
        source::{MetricSource, SourceOptions},
    };

    fn source() -> MetricSource {
        MetricSource::new(
            SourceOptions::default().with_default_tag("host", "web01"),
        )
        .unwrap()
    }

    #[test]
    fn one_kernel_per_tuple() {
        let source = source();
        let requests = source
            .tagged_counter("http_requests", "req", "requests by route", &["route", "status"])
            .unwrap();

        let a = requests.get_or_add(&["users", "200"]).unwrap();
        let b = requests.get_or_add(&["users", "200"]).unwrap();
        let c = requests.get_or_add(&["users", "500"]).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same tuple must return the same kernel");
        assert!(!Arc::ptr_eq(&a, &c));

        a.increment_by(3);
        c.increment();

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut batch = CollectingBatch::new();
        requests.write_readings(&mut batch, ts).unwrap();

        let mut seen: Vec<_> = batch
            .readings()
            .iter()
            .map(|r| (r.tags().get("status").unwrap().to_string(), r.value()))
            .collect();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, vec![("200".to_string(), 3.0), ("500".to_string(), 1.0)]);
    }

    #[test]
    fn tuple_arity_is_checked() {
        let source = source();
        let requests = source
            .tagged_counter("http_requests", "req", "requests by route", &["route", "status"])
            .unwrap();

        let err = requests.get_or_add(&["users"]).unwrap_err();
        assert_eq!(
            err,
            CreateError::TagValueCount {
                name: "http_requests".to_string(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn tag_values_are_validated() {
        let source = source();
        let requests = source
            .tagged_counter("http_requests", "req", "requests by route", &["route"])
            .unwrap();

        let err = requests.get_or_add(&["bad route"]).unwrap_err();
        assert!(matches!(err, CreateError::InvalidTagValue { .. }));
    }

    #[test]
    fn kernels_inherit_default_tags() {
        let source = source();
        let requests = source
            .tagged_counter("http_requests", "req", "requests by route", &["route"])
            .unwrap();

        let kernel = requests.get_or_add(&["users"]).unwrap();
        kernel.increment();

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut batch = CollectingBatch::new();
        requests.write_readings(&mut batch, ts).unwrap();

        let tags = batch.readings()[0].tags();
        assert_eq!(tags.get("host"), Some("web01"));
        assert_eq!(tags.get("route"), Some("users"));
    }

    #[test]
    fn metadata_covers_existing_kernels() {
        let source = source();
        let requests = source
            .tagged_counter("http_requests", "req", "requests by route", &["route"])
            .unwrap();

        assert!(requests.metadata().is_empty(), "no kernels yet, no metadata");

        requests.get_or_add(&["users"]).unwrap();
        requests.get_or_add(&["orders"]).unwrap();

        let metadata = requests.metadata();
        // rate + desc + unit per kernel.
        assert_eq!(metadata.len(), 6);
        assert!(metadata.iter().all(|m| m.name == "http_requests"));
    }
}
