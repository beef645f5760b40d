//! Bridges external runtime event streams into metric instruments.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

/// Identifies an event source the adapter should listen to.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventSourceSpec {
    /// The event provider's name.
    pub provider: String,
}

impl EventSourceSpec {
    /// Creates a spec for `provider`.
    pub fn new(provider: impl Into<String>) -> Self {
        EventSourceSpec { provider: provider.into() }
    }
}

type Callback = Box<dyn Fn(f64) + Send + Sync>;

/// A push-style adapter that routes numeric runtime events into instruments.
///
/// Producers call [`DiagnosticsCollector::dispatch`] whenever an event
/// arrives; the adapter invokes every counter or gauge callback registered
/// for that (provider, name) pair. The callbacks typically capture an
/// instrument handle and record into it, so the values surface on the next
/// snapshot like any other metric. Registration is additive and safe from
/// any thread.
#[derive(Default)]
pub struct DiagnosticsCollector {
    sources: RwLock<Vec<EventSourceSpec>>,
    counter_callbacks: RwLock<HashMap<(String, String), Vec<Callback>>>,
    gauge_callbacks: RwLock<HashMap<(String, String), Vec<Callback>>>,
}

impl DiagnosticsCollector {
    /// Creates an adapter with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a named event source.
    pub fn add_source(&self, spec: EventSourceSpec) {
        let mut sources = self.sources.write();
        if !sources.contains(&spec) {
            debug!(provider = %spec.provider, "Listening to event source.");
            sources.push(spec);
        }
    }

    /// The event sources registered so far.
    pub fn sources(&self) -> Vec<EventSourceSpec> {
        self.sources.read().clone()
    }

    /// Registers a callback for counter-style events from
    /// (`provider`, `name`).
    pub fn add_counter_callback(
        &self,
        provider: impl Into<String>,
        name: impl Into<String>,
        callback: impl Fn(f64) + Send + Sync + 'static,
    ) {
        self.counter_callbacks
            .write()
            .entry((provider.into(), name.into()))
            .or_default()
            .push(Box::new(callback));
    }

    /// Registers a callback for gauge-style events from
    /// (`provider`, `name`).
    pub fn add_gauge_callback(
        &self,
        provider: impl Into<String>,
        name: impl Into<String>,
        callback: impl Fn(f64) + Send + Sync + 'static,
    ) {
        self.gauge_callbacks
            .write()
            .entry((provider.into(), name.into()))
            .or_default()
            .push(Box::new(callback));
    }

    /// Delivers one event, invoking every matching callback.
    ///
    /// Returns how many callbacks ran; zero means nothing was registered for
    /// this (provider, name) pair.
    pub fn dispatch(&self, provider: &str, name: &str, value: f64) -> usize {
        let key = (provider.to_string(), name.to_string());
        let mut invoked = 0;

        if let Some(callbacks) = self.counter_callbacks.read().get(&key) {
            for callback in callbacks {
                callback(value);
            }
            invoked += callbacks.len();
        }
        if let Some(callbacks) = self.gauge_callbacks.read().get(&key) {
            for callback in callbacks {
                callback(value);
            }
            invoked += callbacks.len();
        }

        invoked
    }

    /// Drops every registration; called on shutdown.
    pub fn shutdown(&self) {
        self.sources.write().clear();
        self.counter_callbacks.write().clear();
        self.gauge_callbacks.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    };

    use super::{DiagnosticsCollector, EventSourceSpec};

    #[test]
    fn dispatch_routes_to_matching_callbacks() {
        let diagnostics = DiagnosticsCollector::new();
        diagnostics.add_source(EventSourceSpec::new("runtime"));

        let allocations = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&allocations);
        diagnostics.add_counter_callback("runtime", "alloc-count", move |value| {
            sink.fetch_add(value as u64, Relaxed);
        });

        let heap = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&heap);
        diagnostics.add_gauge_callback("runtime", "heap-size", move |value| {
            sink.store(value as u64, Relaxed);
        });

        assert_eq!(diagnostics.dispatch("runtime", "alloc-count", 3.0), 1);
        assert_eq!(diagnostics.dispatch("runtime", "alloc-count", 4.0), 1);
        assert_eq!(diagnostics.dispatch("runtime", "heap-size", 1024.0), 1);
        assert_eq!(diagnostics.dispatch("runtime", "unknown", 1.0), 0);

        assert_eq!(allocations.load(Relaxed), 7);
        assert_eq!(heap.load(Relaxed), 1024);
    }

    #[test]
    fn multiple_callbacks_per_event_all_fire() {
        let diagnostics = DiagnosticsCollector::new();
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));

        let sink = Arc::clone(&first);
        diagnostics.add_counter_callback("rt", "ev", move |_| {
            sink.fetch_add(1, Relaxed);
        });
        let sink = Arc::clone(&second);
        diagnostics.add_counter_callback("rt", "ev", move |_| {
            sink.fetch_add(1, Relaxed);
        });

        assert_eq!(diagnostics.dispatch("rt", "ev", 1.0), 2);
        assert_eq!(first.load(Relaxed), 1);
        assert_eq!(second.load(Relaxed), 1);
    }

    #[test]
    fn duplicate_sources_collapse() {
        let diagnostics = DiagnosticsCollector::new();
        diagnostics.add_source(EventSourceSpec::new("runtime"));
        diagnostics.add_source(EventSourceSpec::new("runtime"));
        assert_eq!(diagnostics.sources().len(), 1);
    }

    #[test]
    fn shutdown_clears_registrations() {
        let diagnostics = DiagnosticsCollector::new();
        diagnostics.add_source(EventSourceSpec::new("runtime"));
        diagnostics.add_counter_callback("rt", "ev", |_| {});

        diagnostics.shutdown();
        assert!(diagnostics.sources().is_empty());
        assert_eq!(diagnostics.dispatch("rt", "ev", 1.0), 0);
    }
}
