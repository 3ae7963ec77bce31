//! Process-wide metric counters. Construct once at start-up, pass nothing
//! around: stages record through the global registry and tests read a
//! snapshot.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex};

#[derive(Debug, Default, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub observations: BTreeMap<String, Observation>,
}

/// Running count/sum/max for a sampled value (e.g. batch sizes).
#[derive(Debug, Default, Clone, Copy)]
pub struct Observation {
    pub count: u64,
    pub sum: u64,
    pub max: u64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsRegistry {
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard.counters.entry(name.to_string()).or_default() += value;
        }
    }

    pub fn observe(&self, name: &str, value: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            let obs = guard.observations.entry(name.to_string()).or_default();
            obs.count += 1;
            obs.sum += value;
            obs.max = obs.max.max(value);
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .map(|guard| guard.counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// The process-wide registry.
pub fn registry() -> &'static MetricsRegistry {
    static REGISTRY: LazyLock<MetricsRegistry> = LazyLock::new(MetricsRegistry::default);
    &REGISTRY
}
