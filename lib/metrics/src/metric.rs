use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::attributes::Attributes;

/// A `Metric` records an `Observation` for each unique set of `Attributes`.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Counter(u64),
    Gauge(u64),
}

/// Types that wish to be used with `Metric` must implement this trait
/// that exposes the necessary reporting API.
///
/// `Metric` maintains a distinct `MetricObserver` for each unique set of
/// `Attributes`.
pub trait MetricObserver: Default + std::fmt::Debug + Send + 'static {
    /// The type that is used to modify the value reported by this observer.
    type Recorder;

    /// Return a `Self::Recorder` that can be used to mutate the value
    /// reported by this `MetricObserver`.
    fn recorder(&self) -> Self::Recorder;

    /// Return the current value.
    fn observe(&self) -> Observation;
}

#[derive(Clone)]
pub struct Metric<T: MetricObserver> {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) shard: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Metric<T> {
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        self.observer(attributes).recorder()
    }

    pub fn observer(&self, attributes: impl Into<Attributes>) -> MappedMutexGuard<'_, T> {
        MutexGuard::map(self.shard.lock(), |values| {
            values.entry(attributes.into()).or_default()
        })
    }

    /// Drop the series recorded for the given attributes, e.g. when the
    /// target they describe is deleted.
    pub fn remove(&self, attributes: impl Into<Attributes>) {
        self.shard.lock().remove(&attributes.into());
    }
}
