use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::attributes::{assert_legal_key, Attributes};
use crate::counter::Counter;
use crate::gauge::Gauge;
use crate::metric::{Metric, MetricObserver, Observation};

#[derive(Default)]
pub struct Registry {
    counters: Arc<Mutex<BTreeMap<&'static str, Metric<Counter>>>>,
    gauges: Arc<Mutex<BTreeMap<&'static str, Metric<Gauge>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<Counter> {
        assert_legal_key(name);

        self.counters
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
            })
            .clone()
    }

    pub fn register_gauge(&self, name: &'static str, description: &'static str) -> Metric<Gauge> {
        assert_legal_key(name);

        self.gauges
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
            })
            .clone()
    }

    pub fn report(&self, reporter: &mut impl Reporter) {
        self.report_generic(reporter, "counter", &self.counters);
        self.report_generic(reporter, "gauge", &self.gauges);
    }

    fn report_generic<M: MetricObserver>(
        &self,
        reporter: &mut impl Reporter,
        kind: &'static str,
        metrics: &Arc<Mutex<BTreeMap<&'static str, Metric<M>>>>,
    ) {
        metrics.lock().iter().for_each(|(_, set)| {
            reporter.start_metric(set.name, set.description, kind);
            set.shard
                .lock()
                .iter()
                .for_each(|(attrs, metric)| reporter.report(attrs, metric.observe()));
            reporter.finish_metric()
        })
    }
}

pub trait Reporter {
    fn start_metric(&mut self, name: &'static str, description: &'static str, kind: &'static str);

    fn report(&mut self, attrs: &Attributes, observation: Observation);

    /// Finish recording a given metric.
    fn finish_metric(&mut self);
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

pub fn global_registry() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

pub fn register_counter(name: &'static str, description: &'static str) -> Metric<Counter> {
    global_registry().register_counter(name, description)
}

pub fn register_gauge(name: &'static str, description: &'static str) -> Metric<Gauge> {
    global_registry().register_gauge(name, description)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_counter() {
        let reg = Registry::new();

        let cs = reg.register_counter("name", "desc");
        let c1 = cs.recorder(&[("foo", "bar")]);
        assert_eq!(c1.fetch(), 0);
        c1.inc(1);
        assert_eq!(c1.fetch(), 1);

        // same attributes resolve to the same series
        let c2 = cs.recorder(&[("foo", "bar")]);
        c2.inc(1);
        assert_eq!(c1.fetch(), 2);
    }

    #[test]
    fn remove_series() {
        let reg = Registry::new();

        let cs = reg.register_counter("removed", "desc");
        cs.recorder(&[("target", "t1")]).inc(3);
        cs.remove(&[("target", "t1")]);
        assert_eq!(cs.recorder(&[("target", "t1")]).fetch(), 0);
    }
}
