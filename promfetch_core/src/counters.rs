use dashmap::DashMap;
use promfetch_prometheus::{MetricFamilies, MetricFamily, MetricSample, MetricType, SampleValue};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::route::Route;

pub const FETCH_FAILED_TOTAL: &str = "promfetch_metric_fetch_failed_total";
pub const FETCH_SUCCESS_TOTAL: &str = "promfetch_metric_fetch_success_total";

/// Receives the outcome of every scrape made during a fetch
pub trait FetchMetrics: Send + Sync {
    fn fetch_succeeded(&self, route: &Route);
    fn fetch_failed(&self, route: &Route);
}

type LabelSet = Vec<(&'static str, String)>;

/// Process-wide operational counters, exported on the service's own `/metrics`.
///
/// Failures are counted per route identity. Successes are counted per
/// datacenter and service only, to keep the series count bounded by services
/// rather than instances.
#[derive(Debug, Default)]
pub struct Counters {
    failed: DashMap<LabelSet, AtomicU64>,
    succeeded: DashMap<LabelSet, AtomicU64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed_count(&self, route: &Route) -> u64 {
        read(&self.failed, &failure_labels(route))
    }

    pub fn success_count(&self, datacenter: &str, service_name: &str) -> u64 {
        let labels = vec![
            ("datacenter", datacenter.to_owned()),
            ("service_name", service_name.to_owned()),
        ];
        read(&self.succeeded, &labels)
    }

    /// Renders the counters in exposition form, sorted by label values
    pub fn families(&self) -> MetricFamilies {
        let mut families = MetricFamilies::new();
        for (name, help, map) in [
            (
                FETCH_FAILED_TOTAL,
                "Number of scrapes which failed, by route",
                &self.failed,
            ),
            (
                FETCH_SUCCESS_TOTAL,
                "Number of successful scrapes, by service",
                &self.succeeded,
            ),
        ] {
            let mut samples: Vec<MetricSample> = map
                .iter()
                .map(|entry| {
                    let value = entry.value().load(Ordering::Relaxed);
                    let mut sample = MetricSample::new(name, SampleValue::I64(value as i64));
                    sample.labels = entry
                        .key()
                        .iter()
                        .map(|(label, value)| (label.to_string(), value.clone()))
                        .collect();
                    sample
                })
                .collect();
            samples.sort_by(|a, b| a.labels.cmp(&b.labels));

            let mut family = MetricFamily::new(name, MetricType::Counter).with_help(help);
            family.samples = samples;
            families.insert(name.to_owned(), family);
        }
        families
    }
}

impl FetchMetrics for Counters {
    fn fetch_succeeded(&self, route: &Route) {
        let labels = vec![
            ("datacenter", route.datacenter.clone()),
            ("service_name", route.service_name.clone()),
        ];
        increment(&self.succeeded, labels);
    }

    fn fetch_failed(&self, route: &Route) {
        increment(&self.failed, failure_labels(route));
    }
}

fn failure_labels(route: &Route) -> LabelSet {
    route.identity_labels().to_vec()
}

fn increment(map: &DashMap<LabelSet, AtomicU64>, labels: LabelSet) {
    if let Some(counter) = map.get(&labels) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.entry(labels)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn read(map: &DashMap<LabelSet, AtomicU64>, labels: &LabelSet) -> u64 {
    map.get(labels)
        .map(|counter| counter.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Discards every outcome
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopMetrics;

impl FetchMetrics for NoopMetrics {
    fn fetch_succeeded(&self, _route: &Route) {}
    fn fetch_failed(&self, _route: &Route) {}
}
