use promfetch_prometheus::{MetricFamilies, MetricFamily, MetricSample, MetricType, SampleValue};

use crate::route::{Route, IDENTITY_LABELS};

/// Family reporting failed scrapes of discovered routes
pub const SCRAPE_ERROR_FAMILY: &str = "scrape_error";

/// Family reporting failures of routes synthesized for external exporters
pub const EXTERNAL_EXPORTER_ERROR_FAMILY: &str = "scrape_external_exporter_error";

/// Replaces the identity labels of every sample with the route's.
///
/// Labels the target itself emitted under an identity name are dropped first,
/// so enriching twice gives the same result as enriching once.
pub fn enrich(families: &mut MetricFamilies, route: &Route) {
    let identity = route.identity_labels();
    for family in families.values_mut() {
        for sample in &mut family.samples {
            sample
                .labels
                .retain(|(name, _)| !IDENTITY_LABELS.contains(&name.as_str()));
            sample.labels.extend(
                identity
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.clone())),
            );
        }
    }
}

/// Builds the one-sample family reporting why a route produced no metrics
pub fn error_family(route: &Route, error: &str) -> MetricFamilies {
    let (name, help) = if route.is_external_exporter() {
        (
            EXTERNAL_EXPORTER_ERROR_FAMILY,
            "Error occurred while scraping an external exporter",
        )
    } else {
        (SCRAPE_ERROR_FAMILY, "Error occurred while scraping a route")
    };
    let mut sample = MetricSample::new(name, SampleValue::I64(1));
    sample.labels.push(("error".to_owned(), error.to_owned()));
    let mut family = MetricFamily::new(name, MetricType::Counter).with_help(help);
    family.samples.push(sample);

    let mut families = MetricFamilies::new();
    families.insert(name.to_owned(), family);
    enrich(&mut families, route);
    families
}
