use async_std::channel;
use async_std::task;
use promfetch_prometheus::{parser, MetricFamilies};
use std::collections::btree_map::Entry;
use std::sync::Arc;

use crate::counters::FetchMetrics;
use crate::error::FetchError;
use crate::exporter::ExternalExporter;
use crate::labels;
use crate::route::Route;
use crate::scrape::Scraper;
use crate::search::ServiceSearch;
use crate::source::RouteSource;

/// Number of routes scraped concurrently by one fetch
pub const WORKERS: usize = 5;

/// Resolves a consul query and merges the metrics of every instance it matches
#[derive(Clone)]
pub struct MetricsFetcher {
    scraper: Arc<Scraper>,
    routes: Arc<dyn RouteSource>,
    external_exporters: Arc<Vec<ExternalExporter>>,
    metrics: Arc<dyn FetchMetrics>,
}

enum Outcome {
    Families(MetricFamilies),
    Aborted(FetchError),
}

/// State shared by the workers of a single fetch
struct Job {
    scraper: Arc<Scraper>,
    metrics: Arc<dyn FetchMetrics>,
    metric_path_default: String,
    scheme_default: String,
    headers: Vec<(String, String)>,
    with_exporters: bool,
}

impl MetricsFetcher {
    pub fn new(
        scraper: Scraper,
        routes: Arc<dyn RouteSource>,
        external_exporters: Vec<ExternalExporter>,
        metrics: Arc<dyn FetchMetrics>,
    ) -> Self {
        MetricsFetcher {
            scraper: Arc::new(scraper),
            routes,
            external_exporters: Arc::new(external_exporters),
            metrics,
        }
    }

    pub fn external_exporters(&self) -> &[ExternalExporter] {
        &self.external_exporters
    }

    /// Scrapes every route matching `query` and merges the results.
    ///
    /// When no external exporter is configured, the first failing scrape of a
    /// target fails the whole fetch. Otherwise failures are reported in the
    /// result as `scrape_error` or `scrape_external_exporter_error` families.
    pub async fn metrics(
        &self,
        query: &str,
        metric_path_default: &str,
        scheme_default: &str,
        only_app_metrics: bool,
        headers: Vec<(String, String)>,
    ) -> Result<MetricFamilies, FetchError> {
        let search = ServiceSearch::parse(query)?;
        let mut routes = self.routes.routes(&search).await?;
        if routes.is_empty() {
            return Err(FetchError::NoAppFound(query.to_owned()));
        }

        let mut unmerged = Vec::new();
        if !only_app_metrics && !self.external_exporters.is_empty() {
            let synthesized = self.resolve_external_exporters(&routes, &mut unmerged);
            routes.extend(synthesized);
        }

        let job = Arc::new(Job {
            scraper: self.scraper.clone(),
            metrics: self.metrics.clone(),
            metric_path_default: metric_path_default.to_owned(),
            scheme_default: scheme_default.to_owned(),
            headers,
            with_exporters: !self.external_exporters.is_empty(),
        });

        let (jobs_tx, jobs_rx) = channel::bounded::<Route>(routes.len());
        let (results_tx, results_rx) = channel::unbounded::<Outcome>();
        let workers: Vec<_> = (0..WORKERS.min(routes.len()))
            .map(|_| {
                let job = job.clone();
                let jobs = jobs_rx.clone();
                let results = results_tx.clone();
                task::spawn(async move {
                    while let Ok(route) = jobs.recv().await {
                        let outcome = job.run(route).await;
                        if results.send(outcome).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(jobs_rx);
        drop(results_tx);

        for route in routes {
            if jobs_tx.send(route).await.is_err() {
                break;
            }
        }
        drop(jobs_tx);

        let mut failure = None;
        while let Ok(outcome) = results_rx.recv().await {
            match outcome {
                Outcome::Families(families) => unmerged.push(families),
                Outcome::Aborted(err) => failure = Some(err),
            }
        }
        for worker in workers {
            worker.await;
        }

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(merge(unmerged))
    }

    fn resolve_external_exporters(
        &self,
        routes: &[Route],
        unmerged: &mut Vec<MetricFamilies>,
    ) -> Vec<Route> {
        let mut synthesized = Vec::with_capacity(routes.len() * self.external_exporters.len());
        for route in routes {
            for exporter in self.external_exporters.iter() {
                match exporter.to_route(route) {
                    Ok(route) => synthesized.push(route),
                    Err(err) => {
                        let message = format!("error when setting external exporters routes: {}", err);
                        log::warn!(
                            "{} (service={} external_exporter={} action=route convert)",
                            message,
                            route.service_name,
                            exporter.name
                        );
                        let identity = exporter.route_identity(route);
                        unmerged.push(labels::error_family(&identity, &message));
                    }
                }
            }
        }
        synthesized
    }
}

impl Job {
    async fn run(&self, route: Route) -> Outcome {
        let headers = if route.is_external_exporter() {
            None
        } else {
            Some(self.headers.as_slice())
        };
        match self.scrape(&route, headers).await {
            Ok(families) => {
                self.metrics.fetch_succeeded(&route);
                Outcome::Families(families)
            }
            Err(err) if err.is_fetch_error() && !self.with_exporters => Outcome::Aborted(err),
            Err(err) => {
                log::warn!(
                    "cannot get metrics: {} (service={} service_id={} action=scrape)",
                    err,
                    route.service_name,
                    route.service_id
                );
                self.metrics.fetch_failed(&route);
                Outcome::Families(labels::error_family(&route, &err.to_string()))
            }
        }
    }

    async fn scrape(
        &self,
        route: &Route,
        headers: Option<&[(String, String)]>,
    ) -> Result<MetricFamilies, FetchError> {
        let body = self
            .scraper
            .scrape(route, &self.metric_path_default, &self.scheme_default, headers)
            .await?;
        let mut families = parser::parse_bytes(&body.into_bytes()?)?;
        labels::enrich(&mut families, route);
        Ok(families)
    }
}

/// Merges per-route results by family name, concatenating samples.
pub fn merge(results: impl IntoIterator<Item = MetricFamilies>) -> MetricFamilies {
    let mut merged = MetricFamilies::new();
    for families in results {
        for (name, family) in families {
            match merged.entry(name) {
                Entry::Vacant(entry) => {
                    entry.insert(family);
                }
                Entry::Occupied(mut entry) => entry.get_mut().samples.extend(family.samples),
            }
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::BackendFactory;
    use crate::counters::Counters;
    use crate::labels::{EXTERNAL_EXPORTER_ERROR_FAMILY, SCRAPE_ERROR_FAMILY};
    use crate::scrape::OutboundIp;
    use crate::source::InMemoryRouteSource;
    use crate::testing::StaticHttpClient;
    use promfetch_prometheus::{MetricSample, SampleValue};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static TEST_IP: once_cell::sync::Lazy<OutboundIp> =
        once_cell::sync::Lazy::new(|| OutboundIp::with_ip("192.168.1.10"));

    fn app_route(n: u8) -> Route {
        Route {
            id: format!("uuid-{}", n),
            node: format!("node-{}", n),
            address: format!("192.168.0.{}", n),
            datacenter: "dc1".into(),
            service_id: format!("my-app-{}", n),
            service_name: "my-app".into(),
            service_address: format!("10.0.0.{}", n),
            service_port: 8080,
            ..Route::default()
        }
    }

    fn blackbox() -> ExternalExporter {
        let mut params = BTreeMap::new();
        params.insert(
            "target".to_owned(),
            vec!["{{ .ServiceAddress }}".parse().unwrap()],
        );
        ExternalExporter::new("blackbox", "blackbox:9115", "/probe", "", params).unwrap()
    }

    struct Harness {
        client: StaticHttpClient,
        counters: Arc<Counters>,
        fetcher: MetricsFetcher,
    }

    fn harness(routes: Vec<Route>, exporters: Vec<ExternalExporter>) -> Harness {
        let client = StaticHttpClient::new();
        let counters = Arc::new(Counters::new());
        let scraper = Scraper::with_outbound_ip(
            BackendFactory::with_http_client(client.clone()),
            &TEST_IP,
        );
        let fetcher = MetricsFetcher::new(
            scraper,
            Arc::new(InMemoryRouteSource::new(routes)),
            exporters,
            counters.clone(),
        );
        Harness {
            client,
            counters,
            fetcher,
        }
    }

    async fn fetch(harness: &Harness, query: &str, only_app: bool) -> Result<MetricFamilies, FetchError> {
        harness
            .fetcher
            .metrics(query, "/metrics", "http", only_app, Vec::new())
            .await
    }

    #[async_std::test]
    async fn fetches_and_enriches_a_single_route() {
        let h = harness(vec![app_route(1)], Vec::new());
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families.len(), 1);
        let up = &families["up"];
        assert_eq!(up.samples.len(), 1);
        assert_eq!(up.samples[0].value, SampleValue::I64(1));
        assert_eq!(up.samples[0].label("service_name"), Some("my-app"));
        assert_eq!(up.samples[0].label("service_id"), Some("my-app-1"));
        assert_eq!(h.counters.success_count("dc1", "my-app"), 1);
    }

    #[async_std::test]
    async fn merges_routes_into_shared_families() {
        let routes: Vec<_> = (1..=7).map(app_route).collect();
        let h = harness(routes, Vec::new());
        for n in 1..=7 {
            h.client.respond(
                &format!("http://10.0.0.{}:8080/metrics", n),
                200,
                format!("# TYPE up gauge\nup 1\n# TYPE only_{} counter\nonly_{} {}\n", n, n, n),
            );
        }

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families["up"].samples.len(), 7);
        assert_eq!(families.len(), 8);
        assert_eq!(families["only_3"].samples.len(), 1);
        assert_eq!(families["only_3"].samples[0].label("service_id"), Some("my-app-3"));
        assert_eq!(h.counters.success_count("dc1", "my-app"), 7);
    }

    #[async_std::test]
    async fn rejects_invalid_queries() {
        let h = harness(vec![app_route(1)], Vec::new());
        let err = fetch(&h, "my app", false).await.unwrap_err();
        assert_eq!(err, FetchError::InvalidQuery("my app".into()));
        assert!(h.client.requests().is_empty());
    }

    #[async_std::test]
    async fn reports_queries_without_routes() {
        let h = harness(vec![app_route(1)], vec![blackbox()]);
        let err = fetch(&h, "other-app", false).await.unwrap_err();
        assert_eq!(err, FetchError::NoAppFound("other-app".into()));
        assert_eq!(err.status_code(), Some(404));
    }

    #[async_std::test]
    async fn one_missing_endpoint_fails_the_fetch_without_exporters() {
        let h = harness(vec![app_route(1), app_route(2)], Vec::new());
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        h.client.respond("http://10.0.0.2:8080/metrics", 404, "");

        let err = fetch(&h, "my-app", false).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::EndpointNotFound {
                service: "my-app/my-app-2 (status code 404)".into(),
                path: "/metrics".into(),
            }
        );
        assert_eq!(h.client.requests().len(), 2);
    }

    #[async_std::test]
    async fn transport_errors_fail_the_fetch_without_exporters() {
        let h = harness(vec![app_route(1), app_route(2)], Vec::new());
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");

        let err = fetch(&h, "my-app", false).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(err.status_code(), None);
    }

    #[async_std::test]
    async fn parse_errors_are_reported_as_metrics() {
        let h = harness(vec![app_route(1), app_route(2)], Vec::new());
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        h.client.respond("http://10.0.0.2:8080/metrics", 200, "up{ 1\n");

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families["up"].samples.len(), 1);
        let error = &families[SCRAPE_ERROR_FAMILY].samples[0];
        assert_eq!(error.label("service_id"), Some("my-app-2"));
        assert!(error.label("error").is_some());
        assert_eq!(h.counters.failed_count(&app_route(2)), 1);
    }

    #[async_std::test]
    async fn failures_are_downgraded_with_exporters() {
        let h = harness(vec![app_route(1), app_route(2)], vec![blackbox()]);
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        h.client.respond("http://10.0.0.2:8080/metrics", 404, "");
        h.client.respond("http://blackbox:9115/probe?target=10.0.0.1", 200, "probe_success 1\n");
        h.client.respond("http://blackbox:9115/probe?target=10.0.0.2", 200, "probe_success 0\n");

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families["up"].samples.len(), 1);
        assert_eq!(families["probe_success"].samples.len(), 2);
        assert!(families["probe_success"]
            .samples
            .iter()
            .all(|s| s.label("node_name") == Some("external_exporter")));

        let errors = &families[SCRAPE_ERROR_FAMILY].samples;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].label("service_id"), Some("my-app-2"));
        assert_eq!(
            errors[0].label("error"),
            Some("cannot find endpoint \"/metrics\" on my-app/my-app-2 (status code 404)")
        );
        assert_eq!(h.counters.failed_count(&app_route(2)), 1);
        assert_eq!(h.counters.success_count("dc1", "my-app"), 1);
        assert_eq!(h.counters.success_count("dc1", "blackbox"), 2);
    }

    #[async_std::test]
    async fn failing_exporters_are_named_by_origin() {
        let h = harness(vec![app_route(1)], vec![blackbox()]);
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families["up"].samples.len(), 1);
        let errors = &families[EXTERNAL_EXPORTER_ERROR_FAMILY].samples;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].label("service_name"), Some("blackbox"));
        assert!(!families.contains_key(SCRAPE_ERROR_FAMILY));
    }

    #[async_std::test]
    async fn template_failures_only_drop_their_pairing() {
        let mut params = BTreeMap::new();
        params.insert(
            "module".to_owned(),
            vec!["{{ .ServiceMeta.probe }}".parse().unwrap()],
        );
        let exporter = ExternalExporter::new("prober", "prober:9000", "", "", params).unwrap();

        let mut with_meta = app_route(1);
        with_meta.service_meta.insert("probe".into(), "http".into());
        let h = harness(vec![with_meta, app_route(2)], vec![exporter]);
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        h.client.respond("http://10.0.0.2:8080/metrics", 200, "up 1\n");
        h.client.respond("http://prober:9000/metrics?module=http", 200, "probe 1\n");

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families["up"].samples.len(), 2);
        assert_eq!(families["probe"].samples.len(), 1);

        let errors = &families[EXTERNAL_EXPORTER_ERROR_FAMILY].samples;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].label("service_name"), Some("prober"));
        let message = errors[0].label("error").unwrap();
        assert!(message.starts_with("error when setting external exporters routes: "));
        assert!(message.contains("probe"));
    }

    #[async_std::test]
    async fn only_app_metrics_skips_exporters() {
        let h = harness(vec![app_route(1)], vec![blackbox()]);
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");

        let families = fetch(&h, "my-app", true).await.unwrap();
        assert_eq!(families.len(), 1);
        assert!(families.contains_key("up"));
        assert_eq!(h.client.requests().len(), 1);
    }

    #[async_std::test]
    async fn forwards_headers_to_app_routes_only() {
        let h = harness(vec![app_route(1)], vec![blackbox()]);
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        h.client.respond("http://blackbox:9115/probe?target=10.0.0.1", 200, "probe_success 1\n");

        let headers = vec![("Authorization".to_owned(), "Basic dXNlcjpwYXNz".to_owned())];
        h.fetcher
            .metrics("my-app", "/metrics", "http", false, headers)
            .await
            .unwrap();

        let app = h.client.requests_to("http://10.0.0.1:8080/metrics");
        assert_eq!(app[0].header("Authorization"), Some("Basic dXNlcjpwYXNz"));
        let exporter = h.client.requests_to("http://blackbox:9115/probe?target=10.0.0.1");
        assert_eq!(exporter[0].header("Authorization"), None);
    }

    #[async_std::test]
    async fn invalid_header_values_fail_only_their_route() {
        let h = harness(vec![app_route(1)], Vec::new());
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        let err = h
            .fetcher
            .metrics("my-app", "/metrics", "http://x/\u{e9}", false, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));

        let mut tagged = app_route(2);
        tagged.service_tags = vec!["promfetch.scheme=http://x/\u{e9}".to_owned()].into();
        let h = harness(vec![app_route(1), tagged], vec![blackbox()]);
        h.client.respond("http://10.0.0.1:8080/metrics", 200, "up 1\n");
        h.client.respond("http://blackbox:9115/probe?target=10.0.0.1", 200, "target_up 1\n");
        h.client.respond("http://blackbox:9115/probe?target=10.0.0.2", 200, "target_up 1\n");

        let families = fetch(&h, "my-app", false).await.unwrap();
        assert_eq!(families["up"].samples.len(), 1);
        assert_eq!(families["target_up"].samples.len(), 2);
        let errors = &families[SCRAPE_ERROR_FAMILY].samples;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].label("service_id"), Some("my-app-2"));
    }

    /// Answers every request after a short delay, tracking concurrent requests
    #[derive(Clone, Debug, Default)]
    struct SlowHttpClient {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        served: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl http_client::HttpClient for SlowHttpClient {
        async fn send(
            &self,
            _req: http_client::Request,
        ) -> Result<http_client::Response, http_client::Error> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            task::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.served.fetch_add(1, Ordering::SeqCst);

            let mut res = http_client::Response::new(surf::StatusCode::Ok);
            res.set_body("up 1\n");
            Ok(res)
        }
    }

    #[async_std::test]
    async fn scrapes_with_at_most_five_workers() {
        let client = SlowHttpClient::default();
        let scraper = Scraper::with_outbound_ip(
            BackendFactory::with_http_client(client.clone()),
            &TEST_IP,
        );
        let routes: Vec<_> = (1..=12).map(app_route).collect();
        let fetcher = MetricsFetcher::new(
            scraper,
            Arc::new(InMemoryRouteSource::new(routes)),
            Vec::new(),
            Arc::new(crate::counters::NoopMetrics),
        );

        let families = fetcher
            .metrics("my-app", "/metrics", "http", false, Vec::new())
            .await
            .unwrap();
        assert_eq!(families["up"].samples.len(), 12);
        assert_eq!(client.served.load(Ordering::SeqCst), 12);
        let peak = client.peak.load(Ordering::SeqCst);
        assert!(peak <= WORKERS, "{} requests in flight", peak);
        assert!(peak > 1);
    }

    fn families(entries: &[(&str, f64)]) -> MetricFamilies {
        let mut out = MetricFamilies::new();
        for (name, value) in entries {
            let family = out.entry(name.to_string()).or_insert_with(|| {
                promfetch_prometheus::MetricFamily::new(*name, promfetch_prometheus::MetricType::Gauge)
            });
            family
                .samples
                .push(MetricSample::new(*name, SampleValue::F64(*value)));
        }
        out
    }

    fn sorted_values(families: &MetricFamilies, name: &str) -> Vec<f64> {
        let mut values: Vec<f64> = families[name]
            .samples
            .iter()
            .map(|s| s.value.to_f64())
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        values
    }

    #[test]
    fn merge_is_order_independent() {
        let a = families(&[("up", 1.0), ("cpu", 0.5)]);
        let b = families(&[("up", 0.0)]);
        let c = families(&[("mem", 3.0), ("cpu", 0.25)]);

        let forward = merge(vec![a.clone(), b.clone(), c.clone()]);
        let backward = merge(vec![c.clone(), b.clone(), a.clone()]);
        let nested = merge(vec![merge(vec![b.clone(), c.clone()]), a.clone()]);

        for merged in &[&backward, &nested] {
            assert_eq!(
                forward.keys().collect::<Vec<_>>(),
                merged.keys().collect::<Vec<_>>()
            );
            for name in forward.keys() {
                assert_eq!(sorted_values(&forward, name), sorted_values(merged, name));
            }
        }
        assert_eq!(sorted_values(&forward, "up"), vec![0.0, 1.0]);
    }

    #[test]
    fn merge_keeps_unique_families_unchanged() {
        let a = families(&[("up", 1.0)]);
        let b = families(&[("mem", 3.0), ("mem", 4.0)]);
        let merged = merge(vec![a, b.clone()]);
        assert_eq!(merged["mem"], b["mem"]);
        assert!(merge(Vec::new()).is_empty());
    }
}
