//! The metrics api.
//!
//! `GET /v1/services/:consul_query/metrics` scrapes every instance matching a
//! consul query and answers with their merged metrics in the text exposition
//! format. The query may also be given as the `consul_query` url parameter.

use promfetch_core::error::status_text;
use promfetch_core::{Counters, MetricsFetcher};
use promfetch_prometheus::encode;
use std::sync::Arc;
use tide::{Redirect, Request, Response, StatusCode};

pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct State {
    pub fetcher: MetricsFetcher,
    pub counters: Arc<Counters>,
    pub base_url: String,
}

pub fn server(state: State) -> tide::Server<State> {
    let mut app = tide::with_state(state);
    app.at("/v1/services/:consul_query/metrics")
        .get(|req: Request<State>| metrics(req, false));
    app.at("/v1/services/metrics")
        .get(|req: Request<State>| metrics(req, false));
    app.at("/v1/services/:consul_query/only-app-metrics")
        .get(|req: Request<State>| metrics(req, true));
    app.at("/v1/services/only-app-metrics")
        .get(|req: Request<State>| metrics(req, true));
    app.at("/metrics").get(own_metrics);
    app.at("/doc").get(doc);
    app.at("/").get(Redirect::permanent("/doc"));
    app
}

/// Parameters of a metrics request
#[derive(Debug, PartialEq)]
struct MetricsQuery {
    consul_query: String,
    metric_path: String,
    scheme: String,
    only_from_app: bool,
}

impl MetricsQuery {
    fn from_request(req: &Request<State>, force_only_app: bool) -> MetricsQuery {
        let param = |key: &str| {
            req.url()
                .query_pairs()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.into_owned())
        };

        let consul_query = match req.param("consul_query") {
            Ok(query) => query.to_owned(),
            Err(_) => param("consul_query").unwrap_or_default(),
        };
        let mut metric_path = param("metric_path").unwrap_or_default().trim().to_owned();
        if metric_path.is_empty() {
            metric_path = "/metrics".to_owned();
        }
        if !metric_path.starts_with('/') {
            metric_path.insert(0, '/');
        }
        let mut scheme = param("scheme").unwrap_or_default().trim().to_owned();
        if scheme.is_empty() {
            scheme = "http".to_owned();
        }
        let only_from_app =
            force_only_app || req.url().query_pairs().any(|(name, _)| name == "only_from_app");

        MetricsQuery {
            consul_query,
            metric_path,
            scheme,
            only_from_app,
        }
    }
}

async fn metrics(req: Request<State>, force_only_app: bool) -> tide::Result {
    let query = MetricsQuery::from_request(&req, force_only_app);
    if query.consul_query.is_empty() {
        return Ok(text(
            400,
            format!("400 {}: You must set consul query", status_text(400)),
        ));
    }

    let mut headers = Vec::new();
    if let Some(auth) = req.header("Authorization") {
        headers.push(("Authorization".to_owned(), auth.last().as_str().to_owned()));
    }

    let result = req
        .state()
        .fetcher
        .metrics(
            &query.consul_query,
            &query.metric_path,
            &query.scheme,
            query.only_from_app,
            headers,
        )
        .await;
    match result {
        Ok(families) => Ok(Response::builder(StatusCode::Ok)
            .header("Content-Type", EXPOSITION_CONTENT_TYPE)
            .body(encode(&families))
            .build()),
        Err(err) => {
            let status = err.status_code().unwrap_or(500);
            if status == 500 {
                log::error!("fetching {:?} failed: {}", query.consul_query, err);
            } else {
                log::debug!("fetching {:?} failed: {}", query.consul_query, err);
            }
            Ok(text(status, err.rendered()))
        }
    }
}

async fn own_metrics(req: Request<State>) -> tide::Result {
    let families = req.state().counters.families();
    Ok(Response::builder(StatusCode::Ok)
        .header("Content-Type", EXPOSITION_CONTENT_TYPE)
        .body(encode(&families))
        .build())
}

async fn doc(req: Request<State>) -> tide::Result {
    Ok(text(200, usage(&req.state().base_url)))
}

fn text(status: u16, body: String) -> Response {
    Response::builder(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(body)
        .build()
}

fn usage(base_url: &str) -> String {
    format!(
        r#"promfetch: merged prometheus metrics of every instance of a consul service

Consul queries have the form [tag.]service-name[@datacenter][~near].

  GET {base}/v1/services/<consul query>/metrics
  GET {base}/v1/services/metrics?consul_query=<consul query>
      Metrics of every instance, plus the external exporters configured for them.

  GET {base}/v1/services/<consul query>/only-app-metrics
  GET {base}/v1/services/only-app-metrics?consul_query=<consul query>
      Metrics of the instances only.

Parameters:
  metric_path     path of the metrics endpoint on each instance (default: /metrics)
  scheme          scheme used to scrape each instance (default: http)
  only_from_app   when present, skips external exporters

Instances may override these with the service tags
  promfetch.metric_path=<path>
  promfetch.scheme=<scheme>

An Authorization header is forwarded to instances, never to external exporters.
Every sample is labelled with node_name, node_id, node_address, datacenter,
service_name, service_id, service_address and service_port.

Example:
  curl {base}/v1/services/my-app/metrics?metric_path=/prometheus
"#,
        base = base_url
    )
}
