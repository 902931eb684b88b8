use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use thiserror::Error;

use crate::error::FetchError;
use crate::route::{Route, EXTERNAL_EXPORTER_NODE, METRIC_PATH_TAG_KEY, SCHEME_TAG_KEY};
use crate::template::ValueTemplate;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExporterError {
    #[error("host must be provided on external exporter")]
    MissingHost,
}

/// A statically configured exporter, scraped once per discovered route.
///
/// Parameters are evaluated against each discovered route and sent as the query
/// string of the exporter's metrics path.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawExternalExporter")]
pub struct ExternalExporter {
    pub name: String,
    pub host: String,
    pub metrics_path: String,
    pub scheme: String,
    pub params: BTreeMap<String, Vec<ValueTemplate>>,
}

#[derive(Deserialize)]
struct RawExternalExporter {
    #[serde(default)]
    name: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    metrics_path: String,
    #[serde(default)]
    scheme: String,
    #[serde(default)]
    params: BTreeMap<String, Vec<ValueTemplate>>,
}

impl TryFrom<RawExternalExporter> for ExternalExporter {
    type Error = ExporterError;

    fn try_from(raw: RawExternalExporter) -> Result<Self, Self::Error> {
        ExternalExporter::new(raw.name, raw.host, raw.metrics_path, raw.scheme, raw.params)
    }
}

impl ExternalExporter {
    /// Validates an exporter and applies defaults for the fields left empty:
    /// `metrics_path` is `/metrics`, `name` is `host + metrics_path`, `scheme` is `http`.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        metrics_path: impl Into<String>,
        scheme: impl Into<String>,
        params: BTreeMap<String, Vec<ValueTemplate>>,
    ) -> Result<Self, ExporterError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ExporterError::MissingHost);
        }
        let mut metrics_path = metrics_path.into();
        if metrics_path.is_empty() {
            metrics_path = "/metrics".to_owned();
        }
        let mut name = name.into();
        if name.is_empty() {
            name = format!("{}{}", host, metrics_path);
        }
        let mut scheme = scheme.into();
        if scheme.is_empty() {
            scheme = "http".to_owned();
        }
        Ok(ExternalExporter {
            name,
            host,
            metrics_path,
            scheme,
            params,
        })
    }

    /// Synthesizes the route scraping this exporter on behalf of `origin`.
    pub fn to_route(&self, origin: &Route) -> Result<Route, FetchError> {
        let query = self
            .params_query(origin)
            .map_err(|reason| FetchError::TemplateResolution {
                exporter: self.name.clone(),
                reason,
            })?;
        Ok(self.synthesize(origin, &format!("{}?{}", self.metrics_path, query)))
    }

    /// The route this exporter would be scraped with, without its params.
    ///
    /// Identifies the exporter in error metrics when its params can't be resolved.
    pub fn route_identity(&self, origin: &Route) -> Route {
        self.synthesize(origin, &self.metrics_path)
    }

    /// Encodes the params resolved against `origin` as a form query, keys sorted.
    pub fn params_query(&self, origin: &Route) -> Result<String, String> {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.params {
            for value in values {
                let value = value.resolve(origin).map_err(|err| err.to_string())?;
                query.append_pair(key, &value);
            }
        }
        Ok(query.finish())
    }

    fn synthesize(&self, origin: &Route, metric_path: &str) -> Route {
        let (host, port) = match self.host.split_once(':') {
            // An unparsable port is 0, leaving the port out of the url
            Some((host, port)) => (host, port.parse().unwrap_or(0)),
            None => (self.host.as_str(), -1),
        };
        Route {
            id: self.name.clone(),
            node: EXTERNAL_EXPORTER_NODE.to_owned(),
            address: host.to_owned(),
            datacenter: origin.datacenter.clone(),
            tagged_addresses: HashMap::new(),
            node_meta: HashMap::new(),
            service_id: self.name.clone(),
            service_name: self.name.clone(),
            service_address: host.to_owned(),
            service_tags: vec![
                format!("{}={}", SCHEME_TAG_KEY, self.scheme),
                format!("{}={}", METRIC_PATH_TAG_KEY, metric_path),
            ]
            .into(),
            service_meta: HashMap::new(),
            service_port: port,
        }
    }
}
