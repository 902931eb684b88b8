use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use surf::Url;

use crate::backend::CLIENT_TIMEOUT;
use crate::error::FetchError;
use crate::route::Route;
use crate::search::ServiceSearch;
use crate::tls::ConsulTls;

/// Resolves a service search into the routes to scrape
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn routes(&self, search: &ServiceSearch) -> Result<Vec<Route>, FetchError>;
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HttpAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsulConfig {
    pub address: String,
    pub scheme: String,
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub http_auth: Option<HttpAuth>,
    pub tls: Option<ConsulTls>,

    /// Passed as the catalog's `wait` parameter; written like `10s` or `1m30s`
    #[serde(deserialize_with = "deserialize_wait_time")]
    pub endpoint_wait_time: Option<Duration>,
}

fn deserialize_wait_time<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(None),
    };
    humantime::parse_duration(raw.trim())
        .map(Some)
        .map_err(|err| D::Error::custom(format!("failed to parse {:?} to a duration: {}", raw, err)))
}

impl Default for ConsulConfig {
    fn default() -> Self {
        ConsulConfig {
            address: "127.0.0.1:8500".to_owned(),
            scheme: "http".to_owned(),
            datacenter: None,
            token: None,
            http_auth: None,
            tls: None,
            endpoint_wait_time: None,
        }
    }
}

/// One entry of `/v1/catalog/service/:name`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    node: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    datacenter: String,
    #[serde(default)]
    tagged_addresses: Option<HashMap<String, String>>,
    #[serde(default)]
    node_meta: Option<HashMap<String, String>>,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
    #[serde(default)]
    service_meta: Option<HashMap<String, String>>,
    #[serde(default)]
    service_port: i32,
}

impl From<CatalogService> for Route {
    fn from(entry: CatalogService) -> Self {
        Route {
            id: entry.id,
            node: entry.node,
            address: entry.address,
            datacenter: entry.datacenter,
            tagged_addresses: entry.tagged_addresses.unwrap_or_default(),
            node_meta: entry.node_meta.unwrap_or_default(),
            service_id: entry.service_id,
            service_name: entry.service_name,
            service_address: entry.service_address,
            service_tags: entry.service_tags.unwrap_or_default().into(),
            service_meta: entry.service_meta.unwrap_or_default(),
            service_port: entry.service_port,
        }
    }
}

/// Resolves searches against the Consul catalog HTTP API
pub struct ConsulRouteSource {
    config: ConsulConfig,
    client: surf::Client,
}

impl ConsulRouteSource {
    pub fn new(config: ConsulConfig) -> anyhow::Result<Self> {
        let tls = match &config.tls {
            Some(tls) => tls.load()?,
            None => Default::default(),
        };
        let client: surf::Client = surf::Config::new()
            .set_timeout(Some(CLIENT_TIMEOUT))
            .set_tls_config(Some(Arc::new(tls.client_config()?)))
            .try_into()
            .map_err(|err| anyhow::format_err!("failed to build consul client: {:?}", err))?;
        Ok(ConsulRouteSource { config, client })
    }

    pub fn with_http_client(config: ConsulConfig, http_client: impl http_client::HttpClient) -> Self {
        ConsulRouteSource {
            config,
            client: surf::Client::with_http_client(http_client),
        }
    }

    fn catalog_url(&self, search: &ServiceSearch) -> Result<Url, String> {
        let raw = format!(
            "{}://{}/v1/catalog/service/",
            self.config.scheme, self.config.address
        );
        let mut url = Url::parse(&raw).map_err(|err| format!("invalid consul address: {}", err))?;
        url.path_segments_mut()
            .map_err(|_| "invalid consul address".to_owned())?
            .pop_if_empty()
            .push(&search.name);
        {
            let mut query = url.query_pairs_mut();
            if let Some(tag) = &search.tag {
                query.append_pair("tag", tag);
            }
            if let Some(dc) = search.datacenter.as_ref().or(self.config.datacenter.as_ref()) {
                query.append_pair("dc", dc);
            }
            if let Some(near) = &search.near {
                query.append_pair("near", near);
            }
            if let Some(wait) = self.config.endpoint_wait_time {
                query.append_pair("wait", &format!("{}ms", wait.as_millis()));
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn fetch(&self, search: &ServiceSearch) -> Result<Vec<CatalogService>, String> {
        let url = self.catalog_url(search)?;
        let mut req = self.client.get(url);
        if let Some(token) = &self.config.token {
            req = req.header("X-Consul-Token", token.as_str());
        }
        if let Some(auth) = &self.config.http_auth {
            let credentials = base64::encode(format!("{}:{}", auth.username, auth.password));
            req = req.header("Authorization", format!("Basic {}", credentials));
        }

        let mut res = req.await.map_err(|err| err.to_string())?;
        if !res.status().is_success() {
            let body = res.body_string().await.unwrap_or_default();
            return Err(format!(
                "unexpected response code: {} ({})",
                res.status() as u16,
                body.trim()
            ));
        }
        res.body_json().await.map_err(|err| err.to_string())
    }
}

#[async_trait]
impl RouteSource for ConsulRouteSource {
    async fn routes(&self, search: &ServiceSearch) -> Result<Vec<Route>, FetchError> {
        let entries = self
            .fetch(search)
            .await
            .map_err(|reason| FetchError::RouteSource {
                search: search.to_string(),
                reason,
            })?;
        Ok(entries.into_iter().map(Route::from).collect())
    }
}

/// Serves a fixed set of routes, filtered like the catalog filters them
#[derive(Clone, Debug, Default)]
pub struct InMemoryRouteSource {
    routes: Vec<Route>,
}

impl InMemoryRouteSource {
    pub fn new(routes: Vec<Route>) -> Self {
        InMemoryRouteSource { routes }
    }
}

#[async_trait]
impl RouteSource for InMemoryRouteSource {
    async fn routes(&self, search: &ServiceSearch) -> Result<Vec<Route>, FetchError> {
        Ok(self
            .routes
            .iter()
            .filter(|route| route.service_name == search.name)
            .filter(|route| match &search.tag {
                Some(tag) => route.service_tags.contains(tag),
                None => true,
            })
            .filter(|route| match &search.datacenter {
                Some(dc) => &route.datacenter == dc,
                None => true,
            })
            .cloned()
            .collect())
    }
}
