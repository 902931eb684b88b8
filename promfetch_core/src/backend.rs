use serde::Deserialize;
use std::convert::TryInto;
use std::sync::Arc;
use std::time::Duration;

use crate::route::Route;
use crate::tls::TlsConfig;

/// Overall timeout of a single outbound request
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub disable_keep_alives: bool,
    pub max_idle_conns_per_host: usize,
    pub tls: TlsConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            disable_keep_alives: true,
            max_idle_conns_per_host: 2,
            tls: TlsConfig::default(),
        }
    }
}

/// Produces the HTTP client used to scrape a route.
///
/// Clients share one connection pool; cloning a `surf::Client` is cheap.
#[derive(Clone, Debug)]
pub struct BackendFactory {
    client: surf::Client,
}

impl BackendFactory {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let tls = config.tls.client_config()?;
        let client: surf::Client = surf::Config::new()
            .set_timeout(Some(CLIENT_TIMEOUT))
            .set_http_keep_alive(!config.disable_keep_alives)
            .set_max_connections_per_host(config.max_idle_conns_per_host.max(1))
            .set_tls_config(Some(Arc::new(tls)))
            .try_into()
            .map_err(|err| anyhow::format_err!("failed to build http client: {:?}", err))?;
        Ok(BackendFactory { client })
    }

    /// Builds a factory on top of an existing transport
    pub fn with_http_client(http_client: impl http_client::HttpClient) -> Self {
        BackendFactory {
            client: surf::Client::with_http_client(http_client),
        }
    }

    pub fn new_client(&self, _route: &Route) -> surf::Client {
        self.client.clone()
    }
}
