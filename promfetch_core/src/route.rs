use std::collections::HashMap;

/// Service tag overriding the scheme used to scrape an instance, e.g. `promfetch.scheme=https`
pub const SCHEME_TAG_KEY: &str = "promfetch.scheme";

/// Service tag overriding the metrics path of an instance, e.g. `promfetch.metric_path=/prom`
pub const METRIC_PATH_TAG_KEY: &str = "promfetch.metric_path";

/// Node name of routes synthesized from external exporters.
///
/// Forwarded authorization headers are never sent to these routes.
pub const EXTERNAL_EXPORTER_NODE: &str = "external_exporter";

/// Names of the labels identifying where a sample was scraped from
pub const IDENTITY_LABELS: [&str; 8] = [
    "node_name",
    "node_id",
    "node_address",
    "datacenter",
    "service_name",
    "service_id",
    "service_address",
    "service_port",
];

/// A service's tags, always sorted ascending.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceTags(Vec<String>);

impl ServiceTags {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Finds the value of the first `key=value` tag for the given key.
    ///
    /// When several tags carry the same key, the first in sorted order wins.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.0.iter().find_map(|tag| {
            tag.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }
}

impl From<Vec<String>> for ServiceTags {
    fn from(mut tags: Vec<String>) -> Self {
        tags.sort();
        ServiceTags(tags)
    }
}

/// A single scrapeable target: either a service instance from the catalog,
/// or a route synthesized for an external exporter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Route {
    pub id: String,
    pub node: String,
    pub address: String,
    pub datacenter: String,
    pub tagged_addresses: HashMap<String, String>,
    pub node_meta: HashMap<String, String>,
    pub service_id: String,
    pub service_name: String,
    pub service_address: String,
    pub service_tags: ServiceTags,
    pub service_meta: HashMap<String, String>,

    /// A value `<= 0` means "no explicit port"
    pub service_port: i32,
}

impl Route {
    pub fn find_scheme(&self) -> Option<&str> {
        self.service_tags.find(SCHEME_TAG_KEY)
    }

    pub fn find_metrics_path(&self) -> Option<&str> {
        self.service_tags.find(METRIC_PATH_TAG_KEY)
    }

    pub fn is_external_exporter(&self) -> bool {
        self.node == EXTERNAL_EXPORTER_NODE
    }

    /// The `host[:port]` part of the route's metrics url
    pub fn host(&self) -> String {
        if self.service_port > 0 {
            format!("{}:{}", self.service_address, self.service_port)
        } else {
            self.service_address.clone()
        }
    }

    /// Identity label values, in the order of `IDENTITY_LABELS`
    pub fn identity_labels(&self) -> [(&'static str, String); 8] {
        [
            ("node_name", self.node.clone()),
            ("node_id", self.id.clone()),
            ("node_address", self.address.clone()),
            ("datacenter", self.datacenter.clone()),
            ("service_name", self.service_name.clone()),
            ("service_id", self.service_id.clone()),
            ("service_address", self.service_address.clone()),
            ("service_port", self.service_port.to_string()),
        ]
    }
}
