pub mod backend;
pub mod counters;
pub mod error;
pub mod exporter;
pub mod fetch;
pub mod labels;
pub mod route;
pub mod scrape;
pub mod search;
pub mod source;
pub mod template;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{BackendConfig, BackendFactory};
pub use counters::{Counters, FetchMetrics, NoopMetrics};
pub use error::FetchError;
pub use exporter::ExternalExporter;
pub use fetch::MetricsFetcher;
pub use route::Route;
pub use scrape::Scraper;
pub use search::ServiceSearch;
pub use source::{ConsulConfig, ConsulRouteSource, InMemoryRouteSource, RouteSource};
pub use tls::{ConsulTls, TlsConfig};
