use flate2::read::GzDecoder;
use once_cell::sync::OnceCell;
use std::io::{Cursor, Read};
use std::net::UdpSocket;
use std::str::FromStr;
use std::time::Duration;
use surf::http::headers::{HeaderName, HeaderValue};
use surf::http::Method;
use surf::{Request, RequestBuilder, Url};

use crate::backend::BackendFactory;
use crate::error::FetchError;
use crate::route::Route;

/// Exposition formats accepted from targets, best first
pub const ACCEPT_HEADER: &str =
    "application/openmetrics-text; version=0.0.1,text/plain;version=0.0.4;q=0.5,*/*;q=0.1";

pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies requests issued by this scraper
pub const SCRAPING_HEADER: &str = "X-Promfetch-Scraping";

/// The local address used to reach the network, sent as `X-Forwarded-For`.
///
/// Looked up once per process; an empty string when there is no route out.
#[derive(Debug, Default)]
pub struct OutboundIp(OnceCell<String>);

impl OutboundIp {
    pub const fn new() -> Self {
        OutboundIp(OnceCell::new())
    }

    /// Presets the address, skipping the lookup
    pub fn with_ip(ip: impl Into<String>) -> Self {
        OutboundIp(OnceCell::with_value(ip.into()))
    }

    pub fn get(&self) -> &str {
        self.0.get_or_init(|| lookup_outbound_ip().unwrap_or_default())
    }
}

// Connecting a UDP socket sends no packet but picks the outbound interface.
fn lookup_outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.0.0.1:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

static OUTBOUND_IP: OutboundIp = OutboundIp::new();

/// A scraped payload, decompressed on read when the target gzipped it
pub struct ScrapeBody {
    reader: Box<dyn Read + Send>,
}

impl ScrapeBody {
    pub fn plain(bytes: Vec<u8>) -> Self {
        ScrapeBody {
            reader: Box::new(Cursor::new(bytes)),
        }
    }

    pub fn gzip(bytes: Vec<u8>) -> Self {
        ScrapeBody {
            reader: Box::new(GzDecoder::new(Cursor::new(bytes))),
        }
    }

    pub fn into_bytes(mut self) -> Result<Vec<u8>, FetchError> {
        let mut out = Vec::new();
        self.reader
            .read_to_end(&mut out)
            .map_err(|err| FetchError::Transport(format!("failed to read body: {}", err)))?;
        Ok(out)
    }
}

// Header values are checked here since `Headers::insert` panics on non-ascii input.
fn set_header(req: &mut Request, name: &str, value: &str, append: bool) -> Result<(), FetchError> {
    let invalid = |err: surf::Error| {
        FetchError::Transport(format!("invalid header {:?}: {}", name, err))
    };
    let header_name = HeaderName::from_str(name).map_err(invalid)?;
    let header_value = HeaderValue::from_str(value).map_err(invalid)?;
    if append {
        req.append_header(header_name, header_value);
    } else {
        req.insert_header(header_name, header_value);
    }
    Ok(())
}

pub struct Scraper {
    backends: BackendFactory,
    outbound_ip: &'static OutboundIp,
}

impl Scraper {
    pub fn new(backends: BackendFactory) -> Self {
        Scraper {
            backends,
            outbound_ip: &OUTBOUND_IP,
        }
    }

    pub fn with_outbound_ip(backends: BackendFactory, outbound_ip: &'static OutboundIp) -> Self {
        Scraper {
            backends,
            outbound_ip,
        }
    }

    /// Fetches the metrics endpoint of a route.
    ///
    /// Tag overrides on the route win over the given defaults. `headers` are
    /// forwarded as-is, before the scraper's own headers are set.
    pub async fn scrape(
        &self,
        route: &Route,
        metric_path_default: &str,
        scheme_default: &str,
        headers: Option<&[(String, String)]>,
    ) -> Result<ScrapeBody, FetchError> {
        let scheme = route.find_scheme().unwrap_or(scheme_default);
        let path = route.find_metrics_path().unwrap_or(metric_path_default);
        let raw_url = format!("{}://{}{}", scheme, route.host(), path);
        let url = Url::parse(&raw_url)
            .map_err(|err| FetchError::Transport(format!("invalid url {:?}: {}", raw_url, err)))?;

        let mut req = RequestBuilder::new(Method::Get, url).build();
        for (name, value) in headers.unwrap_or_default() {
            set_header(&mut req, name, value, true)?;
        }
        set_header(&mut req, "Accept", ACCEPT_HEADER, true)?;
        set_header(&mut req, "Accept-Encoding", "gzip", true)?;
        let timeout = format!("{:.6}", SCRAPE_TIMEOUT.as_secs_f64());
        set_header(&mut req, "X-Prometheus-Scrape-Timeout-Seconds", &timeout, false)?;
        set_header(&mut req, "X-Forwarded-Proto", scheme, false)?;
        set_header(&mut req, SCRAPING_HEADER, "true", false)?;
        set_header(&mut req, "X-Forwarded-For", self.outbound_ip.get(), false)?;

        let client = self.backends.new_client(route);
        let mut res = async_std::future::timeout(SCRAPE_TIMEOUT, client.send(req))
            .await
            .map_err(|_| FetchError::Transport(format!("get {:?}: scrape timed out", raw_url)))?
            .map_err(|err| FetchError::Transport(format!("get {:?}: {}", raw_url, err)))?;

        let status = res.status();
        if status != surf::StatusCode::Ok {
            let code = status as u16;
            if (400..=499).contains(&code) {
                return Err(FetchError::EndpointNotFound {
                    service: format!(
                        "{}/{} (status code {})",
                        route.service_name, route.service_id, code
                    ),
                    path: path.to_owned(),
                });
            }
            return Err(FetchError::Transport(format!(
                "server returned HTTP status {} {}",
                code,
                status.canonical_reason()
            )));
        }

        let gzipped = res
            .header("Content-Encoding")
            .map(|values| values.last().as_str().eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        let bytes = res
            .body_bytes()
            .await
            .map_err(|err| FetchError::Transport(format!("get {:?}: {}", raw_url, err)))?;
        if gzipped {
            Ok(ScrapeBody::gzip(bytes))
        } else {
            Ok(ScrapeBody::plain(bytes))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::StaticHttpClient;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    static TEST_IP: once_cell::sync::Lazy<OutboundIp> =
        once_cell::sync::Lazy::new(|| OutboundIp::with_ip("192.168.1.10"));

    fn scraper(client: &StaticHttpClient) -> Scraper {
        Scraper::with_outbound_ip(BackendFactory::with_http_client(client.clone()), &TEST_IP)
    }

    fn route() -> Route {
        Route {
            service_name: "my-app".into(),
            service_id: "my-app-1".into(),
            service_address: "10.0.0.2".into(),
            service_port: 8080,
            ..Route::default()
        }
    }

    #[async_std::test]
    async fn scrapes_with_defaults_and_headers() {
        let client = StaticHttpClient::new();
        client.respond("http://10.0.0.2:8080/metrics", 200, "up 1\n");

        let auth = vec![("Authorization".to_owned(), "Bearer abc".to_owned())];
        let body = scraper(&client)
            .scrape(&route(), "/metrics", "http", Some(&auth))
            .await
            .unwrap();
        assert_eq!(body.into_bytes().unwrap(), b"up 1\n");

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.method, "GET");
        assert_eq!(req.header("Authorization"), Some("Bearer abc"));
        assert_eq!(req.header("Accept"), Some(ACCEPT_HEADER));
        assert_eq!(req.header("Accept-Encoding"), Some("gzip"));
        assert_eq!(req.header("X-Prometheus-Scrape-Timeout-Seconds"), Some("30.000000"));
        assert_eq!(req.header("X-Forwarded-Proto"), Some("http"));
        assert_eq!(req.header(SCRAPING_HEADER), Some("true"));
        assert_eq!(req.header("X-Forwarded-For"), Some("192.168.1.10"));
    }

    #[async_std::test]
    async fn tag_overrides_win() {
        let client = StaticHttpClient::new();
        client.respond("https://10.0.0.2:8080/prom", 200, "up 1\n");

        let mut route = route();
        route.service_tags = vec![
            "promfetch.metric_path=/prom".to_owned(),
            "promfetch.scheme=https".to_owned(),
        ]
        .into();
        let body = scraper(&client)
            .scrape(&route, "/metrics", "http", None)
            .await
            .unwrap();
        assert_eq!(body.into_bytes().unwrap(), b"up 1\n");
        assert_eq!(client.requests()[0].header("X-Forwarded-Proto"), Some("https"));
        assert_eq!(client.requests()[0].header("Authorization"), None);
    }

    #[async_std::test]
    async fn omits_missing_port() {
        let client = StaticHttpClient::new();
        client.respond("http://exporter.local/metrics", 200, "");

        let route = Route {
            service_address: "exporter.local".into(),
            service_port: -1,
            ..Route::default()
        };
        let body = scraper(&client).scrape(&route, "/metrics", "http", None).await;
        assert!(body.is_ok());
    }

    #[async_std::test]
    async fn decodes_gzip_transparently() {
        let payload = "# TYPE up gauge\nup 1\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let client = StaticHttpClient::new();
        client.respond_with_headers(
            "http://10.0.0.2:8080/metrics",
            200,
            &[("Content-Encoding", "gzip")],
            compressed,
        );
        client.respond("http://10.0.0.2:8080/plain", 200, payload);

        let scraper = scraper(&client);
        let gzipped = scraper
            .scrape(&route(), "/metrics", "http", None)
            .await
            .unwrap()
            .into_bytes()
            .unwrap();
        let plain = scraper
            .scrape(&route(), "/plain", "http", None)
            .await
            .unwrap()
            .into_bytes()
            .unwrap();
        assert_eq!(gzipped, plain);
    }

    #[async_std::test]
    async fn classifies_statuses() {
        let client = StaticHttpClient::new();
        client.respond("http://10.0.0.2:8080/missing", 404, "not found");
        client.respond("http://10.0.0.2:8080/broken", 503, "unavailable");

        let scraper = scraper(&client);
        let err = scraper
            .scrape(&route(), "/missing", "http", None)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            FetchError::EndpointNotFound {
                service: "my-app/my-app-1 (status code 404)".into(),
                path: "/missing".into(),
            }
        );
        assert_eq!(err.status_code(), Some(404));

        let err = scraper
            .scrape(&route(), "/broken", "http", None)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            FetchError::Transport("server returned HTTP status 503 Service Unavailable".into())
        );

        let err = scraper
            .scrape(&route(), "/refused", "http", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[async_std::test]
    async fn rejects_non_ascii_header_values() {
        let client = StaticHttpClient::new();
        let scraper = scraper(&client);

        let err = scraper
            .scrape(&route(), "/metrics", "http://x/\u{e9}", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::Transport(ref msg) if msg.contains("X-Forwarded-Proto")));

        let auth = vec![("Authorization".to_owned(), "Bearer \u{e9}t\u{e9}".to_owned())];
        let err = scraper
            .scrape(&route(), "/metrics", "http", Some(&auth))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::Transport(ref msg) if msg.contains("Authorization")));
        assert!(client.requests().is_empty());
    }

    #[async_std::test]
    async fn sends_an_empty_forwarded_for_without_outbound_ip() {
        static NO_IP: once_cell::sync::Lazy<OutboundIp> =
            once_cell::sync::Lazy::new(|| OutboundIp::with_ip(""));
        let client = StaticHttpClient::new();
        client.respond("http://10.0.0.2:8080/metrics", 200, "up 1\n");

        let scraper =
            Scraper::with_outbound_ip(BackendFactory::with_http_client(client.clone()), &NO_IP);
        assert!(scraper.scrape(&route(), "/metrics", "http", None).await.is_ok());
        assert_eq!(client.requests()[0].header("X-Forwarded-For"), Some(""));
    }
}
