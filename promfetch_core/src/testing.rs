//! An in-memory transport for tests.

use async_trait::async_trait;
use http_client::{Error, HttpClient, Request, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use surf::StatusCode;

#[derive(Clone, Debug)]
struct Canned {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// A request seen by a [`StaticHttpClient`]
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Default)]
struct Inner {
    responses: HashMap<String, Canned>,
    requests: Vec<RecordedRequest>,
}

/// Answers requests with canned responses keyed by url.
///
/// Urls without a canned response fail as if the connection was refused.
#[derive(Clone, Debug, Default)]
pub struct StaticHttpClient {
    inner: Arc<Mutex<Inner>>,
}

impl StaticHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) -> &Self {
        self.respond_with_headers(url, status, &[], body)
    }

    pub fn respond_with_headers(
        &self,
        url: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<Vec<u8>>,
    ) -> &Self {
        let canned = Canned {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.into(),
        };
        self.inner.lock().responses.insert(normalize(url), canned);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<RecordedRequest> {
        let url = normalize(url);
        self.requests().into_iter().filter(|r| r.url == url).collect()
    }
}

fn normalize(url: &str) -> String {
    match surf::Url::parse(url) {
        Ok(url) => url.to_string(),
        Err(_) => url.to_owned(),
    }
}

#[async_trait]
impl HttpClient for StaticHttpClient {
    async fn send(&self, req: Request) -> Result<Response, Error> {
        let url = req.url().to_string();
        let headers = req
            .iter()
            .flat_map(|(name, values)| {
                values
                    .iter()
                    .map(move |value| (name.as_str().to_owned(), value.as_str().to_owned()))
            })
            .collect();
        let canned = {
            let mut inner = self.inner.lock();
            inner.requests.push(RecordedRequest {
                method: req.method().to_string(),
                url: url.clone(),
                headers,
            });
            inner.responses.get(&url).cloned()
        };
        let canned = canned.ok_or_else(|| {
            Error::from_str(StatusCode::BadGateway, format!("connection refused: {}", url))
        })?;

        let status = StatusCode::try_from(canned.status)
            .map_err(|_| Error::from_str(StatusCode::InternalServerError, "invalid status"))?;
        let mut res = Response::new(status);
        for (name, value) in &canned.headers {
            res.insert_header(name.as_str(), value.as_str());
        }
        res.set_body(canned.body);
        Ok(res)
    }
}
