use promfetch_prometheus::ParseError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The consul query does not match `[tag.]name[@datacenter][~near]`
    #[error("catalog.service: invalid format: {0:?}")]
    InvalidQuery(String),

    /// The query resolved to zero instances
    #[error("no app found with consul query {0:?}")]
    NoAppFound(String),

    /// A scraped target answered with a 4xx status
    #[error("cannot find endpoint {path:?} on {service}")]
    EndpointNotFound { service: String, path: String },

    /// An external exporter's param template could not be evaluated for a route
    #[error("error on external exporter `{exporter}`: {reason}")]
    TemplateResolution { exporter: String, reason: String },

    /// The service catalog could not be queried
    #[error("{search}: {reason}")]
    RouteSource { search: String, reason: String },

    /// A scrape failed on the network, or with a non 4xx status
    #[error("{0}")]
    Transport(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl FetchError {
    /// The HTTP status a caller should answer with, if this error maps to one.
    ///
    /// `None` is reported as an internal server error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::InvalidQuery(_) => Some(400),
            FetchError::NoAppFound(_) | FetchError::EndpointNotFound { .. } => Some(404),
            _ => None,
        }
    }

    /// Renders the error as `"<code> <reason>: <message>"`.
    pub fn rendered(&self) -> String {
        let code = self.status_code().unwrap_or(500);
        format!("{} {}: {}", code, status_text(code), self)
    }

    /// Whether this error comes from fetching a target (as opposed to reading its payload).
    ///
    /// Only these errors abort a whole fetch when no external exporter is configured.
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            FetchError::EndpointNotFound { .. } | FetchError::Transport(_)
        )
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Logs an error and its chain of causes.
pub fn log_error(err: &anyhow::Error) {
    log::warn!("{}", err);
    for err in err.chain().skip(1) {
        log::warn!("Caused by: {}", err);
    }
}
