//! Captured network trace for a single scan.
//!
//! Records are produced by the browser-automation collaborator and mutated in
//! place by the classification and detection stages (`is_thirdparty`,
//! `is_tracker`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Scheme and network location of a request URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUrl {
    /// URL scheme (`http`, `https`, `wss`, `data`, ...).
    pub scheme: String,
    /// Host plus optional port, as it appears in the URL.
    pub netloc: String,
}

impl ParsedUrl {
    /// Splits a URL into scheme and netloc; unparseable input yields empty parts.
    #[must_use]
    pub fn from_url(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default();
                let netloc = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                Self {
                    scheme: url.scheme().to_string(),
                    netloc,
                }
            }
            Err(_) => Self::default(),
        }
    }
}

/// One captured network request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub url: String,
    #[serde(default)]
    pub parsed_url: Option<ParsedUrl>,
    /// URL of the document that issued the request.
    #[serde(default)]
    pub document_url: String,
    #[serde(default)]
    pub is_thirdparty: bool,
    #[serde(default)]
    pub is_tracker: bool,
}

impl RequestRecord {
    /// Creates a request record, deriving `parsed_url` from `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, document_url: impl Into<String>) -> Self {
        let url = url.into();
        let parsed_url = Some(ParsedUrl::from_url(&url));
        Self {
            url,
            parsed_url,
            document_url: document_url.into(),
            is_thirdparty: false,
            is_tracker: false,
        }
    }

    /// Returns true for inline `data:` URIs, which no stage classifies.
    #[must_use]
    pub fn is_data_uri(&self) -> bool {
        self.url.starts_with("data:")
    }

    /// Returns the parsed URL, deriving it when the collaborator omitted it.
    #[must_use]
    pub fn parsed(&self) -> ParsedUrl {
        self.parsed_url
            .clone()
            .unwrap_or_else(|| ParsedUrl::from_url(&self.url))
    }
}

/// One cookie observed during the scan.
///
/// Fields other than `domain` and the two flags are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub domain: String,
    #[serde(default)]
    pub is_thirdparty: bool,
    #[serde(default)]
    pub is_tracker: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CookieRecord {
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            is_thirdparty: false,
            is_tracker: false,
            extra: Map::new(),
        }
    }
}

/// Request log and cookie jar of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanTrace {
    pub site_url: String,
    pub final_url: String,
    #[serde(default)]
    pub requests: Vec<RequestRecord>,
    #[serde(default)]
    pub cookies: Vec<CookieRecord>,
}

impl ScanTrace {
    /// Fills in `parsed_url` on requests where the collaborator left it out.
    pub fn normalize(&mut self) {
        for request in &mut self.requests {
            if request.parsed_url.is_none() {
                request.parsed_url = Some(ParsedUrl::from_url(&request.url));
            }
        }
    }
}
