//! Page fetching for listing endpoints: live HTTP or a local mock document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "rli-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";
pub const ACCEPT_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("listing endpoint is not configured (set TARGET_URL or MOCK_JSON)")]
    MissingEndpoint,
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading mock file {path}: {source}")]
    MockRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mock file {path} is not valid JSON: {source}")]
    MockDecode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of page documents, addressed by 1-based page number.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub page_param: String,
    pub size_param: String,
    pub page_size: u32,
    pub timeout: Duration,
    pub user_agent: String,
    pub auth_header_name: String,
    pub auth_header_value: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            page_param: "page".to_string(),
            size_param: "size".to_string(),
            page_size: 50,
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            auth_header_name: String::new(),
            auth_header_value: String::new(),
        }
    }
}

impl HttpClientConfig {
    /// The auth header pair, present only when both name and value are set.
    pub fn auth_header(&self) -> Option<(&str, &str)> {
        let name = self.auth_header_name.trim();
        let value = self.auth_header_value.trim();
        if name.is_empty() || value.is_empty() {
            None
        } else {
            Some((name, value))
        }
    }
}

fn build_headers(config: &HttpClientConfig) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&config.user_agent).map_err(|err| FetchError::InvalidHeader {
            name: USER_AGENT.to_string(),
            reason: err.to_string(),
        })?,
    );
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));

    if let Some((name, value)) = config.auth_header() {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| FetchError::InvalidHeader {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        let mut header_value =
            HeaderValue::from_str(value).map_err(|err| FetchError::InvalidHeader {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        header_value.set_sensitive(true);
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

#[derive(Debug)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    endpoint: String,
    page_param: String,
    size_param: String,
    page_size: u32,
    headers: HeaderMap,
}

impl HttpPageFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let endpoint = config.endpoint.trim().to_string();
        if endpoint.is_empty() {
            return Err(FetchError::MissingEndpoint);
        }
        let headers = build_headers(&config)?;

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            page_param: config.page_param,
            size_param: config.size_param,
            page_size: config.page_size,
            headers,
        })
    }

    pub fn build_request(&self, page: u32) -> Result<reqwest::Request, FetchError> {
        let query = [
            (self.page_param.as_str(), page.to_string()),
            (self.size_param.as_str(), self.page_size.to_string()),
        ];
        Ok(self
            .client
            .get(&self.endpoint)
            .query(&query)
            .headers(self.headers.clone())
            .build()?)
    }
}

#[async_trait]
impl PageSource for HttpPageFetcher {
    async fn fetch_page(&self, page: u32) -> Result<JsonValue, FetchError> {
        let request = self.build_request(page)?;
        let span = info_span!("http_fetch", page, url = %request.url());

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

/// Replays a local JSON document instead of calling the endpoint.
///
/// A file holding one object serves it as page 1. A file holding an array of
/// page objects serves element `n - 1` as page `n`. Any page past the end is
/// an empty page, which ends the crawl.
#[derive(Debug, Clone)]
pub struct MockFilePageSource {
    path: PathBuf,
}

impl MockFilePageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn empty_page() -> JsonValue {
    json!({ "items": [] })
}

#[async_trait]
impl PageSource for MockFilePageSource {
    async fn fetch_page(&self, page: u32) -> Result<JsonValue, FetchError> {
        let bytes = fs::read(&self.path).await.map_err(|source| FetchError::MockRead {
            path: self.path.display().to_string(),
            source,
        })?;
        let document: JsonValue =
            serde_json::from_slice(&bytes).map_err(|source| FetchError::MockDecode {
                path: self.path.display().to_string(),
                source,
            })?;
        debug!(page, path = %self.path.display(), "read mock page");

        let index = (page as usize).checked_sub(1);
        let selected = match (document, index) {
            (JsonValue::Array(pages), Some(index)) => pages.into_iter().nth(index),
            (single, Some(0)) => Some(single),
            _ => None,
        };
        Ok(selected.unwrap_or_else(empty_page))
    }
}

/// Picks the mock source when a path is configured, the HTTP fetcher otherwise.
pub fn page_source_for(
    config: &HttpClientConfig,
    mock_path: Option<&Path>,
) -> Result<Box<dyn PageSource>, FetchError> {
    match mock_path {
        Some(path) => Ok(Box::new(MockFilePageSource::new(path))),
        None => Ok(Box::new(HttpPageFetcher::new(config.clone())?)),
    }
}
