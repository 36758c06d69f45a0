//! Fetch collaborator seam and the production HTTP delegate.
//!
//! The runtime downloads worker scripts and `importScripts` bodies through
//! [`ScriptFetcher`]. Conditional revalidation for `update` is expressed as
//! plain request headers so delegates stay dumb transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::future::try_join_all;
use url::Url;

use crate::error::{SwError, SwResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A request for script content.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: Vec::new(),
        }
    }

    /// A conditional GET carrying the validators of a previously stored
    /// response.
    pub fn conditional(url: Url, etag: Option<&str>, last_modified: Option<&str>) -> Self {
        let mut request = Self::get(url);
        if let Some(etag) = etag {
            request
                .headers
                .push(("If-None-Match".to_string(), etag.to_string()));
        }
        if let Some(last_modified) = last_modified {
            request
                .headers
                .push(("If-Modified-Since".to_string(), last_modified.to_string()));
        }
        request
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::storage::header(&self.headers, name)
    }

    /// JSON snapshot handed to fetch event listeners.
    pub(crate) fn to_event_json(&self) -> serde_json::Value {
        serde_json::json!({
            "url": self.url.as_str(),
            "method": self.method,
            "headers": self.headers,
        })
    }
}

/// A response from the fetch collaborator.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::storage::header(&self.headers, name)
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

pub type FetchFuture = Pin<Box<dyn Future<Output = SwResult<FetchResponse>> + Send + 'static>>;

pub type BatchFetchFuture =
    Pin<Box<dyn Future<Output = SwResult<Vec<FetchResponse>>> + Send + 'static>>;

/// The network collaborator.
pub trait ScriptFetcher: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> FetchFuture;

    /// Fetch a batch, preserving request order in the result. Fails fast on
    /// the first error. Callers treat a response count different from the
    /// request count as a delegate error.
    fn fetch_all(&self, requests: Vec<FetchRequest>) -> BatchFetchFuture {
        let futures: Vec<FetchFuture> = requests
            .into_iter()
            .map(|request| self.fetch(request))
            .collect();
        Box::pin(try_join_all(futures))
    }
}

/// Production delegate over a shared HTTP client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> SwResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SwError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Reuse an embedder-configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ScriptFetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let client = self.client.clone();
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|_| SwError::network(format!("invalid method: {}", request.method)))?;
            let mut builder = client.request(method, request.url.as_str());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .send()
                .await
                .map_err(|e| SwError::network(e.to_string()))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| SwError::network(e.to_string()))?
                .to_vec();
            Ok(FetchResponse {
                status,
                headers,
                body,
            })
        })
    }
}
