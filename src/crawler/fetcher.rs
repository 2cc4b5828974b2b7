//! HTTP transport
//!
//! This module handles all network access for the mirror:
//! - The [`Transport`] seam the pipeline fetches through
//! - Building the reqwest client with user agent, proxy and redirect policy
//! - Exposing each response as metadata plus a body byte stream
//! - Error classification into [`MirrorError`] variants

use crate::{MirrorError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{redirect::Policy, Client, Proxy};
use std::collections::HashMap;
use url::Url;

/// Maximum number of redirect hops followed for one request
pub const MAX_REDIRECTS: usize = 10;

/// Response metadata, available before any body byte is read
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    /// Final URL after redirects
    pub final_url: Url,
    /// HTTP status code
    pub status: u16,
    /// Response headers with lowercase names
    pub headers: HashMap<String, String>,
}

impl ResponseMeta {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// An opened response: metadata now, body on demand
///
/// Dropping the body stream aborts the transfer.
pub struct FetchResponse {
    pub meta: ResponseMeta,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// The fetch primitive the pipeline depends on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a GET request and resolves once the response headers arrived
    ///
    /// # Arguments
    ///
    /// * `url` - The URL to fetch
    /// * `headers` - Extra request headers, e.g. `Referer`
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Transport`] for DNS, connection and protocol
    /// failures. HTTP error statuses are not errors at this level.
    async fn open(&self, url: &Url, headers: &[(String, String)]) -> Result<FetchResponse>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `user_agent` - The User-Agent header value
/// * `proxy` - Optional proxy URL (`http://`, `https://` or `socks5://`)
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(MirrorError)` - Invalid proxy or client construction failure
///
/// # Example
///
/// ```no_run
/// use site_mirror::crawler::build_http_client;
///
/// let client = build_http_client("site-mirror/1.0", None).unwrap();
/// ```
pub fn build_http_client(user_agent: &str, proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    Ok(builder.build()?)
}

/// [`Transport`] backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, proxy: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: build_http_client(user_agent, proxy)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Maps a reqwest failure to the error taxonomy
fn classify(url: &Url, error: reqwest::Error) -> MirrorError {
    let message = if error.is_connect() {
        format!("connection failed: {}", error)
    } else if error.is_redirect() {
        format!("redirect error: {}", error)
    } else {
        error.to_string()
    };
    MirrorError::Transport {
        url: url.to_string(),
        message,
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn open(&self, url: &Url, headers: &[(String, String)]) -> Result<FetchResponse> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| classify(url, e))?;

        let meta = ResponseMeta {
            final_url: response.url().clone(),
            status: response.status().as_u16(),
            headers: response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect(),
        };

        let stream_url = url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(&stream_url, e)))
            .boxed();

        Ok(FetchResponse { meta, body })
    }
}
