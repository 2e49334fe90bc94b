// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! HTTP plumbing under the WebDAV client
//!
//! The client only ever speaks in [`DavRequest`] / [`DavResponse`]; the
//! reqwest-backed transport is the one place that touches the network.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Metadata requests (PROPFIND, MKCOL, DELETE) never wait longer than this
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DavBody {
    Empty,
    Xml(String),
    /// Streamed from disk; the file is reopened on every send
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DavRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: DavBody,
    pub timeout: Duration,
}

impl DavRequest {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: DavBody::Empty,
            timeout: METADATA_TIMEOUT,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replace any existing header of the same name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn body(mut self, body: DavBody) -> Self {
        self.body = body;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DavResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl DavResponse {
    pub fn new(status: u16) -> Self {
        Self { status, ..Default::default() }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Every value of a header, case-insensitively (servers may send several WWW-Authenticate)
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait DavTransport: Send + Sync {
    async fn send(&self, request: DavRequest) -> Result<DavResponse, TransportError>;

    /// GET a resource straight into `dest`. Non-2xx responses leave `dest` untouched.
    async fn download(&self, request: DavRequest, dest: &Path) -> Result<DavResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        // NAS boxes are commonly fronted by self-signed certificates
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn builder(&self, request: &DavRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Other(format!("invalid method {}: {}", request.method, e)))?;
        let mut builder = self.client.request(method, &request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(match &request.body {
            DavBody::Empty => builder,
            DavBody::Xml(xml) => builder
                .header("Content-Type", "application/xml; charset=utf-8")
                .body(xml.clone()),
            DavBody::File(path) => {
                let file = tokio::fs::File::open(path).await
                    .map_err(|e| TransportError::Other(format!("cannot open {}: {}", path.display(), e)))?;
                let len = file.metadata().await
                    .map_err(|e| TransportError::Other(e.to_string()))?
                    .len();
                builder = builder.header("Content-Length", len.to_string());
                if !request.has_header("Content-Type") {
                    builder = builder.header("Content-Type", "application/octet-stream");
                }
                builder.body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        })
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Other(e.to_string())
    }
}

fn response_head(resp: &reqwest::Response) -> DavResponse {
    DavResponse {
        status: resp.status().as_u16(),
        headers: resp.headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
        body: String::new(),
    }
}

#[async_trait]
impl DavTransport for ReqwestTransport {
    async fn send(&self, request: DavRequest) -> Result<DavResponse, TransportError> {
        debug!("WebDAV {} {}", request.method, request.url);
        let resp = self.builder(&request).await?.send().await.map_err(map_reqwest)?;
        let mut out = response_head(&resp);
        out.body = resp.text().await.unwrap_or_default();
        Ok(out)
    }

    async fn download(&self, request: DavRequest, dest: &Path) -> Result<DavResponse, TransportError> {
        debug!("WebDAV {} {} -> {}", request.method, request.url, dest.display());
        let resp = self.builder(&request).await?.send().await.map_err(map_reqwest)?;
        let mut out = response_head(&resp);
        if !resp.status().is_success() {
            out.body = resp.text().await.unwrap_or_default();
            return Ok(out);
        }

        let io = |e: std::io::Error| TransportError::Other(format!("{}: {}", dest.display(), e));
        let mut file = tokio::fs::File::create(dest).await.map_err(io)?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest)?;
            file.write_all(&chunk).await.map_err(io)?;
        }
        file.flush().await.map_err(io)?;
        Ok(out)
    }
}
