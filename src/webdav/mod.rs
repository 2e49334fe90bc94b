// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! WebDAV offsite tier — NAS boxes, Nextcloud, Apache mod_dav and friends
//!
//! Servers differ in where DAV lives, which auth they accept and which upload
//! method they tolerate, so the client negotiates:
//!   1. candidate roots derived from the configured URL
//!   2. a depth-0 PROPFIND against each root under each auth scheme; the first
//!      pair that answers is remembered for the rest of the client's life
//!   3. uploads walk a list of request variants, then the other candidate roots
//!
//! A failed negotiation reports every URL that was tried.

pub mod auth;
pub mod multistatus;
pub mod transport;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::archive::{RemoteArchive, is_archive_name};
use crate::config::WebDavConfig;
use crate::error::{Error, Result};
use crate::retention::select_expired;
use crate::transfer::transfer_timeout;

use auth::{AUTH_SCHEMES, AuthScheme, Authenticator, Credentials};
use multistatus::parse_multistatus;
use transport::{DavBody, DavRequest, DavResponse, DavTransport, TransportError};

pub const PROPFIND_BODY: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8"?>"#,
    r#"<d:propfind xmlns:d="DAV:"><d:prop>"#,
    r#"<d:resourcetype/><d:getlastmodified/><d:getcontentlength/>"#,
    r#"</d:prop></d:propfind>"#,
);

/// One way of sending a file body
#[derive(Debug, Clone, Copy)]
pub struct UploadStrategy {
    pub method: &'static str,
    pub headers: &'static [(&'static str, &'static str)],
}

/// Tried in order against each candidate root
pub const UPLOAD_STRATEGIES: &[UploadStrategy] = &[
    UploadStrategy { method: "PUT", headers: &[("Content-Type", "application/octet-stream")] },
    UploadStrategy { method: "PUT", headers: &[("Content-Type", "application/octet-stream"), ("Overwrite", "T")] },
    UploadStrategy { method: "POST", headers: &[("Content-Type", "application/octet-stream")] },
];

/// Attempts per strategy on transient failures; a conflict earns one more with `Overwrite: T`
pub const UPLOAD_ATTEMPTS_PER_STRATEGY: u32 = 2;

/// The size of a WebDAV archive is unknown before its GET
const DOWNLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(6 * 3600);

/// MKCOL answers that mean "nothing more to do here"
const MKCOL_TOLERATED: &[u16] = &[200, 201, 204, 301, 302, 405, 501];

/// A DAV root plus the configured backup collection under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub root: String,
    pub collection: String,
}

impl Candidate {
    fn file_url(&self, name: &str) -> String {
        format!("{}/{}", self.collection, urlencoding::encode(name))
    }
}

/// Roots to probe for a configured URL, most likely first, without duplicates
pub fn candidate_roots(url: &str, username: &str) -> Vec<String> {
    let base = url.trim().trim_end_matches('/').to_string();
    let lower = base.to_ascii_lowercase();
    let mut roots = vec![base.clone()];

    if !lower.contains("/remote.php") {
        if !lower.ends_with("/dav") {
            roots.push(format!("{}/dav", base));
        }
        if !username.is_empty() {
            roots.push(format!("{}/remote.php/dav/files/{}", base, urlencoding::encode(username)));
        }
        roots.push(format!("{}/remote.php/webdav", base));
    }

    // A URL pointing at the wrong sub-path still has a usable origin
    if let Ok(parsed) = url::Url::parse(&base) {
        let origin = parsed.origin().ascii_serialization();
        if origin != "null" {
            roots.push(origin);
        }
    }

    let mut seen = std::collections::HashSet::new();
    roots.retain(|r| seen.insert(r.clone()));
    roots
}

/// Percent-encoded segments of the configured collection path
fn collection_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect()
}

pub fn candidates(config: &WebDavConfig) -> Vec<Candidate> {
    let suffix: String = collection_segments(&config.path)
        .iter()
        .map(|s| format!("/{}", s))
        .collect();
    candidate_roots(&config.url, &config.username)
        .into_iter()
        .map(|root| Candidate { collection: format!("{}{}", root, suffix), root })
        .collect()
}

/// The negotiated root and auth scheme
pub struct Endpoint {
    pub candidate: Candidate,
    auth: Authenticator,
}

impl Endpoint {
    pub fn scheme(&self) -> AuthScheme {
        self.auth.scheme()
    }
}

pub struct WebDavClient {
    config: WebDavConfig,
    transport: Arc<dyn DavTransport>,
    candidates: Vec<Candidate>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    collection_ready: Mutex<bool>,
}

impl WebDavClient {
    pub fn new(config: WebDavConfig, transport: Arc<dyn DavTransport>) -> Self {
        let candidates = candidates(&config);
        Self {
            config,
            transport,
            candidates,
            endpoint: Mutex::new(None),
            collection_ready: Mutex::new(false),
        }
    }

    fn credentials(&self) -> Credentials {
        Credentials { username: self.config.username.clone(), password: self.config.password.clone() }
    }

    /// Send through an authenticator, answering one fresh digest challenge
    async fn send(&self, auth: &Authenticator, request: DavRequest) -> std::result::Result<DavResponse, TransportError> {
        let response = self.transport.send(auth.authorize(request.clone())).await?;
        if auth.learn(&response) {
            return self.transport.send(auth.authorize(request)).await;
        }
        Ok(response)
    }

    /// Probe candidates until one answers; later calls reuse the answer
    pub async fn resolve(&self) -> Result<Arc<Endpoint>> {
        let mut slot = self.endpoint.lock().await;
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.clone());
        }

        let mut tried = Vec::new();
        for candidate in &self.candidates {
            tried.push(candidate.root.clone());
            for &scheme in AUTH_SCHEMES {
                let auth = Authenticator::new(scheme, self.credentials());
                let probe = DavRequest::new("PROPFIND", format!("{}/", candidate.root))
                    .header("Depth", "0")
                    .body(DavBody::Xml(PROPFIND_BODY.to_string()));
                match self.send(&auth, probe).await {
                    Ok(resp) if resp.is_success() => {
                        info!("WebDAV endpoint {} ({} auth)", candidate.root, scheme);
                        let endpoint = Arc::new(Endpoint { candidate: candidate.clone(), auth });
                        *slot = Some(endpoint.clone());
                        return Ok(endpoint);
                    }
                    Ok(resp) => debug!("WebDAV probe {} ({}): HTTP {}", candidate.root, scheme, resp.status),
                    Err(e) => {
                        debug!("WebDAV probe {} ({}): {}", candidate.root, scheme, e);
                        // Unreachable root: other schemes will not fare better
                        break;
                    }
                }
            }
        }
        Err(Error::Negotiation(tried))
    }

    /// URL of the negotiated collection, once probing has succeeded
    #[cfg(test)]
    pub async fn collection_url(&self) -> Option<String> {
        self.endpoint.lock().await.as_ref().map(|e| e.candidate.collection.clone())
    }

    /// MKCOL each level of the collection path once per client
    async fn ensure_collection(&self, endpoint: &Endpoint) {
        let mut ready = self.collection_ready.lock().await;
        if *ready {
            return;
        }
        let mut url = endpoint.candidate.root.clone();
        for segment in collection_segments(&self.config.path) {
            url = format!("{}/{}", url, segment);
            match self.send(&endpoint.auth, DavRequest::new("MKCOL", format!("{}/", url))).await {
                Ok(resp) if MKCOL_TOLERATED.contains(&resp.status) => {}
                Ok(resp) => warn!("MKCOL {} returned HTTP {}", url, resp.status),
                Err(e) => warn!("MKCOL {} failed: {}", url, e),
            }
        }
        *ready = true;
    }

    /// Upload `local` as `name`, returning the URL that accepted it
    pub async fn upload(&self, local: &Path, name: &str) -> Result<String> {
        let endpoint = self.resolve().await?;
        self.ensure_collection(&endpoint).await;

        let size = tokio::fs::metadata(local).await?.len();
        let timeout = transfer_timeout(size);
        info!("Uploading {} ({} bytes) to WebDAV", name, size);

        let mut targets = vec![endpoint.candidate.clone()];
        targets.extend(self.candidates.iter().filter(|c| **c != endpoint.candidate).cloned());

        let mut tried = Vec::new();
        for target in &targets {
            let url = target.file_url(name);
            for strategy in UPLOAD_STRATEGIES {
                match self.upload_with(&endpoint.auth, &url, strategy, local, timeout).await {
                    Ok(()) => {
                        info!("Uploaded {} via {} {}", name, strategy.method, url);
                        return Ok(url);
                    }
                    Err(reason) => {
                        debug!("{} {} failed: {}", strategy.method, url, reason);
                        tried.push(format!("{} {}", strategy.method, url));
                    }
                }
            }
        }
        Err(Error::Negotiation(tried))
    }

    async fn upload_with(
        &self,
        auth: &Authenticator,
        url: &str,
        strategy: &UploadStrategy,
        local: &Path,
        timeout: std::time::Duration,
    ) -> std::result::Result<(), String> {
        let mut budget = UPLOAD_ATTEMPTS_PER_STRATEGY;
        let mut overwrite = false;
        let mut last = String::from("not attempted");
        while budget > 0 {
            budget -= 1;
            let mut request = DavRequest::new(strategy.method, url)
                .body(DavBody::File(local.to_path_buf()))
                .timeout(timeout);
            for (name, value) in strategy.headers {
                request.set_header(name, *value);
            }
            if overwrite {
                request.set_header("Overwrite", "T");
            }

            match self.send(auth, request).await {
                Ok(resp) if resp.is_success() => return Ok(()),
                Ok(resp) if resp.status == 409 || resp.status == 412 => {
                    last = format!("HTTP {}", resp.status);
                    if !overwrite {
                        overwrite = true;
                        budget += 1;
                    }
                }
                Ok(resp) if matches!(resp.status, 408 | 423 | 429 | 500 | 502 | 503 | 504) => {
                    last = format!("HTTP {}", resp.status);
                }
                Ok(resp) => return Err(format!("HTTP {}", resp.status)),
                Err(TransportError::Timeout) => last = "timed out".to_string(),
                Err(e) => return Err(e.to_string()),
            }
        }
        Err(last)
    }

    /// Archives in the collection; a missing collection is an empty list
    pub async fn list(&self) -> Result<Vec<RemoteArchive>> {
        let endpoint = self.resolve().await?;
        let url = format!("{}/", endpoint.candidate.collection);
        let request = DavRequest::new("PROPFIND", url.clone())
            .header("Depth", "1")
            .body(DavBody::Xml(PROPFIND_BODY.to_string()));
        let resp = self.send(&endpoint.auth, request).await
            .map_err(|e| Error::webdav(format!("PROPFIND {}: {}", url, e)))?;
        if resp.status == 404 {
            return Ok(Vec::new());
        }
        if !resp.is_success() {
            return Err(Error::webdav(format!("PROPFIND {} returned HTTP {}", url, resp.status)));
        }

        Ok(parse_multistatus(&resp.body)
            .into_iter()
            .filter(|e| !e.is_collection && is_archive_name(e.name()))
            .map(|e| RemoteArchive::new(e.href.clone(), e.name(), e.last_modified, e.content_length))
            .collect())
    }

    /// Delete one archive; already gone counts as deleted
    pub async fn delete(&self, name: &str) -> Result<()> {
        let endpoint = self.resolve().await?;
        let url = endpoint.candidate.file_url(name);
        let resp = self.send(&endpoint.auth, DavRequest::new("DELETE", url.clone())).await
            .map_err(|e| Error::webdav(format!("DELETE {}: {}", url, e)))?;
        if resp.is_success() || resp.status == 404 {
            Ok(())
        } else {
            Err(Error::webdav(format!("DELETE {} returned HTTP {}", url, resp.status)))
        }
    }

    /// Fetch one archive to `dest`, via `<dest>.part`
    pub async fn download(&self, name: &str, dest: &Path) -> Result<u64> {
        let endpoint = self.resolve().await?;
        let url = endpoint.candidate.file_url(name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut part_name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        part_name.push(".part");
        let part = dest.with_file_name(part_name);

        let request = DavRequest::new("GET", url.clone()).timeout(DOWNLOAD_TIMEOUT);
        let mut resp = self.transport.download(endpoint.auth.authorize(request.clone()), &part).await;
        if let Ok(r) = &resp {
            if endpoint.auth.learn(r) {
                resp = self.transport.download(endpoint.auth.authorize(request), &part).await;
            }
        }
        match resp {
            Ok(r) if r.is_success() => {}
            Ok(r) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(Error::webdav(format!("GET {} returned HTTP {}", url, r.status)));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(Error::webdav(format!("GET {}: {}", url, e)));
            }
        }
        tokio::fs::rename(&part, dest).await?;
        let bytes = tokio::fs::metadata(dest).await?.len();
        info!("Downloaded {} from WebDAV ({} bytes)", name, bytes);
        Ok(bytes)
    }

    /// Keep the newest `keep_count` archives, by modification time when the server reports one
    pub async fn cleanup(&self, keep_count: usize) -> Result<usize> {
        let archives = self.list().await?;
        let expired = select_expired(archives, keep_count, |a| a.modified.unwrap_or(a.timestamp));
        let mut deleted = 0;
        for archive in &expired {
            match self.delete(&archive.name).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete old WebDAV backup {}: {}", archive.name, e),
            }
        }
        if deleted > 0 {
            info!("Pruned {} WebDAV backups (keeping {})", deleted, keep_count);
        }
        Ok(deleted)
    }
}
