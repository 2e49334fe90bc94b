// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! WebDAV authentication strategies
//!
//! Tried in order during endpoint probing: HTTP Basic, HTTP Digest (RFC 7616,
//! MD5 or SHA-256, qop=auth) and finally credentials embedded in the URL.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{LazyLock, Mutex};

use super::transport::{DavRequest, DavResponse};

/// `key=value` or `key="quoted value"` pairs in a challenge
const CHALLENGE_PARAM_PATTERN: &str = r#"([A-Za-z0-9_-]+)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^\s,]+))"#;

static CHALLENGE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CHALLENGE_PARAM_PATTERN).expect("challenge param pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
    /// user:password@ in the URL itself
    Plain,
}

/// Probe order
pub const AUTH_SCHEMES: &[AuthScheme] = &[AuthScheme::Basic, AuthScheme::Digest, AuthScheme::Plain];

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Digest => write!(f, "digest"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex::encode(Md5::digest(input.as_bytes())),
            Self::Sha256 | Self::Sha256Sess => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Only `auth` is supported; `None` means the legacy RFC 2069 response
    pub qop_auth: bool,
    pub algorithm: DigestAlgorithm,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse one `WWW-Authenticate` value; anything but a usable Digest challenge is `None`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let scheme_end = header.find(char::is_whitespace)?;
        if !header[..scheme_end].eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut stale = false;
        for caps in CHALLENGE_PARAM_RE.captures_iter(&header[scheme_end..]) {
            let value = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or("");
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                "opaque" => opaque = Some(value.to_string()),
                "qop" => qop_auth = value.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")),
                "algorithm" => algorithm = DigestAlgorithm::parse(value)?,
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        Some(Self { realm: realm?, nonce: nonce?, opaque, qop_auth, algorithm, stale })
    }

    /// The `Authorization` header value for one request
    pub fn authorization(&self, method: &str, uri: &str, credentials: &Credentials, nc: u32, cnonce: &str) -> String {
        let alg = self.algorithm;
        let mut ha1 = alg.hash(&format!("{}:{}:{}", credentials.username, self.realm, credentials.password));
        if alg.is_session() {
            ha1 = alg.hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = alg.hash(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", nc);

        let response = if self.qop_auth {
            alg.hash(&format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))
        } else {
            alg.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            credentials.username, self.realm, self.nonce, uri, alg.name(), response
        );
        if self.qop_auth {
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

/// Applies one scheme to outgoing requests, remembering the digest challenge between them
pub struct Authenticator {
    scheme: AuthScheme,
    credentials: Credentials,
    challenge: Mutex<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
}

impl Authenticator {
    pub fn new(scheme: AuthScheme, credentials: Credentials) -> Self {
        Self { scheme, credentials, challenge: Mutex::new(None), nonce_count: AtomicU32::new(0) }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn authorize(&self, mut request: DavRequest) -> DavRequest {
        if self.credentials.username.is_empty() {
            return request;
        }
        match self.scheme {
            AuthScheme::Basic => {
                let token = BASE64.encode(format!("{}:{}", self.credentials.username, self.credentials.password));
                request.set_header("Authorization", format!("Basic {}", token));
            }
            AuthScheme::Digest => {
                let challenge = self.challenge.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(challenge) = challenge {
                    let nc = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let cnonce = hex::encode(rand::random::<[u8; 8]>());
                    let value = challenge.authorization(
                        request.method, &request_uri(&request.url), &self.credentials, nc, &cnonce,
                    );
                    request.set_header("Authorization", value);
                }
            }
            AuthScheme::Plain => {
                if let Ok(mut url) = url::Url::parse(&request.url) {
                    if url.set_username(&self.credentials.username).is_ok()
                        && url.set_password(Some(&self.credentials.password)).is_ok()
                    {
                        request.url = url.to_string();
                    }
                }
            }
        }
        request
    }

    /// Take in a 401 response. True when a new digest challenge arrived and the
    /// request is worth sending again.
    pub fn learn(&self, response: &DavResponse) -> bool {
        if self.scheme != AuthScheme::Digest || response.status != 401 {
            return false;
        }
        let Some(fresh) = response.header_values("WWW-Authenticate").find_map(DigestChallenge::parse) else {
            return false;
        };
        let mut current = self.challenge.lock().unwrap_or_else(|e| e.into_inner());
        let retry = match current.as_ref() {
            None => true,
            Some(old) => fresh.stale || old.nonce != fresh.nonce,
        };
        if retry {
            *current = Some(fresh);
            self.nonce_count.store(0, Ordering::SeqCst);
        }
        retry
    }
}

/// Path and query of a URL, as Digest signs it
fn request_uri(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(url) => match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        },
        Err(_) => raw.to_string(),
    }
}
