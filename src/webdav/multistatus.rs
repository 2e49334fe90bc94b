// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! PROPFIND 207 Multi-Status bodies
//!
//! Servers disagree on namespace prefixes (`d:`, `D:`, `lp1:`, none), so the
//! element patterns accept any prefix.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

const RESPONSE_PATTERN: &str = r"(?s)<(?:[\w.-]+:)?response[\s>].*?</(?:[\w.-]+:)?response\s*>";
const HREF_PATTERN: &str = r"(?s)<(?:[\w.-]+:)?href(?:\s[^>]*)?>(.*?)</(?:[\w.-]+:)?href\s*>";
const LAST_MODIFIED_PATTERN: &str =
    r"(?s)<(?:[\w.-]+:)?getlastmodified(?:\s[^>]*)?>(.*?)</(?:[\w.-]+:)?getlastmodified\s*>";
const CONTENT_LENGTH_PATTERN: &str =
    r"(?s)<(?:[\w.-]+:)?getcontentlength(?:\s[^>]*)?>\s*(\d+)\s*</(?:[\w.-]+:)?getcontentlength\s*>";
const COLLECTION_PATTERN: &str = r"<(?:[\w.-]+:)?collection\s*/?>";

static RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(RESPONSE_PATTERN).expect("response pattern"));
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(HREF_PATTERN).expect("href pattern"));
static LAST_MODIFIED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(LAST_MODIFIED_PATTERN).expect("last modified pattern"));
static CONTENT_LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CONTENT_LENGTH_PATTERN).expect("content length pattern"));
static COLLECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(COLLECTION_PATTERN).expect("collection pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Decoded href path as the server reported it
    pub href: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_length: Option<u64>,
    pub is_collection: bool,
}

impl DavEntry {
    /// Last non-empty path segment
    pub fn name(&self) -> &str {
        crate::archive::base_name(&self.href)
    }
}

pub fn parse_multistatus(xml: &str) -> Vec<DavEntry> {
    RESPONSE_RE
        .find_iter(xml)
        .filter_map(|block| {
            let block = block.as_str();
            let href = HREF_RE.captures(block)?.get(1)?.as_str().trim();
            let href = decode_href(&unescape_xml(href));
            Some(DavEntry {
                href,
                last_modified: LAST_MODIFIED_RE
                    .captures(block)
                    .and_then(|c| parse_http_date(c[1].trim())),
                content_length: CONTENT_LENGTH_RE
                    .captures(block)
                    .and_then(|c| c[1].parse().ok()),
                is_collection: COLLECTION_RE.is_match(block),
            })
        })
        .collect()
}

/// Absolute-URL hrefs are reduced to their path, then percent-decoded
fn decode_href(href: &str) -> String {
    let path = match url::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    urlencoding::decode(&path).map(|s| s.into_owned()).unwrap_or(path)
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// RFC 1123 (`Mon, 01 Jan 2024 03:00:00 GMT`), with RFC 3339 accepted as well
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
