//! Typed view over the per-upload tus header map.
//!
//! Every upload carries an opaque string map keyed by the verbatim tus header
//! names. `UploadInfo` parses the recognized keys on demand and serializes
//! back to HTTP header form; the storage layer treats the map as a blob.

use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};

/// Protocol version this server speaks.
pub const TUS_VERSION: &str = "1.0.0";

/// Response/request header names, lowercase for `HeaderName::from_static`.
pub mod header {
    pub const TUS_RESUMABLE: &str = "tus-resumable";
    pub const TUS_VERSION: &str = "tus-version";
    pub const TUS_EXTENSION: &str = "tus-extension";
    pub const TUS_MAX_SIZE: &str = "tus-max-size";
    pub const TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";
    pub const UPLOAD_LENGTH: &str = "upload-length";
    pub const UPLOAD_OFFSET: &str = "upload-offset";
    pub const UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
    pub const UPLOAD_METADATA: &str = "upload-metadata";
    pub const UPLOAD_CONCAT: &str = "upload-concat";
    pub const UPLOAD_EXPIRES: &str = "upload-expires";
    pub const UPLOAD_CHECKSUM: &str = "upload-checksum";
    pub const METHOD_OVERRIDE: &str = "x-http-method-override";
}

/// Canonical keys used inside the stored info map.
const K_LENGTH: &str = "Upload-Length";
const K_OFFSET: &str = "Upload-Offset";
const K_DEFER_LENGTH: &str = "Upload-Defer-Length";
const K_METADATA: &str = "Upload-Metadata";
const K_CONCAT: &str = "Upload-Concat";
const K_EXPIRES: &str = "Upload-Expires";

/// Concatenation role of an upload, parsed from `Upload-Concat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcatKind {
    /// Ordinary upload.
    None,
    /// Fragment intended for a later final upload.
    Partial,
    /// Upload assembled from the referenced partial uploads, in order.
    Final { part_uids: Vec<String> },
}

/// Typed wrapper over an upload's string-to-string info map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadInfo {
    map: BTreeMap<String, String>,
}

impl UploadInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self { map }
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.map
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.map.insert(key.to_string(), value.into());
    }

    /// Total upload size in bytes, unset while the length is deferred.
    pub fn length(&self) -> Option<u64> {
        self.get(K_LENGTH).and_then(|v| v.parse().ok())
    }

    pub fn set_length(&mut self, length: u64) {
        self.set(K_LENGTH, length.to_string());
    }

    /// Bytes persisted so far; the resume point.
    pub fn offset(&self) -> u64 {
        self.get(K_OFFSET).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.set(K_OFFSET, offset.to_string());
    }

    /// True while the total size is still unknown.
    pub fn defer_length(&self) -> bool {
        self.get(K_DEFER_LENGTH) == Some("1")
    }

    pub fn mark_deferred(&mut self) {
        self.set(K_DEFER_LENGTH, "1");
    }

    pub fn clear_defer_length(&mut self) {
        self.map.remove(K_DEFER_LENGTH);
    }

    pub fn set_metadata_header(&mut self, raw: impl Into<String>) {
        self.set(K_METADATA, raw);
    }

    pub fn set_concat_header(&mut self, raw: impl Into<String>) {
        self.set(K_CONCAT, raw);
    }

    pub fn expires(&self) -> Option<&str> {
        self.get(K_EXPIRES)
    }

    pub fn set_expires(&mut self, when: DateTime<Utc>) {
        self.set(K_EXPIRES, when.to_rfc2822());
    }

    /// Decoded `Upload-Metadata` pairs. Keys without a value map to empty.
    pub fn metadata(&self) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        let Some(raw) = self.get(K_METADATA) else {
            return out;
        };
        for pair in raw.split(',') {
            let mut parts = pair.trim().splitn(2, ' ');
            let Some(key) = parts.next().filter(|k| !k.is_empty()) else {
                continue;
            };
            let value = parts
                .next()
                .and_then(|v| general_purpose::STANDARD.decode(v).ok())
                .unwrap_or_default();
            out.insert(key.to_string(), value);
        }
        out
    }

    /// Metadata value decoded as UTF-8, if present and valid.
    fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata()
            .remove(key)
            .and_then(|v| String::from_utf8(v).ok())
    }

    pub fn content_type(&self) -> Option<String> {
        self.metadata_str("content_type")
    }

    pub fn filename(&self) -> Option<String> {
        self.metadata_str("filename")
    }

    /// Concatenation role, `ConcatKind::None` when the header is absent.
    pub fn concat(&self) -> ConcatKind {
        self.get(K_CONCAT)
            .and_then(parse_concat)
            .unwrap_or(ConcatKind::None)
    }

    pub fn is_partial(&self) -> bool {
        self.concat() == ConcatKind::Partial
    }

    pub fn is_final(&self) -> bool {
        matches!(self.concat(), ConcatKind::Final { .. })
    }

    /// Serialize the recognized keys back to tus response headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(header::UPLOAD_OFFSET, self.offset().to_string())];
        if let Some(length) = self.length() {
            out.push((header::UPLOAD_LENGTH, length.to_string()));
        } else if self.defer_length() {
            out.push((header::UPLOAD_DEFER_LENGTH, "1".to_string()));
        }
        if let Some(raw) = self.get(K_METADATA) {
            out.push((header::UPLOAD_METADATA, raw.to_string()));
        }
        if let Some(raw) = self.get(K_CONCAT) {
            out.push((header::UPLOAD_CONCAT, raw.to_string()));
        }
        if let Some(raw) = self.expires() {
            out.push((header::UPLOAD_EXPIRES, raw.to_string()));
        }
        out
    }
}

/// Parse an `Upload-Concat` header value. `None` means malformed.
pub fn parse_concat(raw: &str) -> Option<ConcatKind> {
    if raw == "partial" {
        return Some(ConcatKind::Partial);
    }
    let urls = raw.strip_prefix("final;")?;
    let part_uids: Vec<String> = urls
        .split_whitespace()
        .filter_map(|url| {
            url.trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|seg| !seg.is_empty())
                .map(str::to_string)
        })
        .collect();
    Some(ConcatKind::Final { part_uids })
}

/// Syntactic validation for a raw `Upload-Metadata` header: comma-separated
/// `key SP base64(value)` pairs, ASCII keys without space or comma, value
/// optional but valid base64 when present.
pub fn validate_metadata(raw: &str) -> bool {
    raw.split(',').all(|pair| {
        let pair = pair.trim();
        let mut parts = pair.splitn(2, ' ');
        let key = match parts.next() {
            Some(k) if !k.is_empty() => k,
            _ => return false,
        };
        if !key.is_ascii() {
            return false;
        }
        match parts.next() {
            Some(value) => general_purpose::STANDARD.decode(value).is_ok(),
            None => true,
        }
    })
}
