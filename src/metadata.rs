//! gRPC metadata (headers and trailers).
//!
//! Metadata is an ordered multi-map from lowercase ASCII keys to one or more
//! values. Keys ending in `-bin` carry raw binary values which travel over
//! HTTP/2 as base64; all other keys carry printable-ASCII text. Insertion
//! order of distinct keys is preserved for HTTP/2 emission.

use base64::Engine;
use base64::alphabet;
use base64::engine::DecodePaddingMode;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use thiserror::Error;

/// Standard base64, tolerant of senders that omit padding on `-bin` values.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A single metadata value: text for normal keys, raw bytes for `-bin` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable ASCII text (0x20-0x7E).
    Ascii(String),
    /// Raw bytes, base64-encoded on the wire.
    Binary(Bytes),
}

impl MetadataValue {
    /// The text of an ASCII value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// The bytes of a binary value, if this is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Ascii(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(b: Bytes) -> Self {
        MetadataValue::Binary(b)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for MetadataValue {
    fn from(b: &[u8]) -> Self {
        MetadataValue::Binary(Bytes::copy_from_slice(b))
    }
}

/// Errors from inserting malformed keys or values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key {0:?} contains illegal characters")]
    InvalidKey(String),
    #[error("metadata value for key {0:?} is not printable ASCII")]
    InvalidValue(String),
    #[error("metadata key {0:?} ends with -bin and requires a binary value")]
    ExpectedBinaryValue(String),
    #[error("metadata key {0:?} requires an ASCII text value")]
    ExpectedAsciiValue(String),
}

fn is_legal_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'_' | b'.' | b'-'))
}

fn is_legal_text_value(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// True for keys whose values are binary on the wire.
pub(crate) fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

/// True for user-defined keys, which follow the comma-split convention on
/// import. `grpc-`-prefixed keys are one HTTP header per value.
fn is_custom_key(key: &str) -> bool {
    !key.starts_with("grpc-")
}

fn check_entry(key: &str, value: &MetadataValue) -> Result<(), MetadataError> {
    if !is_legal_key(key) {
        return Err(MetadataError::InvalidKey(key.to_string()));
    }
    match (is_binary_key(key), value) {
        (true, MetadataValue::Ascii(_)) => Err(MetadataError::ExpectedBinaryValue(key.to_string())),
        (false, MetadataValue::Binary(_)) => {
            Err(MetadataError::ExpectedAsciiValue(key.to_string()))
        }
        (false, MetadataValue::Ascii(s)) if !is_legal_text_value(s) => {
            Err(MetadataError::InvalidValue(key.to_string()))
        }
        _ => Ok(()),
    }
}

/// Ordered multi-map of gRPC metadata entries.
#[derive(Debug, Default)]
pub struct Metadata {
    entries: Vec<(String, Vec<MetadataValue>)>,
}

const NO_VALUES: &[MetadataValue] = &[];

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Replace the value sequence for a key.
    pub fn set(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = key.as_ref().to_ascii_lowercase();
        let value = value.into();
        check_entry(&key, &value)?;
        match self.position(&key) {
            Some(i) => self.entries[i].1 = vec![value],
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Append a value to a key's sequence.
    pub fn add(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<MetadataValue>,
    ) -> Result<(), MetadataError> {
        let key = key.as_ref().to_ascii_lowercase();
        let value = value.into();
        check_entry(&key, &value)?;
        match self.position(&key) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Drop all values for a key.
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    /// All values for a key, possibly empty.
    pub fn get(&self, key: &str) -> &[MetadataValue] {
        let key = key.to_ascii_lowercase();
        match self.position(&key) {
            Some(i) => &self.entries[i].1,
            None => NO_VALUES,
        }
    }

    /// First text value for a key.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).first().and_then(|v| v.as_str())
    }

    /// Check if a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(&key.to_ascii_lowercase()).is_some()
    }

    /// Append every value of `other` to this metadata, per key.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            match self.position(key) {
                Some(i) => self.entries[i].1.extend(values.iter().cloned()),
                None => self.entries.push((key.clone(), values.clone())),
            }
        }
    }

    /// Iterate over all (key, value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v)))
    }

    /// Check if metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries, counting duplicates.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Convert to HTTP/2 headers. Binary values are base64-encoded, each
    /// value becomes its own header, and reserved keys (starting with `:`)
    /// are never exported.
    pub fn to_http2_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, values) in &self.entries {
            if key.starts_with(':') {
                continue;
            }
            let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
                tracing::error!(key, "metadata key is not a legal header name, skipping");
                continue;
            };
            for value in values {
                let encoded = match value {
                    MetadataValue::Ascii(s) => HeaderValue::from_str(s),
                    MetadataValue::Binary(b) => HeaderValue::from_str(&BASE64.encode(b)),
                };
                match encoded {
                    Ok(v) => {
                        headers.append(name.clone(), v);
                    }
                    Err(_) => {
                        tracing::error!(key, "metadata value is not a legal header value, skipping")
                    }
                }
            }
        }
        headers
    }

    /// Build metadata from HTTP/2 headers. Reserved pseudo-headers are
    /// skipped, `-bin` values are base64-decoded, and custom (non-`grpc-`)
    /// keys arriving as a single concatenated line are comma-split.
    /// Malformed values are dropped with a logged error.
    pub fn from_http2_headers(headers: &HeaderMap) -> Metadata {
        let mut metadata = Metadata::new();
        for key in headers.keys() {
            let key_str = key.as_str();
            if key_str.starts_with(':') {
                continue;
            }
            for value in headers.get_all(key) {
                if is_binary_key(key_str) {
                    let Ok(raw) = value.to_str() else {
                        tracing::error!(key = key_str, "non-ASCII binary metadata value, skipping");
                        continue;
                    };
                    let parts: Vec<&str> = if is_custom_key(key_str) {
                        raw.split(',').map(str::trim).collect()
                    } else {
                        vec![raw]
                    };
                    for part in parts {
                        match BASE64.decode(part) {
                            Ok(decoded) => {
                                let _ = metadata.add(key_str, decoded);
                            }
                            Err(_) => {
                                tracing::error!(
                                    key = key_str,
                                    "failed to base64-decode binary metadata value, skipping"
                                );
                            }
                        }
                    }
                } else {
                    let Ok(text) = value.to_str() else {
                        tracing::error!(key = key_str, "non-ASCII metadata value, skipping");
                        continue;
                    };
                    if is_custom_key(key_str) {
                        for part in text.split(',') {
                            let _ = metadata.add(key_str, part.trim());
                        }
                    } else {
                        let _ = metadata.add(key_str, text);
                    }
                }
            }
        }
        metadata
    }
}

impl Clone for Metadata {
    /// Deep copy: binary values become independent buffers.
    fn clone(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(k, values)| {
                let values = values
                    .iter()
                    .map(|v| match v {
                        MetadataValue::Ascii(s) => MetadataValue::Ascii(s.clone()),
                        MetadataValue::Binary(b) => {
                            MetadataValue::Binary(Bytes::copy_from_slice(b))
                        }
                    })
                    .collect();
                (k.clone(), values)
            })
            .collect();
        Self { entries }
    }
}

impl PartialEq for Metadata {
    /// Key order does not affect equality; per-key value order does.
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(key, values)| {
                other.position(key).map(|i| &other.entries[i].1) == Some(values)
            })
    }
}

impl Eq for Metadata {}
