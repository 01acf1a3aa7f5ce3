//! Type definitions for the capture pipeline

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ========== Size and Capacity Types ==========

/// Maximum size for inbound request bodies in bytes; zero disables the limit
#[nutype(derive(Clone, Copy, Debug, Display, Deserialize, Serialize, From, AsRef))]
pub struct BodySizeLimit(usize);

impl BodySizeLimit {
    /// Whether a body of `size` bytes exceeds this limit
    pub fn exceeded_by(&self, size: usize) -> bool {
        let limit = *self.as_ref();
        limit > 0 && size > limit
    }

    pub fn is_unlimited(&self) -> bool {
        *self.as_ref() == 0
    }
}

/// Size of a captured HTTP body in bytes
#[nutype(derive(
    Clone, Copy, Debug, Display, Deserialize, Serialize, From, AsRef, PartialEq, Eq
))]
pub struct BodySize(usize);

/// Capacity of the live ring buffer
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |capacity: &usize| *capacity >= 1),
)]
pub struct LiveCapacity(usize);

// ========== Identity ==========

/// Request ID assigned once at capture time; authoritative for both stores
#[nutype(derive(
    Clone,
    Copy,
    Debug,
    Display,
    Hash,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    From,
    AsRef
))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh v7 (time-ordered) id
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

// ========== Headers ==========

/// Ordered multi-map of captured header name -> values
///
/// Always a deep copy of the inbound headers; never aliases the live
/// connection's header map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedHeaders(Vec<(String, Vec<String>)>);

impl CapturedHeaders {
    pub fn from_http(map: &http::HeaderMap) -> Self {
        let mut headers: Vec<(String, Vec<String>)> = Vec::new();
        for (name, value) in map {
            let name = name.as_str().to_string();
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match headers.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.push(value),
                None => headers.push((name, vec![value])),
            }
        }
        Self(headers)
    }

    pub fn from_pairs(pairs: Vec<(String, Vec<String>)>) -> Self {
        Self(pairs)
    }

    /// First value of a header, name compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON rendering used both for persistence and substring search
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ========== Records ==========

/// Which immediate-response rule (if any) answered the caller
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockResponseInfo {
    /// Name of the rule that fired; empty when the default response applied
    pub rule_name: String,
    pub status: u16,
}

/// Immutable value capturing one inbound HTTP request
///
/// Created once per request by the Handler and never mutated afterwards.
/// Consumers each take an independent clone; the body is `Bytes` so clones
/// share the underlying buffer without aliasing anything mutable.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub id: RequestId,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query: String,
    pub protocol: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub headers: CapturedHeaders,
    pub body: Bytes,
    pub is_binary: bool,
    pub size: BodySize,
    pub mock_response: MockResponseInfo,
}

/// A request as held by either store: the identifier and its payload together
#[derive(Clone, Debug)]
pub struct StoredRequest {
    pub id: RequestId,
    pub record: RequestRecord,
}

impl StoredRequest {
    pub fn new(record: RequestRecord) -> Self {
        Self {
            id: record.id,
            record,
        }
    }
}

// ========== Errors ==========

/// Errors surfaced to the caller by the ingress Handler
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Request body too large (max: {limit} bytes)")]
    PayloadTooLarge { limit: BodySizeLimit },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),
}
