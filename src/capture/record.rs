//! RequestRecord construction from inbound request parts
//!
//! Everything here is a deep copy: the record must never alias the live
//! connection's header map or body buffer, since independent consumers read
//! it concurrently after the response has been sent.

use crate::capture::types::{
    BodySize, CapturedHeaders, MockResponseInfo, RequestId, RequestRecord,
};
use bytes::Bytes;
use chrono::Utc;
use std::net::SocketAddr;

/// Content-type prefixes treated as binary without inspecting the payload
const BINARY_CONTENT_TYPE_PREFIXES: &[&str] = &[
    "image/",
    "audio/",
    "video/",
    "font/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-tar",
    "application/x-protobuf",
];

/// Fraction of NUL bytes above which a body is considered binary
const NUL_BYTE_RATIO: f64 = 0.10;

impl RequestRecord {
    /// Build an immutable record from the already-read request parts and body.
    ///
    /// `peer` is the transport-level remote address, used as a fallback when
    /// no forwarding headers are present.
    pub fn capture(
        parts: &http::request::Parts,
        body: Bytes,
        peer: Option<SocketAddr>,
        mock_response: MockResponseInfo,
    ) -> Self {
        let headers = CapturedHeaders::from_http(&parts.headers);
        let user_agent = headers.get("user-agent").unwrap_or_default().to_string();
        let remote_addr = resolve_remote_addr(&headers, peer);
        let content_type = headers.get("content-type");
        let is_binary = is_binary_body(content_type, &body);
        let size = BodySize::from(body.len());

        Self {
            id: RequestId::generate(),
            timestamp: Utc::now(),
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            protocol: format!("{:?}", parts.version),
            remote_addr,
            user_agent,
            headers,
            body,
            is_binary,
            size,
            mock_response,
        }
    }
}

/// Resolve the caller's address from forwarding headers, falling back to the
/// transport-level peer address.
pub fn resolve_remote_addr(headers: &CapturedHeaders, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        // First entry is the originating client
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Binary heuristic: known binary content-type prefix, non-UTF-8 payload, or
/// more than 10% NUL bytes. Computed once at capture; consumers never recompute.
pub fn is_binary_body(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(content_type) = content_type {
        let lowered = content_type.to_ascii_lowercase();
        if BINARY_CONTENT_TYPE_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
        {
            return true;
        }
    }

    if body.is_empty() {
        return false;
    }

    if std::str::from_utf8(body).is_err() {
        return true;
    }

    let nul_count = body.iter().filter(|b| **b == 0).count();
    (nul_count as f64) / (body.len() as f64) > NUL_BYTE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::MockResponseInfo;

    fn parts_for(method: &str, uri: &str, headers: &[(&str, &str)]) -> http::request::Parts {
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn test_capture_extracts_request_line_fields() {
        let parts = parts_for(
            "POST",
            "/hooks/github?delivery=42",
            &[("user-agent", "hookshot/1.0"), ("content-type", "text/plain")],
        );
        let record = RequestRecord::capture(
            &parts,
            Bytes::from_static(b"payload"),
            Some("10.0.0.9:55112".parse().unwrap()),
            MockResponseInfo::default(),
        );

        assert_eq!(record.method, "POST");
        assert_eq!(record.path, "/hooks/github");
        assert_eq!(record.query, "delivery=42");
        assert_eq!(record.protocol, "HTTP/1.1");
        assert_eq!(record.user_agent, "hookshot/1.0");
        assert_eq!(record.remote_addr, "10.0.0.9:55112");
        assert_eq!(*record.size.as_ref(), 7);
        assert!(!record.is_binary);
    }

    #[test]
    fn test_size_equals_body_length() {
        let parts = parts_for("PUT", "/x", &[]);
        let body = Bytes::from(vec![1u8, 2, 3, 4, 5]);
        let record = RequestRecord::capture(&parts, body, None, MockResponseInfo::default());
        assert_eq!(*record.size.as_ref(), record.body.len());
    }

    #[test]
    fn test_remote_addr_prefers_forwarded_header() {
        let headers = CapturedHeaders::from_pairs(vec![(
            "x-forwarded-for".to_string(),
            vec!["203.0.113.7, 10.0.0.1".to_string()],
        )]);
        let resolved = resolve_remote_addr(&headers, Some("127.0.0.1:9999".parse().unwrap()));
        assert_eq!(resolved, "203.0.113.7");
    }

    #[test]
    fn test_remote_addr_real_ip_fallback() {
        let headers = CapturedHeaders::from_pairs(vec![(
            "x-real-ip".to_string(),
            vec!["198.51.100.4".to_string()],
        )]);
        assert_eq!(resolve_remote_addr(&headers, None), "198.51.100.4");
    }

    #[test]
    fn test_remote_addr_peer_fallback() {
        let headers = CapturedHeaders::default();
        assert_eq!(
            resolve_remote_addr(&headers, Some("192.0.2.1:4242".parse().unwrap())),
            "192.0.2.1:4242"
        );
        assert_eq!(resolve_remote_addr(&headers, None), "unknown");
    }

    #[test]
    fn test_binary_by_content_type_prefix() {
        assert!(is_binary_body(Some("image/png"), b"not really a png"));
        assert!(is_binary_body(Some("Application/OCTET-Stream"), b""));
        assert!(!is_binary_body(Some("application/json"), b"{}"));
    }

    #[test]
    fn test_binary_by_invalid_utf8() {
        assert!(is_binary_body(None, &[0xff, 0xfe, 0x00, 0x41]));
    }

    #[test]
    fn test_binary_by_nul_ratio() {
        // 2 NULs out of 10 bytes = 20% > 10%
        let body = b"ab\0cdefg\0h";
        assert!(is_binary_body(Some("text/plain"), body));
        // 1 NUL out of 20 bytes = 5% <= 10%
        let body = b"abcdefghij\0abcdefghi";
        assert!(!is_binary_body(Some("text/plain"), body));
    }

    #[test]
    fn test_empty_body_is_not_binary() {
        assert!(!is_binary_body(None, b""));
    }
}
