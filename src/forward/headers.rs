//! Header constants and filtering for forwarded requests
//!
//! Centralizes the header names injected on outbound deliveries and the
//! default set of connection-management headers that never survive the hop.

use crate::capture::types::RequestRecord;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Original caller address
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Scheme the original request arrived on
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Host header the original request carried
pub const X_REQTAP_ORIGINAL_HOST: &str = "x-reqtap-original-host";

/// 1-indexed delivery attempt number
pub const X_REQTAP_FORWARD_ATTEMPT: &str = "x-reqtap-forward-attempt";

/// Connection-management headers stripped from every forwarded request
pub const DEFAULT_HEADER_BLACKLIST: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Build the outbound header map for one delivery attempt.
///
/// Copies the captured headers minus the blacklist (built-ins plus any
/// configured extras), restricted to the whitelist when one is configured,
/// then injects the forwarding headers. `attempt` is 1-indexed.
pub fn outbound_headers(
    record: &RequestRecord,
    extra_blacklist: &[String],
    whitelist: Option<&[String]>,
    attempt: u32,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, values) in record.headers.iter() {
        if is_blacklisted(name, extra_blacklist) {
            continue;
        }
        if let Some(allowed) = whitelist {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(name)) {
                continue;
            }
        }
        let Ok(header_name) = name.parse::<HeaderName>() else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                headers.append(header_name.clone(), header_value);
            }
        }
    }

    insert_str(&mut headers, X_FORWARDED_FOR, &record.remote_addr);
    insert_str(&mut headers, X_FORWARDED_PROTO, forwarded_proto(record));
    if let Some(host) = record.headers.get("host") {
        insert_str(&mut headers, X_REQTAP_ORIGINAL_HOST, host);
    }
    insert_str(&mut headers, X_REQTAP_FORWARD_ATTEMPT, &attempt.to_string());

    headers
}

fn is_blacklisted(name: &str, extra: &[String]) -> bool {
    DEFAULT_HEADER_BLACKLIST
        .iter()
        .any(|b| b.eq_ignore_ascii_case(name))
        || extra.iter().any(|b| b.eq_ignore_ascii_case(name))
}

fn forwarded_proto(record: &RequestRecord) -> &'static str {
    // The listener itself is plain HTTP; honor an upstream proto hint if the
    // request already came through a TLS-terminating proxy
    match record.headers.get(X_FORWARDED_PROTO) {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
