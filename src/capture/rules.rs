//! Immediate-response rules
//!
//! The ordered rule list is loaded once at startup and read-only thereafter.
//! The first rule whose method/path predicates all match decides the mock
//! response sent to the caller; no match yields the default `200 ok`.

use crate::capture::types::MockResponseInfo;
use crate::config::ResponseRuleSettings;
use axum::body::Body;
use axum::response::Response;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use tracing::warn;

/// One immediate-response rule, parsed and validated at startup
#[derive(Clone, Debug)]
pub struct ResponseRule {
    pub name: String,
    /// Uppercased method names; empty matches any method
    methods: Vec<String>,
    exact_path: Option<String>,
    path_prefix: Option<String>,
    status: StatusCode,
    body: String,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseRule {
    fn matches(&self, method: &Method, path: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == method.as_str()) {
            return false;
        }
        if let Some(exact) = &self.exact_path {
            if path != exact {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }

    fn to_response(&self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(self.body.clone()))
            .unwrap_or_else(|_| default_response())
    }
}

/// Ordered set of immediate-response rules; first match wins
#[derive(Clone, Debug, Default)]
pub struct ResponseRuleSet {
    rules: Vec<ResponseRule>,
}

impl ResponseRuleSet {
    /// Build the rule set from configuration, skipping invalid rules with a warning
    pub fn from_settings(settings: &[ResponseRuleSettings]) -> Self {
        let mut rules = Vec::with_capacity(settings.len());
        for rule in settings {
            let status = match StatusCode::from_u16(rule.status) {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        rule = %rule.name,
                        status = rule.status,
                        "Skipping response rule with invalid status code"
                    );
                    continue;
                }
            };

            let mut headers = Vec::with_capacity(rule.headers.len());
            for (name, value) in &rule.headers {
                match (
                    name.parse::<HeaderName>(),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => headers.push((name, value)),
                    _ => warn!(
                        rule = %rule.name,
                        header = %name,
                        "Skipping invalid header on response rule"
                    ),
                }
            }

            rules.push(ResponseRule {
                name: rule.name.clone(),
                methods: rule.methods.iter().map(|m| m.to_uppercase()).collect(),
                exact_path: rule.exact_path.clone(),
                path_prefix: rule.path_prefix.clone(),
                status,
                body: rule.body.clone(),
                headers,
            });
        }
        Self { rules }
    }

    /// Produce the caller-visible response and the record annotation for it
    pub fn respond(&self, method: &Method, path: &str) -> (Response, MockResponseInfo) {
        match self.rules.iter().find(|rule| rule.matches(method, path)) {
            Some(rule) => (
                rule.to_response(),
                MockResponseInfo {
                    rule_name: rule.name.clone(),
                    status: rule.status.as_u16(),
                },
            ),
            None => (
                default_response(),
                MockResponseInfo {
                    rule_name: String::new(),
                    status: StatusCode::OK.as_u16(),
                },
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Default response when no rule matches
fn default_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from("ok"))
        .expect("static default response is valid")
}
