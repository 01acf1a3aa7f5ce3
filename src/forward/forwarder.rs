//! Concurrency-bounded fan-out engine
//!
//! Delivers a captured request to every configured target independently.
//! One process-wide semaphore bounds simultaneous outbound sends across all
//! in-flight `forward()` calls; each target retries with capped exponential
//! backoff; the cancellation token is checked at every suspension point so
//! shutdown latency stays bounded.

use crate::capture::types::RequestRecord;
use crate::forward::headers::outbound_headers;
use crate::forward::path_strategy::PathStrategy;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use nutype::nutype;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Backoff never exceeds this many seconds between attempts
const MAX_BACKOFF_SECS: u64 = 30;

/// Absolute base URL of a forward target
#[nutype(
    derive(Clone, Debug, Display, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://")),
)]
pub struct TargetUrl(String);

/// Process-wide bound on simultaneous outbound deliveries
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |n: &usize| *n >= 1),
)]
pub struct MaxConcurrentForwards(usize);

#[derive(Debug)]
pub struct ForwardOptions {
    /// Additional attempts after the first (total attempts = retries + 1)
    pub retries: u32,
    pub max_concurrent: MaxConcurrentForwards,
    /// Per-attempt timeout on the outbound call
    pub request_timeout: Duration,
    /// Dropped from forwarded requests, on top of the built-in blacklist
    pub header_blacklist: Vec<String>,
    /// When set, only these captured headers are copied
    pub header_whitelist: Option<Vec<String>>,
    pub path_strategy: PathStrategy,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            max_concurrent: MaxConcurrentForwards::try_new(8).expect("8 is a valid bound"),
            request_timeout: Duration::from_secs(30),
            header_blacklist: Vec::new(),
            header_whitelist: None,
            path_strategy: PathStrategy::default(),
        }
    }
}

/// Errors returned by `forward()`
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Forwarder is closed")]
    Closed,
}

struct CallState {
    closed: bool,
    active: usize,
}

/// Best-effort delivery engine for captured requests
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    semaphore: Semaphore,
    options: ForwardOptions,
    state: Mutex<CallState>,
    drained: Notify,
}

enum AttemptOutcome {
    Success(u16),
    Failure(String),
    Cancelled,
}

impl Forwarder {
    pub fn new(options: ForwardOptions) -> Self {
        let client =
            Client::builder(hyper_util::rt::TokioExecutor::new())
                .http1_title_case_headers(true)
                .build_http();

        Self {
            client,
            semaphore: Semaphore::new(*options.max_concurrent.as_ref()),
            options,
            state: Mutex::new(CallState {
                closed: false,
                active: 0,
            }),
            drained: Notify::new(),
        }
    }

    /// Deliver `record` to every target, independently and best-effort.
    ///
    /// Returns once all targets have finished (success or exhausted retries)
    /// or the cancellation token fires. Per-target failure is logged, never
    /// raised; the only error is calling a closed Forwarder.
    pub async fn forward(
        &self,
        record: &RequestRecord,
        targets: &[TargetUrl],
        cancel: &CancellationToken,
    ) -> Result<(), ForwardError> {
        if targets.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ForwardError::Closed);
            }
            state.active += 1;
        }
        let _guard = ActiveCall { forwarder: self };

        let deliveries = targets.iter().map(|target| self.deliver(record, target, cancel));
        futures_util::future::join_all(deliveries).await;
        Ok(())
    }

    /// Mark the Forwarder closed and wait for in-flight `forward()` calls.
    ///
    /// Callers must cancel the token passed to `forward()` first to bound how
    /// long the drain takes; per-target retries observe the token, not this
    /// counter.
    pub async fn close(&self) {
        self.state.lock().closed = true;
        loop {
            let drained = self.drained.notified();
            if self.state.lock().active == 0 {
                break;
            }
            drained.await;
        }
    }

    async fn deliver(
        &self,
        record: &RequestRecord,
        target: &TargetUrl,
        cancel: &CancellationToken,
    ) {
        let resolved = self.options.path_strategy.resolve(&record.path);
        let mut uri = format!("{}{}", target.as_ref().trim_end_matches('/'), resolved.path);
        if !record.query.is_empty() {
            uri.push('?');
            uri.push_str(&record.query);
        }

        let attempts = self.options.retries + 1;
        let mut last_failure = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(id = %record.id, target = %target, "Delivery cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }

            // The permit is held only around the send, not the backoff sleep
            let permit = tokio::select! {
                () = cancel.cancelled() => return,
                permit = self.semaphore.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let outcome = self.attempt(record, &uri, attempt + 1, cancel).await;
            drop(permit);

            match outcome {
                AttemptOutcome::Success(status) => {
                    debug!(
                        id = %record.id,
                        target = %target,
                        status,
                        attempt = attempt + 1,
                        rule = %resolved.rule_name,
                        "Forwarded request"
                    );
                    return;
                }
                AttemptOutcome::Cancelled => {
                    debug!(id = %record.id, target = %target, "Delivery cancelled");
                    return;
                }
                AttemptOutcome::Failure(reason) => {
                    warn!(
                        id = %record.id,
                        target = %target,
                        attempt = attempt + 1,
                        error = %reason,
                        "Delivery attempt failed"
                    );
                    last_failure = reason;
                }
            }
        }

        error!(
            id = %record.id,
            target = %target,
            attempts,
            error = %last_failure,
            "Forwarding failed after exhausting retries"
        );
    }

    /// One delivery attempt; `attempt` is the 1-indexed attempt number
    async fn attempt(
        &self,
        record: &RequestRecord,
        uri: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let request = match self.build_request(record, uri, attempt) {
            Ok(request) => request,
            Err(reason) => return AttemptOutcome::Failure(reason),
        };

        let send = tokio::time::timeout(self.options.request_timeout, self.client.request(request));
        let response = tokio::select! {
            () = cancel.cancelled() => return AttemptOutcome::Cancelled,
            result = send => match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return AttemptOutcome::Failure(format!("transport error: {e}")),
                Err(_) => {
                    return AttemptOutcome::Failure(format!(
                        "timed out after {:?}",
                        self.options.request_timeout
                    ))
                }
            },
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            return AttemptOutcome::Failure(format!("target responded {status}"));
        }
        // Drain the response body so the pooled connection can be reused
        let _ = response.into_body().collect().await;
        AttemptOutcome::Success(status.as_u16())
    }

    fn build_request(
        &self,
        record: &RequestRecord,
        uri: &str,
        attempt: u32,
    ) -> Result<http::Request<Full<Bytes>>, String> {
        let method = http::Method::from_bytes(record.method.as_bytes())
            .map_err(|e| format!("invalid method `{}`: {e}", record.method))?;
        let mut request = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(record.body.clone()))
            .map_err(|e| format!("failed to build outbound request: {e}"))?;
        *request.headers_mut() = outbound_headers(
            record,
            &self.options.header_blacklist,
            self.options.header_whitelist.as_deref(),
            attempt,
        );
        Ok(request)
    }
}

struct ActiveCall<'a> {
    forwarder: &'a Forwarder,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let mut state = self.forwarder.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.forwarder.drained.notify_waiters();
        }
    }
}

/// Delay before the given 0-indexed attempt (>= 1): min(2^(attempt-1), 30) seconds
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt - 1).min(MAX_BACKOFF_SECS))
}
