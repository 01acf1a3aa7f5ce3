//! Ingress handler and background dispatch
//!
//! The handler terminates the inbound request quickly: read the body under
//! the size limit, answer with the first matching mock-response rule, and
//! hand the captured record to a channel. A dispatcher task consumes the
//! channel and spawns one background task per record that feeds the stores,
//! the sinks and the Forwarder - so the caller-visible response never depends
//! on the outcome of background work.

use crate::capture::rules::ResponseRuleSet;
use crate::capture::sink::RecordSink;
use crate::capture::types::{
    BodySizeLimit, CaptureError, RequestRecord, StoredRequest,
};
use crate::forward::{Forwarder, TargetUrl};
use crate::store::{LiveStore, PersistentStore};
use axum::body::Body;
use axum::extract::{ConnectInfo, OriginalUri, Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Limited};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Ingress side of the capture pipeline, shared as Axum state
pub struct CaptureService {
    max_body_bytes: BodySizeLimit,
    rules: ResponseRuleSet,
    tx: mpsc::UnboundedSender<RequestRecord>,
}

impl CaptureService {
    /// Create the service plus the receiving end for a `CaptureDispatcher`
    pub fn new(
        max_body_bytes: BodySizeLimit,
        rules: ResponseRuleSet,
    ) -> (Self, mpsc::UnboundedReceiver<RequestRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                max_body_bytes,
                rules,
                tx,
            },
            rx,
        )
    }

    /// Terminate one inbound request: bounded body read, immediate response,
    /// record hand-off. An oversized body aborts with 413 and creates no record.
    pub async fn handle(&self, request: Request) -> Result<Response, CaptureError> {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let (mut parts, body) = request.into_parts();
        // When mounted under a path prefix the routed URI is stripped;
        // capture what the caller actually sent
        if let Some(original) = parts.extensions.get::<OriginalUri>() {
            parts.uri = original.0.clone();
        }

        let body = read_body(body, self.max_body_bytes).await?;

        let (response, mock_response) = self.rules.respond(&parts.method, parts.uri.path());
        let record = RequestRecord::capture(&parts, body, peer, mock_response);
        debug!(id = %record.id, method = %record.method, path = %record.path, "Accepted request");

        // The acknowledgment above is final before this hand-off; background
        // consumers may start before the transport write lands, but they can
        // never alter or delay it
        if self.tx.send(record).is_err() {
            warn!("Capture pipeline is stopped; request acknowledged but not recorded");
        }
        Ok(response)
    }
}

async fn read_body(body: Body, limit: BodySizeLimit) -> Result<Bytes, CaptureError> {
    if limit.is_unlimited() {
        return body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| CaptureError::BodyRead(e.to_string()));
    }
    Limited::new(body, *limit.as_ref())
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| {
            if e.is::<http_body_util::LengthLimitError>() {
                CaptureError::PayloadTooLarge { limit }
            } else {
                CaptureError::BodyRead(e.to_string())
            }
        })
}

/// Axum handler wrapping `CaptureService::handle`
pub async fn capture_handler(
    State(service): State<Arc<CaptureService>>,
    request: Request,
) -> Response {
    match service.handle(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = match &self {
            CaptureError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CaptureError::BodyRead(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Background task consuming captured records and fanning them out
///
/// Each record gets one task, registered on the shutdown tracker before it is
/// spawned. Consumer failures are logged with the record id and never affect
/// each other.
pub struct CaptureDispatcher {
    rx: mpsc::UnboundedReceiver<RequestRecord>,
    persistent: Arc<PersistentStore>,
    live: Arc<LiveStore>,
    sinks: Arc<Vec<Arc<dyn RecordSink>>>,
    forwarder: Arc<Forwarder>,
    targets: Arc<Vec<TargetUrl>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl CaptureDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::UnboundedReceiver<RequestRecord>,
        persistent: Arc<PersistentStore>,
        live: Arc<LiveStore>,
        sinks: Vec<Arc<dyn RecordSink>>,
        forwarder: Arc<Forwarder>,
        targets: Vec<TargetUrl>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            persistent,
            live,
            sinks: Arc::new(sinks),
            forwarder,
            targets: Arc::new(targets),
            tracker,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_record = self.rx.recv() => match maybe_record {
                    Some(record) => self.dispatch(record),
                    None => break,
                },
                () = self.shutdown.cancelled() => {
                    // Every queued record was already acknowledged to its
                    // caller; stop accepting new sends, then dispatch the
                    // backlog. The cancelled token bounds their forwards.
                    self.rx.close();
                    while let Some(record) = self.rx.recv().await {
                        self.dispatch(record);
                    }
                    break;
                }
            }
        }
        debug!("Capture dispatcher stopped");
    }

    fn dispatch(&self, record: RequestRecord) {
        let persistent = Arc::clone(&self.persistent);
        let live = Arc::clone(&self.live);
        let sinks = Arc::clone(&self.sinks);
        let forwarder = Arc::clone(&self.forwarder);
        let targets = Arc::clone(&self.targets);
        let cancel = self.shutdown.clone();
        self.tracker.spawn(async move {
            process_record(record, persistent, live, sinks, forwarder, targets, cancel).await;
        });
    }
}

/// One record's background phase: persist, index live, then print and forward
/// concurrently. Nothing here can fail the original HTTP exchange.
async fn process_record(
    record: RequestRecord,
    persistent: Arc<PersistentStore>,
    live: Arc<LiveStore>,
    sinks: Arc<Vec<Arc<dyn RecordSink>>>,
    forwarder: Arc<Forwarder>,
    targets: Arc<Vec<TargetUrl>>,
    cancel: CancellationToken,
) {
    let stored = match persistent.record(&record).await {
        Ok(stored) => stored,
        Err(e) => {
            // A store failure is never fatal to capture
            error!(
                id = %record.id,
                error = %e,
                "Persistent store write failed; continuing with in-memory record"
            );
            StoredRequest::new(record.clone())
        }
    };

    live.add(record.clone());

    let print = async {
        for sink in sinks.iter() {
            sink.record(&stored).await;
        }
    };
    let deliver = async {
        if let Err(e) = forwarder.forward(&record, &targets, &cancel).await {
            warn!(id = %record.id, error = %e, "Forwarding skipped");
        }
    };
    tokio::join!(print, deliver);
}
