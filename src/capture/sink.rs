//! Recorder sink capability
//!
//! Consumers such as the web console are attached through this narrow
//! interface so the core has no compile-time dependency on their internals.

use crate::capture::types::StoredRequest;
use async_trait::async_trait;
use tracing::info;

/// Capability interface for anything that wants a copy of each captured request
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn record(&self, stored: &StoredRequest);

    /// Release any resources held by the sink; called once at shutdown
    async fn close(&self) {}
}

/// Sink that drops everything
pub struct NoopSink;

#[async_trait]
impl RecordSink for NoopSink {
    async fn record(&self, _stored: &StoredRequest) {}
}

/// Console printer: logs a one-line summary per captured request
///
/// Body pretty-printing for the console lives outside the core; this sink
/// only emits the structured summary line.
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    async fn record(&self, stored: &StoredRequest) {
        let record = &stored.record;
        info!(
            id = %stored.id,
            method = %record.method,
            path = %record.path,
            remote = %record.remote_addr,
            bytes = %record.size,
            binary = record.is_binary,
            status = record.mock_response.status,
            "Captured request"
        );
    }
}
