//! Capture module: the ingress side of the blackhole
//!
//! This module implements the capture pipeline:
//! - Handler: reads the inbound body under a size limit, answers the caller
//!   immediately with the first matching mock-response rule
//! - Dispatcher: background task consuming captured records from a channel
//!   and fanning them out to the stores, the console printer and the Forwarder

pub mod handler;
pub mod record;
pub mod rules;
pub mod sink;
pub mod types;

pub use handler::{CaptureDispatcher, CaptureService};
pub use rules::ResponseRuleSet;
pub use sink::{LogSink, RecordSink};
pub use types::{CaptureError, RequestId, RequestRecord, StoredRequest};
