//! Forwarding module: best-effort fan-out of captured requests
//!
//! A captured request is delivered independently to every configured target
//! under a process-wide concurrency bound, with capped exponential backoff
//! per target and cancellation at every suspension point.

pub mod forwarder;
pub mod headers;
pub mod path_strategy;

pub use forwarder::{ForwardError, ForwardOptions, Forwarder, TargetUrl};
pub use path_strategy::{PathStrategy, ResolvedPath};
