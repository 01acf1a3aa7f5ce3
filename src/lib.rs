//! ReqTap - a self-hosted HTTP request blackhole
//!
//! ReqTap accepts arbitrary inbound HTTP requests, immediately acknowledges the
//! caller with a configurable mock response, then asynchronously records the
//! request and optionally fans it out ("forwards" it) to downstream targets.
//! It is used to inspect webhook/API traffic without blocking the sender.

pub mod application;
pub mod capture;
pub mod config;
pub mod error;
pub mod forward;
pub mod store;

pub use application::Application;
pub use error::{Error, Result};
