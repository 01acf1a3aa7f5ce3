//! Query filter shared by both stores
//!
//! Both stores honor the same contract: exact case-insensitive method match,
//! case-insensitive substring search across path, query, remote address, user
//! agent and serialized headers, newest-first ordering, limit/offset paging.

use crate::capture::types::RequestRecord;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Exact method match, compared case-insensitively
    pub method: Option<String>,
    /// Substring searched across path, query, remote address, user agent and
    /// the JSON rendering of the headers
    pub search: Option<String>,
    /// Page size; `None` returns everything after `offset`
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RecordFilter {
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn is_unfiltered(&self) -> bool {
        self.method.is_none() && self.search.is_none()
    }

    /// In-memory evaluation of the filter predicates (paging excluded)
    pub fn matches(&self, record: &RequestRecord) -> bool {
        if let Some(method) = &self.method {
            if !record.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let found = [
                record.path.as_str(),
                record.query.as_str(),
                record.remote_addr.as_str(),
                record.user_agent.as_str(),
            ]
            .iter()
            .any(|haystack| haystack.to_lowercase().contains(&needle))
                || record.headers.to_json().to_lowercase().contains(&needle);
            if !found {
                return false;
            }
        }
        true
    }
}
