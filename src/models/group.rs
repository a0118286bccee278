//! Grouped dashboard output.

use super::merge_request::MergeRequest;
use serde::{Deserialize, Serialize};

/// Per-group counters, computed before filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub overdue: usize,
}

/// Merge requests of one configured group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestsGroup {
    pub group_name: String,
    pub merge_requests: Vec<MergeRequest>,
    pub summary: Summary,
}

impl MergeRequestsGroup {
    /// Create an empty group.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            merge_requests: Vec::new(),
            summary: Summary::default(),
        }
    }
}
