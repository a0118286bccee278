//! Merge request model.
//!
//! A `MergeRequest` is rebuilt from GitLab data on every aggregation call.
//! Everything below the `pipeline` field is derived and recomputed each time.

use super::project::ProjectRef;
use super::user::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An approval given by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub user: User,

    /// Approval time, when GitLab reports it.
    pub approved_at: Option<DateTime<Utc>>,
}

/// A single note within a discussion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub author: User,
    pub resolved_by: Option<User>,
    pub resolvable: bool,
    pub resolved: bool,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A discussion thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discussion {
    pub notes: Vec<Note>,
}

/// Head pipeline of a merge request, reduced to its lower-cased status.
///
/// An empty status means the merge request has no pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub status: String,
}

/// Readiness flags. These are independent booleans, not a state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub conflict: bool,
    pub pipeline_failed: bool,
    pub ready: bool,
    pub outdated: bool,
    pub pending: bool,
}

/// Resolvable note counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentStats {
    pub resolved_count: usize,
    pub unresolved_count: usize,
}

/// An issue tracker ticket referenced from the description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Ticket key, e.g. `PROJ-123`.
    pub key: String,

    /// Browse URL of the ticket.
    pub url: String,
}

/// Diff size summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStatsSummary {
    pub additions: i64,
    pub deletions: i64,
    pub file_count: i64,
}

/// An open merge request with derived review state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    /// Project-scoped MR number.
    pub iid: i64,

    /// Project the MR belongs to.
    pub project: ProjectRef,

    /// MR creation time.
    pub created_at: DateTime<Utc>,

    /// MR title line as shown on the dashboard.
    pub description: String,

    /// URL to MR in GitLab web UI.
    pub url: String,

    pub author: User,
    pub approvals: Vec<Approval>,
    pub discussions: Vec<Discussion>,
    pub pipeline: Pipeline,
    pub diff_stats: DiffStatsSummary,

    /// `conflict` is copied from GitLab; the other flags are derived.
    pub status: Status,
    pub comment_stats: CommentStats,
    pub issues: Vec<Issue>,

    /// The current user approved this MR at some point but no longer does.
    pub approved_before: bool,
}

impl MergeRequest {
    /// Create a merge request with no review data attached.
    pub fn new(iid: i64, project: ProjectRef, created_at: DateTime<Utc>, author: User) -> Self {
        Self {
            iid,
            project,
            created_at,
            description: String::new(),
            url: String::new(),
            author,
            approvals: Vec::new(),
            discussions: Vec::new(),
            pipeline: Pipeline::default(),
            diff_stats: DiffStatsSummary::default(),
            status: Status::default(),
            comment_stats: CommentStats::default(),
            issues: Vec::new(),
            approved_before: false,
        }
    }

    /// Whether the given user currently approves this MR.
    pub fn is_approved_by(&self, username: &str) -> bool {
        self.approvals.iter().any(|a| a.user.is(username))
    }

    /// Whether the MR is marked as a draft.
    pub fn is_draft(&self) -> bool {
        self.description.starts_with(DRAFT_PREFIX)
    }

    /// Iterate over every note of every discussion.
    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.discussions.iter().flat_map(|d| d.notes.iter())
    }
}

/// Title prefix GitLab uses for draft merge requests.
pub const DRAFT_PREFIX: &str = "Draft:";

#[cfg(test)]
mod tests {
    use super::*;

    fn mr(description: &str) -> MergeRequest {
        let mut mr = MergeRequest::new(1, ProjectRef::default(), Utc::now(), User::named("bob"));
        mr.description = description.to_string();
        mr
    }

    #[test]
    fn test_is_draft_requires_exact_prefix() {
        assert!(mr("Draft: wip").is_draft());
        assert!(!mr("draft: wip").is_draft());
        assert!(!mr("Fix Draft: handling").is_draft());
    }

    #[test]
    fn test_is_approved_by() {
        let mut mr = mr("Fix");
        mr.approvals.push(Approval {
            user: User::named("alice"),
            approved_at: None,
        });
        assert!(mr.is_approved_by("alice"));
        assert!(!mr.is_approved_by("bob"));
    }
}
