//! Project model.

use super::merge_request::MergeRequest;
use super::user::User;
use serde::{Deserialize, Serialize};

/// A tracked project enriched with its open merge requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// GitLab project ID.
    pub id: i64,

    /// Configured display name.
    pub name: String,

    /// Name of the configured group owning this project.
    pub group_name: String,

    /// Web URL for the project (filled during enrichment).
    pub web_url: String,

    /// Open merge requests.
    pub merge_requests: Vec<MergeRequest>,

    /// Approval rules of the project.
    pub approval_rules: Vec<ApprovalRule>,
}

impl Project {
    /// Create an empty project entry.
    pub fn new(id: i64, name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group_name: group_name.into(),
            ..Default::default()
        }
    }

    /// Lightweight reference stored on each merge request.
    pub fn reference(&self) -> ProjectRef {
        ProjectRef {
            id: self.id,
            name: self.name.clone(),
            group_name: self.group_name.clone(),
            web_url: self.web_url.clone(),
        }
    }

    /// The approval rule with the given name, if any.
    pub fn rule(&self, name: &str) -> Option<&ApprovalRule> {
        self.approval_rules.iter().find(|r| r.name == name)
    }
}

/// Back-reference from a merge request to its project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub id: i64,
    pub name: String,
    pub group_name: String,
    pub web_url: String,
}

/// A project approval rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRule {
    /// Rule name. The rule named "Owner" lists the project's trusted owners.
    pub name: String,

    /// Eligible approvers.
    pub users: Vec<User>,
}
