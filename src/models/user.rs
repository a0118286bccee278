//! GitLab user model.

use serde::{Deserialize, Serialize};

/// A GitLab user as seen by the dashboard.
///
/// `username` is the identity key. `is_owner` and `is_me` are derived per
/// call and never come from GitLab directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// GitLab username.
    pub username: String,

    /// Absolute avatar URL.
    pub avatar_url: String,

    /// Profile URL in the GitLab web UI.
    pub web_url: String,

    /// Whether the user is a member of the project's "Owner" approval rule.
    pub is_owner: bool,

    /// Whether the user is the dashboard's current user.
    pub is_me: bool,
}

impl User {
    /// Create a user with only the identity key set.
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    /// Whether this user is the given username.
    pub fn is(&self, username: &str) -> bool {
        self.username == username
    }
}
