//! Data models for the dashboard.
//!
//! These models represent the domain view of tracked projects and their
//! merge requests, built fresh from GitLab data on every aggregation call.
//!
//! All models derive Serialize so they can be handed to the HTTP surface.

pub mod filter;
pub mod group;
pub mod merge_request;
pub mod project;
pub mod settings;
pub mod user;

// Re-exports for convenient access
pub use filter::Filter;
pub use group::{MergeRequestsGroup, Summary};
pub use merge_request::{
    Approval, CommentStats, DiffStatsSummary, Discussion, Issue, MergeRequest, Note, Pipeline,
    Status,
};
pub use project::{ApprovalRule, Project, ProjectRef};
pub use settings::{GroupSettings, JiraSettings, ProjectSettings, Settings};
pub use user::User;
