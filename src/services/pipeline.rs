//! Derivation pipeline.
//!
//! An ordered list of pure passes over the enriched project list. Each pass
//! is total: it never fails and only writes derived fields. Order matters:
//! owners must be marked before approvals are sorted.

use crate::models::{CommentStats, Issue, Project, Status, User};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Name of the approval rule whose members are the project's owners.
pub const OWNER_RULE_NAME: &str = "Owner";

/// Lower-cased pipeline status for a failed pipeline.
pub const PIPELINE_FAILED_STATUS: &str = "failed";

/// Lower-cased pipeline status for a successful pipeline.
pub const PIPELINE_SUCCESS_STATUS: &str = "success";

/// Merge requests older than this are outdated.
pub const OUTDATED_AFTER_DAYS: i64 = 10;

/// Text of the system note GitLab writes when someone approves.
pub const APPROVED_NOTE_MARKER: &str = "approved this merge request";

// ASCII digits only; `\d` would also accept other Unicode digits.
static ISSUE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Z]+-[0-9]+)\]").expect("issue key pattern is valid")
});

/// Inputs shared by every pass of one aggregation call.
#[derive(Debug, Clone, Copy)]
pub struct DerivationContext<'a> {
    pub current_username: &'a str,
    pub jira_url: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// A single derivation pass.
pub type Pass = fn(Vec<Project>, &DerivationContext<'_>) -> Vec<Project>;

/// The passes, in the order they run.
pub const PASSES: [(&str, Pass); 6] = [
    ("fill issues", fill_issues),
    ("fill owners", fill_owners),
    ("sort approvals", sort_approvals),
    ("fill statuses", fill_statuses),
    ("count comments", count_comments),
    ("set approved before", set_approved_before),
];

/// Run every pass in order.
pub fn derive(projects: Vec<Project>, ctx: &DerivationContext<'_>) -> Vec<Project> {
    PASSES.iter().fold(projects, |projects, (name, pass)| {
        log::trace!("[pipeline] {}", name);
        pass(projects, ctx)
    })
}

/// Extract bracketed issue keys (`[ABC-12]`) from a description, first-seen
/// order, without duplicates.
pub fn extract_issue_keys(description: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ISSUE_KEY_RE
        .captures_iter(description)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Link issue tracker tickets mentioned in MR descriptions.
///
/// No-op when no issue tracker URL is configured.
pub fn fill_issues(mut projects: Vec<Project>, ctx: &DerivationContext<'_>) -> Vec<Project> {
    let Some(base_url) = ctx.jira_url else {
        return projects;
    };

    for mr in projects.iter_mut().flat_map(|p| p.merge_requests.iter_mut()) {
        mr.issues = extract_issue_keys(&mr.description)
            .into_iter()
            .map(|key| Issue {
                url: format!("{}/browse/{}", base_url, key),
                key,
            })
            .collect();
    }
    projects
}

/// Flag approvers that belong to the project's "Owner" rule.
pub fn fill_owners(mut projects: Vec<Project>, _ctx: &DerivationContext<'_>) -> Vec<Project> {
    for project in &mut projects {
        let owners: HashSet<String> = project
            .rule(OWNER_RULE_NAME)
            .map(|rule| rule.users.iter().map(|u| u.username.clone()).collect())
            .unwrap_or_default();

        for approval in project
            .merge_requests
            .iter_mut()
            .flat_map(|mr| mr.approvals.iter_mut())
        {
            approval.user.is_owner = owners.contains(&approval.user.username);
        }
    }
    projects
}

/// Order approvals: the current user first, then owners, then by username.
pub fn sort_approvals(mut projects: Vec<Project>, ctx: &DerivationContext<'_>) -> Vec<Project> {
    for mr in projects.iter_mut().flat_map(|p| p.merge_requests.iter_mut()) {
        mr.approvals.sort_by(|a, b| {
            let rank = |user: &User| (!user.is(ctx.current_username), !user.is_owner);
            rank(&a.user)
                .cmp(&rank(&b.user))
                .then_with(|| a.user.username.cmp(&b.user.username))
        });
    }
    projects
}

/// Derive readiness flags from pipeline status, conflict flag and age.
pub fn fill_statuses(mut projects: Vec<Project>, ctx: &DerivationContext<'_>) -> Vec<Project> {
    for mr in projects.iter_mut().flat_map(|p| p.merge_requests.iter_mut()) {
        let conflict = mr.status.conflict;
        let pipeline = mr.pipeline.status.as_str();

        mr.status = Status {
            conflict,
            pipeline_failed: pipeline == PIPELINE_FAILED_STATUS,
            ready: pipeline == PIPELINE_SUCCESS_STATUS && !conflict,
            pending: pipeline != PIPELINE_SUCCESS_STATUS
                && pipeline != PIPELINE_FAILED_STATUS
                && !conflict,
            outdated: is_outdated(mr.created_at, ctx.now),
        };
    }
    projects
}

/// Whether an MR created at `created_at` is strictly older than the limit.
pub fn is_outdated(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at > Duration::days(OUTDATED_AFTER_DAYS)
}

/// Count resolved and unresolved resolvable notes.
pub fn count_comments(mut projects: Vec<Project>, _ctx: &DerivationContext<'_>) -> Vec<Project> {
    for mr in projects.iter_mut().flat_map(|p| p.merge_requests.iter_mut()) {
        let mut stats = CommentStats::default();
        for note in mr.notes().filter(|n| n.resolvable) {
            if note.resolved {
                stats.resolved_count += 1;
            } else {
                stats.unresolved_count += 1;
            }
        }
        mr.comment_stats = stats;
    }
    projects
}

/// Flag MRs the current user approved earlier but no longer approves.
///
/// This matches GitLab's system note text, so it only works for instances
/// that write approval notes in English.
pub fn set_approved_before(
    mut projects: Vec<Project>,
    ctx: &DerivationContext<'_>,
) -> Vec<Project> {
    let me = ctx.current_username;
    for mr in projects.iter_mut().flat_map(|p| p.merge_requests.iter_mut()) {
        if mr.author.is(me) || mr.is_approved_by(me) {
            continue;
        }
        let approved = mr
            .notes()
            .any(|n| n.author.is(me) && n.body.contains(APPROVED_NOTE_MARKER));
        mr.approved_before = approved;
    }
    projects
}
