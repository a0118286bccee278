//! Grouping, summaries, filtering and final ordering.
//!
//! These run after derivation. Summaries are computed before filtering so
//! the counts always describe the full set of open merge requests.

use crate::models::{Filter, MergeRequest, MergeRequestsGroup, Project, Summary};

/// Partition projects by group name, keeping first-encounter order of groups
/// and of projects within a group.
pub fn group_merge_requests(projects: Vec<Project>) -> Vec<MergeRequestsGroup> {
    let mut groups: Vec<MergeRequestsGroup> = Vec::new();

    for project in projects {
        let index = match groups.iter().position(|g| g.group_name == project.group_name) {
            Some(index) => index,
            None => {
                groups.push(MergeRequestsGroup::new(project.group_name.clone()));
                groups.len() - 1
            }
        };
        groups[index].merge_requests.extend(project.merge_requests);
    }

    groups
}

/// Count total and outdated merge requests of every group.
pub fn fill_group_summaries(mut groups: Vec<MergeRequestsGroup>) -> Vec<MergeRequestsGroup> {
    for group in &mut groups {
        group.summary = Summary {
            total: group.merge_requests.len(),
            overdue: group
                .merge_requests
                .iter()
                .filter(|mr| mr.status.outdated)
                .count(),
        };
    }
    groups
}

/// Whether a merge request passes the filter for the current user.
pub fn is_kept(mr: &MergeRequest, current_username: &str, filter: &Filter) -> bool {
    let is_mine = mr.author.is(current_username);
    let still_show_mine = filter.but_still_show_mine && is_mine;

    if filter.do_not_show_drafts && mr.is_draft() && !still_show_mine {
        return false;
    }
    if filter.skip_approved_by_me && mr.is_approved_by(current_username) && !still_show_mine {
        return false;
    }
    if filter.show_only_mine && !is_mine {
        return false;
    }
    true
}

/// Drop merge requests the filter rejects. Summaries are left untouched.
pub fn filter_merge_requests(
    mut groups: Vec<MergeRequestsGroup>,
    current_username: &str,
    filter: &Filter,
) -> Vec<MergeRequestsGroup> {
    for group in &mut groups {
        group
            .merge_requests
            .retain(|mr| is_kept(mr, current_username, filter));
    }
    groups
}

/// Oldest first within each group.
pub fn sort_by_creation(mut groups: Vec<MergeRequestsGroup>) -> Vec<MergeRequestsGroup> {
    for group in &mut groups {
        group.merge_requests.sort_by_key(|mr| mr.created_at);
    }
    groups
}
