//! Tracked project settings.
//!
//! A `Settings` value is an immutable snapshot; reconfiguration replaces it
//! wholesale.

use super::project::Project;
use serde::{Deserialize, Serialize};

/// A tracked project inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// GitLab project ID.
    pub id: i64,

    /// Display name.
    pub name: String,
}

/// A named group of tracked projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub name: String,

    #[serde(default)]
    pub projects: Vec<ProjectSettings>,
}

/// Issue tracker (JIRA) settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JiraSettings {
    /// Base URL, e.g. `https://jira.example.com`. Issue links are only built
    /// when this is set.
    pub url: Option<String>,
}

/// Dashboard settings snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub groups: Vec<GroupSettings>,
    pub jira: JiraSettings,
}

impl Settings {
    /// Build the per-call project list, one entry per configured project,
    /// in group order then project order.
    pub fn projects(&self) -> Vec<Project> {
        self.groups
            .iter()
            .flat_map(|group| {
                group
                    .projects
                    .iter()
                    .map(move |p| Project::new(p.id, &p.name, &group.name))
            })
            .collect()
    }

    /// Issue tracker base URL, if configured and non-empty.
    pub fn jira_url(&self) -> Option<&str> {
        self.jira.url.as_deref().filter(|url| !url.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            groups: vec![
                GroupSettings {
                    name: "Backend".to_string(),
                    projects: vec![
                        ProjectSettings {
                            id: 1,
                            name: "api".to_string(),
                        },
                        ProjectSettings {
                            id: 2,
                            name: "worker".to_string(),
                        },
                    ],
                },
                GroupSettings {
                    name: "Frontend".to_string(),
                    projects: vec![ProjectSettings {
                        id: 3,
                        name: "web".to_string(),
                    }],
                },
            ],
            jira: JiraSettings::default(),
        }
    }

    #[test]
    fn test_projects_preserve_order_and_group() {
        let projects = settings().projects();
        let ids: Vec<i64> = projects.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(projects[1].group_name, "Backend");
        assert_eq!(projects[2].group_name, "Frontend");
        assert!(projects.iter().all(|p| p.merge_requests.is_empty()));
    }

    #[test]
    fn test_empty_jira_url_is_unset() {
        let mut settings = settings();
        assert_eq!(settings.jira_url(), None);
        settings.jira.url = Some(String::new());
        assert_eq!(settings.jira_url(), None);
        settings.jira.url = Some("https://jira.example.com".to_string());
        assert_eq!(settings.jira_url(), Some("https://jira.example.com"));
    }
}
