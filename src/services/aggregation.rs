//! Aggregation service.
//!
//! Entry point of the engine. One call resolves the current user, fetches
//! and enriches every configured project, runs the derivation passes, then
//! groups, filters and sorts the result:
//!
//! ```text
//! current user -> projects/MRs/rules -> discussions -> derive
//!              -> group -> summaries -> filter -> sort
//! ```
//!
//! A single coarse lock guards the settings snapshot, the cached current
//! user and the project metadata memo. It is never held across a network
//! call except for the one-time current user lookup.

use crate::error::AppError;
use crate::models::{Filter, MergeRequestsGroup, Settings, User};
use crate::services::fetch::{absolute_url, Fetcher, WorkerPool};
use crate::services::gitlab_client::{GitLabApi, GitLabProject};
use crate::services::grouping::{
    fill_group_summaries, filter_merge_requests, group_merge_requests, sort_by_creation,
};
use crate::services::pipeline::{derive, DerivationContext};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Shared mutable state of the service.
#[derive(Debug, Default)]
pub(crate) struct ServiceState {
    pub(crate) settings: Arc<Settings>,
    pub(crate) current_user: Option<User>,
    pub(crate) projects_by_id: HashMap<i64, GitLabProject>,
}

/// Builds the grouped merge request view for the dashboard.
pub struct AggregationService {
    api: Arc<dyn GitLabApi>,
    pool: WorkerPool,
    state: Arc<Mutex<ServiceState>>,
}

impl AggregationService {
    /// Create a service with empty settings and a pool of `workers` slots.
    pub fn new(api: Arc<dyn GitLabApi>, workers: usize) -> Self {
        Self {
            api,
            pool: WorkerPool::new(workers),
            state: Arc::new(Mutex::new(ServiceState::default())),
        }
    }

    /// Replace the settings used by subsequent calls.
    ///
    /// Calls already running keep the snapshot they started with.
    pub async fn update_settings(&self, settings: Settings) {
        let groups = settings.groups.len();
        let projects: usize = settings.groups.iter().map(|g| g.projects.len()).sum();
        self.state.lock().await.settings = Arc::new(settings);
        log::info!(
            "[aggregation] Settings updated: {} group(s), {} project(s)",
            groups,
            projects
        );
    }

    /// Current settings snapshot.
    pub async fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.state.lock().await.settings)
    }

    /// The cached current user, if already resolved.
    pub async fn current_user(&self) -> Option<User> {
        self.state.lock().await.current_user.clone()
    }

    /// Number of projects whose metadata is memoized.
    pub async fn cached_project_count(&self) -> usize {
        self.state.lock().await.projects_by_id.len()
    }

    /// Worker pool width.
    pub fn workers(&self) -> usize {
        self.pool.width()
    }

    /// Build the grouped, filtered view of every tracked merge request.
    ///
    /// Fails as a whole if any GitLab call fails or `cancel` fires; no
    /// partial result is ever returned.
    pub async fn get_merge_requests(
        &self,
        filter: &Filter,
        cancel: &CancellationToken,
    ) -> Result<Vec<MergeRequestsGroup>, AppError> {
        let start = Instant::now();

        let (user, settings) = {
            let mut state = self.state.lock().await;
            let user = match &state.current_user {
                Some(user) => user.clone(),
                None => {
                    let user = self.resolve_current_user(cancel).await?;
                    state.current_user = Some(user.clone());
                    user
                }
            };
            (user, Arc::clone(&state.settings))
        };

        let fetcher = Fetcher {
            api: &self.api,
            pool: &self.pool,
            state: &self.state,
            cancel,
            current_username: &user.username,
        };

        let projects = fetcher.enrich_projects(settings.projects()).await?;
        let projects = fetcher.enrich_discussions(projects).await?;

        let ctx = DerivationContext {
            current_username: &user.username,
            jira_url: settings.jira_url(),
            now: Utc::now(),
        };
        let projects = derive(projects, &ctx);

        let groups = fill_group_summaries(group_merge_requests(projects));
        let groups = filter_merge_requests(groups, &user.username, filter);
        let groups = sort_by_creation(groups);

        log::debug!(
            "[aggregation] Built {} group(s) with {} merge request(s) in {}ms",
            groups.len(),
            groups.iter().map(|g| g.merge_requests.len()).sum::<usize>(),
            start.elapsed().as_millis()
        );

        Ok(groups)
    }

    async fn resolve_current_user(&self, cancel: &CancellationToken) -> Result<User, AppError> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::cancelled("Aggregation cancelled")),
            result = self.api.get_current_user() => result,
        };
        let fetched = fetched.map_err(|e| AppError::in_phase("get current user", e))?;

        log::info!("[aggregation] Resolved current user {}", fetched.username);

        Ok(User {
            avatar_url: absolute_url(
                self.api.base_url(),
                fetched.avatar_url.as_deref().unwrap_or_default(),
            ),
            web_url: fetched.web_url.unwrap_or_default(),
            is_owner: false,
            is_me: true,
            username: fetched.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupSettings, ProjectSettings};
    use crate::services::gitlab_client::{
        GitLabApprovalRule, GitLabDiscussion, GitLabMergeRequest, GitLabUser,
    };
    use async_trait::async_trait;

    struct EmptyGitLab;

    #[async_trait]
    impl GitLabApi for EmptyGitLab {
        fn base_url(&self) -> &str {
            "https://gitlab.example.com"
        }

        async fn get_current_user(&self) -> Result<GitLabUser, AppError> {
            Ok(GitLabUser {
                username: "alice".to_string(),
                name: None,
                avatar_url: Some("/uploads/alice.png".to_string()),
                web_url: None,
            })
        }

        async fn get_project(&self, id: i64) -> Result<GitLabProject, AppError> {
            Ok(GitLabProject {
                id,
                name: format!("p{}", id),
                path_with_namespace: format!("team/p{}", id),
                web_url: format!("/team/p{}", id),
            })
        }

        async fn get_project_merge_requests(
            &self,
            _path: &str,
        ) -> Result<Vec<GitLabMergeRequest>, AppError> {
            Ok(vec![])
        }

        async fn get_approval_rules(
            &self,
            _project_id: i64,
        ) -> Result<Vec<GitLabApprovalRule>, AppError> {
            Ok(vec![])
        }

        async fn get_merge_request_discussions(
            &self,
            _project_id: i64,
            _iid: i64,
        ) -> Result<Vec<GitLabDiscussion>, AppError> {
            Ok(vec![])
        }
    }

    fn settings() -> Settings {
        Settings {
            groups: vec![GroupSettings {
                name: "Backend".to_string(),
                projects: vec![ProjectSettings {
                    id: 7,
                    name: "api".to_string(),
                }],
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_settings_yield_no_groups() {
        let service = AggregationService::new(Arc::new(EmptyGitLab), 4);
        let groups = service
            .get_merge_requests(&Filter::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn test_current_user_is_cached_with_absolute_avatar() {
        let service = AggregationService::new(Arc::new(EmptyGitLab), 4);
        assert!(service.current_user().await.is_none());

        service
            .get_merge_requests(&Filter::default(), &CancellationToken::new())
            .await
            .unwrap();

        let user = service.current_user().await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.is_me);
        assert_eq!(
            user.avatar_url,
            "https://gitlab.example.com/uploads/alice.png"
        );
    }

    #[tokio::test]
    async fn test_update_settings_swaps_snapshot() {
        let service = AggregationService::new(Arc::new(EmptyGitLab), 4);
        let before = service.settings().await;
        service.update_settings(settings()).await;

        assert!(before.groups.is_empty());
        assert_eq!(service.settings().await.groups.len(), 1);

        let groups = service
            .get_merge_requests(&Filter::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_name, "Backend");
        assert_eq!(service.cached_project_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let service = AggregationService::new(Arc::new(EmptyGitLab), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .get_merge_requests(&Filter::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(service.current_user().await.is_none());
    }

    #[test]
    fn test_worker_width_has_floor() {
        let service = AggregationService::new(Arc::new(EmptyGitLab), 0);
        assert_eq!(service.workers(), 1);
    }
}
