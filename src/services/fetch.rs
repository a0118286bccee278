//! Fetch/enrichment stage.
//!
//! Fans out GitLab calls on a bounded worker pool and merges the results into
//! the per-call project list:
//! - project metadata (memoized for the process lifetime)
//! - open merge requests and approval rules per project
//! - discussions per merge request
//!
//! Each fan-out waits for every submitted task. If any task failed the whole
//! stage fails and nothing it produced is used.

use crate::error::AppError;
use crate::models::{
    Approval, ApprovalRule, DiffStatsSummary, Discussion, MergeRequest, Note, Pipeline, Project,
    ProjectRef, Status, User,
};
use crate::services::aggregation::ServiceState;
use crate::services::gitlab_client::{
    GitLabApi, GitLabApprovalRule, GitLabDiscussion, GitLabMergeRequest, GitLabProject, GitLabUser,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default number of concurrent in-flight GitLab calls.
pub const DEFAULT_WORKERS: usize = 30;

/// Bounded pool shared by every fan-out of the service.
///
/// Work beyond the pool width is queued until a permit frees up.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    width: usize,
}

impl WorkerPool {
    /// Create a pool allowing `width` concurrent tasks (at least one).
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    /// Pool width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Start a new task group whose tasks abort when `cancel` fires.
    pub fn group<T: Send + 'static>(&self, cancel: &CancellationToken) -> TaskGroup<T> {
        TaskGroup {
            tasks: JoinSet::new(),
            permits: Arc::clone(&self.permits),
            cancel: cancel.clone(),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

/// A set of fetch tasks joined together.
///
/// Dropping the group aborts any task still running.
pub struct TaskGroup<T> {
    tasks: JoinSet<Result<T, AppError>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Queue a task on the pool.
    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AppError::cancelled("Aggregation cancelled")),
                result = async {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| AppError::internal("Worker pool closed"))?;
                    task.await
                } => result,
            }
        });
    }

    /// Number of submitted tasks not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks were submitted.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task. Fails with all collected errors if any task failed.
    pub async fn wait(mut self, phase: &str) -> Result<Vec<T>, AppError> {
        let mut results = Vec::with_capacity(self.tasks.len());
        let mut errors = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(AppError::internal(format!("Fetch task failed: {}", e))),
            }
        }

        if errors.is_empty() {
            Ok(results)
        } else {
            log::warn!(
                "[fetch] {}: {} of {} task(s) failed",
                phase,
                errors.len(),
                errors.len() + results.len()
            );
            Err(AppError::fetch_failed(phase, errors))
        }
    }
}

/// Result of one per-project task.
enum ProjectData {
    MergeRequests(i64, Vec<GitLabMergeRequest>),
    Rules(i64, Vec<GitLabApprovalRule>),
}

/// Rewrite a GitLab-relative URL (starting with `/`) against the base URL.
pub fn absolute_url(base_url: &str, url: &str) -> String {
    if url.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), url)
    } else {
        url.to_string()
    }
}

/// Per-call fetch context.
pub(crate) struct Fetcher<'a> {
    pub(crate) api: &'a Arc<dyn GitLabApi>,
    pub(crate) pool: &'a WorkerPool,
    pub(crate) state: &'a Arc<Mutex<ServiceState>>,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) current_username: &'a str,
}

impl Fetcher<'_> {
    /// Fill project URLs, merge requests and approval rules.
    pub async fn enrich_projects(
        &self,
        mut projects: Vec<Project>,
    ) -> Result<Vec<Project>, AppError> {
        let start = Instant::now();

        let mut project_ids: Vec<i64> = projects.iter().map(|p| p.id).collect();
        project_ids.sort_unstable();
        project_ids.dedup();

        let mut group = self.pool.group::<()>(self.cancel);
        for project_id in project_ids.iter().copied() {
            let api = Arc::clone(self.api);
            let state = Arc::clone(self.state);
            group.submit(async move {
                {
                    let state = state.lock().await;
                    if state.projects_by_id.contains_key(&project_id) {
                        return Ok(());
                    }
                }

                let project = api.get_project(project_id).await?;
                state.lock().await.projects_by_id.insert(project_id, project);
                Ok(())
            });
        }
        group.wait("collect projects").await?;

        let metadata: HashMap<i64, GitLabProject> = {
            let state = self.state.lock().await;
            project_ids
                .iter()
                .filter_map(|id| state.projects_by_id.get(id).map(|p| (*id, p.clone())))
                .collect()
        };

        let mut group = self.pool.group::<ProjectData>(self.cancel);
        for (&project_id, meta) in &metadata {
            let path = meta.path_with_namespace.clone();
            let api = Arc::clone(self.api);
            group.submit(async move {
                let mrs = api.get_project_merge_requests(&path).await?;
                Ok(ProjectData::MergeRequests(project_id, mrs))
            });

            let api = Arc::clone(self.api);
            group.submit(async move {
                let rules = api.get_approval_rules(project_id).await?;
                Ok(ProjectData::Rules(project_id, rules))
            });
        }

        let mut mr_by_project = HashMap::with_capacity(metadata.len());
        let mut rules_by_project = HashMap::with_capacity(metadata.len());
        for data in group.wait("collect merge requests").await? {
            match data {
                ProjectData::MergeRequests(id, mrs) => {
                    mr_by_project.insert(id, mrs);
                }
                ProjectData::Rules(id, rules) => {
                    rules_by_project.insert(id, rules);
                }
            }
        }

        for project in &mut projects {
            if let Some(meta) = metadata.get(&project.id) {
                project.web_url = self.absolute(&meta.web_url);
            }

            let reference = project.reference();
            project.merge_requests = mr_by_project
                .get(&project.id)
                .map(|mrs| {
                    mrs.iter()
                        .map(|mr| self.to_merge_request(mr, &reference))
                        .collect()
                })
                .unwrap_or_default();

            project.approval_rules = rules_by_project
                .get(&project.id)
                .map(|rules| rules.iter().map(|r| self.to_rule(r)).collect())
                .unwrap_or_default();
        }

        log::debug!(
            "[fetch] Enriched {} project(s) with {} merge request(s) in {}ms",
            projects.len(),
            projects.iter().map(|p| p.merge_requests.len()).sum::<usize>(),
            start.elapsed().as_millis()
        );

        Ok(projects)
    }

    /// Attach the discussion threads of every merge request.
    pub async fn enrich_discussions(
        &self,
        mut projects: Vec<Project>,
    ) -> Result<Vec<Project>, AppError> {
        let start = Instant::now();

        let mut group = self.pool.group::<((i64, i64), Vec<GitLabDiscussion>)>(self.cancel);
        for project in &projects {
            for mr in &project.merge_requests {
                let key = (project.id, mr.iid);
                let api = Arc::clone(self.api);
                group.submit(async move {
                    let discussions = api.get_merge_request_discussions(key.0, key.1).await?;
                    Ok((key, discussions))
                });
            }
        }
        let submitted = group.len();

        let discussions_by_mr: HashMap<(i64, i64), Vec<GitLabDiscussion>> =
            group.wait("collect discussions").await?.into_iter().collect();

        for project in &mut projects {
            let project_id = project.id;
            for mr in &mut project.merge_requests {
                if let Some(discussions) = discussions_by_mr.get(&(project_id, mr.iid)) {
                    mr.discussions = discussions.iter().map(|d| self.to_discussion(d)).collect();
                }
            }
        }

        log::debug!(
            "[fetch] Collected discussions for {} merge request(s) in {}ms",
            submitted,
            start.elapsed().as_millis()
        );

        Ok(projects)
    }

    fn absolute(&self, url: &str) -> String {
        absolute_url(self.api.base_url(), url)
    }

    fn to_user(&self, user: &GitLabUser) -> User {
        User {
            username: user.username.clone(),
            avatar_url: self.absolute(user.avatar_url.as_deref().unwrap_or_default()),
            web_url: user.web_url.clone().unwrap_or_default(),
            is_owner: false,
            is_me: user.username == self.current_username,
        }
    }

    fn to_merge_request(&self, mr: &GitLabMergeRequest, project: &ProjectRef) -> MergeRequest {
        let mut result =
            MergeRequest::new(mr.iid, project.clone(), mr.created_at, self.to_user(&mr.author));
        result.description = mr.title.clone();
        result.url = mr.web_url.clone();
        result.approvals = mr
            .approved_by
            .iter()
            .map(|u| Approval {
                user: self.to_user(u),
                approved_at: None,
            })
            .collect();
        result.pipeline = Pipeline {
            status: mr
                .head_pipeline_status
                .as_deref()
                .unwrap_or_default()
                .to_lowercase(),
        };
        result.status = Status {
            conflict: mr.conflicts,
            ..Default::default()
        };
        result.diff_stats = mr
            .diff_stats
            .map(|d| DiffStatsSummary {
                additions: d.additions,
                deletions: d.deletions,
                file_count: d.file_count,
            })
            .unwrap_or_default();
        result
    }

    fn to_rule(&self, rule: &GitLabApprovalRule) -> ApprovalRule {
        ApprovalRule {
            name: rule.name.clone(),
            users: rule
                .eligible_approvers
                .iter()
                .map(|u| self.to_user(u))
                .collect(),
        }
    }

    fn to_discussion(&self, discussion: &GitLabDiscussion) -> Discussion {
        Discussion {
            notes: discussion
                .notes
                .iter()
                .map(|note| Note {
                    author: self.to_user(&note.author),
                    resolved_by: note.resolved_by.as_ref().map(|u| self.to_user(u)),
                    resolvable: note.resolvable,
                    resolved: note.resolved.unwrap_or(false),
                    body: note.body.clone(),
                    created_at: note.created_at,
                    resolved_at: note.resolved_at,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_absolute_url() {
        assert_eq!(
            absolute_url("https://gitlab.example.com/", "/uploads/a.png"),
            "https://gitlab.example.com/uploads/a.png"
        );
        assert_eq!(
            absolute_url("https://gitlab.example.com", "https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
        assert_eq!(absolute_url("https://gitlab.example.com", ""), "");
    }

    #[test]
    fn test_pool_width_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).width(), 1);
        assert_eq!(WorkerPool::default().width(), DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut group = pool.group::<usize>(&cancel);
        for i in 0..8 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            group.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            });
        }

        let mut results = group.wait("test").await.unwrap();
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_wait_joins_all_tasks_before_failing() {
        let pool = WorkerPool::new(4);
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let mut group = pool.group::<()>(&cancel);
        group.submit(async { Err(AppError::network("down")) });
        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            group.submit(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let err = group.wait("collect projects").await.unwrap_err();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        match err {
            AppError::FetchFailed { phase, errors } => {
                assert_eq!(phase, "collect projects");
                assert_eq!(errors.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_group_fails_fast() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();

        let mut group = pool.group::<()>(&cancel);
        for _ in 0..3 {
            group.submit(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            });
        }
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), group.wait("collect discussions"))
            .await
            .expect("cancelled group should finish promptly")
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_group_succeeds() {
        let pool = WorkerPool::default();
        let group = pool.group::<()>(&CancellationToken::new());
        assert!(group.is_empty());
        assert!(group.wait("noop").await.unwrap().is_empty());
    }
}
