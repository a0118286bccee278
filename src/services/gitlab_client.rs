//! GitLab API client.
//!
//! Provides the read calls the aggregation engine needs: REST v4 endpoints
//! for users, projects, approval rules and discussions, and one GraphQL query
//! for a project's open merge requests. Only the first page of any listing
//! is fetched.

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Number of items requested per listing page.
const PER_PAGE: &str = "100";

/// GraphQL query for the open merge requests of one project.
const PROJECT_MERGE_REQUESTS_QUERY: &str = r#"
query($fullPath: ID!) {
  project(fullPath: $fullPath) {
    mergeRequests(state: opened) {
      nodes {
        iid
        createdAt
        webUrl
        conflicts
        title
        author { username avatarUrl webUrl }
        approvedBy { nodes { username avatarUrl webUrl } }
        headPipeline { status }
        diffStatsSummary { additions deletions fileCount }
      }
    }
  }
}
"#;

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitLabClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// GitLab user from API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GitLabUser {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// GitLab project from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabProject {
    pub id: i64,
    pub name: String,
    pub path_with_namespace: String,
    pub web_url: String,
}

/// Project approval rule from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabApprovalRule {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub rule_type: Option<String>,
    #[serde(default)]
    pub approvals_required: i64,
    #[serde(default)]
    pub eligible_approvers: Vec<GitLabUser>,
}

/// GitLab discussion from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabDiscussion {
    pub id: String,
    #[serde(default)]
    pub individual_note: bool,
    pub notes: Vec<GitLabNote>,
}

/// GitLab discussion note from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabNote {
    pub id: i64,
    pub body: String,
    pub author: GitLabUser,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub resolvable: bool,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub resolved_by: Option<GitLabUser>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Diff size summary of a merge request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitLabDiffStats {
    pub additions: i64,
    pub deletions: i64,
    pub file_count: i64,
}

/// Open merge request as returned by the project merge requests query.
#[derive(Debug, Clone)]
pub struct GitLabMergeRequest {
    pub iid: i64,
    pub title: String,
    pub web_url: String,
    pub created_at: DateTime<Utc>,
    pub conflicts: bool,
    pub author: GitLabUser,
    pub approved_by: Vec<GitLabUser>,
    /// Head pipeline status as reported by GitLab (e.g. `SUCCESS`).
    pub head_pipeline_status: Option<String>,
    pub diff_stats: Option<GitLabDiffStats>,
}

/// Read operations the aggregation engine consumes.
///
/// Every call either returns typed records or an error that aborts the
/// aggregation call it belongs to.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// Base URL used to absolutize relative URLs returned by GitLab.
    fn base_url(&self) -> &str;

    async fn get_current_user(&self) -> Result<GitLabUser, AppError>;

    async fn get_project(&self, project_id: i64) -> Result<GitLabProject, AppError>;

    async fn get_project_merge_requests(
        &self,
        project_path: &str,
    ) -> Result<Vec<GitLabMergeRequest>, AppError>;

    async fn get_approval_rules(&self, project_id: i64)
        -> Result<Vec<GitLabApprovalRule>, AppError>;

    async fn get_merge_request_discussions(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<Vec<GitLabDiscussion>, AppError>;
}

// GraphQL wire types.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: ProjectVariables<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectVariables<'a> {
    full_path: &'a str,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct ProjectData {
    project: Option<ProjectNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectNode {
    merge_requests: Nodes<MergeRequestNode>,
}

#[derive(Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeRequestNode {
    iid: String,
    created_at: DateTime<Utc>,
    web_url: String,
    #[serde(default)]
    conflicts: bool,
    title: String,
    author: GraphQlUser,
    approved_by: Option<Nodes<GraphQlUser>>,
    head_pipeline: Option<PipelineNode>,
    diff_stats_summary: Option<GitLabDiffStats>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlUser {
    username: String,
    avatar_url: Option<String>,
    web_url: Option<String>,
}

#[derive(Deserialize)]
struct PipelineNode {
    status: String,
}

impl From<GraphQlUser> for GitLabUser {
    fn from(user: GraphQlUser) -> Self {
        Self {
            username: user.username,
            name: None,
            avatar_url: user.avatar_url,
            web_url: user.web_url,
        }
    }
}

impl TryFrom<MergeRequestNode> for GitLabMergeRequest {
    type Error = AppError;

    fn try_from(node: MergeRequestNode) -> Result<Self, Self::Error> {
        let iid = node.iid.parse::<i64>().map_err(|_| {
            AppError::gitlab_api(format!("Invalid merge request iid: {}", node.iid))
        })?;

        Ok(Self {
            iid,
            title: node.title,
            web_url: node.web_url,
            created_at: node.created_at,
            conflicts: node.conflicts,
            author: node.author.into(),
            approved_by: node
                .approved_by
                .map(|n| n.nodes.into_iter().map(GitLabUser::from).collect())
                .unwrap_or_default(),
            head_pipeline_status: node.head_pipeline.map(|p| p.status),
            diff_stats: node.diff_stats_summary,
        })
    }
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, AppError> {
        let mut headers = header::HeaderMap::new();

        let token_value = header::HeaderValue::from_str(&config.token)
            .map_err(|_| AppError::authentication("Invalid token format"))?;
        headers.insert("PRIVATE-TOKEN", token_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Get the full URL for a REST API path.
    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v4{}", self.base_url(), path)
    }

    /// Get the GraphQL endpoint URL.
    fn graphql_url(&self) -> String {
        format!("{}/api/graphql", self.base_url())
    }

    /// Handle API response errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, AppError> {
        let status = response.status();

        if status.is_success() {
            response.json::<T>().await.map_err(|e| {
                AppError::gitlab_api_full(
                    format!("Failed to parse response: {}", e),
                    status.as_u16(),
                    endpoint,
                )
            })
        } else if status == StatusCode::UNAUTHORIZED {
            Err(AppError::authentication("GitLab token expired or revoked"))
        } else {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let body_message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    // GitLab returns errors as {"message": "..."} or {"error": "..."}
                    v.get("message").or_else(|| v.get("error")).map(|m| match m.as_str() {
                        Some(s) => s.to_string(),
                        None => m.to_string(),
                    })
                });

            let message = match (status, &body_message) {
                (StatusCode::FORBIDDEN, _) => "Access denied".to_string(),
                (StatusCode::NOT_FOUND, _) => "Resource not found".to_string(),
                (StatusCode::TOO_MANY_REQUESTS, _) => "Rate limit exceeded".to_string(),
                (_, Some(msg)) => msg.clone(),
                _ => format!("Request failed ({}): {}", status_code, body),
            };

            Err(AppError::gitlab_api_full(message, status_code, endpoint))
        }
    }

    /// Make a GET request against a REST endpoint.
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let url = self.api_url(endpoint);
        let response = self.client.get(&url).query(query).send().await?;
        self.handle_response(response, endpoint).await
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    async fn get_current_user(&self) -> Result<GitLabUser, AppError> {
        self.get("/user", &[]).await
    }

    async fn get_project(&self, project_id: i64) -> Result<GitLabProject, AppError> {
        self.get(&format!("/projects/{}", project_id), &[]).await
    }

    async fn get_project_merge_requests(
        &self,
        project_path: &str,
    ) -> Result<Vec<GitLabMergeRequest>, AppError> {
        let endpoint = "/api/graphql";
        let request = GraphQlRequest {
            query: PROJECT_MERGE_REQUESTS_QUERY,
            variables: ProjectVariables {
                full_path: project_path,
            },
        };

        let response = self
            .client
            .post(self.graphql_url())
            .bearer_auth(&self.config.token)
            .json(&request)
            .send()
            .await?;

        let body: GraphQlResponse<ProjectData> = self.handle_response(response, endpoint).await?;

        if let Some(first) = body.errors.first() {
            return Err(AppError::gitlab_api(format!(
                "GraphQL error for project {}: {}",
                project_path, first.message
            )));
        }

        let project = body
            .data
            .and_then(|d| d.project)
            .ok_or_else(|| AppError::gitlab_api(format!("Project not found: {}", project_path)))?;

        project
            .merge_requests
            .nodes
            .into_iter()
            .map(GitLabMergeRequest::try_from)
            .collect()
    }

    async fn get_approval_rules(
        &self,
        project_id: i64,
    ) -> Result<Vec<GitLabApprovalRule>, AppError> {
        self.get(&format!("/projects/{}/approval_rules", project_id), &[])
            .await
    }

    async fn get_merge_request_discussions(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<Vec<GitLabDiscussion>, AppError> {
        let endpoint = format!(
            "/projects/{}/merge_requests/{}/discussions",
            project_id, mr_iid
        );
        self.get(&endpoint, &[("per_page", PER_PAGE), ("page", "1")])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GitLabClient {
        GitLabClient::new(GitLabClientConfig {
            base_url: format!("{}/", server.uri()),
            token: "test-token".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        let client = GitLabClient::new(GitLabClientConfig {
            base_url: "https://gitlab.com/".to_string(),
            token: "test-token".to_string(),
            timeout_secs: 30,
        })
        .unwrap();

        assert_eq!(client.base_url(), "https://gitlab.com");
        assert_eq!(client.api_url("/user"), "https://gitlab.com/api/v4/user");
        assert_eq!(client.graphql_url(), "https://gitlab.com/api/graphql");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let result = GitLabClient::new(GitLabClientConfig {
            base_url: "https://gitlab.com".to_string(),
            token: "bad\ntoken".to_string(),
            timeout_secs: 30,
        });
        assert!(matches!(result, Err(AppError::Authentication { .. })));
    }

    #[tokio::test]
    async fn test_get_current_user_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .and(header("PRIVATE-TOKEN", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 1,
                "username": "alice",
                "name": "Alice",
                "avatar_url": "/uploads/alice.png",
                "web_url": "https://gitlab.example.com/alice"
            })))
            .mount(&server)
            .await;

        let user = client_for(&server).get_current_user().await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.avatar_url.as_deref(), Some("/uploads/alice.png"));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).get_current_user().await.unwrap_err();
        assert!(err.is_authentication());
        assert!(err.to_string().contains("GitLab token expired or revoked"));
    }

    #[tokio::test]
    async fn test_error_body_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/7/approval_rules"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({ "message": "rules unavailable" })),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).get_approval_rules(7).await.unwrap_err();
        match err {
            AppError::GitLabApi {
                message,
                status_code,
                endpoint,
            } => {
                assert_eq!(message, "rules unavailable");
                assert_eq!(status_code, Some(422));
                assert_eq!(endpoint.as_deref(), Some("/projects/7/approval_rules"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discussions_request_first_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/7/merge_requests/3/discussions"))
            .and(query_param("per_page", "100"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "id": "abc",
                    "individual_note": false,
                    "notes": [{
                        "id": 10,
                        "body": "please rename",
                        "author": { "username": "bob" },
                        "created_at": "2024-01-15T10:30:00Z",
                        "system": false,
                        "resolvable": true,
                        "resolved": true,
                        "resolved_by": { "username": "alice" },
                        "resolved_at": "2024-01-16T10:30:00Z"
                    }]
                }
            ])))
            .mount(&server)
            .await;

        let discussions = client_for(&server)
            .get_merge_request_discussions(7, 3)
            .await
            .unwrap();
        assert_eq!(discussions.len(), 1);
        let note = &discussions[0].notes[0];
        assert!(note.resolvable);
        assert_eq!(note.resolved, Some(true));
        assert_eq!(
            note.resolved_by.as_ref().map(|u| u.username.as_str()),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_project_merge_requests_graphql() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "project": {
                        "mergeRequests": {
                            "nodes": [{
                                "iid": "42",
                                "createdAt": "2024-01-15T10:30:00Z",
                                "webUrl": "https://gitlab.example.com/g/p/-/merge_requests/42",
                                "conflicts": true,
                                "title": "Draft: add cache",
                                "author": { "username": "bob", "avatarUrl": "/a.png", "webUrl": null },
                                "approvedBy": { "nodes": [{ "username": "carol", "avatarUrl": null, "webUrl": null }] },
                                "headPipeline": { "status": "SUCCESS" },
                                "diffStatsSummary": { "additions": 10, "deletions": 2, "fileCount": 3 }
                            }, {
                                "iid": "43",
                                "createdAt": "2024-01-16T10:30:00Z",
                                "webUrl": "https://gitlab.example.com/g/p/-/merge_requests/43",
                                "title": "Fix",
                                "author": { "username": "dave", "avatarUrl": null, "webUrl": null },
                                "approvedBy": null,
                                "headPipeline": null,
                                "diffStatsSummary": null
                            }]
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let mrs = client_for(&server)
            .get_project_merge_requests("g/p")
            .await
            .unwrap();

        assert_eq!(mrs.len(), 2);
        assert_eq!(mrs[0].iid, 42);
        assert!(mrs[0].conflicts);
        assert_eq!(mrs[0].approved_by[0].username, "carol");
        assert_eq!(mrs[0].head_pipeline_status.as_deref(), Some("SUCCESS"));
        assert_eq!(mrs[0].diff_stats.map(|d| d.file_count), Some(3));
        assert!(mrs[1].approved_by.is_empty());
        assert!(mrs[1].head_pipeline_status.is_none());
    }

    #[tokio::test]
    async fn test_graphql_errors_fail_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": null,
                "errors": [{ "message": "field does not exist" }]
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_project_merge_requests("g/p")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("field does not exist"));
    }

    #[tokio::test]
    async fn test_graphql_missing_project() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "data": { "project": null } })),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_project_merge_requests("g/missing")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Project not found: g/missing"));
    }
}
