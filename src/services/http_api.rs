//! JSON routes for the dashboard frontend.
//!
//! Thin mapping from `AggregationService` results to the response shape the
//! frontend renders. No business logic lives here.

use crate::error::AppError;
use crate::models::{Filter, MergeRequest, MergeRequestsGroup, User};
use crate::services::aggregation::AggregationService;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<AggregationService>,
}

// ── Error handling ───────────────────────────────────────────────────────────

/// JSON error body.
#[derive(Serialize)]
struct ApiError {
    code: String,
    message: String,
}

/// Wrapper to make AppError usable as an axum error response.
struct ApiErr(AppError);

impl ApiErr {
    fn status(&self) -> (StatusCode, &'static str) {
        let err = &self.0;
        if err.is_authentication() {
            return (StatusCode::UNAUTHORIZED, "UNAUTHORIZED");
        }
        if err.is_cancelled() {
            return (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED");
        }
        match err {
            AppError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            AppError::Config { .. } | AppError::Internal { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            _ => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        log::warn!("[server] Request failed ({}): {}", status, self.0);
        (
            status,
            Json(ApiError {
                code: code.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<AppError> for ApiErr {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

// ── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestsResponse {
    pub groups: Vec<GroupResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub name: String,
    pub summary: SummaryResponse,
    pub merge_requests: Vec<MergeRequestResponse>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub total: usize,
    pub overdue: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestResponse {
    pub iid: i64,
    pub description: String,
    pub url: String,
    pub project: ProjectResponse,
    pub author: UserResponse,
    pub approved_by: Vec<UserResponse>,
    pub status: StatusResponse,
    pub comments: CommentsResponse,
    /// Whole days since creation, e.g. `"3d"`.
    pub age: String,
    pub approved_before: bool,
    pub issues: Vec<IssueResponse>,
    pub diff_stats_summary: DiffStatsResponse,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub id: i64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub username: String,
    pub avatar_url: String,
    pub url: String,
    /// Member of the project's owner rule.
    pub trusted: bool,
    pub is_me: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub pipeline_failed: bool,
    pub conflict: bool,
    pub ready: bool,
    pub outdated: bool,
    pub pending: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentsResponse {
    pub resolved_count: usize,
    pub unresolved_count: usize,
}

#[derive(Debug, Serialize)]
pub struct IssueResponse {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStatsResponse {
    pub additions: i64,
    pub deletions: i64,
    pub file_count: i64,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            username: user.username.clone(),
            avatar_url: user.avatar_url.clone(),
            url: user.web_url.clone(),
            trusted: user.is_owner,
            is_me: user.is_me,
        }
    }
}

impl MergeRequestResponse {
    fn from_merge_request(mr: MergeRequest, now: DateTime<Utc>) -> Self {
        Self {
            iid: mr.iid,
            age: format!("{}d", (now - mr.created_at).num_days()),
            project: ProjectResponse {
                id: mr.project.id,
                name: mr.project.name,
                url: mr.project.web_url,
            },
            author: UserResponse::from(&mr.author),
            approved_by: mr.approvals.iter().map(|a| UserResponse::from(&a.user)).collect(),
            status: StatusResponse {
                pipeline_failed: mr.status.pipeline_failed,
                conflict: mr.status.conflict,
                ready: mr.status.ready,
                outdated: mr.status.outdated,
                pending: mr.status.pending,
            },
            comments: CommentsResponse {
                resolved_count: mr.comment_stats.resolved_count,
                unresolved_count: mr.comment_stats.unresolved_count,
            },
            approved_before: mr.approved_before,
            issues: mr
                .issues
                .into_iter()
                .map(|i| IssueResponse {
                    key: i.key,
                    url: i.url,
                })
                .collect(),
            diff_stats_summary: DiffStatsResponse {
                additions: mr.diff_stats.additions,
                deletions: mr.diff_stats.deletions,
                file_count: mr.diff_stats.file_count,
            },
            created_at: mr.created_at,
            description: mr.description,
            url: mr.url,
        }
    }
}

impl MergeRequestsResponse {
    /// Map service output, computing ages against `now`.
    pub fn from_groups(groups: Vec<MergeRequestsGroup>, now: DateTime<Utc>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|group| GroupResponse {
                    name: group.group_name,
                    summary: SummaryResponse {
                        total: group.summary.total,
                        overdue: group.summary.overdue,
                    },
                    merge_requests: group
                        .merge_requests
                        .into_iter()
                        .map(|mr| MergeRequestResponse::from_merge_request(mr, now))
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

// ── Route builder ────────────────────────────────────────────────────────────

/// Build the API routes.
pub fn api_routes() -> Router<ApiState> {
    Router::new()
        .route("/api/v1/merge-requests", get(get_merge_requests))
        .route("/api/v1/health", get(health))
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET /api/v1/merge-requests
///
/// The aggregation is cancelled when the handler future is dropped, which
/// happens when the client disconnects.
async fn get_merge_requests(
    State(state): State<ApiState>,
    Query(filter): Query<Filter>,
) -> Result<Json<MergeRequestsResponse>, ApiErr> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let groups = state.service.get_merge_requests(&filter, &cancel).await?;
    Ok(Json(MergeRequestsResponse::from_groups(groups, Utc::now())))
}

/// GET /api/v1/health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
