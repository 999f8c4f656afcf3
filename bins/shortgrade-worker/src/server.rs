// Webhook ingress: POST /webhook feeds the intake queue, GET /health reports it.
use crate::intake::{AdmissionPolicy, IntakeQueue, Rejection};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use shortgrade_common::types::PushEvent;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<IntakeQueue>,
    pub policy: Arc<AdmissionPolicy>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn webhook(State(state): State<AppState>, Json(event): Json<PushEvent>) -> (StatusCode, Json<Value>) {
    let repo_id = event.repository.name.trim().to_string();
    if repo_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "rejected", "reason": "missing repository name" })),
        );
    }

    if let Err(reason) = state.policy.admit(&event) {
        if reason == Rejection::InvalidRepository {
            warn!(repo = %repo_id, "Push with invalid repository name rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "rejected", "reason": reason.to_string() })),
            );
        }
        debug!(repo = %repo_id, %reason, "Push ignored");
        return (
            StatusCode::OK,
            Json(json!({ "status": "ignored", "reason": reason.to_string() })),
        );
    }

    if state.intake.submit(&repo_id) {
        info!(repo = %repo_id, "Grading requested");
        (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "repository": repo_id })),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({ "status": "already_queued", "repository": repo_id })),
        )
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "pending": state.intake.pending() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::GradingJob;
    use async_trait::async_trait;
    use shortgrade_common::types::{CommitInfo, PusherInfo, RepositoryInfo};

    struct IdleJob;

    #[async_trait]
    impl GradingJob for IdleJob {
        async fn run(&self, _repo_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn state() -> AppState {
        AppState {
            intake: Arc::new(IntakeQueue::start(Arc::new(IdleJob), 1)),
            policy: Arc::new(AdmissionPolicy {
                main_ref: "refs/heads/main".to_string(),
                admin: "grading-bot".to_string(),
                keyword: "grademe".to_string(),
            }),
        }
    }

    fn push(repo: &str, git_ref: &str, message: &str) -> PushEvent {
        PushEvent {
            git_ref: git_ref.to_string(),
            repository: RepositoryInfo { name: repo.to_string() },
            pusher: PusherInfo {
                name: "alice".to_string(),
            },
            head_commit: Some(CommitInfo {
                message: message.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_admitted_push_is_queued() {
        let state = state();
        let (status, Json(body)) = webhook(State(state.clone()), Json(push("alice-00", "refs/heads/main", "grademe"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["repository"], "alice-00");
        state.intake.shutdown().await;
    }

    #[tokio::test]
    async fn test_filtered_push_is_ignored() {
        let state = state();
        let (status, Json(body)) = webhook(State(state.clone()), Json(push("alice-00", "refs/heads/feature", "grademe"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ignored");
        assert_eq!(state.intake.pending(), 0);
        state.intake.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_repository_is_rejected() {
        let state = state();
        let (status, _) = webhook(State(state.clone()), Json(push("  ", "refs/heads/main", "grademe"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        state.intake.shutdown().await;
    }

    #[tokio::test]
    async fn test_path_like_repository_is_rejected() {
        let state = state();
        let (status, Json(body)) =
            webhook(State(state.clone()), Json(push("../../escape/alice-00", "refs/heads/main", "grademe"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "rejected");
        assert_eq!(state.intake.pending(), 0);
        state.intake.shutdown().await;
    }

    #[tokio::test]
    async fn test_health() {
        let state = state();
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pending"], 0);
        state.intake.shutdown().await;
    }
}
