//! HTTP 接口层：先评估配额，再转发给调度门面；对端计量的接收端点也在这里。

use crate::error::AppError;
use crate::quota::types::{QuotaEvaluationResult, RemoteMetricUpdate, UserIdentity};
use crate::quota::QuotaEnforcer;
use crate::scheduler::types::{TextOperationRequest, TextOperationResult};
use crate::scheduler::GatewayScheduler;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// 配额作用域的 API 名称。
const API_NAME: &str = "gateway";

pub struct AppState {
    pub enforcer: Arc<QuotaEnforcer>,
    pub gateway: Arc<GatewayScheduler>,
}

pub async fn handle_start_embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TextOperationRequest>,
) -> Result<Json<TextOperationResult>, AppError> {
    let identity = identity_from_headers(&headers);
    let evaluation = state
        .enforcer
        .evaluate_raw_request(API_NAME, "embeddings", &identity)?;
    reject_if_exceeded(evaluation)?;

    let result = state.gateway.start_embedding_operation(request).await?;
    Ok(Json(result))
}

pub async fn handle_get_embeddings(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<String>,
) -> Result<Json<TextOperationResult>, AppError> {
    let result = state
        .gateway
        .get_embedding_operation_result(&operation_id)
        .await?;
    Ok(Json(result))
}

pub async fn handle_start_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TextOperationRequest>,
) -> Result<Json<TextOperationResult>, AppError> {
    let identity = identity_from_headers(&headers);
    let agent_name = request.agent_name.clone().unwrap_or_default();
    let evaluation = state.enforcer.evaluate_completion_request(
        API_NAME,
        "completions",
        &agent_name,
        &identity,
    )?;
    reject_if_exceeded(evaluation)?;

    let result = state.gateway.start_completion_operation(request).await?;
    Ok(Json(result))
}

pub async fn handle_get_completions(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<String>,
) -> Result<Json<TextOperationResult>, AppError> {
    let result = state
        .gateway
        .get_completion_operation_result(&operation_id)
        .await?;
    Ok(Json(result))
}

/// 对端实例广播的远端计量入口。
pub async fn handle_quota_metrics(
    State(state): State<Arc<AppState>>,
    Json(updates): Json<Vec<RemoteMetricUpdate>>,
) -> StatusCode {
    state.enforcer.apply_remote_updates(&updates);
    StatusCode::NO_CONTENT
}

fn identity_from_headers(headers: &HeaderMap) -> UserIdentity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    UserIdentity {
        user_id: header("x-user-id"),
        user_principal_name: header("x-user-principal-name"),
    }
}

fn reject_if_exceeded(evaluation: QuotaEvaluationResult) -> Result<(), AppError> {
    if evaluation.quota_exceeded {
        return Err(AppError::QuotaExceeded {
            quota_name: evaluation.quota_name.unwrap_or_default(),
            retry_after_seconds: evaluation.time_until_retry_seconds,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn identity_extracted_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u-42"));
        headers.insert(
            "x-user-principal-name",
            HeaderValue::from_static("johndoe@example.com"),
        );
        let identity = identity_from_headers(&headers);
        assert_eq!(identity.user_id.as_deref(), Some("u-42"));
        assert_eq!(
            identity.user_principal_name.as_deref(),
            Some("johndoe@example.com")
        );

        let empty = identity_from_headers(&HeaderMap::new());
        assert!(empty.user_id.is_none());
        assert!(empty.user_principal_name.is_none());
    }

    #[test]
    fn exceeded_evaluation_maps_to_quota_error() {
        let result = QuotaEvaluationResult::exceeded("CompletionsPerUser", "api:completions", 35);
        let err = reject_if_exceeded(result).unwrap_err();
        match err {
            AppError::QuotaExceeded {
                quota_name,
                retry_after_seconds,
            } => {
                assert_eq!(quota_name, "CompletionsPerUser");
                assert_eq!(retry_after_seconds, 35);
            }
            other => panic!("意外的错误类型: {other:?}"),
        }

        assert!(reject_if_exceeded(QuotaEvaluationResult::not_exceeded()).is_ok());
    }
}
