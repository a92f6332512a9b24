use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("配额 {quota_name} 已超限，{retry_after_seconds} 秒后可重试")]
    QuotaExceeded {
        quota_name: String,
        retry_after_seconds: i64,
    },

    #[error("配额服务初始化超时: {0}")]
    QuotaInit(String),

    #[error("后端请求失败: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "quotaName")]
    quota_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "retryAfterSeconds")]
    retry_after_seconds: Option<i64>,
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty) = match &self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, Some("bad_request".to_string())),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, Some("not_found".to_string())),
            AppError::QuotaExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                Some("quota_exceeded".to_string()),
            ),
            AppError::QuotaInit(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("quota_init".to_string()),
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("config".to_string()),
            ),
            AppError::Backend(_) => (StatusCode::BAD_GATEWAY, Some("backend".to_string())),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, Some("io".to_string())),
            AppError::Anyhow(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("internal".to_string()),
            ),
        };

        let (quota_name, retry_after) = match &self {
            AppError::QuotaExceeded {
                quota_name,
                retry_after_seconds,
            } => (Some(quota_name.clone()), Some(*retry_after_seconds)),
            _ => (None, None),
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: ty,
                quota_name,
                retry_after_seconds: retry_after,
            },
        };

        let mut resp = (status, Json(body)).into_response();
        if let Some(secs) = retry_after
            && let Ok(v) = header::HeaderValue::from_str(&secs.to_string())
        {
            resp.headers_mut().insert(header::RETRY_AFTER, v);
        }
        resp
    }
}
