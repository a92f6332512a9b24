use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 分区键为空或策略为 None 时使用的占位分区。
pub const DEFAULT_PARTITION_ID: &str = "__default__";

/// 配额计量的分区策略：决定同一个配额上下文内如何拆分独立计数器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricPartitionStrategy {
    /// 不分区，整个上下文共用一个计数器。
    None,
    /// 按用户标识分区。
    UserIdentifier,
    /// 按用户主体名称（UPN）分区。
    UserPrincipalName,
}

/// 一条配额定义（quota-store.json 中的一项）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDefinition {
    pub name: String,
    /// 作用域标识，形如 `api:controller` 或 `api:controller:agent`。
    pub context: String,
    #[serde(default)]
    pub description: String,
    pub metric_partition: MetricPartitionStrategy,
    pub metric_limit: u32,
    /// 滑动窗口长度（秒），同时决定桶数量。
    pub metric_window_seconds: u32,
    pub lockout_duration_seconds: u32,
    #[serde(default)]
    pub distributed_enforcement: bool,
}

/// 单次配额评估的结果。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaEvaluationResult {
    pub quota_exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_context: Option<String>,
    pub time_until_retry_seconds: i64,
}

impl QuotaEvaluationResult {
    pub fn not_exceeded() -> Self {
        Self {
            quota_exceeded: false,
            quota_name: None,
            quota_context: None,
            time_until_retry_seconds: 0,
        }
    }

    pub fn exceeded(name: &str, context: &str, retry_after_seconds: i64) -> Self {
        Self {
            quota_exceeded: true,
            quota_name: Some(name.to_string()),
            quota_context: Some(context.to_string()),
            time_until_retry_seconds: retry_after_seconds,
        }
    }
}

/// 请求携带的用户身份，用于选择分区。
#[derive(Debug, Clone, Default)]
pub struct UserIdentity {
    pub user_id: Option<String>,
    pub user_principal_name: Option<String>,
}

/// 分布式执行时发给对端的一组远端计量更新。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetricUpdate {
    pub quota_context: String,
    pub partition_id: String,
    pub metric_timestamps: Vec<DateTime<Utc>>,
}
