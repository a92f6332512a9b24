use crate::backend::TextOperationService;
use crate::config::{AccountConfig, Config};
use crate::error::AppError;
use crate::scheduler::deployment::DeploymentCapacityTracker;
use crate::scheduler::model::{CycleTiming, ModelScheduler};
use crate::scheduler::operation::OperationContext;
use crate::scheduler::types::{
    DEFAULT_EMBEDDING_DIMENSIONS, OperationKind, TextOperationRequest, TextOperationResult,
};
use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 只支持默认维度的旧版嵌入模型。
const LEGACY_FIXED_DIMENSIONS_MODELS: &[&str] = &["text-embedding-ada-002"];

/// 结果缓存的容量上限。
const OPERATION_CACHE_CAPACITY: u64 = 100_000;

/// 文本操作网关：按模型分组的调度器集合与操作结果缓存。
///
/// Start* 立即返回进行中状态，调用方通过 Get* 轮询；终态结果按
/// time-to-idle 逐出（调度队列持有自己的强引用，逐出不会中断在途工作）。
pub struct GatewayScheduler {
    embedding_schedulers: HashMap<String, Arc<ModelScheduler>>,
    completion_schedulers: HashMap<String, Arc<ModelScheduler>>,
    embedding_operations: Cache<String, Arc<OperationContext>>,
    completion_operations: Cache<String, Arc<OperationContext>>,
    timing: CycleTiming,
}

impl GatewayScheduler {
    pub fn new(
        accounts: &[AccountConfig],
        cfg: &Config,
        service: Arc<dyn TextOperationService>,
    ) -> Self {
        let mut embedding_trackers: HashMap<String, Vec<DeploymentCapacityTracker>> =
            HashMap::new();
        let mut completion_trackers: HashMap<String, Vec<DeploymentCapacityTracker>> =
            HashMap::new();

        for account in accounts {
            for deployment in &account.deployments {
                let tracker = |kind| {
                    DeploymentCapacityTracker::new(
                        account,
                        deployment.clone(),
                        kind,
                        cfg.token_rate_limit_multiplier,
                        service.clone(),
                    )
                };
                if deployment.can_do_embeddings {
                    embedding_trackers
                        .entry(deployment.model_name.clone())
                        .or_default()
                        .push(tracker(OperationKind::Embedding));
                }
                if deployment.can_do_completions {
                    completion_trackers
                        .entry(deployment.model_name.clone())
                        .or_default()
                        .push(tracker(OperationKind::Completion));
                }
            }
        }

        let build = |trackers: HashMap<String, Vec<DeploymentCapacityTracker>>| {
            trackers
                .into_iter()
                .map(|(model_name, trackers)| {
                    tracing::info!(
                        "模型 {model_name} 注册 {} 个部署容量跟踪器",
                        trackers.len()
                    );
                    let scheduler = Arc::new(ModelScheduler::new(model_name.clone(), trackers));
                    (model_name, scheduler)
                })
                .collect::<HashMap<_, _>>()
        };

        let ttl = Duration::from_secs(cfg.result_idle_ttl_seconds);
        let cache = || {
            Cache::builder()
                .max_capacity(OPERATION_CACHE_CAPACITY)
                .time_to_idle(ttl)
                .build()
        };

        Self {
            embedding_schedulers: build(embedding_trackers),
            completion_schedulers: build(completion_trackers),
            embedding_operations: cache(),
            completion_operations: cache(),
            timing: CycleTiming {
                interval: Duration::from_millis(cfg.cycle_interval_ms),
                idle_interval: Duration::from_millis(cfg.idle_cycle_interval_ms),
                idle_after: Duration::from_secs(cfg.idle_after_seconds),
            },
        }
    }

    /// 启动全部模型的调度循环。
    pub fn spawn_scheduling_loops(&self, shutdown: watch::Receiver<bool>) {
        for scheduler in self
            .embedding_schedulers
            .values()
            .chain(self.completion_schedulers.values())
        {
            tokio::spawn(scheduler.clone().run(self.timing, shutdown.clone()));
        }
    }

    pub async fn start_embedding_operation(
        &self,
        request: TextOperationRequest,
    ) -> Result<TextOperationResult, AppError> {
        self.start_operation(OperationKind::Embedding, request).await
    }

    pub async fn start_completion_operation(
        &self,
        request: TextOperationRequest,
    ) -> Result<TextOperationResult, AppError> {
        self.start_operation(OperationKind::Completion, request).await
    }

    pub async fn get_embedding_operation_result(
        &self,
        operation_id: &str,
    ) -> Result<TextOperationResult, AppError> {
        match self.embedding_operations.get(operation_id).await {
            Some(op) => Ok(op.snapshot()),
            None => Err(AppError::not_found(format!("未知的嵌入操作: {operation_id}"))),
        }
    }

    pub async fn get_completion_operation_result(
        &self,
        operation_id: &str,
    ) -> Result<TextOperationResult, AppError> {
        match self.completion_operations.get(operation_id).await {
            Some(op) => Ok(op.snapshot()),
            None => Err(AppError::not_found(format!("未知的补全操作: {operation_id}"))),
        }
    }

    /// 启动操作并立即返回快照。快照状态为 Queued（已受理、等待首次准入），
    /// 对轮询方而言与 InProgress 同为非终态。
    async fn start_operation(
        &self,
        kind: OperationKind,
        request: TextOperationRequest,
    ) -> Result<TextOperationResult, AppError> {
        validate_request(kind, &request)?;

        let schedulers = match kind {
            OperationKind::Embedding => &self.embedding_schedulers,
            OperationKind::Completion => &self.completion_schedulers,
        };
        let Some(scheduler) = schedulers.get(&request.model_name) else {
            return Err(AppError::not_found(format!(
                "模型 {} 未配置任何部署",
                request.model_name
            )));
        };

        let operation_id = uuid::Uuid::new_v4().to_string().to_lowercase();
        let operation = Arc::new(OperationContext::new(
            operation_id.clone(),
            kind,
            request.prioritized,
            request.model_name,
            request.model_parameters,
            request.text_chunks,
        ));

        let cache = match kind {
            OperationKind::Embedding => &self.embedding_operations,
            OperationKind::Completion => &self.completion_operations,
        };
        cache.insert(operation_id, operation.clone()).await;
        scheduler.enqueue(operation.clone());

        Ok(operation.snapshot())
    }
}

fn validate_request(
    kind: OperationKind,
    request: &TextOperationRequest,
) -> Result<(), AppError> {
    if request.text_chunks.is_empty() {
        return Err(AppError::bad_request("文本块列表不能为空"));
    }

    let mut positions = HashSet::new();
    for chunk in &request.text_chunks {
        if !positions.insert(chunk.position) {
            return Err(AppError::bad_request(format!(
                "文本块位置 {} 重复",
                chunk.position
            )));
        }
    }

    if kind == OperationKind::Embedding
        && LEGACY_FIXED_DIMENSIONS_MODELS.contains(&request.model_name.as_str())
        && request.model_parameters.embedding_dimensions != DEFAULT_EMBEDDING_DIMENSIONS
    {
        return Err(AppError::bad_request(format!(
            "模型 {} 不支持指定嵌入维度",
            request.model_name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchRequest, BatchResult};
    use crate::config::DeploymentConfig;
    use crate::scheduler::types::{ModelParameters, OperationStatus, TextChunk};
    use async_trait::async_trait;

    struct EchoService;

    #[async_trait]
    impl TextOperationService for EchoService {
        async fn execute(&self, request: &BatchRequest) -> BatchResult {
            let chunks = request
                .chunks
                .iter()
                .map(|c| {
                    let mut c = c.clone();
                    c.embedding = Some(vec![0.0]);
                    c
                })
                .collect();
            BatchResult::success(chunks)
        }
    }

    fn config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            timeout_ms: 1_000,
            backend_api_key: String::new(),
            data_dir: "./data".to_string(),
            accounts_file: String::new(),
            token_rate_limit_multiplier: 1.0,
            cycle_interval_ms: 100,
            idle_cycle_interval_ms: 1_000,
            idle_after_seconds: 60,
            result_idle_ttl_seconds: 1_800,
            quota_peers: Vec::new(),
            debug: "off".to_string(),
        }
    }

    fn accounts() -> Vec<AccountConfig> {
        vec![AccountConfig {
            name: "acc".to_string(),
            endpoint: "https://example".to_string(),
            deployments: vec![
                DeploymentConfig {
                    name: "embed-1".to_string(),
                    model_name: "text-embedding-3-small".to_string(),
                    model_version: "1".to_string(),
                    can_do_embeddings: true,
                    can_do_completions: false,
                    token_rate_limit: 120_000,
                    token_rate_renewal_period_seconds: 60,
                    request_rate_limit: 600,
                    request_rate_renewal_period_seconds: 60,
                },
                DeploymentConfig {
                    name: "ada-1".to_string(),
                    model_name: "text-embedding-ada-002".to_string(),
                    model_version: "2".to_string(),
                    can_do_embeddings: true,
                    can_do_completions: false,
                    token_rate_limit: 120_000,
                    token_rate_renewal_period_seconds: 60,
                    request_rate_limit: 600,
                    request_rate_renewal_period_seconds: 60,
                },
            ],
        }]
    }

    fn gateway() -> GatewayScheduler {
        GatewayScheduler::new(&accounts(), &config(), Arc::new(EchoService))
    }

    fn request(model: &str, chunks: Vec<TextChunk>) -> TextOperationRequest {
        TextOperationRequest {
            model_name: model.to_string(),
            text_chunks: chunks,
            prioritized: false,
            model_parameters: ModelParameters::default(),
            agent_name: None,
        }
    }

    fn chunk(position: u32) -> TextChunk {
        TextChunk {
            operation_id: None,
            position,
            content: Some("text".to_string()),
            tokens_count: 3,
            embedding: None,
            completion: None,
        }
    }

    #[tokio::test]
    async fn start_returns_queued_operation_with_uuid() {
        let gateway = gateway();
        let result = gateway
            .start_embedding_operation(request("text-embedding-3-small", vec![chunk(1)]))
            .await
            .unwrap();

        assert_eq!(result.status, OperationStatus::Queued);
        assert_eq!(result.operation_id, result.operation_id.to_lowercase());
        assert!(uuid::Uuid::parse_str(&result.operation_id).is_ok());

        // 结果立即可轮询。
        let polled = gateway
            .get_embedding_operation_result(&result.operation_id)
            .await
            .unwrap();
        assert_eq!(polled.operation_id, result.operation_id);
    }

    #[tokio::test]
    async fn empty_chunk_list_is_rejected() {
        let err = gateway()
            .start_embedding_operation(request("text-embedding-3-small", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn duplicate_positions_are_rejected() {
        let err = gateway()
            .start_embedding_operation(request(
                "text-embedding-3-small",
                vec![chunk(1), chunk(1)],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unknown_model_is_not_found_and_leaves_no_state() {
        let gateway = gateway();
        let err = gateway
            .start_embedding_operation(request("no-such-model", vec![chunk(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(gateway.embedding_operations.entry_count(), 0);
    }

    #[tokio::test]
    async fn legacy_model_rejects_explicit_dimensions() {
        let mut req = request("text-embedding-ada-002", vec![chunk(1)]);
        req.model_parameters.embedding_dimensions = 1536;
        let err = gateway()
            .start_embedding_operation(req)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        // 默认维度（-1）可以通过。
        let ok = gateway()
            .start_embedding_operation(request("text-embedding-ada-002", vec![chunk(1)]))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn unknown_operation_id_is_not_found() {
        let err = gateway()
            .get_completion_operation_result("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
