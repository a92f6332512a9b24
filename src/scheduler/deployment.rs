use crate::backend::{BatchRequest, TextOperationService};
use crate::config::{AccountConfig, DeploymentConfig};
use crate::scheduler::types::{ModelParameters, OperationKind, TextChunk};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

/// 一个暂存批次，对应一次出站调用：嵌入按上下文键合并文本块，
/// 补全每个文本块单独成批（各自携带模型参数）。
#[derive(Debug)]
struct StagedBatch {
    context_key: i64,
    prioritized: bool,
    model_parameters: ModelParameters,
    chunks: Vec<TextChunk>,
}

impl StagedBatch {
    fn tokens_count(&self) -> u32 {
        self.chunks.iter().map(|c| c.tokens_count).sum()
    }
}

/// 一个批次的执行结果以及受影响的操作。
#[derive(Debug)]
pub struct BatchOutcome {
    pub chunks: Vec<TextChunk>,
    pub failed: bool,
    pub error_message: Option<String>,
    /// 批次失败时，批内全部文本块所属的操作 id（去重）。
    pub failed_operation_ids: Vec<String>,
}

/// 单个模型部署的容量跟踪：token 与请求两个独立滚动预算。
///
/// 计数器只被所属模型的调度循环访问，无需加锁。
pub struct DeploymentCapacityTracker {
    account_name: String,
    account_endpoint: String,
    deployment: DeploymentConfig,
    kind: OperationKind,
    effective_token_limit: u32,
    effective_request_limit: u32,
    service: Arc<dyn TextOperationService>,

    batches: Vec<StagedBatch>,
    batch_index: HashMap<i64, usize>,

    token_window_start: Option<DateTime<Utc>>,
    request_window_start: Option<DateTime<Utc>>,
    projected_tokens: u32,
    actual_tokens: u32,
    projected_requests: u32,
    actual_requests: u32,
}

impl DeploymentCapacityTracker {
    pub fn new(
        account: &AccountConfig,
        deployment: DeploymentConfig,
        kind: OperationKind,
        token_rate_limit_multiplier: f64,
        service: Arc<dyn TextOperationService>,
    ) -> Self {
        // 限额按“每分钟”配置，实际窗口为 renewal period，限额按比例折算。
        let token_divisor = (60 / deployment.token_rate_renewal_period_seconds.clamp(1, 60)).max(1);
        let request_divisor =
            (60 / deployment.request_rate_renewal_period_seconds.clamp(1, 60)).max(1);
        let effective_token_limit =
            (deployment.token_rate_limit as f64 * token_rate_limit_multiplier) as u32
                / token_divisor;
        let effective_request_limit = deployment.request_rate_limit / request_divisor;

        Self {
            account_name: account.name.clone(),
            account_endpoint: account.endpoint.clone(),
            deployment,
            kind,
            effective_token_limit,
            effective_request_limit,
            service,
            batches: Vec::new(),
            batch_index: HashMap::new(),
            token_window_start: None,
            request_window_start: None,
            projected_tokens: 0,
            actual_tokens: 0,
            projected_requests: 0,
            actual_requests: 0,
        }
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment.name
    }

    pub fn has_input(&self) -> bool {
        !self.batches.is_empty()
    }

    /// 尝试把一个文本块准入当前周期。
    ///
    /// 拒绝条件：token 预算不足；需要新批次而请求预算已耗尽。
    /// 嵌入按上下文键合批，同键追加不占新的请求名额；
    /// 补全每个文本块都是一次独立请求，各占一个请求名额。
    pub fn try_admit(
        &mut self,
        now: DateTime<Utc>,
        chunk: &TextChunk,
        context_key: i64,
        model_parameters: &ModelParameters,
        prioritized: bool,
    ) -> bool {
        self.update_rate_windows(now);

        if self.projected_tokens + chunk.tokens_count > self.effective_token_limit {
            return false;
        }

        if self.kind == OperationKind::Completion {
            if self.projected_requests >= self.effective_request_limit {
                return false;
            }
            self.batches.push(StagedBatch {
                context_key,
                prioritized,
                model_parameters: model_parameters.clone(),
                chunks: vec![chunk.clone()],
            });
            self.projected_requests += 1;
        } else {
            match self.batch_index.get(&context_key) {
                Some(&index) => {
                    let batch = &mut self.batches[index];
                    batch.chunks.push(chunk.clone());
                    batch.prioritized |= prioritized;
                }
                None => {
                    if self.projected_requests >= self.effective_request_limit {
                        // 新批次会占用最后一个请求名额，拒绝。
                        return false;
                    }
                    self.batch_index.insert(context_key, self.batches.len());
                    self.batches.push(StagedBatch {
                        context_key,
                        prioritized,
                        model_parameters: model_parameters.clone(),
                        chunks: vec![chunk.clone()],
                    });
                    self.projected_requests += 1;
                }
            }
        }

        self.projected_tokens += chunk.tokens_count;
        true
    }

    /// 执行全部暂存批次：每个批次恰好一次出站调用，批次间并发。
    /// 失败批次不在此处重试，由后续周期重新准入未完成块。
    pub async fn execute(&mut self) -> Vec<BatchOutcome> {
        let staged = std::mem::take(&mut self.batches);
        self.batch_index.clear();
        if staged.is_empty() {
            return Vec::new();
        }

        let mut requests = Vec::with_capacity(staged.len());
        for (i, batch) in staged.into_iter().enumerate() {
            self.actual_requests += 1;
            self.actual_tokens += batch.tokens_count();
            tracing::info!(
                "部署 {} 批次 {}: {} 个文本块，{} tokens（窗口累计 {} 请求 / {} tokens）",
                self.deployment.name,
                i + 1,
                batch.chunks.len(),
                batch.tokens_count(),
                self.actual_requests,
                self.actual_tokens
            );
            requests.push(BatchRequest {
                id: i + 1,
                kind: self.kind,
                account_name: self.account_name.clone(),
                account_endpoint: self.account_endpoint.clone(),
                deployment_name: self.deployment.name.clone(),
                model_name: self.deployment.model_name.clone(),
                model_version: self.deployment.model_version.clone(),
                context_key: batch.context_key,
                prioritized: batch.prioritized,
                model_parameters: batch.model_parameters,
                chunks: batch.chunks,
            });
        }

        let results = join_all(requests.iter().map(|r| self.service.execute(r))).await;

        if self.actual_tokens != self.projected_tokens {
            tracing::warn!(
                "部署 {} 的 token 窗口实际计数 {} 与预估计数 {} 不一致",
                self.deployment.name,
                self.actual_tokens,
                self.projected_tokens
            );
        }
        if self.actual_requests != self.projected_requests {
            tracing::warn!(
                "部署 {} 的请求窗口实际计数 {} 与预估计数 {} 不一致",
                self.deployment.name,
                self.actual_requests,
                self.projected_requests
            );
        }

        requests
            .into_iter()
            .zip(results)
            .map(|(request, result)| {
                let failed_operation_ids = if result.failed {
                    tracing::warn!(
                        "部署 {} 批次 {} 执行失败: {}",
                        self.deployment.name,
                        request.id,
                        result.error_message.as_deref().unwrap_or("未知错误")
                    );
                    let mut ids: Vec<String> = request
                        .chunks
                        .iter()
                        .filter_map(|c| c.operation_id.clone())
                        .collect();
                    ids.sort();
                    ids.dedup();
                    ids
                } else {
                    Vec::new()
                };
                BatchOutcome {
                    chunks: result.chunks,
                    failed: result.failed,
                    error_message: result.error_message,
                    failed_operation_ids,
                }
            })
            .collect()
    }

    /// 刷新滚动窗口：窗口到期时把计数重置为当前暂存量（而非零），
    /// 避免低估已准入但尚未执行的工作。
    fn update_rate_windows(&mut self, now: DateTime<Utc>) {
        let token_renewal = self.deployment.token_rate_renewal_period_seconds as i64;
        if self
            .token_window_start
            .is_none_or(|start| (now - start).num_seconds() >= token_renewal)
        {
            self.token_window_start = Some(now);
            self.projected_tokens = self.batches.iter().map(StagedBatch::tokens_count).sum();
            self.actual_tokens = 0;
        }

        let request_renewal = self.deployment.request_rate_renewal_period_seconds as i64;
        if self
            .request_window_start
            .is_none_or(|start| (now - start).num_seconds() >= request_renewal)
        {
            self.request_window_start = Some(now);
            self.projected_requests = self.batches.len() as u32;
            self.actual_requests = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BatchResult;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::Mutex;

    struct RecordingService {
        requests: Mutex<Vec<BatchRequest>>,
        fail: bool,
    }

    impl RecordingService {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl TextOperationService for RecordingService {
        async fn execute(&self, request: &BatchRequest) -> BatchResult {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return BatchResult::failure("后端返回 429");
            }
            let chunks = request
                .chunks
                .iter()
                .map(|c| {
                    let mut c = c.clone();
                    c.embedding = Some(vec![0.0; 3]);
                    c
                })
                .collect();
            BatchResult::success(chunks)
        }
    }

    fn account() -> AccountConfig {
        AccountConfig {
            name: "acc".to_string(),
            endpoint: "https://example".to_string(),
            deployments: Vec::new(),
        }
    }

    fn deployment(token_limit: u32, request_limit: u32) -> DeploymentConfig {
        DeploymentConfig {
            name: "embed-1".to_string(),
            model_name: "text-embedding-3-small".to_string(),
            model_version: "1".to_string(),
            can_do_embeddings: true,
            can_do_completions: false,
            token_rate_limit: token_limit,
            token_rate_renewal_period_seconds: 60,
            request_rate_limit: request_limit,
            request_rate_renewal_period_seconds: 60,
        }
    }

    fn chunk(position: u32, tokens: u32) -> TextChunk {
        TextChunk {
            operation_id: Some("op-1".to_string()),
            position,
            content: Some("text".to_string()),
            tokens_count: tokens,
            embedding: None,
            completion: None,
        }
    }

    #[test]
    fn token_budget_bounds_admission() {
        let service = RecordingService::new(false);
        let mut tracker =
            DeploymentCapacityTracker::new(&account(), deployment(100, 10), OperationKind::Embedding, 1.0, service);
        let now = Utc::now();
        let params = ModelParameters::default();

        assert!(tracker.try_admit(now, &chunk(1, 60), -1, &params, false));
        assert!(tracker.try_admit(now, &chunk(2, 40), -1, &params, false));
        // 超出 token 预算。
        assert!(!tracker.try_admit(now, &chunk(3, 1), -1, &params, false));
    }

    #[test]
    fn new_batch_key_needs_a_request_slot() {
        let service = RecordingService::new(false);
        let mut tracker =
            DeploymentCapacityTracker::new(&account(), deployment(1000, 1), OperationKind::Embedding, 1.0, service);
        let now = Utc::now();
        let params = ModelParameters::default();

        assert!(tracker.try_admit(now, &chunk(1, 10), 1536, &params, false));
        // 同键批次追加不占新请求名额。
        assert!(tracker.try_admit(now, &chunk(2, 10), 1536, &params, false));
        // 新键批次需要新的请求名额，已耗尽。
        assert!(!tracker.try_admit(now, &chunk(3, 10), 768, &params, false));
    }

    #[test]
    fn multiplier_scales_the_token_limit() {
        let service = RecordingService::new(false);
        let mut tracker =
            DeploymentCapacityTracker::new(&account(), deployment(100, 10), OperationKind::Embedding, 1.2, service);
        let now = Utc::now();
        let params = ModelParameters::default();

        assert!(tracker.try_admit(now, &chunk(1, 120), -1, &params, false));
        assert!(!tracker.try_admit(now, &chunk(2, 1), -1, &params, false));
    }

    #[test]
    fn window_refresh_resets_to_staged_sums() {
        let service = RecordingService::new(false);
        let mut deployment = deployment(100, 10);
        deployment.token_rate_renewal_period_seconds = 10;
        deployment.request_rate_renewal_period_seconds = 10;
        let mut tracker = DeploymentCapacityTracker::new(&account(), deployment, OperationKind::Embedding, 1.0, service);
        let now = Utc::now();
        let params = ModelParameters::default();

        // renewal 10s：折算后的窗口限额为 100/6=16 tokens。
        assert!(tracker.try_admit(now, &chunk(1, 10), -1, &params, false));
        assert!(!tracker.try_admit(now, &chunk(2, 10), -1, &params, false));

        // 窗口到期：计数重置为暂存量（10），仍可再准入 6 tokens。
        let later = now + TimeDelta::seconds(10);
        assert!(tracker.try_admit(later, &chunk(3, 6), -1, &params, false));
        assert!(!tracker.try_admit(later, &chunk(4, 1), -1, &params, false));
    }

    #[tokio::test]
    async fn execute_issues_one_call_per_batch_key() {
        let service = RecordingService::new(false);
        let mut tracker = DeploymentCapacityTracker::new(
            &account(),
            deployment(1000, 10),
            OperationKind::Embedding,
            1.0,
            service.clone(),
        );
        let now = Utc::now();
        let params = ModelParameters::default();

        tracker.try_admit(now, &chunk(1, 10), 1536, &params, false);
        tracker.try_admit(now, &chunk(2, 10), 1536, &params, false);
        tracker.try_admit(now, &chunk(3, 10), 768, &params, false);

        let outcomes = tracker.execute().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.failed));
        assert_eq!(service.requests.lock().unwrap().len(), 2);
        assert!(!tracker.has_input());
    }

    fn completion_deployment(request_limit: u32) -> DeploymentConfig {
        DeploymentConfig {
            name: "chat-1".to_string(),
            model_name: "gpt-4o".to_string(),
            model_version: "1".to_string(),
            can_do_embeddings: false,
            can_do_completions: true,
            token_rate_limit: 1_000,
            token_rate_renewal_period_seconds: 60,
            request_rate_limit: request_limit,
            request_rate_renewal_period_seconds: 60,
        }
    }

    #[tokio::test]
    async fn completion_chunks_keep_their_own_parameters() {
        let service = RecordingService::new(false);
        let mut tracker = DeploymentCapacityTracker::new(
            &account(),
            completion_deployment(10),
            OperationKind::Completion,
            1.0,
            service.clone(),
        );
        let now = Utc::now();

        let mut cold = ModelParameters::default();
        cold.temperature = Some(0.0);
        let mut hot = ModelParameters::default();
        hot.temperature = Some(1.0);

        let mut chunk_b = chunk(1, 10);
        chunk_b.operation_id = Some("op-2".to_string());
        assert!(tracker.try_admit(now, &chunk(1, 10), -1, &cold, false));
        assert!(tracker.try_admit(now, &chunk_b, -1, &hot, false));

        let outcomes = tracker.execute().await;
        assert_eq!(outcomes.len(), 2);

        // 每个补全块一次独立调用，携带自己操作的模型参数。
        let requests = service.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        for request in requests.iter() {
            assert_eq!(request.chunks.len(), 1);
            let expected = match request.chunks[0].operation_id.as_deref() {
                Some("op-1") => 0.0,
                Some("op-2") => 1.0,
                other => panic!("意外的操作 id: {other:?}"),
            };
            assert_eq!(request.model_parameters.temperature, Some(expected));
        }
    }

    #[test]
    fn completion_chunks_each_take_a_request_slot() {
        let service = RecordingService::new(false);
        let mut tracker = DeploymentCapacityTracker::new(
            &account(),
            completion_deployment(1),
            OperationKind::Completion,
            1.0,
            service,
        );
        let now = Utc::now();
        let params = ModelParameters::default();

        assert!(tracker.try_admit(now, &chunk(1, 10), -1, &params, false));
        // 同为哨兵键也不合批，第二个块需要新的请求名额。
        assert!(!tracker.try_admit(now, &chunk(2, 10), -1, &params, false));
    }

    #[tokio::test]
    async fn failed_batch_carries_affected_operation_ids() {
        let service = RecordingService::new(true);
        let mut tracker =
            DeploymentCapacityTracker::new(&account(), deployment(1000, 10), OperationKind::Embedding, 1.0, service);
        let now = Utc::now();
        let params = ModelParameters::default();

        let mut second = chunk(2, 10);
        second.operation_id = Some("op-2".to_string());
        tracker.try_admit(now, &chunk(1, 10), -1, &params, false);
        tracker.try_admit(now, &second, -1, &params, false);

        let outcomes = tracker.execute().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].failed);
        assert_eq!(outcomes[0].failed_operation_ids, vec!["op-1", "op-2"]);
    }
}
