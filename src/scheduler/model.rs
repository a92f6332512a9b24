use crate::scheduler::deployment::{BatchOutcome, DeploymentCapacityTracker};
use crate::scheduler::operation::OperationContext;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// 调度循环的时间参数。
#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    /// 正常周期间隔。
    pub interval: Duration,
    /// 空闲时的周期间隔。
    pub idle_interval: Duration,
    /// 连续无准入多长时间后进入空闲节奏。
    pub idle_after: Duration,
}

impl CycleTiming {
    /// 按距上次准入的时长选择本周期的休眠间隔。
    pub fn sleep_duration(&self, since_last_admitted: Duration) -> Duration {
        if since_last_admitted >= self.idle_after {
            self.idle_interval
        } else {
            self.interval
        }
    }
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            idle_interval: Duration::from_secs(1),
            idle_after: Duration::from_secs(60),
        }
    }
}

/// 一个逻辑模型的调度器：优先级队列 + 该模型的全部部署容量跟踪器。
///
/// 队列由独立互斥锁保护（入队来自 API 线程，其余只有调度循环访问）；
/// 跟踪器计数只被本调度循环触碰，放在异步互斥锁后仅为满足所有权。
pub struct ModelScheduler {
    model_name: String,
    queue: Mutex<VecDeque<Arc<OperationContext>>>,
    trackers: tokio::sync::Mutex<Vec<DeploymentCapacityTracker>>,
}

impl ModelScheduler {
    pub fn new(model_name: String, trackers: Vec<DeploymentCapacityTracker>) -> Self {
        Self {
            model_name,
            queue: Mutex::new(VecDeque::new()),
            trackers: tokio::sync::Mutex::new(trackers),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 入队：普通操作追加队尾，优先操作插入队头。
    pub fn enqueue(&self, operation: Arc<OperationContext>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if operation.prioritized() {
            queue.push_front(operation);
        } else {
            queue.push_back(operation);
        }
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 执行一个调度周期，返回本周期是否有工作被准入。
    pub async fn run_cycle(&self) -> bool {
        self.run_cycle_at(Utc::now()).await
    }

    async fn run_cycle_at(&self, now: chrono::DateTime<Utc>) -> bool {
        // 队列快照（保持顺序），终态操作顺手出队。
        let snapshot: Vec<Arc<OperationContext>> = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.retain(|op| !op.is_terminal());
            queue.iter().cloned().collect()
        };
        if snapshot.is_empty() {
            return false;
        }

        let mut trackers = self.trackers.lock().await;

        // 准入：按队列顺序逐块尝试当前跟踪器，失败则换下一个；
        // 全部跟踪器拒绝后本周期不再扫描（容量短路，不保证跟踪器间公平）。
        let mut current = 0;
        let mut admitted_any = false;
        'operations: for op in &snapshot {
            let pending = op.pending_chunks();
            for chunk in &pending {
                loop {
                    if current >= trackers.len() {
                        break 'operations;
                    }
                    if trackers[current].try_admit(
                        now,
                        chunk,
                        op.context_key(),
                        op.model_parameters(),
                        op.prioritized(),
                    ) {
                        admitted_any = true;
                        op.mark_in_progress();
                        break;
                    }
                    current += 1;
                }
            }
        }

        if !admitted_any {
            return false;
        }

        // 执行：各跟踪器并发调用后端（队列锁之外）。
        let outcomes: Vec<Vec<BatchOutcome>> = join_all(
            trackers
                .iter_mut()
                .filter(|t| t.has_input())
                .map(|t| t.execute()),
        )
        .await;
        drop(trackers);

        // 合并：失败批次按操作记错，成功批次按操作合并输出。
        let by_id: HashMap<&str, &Arc<OperationContext>> = snapshot
            .iter()
            .map(|op| (op.operation_id(), op))
            .collect();

        for outcome in outcomes.into_iter().flatten() {
            if outcome.failed {
                let message = outcome.error_message.as_deref().unwrap_or("未知错误");
                for op_id in &outcome.failed_operation_ids {
                    if let Some(op) = by_id.get(op_id.as_str()) {
                        op.record_intermediate_error(message);
                    }
                }
            } else {
                let mut grouped: HashMap<&str, Vec<&crate::scheduler::types::TextChunk>> =
                    HashMap::new();
                for chunk in &outcome.chunks {
                    if let Some(op_id) = chunk.operation_id.as_deref() {
                        grouped.entry(op_id).or_default().push(chunk);
                    }
                }
                for (op_id, chunks) in grouped {
                    if let Some(op) = by_id.get(op_id) {
                        let owned: Vec<_> = chunks.into_iter().cloned().collect();
                        op.merge_output_chunks(&owned);
                    }
                }
            }
        }

        // 出队终态操作。
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.retain(|op| !op.is_terminal());
        }

        admitted_any
    }

    /// 调度循环：按周期执行，空闲时降频，收到关停信号后在周期间退出。
    pub async fn run(self: Arc<Self>, timing: CycleTiming, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("模型 {} 的调度循环启动", self.model_name);
        let mut last_admitted = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.run_cycle().await {
                last_admitted = Instant::now();
            }

            let sleep_for = timing.sleep_duration(last_admitted.elapsed());

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("模型 {} 的调度循环退出", self.model_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchRequest, BatchResult, TextOperationService};
    use crate::config::{AccountConfig, DeploymentConfig};
    use crate::scheduler::types::{
        ModelParameters, OperationKind, OperationStatus, TextChunk,
    };
    use async_trait::async_trait;

    struct StubService {
        fail: bool,
    }

    #[async_trait]
    impl TextOperationService for StubService {
        async fn execute(&self, request: &BatchRequest) -> BatchResult {
            if self.fail {
                return BatchResult::failure("后端返回 429");
            }
            let chunks = request
                .chunks
                .iter()
                .map(|c| {
                    let mut c = c.clone();
                    c.embedding = Some(vec![1.0]);
                    c
                })
                .collect();
            BatchResult::success(chunks)
        }
    }

    fn tracker(token_limit: u32, fail: bool) -> DeploymentCapacityTracker {
        let account = AccountConfig {
            name: "acc".to_string(),
            endpoint: "https://example".to_string(),
            deployments: Vec::new(),
        };
        let deployment = DeploymentConfig {
            name: "embed-1".to_string(),
            model_name: "text-embedding-3-small".to_string(),
            model_version: "1".to_string(),
            can_do_embeddings: true,
            can_do_completions: false,
            token_rate_limit: token_limit,
            token_rate_renewal_period_seconds: 60,
            request_rate_limit: 600,
            request_rate_renewal_period_seconds: 60,
        };
        DeploymentCapacityTracker::new(
            &account,
            deployment,
            OperationKind::Embedding,
            1.0,
            Arc::new(StubService { fail }),
        )
    }

    fn operation(id: &str, prioritized: bool, chunk_count: u32) -> Arc<OperationContext> {
        let chunks = (1..=chunk_count)
            .map(|position| TextChunk {
                operation_id: None,
                position,
                content: Some(format!("chunk-{position}")),
                tokens_count: 10,
                embedding: None,
                completion: None,
            })
            .collect();
        Arc::new(OperationContext::new(
            id.to_string(),
            OperationKind::Embedding,
            prioritized,
            "text-embedding-3-small".to_string(),
            ModelParameters::default(),
            chunks,
        ))
    }

    #[tokio::test]
    async fn cycle_completes_a_queued_operation() {
        let scheduler = ModelScheduler::new(
            "text-embedding-3-small".to_string(),
            vec![tracker(1000, false)],
        );
        let op = operation("op-1", false, 3);
        scheduler.enqueue(op.clone());

        assert!(scheduler.run_cycle().await);

        let result = op.snapshot();
        assert_eq!(result.status, OperationStatus::Completed);
        assert_eq!(result.processed_text_chunks_count, 3);
        // 完成后出队。
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[tokio::test]
    async fn empty_queue_skips_the_cycle() {
        let scheduler =
            ModelScheduler::new("text-embedding-3-small".to_string(), vec![tracker(1000, false)]);
        assert!(!scheduler.run_cycle().await);
    }

    #[tokio::test]
    async fn prioritized_operation_jumps_the_queue() {
        // 每周期容量 1 块（10 tokens）：先入队的普通操作占不到先机。
        let scheduler =
            ModelScheduler::new("text-embedding-3-small".to_string(), vec![tracker(10, false)]);
        let normal = operation("op-normal", false, 1);
        let urgent = operation("op-urgent", true, 1);
        scheduler.enqueue(normal.clone());
        scheduler.enqueue(urgent.clone());

        assert!(scheduler.run_cycle().await);
        assert_eq!(urgent.snapshot().status, OperationStatus::Completed);
        assert_eq!(normal.snapshot().status, OperationStatus::Queued);
    }

    #[tokio::test]
    async fn capacity_short_circuit_leaves_remainder_for_next_cycle() {
        // 两个跟踪器各容纳 2 块：5 块的操作单周期恰好准入 4 块。
        let scheduler = ModelScheduler::new(
            "text-embedding-3-small".to_string(),
            vec![tracker(20, false), tracker(20, false)],
        );
        let op = operation("op-1", false, 5);
        scheduler.enqueue(op.clone());

        let now = Utc::now();
        assert!(scheduler.run_cycle_at(now).await);
        let partial = op.snapshot();
        assert_eq!(partial.status, OperationStatus::InProgress);
        assert_eq!(partial.processed_text_chunks_count, 4);

        // 窗口续期后的下一周期补齐剩余块。
        let later = now + chrono::TimeDelta::seconds(61);
        assert!(scheduler.run_cycle_at(later).await);
        assert_eq!(op.snapshot().status, OperationStatus::Completed);
    }

    #[test]
    fn idle_backoff_stretches_the_cycle_interval() {
        let timing = CycleTiming::default();
        assert_eq!(timing.sleep_duration(Duration::ZERO), timing.interval);
        assert_eq!(timing.sleep_duration(Duration::from_secs(59)), timing.interval);
        assert_eq!(
            timing.sleep_duration(Duration::from_secs(60)),
            timing.idle_interval
        );
        assert_eq!(
            timing.sleep_duration(Duration::from_secs(600)),
            timing.idle_interval
        );
    }

    #[tokio::test]
    async fn repeated_backend_failures_fail_the_operation() {
        let scheduler =
            ModelScheduler::new("text-embedding-3-small".to_string(), vec![tracker(1000, true)]);
        let op = operation("op-1", false, 2);
        scheduler.enqueue(op.clone());

        // 前两个周期记错但保持在进行中，供后续周期重试。
        assert!(scheduler.run_cycle().await);
        assert_eq!(op.snapshot().status, OperationStatus::InProgress);
        assert!(scheduler.run_cycle().await);
        assert_eq!(op.snapshot().status, OperationStatus::InProgress);

        // 第三次错误达到上限，操作失败并出队。
        assert!(scheduler.run_cycle().await);
        let result = op.snapshot();
        assert_eq!(result.status, OperationStatus::Failed);
        assert!(result.error_message.is_some());
        assert_eq!(scheduler.queue_len(), 0);
    }
}
