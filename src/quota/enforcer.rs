use crate::error::AppError;
use crate::quota::context::QuotaContext;
use crate::quota::store::QuotaDefinitionStore;
use crate::quota::types::{
    DEFAULT_PARTITION_ID, QuotaEvaluationResult, RemoteMetricUpdate, UserIdentity,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// 初始化宽限期：在此期间评估一律放行（fail-open），超时后返回显式错误。
const INITIALIZATION_GRACE_SECONDS: i64 = 60;

/// 分布式计量队列的发送周期。
const DISTRIBUTION_INTERVAL: Duration = Duration::from_secs(1);

/// 等待发送给对端实例的一条本地计量记录。
#[derive(Debug, Clone)]
struct PendingMetric {
    quota_context: String,
    partition_id: String,
    timestamp: DateTime<Utc>,
}

/// 远端计量更新的发送端（对端广播的传输层抽象）。
#[async_trait]
pub trait RemoteUpdateSink: Send + Sync {
    async fn publish(&self, updates: &[RemoteMetricUpdate]) -> anyhow::Result<()>;
}

/// 配额执行器：按作用域键分发评估请求到各配额上下文。
///
/// 初始化是异步的，绝不阻塞请求路径：完成前评估一律放行，
/// 超过宽限期仍未完成则对每次评估返回初始化错误。
pub struct QuotaEnforcer {
    contexts: ArcSwap<HashMap<String, Arc<QuotaContext>>>,
    initialized: AtomicBool,
    enabled: AtomicBool,
    created_at: DateTime<Utc>,
    outbound: Mutex<Vec<PendingMetric>>,
}

impl QuotaEnforcer {
    pub fn new() -> Self {
        Self {
            contexts: ArcSwap::from_pointee(HashMap::new()),
            initialized: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            created_at: Utc::now(),
            outbound: Mutex::new(Vec::new()),
        }
    }

    /// 从存储加载定义并安装上下文。存储文件不存在时创建空存储。
    pub async fn initialize(&self, store: &dyn QuotaDefinitionStore) -> anyhow::Result<()> {
        let definitions = match store.read_definitions().await? {
            Some(defs) => defs,
            None => {
                tracing::info!("配额存储不存在，创建空存储");
                store.write_definitions(&[]).await?;
                Vec::new()
            }
        };

        let mut contexts: HashMap<String, Arc<QuotaContext>> = HashMap::new();
        for def in definitions {
            let key = def.context.clone();
            contexts.insert(key, Arc::new(QuotaContext::new(def)));
        }

        let enabled = !contexts.is_empty();
        tracing::info!(
            "配额服务初始化完成：{} 条定义，enforcement {}",
            contexts.len(),
            if enabled { "启用" } else { "停用" }
        );

        self.contexts.store(Arc::new(contexts));
        self.enabled.store(enabled, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// 评估一个原始 API 请求（作用域 = api:controller）。
    pub fn evaluate_raw_request(
        &self,
        api_name: &str,
        controller_name: &str,
        identity: &UserIdentity,
    ) -> Result<QuotaEvaluationResult, AppError> {
        let key = build_scope_key(&[api_name, controller_name]);
        self.evaluate_context(Utc::now(), &key, identity)
    }

    /// 评估一个补全请求（作用域 = api:controller:agent）。
    pub fn evaluate_completion_request(
        &self,
        api_name: &str,
        controller_name: &str,
        agent_name: &str,
        identity: &UserIdentity,
    ) -> Result<QuotaEvaluationResult, AppError> {
        let key = build_scope_key(&[api_name, controller_name, agent_name]);
        self.evaluate_context(Utc::now(), &key, identity)
    }

    fn evaluate_context(
        &self,
        now: DateTime<Utc>,
        scope_key: &str,
        identity: &UserIdentity,
    ) -> Result<QuotaEvaluationResult, AppError> {
        if !self.initialized.load(Ordering::SeqCst) {
            if (now - self.created_at).num_seconds() <= INITIALIZATION_GRACE_SECONDS {
                // 初始化未完成：放行，不计量。
                return Ok(QuotaEvaluationResult::not_exceeded());
            }
            return Err(AppError::QuotaInit(format!(
                "初始化超过 {INITIALIZATION_GRACE_SECONDS} 秒仍未完成"
            )));
        }

        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(QuotaEvaluationResult::not_exceeded());
        }

        let contexts = self.contexts.load();
        let Some(context) = contexts.get(scope_key) else {
            // 未匹配任何定义：放行。
            tracing::warn!("作用域 {scope_key} 未匹配任何配额定义");
            return Ok(QuotaEvaluationResult::not_exceeded());
        };

        let (result, partition_id) = context.add_local_unit(now, identity);

        if context.definition().distributed_enforcement {
            self.enqueue_metric(scope_key, &partition_id, now);
        }

        Ok(result)
    }

    /// 应用来自对端实例的远端计量更新。未知作用域丢弃并记日志。
    pub fn apply_remote_updates(&self, updates: &[RemoteMetricUpdate]) {
        let now = Utc::now();
        let contexts = self.contexts.load();
        for update in updates {
            let Some(context) = contexts.get(&update.quota_context) else {
                tracing::warn!("远端更新的作用域 {} 未匹配任何配额定义", update.quota_context);
                continue;
            };
            let partition_id = if update.partition_id.trim().is_empty() {
                DEFAULT_PARTITION_ID
            } else {
                &update.partition_id
            };
            context.add_remote_units(now, partition_id, &update.metric_timestamps);
        }
    }

    fn enqueue_metric(&self, scope_key: &str, partition_id: &str, timestamp: DateTime<Utc>) {
        let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        outbound.push(PendingMetric {
            quota_context: scope_key.to_string(),
            partition_id: partition_id.to_string(),
            timestamp,
        });
    }

    /// 取出并清空待发送队列，按 (作用域, 分区) 分组。
    fn drain_grouped_updates(&self) -> Vec<RemoteMetricUpdate> {
        let pending = {
            let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *outbound)
        };
        if pending.is_empty() {
            return Vec::new();
        }

        let mut grouped: HashMap<(String, String), Vec<DateTime<Utc>>> = HashMap::new();
        for metric in pending {
            grouped
                .entry((metric.quota_context, metric.partition_id))
                .or_default()
                .push(metric.timestamp);
        }

        grouped
            .into_iter()
            .map(
                |((quota_context, partition_id), metric_timestamps)| RemoteMetricUpdate {
                    quota_context,
                    partition_id,
                    metric_timestamps,
                },
            )
            .collect()
    }
}

impl Default for QuotaEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

/// 后台初始化：不阻塞调用方，失败只记日志（宽限期后评估会显式报错）。
pub fn spawn_init_task(enforcer: Arc<QuotaEnforcer>, store: Arc<dyn QuotaDefinitionStore>) {
    tokio::spawn(async move {
        if let Err(e) = enforcer.initialize(store.as_ref()).await {
            tracing::error!("配额服务初始化失败: {e:#}");
        }
    });
}

/// 后台发送：每秒将本地计量按 (作用域, 分区) 分组后广播给对端。
pub fn spawn_distribution_task(enforcer: Arc<QuotaEnforcer>, sink: Arc<dyn RemoteUpdateSink>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DISTRIBUTION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let updates = enforcer.drain_grouped_updates();
            if updates.is_empty() {
                continue;
            }
            if let Err(e) = sink.publish(&updates).await {
                tracing::warn!("发送远端计量更新失败: {e:#}");
            }
        }
    });
}

/// HTTP 对端广播：把分组后的更新 POST 到每个对端实例。
pub struct HttpUpdateSink {
    http: reqwest::Client,
    peers: Vec<String>,
}

impl HttpUpdateSink {
    pub fn new(peers: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, peers })
    }
}

#[async_trait]
impl RemoteUpdateSink for HttpUpdateSink {
    async fn publish(&self, updates: &[RemoteMetricUpdate]) -> anyhow::Result<()> {
        for peer in &self.peers {
            let url = format!("{peer}/internal/quota/metrics");
            let resp = self.http.post(&url).json(updates).send().await;
            match resp {
                Ok(r) if !r.status().is_success() => {
                    tracing::warn!("对端 {peer} 返回错误状态: {}", r.status());
                }
                Err(e) => {
                    tracing::warn!("广播计量更新到 {peer} 失败: {e}");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// 作用域键：各段以 `:` 连接，空白段以占位符代替。
pub fn build_scope_key(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| {
            let s = s.trim();
            if s.is_empty() { DEFAULT_PARTITION_ID } else { s }
        })
        .collect::<Vec<_>>()
        .join(":")
}
