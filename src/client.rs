use crate::scheduler::types::{TextOperationRequest, TextOperationResult};
use anyhow::Context;
use std::time::{Duration, Instant};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1_800);

/// 长时操作轮询客户端：Start 拿到操作 id，按固定间隔轮询直到终态或超时。
/// 404 与无法识别的状态视为终态失败。
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        })
    }

    pub fn with_polling(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self
    }

    pub async fn start_embedding_operation(
        &self,
        request: &TextOperationRequest,
    ) -> anyhow::Result<TextOperationResult> {
        self.start("embeddings", request).await
    }

    pub async fn start_completion_operation(
        &self,
        request: &TextOperationRequest,
    ) -> anyhow::Result<TextOperationResult> {
        self.start("completions", request).await
    }

    pub async fn get_embedding_operation_result(
        &self,
        operation_id: &str,
    ) -> anyhow::Result<TextOperationResult> {
        self.get_result("embeddings", operation_id).await
    }

    pub async fn get_completion_operation_result(
        &self,
        operation_id: &str,
    ) -> anyhow::Result<TextOperationResult> {
        self.get_result("completions", operation_id).await
    }

    /// 轮询嵌入操作直到终态；超过最大等待时长返回错误。
    pub async fn wait_for_embedding_operation(
        &self,
        operation_id: &str,
    ) -> anyhow::Result<TextOperationResult> {
        self.wait("embeddings", operation_id).await
    }

    /// 轮询补全操作直到终态；超过最大等待时长返回错误。
    pub async fn wait_for_completion_operation(
        &self,
        operation_id: &str,
    ) -> anyhow::Result<TextOperationResult> {
        self.wait("completions", operation_id).await
    }

    async fn start(
        &self,
        controller: &str,
        request: &TextOperationRequest,
    ) -> anyhow::Result<TextOperationResult> {
        let url = format!("{}/v1/{controller}/operations", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("请求 {url} 失败"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("启动操作失败（{status}）: {body}");
        }
        Ok(resp.json().await.context("解析操作结果失败")?)
    }

    async fn get_result(
        &self,
        controller: &str,
        operation_id: &str,
    ) -> anyhow::Result<TextOperationResult> {
        let url = format!(
            "{}/v1/{controller}/operations/{operation_id}",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("请求 {url} 失败"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("操作 {operation_id} 不存在或已被逐出");
        }
        if !resp.status().is_success() {
            anyhow::bail!("查询操作状态失败（{}）", resp.status());
        }
        // 无法识别的状态值会在这里解析失败，按终态失败处理。
        Ok(resp.json().await.context("解析操作状态失败")?)
    }

    async fn wait(
        &self,
        controller: &str,
        operation_id: &str,
    ) -> anyhow::Result<TextOperationResult> {
        let started = Instant::now();
        loop {
            let result = self.get_result(controller, operation_id).await?;
            if result.status.is_terminal() {
                return Ok(result);
            }
            if started.elapsed() >= self.max_wait {
                anyhow::bail!(
                    "操作 {operation_id} 超过最大等待时长（{}s）仍未完成",
                    self.max_wait.as_secs()
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
