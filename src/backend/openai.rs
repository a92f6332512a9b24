use crate::backend::{BatchRequest, BatchResult, TextOperationService};
use crate::config::Config;
use crate::scheduler::types::{DEFAULT_EMBEDDING_DIMENSIONS, OperationKind, TextChunk};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const API_VERSION: &str = "2024-10-21";

/// OpenAI 风格 REST 后端：嵌入批次一次调用，补全块在单次 execute 内并发展开
/// （chat 接口没有多输入形式）。
pub struct OpenAiTextService {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiTextService {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            api_key: cfg.backend_api_key.clone(),
        })
    }

    async fn execute_embeddings(&self, request: &BatchRequest) -> anyhow::Result<Vec<TextChunk>> {
        let url = format!(
            "{}/openai/deployments/{}/embeddings?api-version={API_VERSION}",
            request.account_endpoint, request.deployment_name
        );

        let inputs: Vec<&str> = request
            .chunks
            .iter()
            .map(|c| c.content.as_deref().unwrap_or_default())
            .collect();
        let mut body = json!({ "input": inputs });
        if request.context_key != DEFAULT_EMBEDDING_DIMENSIONS {
            body["dimensions"] = json!(request.context_key);
        }

        let resp = self
            .http
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp, &request.deployment_name).await?;
        let parsed: EmbeddingResponse = resp.json().await?;

        let mut chunks = request.chunks.clone();
        for item in parsed.data {
            let Some(chunk) = chunks.get_mut(item.index) else {
                anyhow::bail!("嵌入响应包含越界的 index: {}", item.index);
            };
            chunk.embedding = Some(item.embedding);
        }
        Ok(chunks)
    }

    async fn execute_completions(&self, request: &BatchRequest) -> anyhow::Result<Vec<TextChunk>> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={API_VERSION}",
            request.account_endpoint, request.deployment_name
        );

        let calls = request.chunks.iter().map(|chunk| {
            let url = url.clone();
            async move {
                let mut body = json!({
                    "messages": [{
                        "role": "user",
                        "content": chunk.content.as_deref().unwrap_or_default(),
                    }],
                });
                let params = &request.model_parameters;
                if let Some(t) = params.temperature {
                    body["temperature"] = json!(t);
                }
                if let Some(p) = params.top_p {
                    body["top_p"] = json!(p);
                }
                if let Some(m) = params.max_output_token_count {
                    body["max_tokens"] = json!(m);
                }

                let resp = self
                    .http
                    .post(&url)
                    .header("api-key", &self.api_key)
                    .json(&body)
                    .send()
                    .await?;
                let resp = check_status(resp, &request.deployment_name).await?;
                let parsed: ChatResponse = resp.json().await?;

                let completion = parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| anyhow::anyhow!("补全响应不含任何 choice"))?;

                let mut chunk = chunk.clone();
                chunk.completion = Some(completion);
                anyhow::Ok(chunk)
            }
        });

        join_all(calls).await.into_iter().collect()
    }
}

#[async_trait]
impl TextOperationService for OpenAiTextService {
    async fn execute(&self, request: &BatchRequest) -> BatchResult {
        let result = match request.kind {
            OperationKind::Embedding => self.execute_embeddings(request).await,
            OperationKind::Completion => self.execute_completions(request).await,
        };
        match result {
            Ok(chunks) => BatchResult::success(chunks),
            Err(e) => BatchResult::failure(format!(
                "部署 {} 的批次执行失败: {e:#}",
                request.deployment_name
            )),
        }
    }
}

/// 非成功状态转为错误；429 额外记录后端给出的限流诊断头。
async fn check_status(
    resp: reqwest::Response,
    deployment_name: &str,
) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        tracing::warn!(
            "部署 {deployment_name} 返回限流: retry-after={} x-ratelimit-remaining-requests={} x-ratelimit-remaining-tokens={}",
            header("retry-after"),
            header("x-ratelimit-remaining-requests"),
            header("x-ratelimit-remaining-tokens")
        );
        anyhow::bail!("后端限流 (429)");
    }

    let body = resp.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    anyhow::bail!("后端返回错误状态 {status}: {snippet}");
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}
