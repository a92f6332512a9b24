//! 文本操作后端：调度器只依赖 `TextOperationService` 抽象，
//! 具体协议实现可插拔（当前提供 OpenAI 风格 REST 实现）。

pub mod openai;

use crate::scheduler::types::{ModelParameters, OperationKind, TextChunk};
use async_trait::async_trait;

pub use openai::OpenAiTextService;

/// 发往一个部署的单个批次请求。
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// 批次在本调度周期内的序号（仅用于日志）。
    pub id: usize,
    pub kind: OperationKind,
    pub account_name: String,
    pub account_endpoint: String,
    pub deployment_name: String,
    pub model_name: String,
    pub model_version: String,
    /// 批次键：嵌入维度，补全为 -1。
    pub context_key: i64,
    pub prioritized: bool,
    pub model_parameters: ModelParameters,
    pub chunks: Vec<TextChunk>,
}

impl BatchRequest {
    pub fn tokens_count(&self) -> u32 {
        self.chunks.iter().map(|c| c.tokens_count).sum()
    }
}

/// 一个批次的执行结果。
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub chunks: Vec<TextChunk>,
    pub failed: bool,
    pub error_message: Option<String>,
}

impl BatchResult {
    pub fn success(chunks: Vec<TextChunk>) -> Self {
        Self {
            chunks,
            failed: false,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            failed: true,
            error_message: Some(message.into()),
        }
    }
}

/// 文本操作的执行后端。失败通过 `BatchResult` 返回，不抛错，
/// 重试（如有）由下一个调度周期重新准入未完成块完成。
#[async_trait]
pub trait TextOperationService: Send + Sync {
    async fn execute(&self, request: &BatchRequest) -> BatchResult;
}
