use serde::{Deserialize, Serialize};

/// 补全批次使用的哨兵上下文键（嵌入批次的键为目标维度数）。
pub const COMPLETION_CONTEXT_KEY: i64 = -1;

/// 嵌入维度未指定时的哨兵值，表示使用模型默认维度。
pub const DEFAULT_EMBEDDING_DIMENSIONS: i64 = -1;

/// 文本操作的类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Embedding,
    Completion,
}

/// 按位置寻址的文本块：操作的输入与输出单元。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub tokens_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
}

/// 文本操作的模型参数。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    /// 嵌入维度；-1 表示模型默认维度。
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_token_count: Option<u32>,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            temperature: None,
            top_p: None,
            max_output_token_count: None,
        }
    }
}

fn default_embedding_dimensions() -> i64 {
    DEFAULT_EMBEDDING_DIMENSIONS
}

/// 启动一个文本操作的请求体。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperationRequest {
    pub model_name: String,
    pub text_chunks: Vec<TextChunk>,
    #[serde(default)]
    pub prioritized: bool,
    #[serde(default)]
    pub model_parameters: ModelParameters,
    /// 补全请求所属的 agent，用于配额作用域。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// 操作的状态机：Queued -> InProgress -> {Completed | Failed}，单向推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 文本操作的当前状态快照（轮询接口的响应体）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperationResult {
    pub operation_id: String,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processed_text_chunks_count: usize,
    pub text_chunks: Vec<TextChunk>,
    pub token_count: u32,
}
