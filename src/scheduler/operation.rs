use crate::scheduler::strategy;
use crate::scheduler::types::{
    COMPLETION_CONTEXT_KEY, ModelParameters, OperationKind, OperationStatus, TextChunk,
    TextOperationResult,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// 失败前允许累计的中间错误数。
const MAX_INTERMEDIATE_ERRORS: usize = 3;

/// 一个进行中的文本操作：输入块、已合并的结果与中间错误。
///
/// 状态由内部互斥锁保护：调度循环写入，轮询端读取快照。
pub struct OperationContext {
    operation_id: String,
    kind: OperationKind,
    prioritized: bool,
    model_name: String,
    model_parameters: ModelParameters,
    state: Mutex<OperationState>,
}

struct OperationState {
    /// 尚未拿到输出的输入块，按位置索引。
    pending: BTreeMap<u32, TextChunk>,
    /// 全部文本块（输出逐步写入），按位置索引。
    chunks: BTreeMap<u32, TextChunk>,
    status: OperationStatus,
    error_message: Option<String>,
    intermediate_errors: Vec<String>,
    token_count: u32,
}

impl OperationContext {
    pub fn new(
        operation_id: String,
        kind: OperationKind,
        prioritized: bool,
        model_name: String,
        model_parameters: ModelParameters,
        input_chunks: Vec<TextChunk>,
    ) -> Self {
        let mut pending = BTreeMap::new();
        let mut chunks = BTreeMap::new();
        for mut chunk in input_chunks {
            chunk.operation_id = Some(operation_id.clone());
            pending.insert(chunk.position, chunk.clone());
            chunks.insert(chunk.position, chunk);
        }
        Self {
            operation_id,
            kind,
            prioritized,
            model_name,
            model_parameters,
            state: Mutex::new(OperationState {
                pending,
                chunks,
                status: OperationStatus::Queued,
                error_message: None,
                intermediate_errors: Vec::new(),
                token_count: 0,
            }),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn prioritized(&self) -> bool {
        self.prioritized
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_parameters(&self) -> &ModelParameters {
        &self.model_parameters
    }

    /// 容量跟踪器的批次键：嵌入按维度分组，补全共用哨兵键。
    pub fn context_key(&self) -> i64 {
        match self.kind {
            OperationKind::Embedding => self.model_parameters.embedding_dimensions,
            OperationKind::Completion => COMPLETION_CONTEXT_KEY,
        }
    }

    /// 尚未拿到输出的输入块（克隆，供准入阶段使用）。
    pub fn pending_chunks(&self) -> Vec<TextChunk> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.pending.values().cloned().collect()
    }

    pub fn is_terminal(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.status.is_terminal()
    }

    /// 有块被准入时推进到 InProgress（终态不回退）。
    pub fn mark_in_progress(&self) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.status == OperationStatus::Queued {
            st.status = OperationStatus::InProgress;
        }
    }

    /// 合并后端返回的输出块。全部块完成后推进到 Completed。
    pub fn merge_output_chunks(&self, incoming: &[TextChunk]) {
        let strategy = strategy::for_kind(self.kind);
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let st = &mut *st;

        for chunk in incoming {
            let Some(target) = st.chunks.get_mut(&chunk.position) else {
                tracing::warn!(
                    "操作 {} 返回了未知位置 {} 的文本块",
                    self.operation_id,
                    chunk.position
                );
                continue;
            };
            strategy.merge(target, chunk);
            if strategy.is_complete(target) {
                let tokens = target.tokens_count;
                if st.pending.remove(&chunk.position).is_some() {
                    st.token_count += tokens;
                }
            }
        }

        if st.pending.is_empty() && !st.status.is_terminal() {
            st.status = OperationStatus::Completed;
        }
    }

    /// 记录一次中间错误。累计达到上限时操作失败，返回是否已进入终态。
    pub fn record_intermediate_error(&self, error_message: &str) -> bool {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.intermediate_errors.push(error_message.to_string());

        if st.intermediate_errors.len() >= MAX_INTERMEDIATE_ERRORS && !st.status.is_terminal() {
            st.error_message = Some(format!(
                "文本操作 {} 累计发生 {} 个错误，已失败。最近一次错误: {error_message}",
                self.operation_id,
                st.intermediate_errors.len()
            ));
            st.status = OperationStatus::Failed;
        }

        st.status.is_terminal()
    }

    /// 当前状态的完整快照。
    pub fn snapshot(&self) -> TextOperationResult {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        TextOperationResult {
            operation_id: self.operation_id.clone(),
            status: st.status,
            error_message: st.error_message.clone(),
            processed_text_chunks_count: st.chunks.len() - st.pending.len(),
            text_chunks: st.chunks.values().cloned().collect(),
            token_count: st.token_count,
        }
    }
}
