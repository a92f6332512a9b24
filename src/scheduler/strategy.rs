use crate::scheduler::types::{OperationKind, TextChunk};

/// 文本块的结果合并与完成判定策略。
pub trait OperationStrategy: Send + Sync {
    /// 把后端返回的部分结果写入已存储的文本块。
    fn merge(&self, target: &mut TextChunk, incoming: &TextChunk);

    /// 判断文本块是否已有完整输出。
    fn is_complete(&self, chunk: &TextChunk) -> bool;
}

pub struct EmbeddingStrategy;

impl OperationStrategy for EmbeddingStrategy {
    fn merge(&self, target: &mut TextChunk, incoming: &TextChunk) {
        target.embedding = incoming.embedding.clone();
    }

    fn is_complete(&self, chunk: &TextChunk) -> bool {
        chunk.embedding.is_some()
    }
}

pub struct CompletionStrategy;

impl OperationStrategy for CompletionStrategy {
    fn merge(&self, target: &mut TextChunk, incoming: &TextChunk) {
        target.completion = incoming.completion.clone();
    }

    fn is_complete(&self, chunk: &TextChunk) -> bool {
        chunk.completion.is_some()
    }
}

pub fn for_kind(kind: OperationKind) -> &'static dyn OperationStrategy {
    match kind {
        OperationKind::Embedding => &EmbeddingStrategy,
        OperationKind::Completion => &CompletionStrategy,
    }
}
