//! 部署调度：把长时文本操作（嵌入/补全）公平地复用到有限的模型部署池上。
//!
//! - `types`：文本块、操作请求/结果等线上模型。
//! - `strategy`：嵌入与补全的结果合并/完成判定策略。
//! - `operation`：单个操作的状态（输入块、中间错误、状态机）。
//! - `deployment`：单个部署的 token/请求双预算容量跟踪。
//! - `model`：按模型的优先级队列与调度循环。
//! - `gateway`：对外门面（校验、发现、启动/轮询）。

pub mod deployment;
pub mod gateway;
pub mod model;
pub mod operation;
pub mod strategy;
pub mod types;

pub use gateway::GatewayScheduler;
pub use model::{CycleTiming, ModelScheduler};
pub use operation::OperationContext;
pub use types::{
    ModelParameters, OperationKind, OperationStatus, TextChunk, TextOperationRequest,
    TextOperationResult,
};
