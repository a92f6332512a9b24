//! 配额执行：按作用域与分区对 API 请求做滑动窗口限流。
//!
//! - `window`：单分区的滑动窗口计数器（本地 + 远端双桶数组，超限锁定）。
//! - `partition`：按分区键惰性创建计数器。
//! - `context`：一条配额定义的执行上下文（分区策略分发）。
//! - `enforcer`：按作用域键路由评估请求，异步初始化与分布式广播。
//! - `store`：配额定义的 JSON 文件存储。

pub mod context;
pub mod enforcer;
pub mod partition;
pub mod store;
pub mod types;
pub mod window;

pub use enforcer::{
    HttpUpdateSink, QuotaEnforcer, RemoteUpdateSink, spawn_distribution_task, spawn_init_task,
};
pub use store::{FileQuotaStore, QuotaDefinitionStore};
pub use types::{
    MetricPartitionStrategy, QuotaDefinition, QuotaEvaluationResult, RemoteMetricUpdate,
    UserIdentity,
};
