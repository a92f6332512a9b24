//! textgate：多租户 LLM 平台的准入控制与部署调度引擎。
//!
//! 两个核心面：
//! - 配额执行（`quota`）：按作用域/分区的滑动窗口限流，支持多实例分布式计量。
//! - 部署调度（`scheduler`）：把长时嵌入/补全操作复用到有限的模型部署池上。
//!
//! `client` 提供长时操作的轮询客户端，`api` 是薄 HTTP 封装。

pub mod api;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod quota;
pub mod scheduler;
