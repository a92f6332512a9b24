use crate::quota::types::QuotaDefinition;
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;

/// 配额定义的持久化后端。
#[async_trait]
pub trait QuotaDefinitionStore: Send + Sync {
    /// 读取全部定义；存储尚不存在时返回 `None`。
    async fn read_definitions(&self) -> anyhow::Result<Option<Vec<QuotaDefinition>>>;

    /// 覆盖写入全部定义。
    async fn write_definitions(&self, definitions: &[QuotaDefinition]) -> anyhow::Result<()>;
}

/// 基于 JSON 文件的定义存储（`<data_dir>/quota-store.json`）。
#[derive(Debug)]
pub struct FileQuotaStore {
    path: PathBuf,
}

impl FileQuotaStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl QuotaDefinitionStore for FileQuotaStore {
    async fn read_definitions(&self) -> anyhow::Result<Option<Vec<QuotaDefinition>>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("读取配额存储失败: {}", self.path.display()))?;
        let definitions: Vec<QuotaDefinition> = serde_json::from_str(&content)
            .with_context(|| format!("解析配额存储失败: {}", self.path.display()))?;
        Ok(Some(definitions))
    }

    async fn write_definitions(&self, definitions: &[QuotaDefinition]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(definitions)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("写入配额存储失败: {}", self.path.display()))?;
        Ok(())
    }
}
