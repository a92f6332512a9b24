use crate::quota::types::QuotaDefinition;
use crate::quota::window::RateWindowCounter;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// 一个配额上下文内按分区键惰性创建的计数器集合。
///
/// 读路径（分区已存在）只需要读锁；未命中时升级为写锁并二次检查，
/// 避免并发请求重复创建同一分区。
#[derive(Debug)]
pub struct QuotaPartitionSet {
    counters: RwLock<HashMap<String, Arc<RateWindowCounter>>>,
}

impl QuotaPartitionSet {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(
        &self,
        definition: &QuotaDefinition,
        partition_id: &str,
        now: DateTime<Utc>,
    ) -> Arc<RateWindowCounter> {
        {
            let counters = self
                .counters
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = counters.get(partition_id) {
                return counter.clone();
            }
        }

        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(partition_id.to_string())
            .or_insert_with(|| Arc::new(RateWindowCounter::new(definition, partition_id, now)))
            .clone()
    }

    /// 当前分区数量。
    pub fn len(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for QuotaPartitionSet {
    fn default() -> Self {
        Self::new()
    }
}
