use crate::quota::partition::QuotaPartitionSet;
use crate::quota::types::{
    DEFAULT_PARTITION_ID, MetricPartitionStrategy, QuotaDefinition, QuotaEvaluationResult,
    UserIdentity,
};
use chrono::{DateTime, Utc};

/// 一条配额定义的执行上下文：持有定义与按分区策略拆分的计数器。
#[derive(Debug)]
pub struct QuotaContext {
    definition: QuotaDefinition,
    partitions: QuotaPartitionSet,
}

impl QuotaContext {
    pub fn new(definition: QuotaDefinition) -> Self {
        Self {
            definition,
            partitions: QuotaPartitionSet::new(),
        }
    }

    pub fn definition(&self) -> &QuotaDefinition {
        &self.definition
    }

    /// 根据分区策略从用户身份中取分区键；缺失的身份字段退化为占位分区。
    pub fn partition_id<'a>(&self, identity: &'a UserIdentity) -> &'a str {
        let key = match self.definition.metric_partition {
            MetricPartitionStrategy::None => None,
            MetricPartitionStrategy::UserIdentifier => identity.user_id.as_deref(),
            MetricPartitionStrategy::UserPrincipalName => {
                identity.user_principal_name.as_deref()
            }
        };
        match key {
            Some(k) if !k.trim().is_empty() => k,
            _ => DEFAULT_PARTITION_ID,
        }
    }

    /// 记录一个本地计量单位并评估限额，返回评估结果与所用分区键。
    pub fn add_local_unit(
        &self,
        now: DateTime<Utc>,
        identity: &UserIdentity,
    ) -> (QuotaEvaluationResult, String) {
        let partition_id = self.partition_id(identity);
        let counter = self
            .partitions
            .get_or_create(&self.definition, partition_id, now);
        (counter.add_local_unit(now), partition_id.to_string())
    }

    /// 合并来自对端实例的远端计量。
    pub fn add_remote_units(
        &self,
        now: DateTime<Utc>,
        partition_id: &str,
        timestamps: &[DateTime<Utc>],
    ) -> QuotaEvaluationResult {
        let counter = self
            .partitions
            .get_or_create(&self.definition, partition_id, now);
        counter.add_remote_units(now, timestamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(strategy: MetricPartitionStrategy, limit: u32) -> QuotaDefinition {
        QuotaDefinition {
            name: "AgentRate".to_string(),
            context: "api:completions:agent-x".to_string(),
            description: String::new(),
            metric_partition: strategy,
            metric_limit: limit,
            metric_window_seconds: 20,
            lockout_duration_seconds: 30,
            distributed_enforcement: false,
        }
    }

    fn identity(user_id: &str, upn: &str) -> UserIdentity {
        UserIdentity {
            user_id: Some(user_id.to_string()),
            user_principal_name: Some(upn.to_string()),
        }
    }

    #[test]
    fn none_strategy_shares_one_partition() {
        let ctx = QuotaContext::new(definition(MetricPartitionStrategy::None, 2));
        let now = Utc::now();

        let (r1, p1) = ctx.add_local_unit(now, &identity("u1", "a@x"));
        let (r2, p2) = ctx.add_local_unit(now, &identity("u2", "b@x"));
        assert!(!r1.quota_exceeded);
        assert!(!r2.quota_exceeded);
        assert_eq!(p1, DEFAULT_PARTITION_ID);
        assert_eq!(p2, DEFAULT_PARTITION_ID);

        // 不同用户命中同一分区，第三次即超限。
        let (r3, _) = ctx.add_local_unit(now, &identity("u3", "c@x"));
        assert!(r3.quota_exceeded);
    }

    #[test]
    fn user_identifier_strategy_isolates_users() {
        let ctx = QuotaContext::new(definition(MetricPartitionStrategy::UserIdentifier, 1));
        let now = Utc::now();

        let (r1, _) = ctx.add_local_unit(now, &identity("u1", "a@x"));
        let (r2, _) = ctx.add_local_unit(now, &identity("u1", "a@x"));
        assert!(!r1.quota_exceeded);
        assert!(r2.quota_exceeded);

        // 另一个用户不受影响。
        let (r3, p3) = ctx.add_local_unit(now, &identity("u2", "b@x"));
        assert!(!r3.quota_exceeded);
        assert_eq!(p3, "u2");
    }

    #[test]
    fn missing_identity_falls_back_to_default_partition() {
        let ctx = QuotaContext::new(definition(
            MetricPartitionStrategy::UserPrincipalName,
            5,
        ));
        let id = UserIdentity::default();
        assert_eq!(ctx.partition_id(&id), DEFAULT_PARTITION_ID);

        let blank = UserIdentity {
            user_id: None,
            user_principal_name: Some("   ".to_string()),
        };
        assert_eq!(ctx.partition_id(&blank), DEFAULT_PARTITION_ID);
    }
}
