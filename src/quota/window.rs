use crate::quota::types::{QuotaDefinition, QuotaEvaluationResult};
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

/// 上报给调用方的重试等待在锁定剩余时间上附加的缓冲秒数，
/// 避免客户端在锁定边界竞争重试。
const RETRY_BUFFER_SECONDS: i64 = 5;

/// 容忍的对端时钟偏移（秒）：远端时间戳略微超前本地时钟时不丢弃。
const CLOCK_SKEW_TOLERANCE_SECONDS: i64 = 2;

/// 单个分区的滑动窗口计数器。
///
/// 窗口由 W 个一秒桶构成（W 为配额定义的窗口长度），本地与远端计量分别
/// 记录在两个桶数组中，但共享同一个限额。超限后进入锁定：清空所有桶，
/// 在锁定时长结束前拒绝全部请求。
#[derive(Debug)]
pub struct RateWindowCounter {
    quota_name: String,
    quota_context: String,
    partition_id: String,
    metric_limit: u32,
    window_seconds: i64,
    lockout_seconds: i64,
    inner: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    local: Vec<u32>,
    remote: Vec<u32>,
    local_sum: u32,
    remote_sum: u32,
    /// 桶 0 对应的时刻（上次移位时间）。
    anchor: DateTime<Utc>,
    locked_out: bool,
    lockout_start: DateTime<Utc>,
}

impl RateWindowCounter {
    pub fn new(definition: &QuotaDefinition, partition_id: &str, now: DateTime<Utc>) -> Self {
        let window = definition.metric_window_seconds.max(1) as usize;
        Self {
            quota_name: definition.name.clone(),
            quota_context: definition.context.clone(),
            partition_id: partition_id.to_string(),
            metric_limit: definition.metric_limit,
            window_seconds: window as i64,
            lockout_seconds: definition.lockout_duration_seconds as i64,
            inner: Mutex::new(WindowState {
                local: vec![0; window],
                remote: vec![0; window],
                local_sum: 0,
                remote_sum: 0,
                anchor: now,
                locked_out: false,
                lockout_start: now,
            }),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// 记录一个本地计量单位并评估限额。
    pub fn add_local_unit(&self, now: DateTime<Utc>) -> QuotaEvaluationResult {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if st.locked_out {
            let elapsed = (now - st.lockout_start).num_seconds();
            if elapsed < self.lockout_seconds {
                return QuotaEvaluationResult::exceeded(
                    &self.quota_name,
                    &self.quota_context,
                    self.lockout_seconds - elapsed + RETRY_BUFFER_SECONDS,
                );
            }
            // 锁定期满：桶在进入锁定时已清空，重置窗口起点即可恢复计数。
            st.locked_out = false;
            st.anchor = now;
        }

        shift_window(&mut st, now, self.window_seconds);

        st.local[0] += 1;
        st.local_sum += 1;

        if st.local_sum + st.remote_sum > self.metric_limit {
            self.enter_lockout(&mut st, now);
            return QuotaEvaluationResult::exceeded(
                &self.quota_name,
                &self.quota_context,
                self.lockout_seconds + RETRY_BUFFER_SECONDS,
            );
        }

        QuotaEvaluationResult::not_exceeded()
    }

    /// 合并来自其他实例的计量时间戳。锁定期间不合并（桶已清空，
    /// 合并只会延长恢复）。无效时间戳（超前本地时钟或早于窗口）丢弃并记日志。
    pub fn add_remote_units(
        &self,
        now: DateTime<Utc>,
        timestamps: &[DateTime<Utc>],
    ) -> QuotaEvaluationResult {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if st.locked_out {
            let elapsed = (now - st.lockout_start).num_seconds();
            if elapsed < self.lockout_seconds {
                return QuotaEvaluationResult::exceeded(
                    &self.quota_name,
                    &self.quota_context,
                    self.lockout_seconds - elapsed + RETRY_BUFFER_SECONDS,
                );
            }
            st.locked_out = false;
            st.anchor = now;
        }

        shift_window(&mut st, now, self.window_seconds);

        for ts in timestamps {
            let age = (now - *ts).num_seconds();
            if age < -CLOCK_SKEW_TOLERANCE_SECONDS || age >= self.window_seconds {
                tracing::debug!(
                    "丢弃无效的远端计量时间戳: quota={} partition={} ts={ts} age={age}s",
                    self.quota_name,
                    self.partition_id
                );
                continue;
            }
            let idx = age.max(0) as usize;
            st.remote[idx] += 1;
            st.remote_sum += 1;
        }

        if st.local_sum + st.remote_sum > self.metric_limit {
            self.enter_lockout(&mut st, now);
            return QuotaEvaluationResult::exceeded(
                &self.quota_name,
                &self.quota_context,
                self.lockout_seconds + RETRY_BUFFER_SECONDS,
            );
        }

        QuotaEvaluationResult::not_exceeded()
    }

    fn enter_lockout(&self, st: &mut WindowState, now: DateTime<Utc>) {
        st.locked_out = true;
        st.lockout_start = now;
        st.local.fill(0);
        st.remote.fill(0);
        st.local_sum = 0;
        st.remote_sum = 0;
        tracing::warn!(
            "配额 {} 超限（context={} partition={}），锁定 {} 秒",
            self.quota_name,
            self.quota_context,
            self.partition_id,
            self.lockout_seconds
        );
    }
}

/// 将窗口推进到 now：桶整体向后移动 ceil(elapsed) 位，
/// 经过时间不小于窗口长度时直接清空。
/// 经过不足一秒时不移位也不推进锚点，亚秒级的连续计量落在同一个桶里。
fn shift_window(st: &mut WindowState, now: DateTime<Utc>, window_seconds: i64) {
    let elapsed_ms = (now - st.anchor).num_milliseconds();
    if elapsed_ms < 1000 {
        return;
    }
    let shift = (elapsed_ms + 999) / 1000;

    if shift >= window_seconds {
        st.local.fill(0);
        st.remote.fill(0);
        st.local_sum = 0;
        st.remote_sum = 0;
    } else {
        let shift = shift as usize;
        let w = st.local.len();
        for i in (w - shift..w).rev() {
            st.local_sum -= st.local[i];
            st.remote_sum -= st.remote[i];
        }
        for i in (0..w - shift).rev() {
            st.local[i + shift] = st.local[i];
            st.remote[i + shift] = st.remote[i];
        }
        st.local[..shift].fill(0);
        st.remote[..shift].fill(0);
    }

    st.anchor = now;
}
