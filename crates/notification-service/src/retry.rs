//! 重试与退避策略
//!
//! 邮件发送前的放行判断与后台重试清扫共用同一份策略，
//! 其他模块不得自行推算重试时机。

use chrono::{DateTime, Duration, Utc};

use crate::model::{DeliveryMethod, DeliveryStatus};

// ---------------------------------------------------------------------------
// RetryPolicy — 重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 邮件按尝试次数递增等待时间：第 1 次失败后等 30 分钟，第 2 次等 1 小时，
/// 第 3 次等 2 小时，最多发起 4 次。其他渠道固定间隔、最多 3 次。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 下标为已尝试次数，值为距上次尝试需要经过的最短时间
    pub email_backoff: Vec<Duration>,
    pub default_max_attempts: u32,
    pub default_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            email_backoff: vec![
                Duration::zero(),
                Duration::minutes(30),
                Duration::hours(1),
                Duration::hours(2),
            ],
            default_max_attempts: 3,
            default_interval: Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    /// 依据渠道当前投递状态判断是否允许再次投递
    ///
    /// 没有任何状态记录视为从未尝试。
    pub fn can_retry(
        &self,
        method: DeliveryMethod,
        status: Option<&DeliveryStatus>,
        now: DateTime<Utc>,
    ) -> bool {
        match status {
            None => self.can_retry_attempts(method, 0, None, now),
            Some(s) if s.is_delivered() => false,
            Some(s) => self.can_retry_attempts(method, s.attempts, s.last_attempt, now),
        }
    }

    /// 按尝试次数与上次尝试时间判断
    ///
    /// 缺少上次尝试时间时视为等待已足够。
    pub fn can_retry_attempts(
        &self,
        method: DeliveryMethod,
        attempts: u32,
        last_attempt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let elapsed_at_least = |wait: Duration| match last_attempt {
            Some(at) => now - at >= wait,
            None => true,
        };

        match method {
            DeliveryMethod::Email => match self.email_backoff.get(attempts as usize) {
                Some(wait) => attempts == 0 || elapsed_at_least(*wait),
                None => false,
            },
            _ => attempts < self.default_max_attempts && elapsed_at_least(self.default_interval),
        }
    }

    /// 邮件最多允许的尝试次数
    pub fn email_max_attempts(&self) -> u32 {
        self.email_backoff.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryState;

    fn status(attempts: u32, minutes_ago: i64, now: DateTime<Utc>) -> DeliveryStatus {
        DeliveryStatus {
            status: DeliveryState::Failed,
            attempts,
            last_attempt: Some(now - Duration::minutes(minutes_ago)),
            error: Some("smtp".to_string()),
            delivered_at: None,
        }
    }

    #[test]
    fn test_email_first_attempt_allowed() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert!(policy.can_retry(DeliveryMethod::Email, None, now));
        assert!(policy.can_retry_attempts(DeliveryMethod::Email, 0, None, now));
    }

    #[test]
    fn test_email_backoff_schedule() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert!(!policy.can_retry(DeliveryMethod::Email, Some(&status(1, 29, now)), now));
        assert!(policy.can_retry(DeliveryMethod::Email, Some(&status(1, 30, now)), now));

        assert!(!policy.can_retry(DeliveryMethod::Email, Some(&status(2, 59, now)), now));
        assert!(policy.can_retry(DeliveryMethod::Email, Some(&status(2, 60, now)), now));

        assert!(!policy.can_retry(DeliveryMethod::Email, Some(&status(3, 119, now)), now));
        assert!(policy.can_retry(DeliveryMethod::Email, Some(&status(3, 120, now)), now));
    }

    #[test]
    fn test_email_exhausted_after_four_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.email_max_attempts(), 4);
        assert!(!policy.can_retry(DeliveryMethod::Email, Some(&status(4, 10_000, now)), now));
        assert!(!policy.can_retry_attempts(DeliveryMethod::Email, 7, None, now));
    }

    #[test]
    fn test_delivered_never_retries() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        for attempts in [0, 1, 3] {
            let mut s = status(attempts, 10_000, now);
            s.mark_delivered(now);
            assert!(!policy.can_retry(DeliveryMethod::Email, Some(&s), now));
            assert!(!policy.can_retry(DeliveryMethod::Push, Some(&s), now));
        }
    }

    #[test]
    fn test_other_methods_fixed_interval() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        for method in [DeliveryMethod::InApp, DeliveryMethod::Push, DeliveryMethod::Queue] {
            assert!(policy.can_retry(method, Some(&status(0, 5, now)), now));
            assert!(policy.can_retry(method, Some(&status(2, 5, now)), now));
            assert!(!policy.can_retry(method, Some(&status(2, 4, now)), now));
            assert!(!policy.can_retry(method, Some(&status(3, 60, now)), now));
            assert!(policy.can_retry_attempts(method, 1, None, now));
        }
    }
}
