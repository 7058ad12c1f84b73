use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// 放弃前允许的重试次数
    pub max_retries: u32,
    /// 首次重试前的等待
    pub delay: Duration,
    /// 每次重试等待的倍增系数，默认 1.0 即固定间隔
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(5000),
            factor: 1.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// 第 n 次重试前的等待：delay * factor^(n-1)，不超过 max_delay
    ///
    /// n = 0 (定时轮换) 同样等待 delay。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.delay.as_secs_f64() * self.factor.powi(exp);
        let max_secs = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_constant() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(5000));
        }
    }

    #[test]
    fn exponential_growth() {
        let policy = RetryPolicy {
            delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn overflow_clamps_to_max() {
        let policy = RetryPolicy {
            factor: 10.0,
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }
}
