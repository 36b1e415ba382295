//! 重试退避

use std::time::Duration;

use rand::Rng;

use common::configs::{BackoffConfig, BackoffKind};

/// 重试间隔计算
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    kind: BackoffKind,
    min: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let min = Duration::from_millis(config.min_ms);
        let max = Duration::from_millis(config.max_ms).max(min);
        Self {
            kind: config.kind,
            min,
            max,
        }
    }

    /// 第 `retry` 次重试（从 0 开始）之前的等待时间
    pub fn delay(&self, retry: u32) -> Duration {
        match self.kind {
            BackoffKind::None => Duration::ZERO,
            BackoffKind::Constant => self.min,
            BackoffKind::Jitter => {
                if self.max <= self.min {
                    return self.min;
                }
                let spread = (self.max - self.min).as_millis() as u64;
                self.min + Duration::from_millis(rand::rng().random_range(0..=spread))
            }
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
                self.min.saturating_mul(factor).min(self.max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(kind: BackoffKind, min_ms: u64, max_ms: u64) -> RetryBackoff {
        RetryBackoff::new(&BackoffConfig { kind, min_ms, max_ms })
    }

    #[test]
    fn kinds() {
        assert_eq!(backoff(BackoffKind::None, 10, 100).delay(3), Duration::ZERO);
        assert_eq!(backoff(BackoffKind::Constant, 10, 100).delay(3), Duration::from_millis(10));

        let exp = backoff(BackoffKind::Exponential, 10, 100);
        let delays: Vec<u64> = (0..5).map(|i| exp.delay(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100]);
        assert_eq!(exp.delay(40), Duration::from_millis(100));

        let jitter = backoff(BackoffKind::Jitter, 10, 30);
        for i in 0..50 {
            let d = jitter.delay(i);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
        }
    }
}
