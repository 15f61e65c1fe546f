// 重试策略
//
// 判定：先看错误类型是否可重试，再看重试次数是否用完。
// 延迟：base * multiplier^(n-1) * jitter，jitter 取自 [0.75, 1.25]，
// 避免大量客户端同时重试。除 max_retries 外没有延迟上限。

use crate::uploader::error::UploadError;
use rand::Rng;
use std::time::Duration;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认初始退避延迟（毫秒）
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// 默认退避倍数
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// 抖动下限
pub const JITTER_MIN: f64 = 0.75;

/// 抖动上限
pub const JITTER_MAX: f64 = 1.25;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub base_delay_ms: u64,
    /// 退避倍数，必须大于 1
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            multiplier,
        }
    }

    /// 是否应当重试
    ///
    /// # 参数
    /// * `error` - 本次失败的错误
    /// * `attempt` - 已经进行过的重试次数（首次失败时为 0）
    pub fn should_retry(&self, error: &UploadError, attempt: u32) -> bool {
        should_retry(error, attempt, self.max_retries)
    }

    /// 第 `retry_number` 次重试前的等待时间（从 1 开始计数）
    pub fn delay(&self, retry_number: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        Duration::from_millis(backoff_delay_ms(
            retry_number,
            self.base_delay_ms,
            self.multiplier,
            jitter,
        ))
    }

    /// 校验参数
    pub fn validate(&self) -> Result<(), UploadError> {
        if !(self.multiplier > 1.0) || !self.multiplier.is_finite() {
            return Err(UploadError::validation(format!(
                "退避倍数必须大于 1，当前为 {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// 纯判定函数：先看错误是否可重试，再看次数
pub fn should_retry(error: &UploadError, attempt: u32, max_retries: u32) -> bool {
    error.retryable() && attempt < max_retries
}

/// 计算退避延迟
///
/// # 延迟序列（base=1000, multiplier=2, jitter=1.0）
/// - retry_number=1: 1000ms
/// - retry_number=2: 2000ms
/// - retry_number=3: 4000ms
pub fn backoff_delay_ms(retry_number: u32, base_delay_ms: u64, multiplier: f64, jitter: f64) -> u64 {
    let exponent = retry_number.saturating_sub(1) as i32;
    let delay = base_delay_ms as f64 * multiplier.powi(exponent) * jitter;
    if delay.is_finite() && delay > 0.0 {
        delay.min(u64::MAX as f64) as u64
    } else if delay > 0.0 {
        u64::MAX
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::error::UploadErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_delay_ms(1, 1000, 2.0, 1.0), 1000);
        assert_eq!(backoff_delay_ms(2, 1000, 2.0, 1.0), 2000);
        assert_eq!(backoff_delay_ms(3, 1000, 2.0, 1.0), 4000);
        assert_eq!(backoff_delay_ms(4, 500, 3.0, 1.0), 13500);
    }

    #[test]
    fn test_should_retry_gates() {
        let server = UploadError::with_status(UploadErrorKind::ServerError, 500, "boom");
        let auth = UploadError::with_status(UploadErrorKind::AuthenticationError, 401, "nope");

        assert!(should_retry(&server, 0, 2));
        assert!(should_retry(&server, 1, 2));
        assert!(!should_retry(&server, 2, 2));
        assert!(!should_retry(&server, 0, 0));

        // 不可重试的错误与次数无关
        assert!(!should_retry(&auth, 0, 100));
    }

    #[test]
    fn test_validate_multiplier() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(3, 100, 1.0).validate().is_err());
        assert!(RetryPolicy::new(3, 100, f64::NAN).validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_within_jitter_bounds(
            retry_number in 1u32..8,
            base in 1u64..5_000,
            multiplier in 1.01f64..4.0,
        ) {
            let policy = RetryPolicy::new(10, base, multiplier);
            let deterministic = base as f64 * multiplier.powi(retry_number as i32 - 1);
            let delay = policy.delay(retry_number).as_millis() as f64;
            prop_assert!(delay >= (deterministic * JITTER_MIN).floor() - 1.0);
            prop_assert!(delay <= (deterministic * JITTER_MAX).ceil() + 1.0);
        }

        #[test]
        fn prop_delay_grows_with_retry_number(
            retry_number in 1u32..10,
            base in 1u64..5_000,
            multiplier in 1.01f64..4.0,
        ) {
            let a = backoff_delay_ms(retry_number, base, multiplier, 1.0);
            let b = backoff_delay_ms(retry_number + 1, base, multiplier, 1.0);
            prop_assert!(b >= a);
        }
    }
}
