use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use recycler_core::{RecyclerError, RecyclerResult};

/// 令牌桶限流器
///
/// 每个检测步骤类型持有一个实例，由构造方注入。基于 `tokio::time`，
/// 在暂停的测试时钟下同样可用。
#[derive(Debug)]
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: u32) -> RecyclerResult<Self> {
        if !qps.is_finite() || qps <= 0.0 {
            return Err(RecyclerError::Configuration(format!(
                "限流QPS必须为正数: {qps}"
            )));
        }
        if burst == 0 {
            return Err(RecyclerError::Configuration("限流突发容量必须大于0".to_string()));
        }
        let burst = f64::from(burst);
        Ok(Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        })
    }

    /// 尝试立即取得一个令牌，失败时返回需要等待的时长
    fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps))
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_take().is_ok()
    }

    /// 等待直到取得一个令牌
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_take() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(RateLimiter::new(0.0, 1).is_err());
        assert!(RateLimiter::new(f64::NAN, 1).is_err());
        assert!(RateLimiter::new(1.0, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::new(2.0, 3).unwrap();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let limiter = RateLimiter::new(10.0, 1).unwrap();
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
