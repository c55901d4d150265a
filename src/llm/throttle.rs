//! 全局请求节流：两次模型请求开始之间至少间隔 `min_interval`
//!
//! 同一个 Throttle（Arc 共享）被所有调用方与所有研究任务共用；
//! 锁在等待期间一直持有，保证并发调用按顺序排队，不会在同一时刻同时放行。

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// 若距上次请求开始不足 min_interval 则挂起，随后把「上次请求时间」记为当前时刻
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::debug!(wait_ms = wait.as_millis() as u64, "throttling model request");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// 清空上次请求时间（测试之间复位）
    pub async fn reset(&self) {
        *self.last_request.lock().await = None;
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_acquire_does_not_wait() {
        let throttle = Throttle::new(Duration::from_millis(200));
        let start = Instant::now();
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_back_to_back_acquires_are_spaced() {
        let throttle = Throttle::new(Duration::from_millis(120));
        throttle.acquire().await;
        let first = Instant::now();
        throttle.acquire().await;
        assert!(first.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_reset_clears_last_request() {
        let throttle = Throttle::new(Duration::from_millis(300));
        throttle.acquire().await;
        throttle.reset().await;
        let start = Instant::now();
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_are_serialized() {
        let interval = Duration::from_millis(80);
        let throttle = Arc::new(Throttle::new(interval));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                tokio::spawn(async move {
                    throttle.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();
        for pair in starts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(70), "gap was {:?}", gap);
        }
    }
}
