use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Request budget for one engine run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Limits {
    pub requests_per_min: Option<u64>,
    pub concurrency: Option<u32>,
}

/// Caps in-flight requests with a semaphore and paces them with a token bucket
/// refilled continuously at `requests_per_min / 60` tokens per second.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    limits: Limits,
    // (tokens, last refill)
    bucket: Mutex<(f64, Instant)>,
    sem: Option<Arc<Semaphore>>,
}

/// Held for the duration of one request.
pub struct Permit {
    _concurrency: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        let capacity = limits.requests_per_min.unwrap_or(0) as f64;
        let sem = limits
            .concurrency
            .filter(|c| *c > 0)
            .map(|c| Arc::new(Semaphore::new(c as usize)));
        Self {
            inner: Arc::new(Inner {
                limits,
                bucket: Mutex::new((capacity, Instant::now())),
                sem,
            }),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    /// Waits for a concurrency slot, then for a request token.
    pub async fn acquire(&self) -> Permit {
        let concurrency = match &self.inner.sem {
            // The semaphore is never closed, so acquisition only fails if that changes
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        };
        if let Some(rpm) = self.inner.limits.requests_per_min.filter(|rpm| *rpm > 0) {
            self.take_token(rpm as f64).await;
        }
        Permit {
            _concurrency: concurrency,
        }
    }

    async fn take_token(&self, capacity: f64) {
        let refill_per_sec = capacity / 60.0;
        loop {
            let mut guard = self.inner.bucket.lock().await;
            let (ref mut tokens, ref mut last) = *guard;
            let now = Instant::now();
            *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * refill_per_sec).min(capacity);
            *last = now;
            if *tokens >= 1.0 {
                *tokens -= 1.0;
                return;
            }
            let wait = (1.0 - *tokens) / refill_per_sec;
            drop(guard);
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.001))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let limiter = RateLimiter::new(Limits {
            requests_per_min: None,
            concurrency: Some(1),
        });
        let first = limiter.acquire().await;
        let second = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(second.is_err());
        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_burst_up_to_budget_is_immediate() {
        let limiter = RateLimiter::new(Limits {
            requests_per_min: Some(3),
            concurrency: None,
        });
        for _ in 0..3 {
            let permit = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
            assert!(permit.is_ok());
        }
        let fourth = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(fourth.is_err());
    }
}
