use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Paces probe launches. The refill task ends once every clone is dropped.
#[derive(Clone)]
pub struct RateLimiter {
    sem: Arc<Semaphore>,
}

impl RateLimiter {
    /// `burst` caps how many unused permits can accumulate.
    pub fn new(per_sec: u32, burst: usize) -> Self {
        let sem = Arc::new(Semaphore::new(0));
        let weak: Weak<Semaphore> = Arc::downgrade(&sem);
        let interval_ms = u64::from(1000 / per_sec.max(1));
        let burst = burst.max(1);
        tokio::spawn(async move {
            let mut t = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                t.tick().await;
                let Some(sem) = weak.upgrade() else { break };
                if sem.available_permits() < burst {
                    sem.add_permits(1);
                }
            }
        });
        RateLimiter { sem }
    }

    pub async fn acquire(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn paces_acquisitions() {
        let rl = RateLimiter::new(10, 1);
        let start = Instant::now();
        for _ in 0..3 {
            rl.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
