use std::sync::atomic::{AtomicBool, Ordering};

/// A token bucket that is a no-op until configured with a non-zero capacity.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    /// Resets the bucket to `value` tokens; 0 disables it.
    pub fn setup(&self, value: usize) {
        self.enabled.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem
            .add_permits(value.min(tokio::sync::Semaphore::MAX_PERMITS));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed
        self.sem.acquire().await.ok()
    }

    pub async fn consume(&self) {
        self.consume_many(1).await;
    }

    pub async fn consume_many(&self, value: u32) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire_many(value).await {
            permit.forget();
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_by_default() {
        let sem = Semaphore::new();
        assert!(sem.acquire().await.is_none());
        sem.consume_many(1000).await;
    }

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let sem = Semaphore::new();
        sem.setup(1);
        {
            let permit = sem.acquire().await;
            assert!(permit.is_some());
            assert_eq!(sem.sem.available_permits(), 0);
        }
        assert_eq!(sem.sem.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consumed_tokens_are_replenished() {
        static SEM: Semaphore = Semaphore::new();
        SEM.setup(2);
        SEM.consume_many(2).await;
        assert_eq!(SEM.sem.available_permits(), 0);
        tokio::spawn(SEM.run_replenish_thread(2, std::time::Duration::from_millis(100)));
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(SEM.sem.available_permits(), 2);
    }
}
