//! Bounds how many `Submit`ted pipelines may run at once, independent
//! of how many tasks are merely registered (queued-but-not-yet-started
//! work waits on the semaphore rather than spawning unbounded tokio
//! tasks).

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

pub struct RunnerPool {
    semaphore: Arc<Semaphore>,
}

impl RunnerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Spawns `fut` once a slot is free, returning immediately with the
    /// join handle of a task that first waits for the permit and then
    /// runs `fut` to completion, holding the permit for its whole
    /// lifetime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit: OwnedSemaphorePermit = semaphore
                .acquire_owned()
                .await
                .expect("runner pool semaphore is never closed");
            fut.await;
        })
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn limits_concurrent_work_to_the_configured_size() {
        let pool = RunnerPool::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(pool.spawn(async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available_permits(), 2);
    }
}
