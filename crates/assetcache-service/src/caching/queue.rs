use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;

/// Limits how many fetches run at the same time.
///
/// Fetches beyond the limit wait in FIFO order, as [`Semaphore`] is fair.
#[derive(Debug, Clone)]
pub struct FetchQueue {
    semaphore: Arc<Semaphore>,
    concurrency: Arc<AtomicUsize>,
}

impl FetchQueue {
    /// Creates a queue admitting `concurrency` fetches at once, at least one.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency: Arc::new(AtomicUsize::new(concurrency)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Changes the limit.
    ///
    /// Work that was already admitted keeps running. When shrinking, the surplus permits are
    /// retired as soon as they are released.
    pub fn set_concurrency(&self, concurrency: usize) {
        let concurrency = concurrency.max(1);
        let previous = self.concurrency.swap(concurrency, Ordering::Relaxed);
        metric!(gauge("fetch_queue.concurrency") = concurrency as u64);

        if concurrency > previous {
            self.semaphore.add_permits(concurrency - previous);
            return;
        }

        let Ok(surplus) = u32::try_from(previous - concurrency) else {
            return;
        };
        if surplus == 0 {
            return;
        }

        match self.semaphore.try_acquire_many(surplus) {
            Ok(permits) => permits.forget(),
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let semaphore = Arc::clone(&self.semaphore);
                    handle.spawn(async move {
                        if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                            permits.forget();
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        concurrency,
                        "Could not shrink fetch queue while work is running outside of a runtime"
                    );
                }
            },
        }
    }

    /// The number of fetches that could start right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs `future` once a slot is free.
    pub async fn run<F: Future>(&self, future: F) -> F::Output {
        // the semaphore is never closed, so acquiring can not fail
        let _permit = self.semaphore.acquire().await.ok();
        future.await
    }
}

impl Default for FetchQueue {
    fn default() -> Self {
        Self::new(10)
    }
}
